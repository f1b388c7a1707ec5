use failure;
use nix;

use activator::OpenError;
use arena::ArenaError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Failed to open a perf_events file descriptor: {}", inner)]
    FdOpen { inner: OpenError },
    #[fail(display = "Failed to start collecting metrics: {}", inner)]
    Start { inner: String },
    #[fail(display = "Failed to enable a perf_events file descriptor: {}", inner)]
    Enable { inner: nix::Error },
    #[fail(display = "Failed to read from a perf_events file descriptor: {}", inner)]
    Read { inner: ::std::io::Error },
    #[fail(display = "Failed to mmap a perf_events file descriptor: {}", inner)]
    Mmap { inner: MmapError },
    #[fail(display = "Invalid capture configuration: {}", reason)]
    Configuration { reason: String },
    #[fail(display = "Failed to bind event group {:?} on cpu {}: {}", group, cpu, reason)]
    Binding {
        group: ::config::GroupId,
        cpu: i32,
        reason: String,
    },
    #[fail(display = "Ring buffer for cpu {} is in an inconsistent state: {}", cpu, reason)]
    RingInconsistent { cpu: i32, reason: String },
    #[fail(display = "Arena sink operation failed: {}", reason)]
    Arena { reason: String },
    #[fail(display = "CPU state monitor failed: {}", reason)]
    CpuMonitor { reason: String },
    #[fail(display = "Sync source failed: {}", reason)]
    Sync { reason: String },
    #[fail(display = "Orchestrator failed: {}", reason)]
    Orchestrator { reason: String },
    #[fail(display = "Encountered an unknown error: {}", inner)]
    Misc { inner: failure::Error },
}

impl From<failure::Error> for Error {
    fn from(inner: failure::Error) -> Self {
        Error::Misc { inner }
    }
}

impl From<OpenError> for Error {
    fn from(inner: OpenError) -> Self {
        Error::FdOpen { inner }
    }
}

impl From<::std::io::Error> for Error {
    fn from(inner: ::std::io::Error) -> Self {
        Error::Read { inner }
    }
}

impl From<MmapError> for Error {
    fn from(inner: MmapError) -> Self {
        Error::Mmap { inner }
    }
}

impl From<ArenaError> for Error {
    fn from(inner: ArenaError) -> Self {
        Error::Arena { reason: inner.to_string() }
    }
}

/// Errors returned by `libc::mmap`/`munmap` when mapping a perf ring buffer,
/// mirrored from the teacher's `sample::ring_buffer::BufferError`.
#[derive(Debug, Fail)]
pub enum MmapError {
    #[fail(display = "fd is not open for reading, or PROT_WRITE without O_RDWR")]
    Access,
    #[fail(display = "fd is not a valid file descriptor")]
    FdBad,
    #[fail(display = "addr, length or offset were invalid or misaligned")]
    InvalidArgs,
    #[fail(display = "the underlying filesystem does not support memory mapping")]
    NoMapSupport,
    #[fail(display = "no memory available, or mapping limit exceeded")]
    NoMemory,
    #[fail(display = "the file is locked or too much memory is locked")]
    TooMuchLocking,
    #[fail(display = "the system-wide open file limit has been reached")]
    TooManyOpenFiles,
    #[fail(display = "unexpected errno {}", errno)]
    Unknown { errno: i32 },
}

impl MmapError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            ::libc::EACCES => MmapError::Access,
            ::libc::EBADF => MmapError::FdBad,
            ::libc::EINVAL => MmapError::InvalidArgs,
            ::libc::ENODEV => MmapError::NoMapSupport,
            ::libc::ENOMEM => MmapError::NoMemory,
            ::libc::EAGAIN => MmapError::TooMuchLocking,
            ::libc::ENFILE => MmapError::TooManyOpenFiles,
            other => MmapError::Unknown { errno: other },
        }
    }
}
