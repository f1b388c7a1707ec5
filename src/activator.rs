//! Perf activator (spec.md §4.D): owns the raw `perf_event_open` file
//! descriptor lifecycle for a single counter. Grounded in the teacher's
//! `fd::PerfFile`, generalized to accept an explicit group-leader fd (the
//! teacher always passed `-1`, since it never grouped events) and extended
//! with the disable/reset/id ioctls the teacher never needed.

use std::fs::File;
use std::io;
use std::io::Error as IoError;
use std::io::Read;
use std::io::Result as IoResult;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::*;
use mio::{unix::EventedFd, Evented, Poll, PollOpt, Ready, Token};
use nix::errno::errno;
use nix::errno::Errno;

use error::*;
use raw::perf_event_attr;

const PERF_EVENT_IOC_MAGIC: u8 = b'$';

ioctl!(none perf_event_ioc_enable with PERF_EVENT_IOC_MAGIC, 0);
ioctl!(none perf_event_ioc_disable with PERF_EVENT_IOC_MAGIC, 1);
ioctl!(none perf_event_ioc_reset with PERF_EVENT_IOC_MAGIC, 3);
ioctl!(read perf_event_ioc_id with PERF_EVENT_IOC_MAGIC, 7; u64);

/// One open `perf_event_open` file descriptor, not yet (necessarily)
/// enabled. The group leader of a group is opened with `group_fd = -1`;
/// every other member of the group is opened with `group_fd` set to the
/// leader's raw fd (spec.md §4.E).
#[derive(Debug)]
pub struct PerfFile(pub(crate) File);

impl PerfFile {
    pub fn open(attr: &perf_event_attr, pid: i32, cpu: i32, group_fd: i32) -> Result<Self> {
        unsafe {
            let res = syscall(SYS_perf_event_open, attr, pid, cpu, group_fd, 0);

            if res == -1 {
                let e = Error::from(OpenError::from(Errno::last()));
                debug!("unable to open {:?} (pid={}, cpu={}, group_fd={}): {:?}", attr, pid, cpu, group_fd, e);
                Err(e)
            } else {
                let f = File::from_raw_fd(res as i32);
                Ok(PerfFile(f))
            }
        }
    }

    pub fn enable(&self) -> Result<()> {
        unsafe {
            perf_event_ioc_enable(self.0.as_raw_fd()).map(|_| ()).map_err(|e| {
                warn!("unable to enable a perf_event fd: {:?}", e);
                Error::Enable { inner: e }
            })
        }
    }

    pub fn disable(&self) -> Result<()> {
        unsafe {
            perf_event_ioc_disable(self.0.as_raw_fd()).map(|_| ()).map_err(|e| {
                warn!("unable to disable a perf_event fd: {:?}", e);
                Error::Enable { inner: e }
            })
        }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            perf_event_ioc_reset(self.0.as_raw_fd()).map(|_| ()).map_err(|e| {
                warn!("unable to reset a perf_event fd: {:?}", e);
                Error::Enable { inner: e }
            })
        }
    }

    /// The kernel-assigned unique id for this fd's event, used to correlate
    /// `PERF_RECORD_SAMPLE`'s `id`/`stream_id` fields back to a counter key
    /// (spec.md §4.E "event binding manager").
    pub fn id(&self) -> Result<u64> {
        let mut id: u64 = 0;
        unsafe {
            perf_event_ioc_id(self.0.as_raw_fd(), &mut id).map_err(|e| {
                warn!("unable to read the id of a perf_event fd: {:?}", e);
                Error::Enable { inner: e }
            })?;
        }
        Ok(id)
    }
}

impl Evented for PerfFile {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> IoResult<()> {
        info!("registering {:?}", self.0);

        #[repr(C)]
        struct FOwnerEx(c_int, pid_t);

        let owner = FOwnerEx(F_OWNER_TID, unsafe { syscall(SYS_gettid) as pid_t });
        let fd = self.0.as_raw_fd();

        if 0 != unsafe { fcntl(fd, F_SETOWN_EX, &owner) } {
            return Err(IoError::from_raw_os_error(errno()));
        }

        if 0 != unsafe { fcntl(fd, F_SETSIG, SIGIO) } {
            return Err(IoError::from_raw_os_error(errno()));
        }

        if 0 != unsafe { fcntl(fd, F_SETFL, O_ASYNC | O_NONBLOCK | O_RDONLY) } {
            return Err(IoError::from_raw_os_error(errno()));
        }

        EventedFd(&fd).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> IoResult<()> {
        info!("reregistering {:?}", self.0);
        EventedFd(&self.0.as_raw_fd()).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> IoResult<()> {
        info!("deregistering {:?}", self.0);
        EventedFd(&self.0.as_raw_fd()).deregister(poll)
    }
}

#[derive(Debug, Fail)]
pub enum OpenError {
    #[fail(display = "perf_event_attr size is invalid for this kernel")]
    AttrWrongSize,
    #[fail(display = "requested event requires CAP_SYS_ADMIN or a more permissive perf_event_paranoid setting")]
    CapSysAdminRequired,
    #[fail(display = "group_fd does not refer to a valid file descriptor, or pid is an invalid cgroup fd")]
    InvalidFdOrPid,
    #[fail(display = "another event already has exclusive access to the PMU")]
    PmuBusy,
    #[fail(display = "the attr pointer points at an invalid memory address")]
    AttrInvalidPointer,
    #[fail(display = "the requested event configuration is invalid")]
    InvalidEvent,
    #[fail(display = "the per-process open file descriptor limit has been reached")]
    TooManyOpenFiles,
    #[fail(display = "the requested feature is not supported by the current CPU")]
    CpuFeatureUnsupported,
    #[fail(display = "the event type field is not valid")]
    InvalidEventType,
    #[fail(display = "too many hardware breakpoints requested")]
    TooManyBreakpoints,
    #[fail(display = "PERF_SAMPLE_STACK_USER is not supported by this hardware")]
    UserStackSampleUnsupported,
    #[fail(display = "a hardware feature required by this event is unavailable")]
    HardwareFeatureUnsupported,
    #[fail(display = "sample_max_stack exceeds /proc/sys/kernel/perf_event_max_stack")]
    SampleMaxStackTooLarge,
    #[fail(display = "an exclude_* setting is unsupported on this architecture, or CAP_SYS_ADMIN is required")]
    CapSysAdminRequiredOrExcludeUnsupported,
    #[fail(display = "attempted to attach to a process that does not exist")]
    ProcessDoesNotExist,
    #[fail(display = "the kernel returned an unexpected error code: {}", errno)]
    Unknown { errno: Errno },
}

impl From<Errno> for OpenError {
    fn from(errno: Errno) -> OpenError {
        match errno {
            Errno::E2BIG => OpenError::AttrWrongSize,
            Errno::EACCES => OpenError::CapSysAdminRequired,
            Errno::EBADF => OpenError::InvalidFdOrPid,
            Errno::EBUSY => OpenError::PmuBusy,
            Errno::EFAULT => OpenError::AttrInvalidPointer,
            Errno::EINVAL => OpenError::InvalidEvent,
            Errno::EMFILE => OpenError::TooManyOpenFiles,
            Errno::ENODEV => OpenError::CpuFeatureUnsupported,
            Errno::ENOENT => OpenError::InvalidEventType,
            Errno::ENOSPC => OpenError::TooManyBreakpoints,
            Errno::ENOSYS => OpenError::UserStackSampleUnsupported,
            Errno::EOPNOTSUPP => OpenError::HardwareFeatureUnsupported,
            Errno::EOVERFLOW => OpenError::SampleMaxStackTooLarge,
            Errno::EPERM => OpenError::CapSysAdminRequiredOrExcludeUnsupported,
            Errno::ESRCH => OpenError::ProcessDoesNotExist,
            _ => OpenError::Unknown { errno },
        }
    }
}

impl Read for PerfFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl AsRawFd for PerfFile {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Deref for PerfFile {
    type Target = File;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PerfFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/fcntl.h
const F_OWNER_TID: c_int = 0;
const F_SETOWN_EX: c_int = 15;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_error_maps_common_errnos() {
        assert!(matches!(OpenError::from(Errno::EACCES), OpenError::CapSysAdminRequired));
        assert!(matches!(OpenError::from(Errno::EMFILE), OpenError::TooManyOpenFiles));
        assert!(matches!(OpenError::from(Errno::ESRCH), OpenError::ProcessDoesNotExist));
    }
}
