//! External outbound interfaces (spec.md §6): the `Sink` trait is the
//! abstract seam the orchestrator writes committed frames through; the
//! transport that carries them to the host is out of scope per spec.md
//! §1. `FileSink` is the one concrete implementation this crate carries
//! itself — persisted-state capture-to-disk (spec.md §6 "Persisted
//! state") — grounded in how the teacher treats `activator::PerfFile` as
//! a thin `std::fs::File` newtype rather than wrapping it further.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use error::Result;

/// Receives consumed frame bytes in commit order. Implementations must
/// not block the caller indefinitely; a transport-backed `Sink` should
/// apply its own backpressure/timeout policy internally.
pub trait Sink: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes the raw APC frame stream verbatim to `0000000000` inside a
/// capture directory (spec.md §6).
pub struct FileSink {
    file: File,
}

impl FileSink {
    pub const FILE_NAME: &'static str = "0000000000";

    pub fn create(capture_dir: &Path) -> Result<Self> {
        fs::create_dir_all(capture_dir)?;
        let file = File::create(capture_dir.join(Self::FILE_NAME))?;
        Ok(FileSink { file })
    }
}

impl Sink for FileSink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_frames_to_the_fixed_file_name() {
        let dir = ::std::env::temp_dir().join(format!("sink-test-{}", ::std::process::id()));
        let mut sink = FileSink::create(&dir).unwrap();
        sink.write_frame(&[1, 2, 3]).unwrap();
        sink.write_frame(&[4, 5]).unwrap();
        sink.flush().unwrap();

        let contents = fs::read(dir.join(FileSink::FILE_NAME)).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 5]);
        let _ = fs::remove_dir_all(&dir);
    }
}
