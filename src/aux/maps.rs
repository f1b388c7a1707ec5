//! Process-map reader (spec.md §4.J): for an observed PID, reads
//! `/proc/<pid>/maps` and hands the text to the APC encoder for a
//! `MAPS` frame per PID/TID.

use std::fs;

use error::Result;

pub struct ProcessMapReader;

impl ProcessMapReader {
    /// Reads `/proc/<pid>/maps` verbatim. Returns `Ok(None)` rather than
    /// an error if the process has already exited (`ENOENT`), since a
    /// PID disappearing between discovery and read is routine, not
    /// exceptional.
    pub fn read(pid: i32) -> Result<Option<String>> {
        let path = format!("/proc/{}/maps", pid);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ::std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_maps_file() {
        let pid = ::std::process::id() as i32;
        let maps = ProcessMapReader::read(pid).unwrap();
        assert!(maps.is_some());
        assert!(!maps.unwrap().is_empty());
    }

    #[test]
    fn missing_process_yields_none_not_error() {
        let result = ProcessMapReader::read(i32::max_value() - 1).unwrap();
        assert!(result.is_none());
    }
}
