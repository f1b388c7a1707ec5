//! CPU state monitor (spec.md §4.G): observes CPU online/offline
//! transitions via kernel uevents (preferred) or `/sys` polling (fallback).
//! Grounded in the original collector's `agents/common/nl_cpu_monitor.h`
//! netlink-uevent approach, reimplemented with `nix`'s socket bindings
//! (already part of the teacher's dependency stack) instead of a
//! hand-rolled syscall wrapper.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use nix::sys::socket::{
    bind, socket, AddressFamily, NetlinkAddr, SockAddr, SockFlag, SockProtocol, SockType,
};
use nix::unistd::read;

use error::{Error, Result};

/// One observed transition. `cpu == -1` is the sentinel emitted after
/// `stop()` so consumer loops terminate cleanly (spec.md §4.G).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CpuEvent {
    pub cpu: i32,
    pub online: bool,
}

impl CpuEvent {
    pub const STOP: CpuEvent = CpuEvent { cpu: -1, online: false };

    pub fn is_stop(&self) -> bool {
        self.cpu == -1
    }
}

/// Either of the two interchangeable monitor implementations (spec.md
/// §4.G), exposed through one shared contract.
pub enum CpuStateMonitor {
    Netlink(NetlinkMonitor),
    Polling(PollingMonitor),
}

impl CpuStateMonitor {
    /// Opens the netlink kobject-uevent socket; falls back to polling if
    /// that fails (e.g. `EACCES` in a sandboxed environment, spec.md §8
    /// scenario S6).
    pub fn open(online_cpus_path: &Path) -> Self {
        match NetlinkMonitor::open() {
            Ok(m) => CpuStateMonitor::Netlink(m),
            Err(e) => {
                warn!("netlink cpu monitor unavailable ({}), falling back to polling", e);
                CpuStateMonitor::Polling(PollingMonitor::new(online_cpus_path))
            }
        }
    }

    pub fn recv_one(&mut self) -> Result<CpuEvent> {
        match self {
            CpuStateMonitor::Netlink(m) => m.recv_one(),
            CpuStateMonitor::Polling(m) => m.recv_one(),
        }
    }

    pub fn stop(&self) {
        match self {
            CpuStateMonitor::Netlink(m) => m.stop(),
            CpuStateMonitor::Polling(m) => m.stop(),
        }
    }

    /// A cloneable stop switch, so a monitor moved into a worker thread
    /// can still be told to stop by whoever holds the handle.
    pub fn handle(&self) -> CpuMonitorHandle {
        let flag = match self {
            CpuStateMonitor::Netlink(m) => m.stopped.clone(),
            CpuStateMonitor::Polling(m) => m.stopped.clone(),
        };
        CpuMonitorHandle(flag)
    }
}

#[derive(Clone)]
pub struct CpuMonitorHandle(::std::sync::Arc<::std::sync::atomic::AtomicBool>);

impl CpuMonitorHandle {
    pub fn stop(&self) {
        self.0.store(true, ::std::sync::atomic::Ordering::Release);
    }
}

/// Parses one `NETLINK_KOBJECT_UEVENT` datagram: a sequence of
/// null-terminated `KEY=VALUE` strings.
fn parse_uevent(datagram: &[u8]) -> Option<CpuEvent> {
    let mut action = None;
    let mut subsystem = None;
    let mut devpath = None;

    for field in datagram.split(|&b| b == 0) {
        if field.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(field);
        if let Some(v) = text.strip_prefix("ACTION=") {
            action = Some(v.to_owned());
        } else if let Some(v) = text.strip_prefix("SUBSYSTEM=") {
            subsystem = Some(v.to_owned());
        } else if let Some(v) = text.strip_prefix("DEVPATH=") {
            devpath = Some(v.to_owned());
        }
    }

    if subsystem.as_deref() != Some("cpu") {
        return None;
    }

    let online = match action.as_deref() {
        Some("online") => true,
        Some("offline") => false,
        _ => return None,
    };

    let devpath = devpath?;
    let marker = "/devices/system/cpu/cpu";
    let idx = devpath.find(marker)?;
    let rest = &devpath[idx + marker.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let cpu: i32 = digits.parse().ok()?;

    Some(CpuEvent { cpu, online })
}

pub struct NetlinkMonitor {
    fd: ::std::os::unix::io::RawFd,
    stopped: ::std::sync::Arc<::std::sync::atomic::AtomicBool>,
}

impl NetlinkMonitor {
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| Error::CpuMonitor { reason: format!("socket() failed: {}", e) })?;

        let addr = SockAddr::Netlink(NetlinkAddr::new(0, 1)); // group 1 == kernel uevent multicast group
        bind(fd, &addr).map_err(|e| Error::CpuMonitor { reason: format!("bind() failed: {}", e) })?;

        Ok(NetlinkMonitor { fd, stopped: ::std::sync::Arc::new(::std::sync::atomic::AtomicBool::new(false)) })
    }

    pub fn recv_one(&mut self) -> Result<CpuEvent> {
        let mut buf = [0u8; 4096];
        loop {
            if self.stopped.load(::std::sync::atomic::Ordering::Acquire) {
                return Ok(CpuEvent::STOP);
            }
            let n = read(self.fd, &mut buf).map_err(|e| Error::CpuMonitor { reason: format!("recv failed: {}", e) })?;
            if let Some(event) = parse_uevent(&buf[..n]) {
                return Ok(event);
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, ::std::sync::atomic::Ordering::Release);
    }
}

impl Drop for NetlinkMonitor {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

/// Fallback used when the netlink socket cannot be opened: walks
/// `/sys/devices/system/cpu/cpu*/online` roughly once a millisecond and
/// diffs against the previous observation.
pub struct PollingMonitor {
    base: ::std::path::PathBuf,
    known_online: HashSet<i32>,
    pending: ::std::collections::VecDeque<CpuEvent>,
    stopped: ::std::sync::Arc<::std::sync::atomic::AtomicBool>,
}

impl PollingMonitor {
    pub fn new(base: &Path) -> Self {
        PollingMonitor {
            base: base.to_owned(),
            known_online: HashSet::new(),
            pending: ::std::collections::VecDeque::new(),
            stopped: ::std::sync::Arc::new(::std::sync::atomic::AtomicBool::new(false)),
        }
    }

    fn scan(&mut self) -> Result<()> {
        let mut current = HashSet::new();
        let entries = fs::read_dir(&self.base)
            .map_err(|e| Error::CpuMonitor { reason: format!("reading {}: {}", self.base.display(), e) })?;

        for entry in entries {
            let entry = entry.map_err(|e| Error::CpuMonitor { reason: e.to_string() })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("cpu") {
                continue;
            }
            let digits: String = name.trim_start_matches("cpu").chars().take_while(|c| c.is_ascii_digit()).collect();
            let cpu: i32 = match digits.parse() {
                Ok(n) => n,
                Err(_) => continue,
            };

            let online_path = entry.path().join("online");
            let is_online = match fs::read_to_string(&online_path) {
                Ok(contents) => contents.trim() == "1",
                // cpu0 often has no "online" file and is always online.
                Err(_) => cpu == 0,
            };
            if is_online {
                current.insert(cpu);
            }
        }

        for &cpu in current.difference(&self.known_online) {
            self.pending.push_back(CpuEvent { cpu, online: true });
        }
        for &cpu in self.known_online.difference(&current) {
            self.pending.push_back(CpuEvent { cpu, online: false });
        }
        self.known_online = current;
        Ok(())
    }

    pub fn recv_one(&mut self) -> Result<CpuEvent> {
        loop {
            if self.stopped.load(::std::sync::atomic::Ordering::Acquire) {
                return Ok(CpuEvent::STOP);
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            self.scan()?;
            if self.pending.is_empty() {
                ::std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, ::std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_online_uevent() {
        let datagram = b"ACTION=online\0SUBSYSTEM=cpu\0DEVPATH=/devices/system/cpu/cpu3\0";
        let event = parse_uevent(datagram).unwrap();
        assert_eq!(event, CpuEvent { cpu: 3, online: true });
    }

    #[test]
    fn parses_offline_uevent() {
        let datagram = b"ACTION=offline\0SUBSYSTEM=cpu\0DEVPATH=/devices/system/cpu/cpu1\0";
        let event = parse_uevent(datagram).unwrap();
        assert_eq!(event, CpuEvent { cpu: 1, online: false });
    }

    #[test]
    fn ignores_non_cpu_subsystem() {
        let datagram = b"ACTION=online\0SUBSYSTEM=block\0DEVPATH=/devices/whatever\0";
        assert!(parse_uevent(datagram).is_none());
    }

    #[test]
    fn stop_sentinel_is_recognised() {
        assert!(CpuEvent::STOP.is_stop());
        assert!(!CpuEvent { cpu: 0, online: true }.is_stop());
    }

    #[test]
    fn polling_monitor_diffs_synthetic_sysfs_tree() {
        let dir = ::std::env::temp_dir().join(format!("cpumon-test-{}", ::std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("cpu0")).unwrap();
        fs::create_dir_all(dir.join("cpu1")).unwrap();
        fs::write(dir.join("cpu1/online"), "0\n").unwrap();

        let mut monitor = PollingMonitor::new(&dir);
        monitor.scan().unwrap();
        assert!(monitor.pending.contains(&CpuEvent { cpu: 0, online: true }));
        assert!(!monitor.pending.iter().any(|e| e.cpu == 1 && e.online));

        fs::write(dir.join("cpu1/online"), "1\n").unwrap();
        monitor.pending.clear();
        monitor.scan().unwrap();
        assert!(monitor.pending.contains(&CpuEvent { cpu: 1, online: true }));

        let _ = fs::remove_dir_all(&dir);
    }
}
