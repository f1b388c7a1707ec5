//! Capture orchestrator (spec.md §4.H): drives the capture lifecycle —
//! prepare, receive start signal, gate exec, run, shutdown. The
//! process-watcher ("find PIDs matching the wait-for-command
//! pattern") is grounded in
//! `original_source/daemon/non_root/ProcessPoller.{h,cpp}`: it polls
//! `/proc/*/comm` and `/proc/*/cmdline` rather than using inotify,
//! matching the original's design, and stays an internal prepare-time
//! helper rather than a public collaborator (spec.md §1).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use apc;
use arena::ArenaSink;
use aux::{check_perf_event_paranoid, CpuFreqProperties, CpuFreqReader, KallsymsSnapshotter, ProcessMapReader};
use binding::{BindingManager, GroupBinding};
use config::{CaptureConfig, RESERVED_KEY_FLOOR};
use cpumon::{CpuMonitorHandle, CpuStateMonitor};
use error::{Error, Result};
use frame::FrameBuilder;
use raw::perf_event_attr;
use ring::RingMonitor;
use sink::Sink;
use sync_source::{ClockSource, SyncSource};

/// Tracks, per expected-online CPU, whether its groups have been opened
/// (successfully or not). `exec` only proceeds once every expected CPU
/// has reached a terminal state (spec.md §8 property 7).
struct ExecGate {
    expected: Mutex<HashMap<i32, bool>>,
    all_resolved: Condvar,
}

impl ExecGate {
    fn new(expected_cpus: &[i32]) -> Self {
        let map = expected_cpus.iter().map(|&cpu| (cpu, false)).collect();
        ExecGate { expected: Mutex::new(map), all_resolved: Condvar::new() }
    }

    fn mark_resolved(&self, cpu: i32) {
        let mut expected = self.expected.lock().unwrap();
        if let Some(resolved) = expected.get_mut(&cpu) {
            *resolved = true;
        }
        if expected.values().all(|&r| r) {
            self.all_resolved.notify_all();
        }
    }

    /// Blocks until every expected CPU is resolved, or `timeout` elapses
    /// (a CPU that never reports anything must not wedge the capture
    /// forever; the orchestrator treats a timeout the same as a resolved
    /// failure for that CPU).
    fn wait_until_all_resolved(&self, timeout: Duration) {
        let expected = self.expected.lock().unwrap();
        let _ = self
            .all_resolved
            .wait_timeout_while(expected, timeout, |map| !map.values().all(|&r| r))
            .unwrap();
    }
}

/// One snapshot of why a CPU or group failed to come fully online, for
/// the final degraded-coverage report (spec.md §7 "User-visible
/// behaviour").
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub degraded_cpus: Vec<(i32, String)>,
    pub frames_emitted: bool,
}

pub enum OrchestratorState {
    Prepared,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct CaptureOrchestrator<S: Sink> {
    config: CaptureConfig,
    binding: Arc<BindingManager>,
    arena: ArenaSink,
    sink: S,
    cpu_monitor_handle: Option<CpuMonitorHandle>,
    sync_source: Option<SyncSource>,
    exec_gate: Arc<ExecGate>,
    state: OrchestratorState,
    frames_emitted: Arc<AtomicBool>,
    /// Set by the arena's one-shot "buffer full" handler (spec.md §4.C,
    /// §7); observable by an external driver that wants to know shutdown
    /// was triggered internally rather than on client command.
    shutdown_initiated: Arc<AtomicBool>,
    /// Tells the ring-drain and cpu-frequency background threads to
    /// stop their polling loops; set by `shutdown`.
    background_stop: Arc<AtomicBool>,
}

impl<S: Sink + 'static> CaptureOrchestrator<S> {
    pub fn new(config: CaptureConfig, sink: S) -> Self {
        let arena = ArenaSink::new(config.total_buffer_size_mib as usize * 1024 * 1024);
        let binding = Arc::new(BindingManager::new(config.clone()));
        let expected_cpus = online_cpu_ids();
        CaptureOrchestrator {
            config,
            binding,
            arena,
            sink,
            cpu_monitor_handle: None,
            sync_source: None,
            exec_gate: Arc::new(ExecGate::new(&expected_cpus)),
            state: OrchestratorState::Prepared,
            frames_emitted: Arc::new(AtomicBool::new(false)),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            background_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether shutdown has been triggered, internally (one-shot buffer
    /// full) or externally (a prior call to `shutdown`). An owning
    /// driver that spawned `drain_to_sink` on its own thread polls this
    /// to know when to also call `shutdown` and collect the report.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Step 1: prepare (spec.md §4.H.1). Validates the kernel can
    /// actually support this capture and that group sizes fit PMU
    /// budgets; does not open any file descriptors.
    pub fn prepare(&self, counters_per_pmu: &HashMap<u32, u32>) -> Result<()> {
        check_perf_event_paranoid(&self.config)?;
        self.binding.prepare(counters_per_pmu)?;
        if let Some(ref pattern) = self.config.wait_for_command {
            // process-watcher: resolved lazily by the caller polling
            // `find_pids_matching`, kept as a helper rather than a
            // spawned background task, matching spec.md §4.H's note that
            // this stays an internal prepare-time collaborator.
            debug!("wait-for-command pattern configured: {}", pattern);
        }
        Ok(())
    }

    /// Step 2: receive start signal (spec.md §4.H.2). Emits the summary
    /// frame and one `PEA` frame per configured attribute, enables
    /// one-shot tracking, starts the sync source if the kernel lacks
    /// clockid support or an AUX source is in use, spawns the async
    /// subtasks for per-PID attachment / process-map / kallsyms
    /// snapshotting and the cpu-frequency sampler, and brings every
    /// expected CPU online (which, through `binding::online_cpu`, also
    /// emits the `KEYS` table for whatever it opens).
    pub fn start<C: ClockSource>(
        &mut self,
        monotonic_start: i64,
        attributes: &[apc::SummaryAttribute],
        sync_clock: Option<C>,
    ) -> Result<()> {
        self.emit_summary(monotonic_start, attributes)?;
        self.emit_attr_frames()?;

        let binding_for_shutdown = self.binding.clone();
        let arena_for_shutdown = self.arena.clone();
        let shutdown_initiated = self.shutdown_initiated.clone();
        self.arena.enable_one_shot(move || {
            warn!("arena sink reached capacity; initiating graceful shutdown");
            shutdown_initiated.store(true, Ordering::Release);
            let _ = binding_for_shutdown.disable_all();
            arena_for_shutdown.destroy();
        });

        if !self.config.kernel_caps.has_attr_clockid || self.config.per_core_aux_pmu_has_entries() {
            if let Some(clock) = sync_clock {
                self.sync_source = Some(SyncSource::start(clock, self.arena.clone(), Duration::from_secs(1)));
            }
        }

        let online_path = Path::new("/sys/devices/system/cpu");
        let mut monitor = CpuStateMonitor::open(online_path);
        self.cpu_monitor_handle = Some(monitor.handle());

        let binding = self.binding.clone();
        let exec_gate = self.exec_gate.clone();
        let arena = self.arena.clone();

        ::std::thread::Builder::new()
            .name("gatord-cpu-events".to_owned())
            .spawn(move || loop {
                match monitor.recv_one() {
                    Ok(event) => {
                        if event.is_stop() {
                            break;
                        }
                        let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
                        let result = if event.online {
                            binding.online_cpu(event.cpu, 0, &mut builder)
                        } else {
                            binding.offline_cpu(event.cpu, 0, &mut builder)
                        };
                        if let Err(e) = result {
                            warn!("cpu event handling failed for cpu {}: {}", event.cpu, e);
                        } else {
                            commit_frame(&arena, builder);
                        }
                        if event.online {
                            exec_gate.mark_resolved(event.cpu);
                        }
                    }
                    Err(e) => {
                        warn!("cpu state monitor failed: {}", e);
                        break;
                    }
                }
            })
            .expect("failed to spawn cpu-event thread");

        self.spawn_ring_drain_thread();
        self.spawn_cpufreq_thread();
        self.spawn_aux_snapshot_thread();

        self.state = OrchestratorState::Running;
        Ok(())
    }

    fn emit_summary(&mut self, monotonic_start: i64, attributes: &[apc::SummaryAttribute]) -> Result<()> {
        let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
        apc::encode_summary(&mut builder, "\n", monotonic_start, monotonic_start, monotonic_start, monotonic_start, attributes)
            .map_err(|e| Error::Orchestrator { reason: format!("failed to encode SUMMARY frame: {:?}", e) })?;
        let bytes = builder.into_bytes();
        if !bytes.is_empty() {
            let mut r = self.arena.request_space(bytes.len())?;
            r.as_mut_slice().copy_from_slice(&bytes);
            r.commit(bytes.len());
            self.frames_emitted.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Emits one `PEA` frame per configured event attribute (spec.md
    /// §4.H.2, §8 S1), so the host can recognise every attribute before
    /// any `KEYS`/`PERF_DATA` frame referencing it arrives.
    fn emit_attr_frames(&mut self) -> Result<()> {
        for event in &self.config.events {
            let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
            apc::encode_pea(&mut builder, attr_bytes(&event.attr), event.key)
                .map_err(|e| Error::Orchestrator { reason: format!("failed to encode PEA frame: {:?}", e) })?;
            let bytes = builder.into_bytes();
            if !bytes.is_empty() {
                let mut r = self.arena.request_space(bytes.len())?;
                r.as_mut_slice().copy_from_slice(&bytes);
                r.commit(bytes.len());
            }
        }
        Ok(())
    }

    /// Spawns the per-leader-fd ring drain loop (spec.md §4.F): the
    /// kernel → ring → `PERF_DATA`/`PERF_AUX` path that `BindingManager`
    /// alone cannot run, since it owns bindings but not their ongoing
    /// drain state. Tracks one [`RingMonitor`] per currently-open leader
    /// fd, evicting monitors for fds that `with_bindings`/
    /// `with_pid_bindings` no longer report (the CPU went offline, or a
    /// PID was detached) so a later re-open of the same `{group, cpu}`
    /// starts its tail cursors fresh rather than inheriting a stale one.
    fn spawn_ring_drain_thread(&self) {
        let binding = self.binding.clone();
        let arena = self.arena.clone();
        let stop = self.background_stop.clone();

        ::std::thread::Builder::new()
            .name("gatord-ring-drain".to_owned())
            .spawn(move || {
                let mut monitors: HashMap<i32, RingMonitor> = HashMap::new();
                while !stop.load(Ordering::Acquire) {
                    let mut seen = HashSet::new();
                    binding.with_bindings(|_key, group_binding| {
                        drain_one_binding(group_binding, &mut monitors, &mut seen, &arena);
                    });
                    binding.with_pid_bindings(|_pid, group_binding| {
                        drain_one_binding(group_binding, &mut monitors, &mut seen, &arena);
                    });
                    monitors.retain(|fd, _| seen.contains(fd));
                    ::std::thread::sleep(Duration::from_millis(10));
                }
            })
            .expect("failed to spawn ring-drain thread");
    }

    /// Spawns the periodic cpu-frequency sampler (spec.md §4.J), emitting
    /// one `COUNTERS` frame per second. No topology table is in scope
    /// (spec.md §1), so every online CPU is treated as its own cluster.
    fn spawn_cpufreq_thread(&self) {
        let arena = self.arena.clone();
        let stop = self.background_stop.clone();
        let cpu_ids = online_cpu_ids();

        ::std::thread::Builder::new()
            .name("gatord-cpufreq".to_owned())
            .spawn(move || {
                let cluster_of_cpu: HashMap<i32, u32> = cpu_ids.iter().map(|&c| (c, c as u32)).collect();
                let properties_by_cluster: HashMap<u32, CpuFreqProperties> = cpu_ids
                    .iter()
                    .map(|&c| (c as u32, CpuFreqProperties { key: RESERVED_KEY_FLOOR as i32, use_cpuinfo: false }))
                    .collect();
                let reader = CpuFreqReader::new(cluster_of_cpu, properties_by_cluster);

                while !stop.load(Ordering::Acquire) {
                    ::std::thread::sleep(Duration::from_secs(1));
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let samples: Vec<(i32, i32, i64)> =
                        cpu_ids.iter().filter_map(|&c| reader.read(c)).map(|s| (s.core, s.key, s.value)).collect();
                    if samples.is_empty() {
                        continue;
                    }
                    let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
                    if let Err(e) = apc::encode_counters(&mut builder, 0, &samples) {
                        warn!("failed to encode COUNTERS frame: {:?}", e);
                        continue;
                    }
                    commit_frame(&arena, builder);
                }
            })
            .expect("failed to spawn cpufreq thread");
    }

    /// Spawns the one-shot async subtasks for kallsyms snapshotting and
    /// per-PID attachment / process-map / comm snapshotting (spec.md
    /// §4.H.2). Unlike the ring-drain and cpu-frequency threads this
    /// does its work once and exits; a failure attaching or reading one
    /// PID does not stop the others.
    fn spawn_aux_snapshot_thread(&self) {
        let arena = self.arena.clone();
        let binding = self.binding.clone();
        let attach_pids = self.config.attach_pids.clone();

        ::std::thread::Builder::new()
            .name("gatord-aux-snapshot".to_owned())
            .spawn(move || {
                match KallsymsSnapshotter::snapshot() {
                    Ok(text) => {
                        let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
                        match apc::encode_kallsyms(&mut builder, &text) {
                            Ok(()) => commit_frame(&arena, builder),
                            Err(e) => warn!("failed to encode KALLSYMS frame: {:?}", e),
                        }
                    }
                    Err(e) => warn!("failed to snapshot /proc/kallsyms: {}", e),
                }

                for pid in attach_pids {
                    if let Err(e) = binding.attach_pid(pid) {
                        warn!("failed to attach pid {}: {}", pid, e);
                        continue;
                    }

                    match ProcessMapReader::read(pid) {
                        Ok(Some(text)) => {
                            let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
                            match apc::encode_maps(&mut builder, pid, pid, &text) {
                                Ok(()) => commit_frame(&arena, builder),
                                Err(e) => warn!("failed to encode MAPS frame for pid {}: {:?}", pid, e),
                            }
                        }
                        Ok(None) => debug!("pid {} exited before its maps could be read", pid),
                        Err(e) => warn!("failed to read maps for pid {}: {}", pid, e),
                    }

                    if let Some((image_path, comm)) = read_comm(pid) {
                        let mut builder = FrameBuilder::new(apc::MAX_RESPONSE_LENGTH);
                        match apc::encode_comm(&mut builder, pid, pid, &image_path, &comm) {
                            Ok(()) => commit_frame(&arena, builder),
                            Err(e) => warn!("failed to encode COMM frame for pid {}: {:?}", pid, e),
                        }
                    }
                }
            })
            .expect("failed to spawn aux-snapshot thread");
    }

    /// Step 3: gate exec (spec.md §4.H.3). Blocks until every
    /// expected-online CPU has resolved, then the caller may exec the
    /// target. Bounded by `timeout` so a kernel that never reports a CPU
    /// cannot wedge the capture forever.
    pub fn wait_for_exec_gate(&self, timeout: Duration) {
        self.exec_gate.wait_until_all_resolved(timeout);
    }

    /// Step 4: run. Drains committed frames to the sink until told to
    /// stop; the caller typically runs this on its own thread since it
    /// blocks on `arena.pull_committed()`.
    pub fn drain_to_sink(&mut self) -> Result<()> {
        loop {
            match self.arena.pull_committed() {
                Ok(mut handle) => {
                    self.sink.write_frame(handle.as_slice())?;
                    handle.consume();
                }
                Err(_) => break, // arena destroyed: shutdown in progress
            }
        }
        self.sink.flush()
    }

    /// Step 5: shutdown (spec.md §4.H.5). Disables counters, stops the
    /// CPU monitor, sync source and background threads, lets the drain
    /// loop finish what is already committed, then tears down the
    /// arena. Idempotent: safe to call after the one-shot handler
    /// already performed its own disable+destroy.
    pub fn shutdown(&mut self) -> Result<CaptureReport> {
        self.state = OrchestratorState::ShuttingDown;
        self.shutdown_initiated.store(true, Ordering::Release);
        self.background_stop.store(true, Ordering::Release);
        let _ = self.binding.disable_all();
        if let Some(handle) = self.cpu_monitor_handle.take() {
            handle.stop();
        }
        if let Some(mut sync) = self.sync_source.take() {
            sync.stop();
        }
        self.arena.destroy();
        self.state = OrchestratorState::Stopped;

        Ok(CaptureReport {
            degraded_cpus: self.binding.degraded_cpus().into_iter().map(|d| (d.cpu, d.reason)).collect(),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
        })
    }
}

/// Returns `attr`'s raw bytes for a `PEA` frame (spec.md §4.B): the
/// kernel ABI struct has no padding the encoder needs to skip, so a
/// straight byte-for-byte view is exactly what the host's decoder
/// expects.
fn attr_bytes(attr: &perf_event_attr) -> &[u8] {
    unsafe { ::std::slice::from_raw_parts(attr as *const perf_event_attr as *const u8, ::std::mem::size_of::<perf_event_attr>()) }
}

/// Commits an encoded frame's bytes to the arena, swallowing the error
/// silently if the arena has already been destroyed (shutdown racing
/// with a background thread still mid-flight is routine, not a bug).
fn commit_frame(arena: &ArenaSink, builder: FrameBuilder) {
    let bytes = builder.into_bytes();
    if bytes.is_empty() {
        return;
    }
    if let Ok(mut r) = arena.request_space(bytes.len()) {
        r.as_mut_slice().copy_from_slice(&bytes);
        r.commit(bytes.len());
    }
}

/// Drains one leader fd's data and (if present) AUX ring, tracking
/// drain state per raw fd in `monitors` and recording the fd in `seen`
/// so the caller can evict monitors for fds no longer bound.
fn drain_one_binding(
    binding: &GroupBinding,
    monitors: &mut HashMap<i32, RingMonitor>,
    seen: &mut HashSet<i32>,
    arena: &ArenaSink,
) {
    let fd = binding.leader.as_raw_fd();
    seen.insert(fd);
    let monitor = monitors.entry(fd).or_insert_with(|| RingMonitor::new(binding.cpu));

    if let Err(e) = monitor.poll_data(&binding.ring, arena) {
        warn!("ring data poll failed on cpu {}: {}", binding.cpu, e);
    }
    if let Some(ref aux) = binding.aux {
        if let Err(e) = monitor.poll_aux(&binding.ring, aux, arena) {
            warn!("ring aux poll failed on cpu {}: {}", binding.cpu, e);
        }
    }
}

/// Reads a PID's command name and executable path for a `COMM` frame
/// (spec.md §4.J), returning `None` if the process has already exited.
fn read_comm(pid: i32) -> Option<(String, String)> {
    let comm = fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    let image_path = fs::read_link(format!("/proc/{}/exe", pid)).ok()?;
    Some((image_path.to_string_lossy().into_owned(), comm.trim().to_owned()))
}

/// Finds PIDs whose `/proc/<pid>/comm` or `/proc/<pid>/cmdline` matches
/// `pattern` (spec.md §4.H "prepare"), grounded in
/// `original_source/daemon/non_root/ProcessPoller.cpp`'s polling design.
pub fn find_pids_matching(pattern: &str) -> Vec<i32> {
    let mut matches = Vec::new();
    let entries = match fs::read_dir("/proc") {
        Ok(e) => e,
        Err(_) => return matches,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let pid: i32 = match name.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let comm = fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
        let cmdline = fs::read_to_string(entry.path().join("cmdline")).unwrap_or_default();
        if comm.trim().contains(pattern) || cmdline.contains(pattern) {
            matches.push(pid);
        }
    }
    matches
}

fn online_cpu_ids() -> Vec<i32> {
    let mut ids = Vec::new();
    if let Ok(entries) = fs::read_dir("/sys/devices/system/cpu") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(digits) = name.strip_prefix("cpu") {
                if let Ok(cpu) = digits.parse::<i32>() {
                    ids.push(cpu);
                }
            }
        }
    }
    ids.sort();
    ids
}

trait PerCoreAuxPmuExt {
    fn per_core_aux_pmu_has_entries(&self) -> bool;
}

impl PerCoreAuxPmuExt for CaptureConfig {
    fn per_core_aux_pmu_has_entries(&self) -> bool {
        !self.per_core_aux_pmu.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_gate_resolves_once_every_cpu_reports() {
        let gate = ExecGate::new(&[0, 1, 2]);
        gate.mark_resolved(0);
        gate.mark_resolved(1);
        {
            let expected = gate.expected.lock().unwrap();
            assert!(!expected.values().all(|&r| r));
        }
        gate.mark_resolved(2);
        let expected = gate.expected.lock().unwrap();
        assert!(expected.values().all(|&r| r));
    }

    #[test]
    fn exec_gate_with_no_expected_cpus_is_immediately_resolved() {
        let gate = ExecGate::new(&[]);
        gate.wait_until_all_resolved(Duration::from_millis(50));
        let expected = gate.expected.lock().unwrap();
        assert!(expected.values().all(|&r| r));
    }

    #[test]
    fn find_pids_matching_returns_a_vec_without_panicking() {
        let _ = find_pids_matching("definitely-not-a-real-process-name");
    }
}
