//! The capture configuration bundle consumed at prepare time (spec.md §6).
//!
//! Everything here is built once by an external collaborator (XML config
//! loader, CLI) and handed to the orchestrator by reference. Nothing in this
//! crate parses XML or argv; see spec.md §1 for the scope boundary.

use std::collections::BTreeMap;

use raw::perf_event_attr;

/// A small integer, unique within a capture, used to correlate kernel sample
/// IDs with user-visible counter definitions (spec.md §3 "Counter key").
///
/// Keys below [`RESERVED_KEY_FLOOR`] are reserved for built-in counters
/// (cpu-frequency, sched-switch, and similar).
pub type CounterKey = i32;

/// The first key available for user-configured counters; everything below
/// this is reserved for built-ins, mirroring the key-allocation tie-break in
/// spec.md §4.E.
pub const RESERVED_KEY_FLOOR: CounterKey = 16;

/// Tagged variant over the closed set of places an event group can be
/// attached, replacing the source's virtual "driver" dispatch per the
/// Design Notes in spec.md §9.
#[derive(Clone, Copy, Debug)]
pub enum GroupId {
    /// Opened once per CPU belonging to the named cluster.
    PerCpuCore { cluster: u32 },
    /// Opened once, not per-CPU.
    Uncore { pmu_type: u32 },
    /// SPE-like AUX source; opened once per CPU with an AUX ring.
    AuxSource { pmu_type: u32 },
    /// A software event that should be opened system-wide regardless of CPU
    /// clustering (e.g. a dummy counter used only to carry sample_id_all).
    SoftwareGlobal,
}

impl GroupId {
    /// Whether this group identifier is opened once per online CPU (as
    /// opposed to once for the whole system).
    pub fn is_per_cpu(&self) -> bool {
        match self {
            GroupId::PerCpuCore { .. } | GroupId::AuxSource { .. } => true,
            GroupId::Uncore { .. } | GroupId::SoftwareGlobal => false,
        }
    }
}

/// One entry of a prepared event configuration: an attribute, the counter
/// key it is to be tagged with, and the group it belongs to.
#[derive(Clone, Debug)]
pub struct EventAttrConfig {
    pub attr: perf_event_attr,
    pub key: CounterKey,
    pub group: GroupId,
}

/// Kernel capability flags consumed at prepare time (spec.md §6).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KernelCapFlags {
    pub has_attr_clockid: bool,
    pub has_attr_context_switch: bool,
    pub has_attr_mmap2: bool,
    pub has_attr_comm_exec: bool,
    pub has_ioctl_read_id: bool,
    pub has_aux_support: bool,
    pub exclude_kernel: bool,
    pub can_access_tracepoints: bool,
    pub is_system_wide: bool,
}

/// The full capture configuration bundle (spec.md §6).
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub system_wide: bool,
    pub events: Vec<EventAttrConfig>,
    pub uncore_pmus: Vec<u32>,
    /// Per-core SPE-like aux PMU type, if any.
    pub per_core_aux_pmu: BTreeMap<u32, u32>,
    pub kernel_caps: KernelCapFlags,
    pub live_rate_ms: Option<u32>,
    pub total_buffer_size_mib: u32,
    pub page_size: usize,
    pub one_shot: bool,
    pub attach_pids: Vec<i32>,
    /// Pattern used by the orchestrator's process watcher to find the PID(s)
    /// matching a launched command (spec.md §4.H "prepare").
    pub wait_for_command: Option<String>,
}

impl CaptureConfig {
    /// Highest counter key referenced by `events`, used to size the key
    /// space reserved for built-ins versus user events.
    pub fn max_configured_key(&self) -> CounterKey {
        self.events.iter().map(|e| e.key).max().unwrap_or(0)
    }

    /// Iterate over the event attributes belonging to a single group.
    pub fn group_members(&self, group: GroupId) -> impl Iterator<Item = &EventAttrConfig> {
        self.events.iter().filter(move |e| e.group == group)
    }
}

impl PartialEq for GroupId {
    fn eq(&self, other: &Self) -> bool {
        use GroupId::*;
        match (self, other) {
            (PerCpuCore { cluster: a }, PerCpuCore { cluster: b }) => a == b,
            (Uncore { pmu_type: a }, Uncore { pmu_type: b }) => a == b,
            (AuxSource { pmu_type: a }, AuxSource { pmu_type: b }) => a == b,
            (SoftwareGlobal, SoftwareGlobal) => true,
            _ => false,
        }
    }
}

impl Eq for GroupId {}

impl ::std::hash::Hash for GroupId {
    fn hash<H: ::std::hash::Hasher>(&self, state: &mut H) {
        use GroupId::*;
        match self {
            PerCpuCore { cluster } => {
                0u8.hash(state);
                cluster.hash(state);
            }
            Uncore { pmu_type } => {
                1u8.hash(state);
                pmu_type.hash(state);
            }
            AuxSource { pmu_type } => {
                2u8.hash(state);
                pmu_type.hash(state);
            }
            SoftwareGlobal => 3u8.hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_stay_below_floor() {
        assert!(RESERVED_KEY_FLOOR > 0);
    }

    #[test]
    fn group_members_filters_by_group() {
        let attr: perf_event_attr = unsafe { ::std::mem::zeroed() };
        let cfg = CaptureConfig {
            system_wide: true,
            events: vec![
                EventAttrConfig {
                    attr,
                    key: 16,
                    group: GroupId::PerCpuCore { cluster: 0 },
                },
                EventAttrConfig {
                    attr,
                    key: 17,
                    group: GroupId::Uncore { pmu_type: 5 },
                },
            ],
            uncore_pmus: vec![5],
            per_core_aux_pmu: BTreeMap::new(),
            kernel_caps: KernelCapFlags::default(),
            live_rate_ms: None,
            total_buffer_size_mib: 16,
            page_size: 4096,
            one_shot: false,
            attach_pids: vec![],
            wait_for_command: None,
        };

        let members: Vec<_> = cfg.group_members(GroupId::PerCpuCore { cluster: 0 }).collect();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].key, 16);
        assert_eq!(cfg.max_configured_key(), 17);
    }
}
