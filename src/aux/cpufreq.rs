//! CPU-frequency reader (spec.md §4.J), grounded in
//! `original_source/daemon/agents/perf/cpufreq_counter.{h,cpp}`: for a
//! given core, resolves its cluster and reads either `cpuinfo_cur_freq`
//! (the hardware-reported, unthrottled frequency) or `scaling_cur_freq`
//! (the governor's current setpoint), the choice fixed per cluster at
//! prepare time and cached rather than re-decided on every read.

use std::collections::HashMap;
use std::fs;

use config::RESERVED_KEY_FLOOR;

const FREQ_MULTIPLIER: i64 = 1000;

/// Per-cluster configuration: which key to report frequency samples
/// under, and which sysfs node to read.
#[derive(Debug, Clone, Copy)]
pub struct CpuFreqProperties {
    pub key: i32,
    pub use_cpuinfo: bool,
}

/// One sample: the core it came from, the key it should be attributed
/// to, and the frequency in Hz (already multiplied up from kHz).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CpuFreqSample {
    pub core: i32,
    pub key: i32,
    pub value: i64,
}

pub struct CpuFreqReader {
    cluster_of_cpu: HashMap<i32, u32>,
    properties_by_cluster: HashMap<u32, CpuFreqProperties>,
}

impl CpuFreqReader {
    pub fn new(cluster_of_cpu: HashMap<i32, u32>, properties_by_cluster: HashMap<u32, CpuFreqProperties>) -> Self {
        CpuFreqReader { cluster_of_cpu, properties_by_cluster }
    }

    /// Reads the current frequency for `cpu`, or `None` if the core is
    /// unknown or its cluster has no configured key (below the reserved
    /// floor, meaning "not wired up" per the original's `first_free_key`
    /// check).
    pub fn read(&self, cpu: i32) -> Option<CpuFreqSample> {
        let cluster = *self.cluster_of_cpu.get(&cpu)?;
        let props = self.properties_by_cluster.get(&cluster)?;
        if props.key < RESERVED_KEY_FLOOR as i32 {
            return None;
        }

        let node = if props.use_cpuinfo { "cpuinfo_cur_freq" } else { "scaling_cur_freq" };
        let path = format!("/sys/devices/system/cpu/cpu{}/cpufreq/{}", cpu, node);
        let freq_khz: i64 = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        Some(CpuFreqSample { core: cpu, key: props.key, value: freq_khz * FREQ_MULTIPLIER })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_cpu_returns_none() {
        let reader = CpuFreqReader::new(HashMap::new(), HashMap::new());
        assert!(reader.read(0).is_none());
    }

    #[test]
    fn cluster_below_reserved_floor_returns_none() {
        let mut cluster_of_cpu = HashMap::new();
        cluster_of_cpu.insert(0, 0u32);
        let mut properties_by_cluster = HashMap::new();
        properties_by_cluster.insert(0u32, CpuFreqProperties { key: 1, use_cpuinfo: true });
        let reader = CpuFreqReader::new(cluster_of_cpu, properties_by_cluster);
        assert!(reader.read(0).is_none());
    }

    #[test]
    fn missing_sysfs_node_reports_zero_instead_of_erroring() {
        let mut cluster_of_cpu = HashMap::new();
        cluster_of_cpu.insert(9999, 0u32);
        let mut properties_by_cluster = HashMap::new();
        properties_by_cluster.insert(0u32, CpuFreqProperties { key: RESERVED_KEY_FLOOR as i32, use_cpuinfo: true });
        let reader = CpuFreqReader::new(cluster_of_cpu, properties_by_cluster);
        let sample = reader.read(9999).unwrap();
        assert_eq!(sample.value, 0);
    }
}
