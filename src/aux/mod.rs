//! Auxiliary collectors (spec.md §4.J): small, independently pollable
//! data sources that feed `SUMMARY`/`COUNTER`/`MAPS`/`KALLSYMS` frames
//! alongside the main sampling path.

pub mod cpufreq;
pub mod kallsyms;
pub mod maps;
pub mod setup_checks;

pub use self::cpufreq::{CpuFreqProperties, CpuFreqReader};
pub use self::kallsyms::KallsymsSnapshotter;
pub use self::maps::ProcessMapReader;
pub use self::setup_checks::check_perf_event_paranoid;
