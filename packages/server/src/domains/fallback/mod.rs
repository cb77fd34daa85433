//! Detectors that recover entities whose initialization never ran.

pub mod stalled_scan;
pub mod worker_guard;

pub use stalled_scan::{
    run_stalled_scan, ScanReport, SqlStalledEntityFinder, StalledEntityFinder, StalledScanConfig,
};
pub use worker_guard::{ensure_initialized, EnsureOutcome};
