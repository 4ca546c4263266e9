mod engine;
mod windows;

pub use engine::{CycleReport, CycleScheduler, RunPolicy, SchedulerError, SchedulerOutcome};
pub use windows::cycle_windows;
