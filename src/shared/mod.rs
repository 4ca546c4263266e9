pub mod fs_atomic;
pub mod ids;
pub mod logging;

pub use fs_atomic::atomic_write_file;
pub use ids::validate_stage_name;
pub use logging::append_experiment_log;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
