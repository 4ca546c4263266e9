mod error;
mod experiment;
mod load;

pub use error::ConfigError;
pub use experiment::{
    parse_analysis_time, parse_cycle_length, ExperimentConfig, StageEntry,
    DEFAULT_MAX_PARALLEL_STAGES,
};
pub use load::{load_experiment, LoadedExperiment, EXPERIMENT_FILE};
