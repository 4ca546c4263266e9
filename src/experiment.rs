use crate::adapter::{CancelToken, ProcessStageFactory};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::{load_experiment, ConfigError, ExperimentConfig};
use crate::registry::{AdapterFactory, ExecutionPlan, GraphError, RegistryError, StageRegistry};
use crate::scheduler::{
    cycle_windows, CycleScheduler, RunPolicy, SchedulerError, SchedulerOutcome,
};
use crate::shared::append_experiment_log;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Explicit stage-kind table: configuration selects adapters by `kind`,
/// never by runtime type inspection.
#[derive(Default, Clone)]
pub struct FactoryTable {
    factories: BTreeMap<String, Arc<dyn AdapterFactory>>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in `process` kind installed.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert("process", Arc::new(ProcessStageFactory));
        table
    }

    pub fn insert(&mut self, kind: &str, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn AdapterFactory>> {
        self.factories.get(kind).cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("registration error: {0}")]
    Registration(#[from] RegistryError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("experiment aborted in cycle {cycle_index}: stage `{stage}` exhausted its retry budget")]
    Aborted { cycle_index: u64, stage: String },
    #[error("experiment finished with {} aborted stage run(s)", aborted.len())]
    PartialFailure { aborted: Vec<(u64, String)> },
    #[error("experiment canceled during cycle {cycle_index}")]
    Canceled { cycle_index: u64 },
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExperimentError {
    /// Enumerated process exit causes; the binary maps these directly.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExperimentError::Config(_) => 2,
            ExperimentError::Registration(_) => 3,
            ExperimentError::Graph(_) => 4,
            ExperimentError::Checkpoint(_) => 5,
            ExperimentError::Aborted { .. } | ExperimentError::PartialFailure { .. } => 6,
            ExperimentError::Canceled { .. } => 7,
            ExperimentError::Io { .. } => 1,
        }
    }
}

impl From<SchedulerError> for ExperimentError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Checkpoint(error) => ExperimentError::Checkpoint(error),
            SchedulerError::Aborted { cycle_index, stage } => {
                ExperimentError::Aborted { cycle_index, stage }
            }
            SchedulerError::Canceled { cycle_index } => ExperimentError::Canceled { cycle_index },
        }
    }
}

/// A fully wired experiment: descriptor, registry, checkpoint store.
/// Construction is the one-time setup phase; `run` may be called on a
/// fresh state root or on one left behind by an interrupted process.
#[derive(Debug)]
pub struct Experiment {
    config: ExperimentConfig,
    registry: StageRegistry,
    store: CheckpointStore,
    cancel: CancelToken,
}

impl Experiment {
    pub fn new(config: ExperimentConfig, registry: StageRegistry, state_root: PathBuf) -> Self {
        Self {
            config,
            registry,
            store: CheckpointStore::new(state_root),
            cancel: CancelToken::new(),
        }
    }

    /// Run entry point: reads `experiment.yaml` plus one configuration
    /// document per stage and registers each stage through the factory
    /// table.
    pub fn from_config_dir(
        config_dir: &Path,
        factories: &FactoryTable,
    ) -> Result<Self, ExperimentError> {
        let loaded = load_experiment(config_dir)?;
        let mut registry = StageRegistry::new();
        for (entry, (_, document)) in loaded
            .config
            .stages
            .iter()
            .zip(loaded.stage_documents.into_iter())
        {
            let factory =
                factories
                    .get(&entry.kind)
                    .ok_or_else(|| ConfigError::UnknownStageKind {
                        stage: entry.name.clone(),
                        kind: entry.kind.clone(),
                    })?;
            registry.register_with_retry_budget(
                &entry.name,
                entry.parent.as_deref(),
                factory,
                document,
                entry.max_retries,
            )?;
        }

        let state_root = loaded.config.resolve_state_root(config_dir);
        Ok(Self::new(loaded.config, registry, state_root))
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Handle for external abort signals; shared with every in-flight
    /// adapter once the scheduler is running.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<SchedulerOutcome, ExperimentError> {
        let plan = ExecutionPlan::build(&self.registry)?;
        let stage_names = self.registry.stage_names();

        let state_root = self.store.state_root().to_path_buf();
        fs::create_dir_all(&state_root).map_err(|source| ExperimentError::Io {
            path: state_root.display().to_string(),
            source,
        })?;
        self.store.verify(&stage_names)?;

        let windows = cycle_windows(
            self.config.start()?,
            self.config.end()?,
            self.config.cycle_length_duration()?,
        );
        append_experiment_log(
            &state_root,
            "info",
            "experiment.started",
            &format!(
                "name={} cycles={} stages={}",
                self.config.name,
                windows.len(),
                stage_names.len()
            ),
        );

        let policy = RunPolicy {
            abort_on_failure: self.config.abort_on_failure,
            default_max_retries: self.config.max_retries,
            max_parallel_stages: self.config.max_parallel_stages,
        };
        let scheduler =
            CycleScheduler::new(&self.registry, &plan, &self.store, policy, self.cancel.clone());
        let outcome = scheduler.run(&windows).map_err(|error| {
            append_experiment_log(
                &state_root,
                "error",
                "experiment.stopped",
                &error.to_string(),
            );
            ExperimentError::from(error)
        })?;

        if !outcome.fully_succeeded() {
            let aborted = outcome.aborted_stages();
            append_experiment_log(
                &state_root,
                "error",
                "experiment.partial_failure",
                &format!("aborted_stage_runs={}", aborted.len()),
            );
            return Err(ExperimentError::PartialFailure { aborted });
        }

        append_experiment_log(
            &state_root,
            "info",
            "experiment.completed",
            &format!("name={} cycles={}", self.config.name, outcome.cycles.len()),
        );
        Ok(outcome)
    }
}
