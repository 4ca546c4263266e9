pub mod process;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use process::{ProcessStage, ProcessStageConfig, ProcessStageFactory};

pub const WINDOW_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Half-open analysis window `[start, end)` for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl CycleWindow {
    pub fn start_str(&self) -> String {
        self.start.format(WINDOW_TIME_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(WINDOW_TIME_FORMAT).to_string()
    }
}

impl std::fmt::Display for CycleWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_str(), self.end_str())
    }
}

/// Location of a stage's finalized outputs, opaque to the orchestrator
/// beyond being recordable and handable to later stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Cooperative cancellation shared between the scheduler and every
/// in-flight adapter `run()`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Everything a stage may see while preparing one cycle: its window, its
/// direct parents' outputs for this cycle, and its own most recent
/// successful output (restart state). The workspace root is exclusively
/// owned by this (stage, cycle) pair.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub stage: String,
    pub cycle_index: u64,
    pub window: CycleWindow,
    pub parent_artifacts: BTreeMap<String, ArtifactRef>,
    pub restart_artifact: Option<ArtifactRef>,
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub member_dirs: Vec<PathBuf>,
}

pub type StageOutputs = serde_json::Map<String, serde_json::Value>;

/// Result of the long-running part of a stage. Failures are values, not
/// errors escaping the stage boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded(StageOutputs),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StageFailure {
    #[error("adapter construction failed: {0}")]
    Factory(String),
    #[error("prepare failed: {0}")]
    Prepare(String),
    #[error("run failed: {0}")]
    Run(String),
    #[error("postprocess failed: {0}")]
    Postprocess(String),
}

/// The full capability set the orchestrator requires of a stage. One
/// adapter instance is created per (stage, cycle) attempt and never
/// shared across threads.
pub trait StageAdapter: Send {
    fn prepare(&mut self, context: &CycleContext) -> Result<Workspace, StageFailure>;

    /// Blocking from the scheduler's point of view; issued on a worker
    /// thread so sibling stages overlap. Implementations should poll the
    /// token and wind down externally dispatched work when it fires.
    fn run(&mut self, workspace: &Workspace, cancel: &CancelToken) -> RunOutcome;

    fn postprocess(&mut self, outputs: StageOutputs) -> Result<ArtifactRef, StageFailure>;
}
