use crate::adapter::{ArtifactRef, CycleWindow, WINDOW_TIME_FORMAT};
use crate::shared::atomic_write_file;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint corruption at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Per-(stage, cycle) lifecycle. `Succeeded` and `Aborted` are terminal;
/// `Failed` re-enters `Preparing` while the retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Preparing,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl StageStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Preparing)
                | (StageStatus::Pending, StageStatus::Aborted)
                | (StageStatus::Preparing, StageStatus::Running)
                | (StageStatus::Preparing, StageStatus::Failed)
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Failed)
                | (StageStatus::Failed, StageStatus::Preparing)
                | (StageStatus::Failed, StageStatus::Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Aborted)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Preparing => write!(f, "preparing"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// The durable record for one logical stage run. Retries rewrite the
/// same record with an incremented retry count; completed work is never
/// duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRunRecord {
    pub stage: String,
    pub cycle_index: u64,
    pub status: StageStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WindowRecord {
    start: String,
    end: String,
}

/// Cycle-indexed directory tree under `<state_root>/cycles`, readable
/// independently of the running process. Every write is an atomic
/// replace; the record that says `succeeded` is the single source of
/// truth for not redoing work.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    state_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn cycle_dir(&self, cycle_index: u64) -> PathBuf {
        self.state_root
            .join("cycles")
            .join(format!("{cycle_index:05}"))
    }

    fn stage_record_path(&self, cycle_index: u64, stage: &str) -> PathBuf {
        self.cycle_dir(cycle_index)
            .join("stages")
            .join(format!("{stage}.json"))
    }

    fn window_path(&self, cycle_index: u64) -> PathBuf {
        self.cycle_dir(cycle_index).join("window.json")
    }

    pub fn record_attempt(&self, record: &StageRunRecord) -> Result<(), CheckpointError> {
        if record.status == StageStatus::Succeeded && record.artifact.is_none() {
            return Err(CheckpointError::Corrupt {
                path: self
                    .stage_record_path(record.cycle_index, &record.stage)
                    .display()
                    .to_string(),
                reason: "refusing to record succeeded run without an artifact reference"
                    .to_string(),
            });
        }

        let path = self.stage_record_path(record.cycle_index, &record.stage);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let body = serde_json::to_vec_pretty(record).map_err(|source| json_error(&path, source))?;
        atomic_write_file(&path, &body).map_err(|source| io_error(&path, source))
    }

    pub fn write_cycle_window(
        &self,
        cycle_index: u64,
        window: &CycleWindow,
    ) -> Result<(), CheckpointError> {
        let path = self.window_path(cycle_index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let record = WindowRecord {
            start: window.start_str(),
            end: window.end_str(),
        };
        let body =
            serde_json::to_vec_pretty(&record).map_err(|source| json_error(&path, source))?;
        atomic_write_file(&path, &body).map_err(|source| io_error(&path, source))
    }

    pub fn load_cycle_window(
        &self,
        cycle_index: u64,
    ) -> Result<Option<CycleWindow>, CheckpointError> {
        let path = self.window_path(cycle_index);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };
        let record: WindowRecord =
            serde_json::from_str(&raw).map_err(|source| json_error(&path, source))?;
        let parse = |value: &str| {
            NaiveDateTime::parse_from_str(value, WINDOW_TIME_FORMAT).map_err(|err| {
                CheckpointError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("unreadable window time `{value}`: {err}"),
                }
            })
        };
        Ok(Some(CycleWindow {
            start: parse(&record.start)?,
            end: parse(&record.end)?,
        }))
    }

    pub fn load_stage_run(
        &self,
        cycle_index: u64,
        stage: &str,
    ) -> Result<Option<StageRunRecord>, CheckpointError> {
        let path = self.stage_record_path(cycle_index, stage);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(&path, source)),
        };
        let record =
            serde_json::from_str(&raw).map_err(|source| json_error(&path, source))?;
        Ok(Some(record))
    }

    /// Artifact reference for a completed run in this exact cycle.
    pub fn stage_output(
        &self,
        cycle_index: u64,
        stage: &str,
    ) -> Result<Option<ArtifactRef>, CheckpointError> {
        match self.load_stage_run(cycle_index, stage)? {
            Some(record) if record.status == StageStatus::Succeeded => Ok(record.artifact),
            _ => Ok(None),
        }
    }

    /// Restart state: the most recent successful artifact strictly
    /// before `before_index`. A failed intermediate cycle does not hide
    /// an older success.
    pub fn latest_stage_output(
        &self,
        before_index: u64,
        stage: &str,
    ) -> Result<Option<ArtifactRef>, CheckpointError> {
        for cycle_index in (0..before_index).rev() {
            if let Some(artifact) = self.stage_output(cycle_index, stage)? {
                return Ok(Some(artifact));
            }
        }
        Ok(None)
    }

    /// Highest cycle index such that cycles `0..=index` each have every
    /// named stage recorded `Succeeded`.
    pub fn last_checkpointed_cycle(
        &self,
        stage_names: &[String],
    ) -> Result<Option<u64>, CheckpointError> {
        let mut last = None;
        for cycle_index in 0.. {
            if !self.cycle_dir(cycle_index).is_dir() {
                break;
            }
            let mut complete = true;
            for stage in stage_names {
                match self.load_stage_run(cycle_index, stage)? {
                    Some(record) if record.status == StageStatus::Succeeded => {}
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                break;
            }
            last = Some(cycle_index);
        }
        Ok(last)
    }

    /// Startup sweep over every persisted record. Inconsistent state is
    /// surfaced, never repaired.
    pub fn verify(&self, stage_names: &[String]) -> Result<(), CheckpointError> {
        let cycles_root = self.state_root.join("cycles");
        let entries = match fs::read_dir(&cycles_root) {
            Ok(entries) => entries,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(io_error(&cycles_root, source)),
        };

        for entry in entries {
            let entry = entry.map_err(|source| io_error(&cycles_root, source))?;
            let dir_name = entry.file_name();
            let Some(name) = dir_name.to_str() else {
                continue;
            };
            let Ok(cycle_index) = name.parse::<u64>() else {
                return Err(CheckpointError::Corrupt {
                    path: entry.path().display().to_string(),
                    reason: "cycle directory name is not an index".to_string(),
                });
            };

            for stage in stage_names {
                let path = self.stage_record_path(cycle_index, stage);
                let raw = match fs::read_to_string(&path) {
                    Ok(raw) => raw,
                    Err(source) if source.kind() == ErrorKind::NotFound => continue,
                    Err(source) => return Err(io_error(&path, source)),
                };
                let record: StageRunRecord =
                    serde_json::from_str(&raw).map_err(|source| CheckpointError::Corrupt {
                        path: path.display().to_string(),
                        reason: format!("unreadable stage record: {source}"),
                    })?;
                if record.status == StageStatus::Succeeded && record.artifact.is_none() {
                    return Err(CheckpointError::Corrupt {
                        path: path.display().to_string(),
                        reason: "record is marked succeeded but has no artifact reference"
                            .to_string(),
                    });
                }
                if record.stage != *stage || record.cycle_index != cycle_index {
                    return Err(CheckpointError::Corrupt {
                        path: path.display().to_string(),
                        reason: format!(
                            "record identity ({}, {}) does not match its location",
                            record.stage, record.cycle_index
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> CheckpointError {
    CheckpointError::Json {
        path: path.display().to_string(),
        source,
    }
}
