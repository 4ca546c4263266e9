use super::ConfigError;
use crate::shared::validate_stage_name;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_PARALLEL_STAGES: usize = 4;

/// One stage declaration inside `experiment.yaml`. The `config` path is
/// resolved relative to the experiment config directory and handed to
/// the stage factory as an opaque document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEntry {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub kind: String,
    pub config: PathBuf,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub start_time: String,
    pub end_time: String,
    pub cycle_length: String,
    #[serde(default)]
    pub abort_on_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_max_parallel_stages")]
    pub max_parallel_stages: usize,
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

fn default_max_parallel_stages() -> usize {
    DEFAULT_MAX_PARALLEL_STAGES
}

impl ExperimentConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "experiment name must be non-empty".to_string(),
            ));
        }
        let start = parse_analysis_time(&self.start_time)?;
        let end = parse_analysis_time(&self.end_time)?;
        if end <= start {
            return Err(ConfigError::Validation(format!(
                "end_time `{}` must be after start_time `{}`",
                self.end_time, self.start_time
            )));
        }
        parse_cycle_length(&self.cycle_length)?;
        if self.max_parallel_stages == 0 {
            return Err(ConfigError::Validation(
                "max_parallel_stages must be at least 1".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(ConfigError::Validation(
                "experiment must declare at least one stage".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            validate_stage_name(&stage.name).map_err(ConfigError::Validation)?;
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "stage `{}` is declared more than once",
                    stage.name
                )));
            }
            if stage.kind.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "stage `{}` must declare a kind",
                    stage.name
                )));
            }
        }
        Ok(())
    }

    pub fn start(&self) -> Result<NaiveDateTime, ConfigError> {
        parse_analysis_time(&self.start_time)
    }

    pub fn end(&self) -> Result<NaiveDateTime, ConfigError> {
        parse_analysis_time(&self.end_time)
    }

    pub fn cycle_length_duration(&self) -> Result<Duration, ConfigError> {
        parse_cycle_length(&self.cycle_length)
    }

    pub fn resolve_state_root(&self, config_dir: &Path) -> PathBuf {
        match &self.state_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => config_dir.join(root),
            None => config_dir.join("state"),
        }
    }
}

/// Analysis times are naive UTC, matching the experiment descriptors the
/// cycling scripts consume. Seconds are optional.
pub fn parse_analysis_time(raw: &str) -> Result<NaiveDateTime, ConfigError> {
    let trimmed = raw.trim();
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .map_err(|_| ConfigError::InvalidTime {
            raw: raw.to_string(),
        })
}

/// Accepts `12h`, `30m`, `3600s`, or a bare number of seconds.
pub fn parse_cycle_length(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidCycleLength {
        raw: raw.to_string(),
    };

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('h') => (&trimmed[..trimmed.len() - 1], 3600),
        Some('m') => (&trimmed[..trimmed.len() - 1], 60),
        Some('s') => (&trimmed[..trimmed.len() - 1], 1),
        Some(ch) if ch.is_ascii_digit() => (trimmed, 1),
        _ => return Err(invalid()),
    };

    let value = digits.parse::<i64>().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }
    Ok(Duration::seconds(value * multiplier))
}
