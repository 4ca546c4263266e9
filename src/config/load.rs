use super::{ConfigError, ExperimentConfig};
use std::fs;
use std::path::{Path, PathBuf};

pub const EXPERIMENT_FILE: &str = "experiment.yaml";

/// A loaded experiment: the validated descriptor plus every stage's own
/// configuration document, parsed but otherwise opaque to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct LoadedExperiment {
    pub config: ExperimentConfig,
    pub config_dir: PathBuf,
    pub stage_documents: Vec<(String, serde_yaml::Value)>,
}

pub fn load_experiment(config_dir: &Path) -> Result<LoadedExperiment, ConfigError> {
    let descriptor_path = config_dir.join(EXPERIMENT_FILE);
    let config = ExperimentConfig::from_path(&descriptor_path)?;
    config.validate()?;

    let mut stage_documents = Vec::with_capacity(config.stages.len());
    for stage in &config.stages {
        let path = if stage.config.is_absolute() {
            stage.config.clone()
        } else {
            config_dir.join(&stage.config)
        };
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let document = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        stage_documents.push((stage.name.clone(), document));
    }

    Ok(LoadedExperiment {
        config,
        config_dir: config_dir.to_path_buf(),
        stage_documents,
    })
}
