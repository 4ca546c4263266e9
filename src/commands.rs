use crate::checkpoint::CheckpointStore;
use crate::config::{load_experiment, ConfigError};
use crate::experiment::{Experiment, ExperimentError, FactoryTable};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliVerb {
    Run { config_dir: PathBuf },
    Status { config_dir: PathBuf },
    Help,
}

#[derive(Debug)]
pub struct CliFailure {
    pub message: String,
    pub exit_code: i32,
}

impl From<ExperimentError> for CliFailure {
    fn from(error: ExperimentError) -> Self {
        Self {
            exit_code: error.exit_code(),
            message: error.to_string(),
        }
    }
}

impl From<ConfigError> for CliFailure {
    fn from(error: ConfigError) -> Self {
        ExperimentError::from(error).into()
    }
}

pub fn cli_help_lines() -> Vec<&'static str> {
    vec![
        "usage: dacycle <command>",
        "",
        "commands:",
        "  run <config_dir>     execute the experiment's cycle loop to completion",
        "  status <config_dir>  render the checkpoint tree without running anything",
        "  help                 show this message",
    ]
}

pub fn parse_cli_verb(args: &[String]) -> Result<CliVerb, String> {
    match args.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => Ok(CliVerb::Help),
        Some("run") => match args.get(1) {
            Some(dir) => Ok(CliVerb::Run {
                config_dir: PathBuf::from(dir),
            }),
            None => Err("run requires a config directory".to_string()),
        },
        Some("status") => match args.get(1) {
            Some(dir) => Ok(CliVerb::Status {
                config_dir: PathBuf::from(dir),
            }),
            None => Err("status requires a config directory".to_string()),
        },
        Some(other) => Err(format!("unknown command `{other}`")),
    }
}

pub fn run_cli(args: Vec<String>, factories: &FactoryTable) -> Result<String, CliFailure> {
    let verb = parse_cli_verb(&args).map_err(|message| CliFailure {
        message: format!("{message}\n{}", cli_help_lines().join("\n")),
        exit_code: 2,
    })?;

    match verb {
        CliVerb::Help => Ok(cli_help_lines().join("\n")),
        CliVerb::Run { config_dir } => {
            let experiment = Experiment::from_config_dir(&config_dir, factories)?;
            let outcome = experiment.run()?;
            let resumed = outcome.cycles.iter().filter(|c| c.resumed).count();
            Ok(format!(
                "experiment `{}` completed: {} cycle(s), {} resumed from checkpoint",
                experiment.config().name,
                outcome.cycles.len(),
                resumed
            ))
        }
        CliVerb::Status { config_dir } => render_status(&config_dir),
    }
}

fn render_status(config_dir: &std::path::Path) -> Result<String, CliFailure> {
    let loaded = load_experiment(config_dir)?;
    let store = CheckpointStore::new(loaded.config.resolve_state_root(config_dir));
    let stage_names: Vec<String> = loaded
        .config
        .stages
        .iter()
        .map(|stage| stage.name.clone())
        .collect();

    let mut lines = vec![format!("experiment `{}`", loaded.config.name)];
    let mut cycle_index = 0u64;
    while store.cycle_dir(cycle_index).is_dir() {
        let window = store
            .load_cycle_window(cycle_index)
            .map_err(ExperimentError::from)?;
        match window {
            Some(window) => lines.push(format!("cycle {cycle_index} {window}")),
            None => lines.push(format!("cycle {cycle_index}")),
        }
        for stage in &stage_names {
            let record = store
                .load_stage_run(cycle_index, stage)
                .map_err(ExperimentError::from)?;
            match record {
                Some(record) => {
                    let mut line = format!(
                        "  {stage}: {} retries={}",
                        record.status, record.retry_count
                    );
                    if let Some(artifact) = &record.artifact {
                        line.push_str(&format!(" artifact={artifact}"));
                    }
                    if let Some(error) = &record.error {
                        line.push_str(&format!(" error={error}"));
                    }
                    lines.push(line);
                }
                None => lines.push(format!("  {stage}: not started")),
            }
        }
        cycle_index += 1;
    }
    if cycle_index == 0 {
        lines.push("no cycles recorded".to_string());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_known_verbs() {
        assert_eq!(parse_cli_verb(&args(&[])), Ok(CliVerb::Help));
        assert_eq!(parse_cli_verb(&args(&["help"])), Ok(CliVerb::Help));
        assert_eq!(
            parse_cli_verb(&args(&["run", "exp"])),
            Ok(CliVerb::Run {
                config_dir: PathBuf::from("exp")
            })
        );
        assert_eq!(
            parse_cli_verb(&args(&["status", "exp"])),
            Ok(CliVerb::Status {
                config_dir: PathBuf::from("exp")
            })
        );
    }

    #[test]
    fn rejects_missing_arguments_and_unknown_verbs() {
        assert!(parse_cli_verb(&args(&["run"])).is_err());
        assert!(parse_cli_verb(&args(&["status"])).is_err());
        assert!(parse_cli_verb(&args(&["launch"])).is_err());
    }
}
