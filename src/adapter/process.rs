use super::{
    ArtifactRef, CancelToken, CycleContext, RunOutcome, StageAdapter, StageFailure, StageOutputs,
    Workspace,
};
use crate::registry::AdapterFactory;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Configuration document for the built-in `process` stage kind: one
/// external command dispatched once per ensemble member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStageConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_ensemble_members")]
    pub ensemble_members: usize,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

fn default_ensemble_members() -> usize {
    1
}

/// Dispatches the configured command once per ensemble member inside an
/// isolated `mem_{i:03}` sub-workspace. The cycle context travels to the
/// command through `DACYCLE_*` environment variables and a `context.json`
/// file in the workspace root; members share read-only parent artifacts
/// but never each other's directories.
pub struct ProcessStage {
    stage: String,
    config: ProcessStageConfig,
    env: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
struct ContextFile<'a> {
    stage: &'a str,
    cycle_index: u64,
    window_start: String,
    window_end: String,
    parent_artifacts: std::collections::BTreeMap<&'a str, &'a str>,
    restart_artifact: Option<&'a str>,
}

impl ProcessStage {
    pub fn from_document(stage: &str, document: &serde_yaml::Value) -> Result<Self, StageFailure> {
        let config: ProcessStageConfig = serde_yaml::from_value(document.clone())
            .map_err(|err| StageFailure::Factory(format!("stage `{stage}`: {err}")))?;
        if config.command.trim().is_empty() {
            return Err(StageFailure::Factory(format!(
                "stage `{stage}` must configure a command"
            )));
        }
        if config.ensemble_members == 0 {
            return Err(StageFailure::Factory(format!(
                "stage `{stage}` must configure at least one ensemble member"
            )));
        }
        Ok(Self {
            stage: stage.to_string(),
            config,
            env: Vec::new(),
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds.unwrap_or(24 * 3600))
    }

    fn run_member(
        &self,
        member_dir: &Path,
        member: usize,
        cancel: &CancelToken,
    ) -> Result<(), String> {
        let mut command = Command::new(&self.config.command);
        command
            .current_dir(member_dir)
            .args(&self.config.args)
            .env("DACYCLE_MEMBER", member.to_string())
            .env("DACYCLE_MEMBER_DIR", member_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|err| format!("failed to spawn `{}`: {err}", self.config.command))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain_pipe(stdout));
        let stderr_reader = thread::spawn(move || drain_pipe(stderr));

        let started = Instant::now();
        let timeout = self.timeout();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancel.is_canceled() {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(format!("member {member} canceled"));
                    }
                    if started.elapsed() > timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(format!(
                            "member {member} timed out after {}s",
                            timeout.as_secs()
                        ));
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(format!("member {member} wait failed: {err}")),
            }
        };

        let stdout_text = stdout_reader.join().unwrap_or_default();
        let stderr_text = stderr_reader.join().unwrap_or_default();
        let _ = fs::write(member_dir.join("stdout.log"), &stdout_text);
        let _ = fs::write(member_dir.join("stderr.log"), &stderr_text);

        if status.success() {
            Ok(())
        } else {
            let tail = stderr_text.lines().next_back().unwrap_or("").to_string();
            Err(format!(
                "member {member} exited with status {}: {tail}",
                status.code().unwrap_or(-1)
            ))
        }
    }
}

fn drain_pipe(pipe: Option<impl Read>) -> String {
    let Some(pipe) = pipe else {
        return String::new();
    };
    let mut buf = String::new();
    let _ = BufReader::new(pipe).read_to_string(&mut buf);
    buf
}

impl StageAdapter for ProcessStage {
    fn prepare(&mut self, context: &CycleContext) -> Result<Workspace, StageFailure> {
        let root = context.workspace_root.clone();
        let prepare_error =
            |path: &Path, err: std::io::Error| StageFailure::Prepare(format!("{}: {err}", path.display()));

        fs::create_dir_all(&root).map_err(|err| prepare_error(&root, err))?;
        let outputs_dir = root.join("outputs");
        fs::create_dir_all(&outputs_dir).map_err(|err| prepare_error(&outputs_dir, err))?;

        let mut member_dirs = Vec::with_capacity(self.config.ensemble_members);
        for member in 0..self.config.ensemble_members {
            let member_dir = root.join(format!("mem_{member:03}"));
            fs::create_dir_all(&member_dir).map_err(|err| prepare_error(&member_dir, err))?;
            member_dirs.push(member_dir);
        }

        let context_file = ContextFile {
            stage: &context.stage,
            cycle_index: context.cycle_index,
            window_start: context.window.start_str(),
            window_end: context.window.end_str(),
            parent_artifacts: context
                .parent_artifacts
                .iter()
                .map(|(name, artifact)| (name.as_str(), artifact.as_str()))
                .collect(),
            restart_artifact: context.restart_artifact.as_ref().map(|a| a.as_str()),
        };
        let context_path = root.join("context.json");
        let body = serde_json::to_vec_pretty(&context_file)
            .map_err(|err| StageFailure::Prepare(err.to_string()))?;
        fs::write(&context_path, body).map_err(|err| prepare_error(&context_path, err))?;

        self.env = vec![
            ("DACYCLE_STAGE".to_string(), context.stage.clone()),
            (
                "DACYCLE_CYCLE_INDEX".to_string(),
                context.cycle_index.to_string(),
            ),
            (
                "DACYCLE_WINDOW_START".to_string(),
                context.window.start_str(),
            ),
            ("DACYCLE_WINDOW_END".to_string(), context.window.end_str()),
            (
                "DACYCLE_WORKSPACE".to_string(),
                root.display().to_string(),
            ),
            (
                "DACYCLE_OUTPUT_DIR".to_string(),
                outputs_dir.display().to_string(),
            ),
            (
                "DACYCLE_CONTEXT_FILE".to_string(),
                context_path.display().to_string(),
            ),
        ];
        if let Some(restart) = &context.restart_artifact {
            self.env
                .push(("DACYCLE_RESTART".to_string(), restart.as_str().to_string()));
        }
        for (parent, artifact) in &context.parent_artifacts {
            self.env.push((
                format!("DACYCLE_PARENT_{}", parent.to_ascii_uppercase()),
                artifact.as_str().to_string(),
            ));
        }

        Ok(Workspace { root, member_dirs })
    }

    fn run(&mut self, workspace: &Workspace, cancel: &CancelToken) -> RunOutcome {
        let mut failures = Vec::new();
        for (member, member_dir) in workspace.member_dirs.iter().enumerate() {
            if cancel.is_canceled() {
                failures.push(format!("member {member} canceled before start"));
                break;
            }
            if let Err(reason) = self.run_member(member_dir, member, cancel) {
                failures.push(reason);
                break;
            }
        }

        if let Some(first) = failures.into_iter().next() {
            return RunOutcome::Failed(first);
        }

        let mut outputs = StageOutputs::new();
        outputs.insert(
            "output_dir".to_string(),
            serde_json::Value::String(workspace.root.join("outputs").display().to_string()),
        );
        RunOutcome::Succeeded(outputs)
    }

    fn postprocess(&mut self, outputs: StageOutputs) -> Result<ArtifactRef, StageFailure> {
        let output_dir = outputs
            .get("output_dir")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                StageFailure::Postprocess(format!(
                    "stage `{}` run outputs are missing `output_dir`",
                    self.stage
                ))
            })?;
        let path = PathBuf::from(output_dir);
        if !path.is_dir() {
            return Err(StageFailure::Postprocess(format!(
                "stage `{}` output directory `{output_dir}` does not exist",
                self.stage
            )));
        }
        Ok(ArtifactRef::new(output_dir))
    }
}

/// Factory for the `process` kind; installed by the binary's factory
/// table and available to setup scripts embedding the library.
#[derive(Debug, Default)]
pub struct ProcessStageFactory;

impl AdapterFactory for ProcessStageFactory {
    fn create(
        &self,
        stage: &str,
        config: &serde_yaml::Value,
    ) -> Result<Box<dyn StageAdapter>, StageFailure> {
        Ok(Box::new(ProcessStage::from_document(stage, config)?))
    }
}
