use crate::adapter::{ArtifactRef, CancelToken, CycleContext, CycleWindow, RunOutcome, StageFailure};
use crate::checkpoint::{CheckpointError, CheckpointStore, StageRunRecord, StageStatus};
use crate::registry::{ExecutionPlan, StageRegistry};
use crate::shared::{append_experiment_log, now_secs};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    pub abort_on_failure: bool,
    pub default_max_retries: u32,
    pub max_parallel_stages: usize,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            abort_on_failure: false,
            default_max_retries: 0,
            max_parallel_stages: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_index: u64,
    pub resumed: bool,
    pub aborted_stages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOutcome {
    pub cycles: Vec<CycleReport>,
}

impl SchedulerOutcome {
    pub fn aborted_stages(&self) -> Vec<(u64, String)> {
        self.cycles
            .iter()
            .flat_map(|cycle| {
                cycle
                    .aborted_stages
                    .iter()
                    .map(|stage| (cycle.cycle_index, stage.clone()))
            })
            .collect()
    }

    pub fn fully_succeeded(&self) -> bool {
        self.cycles.iter().all(|c| c.aborted_stages.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("experiment aborted in cycle {cycle_index}: stage `{stage}` exhausted its retry budget")]
    Aborted { cycle_index: u64, stage: String },
    #[error("experiment canceled during cycle {cycle_index}")]
    Canceled { cycle_index: u64 },
}

enum StageEvent {
    Preparing {
        stage: String,
        attempt: u32,
    },
    Running {
        stage: String,
        attempt: u32,
    },
    Finished {
        stage: String,
        attempt: u32,
        result: Result<ArtifactRef, StageFailure>,
    },
}

/// Drives every registered stage through its lifecycle once per cycle.
/// Worker threads execute adapters; this thread is the only checkpoint
/// writer, so a parent's `Succeeded` record always lands on disk before
/// any child is dispatched.
pub struct CycleScheduler<'a> {
    registry: &'a StageRegistry,
    plan: &'a ExecutionPlan,
    store: &'a CheckpointStore,
    policy: RunPolicy,
    cancel: CancelToken,
}

impl<'a> CycleScheduler<'a> {
    pub fn new(
        registry: &'a StageRegistry,
        plan: &'a ExecutionPlan,
        store: &'a CheckpointStore,
        policy: RunPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            registry,
            plan,
            store,
            policy,
            cancel,
        }
    }

    pub fn run(&self, windows: &[CycleWindow]) -> Result<SchedulerOutcome, SchedulerError> {
        let stage_names = self.registry.stage_names();
        let resume_from = self
            .store
            .last_checkpointed_cycle(&stage_names)?
            .map(|cycle| cycle + 1)
            .unwrap_or(0);

        let mut cycles = Vec::with_capacity(windows.len());
        for (index, window) in windows.iter().enumerate() {
            let cycle_index = index as u64;
            if cycle_index < resume_from {
                self.log(
                    "info",
                    "cycle.resumed",
                    &format!("cycle={cycle_index} already checkpointed; skipping"),
                );
                cycles.push(CycleReport {
                    cycle_index,
                    resumed: true,
                    aborted_stages: Vec::new(),
                });
                continue;
            }
            if self.cancel.is_canceled() {
                return Err(SchedulerError::Canceled { cycle_index });
            }

            let report = self.run_cycle(cycle_index, window)?;
            let aborted = report.aborted_stages.clone();
            cycles.push(report);

            if !aborted.is_empty() {
                if self.policy.abort_on_failure {
                    return Err(SchedulerError::Aborted {
                        cycle_index,
                        stage: aborted[0].clone(),
                    });
                }
                self.log(
                    "warn",
                    "cycle.partial",
                    &format!(
                        "cycle={cycle_index} advancing despite aborted stages: {}",
                        aborted.join(", ")
                    ),
                );
            }
            if self.cancel.is_canceled() {
                return Err(SchedulerError::Canceled { cycle_index });
            }
        }
        Ok(SchedulerOutcome { cycles })
    }

    fn run_cycle(
        &self,
        cycle_index: u64,
        window: &CycleWindow,
    ) -> Result<CycleReport, SchedulerError> {
        self.store.write_cycle_window(cycle_index, window)?;
        self.log(
            "info",
            "cycle.started",
            &format!("cycle={cycle_index} window={window}"),
        );

        let mut status: BTreeMap<String, StageStatus> = BTreeMap::new();
        let mut retries: BTreeMap<String, u32> = BTreeMap::new();
        let mut artifacts: BTreeMap<String, ArtifactRef> = BTreeMap::new();
        let mut aborted_stages: Vec<String> = Vec::new();

        for stage in self.plan.order() {
            match self.store.load_stage_run(cycle_index, stage)? {
                Some(record) if record.status == StageStatus::Succeeded => {
                    if let Some(artifact) = record.artifact {
                        artifacts.insert(stage.clone(), artifact);
                    }
                    status.insert(stage.clone(), StageStatus::Succeeded);
                    self.log(
                        "info",
                        "stage.reused",
                        &format!("cycle={cycle_index} stage={stage} already succeeded"),
                    );
                }
                Some(record) if record.status == StageStatus::Aborted => {
                    // Aborted is terminal: a rerun of the cycle must not
                    // resurrect the stage.
                    status.insert(stage.clone(), StageStatus::Aborted);
                    aborted_stages.push(stage.clone());
                    self.log(
                        "warn",
                        "stage.still_aborted",
                        &format!("cycle={cycle_index} stage={stage} aborted in an earlier run"),
                    );
                }
                Some(record) => {
                    // Interrupted attempt: rerun, carrying the retry
                    // count forward in the same logical record.
                    status.insert(stage.clone(), StageStatus::Pending);
                    retries.insert(stage.clone(), record.retry_count);
                }
                None => {
                    status.insert(stage.clone(), StageStatus::Pending);
                }
            }
        }
        for stage in aborted_stages.clone() {
            self.abort_descendants(&stage, cycle_index, &mut status, &mut aborted_stages)?;
        }

        let (events_tx, events_rx) = mpsc::channel::<StageEvent>();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut loop_error: Option<SchedulerError> = None;

        loop {
            while !self.cancel.is_canceled() && running.len() < self.policy.max_parallel_stages {
                let Some(stage) = self.next_ready(&status, &running) else {
                    break;
                };
                let attempt = retries.get(&stage).copied().unwrap_or(0);
                match self.dispatch(&stage, cycle_index, window, &artifacts, attempt, &events_tx) {
                    Ok(handle) => {
                        running.insert(stage.clone());
                        status.insert(stage.clone(), StageStatus::Preparing);
                        handles.push(handle);
                    }
                    Err(error) => {
                        loop_error = Some(error);
                        self.cancel.cancel();
                        break;
                    }
                }
            }
            if loop_error.is_some() {
                break;
            }
            if running.is_empty()
                && (self.cancel.is_canceled() || self.next_ready(&status, &running).is_none())
            {
                break;
            }

            match events_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => {
                    if let Err(error) = self.handle_event(
                        event,
                        cycle_index,
                        &mut status,
                        &mut retries,
                        &mut artifacts,
                        &mut aborted_stages,
                        &mut running,
                    ) {
                        loop_error = Some(error);
                        self.cancel.cancel();
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(events_tx);
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(error) = loop_error {
            return Err(error);
        }

        if aborted_stages.is_empty() {
            self.log(
                "info",
                "cycle.completed",
                &format!("cycle={cycle_index} all stages succeeded"),
            );
        }

        Ok(CycleReport {
            cycle_index,
            resumed: false,
            aborted_stages,
        })
    }

    fn next_ready(
        &self,
        status: &BTreeMap<String, StageStatus>,
        running: &BTreeSet<String>,
    ) -> Option<String> {
        self.plan
            .order()
            .iter()
            .find(|stage| {
                status.get(*stage) == Some(&StageStatus::Pending)
                    && !running.contains(*stage)
                    && self
                        .plan
                        .parents_of(stage)
                        .iter()
                        .all(|parent| status.get(parent) == Some(&StageStatus::Succeeded))
            })
            .cloned()
    }

    fn dispatch(
        &self,
        stage: &str,
        cycle_index: u64,
        window: &CycleWindow,
        artifacts: &BTreeMap<String, ArtifactRef>,
        attempt: u32,
        events_tx: &Sender<StageEvent>,
    ) -> Result<JoinHandle<()>, SchedulerError> {
        let parent_artifacts: BTreeMap<String, ArtifactRef> = self
            .plan
            .parents_of(stage)
            .iter()
            .filter_map(|parent| {
                artifacts
                    .get(parent)
                    .map(|artifact| (parent.clone(), artifact.clone()))
            })
            .collect();
        let restart_artifact = self.store.latest_stage_output(cycle_index, stage)?;
        let context = CycleContext {
            stage: stage.to_string(),
            cycle_index,
            window: *window,
            parent_artifacts,
            restart_artifact,
            workspace_root: self.workspace_root(stage, cycle_index),
        };

        self.log(
            "info",
            "stage.dispatched",
            &format!("cycle={cycle_index} stage={stage} attempt={attempt}"),
        );

        let record = self.registry.get(stage);
        let adapter = record.map(|r| r.create_adapter());
        let tx = events_tx.clone();
        let cancel = self.cancel.clone();
        let stage_name = stage.to_string();

        Ok(thread::spawn(move || {
            let mut adapter = match adapter {
                Some(Ok(adapter)) => adapter,
                Some(Err(failure)) => {
                    let _ = tx.send(StageEvent::Finished {
                        stage: stage_name,
                        attempt,
                        result: Err(failure),
                    });
                    return;
                }
                None => {
                    let _ = tx.send(StageEvent::Finished {
                        stage: stage_name.clone(),
                        attempt,
                        result: Err(StageFailure::Factory(format!(
                            "stage `{stage_name}` is not registered"
                        ))),
                    });
                    return;
                }
            };

            let _ = tx.send(StageEvent::Preparing {
                stage: stage_name.clone(),
                attempt,
            });
            let workspace = match adapter.prepare(&context) {
                Ok(workspace) => workspace,
                Err(failure) => {
                    let _ = tx.send(StageEvent::Finished {
                        stage: stage_name,
                        attempt,
                        result: Err(failure),
                    });
                    return;
                }
            };

            let _ = tx.send(StageEvent::Running {
                stage: stage_name.clone(),
                attempt,
            });
            let result = match adapter.run(&workspace, &cancel) {
                RunOutcome::Failed(reason) => Err(StageFailure::Run(reason)),
                RunOutcome::Succeeded(outputs) => adapter.postprocess(outputs),
            };
            let _ = tx.send(StageEvent::Finished {
                stage: stage_name,
                attempt,
                result,
            });
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_event(
        &self,
        event: StageEvent,
        cycle_index: u64,
        status: &mut BTreeMap<String, StageStatus>,
        retries: &mut BTreeMap<String, u32>,
        artifacts: &mut BTreeMap<String, ArtifactRef>,
        aborted_stages: &mut Vec<String>,
        running: &mut BTreeSet<String>,
    ) -> Result<(), SchedulerError> {
        match event {
            StageEvent::Preparing { stage, attempt } => {
                status.insert(stage.clone(), StageStatus::Preparing);
                self.store.record_attempt(&StageRunRecord {
                    stage,
                    cycle_index,
                    status: StageStatus::Preparing,
                    retry_count: attempt,
                    artifact: None,
                    error: None,
                    updated_at: now_secs(),
                })?;
            }
            StageEvent::Running { stage, attempt } => {
                status.insert(stage.clone(), StageStatus::Running);
                self.store.record_attempt(&StageRunRecord {
                    stage,
                    cycle_index,
                    status: StageStatus::Running,
                    retry_count: attempt,
                    artifact: None,
                    error: None,
                    updated_at: now_secs(),
                })?;
            }
            StageEvent::Finished {
                stage,
                attempt,
                result,
            } => {
                running.remove(&stage);
                match result {
                    Ok(artifact) => {
                        self.store.record_attempt(&StageRunRecord {
                            stage: stage.clone(),
                            cycle_index,
                            status: StageStatus::Succeeded,
                            retry_count: attempt,
                            artifact: Some(artifact.clone()),
                            error: None,
                            updated_at: now_secs(),
                        })?;
                        artifacts.insert(stage.clone(), artifact);
                        status.insert(stage.clone(), StageStatus::Succeeded);
                        self.log(
                            "info",
                            "stage.succeeded",
                            &format!("cycle={cycle_index} stage={stage} attempt={attempt}"),
                        );
                    }
                    Err(failure) if self.cancel.is_canceled() => {
                        // Interrupted, not exhausted: leave a failed (non
                        // terminal) record so resume reruns this stage.
                        self.store.record_attempt(&StageRunRecord {
                            stage: stage.clone(),
                            cycle_index,
                            status: StageStatus::Failed,
                            retry_count: attempt,
                            artifact: None,
                            error: Some(failure.to_string()),
                            updated_at: now_secs(),
                        })?;
                        status.insert(stage.clone(), StageStatus::Failed);
                        self.log(
                            "warn",
                            "stage.interrupted",
                            &format!("cycle={cycle_index} stage={stage} attempt={attempt}: {failure}"),
                        );
                    }
                    Err(failure) => {
                        let budget = self.max_retries(&stage);
                        let can_retry = attempt < budget;
                        self.store.record_attempt(&StageRunRecord {
                            stage: stage.clone(),
                            cycle_index,
                            status: if can_retry {
                                StageStatus::Failed
                            } else {
                                StageStatus::Aborted
                            },
                            retry_count: attempt,
                            artifact: None,
                            error: Some(failure.to_string()),
                            updated_at: now_secs(),
                        })?;
                        if can_retry {
                            retries.insert(stage.clone(), attempt + 1);
                            status.insert(stage.clone(), StageStatus::Pending);
                            self.log(
                                "warn",
                                "stage.retry",
                                &format!(
                                    "cycle={cycle_index} stage={stage} attempt={attempt} failed ({failure}); retrying"
                                ),
                            );
                        } else {
                            status.insert(stage.clone(), StageStatus::Aborted);
                            aborted_stages.push(stage.clone());
                            self.log(
                                "error",
                                "stage.aborted",
                                &format!(
                                    "cycle={cycle_index} stage={stage} attempt={attempt} failed ({failure})"
                                ),
                            );
                            self.abort_descendants(
                                &stage,
                                cycle_index,
                                status,
                                aborted_stages,
                            )?;
                            if self.policy.abort_on_failure {
                                self.cancel.cancel();
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Descendants of an aborted stage can never become ready; they are
    /// recorded as aborted rather than silently skipped.
    fn abort_descendants(
        &self,
        stage: &str,
        cycle_index: u64,
        status: &mut BTreeMap<String, StageStatus>,
        aborted_stages: &mut Vec<String>,
    ) -> Result<(), SchedulerError> {
        for descendant in self.plan.descendants_of(stage) {
            let current = status.get(&descendant).copied();
            if current == Some(StageStatus::Succeeded) || current == Some(StageStatus::Aborted) {
                continue;
            }
            self.store.record_attempt(&StageRunRecord {
                stage: descendant.clone(),
                cycle_index,
                status: StageStatus::Aborted,
                retry_count: 0,
                artifact: None,
                error: Some(format!("ancestor stage `{stage}` aborted")),
                updated_at: now_secs(),
            })?;
            status.insert(descendant.clone(), StageStatus::Aborted);
            aborted_stages.push(descendant.clone());
            self.log(
                "error",
                "stage.aborted",
                &format!("cycle={cycle_index} stage={descendant} ancestor={stage}"),
            );
        }
        Ok(())
    }

    fn max_retries(&self, stage: &str) -> u32 {
        self.registry
            .get(stage)
            .and_then(|record| record.max_retries)
            .unwrap_or(self.policy.default_max_retries)
    }

    fn workspace_root(&self, stage: &str, cycle_index: u64) -> PathBuf {
        self.store
            .state_root()
            .join("work")
            .join(stage)
            .join(format!("cycle_{cycle_index:05}"))
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        append_experiment_log(self.store.state_root(), level, event, message);
    }
}
