use dacycle::adapter::{
    ArtifactRef, CancelToken, CycleContext, RunOutcome, StageAdapter, StageFailure, StageOutputs,
    Workspace,
};
use dacycle::checkpoint::StageStatus;
use dacycle::config::ExperimentConfig;
use dacycle::experiment::{Experiment, ExperimentError};
use dacycle::registry::{AdapterFactory, StageRegistry};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn push(&self, entry: String) {
        self.0.lock().expect("event log").push(entry);
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().expect("event log").clone()
    }

    fn count_prefix(&self, prefix: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct ScriptedAdapter {
    stage: String,
    log: EventLog,
    failures: Arc<Mutex<BTreeMap<String, u32>>>,
    cycle_index: u64,
}

impl StageAdapter for ScriptedAdapter {
    fn prepare(&mut self, context: &CycleContext) -> Result<Workspace, StageFailure> {
        self.cycle_index = context.cycle_index;
        let restart = context
            .restart_artifact
            .as_ref()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.log.push(format!(
            "prepare:{}:c{}:restart={restart}",
            self.stage, context.cycle_index
        ));
        Ok(Workspace {
            root: context.workspace_root.clone(),
            member_dirs: Vec::new(),
        })
    }

    fn run(&mut self, _workspace: &Workspace, _cancel: &CancelToken) -> RunOutcome {
        let mut failures = self.failures.lock().expect("failures");
        if let Some(remaining) = failures.get_mut(&self.stage) {
            if *remaining > 0 {
                *remaining -= 1;
                self.log
                    .push(format!("run_failed:{}:c{}", self.stage, self.cycle_index));
                return RunOutcome::Failed("scripted failure".to_string());
            }
        }
        self.log
            .push(format!("run:{}:c{}", self.stage, self.cycle_index));
        RunOutcome::Succeeded(StageOutputs::new())
    }

    fn postprocess(&mut self, _outputs: StageOutputs) -> Result<ArtifactRef, StageFailure> {
        Ok(ArtifactRef::new(format!(
            "{}-c{}",
            self.stage, self.cycle_index
        )))
    }
}

struct ScriptedFactory {
    log: EventLog,
    failures: Arc<Mutex<BTreeMap<String, u32>>>,
}

impl AdapterFactory for ScriptedFactory {
    fn create(
        &self,
        stage: &str,
        _config: &serde_yaml::Value,
    ) -> Result<Box<dyn StageAdapter>, StageFailure> {
        Ok(Box::new(ScriptedAdapter {
            stage: stage.to_string(),
            log: self.log.clone(),
            failures: self.failures.clone(),
            cycle_index: 0,
        }))
    }
}

fn config(abort_on_failure: bool) -> ExperimentConfig {
    ExperimentConfig {
        name: "failures".to_string(),
        start_time: "2020-01-01T00:00".to_string(),
        end_time: "2020-01-02T00:00".to_string(),
        cycle_length: "12h".to_string(),
        abort_on_failure,
        max_retries: 0,
        max_parallel_stages: 4,
        state_root: None,
        stages: Vec::new(),
    }
}

fn chain_registry(
    log: &EventLog,
    failures: &Arc<Mutex<BTreeMap<String, u32>>>,
    b_retry_budget: Option<u32>,
) -> StageRegistry {
    let factory: Arc<dyn AdapterFactory> = Arc::new(ScriptedFactory {
        log: log.clone(),
        failures: failures.clone(),
    });
    let mut registry = StageRegistry::new();
    registry
        .register("a", None, factory.clone(), serde_yaml::Value::Null)
        .expect("register a");
    registry
        .register_with_retry_budget(
            "b",
            Some("a"),
            factory.clone(),
            serde_yaml::Value::Null,
            b_retry_budget,
        )
        .expect("register b");
    registry
        .register("c", Some("b"), factory, serde_yaml::Value::Null)
        .expect("register c");
    registry
}

#[test]
fn exhausted_stage_aborts_its_descendants_without_running_them() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::from([("b".to_string(), u32::MAX)])));
    let registry = chain_registry(&log, &failures, None);

    let experiment = Experiment::new(config(false), registry, temp.path().join("state"));
    let err = experiment.run().expect_err("must report aborted runs");
    let ExperimentError::PartialFailure { aborted } = err else {
        panic!("expected partial failure, got {err}");
    };
    assert_eq!(
        aborted,
        vec![
            (0, "b".to_string()),
            (0, "c".to_string()),
            (1, "b".to_string()),
            (1, "c".to_string()),
        ]
    );

    // `c` never reached prepare; `a` still ran both cycles.
    assert_eq!(log.count_prefix("prepare:c:"), 0);
    assert_eq!(log.count_prefix("run:a:"), 2);

    for cycle in 0..2u64 {
        let b = experiment
            .store()
            .load_stage_run(cycle, "b")
            .expect("load b")
            .expect("record b");
        assert_eq!(b.status, StageStatus::Aborted);
        assert!(b.error.expect("error").contains("scripted failure"));

        let c = experiment
            .store()
            .load_stage_run(cycle, "c")
            .expect("load c")
            .expect("record c");
        assert_eq!(c.status, StageStatus::Aborted);
        assert!(c.error.expect("error").contains("ancestor stage `b`"));

        let a = experiment
            .store()
            .load_stage_run(cycle, "a")
            .expect("load a")
            .expect("record a");
        assert_eq!(a.status, StageStatus::Succeeded);
    }

    // An unaffected branch restarts from its own prior output even when
    // a sibling chain is down.
    assert!(log
        .snapshot()
        .contains(&"prepare:a:c1:restart=a-c0".to_string()));
}

#[test]
fn abort_on_failure_stops_the_run_in_the_failing_cycle() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::from([("b".to_string(), u32::MAX)])));
    let registry = chain_registry(&log, &failures, None);

    let experiment = Experiment::new(config(true), registry, temp.path().join("state"));
    let err = experiment.run().expect_err("must abort");
    match err {
        ExperimentError::Aborted { cycle_index, stage } => {
            assert_eq!(cycle_index, 0);
            assert_eq!(stage, "b");
        }
        other => panic!("expected abort, got {other}"),
    }

    // Cycle 1 never started.
    assert_eq!(log.count_prefix("prepare:a:c1"), 0);
    assert!(experiment
        .store()
        .load_stage_run(1, "a")
        .expect("load")
        .is_none());
}

#[test]
fn failed_stage_is_retried_within_its_budget() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::from([("b".to_string(), 1)])));
    let registry = chain_registry(&log, &failures, Some(2));

    let experiment = Experiment::new(config(false), registry, temp.path().join("state"));
    let outcome = experiment.run().expect("retry must recover");
    assert!(outcome.fully_succeeded());

    // One failed attempt, then a second prepare for the retry.
    assert_eq!(log.count_prefix("run_failed:b:c0"), 1);
    assert_eq!(log.count_prefix("prepare:b:c0"), 2);

    let b = experiment
        .store()
        .load_stage_run(0, "b")
        .expect("load b")
        .expect("record b");
    assert_eq!(b.status, StageStatus::Succeeded);
    assert_eq!(b.retry_count, 1);
}

#[test]
fn budget_of_zero_means_a_single_attempt() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::from([("b".to_string(), 1)])));
    let registry = chain_registry(&log, &failures, Some(0));

    let experiment = Experiment::new(config(false), registry, temp.path().join("state"));
    let err = experiment.run().expect_err("no retry allowed");
    assert!(matches!(err, ExperimentError::PartialFailure { .. }));
    assert_eq!(log.count_prefix("prepare:b:c0"), 1);
}
