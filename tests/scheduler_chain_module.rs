use dacycle::adapter::{
    ArtifactRef, CancelToken, CycleContext, RunOutcome, StageAdapter, StageFailure, StageOutputs,
    Workspace,
};
use dacycle::checkpoint::StageStatus;
use dacycle::config::ExperimentConfig;
use dacycle::experiment::Experiment;
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

    fn position(&self, entry: &str) -> usize {
        self.snapshot()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("event `{entry}` not recorded"))
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
        self.log
            .push(format!("post:{}:c{}", self.stage, self.cycle_index));
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

fn config(end_time: &str) -> ExperimentConfig {
    ExperimentConfig {
        name: "chain".to_string(),
        start_time: "2020-01-01T00:00".to_string(),
        end_time: end_time.to_string(),
        cycle_length: "12h".to_string(),
        abort_on_failure: false,
        max_retries: 0,
        max_parallel_stages: 4,
        state_root: None,
        stages: Vec::new(),
    }
}

fn chain_registry(log: &EventLog, failures: &Arc<Mutex<BTreeMap<String, u32>>>) -> StageRegistry {
    let factory: Arc<dyn AdapterFactory> = Arc::new(ScriptedFactory {
        log: log.clone(),
        failures: failures.clone(),
    });
    let mut registry = StageRegistry::new();
    registry
        .register("a", None, factory.clone(), serde_yaml::Value::Null)
        .expect("register a");
    registry
        .register("b", Some("a"), factory.clone(), serde_yaml::Value::Null)
        .expect("register b");
    registry
        .register("c", Some("b"), factory, serde_yaml::Value::Null)
        .expect("register c");
    registry
}

#[test]
fn chain_runs_parent_before_child_in_every_cycle() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::new()));
    let registry = chain_registry(&log, &failures);

    let experiment = Experiment::new(
        config("2020-01-02T00:00"),
        registry,
        temp.path().join("state"),
    );
    let outcome = experiment.run().expect("experiment succeeds");
    assert_eq!(outcome.cycles.len(), 2);
    assert!(outcome.fully_succeeded());

    for cycle in 0..2u64 {
        let a_done = log.position(&format!("post:a:c{cycle}"));
        let b_started = log.snapshot()
            .iter()
            .position(|e| e.starts_with(&format!("prepare:b:c{cycle}")))
            .expect("b prepared");
        let b_done = log.position(&format!("post:b:c{cycle}"));
        let c_started = log.snapshot()
            .iter()
            .position(|e| e.starts_with(&format!("prepare:c:c{cycle}")))
            .expect("c prepared");
        assert!(a_done < b_started, "cycle {cycle}: a must finish before b");
        assert!(b_done < c_started, "cycle {cycle}: b must finish before c");
    }
}

#[test]
fn restart_state_is_the_stage_own_previous_output() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::new()));
    let registry = chain_registry(&log, &failures);

    Experiment::new(
        config("2020-01-02T00:00"),
        registry,
        temp.path().join("state"),
    )
    .run()
    .expect("experiment succeeds");

    let events = log.snapshot();
    assert!(events.contains(&"prepare:a:c0:restart=none".to_string()));
    assert!(events.contains(&"prepare:a:c1:restart=a-c0".to_string()));
    assert!(events.contains(&"prepare:b:c1:restart=b-c0".to_string()));
    assert!(events.contains(&"prepare:c:c1:restart=c-c0".to_string()));
}

#[test]
fn checkpoint_records_every_stage_succeeded_with_artifacts() {
    let temp = tempdir().expect("tempdir");
    let log = EventLog::default();
    let failures = Arc::new(Mutex::new(BTreeMap::new()));
    let registry = chain_registry(&log, &failures);

    let experiment = Experiment::new(
        config("2020-01-02T00:00"),
        registry,
        temp.path().join("state"),
    );
    experiment.run().expect("experiment succeeds");

    for cycle in 0..2u64 {
        for stage in ["a", "b", "c"] {
            let record = experiment
                .store()
                .load_stage_run(cycle, stage)
                .expect("load record")
                .expect("record exists");
            assert_eq!(record.status, StageStatus::Succeeded);
            assert_eq!(
                record.artifact.expect("artifact").as_str(),
                format!("{stage}-c{cycle}")
            );
        }
    }
    let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    assert_eq!(
        experiment
            .store()
            .last_checkpointed_cycle(&names)
            .expect("checkpoint"),
        Some(1)
    );
}
