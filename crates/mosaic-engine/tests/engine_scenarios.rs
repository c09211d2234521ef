//! End-to-end scheduling scenarios driven through the in-process backend
//! and the in-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mosaic_core::{TaskId, WorkflowError};
use mosaic_engine::{
    BackendJobState, ClusterBackend, Engine, InProcessBackend, MonitorOptions,
};
use mosaic_storage::{InMemoryTaskStore, TaskStore};
use mosaic_workflow::batches::{BatchIo, BatchSet, CollectBatch, IoEntry, RunBatch};
use mosaic_workflow::description::WorkflowDescription;
use mosaic_workflow::driver::{Workflow, WorkflowContext};
use mosaic_workflow::jobs::{ArgMap, JobSpec};
use mosaic_workflow::step_api::{StepApi, StepContext, StepRegistry, WorkflowTypeRegistry};
use mosaic_workflow::task::{ResourceRequest, Task, TaskState};

/// Shared journal of step-level events ("A.init", "A.run.2", "B.collect")
type Journal = Arc<Mutex<Vec<String>>>;

struct ScriptedStep {
    name: &'static str,
    n_batches: usize,
    collect: bool,
    run_delay: Duration,
    /// Step whose run outputs must exist before this step's init succeeds
    requires_outputs_of: Option<&'static str>,
    /// While set, the init phase fails
    fail_init: Arc<AtomicBool>,
    journal: Journal,
}

impl ScriptedStep {
    fn new(name: &'static str, n_batches: usize, journal: Journal) -> Self {
        Self {
            name,
            n_batches,
            collect: false,
            run_delay: Duration::ZERO,
            requires_outputs_of: None,
            fail_init: Arc::new(AtomicBool::new(false)),
            journal,
        }
    }

    fn data_dir(ctx: &StepContext, step: &str) -> std::path::PathBuf {
        ctx.workflow_root.join(format!("{step}_data"))
    }
}

#[async_trait]
impl StepApi for ScriptedStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn has_collect_phase(&self) -> bool {
        self.collect
    }

    async fn delete_previous_job_output(&self, ctx: &StepContext) -> Result<(), WorkflowError> {
        let dir = Self::data_dir(ctx, self.name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    async fn create_run_batches(
        &self,
        ctx: &StepContext,
        _batch_args: &ArgMap,
    ) -> Result<BatchSet, WorkflowError> {
        self.journal.lock().push(format!("{}.init", self.name));
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(WorkflowError::Metadata(format!(
                "upstream metadata for step \"{}\" is incomplete",
                self.name
            )));
        }
        if let Some(upstream) = self.requires_outputs_of {
            let dir = Self::data_dir(ctx, upstream);
            let produced = std::fs::read_dir(&dir)
                .map(|entries| entries.count())
                .unwrap_or(0);
            if produced == 0 {
                return Err(WorkflowError::Metadata(format!(
                    "step \"{}\" found no outputs of step \"{upstream}\"",
                    self.name
                )));
            }
        }
        let run = (1..=self.n_batches as u32)
            .map(|id| RunBatch {
                id,
                index: None,
                inputs: BatchIo::new(),
                outputs: BatchIo::from([(
                    "data".to_string(),
                    IoEntry::Paths(vec![format!("{}_data/out_{id:03}.txt", self.name)]),
                )]),
                extra: Default::default(),
            })
            .collect();
        let collect = self.collect.then(|| CollectBatch {
            inputs: BatchIo::new(),
            outputs: BatchIo::new(),
            extra: Default::default(),
        });
        Ok(BatchSet { run, collect })
    }

    async fn run_job(
        &self,
        _ctx: &StepContext,
        batch: &RunBatch,
        _assume_clean_state: bool,
    ) -> Result<(), WorkflowError> {
        self.journal
            .lock()
            .push(format!("{}.run.{}", self.name, batch.id));
        if !self.run_delay.is_zero() {
            tokio::time::sleep(self.run_delay).await;
        }
        for path in batch.outputs["data"].paths() {
            let path = std::path::Path::new(path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, b"ok")?;
        }
        Ok(())
    }

    async fn collect_job_output(
        &self,
        _ctx: &StepContext,
        _batch: &CollectBatch,
    ) -> Result<(), WorkflowError> {
        self.journal.lock().push(format!("{}.collect", self.name));
        Ok(())
    }
}

/// Backend wrapper that rewrites the exit code of selected jobs, standing
/// in for payload processes that exit non-zero on the cluster
struct RiggedBackend {
    inner: InProcessBackend,
    rigged: BTreeMap<String, i32>,
    job_names: Mutex<BTreeMap<String, String>>,
}

#[async_trait]
impl ClusterBackend for RiggedBackend {
    async fn submit(
        &self,
        spec: &JobSpec,
        resources: &ResourceRequest,
    ) -> Result<String, mosaic_engine::EngineError> {
        let handle = self.inner.submit(spec, resources).await?;
        self.job_names
            .lock()
            .insert(handle.clone(), spec.job_name());
        Ok(handle)
    }

    async fn status(&self, handle: &str) -> Result<BackendJobState, mosaic_engine::EngineError> {
        let state = self.inner.status(handle).await?;
        let job_name = self.job_names.lock().get(handle).cloned();
        if let (
            BackendJobState::Terminated { accounting, .. },
            Some(name),
        ) = (&state, job_name)
        {
            if let Some(&exitcode) = self.rigged.get(&name) {
                return Ok(BackendJobState::Terminated {
                    exitcode,
                    accounting: accounting.clone(),
                });
            }
        }
        Ok(state)
    }

    async fn cancel(&self, handle: &str) -> Result<(), mosaic_engine::EngineError> {
        self.inner.cancel(handle).await
    }
}

struct Harness {
    engine: Engine,
    store: Arc<InMemoryTaskStore>,
    ctx: WorkflowContext,
    registry: Arc<StepRegistry>,
    _workdir: tempfile::TempDir,
}

fn harness(steps: Vec<Arc<dyn StepApi>>, rigged: BTreeMap<String, i32>) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let mut registry = StepRegistry::new();
    for step in steps {
        registry.register(step);
    }
    let registry = Arc::new(registry);
    let store: Arc<InMemoryTaskStore> = Arc::new(InMemoryTaskStore::new());
    let ctx = WorkflowContext::new(registry.clone(), 1, workdir.path(), "anna");
    let backend: Arc<dyn ClusterBackend> = if rigged.is_empty() {
        Arc::new(InProcessBackend::new(registry.clone()))
    } else {
        Arc::new(RiggedBackend {
            inner: InProcessBackend::new(registry.clone()),
            rigged,
            job_names: Mutex::new(BTreeMap::new()),
        })
    };
    let engine = Engine::new(backend, store.clone(), ctx.clone());
    Harness {
        engine,
        store,
        ctx,
        registry,
        _workdir: workdir,
    }
}

async fn submit_workflow(
    harness: &mut Harness,
    description: &WorkflowDescription,
) -> (TaskId, i64) {
    let mut description = description.clone();
    description
        .validate(&harness.registry, &WorkflowTypeRegistry::new())
        .unwrap();
    let submission_id = harness
        .store
        .register_submission(1, "workflow", "anna")
        .await
        .unwrap();
    let mut workflow = Workflow::new("experiment_1", submission_id, &description, 0);
    workflow.start(&harness.ctx).unwrap();
    let mut root = Task::Workflow(workflow);
    let root_id = harness.store.save(&mut root).await.unwrap();
    harness.store.attach_root(submission_id, root_id).await.unwrap();
    harness.engine.add(root).unwrap();
    (root_id, submission_id)
}

/// Tick the engine until the root is terminal or the tick budget runs out
async fn drive(harness: &mut Harness, root_id: TaskId) -> TaskState {
    for _ in 0..400 {
        harness.engine.progress().await.unwrap();
        let state = harness.engine.root(root_id).unwrap().state();
        if state.is_terminal() {
            // One more tick to flush late accounting
            harness.engine.progress().await.unwrap();
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow did not reach a terminal state");
}

fn two_step_description(mode: &str) -> WorkflowDescription {
    let yaml = format!(
        r#"
type: custom
stages:
  - name: s1
    mode: {mode}
    steps:
      - name: A
      - name: B
"#
    );
    WorkflowDescription::from_yaml(&yaml).unwrap()
}

#[tokio::test]
async fn test_two_step_sequential_stage_succeeds() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 2, journal.clone()));
    let mut step_b = ScriptedStep::new("B", 1, journal.clone());
    step_b.requires_outputs_of = Some("A");
    let mut harness = harness(vec![step_a, Arc::new(step_b)], BTreeMap::new());

    let (root_id, submission_id) = submit_workflow(&mut harness, &two_step_description("sequential")).await;
    let state = drive(&mut harness, root_id).await;

    assert_eq!(state, TaskState::Terminated);
    assert_eq!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));

    let events = journal.lock().clone();
    let runs: Vec<_> = events.iter().filter(|e| e.contains(".run.")).collect();
    assert_eq!(runs.len(), 3);
    // B's init observed A's outputs, so it must come after all A runs
    let b_init = events.iter().position(|e| e == "B.init").unwrap();
    let last_a_run = events
        .iter()
        .rposition(|e| e.starts_with("A.run."))
        .unwrap();
    assert!(b_init > last_a_run);

    // The persisted tree agrees and belongs to the submission
    let submission = harness.store.get_submission(submission_id).await.unwrap();
    assert_eq!(submission.top_task_id, Some(root_id));
    let loaded = harness.store.load(root_id).await.unwrap();
    assert!(loaded.is_terminated());
    assert_eq!(loaded.exitcode(), Some(0));
}

#[tokio::test]
async fn test_abort_on_error_in_sequential_stage() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 2, journal.clone()));
    let mut step_b = ScriptedStep::new("B", 1, journal.clone());
    step_b.requires_outputs_of = Some("A");
    let rigged = BTreeMap::from([("A_run_000002".to_string(), 5)]);
    let mut harness = harness(vec![step_a, Arc::new(step_b)], rigged);

    let (root_id, _) = submit_workflow(&mut harness, &two_step_description("sequential")).await;
    let state = drive(&mut harness, root_id).await;

    assert_eq!(state, TaskState::Terminated);
    assert_eq!(harness.engine.root(root_id).unwrap().exitcode(), Some(5));

    // B's init never ran
    assert!(!journal.lock().iter().any(|e| e == "B.init"));

    // The snapshot lists A.run#2 as the only failed leaf
    let snapshot = harness.store.task_status(root_id, usize::MAX).await.unwrap();
    let failed = snapshot.failed_leaves();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "A_run_000002");
    assert_eq!(failed[0].exitcode, Some(5));

    // Stage and workflow both carry the failing return code
    let loaded = harness.store.load(root_id).await.unwrap();
    let stage = &loaded.children().unwrap()[0];
    assert_eq!(stage.exitcode(), Some(5));
}

#[tokio::test]
async fn test_parallel_stage_runs_steps_concurrently() {
    let journal: Journal = Default::default();
    let mut step_a = ScriptedStep::new("A", 1, journal.clone());
    step_a.run_delay = Duration::from_millis(50);
    let mut step_b = ScriptedStep::new("B", 1, journal.clone());
    step_b.run_delay = Duration::from_millis(50);
    let mut harness = harness(vec![Arc::new(step_a), Arc::new(step_b)], BTreeMap::new());

    let (root_id, _) = submit_workflow(&mut harness, &two_step_description("parallel")).await;

    // After the first tick both init jobs are submitted, neither terminated
    harness.engine.progress().await.unwrap();
    let root = harness.engine.root(root_id).unwrap();
    let stage = &root.children().unwrap()[0];
    let init_states: Vec<TaskState> = stage
        .children()
        .unwrap()
        .iter()
        .map(|step| step.children().unwrap()[0].state())
        .collect();
    assert_eq!(init_states, vec![TaskState::Submitted, TaskState::Submitted]);

    let state = drive(&mut harness, root_id).await;
    assert_eq!(state, TaskState::Terminated);
    assert_eq!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));
    assert_eq!(
        journal.lock().iter().filter(|e| e.contains(".run.")).count(),
        2
    );
}

#[tokio::test]
async fn test_resubmit_stage_reuses_completed_step() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 2, journal.clone()));
    let mut step_b = ScriptedStep::new("B", 1, journal.clone());
    step_b.requires_outputs_of = Some("A");
    let fail_b = step_b.fail_init.clone();
    fail_b.store(true, Ordering::SeqCst);
    let mut harness = harness(vec![step_a, Arc::new(step_b)], BTreeMap::new());

    let description = two_step_description("sequential");
    let (root_id, _) = submit_workflow(&mut harness, &description).await;
    let state = drive(&mut harness, root_id).await;
    assert_eq!(state, TaskState::Terminated);
    assert_ne!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));

    // Remember the identities of A's finished run jobs
    let first_tree = harness.store.load(root_id).await.unwrap();
    let stage = &first_tree.children().unwrap()[0];
    let step_a_task = &stage.children().unwrap()[0];
    let a_run_ids: Vec<_> = step_a_task.children().unwrap()[1]
        .children()
        .unwrap()
        .iter()
        .map(|t| t.data().persistent_id)
        .collect();
    assert!(!a_run_ids.is_empty());

    // "Fix" step B, reload the persisted tree and resubmit at stage s1
    fail_b.store(false, Ordering::SeqCst);
    harness.engine.remove(root_id);
    let mut validated = description.clone();
    validated
        .validate(&harness.registry, &WorkflowTypeRegistry::new())
        .unwrap();
    let mut loaded = harness.store.load(root_id).await.unwrap();
    let Task::Workflow(workflow) = &mut loaded else {
        panic!("root is not a workflow");
    };
    workflow.update_description(&validated);
    let index = workflow.stage_index("s1").unwrap();
    workflow.update_stage(index, &harness.ctx).unwrap();
    harness.store.save(&mut loaded).await.unwrap();
    harness.engine.add(loaded).unwrap();
    harness.engine.redo(root_id, index).await.unwrap();

    let state = drive(&mut harness, root_id).await;
    assert_eq!(state, TaskState::Terminated);
    assert_eq!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));

    // A was executed exactly once across both runs, with the same task ids
    let events = journal.lock().clone();
    assert_eq!(events.iter().filter(|e| *e == "A.init").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "B.init").count(), 2);

    let second_tree = harness.store.load(root_id).await.unwrap();
    let stage = &second_tree.children().unwrap()[0];
    let step_a_task = &stage.children().unwrap()[0];
    let a_run_ids_after: Vec<_> = step_a_task.children().unwrap()[1]
        .children()
        .unwrap()
        .iter()
        .map(|t| t.data().persistent_id)
        .collect();
    assert_eq!(a_run_ids, a_run_ids_after);
    assert!(step_a_task.is_terminated());
    assert_eq!(step_a_task.exitcode(), Some(0));
}

#[tokio::test]
async fn test_user_cancellation_stops_all_leaves() {
    let journal: Journal = Default::default();
    let mut step_a = ScriptedStep::new("A", 2, journal.clone());
    step_a.run_delay = Duration::from_secs(30);
    let mut harness = harness(vec![Arc::new(step_a)], BTreeMap::new());

    let yaml = r#"
type: custom
stages:
  - name: s1
    mode: sequential
    steps:
      - name: A
"#;
    let description = WorkflowDescription::from_yaml(yaml).unwrap();
    let (root_id, _) = submit_workflow(&mut harness, &description).await;

    // Drive until both run jobs are in flight
    let mut in_flight = false;
    for _ in 0..100 {
        harness.engine.progress().await.unwrap();
        let runs = journal.lock().iter().filter(|e| e.contains(".run.")).count();
        if runs == 2 {
            in_flight = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(in_flight, "run jobs never started");

    harness.engine.kill(root_id).await.unwrap();
    let mut state = TaskState::Running;
    for _ in 0..100 {
        harness.engine.progress().await.unwrap();
        state = harness.engine.root(root_id).unwrap().state();
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, TaskState::Stopped);
    assert_ne!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));

    // Every leaf reached a terminal state
    let snapshot = harness.store.task_status(root_id, usize::MAX).await.unwrap();
    assert!(snapshot.state_counts.get("RUNNING").is_none());
    assert!(snapshot.state_counts.get("SUBMITTED").is_none());
}

#[tokio::test]
async fn test_inactive_step_is_never_created() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 1, journal.clone()));
    let step_b = Arc::new(ScriptedStep::new("B", 1, journal.clone()));
    let mut harness = harness(vec![step_a, step_b], BTreeMap::new());

    let yaml = r#"
type: custom
stages:
  - name: s1
    mode: sequential
    steps:
      - name: A
      - name: B
        active: false
"#;
    let description = WorkflowDescription::from_yaml(yaml).unwrap();
    let (root_id, _) = submit_workflow(&mut harness, &description).await;

    let root = harness.engine.root(root_id).unwrap();
    let Task::Workflow(workflow) = root else {
        panic!("root is not a workflow");
    };
    assert_eq!(workflow.description.stages[0].steps.len(), 1);

    let state = drive(&mut harness, root_id).await;
    assert_eq!(state, TaskState::Terminated);
    assert!(!journal.lock().iter().any(|e| e.starts_with("B.")));

    // No task of step B was ever persisted
    let snapshot = harness.store.task_status(root_id, usize::MAX).await.unwrap();
    let mut names = Vec::new();
    fn collect_names(node: &mosaic_workflow::snapshot::TaskStatus, out: &mut Vec<String>) {
        out.push(node.name.clone());
        for child in &node.subtasks {
            collect_names(child, out);
        }
    }
    collect_names(&snapshot, &mut names);
    assert!(names.iter().all(|name| !name.starts_with('B')));
}

#[tokio::test]
async fn test_empty_workflow_terminates_immediately() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 1, journal.clone()));
    let mut harness = harness(vec![step_a], BTreeMap::new());

    let yaml = r#"
type: custom
stages:
  - name: s1
    active: false
    mode: sequential
    steps:
      - name: A
"#;
    let description = WorkflowDescription::from_yaml(yaml).unwrap();
    let (root_id, _) = submit_workflow(&mut harness, &description).await;

    harness.engine.progress().await.unwrap();
    let root = harness.engine.root(root_id).unwrap();
    assert_eq!(root.state(), TaskState::Terminated);
    assert_eq!(root.exitcode(), Some(0));
}

#[tokio::test]
async fn test_step_with_collect_phase_runs_it_last() {
    let journal: Journal = Default::default();
    let mut step_a = ScriptedStep::new("A", 2, journal.clone());
    step_a.collect = true;
    let mut harness = harness(vec![Arc::new(step_a)], BTreeMap::new());

    let yaml = r#"
type: custom
stages:
  - name: s1
    mode: sequential
    steps:
      - name: A
"#;
    let description = WorkflowDescription::from_yaml(yaml).unwrap();
    let (root_id, _) = submit_workflow(&mut harness, &description).await;
    let state = drive(&mut harness, root_id).await;

    assert_eq!(state, TaskState::Terminated);
    assert_eq!(harness.engine.root(root_id).unwrap().exitcode(), Some(0));
    let events = journal.lock().clone();
    let collect = events.iter().position(|e| e == "A.collect").unwrap();
    let last_run = events.iter().rposition(|e| e.starts_with("A.run.")).unwrap();
    assert!(collect > last_run);
}

#[tokio::test]
async fn test_monitor_loop_runs_submission_to_completion() {
    let journal: Journal = Default::default();
    let step_a = Arc::new(ScriptedStep::new("A", 1, journal.clone()));
    let mut harness = harness(vec![step_a], BTreeMap::new());

    let yaml = r#"
type: custom
stages:
  - name: s1
    mode: sequential
    steps:
      - name: A
"#;
    let description = WorkflowDescription::from_yaml(yaml).unwrap();
    let (root_id, _) = submit_workflow(&mut harness, &description).await;
    let root = harness.engine.remove(root_id).unwrap();

    let options = MonitorOptions {
        interval: Duration::from_millis(10),
        depth: 2,
    };
    let snapshot =
        mosaic_engine::submit_and_monitor(&mut harness.engine, root, 0, &options)
            .await
            .unwrap();
    assert_eq!(snapshot.state, TaskState::Terminated);
    assert_eq!(snapshot.exitcode, Some(0));
    assert!(snapshot.failed_leaves().is_empty());
}
