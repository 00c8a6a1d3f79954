//! Pipeline controller.
//!
//! Walks the enabled stages in dependency order. For each stage it resolves
//! the input checkpoint, expands the stage plan into steps, and drives every
//! step through the dispatcher. Once the last step has finished it commits a
//! checkpoint. The controller owns no hidden progress: everything it knows is
//! in the [`PipelineState`] passed to [`PipelineController::run`], which is
//! persisted after every step and handed back in the [`RunReport`].
//!
//! ```text
//! run ─▶ next_runnable ─▶ run_stage ─▶ plan items ─▶ run_step ─▶ dispatch
//!             ▲               │                          │
//!             │               ▼                          ▼
//!             └──────── seal + commit           record + persist state
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use forge_store::{write_atomic, CheckpointStore, PipelineState};
use forge_types::task::ShardRef;
use forge_types::{ModelCheckpoint, PipelineConfig, StageName, TaskInputs, TaskOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::convergence::{Decision, IterationRecord};
use crate::dispatcher::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::graph::StageGraph;
use crate::plan::{ConcreteStep, Phase, PlanItem, StagePlan, StepShape};
use crate::splitter::{Corpus, JobSplitter, ShardPlan};
use crate::status::ControllerState;

/// Final state record plus how the run ended.
#[derive(Debug)]
pub struct RunReport {
    pub state: PipelineState,
    pub outcome: ControllerState,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ControllerState::PipelineComplete
    }
}

/// Outputs of one finished step.
#[derive(Debug, Clone)]
struct StepResult {
    /// What the next step of the stage reads.
    output: PathBuf,
    /// `(task_id, artifact)` of every task of the step.
    artifacts: Vec<(String, PathBuf)>,
}

/// Set up the experiment directory for a run and return the state to run
/// from.
///
/// A fresh run with `clean` enabled wipes the directory first; `resume`
/// loads the persisted state record. The effective configuration is copied
/// to `<exp>/config.toml` either way.
pub fn prepare_experiment(config: &PipelineConfig, resume: bool) -> Result<PipelineState> {
    let exp = config.exp_dir();
    if !resume && config.train_pipeline.clean && exp.exists() {
        info!(exp = %exp.display(), "cleaning experiment directory");
        fs::remove_dir_all(exp)?;
    }
    fs::create_dir_all(exp)?;
    write_atomic(&exp.join("config.toml"), config.to_toml()?.as_bytes())?;

    if !resume {
        return Ok(PipelineState::new());
    }
    match PipelineState::load(&config.state_path())? {
        Some(state) => {
            info!(
                completed = state.completed.len(),
                last = ?state.last_completed,
                "resuming from saved state"
            );
            Ok(state)
        }
        None => {
            info!("no saved state, starting fresh");
            Ok(PipelineState::new())
        }
    }
}

pub struct PipelineController {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<dyn Dispatcher>,
    graph: StageGraph,
    store: CheckpointStore,
    splitter: JobSplitter,
    shards: Vec<ShardRef>,
}

impl PipelineController {
    /// Build the stage graph, open the checkpoint store and shard the corpus.
    pub fn new(config: Arc<PipelineConfig>, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let graph = StageGraph::from_config(&config)?;
        let store = CheckpointStore::new(config.checkpoint_dir())?;
        let corpus = match &config.common.setup {
            Some(setup) => Corpus::load(setup)?,
            None => Corpus::default(),
        };
        let shards = ShardPlan::new(&corpus, config.settings.jobs).materialize(&config.shard_dir())?;
        info!(
            utterances = corpus.len(),
            shards = shards.len(),
            mode = dispatcher.mode(),
            "controller ready"
        );
        Ok(Self {
            splitter: JobSplitter::new(config.work_dir()),
            config,
            dispatcher,
            graph,
            store,
            shards,
        })
    }

    /// Run every enabled, incomplete stage.
    ///
    /// Configuration problems are returned as `Err` before anything runs. A
    /// stage failure or cancellation is not an `Err`: the report's outcome is
    /// `Failed` and its state reflects the last fully completed stage.
    pub async fn run(&self, mut state: PipelineState, cancel: CancellationToken) -> Result<RunReport> {
        let order = self.graph.enabled_stages(&state.completed_set())?;
        let pending: Vec<StageName> = order
            .iter()
            .map(|s| s.name)
            .filter(|n| !state.is_complete(*n))
            .collect();
        info!(stages = ?pending, "pipeline run starting");

        let mut status = ControllerState::NotStarted;
        while let Some(stage) = self.graph.next_runnable(&state.completed_set()) {
            let name = stage.name;
            status.start_stage(name)?;
            info!(stage = %name, "{} started", name.banner());

            match self.run_stage(name, &mut state, &cancel).await {
                Ok(()) => {
                    status.complete_stage(name)?;
                    info!(stage = %name, "{} finished", name.banner());
                }
                Err(e) => {
                    let reason = failure_reason(&e);
                    error!(stage = %name, reason = %reason, "stage failed");
                    state.record_failure(name, &reason);
                    state.save(&self.config.state_path())?;
                    status.fail(name, &reason)?;
                    return Ok(RunReport { state, outcome: status });
                }
            }
        }

        status.finish()?;
        info!(completed = state.completed.len(), "pipeline complete");
        Ok(RunReport { state, outcome: status })
    }

    async fn run_stage(
        &self,
        name: StageName,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let checkpoint = self.input_checkpoint(name, state)?;
        let input_mixtures = checkpoint.as_ref().map_or(1, |c| c.mixtures);
        let input_version = checkpoint.as_ref().map(|c| c.version);
        let plan = StagePlan::build(name, &self.config, input_mixtures);
        debug!(stage = %name, steps = plan.step_count(), input_version = ?input_version, "stage plan built");

        state.begin_stage(name);
        state.save(&self.config.state_path())?;

        let base = TaskInputs {
            checkpoint,
            ..TaskInputs::default()
        };
        let mut last: Option<StepResult> = None;

        for item in &plan.items {
            match item {
                PlanItem::Step(spec) => {
                    let step = ConcreteStep::from_spec(spec);
                    let result = self.run_step(name, &step, &base, last.as_ref(), state, cancel).await?;
                    last = Some(result);
                }
                PlanItem::Iterate(phase) => {
                    if let Some(result) = self.run_phase(name, phase, &base, last.clone(), state, cancel).await? {
                        last = Some(result);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let last = last.ok_or_else(|| {
            PipelineError::Configuration(format!("stage {name} has no steps to run"))
        })?;

        let sealed = self.store.seal(
            name,
            last.output.clone(),
            plan.output_mixtures,
            input_version,
            &last.artifacts,
        )?;
        let path = self.store.commit(&sealed)?;
        state.complete_stage(name, path, sealed.version);
        state.save(&self.config.state_path())?;
        Ok(())
    }

    /// Run iterations until the tracker stops. `None` if the phase is empty.
    async fn run_phase(
        &self,
        name: StageName,
        phase: &Phase,
        base: &TaskInputs,
        mut last: Option<StepResult>,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<Option<StepResult>> {
        let tracker = phase.tracker();
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut ran = false;

        while let Decision::Continue {
            target_mixtures,
            iteration,
            mixup,
        } = tracker.next_iteration(&history)
        {
            if mixup {
                let step = ConcreteStep::mixup(phase, target_mixtures);
                last = Some(self.run_step(name, &step, base, last.as_ref(), state, cancel).await?);
            }
            let accumulate = ConcreteStep::accumulate(phase, target_mixtures, iteration);
            let accumulated = self
                .run_step(name, &accumulate, base, last.as_ref(), state, cancel)
                .await?;
            let update = ConcreteStep::update(phase, target_mixtures, iteration);
            last = Some(
                self.run_step(name, &update, base, Some(&accumulated), state, cancel)
                    .await?,
            );
            ran = true;
            history.push(IterationRecord {
                mixtures: target_mixtures,
                iteration,
                succeeded: true,
            });
        }

        debug!(stage = %name, phase = phase.name, iterations = history.len(), "phase finished");
        Ok(if ran { last } else { None })
    }

    /// Split, skip already finished tasks, dispatch the rest and persist.
    async fn run_step(
        &self,
        name: StageName,
        step: &ConcreteStep,
        base: &TaskInputs,
        previous: Option<&StepResult>,
        state: &mut PipelineState,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut inputs = base.clone();
        inputs.previous = previous.map(|p| p.output.clone());
        if step.uses_question_set {
            inputs.question_set = self.config.common.tree_questions.clone();
        }

        let tasks = self.splitter.split(name, step, &self.shards, &inputs);
        let artifacts: Vec<(String, PathBuf)> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.output.clone()))
            .collect();
        let output = match (step.shape, artifacts.as_slice()) {
            (StepShape::Single, [(_, out)]) => out.clone(),
            _ => self.splitter.step_dir(name, step),
        };
        let result = StepResult { output, artifacts };

        let total = tasks.len();
        let pending: Vec<_> = tasks
            .into_iter()
            .filter(|t| !state.is_task_done(name, &t.id))
            .collect();
        if pending.is_empty() {
            debug!(stage = %name, step = %step.key, tasks = total, "step already done");
            return Ok(result);
        }
        info!(
            stage = %name,
            step = %step.key,
            tasks = pending.len(),
            skipped = total - pending.len(),
            "dispatching step"
        );

        let outcomes = self.dispatcher.dispatch(pending, cancel).await;
        state.record_tasks(
            name,
            outcomes
                .iter()
                .filter(|o| o.is_success())
                .map(|o| o.task_id().to_string()),
        );
        state.save(&self.config.state_path())?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(TaskOutcome::Failed { task_id, error, .. }) =
            outcomes.into_iter().find(|o| !o.is_success())
        {
            return Err(PipelineError::StageFailure {
                stage: name,
                task_id,
                detail: error,
            });
        }
        Ok(result)
    }

    /// Load and verify the checkpoint `name` consumes, if it consumes one.
    fn input_checkpoint(
        &self,
        name: StageName,
        state: &PipelineState,
    ) -> Result<Option<Arc<ModelCheckpoint>>> {
        let Some(input) = self.graph.input_for(name, &state.completed_set()) else {
            return Ok(None);
        };
        let record = state.record(input).ok_or_else(|| {
            PipelineError::Configuration(format!("stage {input} has no completion record"))
        })?;
        let checkpoint = CheckpointStore::load_verified(&record.checkpoint)?;
        debug!(stage = %name, input = %input, version = checkpoint.version, "input checkpoint loaded");
        Ok(Some(Arc::new(checkpoint)))
    }
}

fn failure_reason(e: &PipelineError) -> String {
    match e {
        PipelineError::Cancelled => "cancelled".into(),
        PipelineError::StageFailure { task_id, detail, .. } => format!("task {task_id}: {detail}"),
        other => other.to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use forge_types::Task;

    use super::*;
    use crate::dispatcher::RetryPolicy;
    use crate::local::LocalDispatcher;
    use crate::remote::tests::spawn_worker;
    use crate::remote::{JobQueue, RemoteDispatcher, RemoteTimings, SpoolQueue};
    use crate::runner::{DryRunRunner, TaskRunner};
    use crate::transport::{TaskReceipt, TaskTicket};

    /// Dry-run runner that logs every attempt, fails ids containing `fail_on`
    /// and cancels the run when it meets an id starting with `cancel_on`.
    #[derive(Default)]
    struct Scripted {
        seen: Mutex<Vec<String>>,
        fail_on: Option<String>,
        cancel_on: Option<String>,
    }

    impl Scripted {
        fn failing(id: &str) -> Self {
            Self { fail_on: Some(id.into()), ..Self::default() }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for Scripted {
        async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<PathBuf> {
            self.seen.lock().unwrap().push(task.id.clone());
            if self.cancel_on.as_deref().is_some_and(|p| task.id.starts_with(p)) {
                cancel.cancel();
                return Err(PipelineError::Cancelled);
            }
            if self.fail_on.as_deref().is_some_and(|f| task.id.contains(f)) {
                return Err(PipelineError::TaskExecution {
                    task_id: task.id.clone(),
                    detail: "scripted failure".into(),
                });
            }
            DryRunRunner.run(task, cancel).await
        }
    }

    fn config(dir: &Path, stages: &[&str]) -> Arc<PipelineConfig> {
        let setup = dir.join("train.setup");
        let lines: String = (0..40)
            .map(|i| format!("utt{i:03}.wav utt{i:03}.cfg word{i}\n"))
            .collect();
        fs::write(&setup, lines).unwrap();

        let flags: String = stages.iter().map(|s| format!("{s} = 1\n")).collect();
        let text = format!(
            r#"
[common]
exp = "{exp}"
setup = "{setup}"
tree_questions = "{questions}"

[settings]
local = 1
jobs = 2
retries = 1

[train_params]
initial_mono_iters = 1
mono_iters = 2
initial_tri_iters = 1
tri_iters = 1
tri_mixup_schedule = "2_4"
tri_iters_per_split = 1

[train_pipeline]
{flags}"#,
            exp = dir.join("exp").display(),
            setup = setup.display(),
            questions = dir.join("tree.hed").display(),
        );
        Arc::new(PipelineConfig::from_toml_str(&text).unwrap())
    }

    fn controller(config: &Arc<PipelineConfig>, runner: Arc<Scripted>) -> PipelineController {
        let policy = RetryPolicy {
            max_retries: config.settings.retries,
            slot_timeout: Duration::from_secs(5),
        };
        let dispatcher = Arc::new(LocalDispatcher::new(runner, config.settings.jobs, policy));
        PipelineController::new(config.clone(), dispatcher).unwrap()
    }

    fn remote_controller(config: &Arc<PipelineConfig>, queue: Arc<SpoolQueue>) -> PipelineController {
        let policy = RetryPolicy {
            max_retries: config.settings.retries,
            slot_timeout: Duration::from_secs(5),
        };
        let timings = RemoteTimings {
            task_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(5),
        };
        let queue: Arc<dyn JobQueue> = queue;
        let dispatcher = Arc::new(RemoteDispatcher::new(queue, config.settings.jobs, policy, timings));
        PipelineController::new(config.clone(), dispatcher).unwrap()
    }

    /// Worker answer that records the ticket and fails ids containing `fail_on`.
    fn cluster_answer(
        seen: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    ) -> impl Fn(&TaskTicket) -> TaskReceipt + Send + 'static {
        move |ticket| {
            seen.lock().unwrap().push(ticket.task_id.clone());
            if fail_on.is_some_and(|f| ticket.task_id.contains(f)) {
                return TaskReceipt::failed(ticket, "node lost");
            }
            fs::create_dir_all(&ticket.output).unwrap();
            fs::write(ticket.output.join("DONE"), &ticket.task_id).unwrap();
            TaskReceipt::succeeded(ticket, ticket.output.clone())
        }
    }

    #[tokio::test]
    async fn coding_through_diag_completes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start", "mono_to_tri", "diag"]);
        let runner = Arc::new(Scripted::default());
        let state = prepare_experiment(&config, false).unwrap();

        let report = controller(&config, runner.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.succeeded());
        let done: Vec<StageName> = report.state.completed.keys().copied().collect();
        assert_eq!(
            done,
            vec![StageName::Coding, StageName::FlatStart, StageName::MonoToTri, StageName::Diag]
        );
        assert_eq!(report.state.record(StageName::Diag).unwrap().version, 4);

        let store = CheckpointStore::new(config.checkpoint_dir()).unwrap();
        let current = store.current().unwrap().unwrap();
        assert_eq!(current.stage, StageName::Diag);
        assert_eq!(current.input_version, Some(3));

        let on_disk = PipelineState::load(&config.state_path()).unwrap().unwrap();
        assert_eq!(on_disk, report.state);
        assert!(config.exp_dir().join("config.toml").exists());
        assert!(runner.seen().iter().any(|id| id == "mono_to_tri.tie_states"));
    }

    #[tokio::test]
    async fn exhausted_retries_stop_the_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start", "mono_to_tri", "diag"]);
        let runner = Arc::new(Scripted::failing("mono_to_tri.tie_states"));
        let state = prepare_experiment(&config, false).unwrap();

        let report = controller(&config, runner.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            ControllerState::Failed { stage, reason } => {
                assert_eq!(*stage, StageName::MonoToTri);
                assert!(reason.contains("mono_to_tri.tie_states"));
            }
            other => panic!("expected failure, got {other}"),
        }
        let seen = runner.seen();
        assert_eq!(seen.iter().filter(|id| *id == "mono_to_tri.tie_states").count(), 2);
        assert!(!seen.iter().any(|id| id.starts_with("diag.")));
        assert_eq!(report.state.last_completed, Some(StageName::FlatStart));
        assert!(!report.state.is_complete(StageName::MonoToTri));
        assert_eq!(
            report.state.last_failure.as_ref().map(|f| f.stage),
            Some(StageName::MonoToTri)
        );
    }

    #[tokio::test]
    async fn resume_reruns_only_missing_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start", "mono_to_tri"]);

        let first = Arc::new(Scripted::failing("flat_start.align.s001"));
        let state = prepare_experiment(&config, false).unwrap();
        let report = controller(&config, first.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.succeeded());
        let align_ok = "flat_start.align.s000";
        assert!(first.seen().iter().any(|id| id == align_ok));

        // Simulated restart: fresh controller, state read back from disk.
        let second = Arc::new(Scripted::default());
        let state = prepare_experiment(&config, true).unwrap();
        assert!(state.is_task_done(StageName::FlatStart, align_ok));
        let report = controller(&config, second.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());

        let seen = second.seen();
        assert!(!seen.iter().any(|id| id.starts_with("coding.")));
        assert!(!seen.iter().any(|id| id.starts_with("flat_start.initial_mono_iters.")));
        assert!(!seen.iter().any(|id| id == align_ok));
        assert!(seen.iter().any(|id| id == "flat_start.align.s001"));
        assert!(report.state.is_complete(StageName::MonoToTri));
    }

    #[tokio::test]
    async fn cancellation_fails_without_completing_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start"]);
        let runner = Arc::new(Scripted {
            cancel_on: Some("flat_start.align.".into()),
            ..Scripted::default()
        });
        let state = prepare_experiment(&config, false).unwrap();

        let report = controller(&config, runner)
            .run(state, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            ControllerState::Failed {
                stage: StageName::FlatStart,
                reason: "cancelled".into()
            }
        );
        assert!(report.state.is_complete(StageName::Coding));
        assert!(!report.state.is_complete(StageName::FlatStart));
        let store = CheckpointStore::new(config.checkpoint_dir()).unwrap();
        assert_eq!(store.current().unwrap().unwrap().stage, StageName::Coding);
    }

    #[tokio::test]
    async fn remote_resume_after_failed_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start"]);

        let state = prepare_experiment(&config, false).unwrap();
        let queue = Arc::new(SpoolQueue::new(config.spool_dir()).unwrap());
        let first_seen = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let worker = spawn_worker(
            queue.clone(),
            stop.clone(),
            cluster_answer(first_seen.clone(), Some("flat_start.align.s001")),
        );
        let report = remote_controller(&config, queue.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();
        stop.cancel();
        worker.await.unwrap();

        match &report.outcome {
            ControllerState::Failed { stage, reason } => {
                assert_eq!(*stage, StageName::FlatStart);
                assert!(reason.contains("flat_start.align.s001"));
            }
            other => panic!("expected failure, got {other}"),
        }
        let failing = first_seen.lock().unwrap().iter().filter(|id| *id == "flat_start.align.s001").count();
        assert_eq!(failing, 2);

        // Restart against the same spool with a healthy cluster.
        let state = prepare_experiment(&config, true).unwrap();
        let queue = Arc::new(SpoolQueue::new(config.spool_dir()).unwrap());
        let second_seen = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let worker = spawn_worker(queue.clone(), stop.clone(), cluster_answer(second_seen.clone(), None));
        let report = remote_controller(&config, queue.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();
        stop.cancel();
        worker.await.unwrap();

        assert!(report.succeeded(), "{}", report.outcome);
        let seen = second_seen.lock().unwrap().clone();
        assert!(seen.iter().any(|id| id == "flat_start.align.s001"));
        assert!(!seen.iter().any(|id| id == "flat_start.align.s000"));
        assert!(!seen.iter().any(|id| id.starts_with("coding.")));
        assert!(report.state.is_complete(StageName::FlatStart));
        assert_eq!(fs::read_dir(config.spool_dir().join("done")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn remote_cancellation_withdraws_tickets() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "flat_start"]);
        let state = prepare_experiment(&config, false).unwrap();
        let queue = Arc::new(SpoolQueue::new(config.spool_dir()).unwrap());

        // No worker: every ticket stays pending until the run is cancelled.
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = remote_controller(&config, queue.clone()).run(state, cancel).await.unwrap();

        assert_eq!(
            report.outcome,
            ControllerState::Failed {
                stage: StageName::Coding,
                reason: "cancelled".into()
            }
        );
        assert!(queue.pending().unwrap().is_empty());
        assert!(!report.state.is_complete(StageName::Coding));
    }

    #[tokio::test]
    async fn disabled_required_stage_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &["coding", "mono_to_tri"]);
        let err = controller(&config, Arc::new(Scripted::default()))
            .run(PipelineState::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn mixup_stage_records_final_mixtures() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            &["coding", "flat_start", "mono_to_tri", "mixup_tri", "diag"],
        );
        let runner = Arc::new(Scripted::default());
        let state = prepare_experiment(&config, false).unwrap();
        let report = controller(&config, runner.clone())
            .run(state, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());

        let diag = CheckpointStore::load(&report.state.record(StageName::Diag).unwrap().checkpoint)
            .unwrap();
        assert_eq!(diag.mixtures, 4);
        let seen = runner.seen();
        assert!(seen.iter().any(|id| id == "mixup_tri.mixup_tri.m2.mixup"));
        assert!(seen.iter().any(|id| id == "mixup_tri.mixup_tri.m4.mixup"));
        assert!(seen.iter().any(|id| id == "diag.diag_iters.m4.i01.update"));
    }

    #[test]
    fn clean_wipes_a_fresh_run_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = (*config(dir.path(), &["coding"])).clone();
        cfg.train_pipeline.clean = true;
        let stale = cfg.exp_dir().join("stale");
        fs::create_dir_all(&stale).unwrap();

        prepare_experiment(&cfg, true).unwrap();
        assert!(stale.exists());
        prepare_experiment(&cfg, false).unwrap();
        assert!(!stale.exists());
        assert!(cfg.exp_dir().join("config.toml").exists());
    }
}
