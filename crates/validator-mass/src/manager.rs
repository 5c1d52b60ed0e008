//! Mass manager: runs a batch of cooked pipelines concurrently and reports
//! per-job and aggregate progress.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use validator_core::{cook_all, resolve_pipeline, Event, PipelineModel, PluginRegistry, Subscription};
use validator_types::{ExecutorKind, JobState, Result, RunResult, ValidatorError};

use crate::executor::{
    Executor, InProcessExecutor, JobControl, JobSpec, ProcessExecutor, ProcessExecutorConfig,
    DEFAULT_GRACE_PERIOD,
};
use crate::queue::MassQueue;

/// Message recorded for jobs cut off by the global timeout.
pub const TIMEOUT_MESSAGE: &str = "Timeout";

#[derive(Debug, Clone)]
pub struct MassOptions {
    /// Global deadline for the whole batch.
    pub timeout: Option<Duration>,
    /// Time cancelled jobs get before they are aborted.
    pub grace_period: Duration,
    /// Queue the jobs report to (forwarded to process workers).
    pub queue_id: Option<String>,
}

impl Default for MassOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            queue_id: None,
        }
    }
}

/// One cooked pipeline tracked by a [`MassManager`].
#[derive(Debug, Clone)]
pub struct MassJob {
    pub id: String,
    pub pipeline: PipelineModel,
    pub executor_kind: ExecutorKind,
    pub state: JobState,
    pub result: Option<RunResult>,
}

impl MassJob {
    pub fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Done | JobState::Failed)
    }

    /// Wire schema of the pipeline plus the job's status.
    pub fn to_schema(&self) -> Value {
        let mut schema = self.pipeline.to_schema();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert("uuid".into(), json!(self.id));
            obj.insert(
                "validation_passed".into(),
                json!(self.result.as_ref().is_some_and(|r| r.passed)),
            );
            obj.insert("finished".into(), json!(self.is_finished()));
            obj.insert("result".into(), json!(self.result));
        }
        schema
    }

    fn finish(&mut self, result: RunResult) {
        self.state = if result.passed {
            JobState::Done
        } else {
            JobState::Failed
        };
        self.result = Some(result);
    }
}

/// Reported after every finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Number of jobs finished before this one; runs `0..total`.
    pub index: usize,
    pub total: usize,
    pub message: String,
}

/// Reported once, after the last job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassFinished {
    pub passed: bool,
    pub failed_job_ids: Vec<String>,
    /// One entry per failed job, aligned with `failed_job_ids`.
    pub messages: Vec<String>,
    pub timed_out: bool,
}

/// Per-job handle returned by [`MassManager::create_tasks`].
pub struct JobTicket {
    pub job_id: String,
    control: JobControl,
    result: watch::Receiver<Option<RunResult>>,
}

impl JobTicket {
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Wait for the job's final result as recorded by the manager.
    pub async fn result(&mut self) -> Option<RunResult> {
        let recorded = self.result.wait_for(Option::is_some).await.ok()?;
        recorded.clone()
    }
}

/// Handles of a started batch.
pub struct MassRun {
    pub tickets: Vec<JobTicket>,
    finished: watch::Receiver<Option<MassFinished>>,
}

impl MassRun {
    /// Wait for the aggregate result.
    pub async fn wait(mut self) -> MassFinished {
        match self.finished.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or_else(aborted),
            Err(_) => aborted(),
        }
    }
}

fn aborted() -> MassFinished {
    MassFinished {
        passed: false,
        failed_job_ids: Vec::new(),
        messages: vec!["Mass run was aborted".to_string()],
        timed_out: false,
    }
}

// ---------------------------------------------------------------------------
// MassManager
// ---------------------------------------------------------------------------

pub struct MassManager {
    id: String,
    jobs: Arc<Mutex<Vec<MassJob>>>,
    options: MassOptions,
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
    started: AtomicBool,
    on_progress: Event<Progress>,
    on_item_finished: Event<(String, RunResult)>,
    on_run_finished: Event<MassFinished>,
    finished: Arc<watch::Sender<Option<MassFinished>>>,
}

impl MassManager {
    /// Jobs for already-cooked `pipelines`, all on the same executor.
    pub fn new(pipelines: Vec<PipelineModel>, kind: ExecutorKind, options: MassOptions) -> Self {
        Self::with_kinds(pipelines.into_iter().map(|p| (p, kind)).collect(), options)
    }

    /// Jobs with a per-job executor kind.
    pub fn with_kinds(pipelines: Vec<(PipelineModel, ExecutorKind)>, options: MassOptions) -> Self {
        let mut seen = HashSet::new();
        let jobs = pipelines
            .into_iter()
            .map(|(mut pipeline, executor_kind)| {
                // The job id is the pipeline uuid; repeated uuids get a fresh one.
                if !seen.insert(pipeline.uuid.clone()) {
                    pipeline.uuid = uuid::Uuid::new_v4().to_string();
                    seen.insert(pipeline.uuid.clone());
                }
                MassJob {
                    id: pipeline.uuid.clone(),
                    pipeline,
                    executor_kind,
                    state: JobState::Pending,
                    result: None,
                }
            })
            .collect();

        let queue = MassQueue::global();
        let process = ProcessExecutor::new(ProcessExecutorConfig {
            grace_period: options.grace_period,
            ..ProcessExecutorConfig::default()
        })
        .with_queue(queue);
        let mut executors: HashMap<ExecutorKind, Arc<dyn Executor>> = HashMap::new();
        executors.insert(ExecutorKind::InProcess, Arc::new(InProcessExecutor::new()));
        executors.insert(ExecutorKind::Process, Arc::new(process));

        let (finished, _) = watch::channel(None);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            jobs: Arc::new(Mutex::new(jobs)),
            options,
            executors,
            started: AtomicBool::new(false),
            on_progress: Event::new(),
            on_item_finished: Event::new(),
            on_run_finished: Event::new(),
            finished: Arc::new(finished),
        }
    }

    /// Resolve and cook every schema, then build the manager. Nothing is
    /// created unless every schema resolves and cooks.
    pub async fn from_schemas(
        registry: &PluginRegistry,
        schemas: &[Value],
        kind: ExecutorKind,
        options: MassOptions,
    ) -> Result<Self> {
        let mut models = Vec::with_capacity(schemas.len());
        for (i, schema) in schemas.iter().enumerate() {
            let model = resolve_pipeline(registry, schema).inspect_err(|e| {
                tracing::warn!(schema = i, error = %e, "Schema did not resolve");
            })?;
            models.push(model);
        }
        let cooked = cook_all(registry, &models).await?;
        tracing::info!(schemas = schemas.len(), jobs = cooked.len(), %kind, "Mass run prepared");
        Ok(Self::new(cooked, kind, options))
    }

    /// Replace the executor used for `executor.kind()` jobs.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &MassOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.lock_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, Vec<MassJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every job.
    pub fn jobs(&self) -> Vec<MassJob> {
        self.lock_jobs().clone()
    }

    /// Wire schemas of every job, with status.
    pub fn schemas(&self) -> Vec<Value> {
        self.lock_jobs().iter().map(MassJob::to_schema).collect()
    }

    /// The aggregate result, once the batch has finished.
    pub fn finished(&self) -> Option<MassFinished> {
        self.finished.borrow().clone()
    }

    pub fn subscribe_progress(&self, callback: impl Fn(&Progress) + Send + Sync + 'static) -> Subscription {
        self.on_progress.subscribe(callback)
    }

    pub fn subscribe_item_finished(
        &self,
        callback: impl Fn(&(String, RunResult)) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_item_finished.subscribe(callback)
    }

    pub fn subscribe_run_finished(
        &self,
        callback: impl Fn(&MassFinished) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_run_finished.subscribe(callback)
    }

    /// Record a result reported from outside (see [`MassQueue::update_schema`]).
    /// Returns the job's updated schema, or `None` if the job is not ours.
    pub fn apply_external_result(&self, job_id: &str, result: RunResult) -> Option<Value> {
        let mut jobs = self.lock_jobs();
        let job = jobs.iter_mut().find(|j| j.id == job_id)?;
        job.finish(result);
        Some(job.to_schema())
    }

    /// Submit every job, in order, to its executor. Allowed once per manager.
    pub fn create_tasks(&self) -> Result<MassRun> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ValidatorError::AlreadyRan);
        }

        let specs: Vec<(usize, ExecutorKind, JobSpec)> = {
            let mut jobs = self.lock_jobs();
            jobs.iter_mut()
                .enumerate()
                .map(|(i, job)| {
                    job.state = JobState::Running;
                    let spec = JobSpec {
                        job_id: job.id.clone(),
                        pipeline: job.pipeline.clone(),
                        queue_id: self.options.queue_id.clone(),
                    };
                    (i, job.executor_kind, spec)
                })
                .collect()
        };
        let total = specs.len();
        tracing::info!(manager = %self.id, jobs = total, "Mass run started");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut controls = Vec::with_capacity(total);
        let mut kinds = Vec::with_capacity(total);
        let mut tickets = Vec::with_capacity(total);
        let mut result_txs = Vec::with_capacity(total);

        for (i, kind, spec) in specs {
            let job_id = spec.job_id.clone();
            let (result_tx, result_rx) = watch::channel(None);
            let Some(executor) = self.executors.get(&kind).cloned() else {
                // Reported through the normal completion path.
                let _ = tx.send((i, RunResult::failed(format!("No executor for {}", kind))));
                let control = JobControl::idle();
                controls.push(control.clone());
                kinds.push(kind);
                tickets.push(JobTicket {
                    job_id,
                    control,
                    result: result_rx,
                });
                result_txs.push(result_tx);
                continue;
            };

            let handle = executor.submit(spec);
            let control = handle.control();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = executor.await_result(handle).await;
                let _ = tx.send((i, result));
            });
            controls.push(control.clone());
            kinds.push(kind);
            tickets.push(JobTicket {
                job_id,
                control,
                result: result_rx,
            });
            result_txs.push(result_tx);
        }
        drop(tx);

        let supervisor = Supervisor {
            manager_id: self.id.clone(),
            jobs: self.jobs.clone(),
            controls,
            kinds,
            result_txs,
            timeout: self.options.timeout,
            grace_period: self.options.grace_period,
            on_progress: self.on_progress.clone(),
            on_item_finished: self.on_item_finished.clone(),
            on_run_finished: self.on_run_finished.clone(),
            finished: self.finished.clone(),
        };
        tokio::spawn(supervisor.run(rx));

        Ok(MassRun {
            tickets,
            finished: self.finished.subscribe(),
        })
    }

    /// Start every job and wait for the batch.
    pub async fn run(&self) -> Result<MassFinished> {
        Ok(self.create_tasks()?.wait().await)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    manager_id: String,
    jobs: Arc<Mutex<Vec<MassJob>>>,
    controls: Vec<JobControl>,
    kinds: Vec<ExecutorKind>,
    result_txs: Vec<watch::Sender<Option<RunResult>>>,
    timeout: Option<Duration>,
    grace_period: Duration,
    on_progress: Event<Progress>,
    on_item_finished: Event<(String, RunResult)>,
    on_run_finished: Event<MassFinished>,
    finished: Arc<watch::Sender<Option<MassFinished>>>,
}

impl Supervisor {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<(usize, RunResult)>) {
        let total = self.controls.len();
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut done = vec![false; total];
        let mut completed = 0;
        let mut timed_out = false;

        while completed < total {
            let next = match deadline {
                Some(deadline) if !timed_out => {
                    tokio::select! {
                        next = rx.recv() => next,
                        _ = tokio::time::sleep_until(deadline) => {
                            timed_out = true;
                            self.expire(&done);
                            continue;
                        }
                    }
                }
                _ => rx.recv().await,
            };
            let Some((i, result)) = next else {
                break;
            };
            if done[i] {
                continue;
            }
            let result = if timed_out {
                RunResult::failed(TIMEOUT_MESSAGE)
            } else {
                result
            };
            self.record(i, completed, total, result);
            done[i] = true;
            completed += 1;
        }

        // Every job task reports; this only triggers if one vanished.
        for i in (0..total).filter(|i| !done[*i]) {
            self.record(i, completed, total, RunResult::failed("Job was lost"));
            completed += 1;
        }

        self.finish(timed_out);
    }

    /// Cancel every unfinished job. Process jobs still running after the grace
    /// period are aborted; in-process jobs wind down on their own so that
    /// teardown completes.
    fn expire(&self, done: &[bool]) {
        let pending: Vec<(ExecutorKind, JobControl)> = self
            .kinds
            .iter()
            .zip(&self.controls)
            .zip(done)
            .filter(|(_, done)| !**done)
            .map(|((kind, control), _)| (*kind, control.clone()))
            .collect();
        tracing::warn!(manager = %self.manager_id, pending = pending.len(), "Mass run timed out");
        for (_, control) in &pending {
            control.cancel();
        }
        let stragglers: Vec<JobControl> = pending
            .into_iter()
            .filter(|(kind, _)| *kind == ExecutorKind::Process)
            .map(|(_, control)| control)
            .collect();
        if stragglers.is_empty() {
            return;
        }
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for control in stragglers.iter().filter(|c| !c.is_finished()) {
                control.abort();
            }
        });
    }

    fn record(&self, i: usize, index: usize, total: usize, result: RunResult) {
        let (job_id, name) = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let job = &mut jobs[i];
            job.finish(result.clone());
            (job.id.clone(), job.pipeline.name.clone())
        };
        tracing::debug!(job = %job_id, passed = result.passed, index, total, "Job recorded");
        self.result_txs[i].send_replace(Some(result.clone()));
        let message = format!("{}: {}", name, result.message);
        self.on_item_finished.notify(&(job_id, result));
        self.on_progress.notify(&Progress {
            index,
            total,
            message,
        });
    }

    fn finish(&self, timed_out: bool) {
        let (failed_job_ids, messages): (Vec<String>, Vec<String>) = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.iter()
                .filter(|j| !j.result.as_ref().is_some_and(|r| r.passed))
                .map(|j| {
                    let message = j
                        .result
                        .as_ref()
                        .map(|r| r.message.clone())
                        .unwrap_or_default();
                    (j.id.clone(), message)
                })
                .unzip()
        };
        let summary = MassFinished {
            passed: failed_job_ids.is_empty(),
            failed_job_ids,
            messages,
            timed_out,
        };
        tracing::info!(
            manager = %self.manager_id,
            passed = summary.passed,
            failed = summary.failed_job_ids.len(),
            timed_out,
            "Mass run finished"
        );
        self.on_run_finished.notify(&summary);
        self.finished.send_replace(Some(summary));
    }
}
