//! Executors: strategies for running one cooked pipeline as a job.
//!
//! [`InProcessExecutor`] runs a [`RunManager`] on the caller's runtime.
//! [`ProcessExecutor`] writes the pipeline schema to a temp file and runs it
//! in a child process (`validator single --schema <file>`), so a plugin that
//! crashes or leaks global state only takes its own job down.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use validator_core::{wait_cancelled, PipelineModel, RunManager};
use validator_types::{ExecutorKind, Result, RunResult, ValidatorError};

use crate::queue::{MassQueue, UpdateSchemaRequest};

/// Default time a process gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// One job handed to an executor.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub pipeline: PipelineModel,
    /// Queue the job reports to, forwarded to out-of-process workers.
    pub queue_id: Option<String>,
}

/// Cancellation handles of a submitted job, detached from its result.
#[derive(Clone)]
pub struct JobControl {
    cancel: Arc<watch::Sender<bool>>,
    abort: Option<AbortHandle>,
}

impl JobControl {
    /// Control for a job that never started a task.
    pub fn idle() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel: Arc::new(cancel),
            abort: None,
        }
    }

    /// Ask the job to stop. In-process runs still tear their contexts down;
    /// child processes get SIGTERM and a grace period.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Drop the job task outright.
    pub fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.abort.as_ref().map_or(true, AbortHandle::is_finished)
    }
}

/// A running job.
pub struct JobHandle {
    pub job_id: String,
    control: JobControl,
    task: JoinHandle<RunResult>,
}

impl JobHandle {
    /// Spawn `run` with the job's cancellation receiver.
    pub fn spawn<F>(job_id: String, run: impl FnOnce(watch::Receiver<bool>) -> F) -> Self
    where
        F: std::future::Future<Output = RunResult> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(cancel_rx));
        Self {
            job_id,
            control: JobControl {
                cancel: Arc::new(cancel_tx),
                abort: Some(task.abort_handle()),
            },
            task,
        }
    }

    pub fn control(&self) -> JobControl {
        self.control.clone()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Wait for the job. A task that was aborted or panicked yields a failed result.
    pub async fn join(self) -> RunResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => RunResult::failed("Cancelled"),
            Err(e) => RunResult::failed(format!("Job task failed: {}", e)),
        }
    }
}

/// A strategy for running jobs.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Start `job` and return immediately.
    fn submit(&self, job: JobSpec) -> JobHandle;

    async fn await_result(&self, handle: JobHandle) -> RunResult {
        handle.join().await
    }
}

/// Turn the outcome of a run into the job's result.
fn job_result(job_id: &str, outcome: Result<RunResult>) -> RunResult {
    let result = match outcome {
        Ok(result) => result,
        Err(ValidatorError::PluginRuntime { message, .. }) => RunResult::failed(message),
        Err(ValidatorError::Cancelled) => RunResult::failed("Cancelled"),
        Err(e) => RunResult::failed(e.to_string()),
    };
    tracing::info!(job = %job_id, passed = result.passed, "Job finished");
    result
}

async fn acquire(
    permits: &Option<Arc<Semaphore>>,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Option<Option<tokio::sync::OwnedSemaphorePermit>> {
    let Some(semaphore) = permits else {
        return Some(None);
    };
    tokio::select! {
        biased;
        _ = wait_cancelled(cancel_rx) => None,
        permit = semaphore.clone().acquire_owned() => Some(permit.ok()),
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Runs jobs as tasks on the current runtime.
#[derive(Clone, Default)]
pub struct InProcessExecutor {
    permits: Option<Arc<Semaphore>>,
}

impl InProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most `max` jobs run at once; the rest wait for a slot.
    pub fn with_max_concurrent(max: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(max.max(1)))),
        }
    }
}

#[async_trait]
impl Executor for InProcessExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::InProcess
    }

    fn submit(&self, job: JobSpec) -> JobHandle {
        let permits = self.permits.clone();
        let JobSpec {
            job_id, pipeline, ..
        } = job;
        let id = job_id.clone();

        JobHandle::spawn(job_id, move |mut cancel_rx| async move {
            let Some(_permit) = acquire(&permits, &mut cancel_rx).await else {
                return job_result(&id, Err(ValidatorError::Cancelled));
            };
            tracing::debug!(job = %id, pipeline = %pipeline.name, "Job started in process");

            let manager = RunManager::new(pipeline);
            let run = manager.run();
            tokio::pin!(run);
            let outcome = tokio::select! {
                biased;
                outcome = &mut run => outcome,
                _ = wait_cancelled(&mut cancel_rx) => {
                    manager.cancel();
                    run.await
                }
            };
            job_result(&id, outcome)
        })
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Engine binary to launch.
    pub program: PathBuf,
    /// Arguments placed before `--schema <file>`.
    pub base_args: Vec<String>,
    /// Time between SIGTERM and SIGKILL on cancellation.
    pub grace_period: Duration,
    pub max_concurrent: Option<usize>,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("validator")),
            base_args: vec!["single".to_string()],
            grace_period: DEFAULT_GRACE_PERIOD,
            max_concurrent: None,
        }
    }
}

/// Runs every job in its own child process.
#[derive(Clone)]
pub struct ProcessExecutor {
    config: Arc<ProcessExecutorConfig>,
    permits: Option<Arc<Semaphore>>,
    queue: Option<Arc<MassQueue>>,
}

impl ProcessExecutor {
    pub fn new(config: ProcessExecutorConfig) -> Self {
        let permits = config
            .max_concurrent
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        Self {
            config: Arc::new(config),
            permits,
            queue: None,
        }
    }

    /// Forward `UpdateSchemaRequest` lines printed by workers to `queue`.
    pub fn with_queue(mut self, queue: Arc<MassQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &ProcessExecutorConfig {
        &self.config
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Process
    }

    fn submit(&self, job: JobSpec) -> JobHandle {
        let config = self.config.clone();
        let permits = self.permits.clone();
        let queue = self.queue.clone();
        let id = job.job_id.clone();

        JobHandle::spawn(id.clone(), move |mut cancel_rx| async move {
            let Some(_permit) = acquire(&permits, &mut cancel_rx).await else {
                return job_result(&id, Err(ValidatorError::Cancelled));
            };
            let outcome = run_process(&config, queue, &job, &mut cancel_rx).await;
            job_result(&id, outcome)
        })
    }
}

async fn run_process(
    config: &ProcessExecutorConfig,
    queue: Option<Arc<MassQueue>>,
    job: &JobSpec,
    cancel_rx: &mut watch::Receiver<bool>,
) -> Result<RunResult> {
    // Kept alive until the child has exited.
    let schema_file = write_schema(job)?;

    let mut cmd = tokio::process::Command::new(&config.program);
    cmd.args(&config.base_args)
        .arg("--schema")
        .arg(schema_file.path());
    if let Some(queue_id) = &job.queue_id {
        cmd.arg("--queue-id")
            .arg(queue_id)
            .arg("--job-id")
            .arg(&job.job_id);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so cancellation reaches the whole tree.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| {
        ValidatorError::Executor(format!(
            "Failed to launch {}: {}",
            config.program.display(),
            e
        ))
    })?;
    tracing::debug!(job = %job.job_id, pid = ?child.id(), "Job process started");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ValidatorError::Executor("child stdout was not captured".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ValidatorError::Executor("child stderr was not captured".into()))?;

    let stdout_task = tokio::spawn(read_reports(stdout, queue));
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = wait_cancelled(cancel_rx) => {
            tracing::info!(job = %job.job_id, "Terminating job process");
            terminate(&mut child, config.grace_period).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(ValidatorError::Cancelled);
        }
    };

    let reported = stdout_task.await.unwrap_or(None);
    let stderr_text = stderr_task.await.unwrap_or_default();
    Ok(reported.unwrap_or_else(|| exit_result(status, &stderr_text)))
}

fn write_schema(job: &JobSpec) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("validator-job-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer_pretty(&mut file, &job.pipeline.to_schema())?;
    file.flush()?;
    Ok(file)
}

/// Result of a child that printed no result line.
fn exit_result(status: ExitStatus, stderr: &str) -> RunResult {
    if status.success() {
        return RunResult {
            passed: true,
            message: "Ok".to_string(),
            per_check: Vec::new(),
        };
    }
    let stderr = stderr.trim();
    if stderr.is_empty() {
        RunResult::failed(format!("Process exited with {}", status))
    } else {
        RunResult::failed(stderr)
    }
}

/// Read the child's stdout to the end. Update requests go to the queue; the
/// last result line (bare or inside an update) wins. Lines are decoded
/// lossily so stray binary output does not end the stream.
async fn read_reports<R>(stdout: R, queue: Option<Arc<MassQueue>>) -> Option<RunResult>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut last = None;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read worker output");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        if let Ok(update) = serde_json::from_str::<UpdateSchemaRequest>(line) {
            if let Some(queue) = &queue {
                queue.update_from_wire(&update);
            }
            if let Some(result) = update.result() {
                last = Some(result);
            }
        } else if let Ok(result) = serde_json::from_str::<RunResult>(line) {
            last = Some(result);
        }
    }
    last
}

/// SIGTERM the process group, then SIGKILL after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
            tokio::select! {
                _ = child.wait() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    let _ = child.kill().await;
}
