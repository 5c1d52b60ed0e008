//! Single-run manager: drives one pipeline through setup, selection, check
//! and teardown.
//!
//! Every context that was set up is torn down exactly once, on every exit
//! path (success, failed check, plugin error, cancellation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use validator_types::{CheckResult, Context, Result, RunResult, Stage, StepOutcome, ValidatorError};

use crate::events::{Event, EventEmitter, RunEvent, Subscription};
use crate::model::{CheckNode, ContextNode, PipelineModel, NO_ENABLED_CHECKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    ContextReady,
    Selecting,
    Checking,
    Finished,
    Errored,
}

/// Reported after every context setup (root and sub-contexts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextResult {
    pub plugin: String,
    pub passed: bool,
    pub message: String,
}

/// Wrap a plugin error so the failing plugin and stage are recorded.
fn plugin_error(plugin: &str, stage: Stage, err: ValidatorError) -> ValidatorError {
    match err {
        e @ (ValidatorError::PluginRuntime { .. } | ValidatorError::Cancelled) => e,
        other => ValidatorError::runtime(plugin, stage, other.to_string()),
    }
}

/// Resolves once `cancelled` flips to `true`. Never resolves if the sender is gone.
pub async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// RunManager
// ---------------------------------------------------------------------------

pub struct RunManager {
    pipeline: PipelineModel,
    state: Mutex<RunState>,
    started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    /// Contexts set up but not yet torn down, innermost last.
    pending_teardown: Mutex<Vec<(ContextNode, Context)>>,
    events: EventEmitter,
    on_check_result: Event<CheckResult>,
    on_context_result: Event<ContextResult>,
}

impl RunManager {
    pub fn new(pipeline: PipelineModel) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            pipeline,
            state: Mutex::new(RunState::Created),
            started: AtomicBool::new(false),
            cancel_tx,
            pending_teardown: Mutex::new(Vec::new()),
            events: EventEmitter::default(),
            on_check_result: Event::new(),
            on_context_result: Event::new(),
        }
    }

    pub fn pipeline(&self) -> &PipelineModel {
        &self.pipeline
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn subscribe_check_result(
        &self,
        callback: impl Fn(&CheckResult) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_check_result.subscribe(callback)
    }

    pub fn subscribe_context_result(
        &self,
        callback: impl Fn(&ContextResult) + Send + Sync + 'static,
    ) -> Subscription {
        self.on_context_result.subscribe(callback)
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Request cooperative cancellation. The current plugin call is abandoned,
    /// pending teardowns still run and `run()` returns [`ValidatorError::Cancelled`].
    pub fn cancel(&self) {
        tracing::info!(pipeline = %self.pipeline.name, "Run cancellation requested");
        self.cancel_tx.send_replace(true);
    }

    /// Execute the pipeline. Allowed once per manager.
    pub async fn run(&self) -> Result<RunResult> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ValidatorError::AlreadyRan);
        }
        let start = Instant::now();
        let name = self.pipeline.name.clone();
        tracing::info!(pipeline = %name, uuid = %self.pipeline.uuid, "Run started");
        self.events.emit(RunEvent::RunStarted {
            pipeline: name.clone(),
            uuid: self.pipeline.uuid.clone(),
            check_count: self.pipeline.enabled_checks().count(),
        });

        let ctx = Context::new();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel_rx) => Err(ValidatorError::Cancelled),
            result = self.execute(&ctx) => result,
        };

        let teardown = self.teardown_pending().await;
        let outcome = match (outcome, teardown) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_err)) => {
                tracing::warn!(pipeline = %name, error = %teardown_err, "Teardown failed after run error");
                Err(e)
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => return Err(self.errored(e)),
        };
        self.set_state(RunState::Finished);

        for resultor in self.pipeline.resultors.iter().filter(|r| r.plugin.enabled) {
            if let Err(e) = resultor.instance.result(&result).await {
                return Err(self.errored(plugin_error(resultor.name(), Stage::Result, e)));
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            pipeline = %name,
            passed = result.passed,
            duration_ms,
            "Run finished"
        );
        self.events.emit(RunEvent::RunFinished {
            pipeline: name,
            passed: result.passed,
            duration_ms,
        });
        Ok(result)
    }

    fn errored(&self, err: ValidatorError) -> ValidatorError {
        self.set_state(RunState::Errored);
        tracing::error!(pipeline = %self.pipeline.name, error = %err, "Run errored");
        self.events.emit(RunEvent::RunErrored {
            pipeline: self.pipeline.name.clone(),
            error: err.to_string(),
        });
        err
    }

    async fn execute(&self, ctx: &Context) -> Result<RunResult> {
        let root = &self.pipeline.context;
        let setup = self.setup(root, ctx).await?;
        if !setup.passed {
            return Err(ValidatorError::runtime(root.name(), Stage::Setup, setup.message));
        }
        self.set_state(RunState::ContextReady);

        if self.pipeline.enabled_checks().next().is_none() {
            tracing::warn!(pipeline = %self.pipeline.name, "No enabled check plugins");
            return Ok(RunResult::failed(NO_ENABLED_CHECKS));
        }

        // A failing check does not stop the next one; a plugin error does.
        let mut per_check = Vec::new();
        for check in self.pipeline.enabled_checks() {
            let result = self.run_check(check, ctx).await?;
            tracing::info!(check = %result.name, passed = result.passed, "Check finished");
            self.on_check_result.notify(&result);
            self.events.emit(RunEvent::CheckCompleted {
                check: result.name.clone(),
                passed: result.passed,
                message: result.message.clone(),
            });
            per_check.push(result);
        }
        Ok(RunResult::from_checks(per_check))
    }

    /// Set up `node` on `ctx` and register it for teardown.
    async fn setup(&self, node: &ContextNode, ctx: &Context) -> Result<StepOutcome> {
        self.pending_teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((node.clone(), ctx.clone()));

        tracing::debug!(plugin = %node.name(), "Context setup");
        let outcome = node
            .instance
            .setup(ctx)
            .await
            .map_err(|e| plugin_error(node.name(), Stage::Setup, e))?;

        let report = ContextResult {
            plugin: node.name().to_string(),
            passed: outcome.passed,
            message: outcome.message.clone(),
        };
        self.on_context_result.notify(&report);
        self.events.emit(RunEvent::ContextReady {
            plugin: report.plugin,
            passed: report.passed,
            message: report.message,
        });
        Ok(outcome)
    }

    async fn teardown_innermost(&self) -> Result<()> {
        let next = self
            .pending_teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match next {
            Some((node, ctx)) => {
                tracing::debug!(plugin = %node.name(), "Context teardown");
                node.instance
                    .teardown(&ctx)
                    .await
                    .map_err(|e| plugin_error(node.name(), Stage::Teardown, e))
            }
            None => Ok(()),
        }
    }

    /// Tear down everything still pending, innermost first. Keeps going after
    /// a failure and reports the first one.
    async fn teardown_pending(&self) -> Result<()> {
        let mut first_err = None;
        loop {
            let remaining = self
                .pending_teardown
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len();
            if remaining == 0 {
                break;
            }
            if let Err(e) = self.teardown_innermost().await {
                tracing::warn!(error = %e, "Teardown failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_check(&self, check: &CheckNode, parent: &Context) -> Result<CheckResult> {
        let sub_context = check.context.as_ref().filter(|c| c.enabled());
        let ctx = match sub_context {
            Some(sub) => {
                let sub_ctx = parent.clone_isolated().await;
                let setup = self.setup(sub, &sub_ctx).await?;
                if !setup.passed {
                    self.teardown_innermost().await?;
                    return Ok(CheckResult {
                        name: check.name().to_string(),
                        passed: false,
                        message: setup.message,
                    });
                }
                sub_ctx
            }
            None => parent.clone(),
        };

        self.set_state(RunState::Selecting);
        let targets = self.select(check, &ctx).await?;
        self.set_state(RunState::Checking);
        let mut outcome = check
            .instance
            .check(&ctx, targets.as_deref())
            .await
            .map_err(|e| plugin_error(check.name(), Stage::Check, e))?;

        if !outcome.passed && check.instance.can_fix() {
            tracing::info!(check = %check.name(), "Check failed, running fix");
            self.set_state(RunState::Selecting);
            let targets = self.select(check, &ctx).await?;
            self.set_state(RunState::Checking);
            let fixed = check
                .instance
                .fix(&ctx, targets.as_deref())
                .await
                .map_err(|e| plugin_error(check.name(), Stage::Fix, e))?;
            outcome = StepOutcome {
                passed: fixed.passed,
                message: format!("{}\n{}", outcome.message, fixed.message),
            };
        }

        if sub_context.is_some() {
            self.teardown_innermost().await?;
        }

        Ok(CheckResult {
            name: check.name().to_string(),
            passed: outcome.passed,
            message: outcome.message,
        })
    }

    /// Run the enabled selectors in order, each receiving the previous output.
    async fn select(&self, check: &CheckNode, ctx: &Context) -> Result<Option<Vec<String>>> {
        let mut selection: Option<Vec<String>> = None;
        for selector in check.selectors.iter().filter(|s| s.enabled()) {
            let picked = selector
                .instance
                .select(ctx, selection.take())
                .await
                .map_err(|e| plugin_error(selector.name(), Stage::Select, e))?;
            tracing::debug!(selector = %selector.name(), count = picked.len(), "Selected");
            selection = Some(picked);
        }
        Ok(selection)
    }
}
