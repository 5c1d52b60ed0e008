//! In-crate test doubles: plugins that record what the engine asks of them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use validator_types::{Context, Result, RunResult, Stage, StepOutcome, ValidatorError};

use crate::model::{CheckNode, ContextNode, PipelineModel, ResultorNode, SelectorNode};
use crate::plugin::{
    CheckPlugin, ContextPlugin, Plugin, PluginInstance, ResultorPlugin, SelectorPlugin,
};
use crate::resolver::ResolvedPlugin;

/// Shared call log.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<String>>,
    teardowns: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

pub fn resolved(name: &str, instance: PluginInstance) -> Arc<ResolvedPlugin> {
    resolved_with(name, instance, true)
}

pub fn resolved_with(name: &str, instance: PluginInstance, enabled: bool) -> Arc<ResolvedPlugin> {
    Arc::new(ResolvedPlugin {
        name: name.to_string(),
        enabled,
        data: Value::Null,
        path: name.to_string(),
        key: name.to_string(),
        instance,
        fields: BTreeMap::new(),
    })
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct FakeContext {
    pub name: String,
    pub recorder: Arc<Recorder>,
    pub pass: bool,
    pub prims: Vec<&'static str>,
}

impl FakeContext {
    pub fn new(name: &str, recorder: &Arc<Recorder>) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            pass: true,
            prims: vec!["/World", "/World/Cube", "/World/Sphere"],
        }
    }

    pub fn failing(mut self) -> Self {
        self.pass = false;
        self
    }

    pub fn node(self) -> ContextNode {
        let name = self.name.clone();
        let instance: Arc<dyn ContextPlugin> = Arc::new(self);
        ContextNode {
            plugin: resolved(&name, PluginInstance::Context(instance.clone())),
            instance,
        }
    }
}

#[async_trait]
impl Plugin for FakeContext {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl ContextPlugin for FakeContext {
    async fn setup(&self, ctx: &Context) -> Result<StepOutcome> {
        self.recorder.record(format!("setup:{}", self.name));
        tokio::task::yield_now().await;
        if !self.pass {
            return Ok(StepOutcome::fail(format!("Can't read the file /missing/{}", self.name)));
        }
        ctx.set("prims", json!(self.prims)).await;
        Ok(StepOutcome::success(format!("{} ready", self.name)))
    }

    async fn teardown(&self, _ctx: &Context) -> Result<()> {
        self.recorder.teardowns.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(format!("teardown:{}", self.name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Keeps the first `keep` entries of the previous selection (or of all prims).
pub struct FakeSelector {
    pub name: String,
    pub recorder: Arc<Recorder>,
    pub keep: usize,
}

impl FakeSelector {
    pub fn new(name: &str, recorder: &Arc<Recorder>, keep: usize) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            keep,
        }
    }

    pub fn node(self) -> SelectorNode {
        let name = self.name.clone();
        let instance: Arc<dyn SelectorPlugin> = Arc::new(self);
        SelectorNode {
            plugin: resolved(&name, PluginInstance::Selector(instance.clone())),
            instance,
        }
    }
}

#[async_trait]
impl Plugin for FakeSelector {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl SelectorPlugin for FakeSelector {
    async fn select(&self, ctx: &Context, previous: Option<Vec<String>>) -> Result<Vec<String>> {
        let input = match previous {
            Some(p) => p,
            None => ctx.get_strings("prims").await,
        };
        self.recorder
            .record(format!("select:{}:{}", self.name, input.len()));
        Ok(input.into_iter().take(self.keep).collect())
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Pass,
    Fail,
    Error,
    Fixable,
    Hang,
}

pub struct FakeCheck {
    pub name: String,
    pub recorder: Arc<Recorder>,
    pub behavior: Behavior,
}

impl FakeCheck {
    pub fn new(name: &str, recorder: &Arc<Recorder>, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            behavior,
        }
    }

    pub fn node(self) -> CheckNode {
        self.node_with(Vec::new(), None)
    }

    pub fn disabled_node(self) -> CheckNode {
        let name = self.name.clone();
        let instance: Arc<dyn CheckPlugin> = Arc::new(self);
        CheckNode {
            plugin: resolved_with(&name, PluginInstance::Check(instance.clone()), false),
            instance,
            context: None,
            selectors: Vec::new(),
        }
    }

    pub fn node_with(self, selectors: Vec<SelectorNode>, context: Option<ContextNode>) -> CheckNode {
        let name = self.name.clone();
        let instance: Arc<dyn CheckPlugin> = Arc::new(self);
        CheckNode {
            plugin: resolved(&name, PluginInstance::Check(instance.clone())),
            instance,
            context,
            selectors,
        }
    }
}

#[async_trait]
impl Plugin for FakeCheck {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl CheckPlugin for FakeCheck {
    async fn check(&self, _ctx: &Context, targets: Option<&[String]>) -> Result<StepOutcome> {
        let scope = targets
            .map(|t| t.len().to_string())
            .unwrap_or_else(|| "all".to_string());
        self.recorder.record(format!("check:{}:{}", self.name, scope));
        match self.behavior {
            Behavior::Pass => Ok(StepOutcome::success("looks good")),
            Behavior::Fail | Behavior::Fixable => Ok(StepOutcome::fail("looks bad")),
            Behavior::Error => Err(ValidatorError::runtime(&self.name, Stage::Check, "plugin exploded")),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(StepOutcome::success("unreachable"))
            }
        }
    }

    fn can_fix(&self) -> bool {
        self.behavior == Behavior::Fixable
    }

    async fn fix(&self, _ctx: &Context, targets: Option<&[String]>) -> Result<StepOutcome> {
        self.recorder.record(format!(
            "fix:{}:{}",
            self.name,
            targets.map(|t| t.len()).unwrap_or(0)
        ));
        Ok(StepOutcome::success("fixed"))
    }
}

// ---------------------------------------------------------------------------
// Resultor
// ---------------------------------------------------------------------------

pub struct FakeResultor {
    pub seen: Arc<Mutex<Vec<RunResult>>>,
}

impl FakeResultor {
    pub fn node(seen: &Arc<Mutex<Vec<RunResult>>>) -> ResultorNode {
        let instance: Arc<dyn ResultorPlugin> = Arc::new(FakeResultor { seen: seen.clone() });
        ResultorNode {
            plugin: resolved("FakeResultor", PluginInstance::Resultor(instance.clone())),
            instance,
        }
    }
}

#[async_trait]
impl Plugin for FakeResultor {
    fn name(&self) -> &str {
        "FakeResultor"
    }
}

#[async_trait]
impl ResultorPlugin for FakeResultor {
    async fn result(&self, result: &RunResult) -> Result<()> {
        self.seen.lock().unwrap().push(result.clone());
        Ok(())
    }
}

pub fn pipeline(context: ContextNode, checks: Vec<CheckNode>) -> PipelineModel {
    PipelineModel {
        name: "fake".into(),
        uuid: "fake-uuid".into(),
        data: json!({}),
        context,
        checks: checks.into_iter().map(Arc::new).collect(),
        resultors: Vec::new(),
    }
}
