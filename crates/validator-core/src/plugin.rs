//! Plugin capability traits and the type-erased instance wrapper.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use validator_types::{Context, Result, RunResult, StepOutcome};

// ---------------------------------------------------------------------------
// Plugin kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Context,
    Selector,
    Check,
    Resultor,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginKind::Context => "context",
            PluginKind::Selector => "selector",
            PluginKind::Check => "check",
            PluginKind::Resultor => "resultor",
        };
        f.write_str(s)
    }
}

/// One concrete value produced by a template plugin while cooking.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateVariant {
    /// Replacement `data` for the plugin slot.
    pub data: serde_json::Value,
    /// Short name for the cooked pipeline (file stem, prim name, ...).
    pub display_name: String,
    /// Full value the variant was derived from.
    pub tooltip: String,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Behaviour shared by every plugin capability.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry name of the plugin (e.g. "USDFile", "AllPrims").
    fn name(&self) -> &str;

    /// Wire-form fields the plugin wants when the schema leaves them unset.
    ///
    /// Values may contain plugin specs; they are resolved through the registry
    /// after the plugin is constructed.
    fn default_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Expand this plugin into concrete variants. `Ok(None)` means the plugin is
    /// not a template and the pipeline is used as-is.
    async fn cook_template(&self) -> Result<Option<Vec<TemplateVariant>>> {
        Ok(None)
    }
}

/// Sets up the environment the rest of the pipeline runs in.
#[async_trait]
pub trait ContextPlugin: Plugin {
    async fn setup(&self, ctx: &Context) -> Result<StepOutcome>;

    /// Release whatever `setup` acquired. Called exactly once per setup attempt.
    async fn teardown(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Produces the target identifiers a check operates on.
#[async_trait]
pub trait SelectorPlugin: Plugin {
    /// `previous` is the output of the preceding selector in the chain, if any.
    async fn select(&self, ctx: &Context, previous: Option<Vec<String>>) -> Result<Vec<String>>;
}

/// Validates (and optionally repairs) the selected targets.
#[async_trait]
pub trait CheckPlugin: Plugin {
    /// `targets` is `None` when the check has no enabled selector and works on
    /// the whole context.
    async fn check(&self, ctx: &Context, targets: Option<&[String]>) -> Result<StepOutcome>;

    fn can_fix(&self) -> bool {
        false
    }

    async fn fix(&self, _ctx: &Context, _targets: Option<&[String]>) -> Result<StepOutcome> {
        Ok(StepOutcome::fail("Fix is not supported"))
    }
}

/// Receives the final result of a run.
#[async_trait]
pub trait ResultorPlugin: Plugin {
    async fn result(&self, result: &RunResult) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PluginInstance: type-erased, shareable plugin
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum PluginInstance {
    Context(Arc<dyn ContextPlugin>),
    Selector(Arc<dyn SelectorPlugin>),
    Check(Arc<dyn CheckPlugin>),
    Resultor(Arc<dyn ResultorPlugin>),
}

impl PluginInstance {
    pub fn context(plugin: impl ContextPlugin + 'static) -> Self {
        PluginInstance::Context(Arc::new(plugin))
    }

    pub fn selector(plugin: impl SelectorPlugin + 'static) -> Self {
        PluginInstance::Selector(Arc::new(plugin))
    }

    pub fn check(plugin: impl CheckPlugin + 'static) -> Self {
        PluginInstance::Check(Arc::new(plugin))
    }

    pub fn resultor(plugin: impl ResultorPlugin + 'static) -> Self {
        PluginInstance::Resultor(Arc::new(plugin))
    }

    pub fn kind(&self) -> PluginKind {
        match self {
            PluginInstance::Context(_) => PluginKind::Context,
            PluginInstance::Selector(_) => PluginKind::Selector,
            PluginInstance::Check(_) => PluginKind::Check,
            PluginInstance::Resultor(_) => PluginKind::Resultor,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PluginInstance::Context(p) => p.name(),
            PluginInstance::Selector(p) => p.name(),
            PluginInstance::Check(p) => p.name(),
            PluginInstance::Resultor(p) => p.name(),
        }
    }

    pub fn default_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match self {
            PluginInstance::Context(p) => p.default_fields(),
            PluginInstance::Selector(p) => p.default_fields(),
            PluginInstance::Check(p) => p.default_fields(),
            PluginInstance::Resultor(p) => p.default_fields(),
        }
    }

    pub async fn cook_template(&self) -> Result<Option<Vec<TemplateVariant>>> {
        match self {
            PluginInstance::Context(p) => p.cook_template().await,
            PluginInstance::Selector(p) => p.cook_template().await,
            PluginInstance::Check(p) => p.cook_template().await,
            PluginInstance::Resultor(p) => p.cook_template().await,
        }
    }

    pub fn as_context(&self) -> Option<&Arc<dyn ContextPlugin>> {
        match self {
            PluginInstance::Context(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_selector(&self) -> Option<&Arc<dyn SelectorPlugin>> {
        match self {
            PluginInstance::Selector(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_check(&self) -> Option<&Arc<dyn CheckPlugin>> {
        match self {
            PluginInstance::Check(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_resultor(&self) -> Option<&Arc<dyn ResultorPlugin>> {
        match self {
            PluginInstance::Resultor(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginInstance::{}({})", self.kind(), self.name())
    }
}
