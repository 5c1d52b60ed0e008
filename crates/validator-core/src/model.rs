//! The resolved pipeline: one root context, ordered checks, optional resultors.

use std::sync::Arc;

use serde_json::{json, Value};

use validator_types::{Result, ValidatorError};

use crate::plugin::{CheckPlugin, ContextPlugin, PluginKind, ResultorPlugin, SelectorPlugin};
use crate::resolver::{join_path, Resolved, ResolvedPlugin};

fn wrong_kind(plugin: &ResolvedPlugin, path: &str, expected: PluginKind) -> ValidatorError {
    ValidatorError::validation(
        path,
        format!(
            "'{}' is a {} plugin, expected a {} plugin",
            plugin.name,
            plugin.instance.kind(),
            expected
        ),
    )
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ContextNode {
    pub plugin: Arc<ResolvedPlugin>,
    pub instance: Arc<dyn ContextPlugin>,
}

impl ContextNode {
    pub(crate) fn from_resolved(plugin: Arc<ResolvedPlugin>, path: &str) -> Result<Self> {
        let instance = plugin
            .instance
            .as_context()
            .cloned()
            .ok_or_else(|| wrong_kind(&plugin, path, PluginKind::Context))?;
        Ok(Self { plugin, instance })
    }

    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    pub fn enabled(&self) -> bool {
        self.plugin.enabled
    }
}

#[derive(Clone)]
pub struct SelectorNode {
    pub plugin: Arc<ResolvedPlugin>,
    pub instance: Arc<dyn SelectorPlugin>,
}

impl SelectorNode {
    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    pub fn enabled(&self) -> bool {
        self.plugin.enabled
    }
}

/// A check with its own optional sub-context and selector chain.
pub struct CheckNode {
    pub plugin: Arc<ResolvedPlugin>,
    pub instance: Arc<dyn CheckPlugin>,
    pub context: Option<ContextNode>,
    pub selectors: Vec<SelectorNode>,
}

impl CheckNode {
    pub(crate) fn from_resolved(plugin: Arc<ResolvedPlugin>, path: &str) -> Result<Self> {
        let instance = plugin
            .instance
            .as_check()
            .cloned()
            .ok_or_else(|| wrong_kind(&plugin, path, PluginKind::Check))?;

        let context_path = join_path(path, "context_plugin");
        let context = match plugin.field("context_plugin") {
            None => None,
            Some(Resolved::Plugin(p)) => Some(ContextNode::from_resolved(p.clone(), &context_path)?),
            Some(_) => {
                return Err(ValidatorError::validation(
                    context_path,
                    "expected a plugin spec",
                ))
            }
        };

        let selectors_path = join_path(path, "selector_plugins");
        let selectors = match plugin.field("selector_plugins") {
            None => Vec::new(),
            Some(Resolved::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", selectors_path, i);
                    let p = item.as_plugin().ok_or_else(|| {
                        ValidatorError::validation(&item_path, "expected a plugin spec")
                    })?;
                    let instance = p
                        .instance
                        .as_selector()
                        .cloned()
                        .ok_or_else(|| wrong_kind(p, &item_path, PluginKind::Selector))?;
                    out.push(SelectorNode {
                        plugin: p.clone(),
                        instance,
                    });
                }
                out
            }
            Some(_) => {
                return Err(ValidatorError::validation(selectors_path, "expected a list"))
            }
        };

        Ok(Self {
            plugin,
            instance,
            context,
            selectors,
        })
    }

    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    pub fn enabled(&self) -> bool {
        self.plugin.enabled
    }
}

#[derive(Clone)]
pub struct ResultorNode {
    pub plugin: Arc<ResolvedPlugin>,
    pub instance: Arc<dyn ResultorPlugin>,
}

impl ResultorNode {
    pub(crate) fn from_resolved(plugin: Arc<ResolvedPlugin>, path: &str) -> Result<Self> {
        let instance = plugin
            .instance
            .as_resultor()
            .cloned()
            .ok_or_else(|| wrong_kind(&plugin, path, PluginKind::Resultor))?;
        Ok(Self { plugin, instance })
    }

    pub fn name(&self) -> &str {
        &self.plugin.name
    }
}

// ---------------------------------------------------------------------------
// PipelineModel
// ---------------------------------------------------------------------------

/// Reported when a pipeline has no enabled check plugin.
pub const NO_ENABLED_CHECKS: &str = "No check plugin(s) enabled to run.";

/// A fully resolved schema.
///
/// Cloning is cheap: plugin instances are shared. Checks are deduplicated by
/// spec identity in first-seen order.
#[derive(Clone)]
pub struct PipelineModel {
    pub name: String,
    pub uuid: String,
    /// Free-form metadata (e.g. `name_tooltip` on cooked models).
    pub data: Value,
    pub context: ContextNode,
    pub checks: Vec<Arc<CheckNode>>,
    pub resultors: Vec<ResultorNode>,
}

/// A plugin slot in the wire form of a pipeline.
#[derive(Clone)]
pub struct PluginSlot {
    /// JSON pointer into [`PipelineModel::to_schema`] output.
    pub pointer: String,
    /// Dotted field path used in error messages.
    pub path: String,
    pub plugin: Arc<ResolvedPlugin>,
}

impl PipelineModel {
    /// Serialize back to the wire schema accepted by the resolver.
    pub fn to_schema(&self) -> Value {
        json!({
            "name": self.name,
            "uuid": self.uuid,
            "data": self.data,
            "context_plugin": self.context.plugin.to_wire(),
            "check_plugins": self.checks.iter().map(|c| c.plugin.to_wire()).collect::<Vec<_>>(),
            "resultor_plugins": self.resultors.iter().map(|r| r.plugin.to_wire()).collect::<Vec<_>>(),
        })
    }

    /// Checks that will actually run.
    pub fn enabled_checks(&self) -> impl Iterator<Item = &Arc<CheckNode>> {
        self.checks.iter().filter(|c| c.enabled())
    }

    /// Every plugin slot in schema order: root context, then per check its
    /// sub-context, selectors and the check itself, then resultors.
    pub fn slots(&self) -> Vec<PluginSlot> {
        let mut slots = vec![PluginSlot {
            pointer: "/context_plugin".into(),
            path: "context_plugin".into(),
            plugin: self.context.plugin.clone(),
        }];
        for (i, check) in self.checks.iter().enumerate() {
            if let Some(ctx) = &check.context {
                slots.push(PluginSlot {
                    pointer: format!("/check_plugins/{}/context_plugin", i),
                    path: format!("check_plugins[{}].context_plugin", i),
                    plugin: ctx.plugin.clone(),
                });
            }
            for (j, selector) in check.selectors.iter().enumerate() {
                slots.push(PluginSlot {
                    pointer: format!("/check_plugins/{}/selector_plugins/{}", i, j),
                    path: format!("check_plugins[{}].selector_plugins[{}]", i, j),
                    plugin: selector.plugin.clone(),
                });
            }
            slots.push(PluginSlot {
                pointer: format!("/check_plugins/{}", i),
                path: format!("check_plugins[{}]", i),
                plugin: check.plugin.clone(),
            });
        }
        for (i, resultor) in self.resultors.iter().enumerate() {
            slots.push(PluginSlot {
                pointer: format!("/resultor_plugins/{}", i),
                path: format!("resultor_plugins[{}]", i),
                plugin: resultor.plugin.clone(),
            });
        }
        slots
    }
}

impl std::fmt::Debug for PipelineModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineModel")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("context", &self.context.name())
            .field(
                "checks",
                &self.checks.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
