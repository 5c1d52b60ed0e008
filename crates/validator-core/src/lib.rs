//! Schema-driven validation pipelines.
//!
//! This crate turns a JSON pipeline schema into an executable object graph
//! and runs it: plugin registry, schema resolution with shared plugin
//! instances, the single-run manager, run events, template cooking and the
//! built-in plugins for text USD layers.

pub mod cook;
pub mod events;
pub mod manager;
pub mod model;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use cook::{cook, cook_all};
pub use events::{Event, EventEmitter, RunEvent, Subscription};
pub use manager::{wait_cancelled, ContextResult, RunManager, RunState};
pub use model::{
    CheckNode, ContextNode, PipelineModel, PluginSlot, ResultorNode, SelectorNode, NO_ENABLED_CHECKS,
};
pub use plugin::{
    CheckPlugin, ContextPlugin, Plugin, PluginInstance, PluginKind, ResultorPlugin, SelectorPlugin,
    TemplateVariant,
};
pub use registry::{
    default_registry, shared_registry, BuildPlugin, PluginArgs, PluginFactory, PluginRegistry,
};
pub use resolver::{resolve_pipeline, Resolved, ResolvedPlugin, Resolver};
