//! Plugin registry: maps plugin names to constructors.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use serde::de::DeserializeOwned;

use validator_types::{Result, ValidatorError};

use crate::plugin::{PluginInstance, PluginKind};
use crate::resolver::{join_path, Resolved};

// ---------------------------------------------------------------------------
// Construction arguments
// ---------------------------------------------------------------------------

/// Everything a plugin constructor receives.
pub struct PluginArgs<'a> {
    /// Field path of the plugin spec in the schema, used in error messages.
    pub path: &'a str,
    /// The raw `data` map of the spec (`Null` when absent).
    pub data: &'a serde_json::Value,
    /// Already-resolved sibling fields of the spec (nested plugins included).
    pub fields: &'a BTreeMap<String, Resolved>,
}

impl PluginArgs<'_> {
    /// Deserialize `data` into the plugin's typed data. Missing data behaves
    /// like an empty map so serde defaults apply.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        let value = if self.data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.data.clone()
        };
        serde_json::from_value(value)
            .map_err(|e| ValidatorError::validation(join_path(self.path, "data"), e.to_string()))
    }

    /// Error for an invalid value in `data.<field>`.
    pub fn invalid(&self, field: &str, message: impl Into<String>) -> ValidatorError {
        let data_path = join_path(self.path, "data");
        ValidatorError::validation(join_path(&data_path, field), message)
    }
}

/// A plugin type that can be registered by name.
pub trait BuildPlugin: Send + Sync + 'static {
    const NAME: &'static str;
    const KIND: PluginKind;
    const TOOLTIP: &'static str = "";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance>;
}

type BuildFn = fn(&PluginArgs<'_>) -> Result<PluginInstance>;

/// A registered constructor.
#[derive(Clone, Copy)]
pub struct PluginFactory {
    pub name: &'static str,
    pub kind: PluginKind,
    pub tooltip: &'static str,
    type_id: TypeId,
    build: BuildFn,
}

impl PluginFactory {
    fn of<T: BuildPlugin>() -> Self {
        Self {
            name: T::NAME,
            kind: T::KIND,
            tooltip: T::TOOLTIP,
            type_id: TypeId::of::<T>(),
            build: T::build,
        }
    }

    pub fn build(&self, args: &PluginArgs<'_>) -> Result<PluginInstance> {
        (self.build)(args)
    }
}

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

/// Name → constructor table. Written at startup, read-only afterwards.
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `T` under `T::NAME`.
    ///
    /// Registering the same type twice is a no-op; a different type under a
    /// taken name is a [`ValidatorError::DuplicatePlugin`].
    pub fn register<T: BuildPlugin>(&mut self) -> Result<()> {
        let factory = PluginFactory::of::<T>();
        if let Some(existing) = self.factories.get(T::NAME) {
            if existing.type_id == factory.type_id {
                return Ok(());
            }
            return Err(ValidatorError::DuplicatePlugin {
                name: T::NAME.to_string(),
            });
        }
        tracing::debug!(plugin = T::NAME, kind = %T::KIND, "Registered plugin");
        self.factories.insert(T::NAME.to_string(), factory);
        Ok(())
    }

    /// Builder-style registration used for the built-in set.
    pub(crate) fn with<T: BuildPlugin>(mut self) -> Self {
        self.factories
            .insert(T::NAME.to_string(), PluginFactory::of::<T>());
        self
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Look up `name`, failing with the schema path of the offending spec.
    pub fn resolve(&self, name: &str, path: &str) -> Result<&PluginFactory> {
        self.factories
            .get(name)
            .ok_or_else(|| ValidatorError::UnregisteredPlugin {
                name: name.to_string(),
                path: path.to_string(),
            })
    }

    /// All registered factories, sorted by name.
    pub fn factories(&self) -> Vec<&PluginFactory> {
        let mut all: Vec<&PluginFactory> = self.factories.values().collect();
        all.sort_by_key(|f| f.name);
        all
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry pre-loaded with the built-in plugins.
pub fn default_registry() -> PluginRegistry {
    crate::plugins::register_builtins(PluginRegistry::new())
}

static SHARED: OnceLock<Arc<PluginRegistry>> = OnceLock::new();

/// Process-wide default registry for binaries. Library code takes an
/// `Arc<PluginRegistry>` explicitly.
pub fn shared_registry() -> Arc<PluginRegistry> {
    SHARED
        .get_or_init(|| Arc::new(default_registry()))
        .clone()
}
