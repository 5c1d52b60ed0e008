//! Schema resolver: turns a raw JSON schema into live plugin instances.
//!
//! Every object carrying a `"name"` key is a plugin spec. Its other fields are
//! resolved first (depth-first), then the plugin is built through the
//! [`PluginRegistry`], then the plugin's `default_fields()` are resolved and
//! applied for every field the schema left unset. Identical specs (same
//! canonical JSON) resolve to one shared [`ResolvedPlugin`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use validator_types::{Result, ValidatorError};

use crate::model::{CheckNode, ContextNode, PipelineModel, ResultorNode, NO_ENABLED_CHECKS};
use crate::plugin::PluginInstance;
use crate::registry::{PluginArgs, PluginRegistry};

/// Keys of a plugin spec that are not passed through as resolved fields.
const RESERVED_KEYS: [&str; 3] = ["name", "enabled", "data"];

/// Append `key` to a dotted field path.
pub fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", base, key)
    }
}

fn index_path(base: &str, index: usize) -> String {
    format!("{}[{}]", base, index)
}

// ---------------------------------------------------------------------------
// Resolved tree
// ---------------------------------------------------------------------------

/// A schema value with every plugin spec replaced by a live plugin.
#[derive(Debug, Clone)]
pub enum Resolved {
    Scalar(Value),
    List(Vec<Resolved>),
    Map(BTreeMap<String, Resolved>),
    Plugin(Arc<ResolvedPlugin>),
}

impl Resolved {
    pub fn as_plugin(&self) -> Option<&Arc<ResolvedPlugin>> {
        match self {
            Resolved::Plugin(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Resolved::Scalar(Value::Null))
    }

    /// Serialize back to the wire form.
    pub fn to_wire(&self) -> Value {
        match self {
            Resolved::Scalar(v) => v.clone(),
            Resolved::List(items) => Value::Array(items.iter().map(Resolved::to_wire).collect()),
            Resolved::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_wire()))
                    .collect(),
            ),
            Resolved::Plugin(p) => p.to_wire(),
        }
    }
}

/// One plugin spec after resolution.
#[derive(Debug)]
pub struct ResolvedPlugin {
    pub name: String,
    pub enabled: bool,
    /// Raw `data` as written in the schema.
    pub data: Value,
    /// Schema path of the first occurrence.
    pub path: String,
    /// Canonical JSON of the spec; equal keys mean a shared instance.
    pub key: String,
    pub instance: PluginInstance,
    /// Resolved non-reserved fields, defaults included.
    pub fields: BTreeMap<String, Resolved>,
}

impl ResolvedPlugin {
    pub fn field(&self, name: &str) -> Option<&Resolved> {
        self.fields.get(name).filter(|r| !r.is_null())
    }

    pub fn to_wire(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("name".into(), Value::String(self.name.clone()));
        map.insert("enabled".into(), Value::Bool(self.enabled));
        if !self.data.is_null() {
            map.insert("data".into(), self.data.clone());
        }
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_wire());
        }
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Recursive-descent resolver with a per-schema deduplication cache.
pub struct Resolver<'r> {
    registry: &'r PluginRegistry,
    cache: HashMap<String, Arc<ResolvedPlugin>>,
}

impl<'r> Resolver<'r> {
    pub fn new(registry: &'r PluginRegistry) -> Self {
        Self {
            registry,
            cache: HashMap::new(),
        }
    }

    /// Resolve an arbitrary value found at `path`.
    pub fn resolve(&mut self, value: &Value, path: &str) -> Result<Resolved> {
        match value {
            Value::Object(map) if map.contains_key("name") => {
                Ok(Resolved::Plugin(self.resolve_plugin(map, path)?))
            }
            Value::Object(map) => Ok(Resolved::Map(self.resolve_map_values(map, path)?)),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.resolve(item, &index_path(path, i))?);
                }
                Ok(Resolved::List(out))
            }
            scalar => Ok(Resolved::Scalar(scalar.clone())),
        }
    }

    /// Resolve a value that must be a plugin spec.
    pub fn resolve_plugin_spec(&mut self, value: &Value, path: &str) -> Result<Arc<ResolvedPlugin>> {
        match value {
            Value::Object(map) if map.contains_key("name") => self.resolve_plugin(map, path),
            _ => Err(ValidatorError::validation(
                path,
                "expected a plugin spec with a \"name\" key",
            )),
        }
    }

    fn resolve_map_values(
        &mut self,
        map: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<BTreeMap<String, Resolved>> {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            out.insert(k.clone(), self.resolve(v, &join_path(path, k))?);
        }
        Ok(out)
    }

    fn resolve_plugin(
        &mut self,
        map: &serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<Arc<ResolvedPlugin>> {
        let name = map
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidatorError::validation(join_path(path, "name"), "expected a string"))?;

        let key = serde_json::to_string(map)?;
        if let Some(shared) = self.cache.get(&key) {
            return Ok(shared.clone());
        }

        let enabled = match map.get("enabled") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(ValidatorError::validation(
                    join_path(path, "enabled"),
                    "expected a boolean",
                ))
            }
        };
        let data = map.get("data").cloned().unwrap_or(Value::Null);

        // Fields before parent: the constructor sees live nested plugins.
        let mut fields = BTreeMap::new();
        for (k, v) in map {
            if RESERVED_KEYS.contains(&k.as_str()) {
                continue;
            }
            fields.insert(k.clone(), self.resolve(v, &join_path(path, k))?);
        }
        let mut args_fields = fields.clone();
        if let Value::Object(data_map) = &data {
            let resolved_data = self.resolve_map_values(data_map, &join_path(path, "data"))?;
            args_fields.insert("data".to_string(), Resolved::Map(resolved_data));
        }

        let factory = self.registry.resolve(name, path)?;
        let instance = factory.build(&PluginArgs {
            path,
            data: &data,
            fields: &args_fields,
        })?;

        // Second phase: defaults the schema did not override.
        for (k, default) in instance.default_fields() {
            if fields.get(&k).map_or(true, Resolved::is_null) {
                let resolved = self.resolve(&default, &join_path(path, &k))?;
                fields.insert(k, resolved);
            }
        }

        tracing::trace!(plugin = name, path, "Resolved plugin");

        let plugin = Arc::new(ResolvedPlugin {
            name: name.to_string(),
            enabled,
            data,
            path: path.to_string(),
            key: key.clone(),
            instance,
            fields,
        });
        self.cache.insert(key, plugin.clone());
        Ok(plugin)
    }
}

// ---------------------------------------------------------------------------
// Pipeline resolution
// ---------------------------------------------------------------------------

/// Resolve a wire schema into a [`PipelineModel`].
///
/// Fails before any plugin runs; nothing outside the returned model is touched.
pub fn resolve_pipeline(registry: &PluginRegistry, schema: &Value) -> Result<PipelineModel> {
    let obj = schema
        .as_object()
        .ok_or_else(|| ValidatorError::validation("", "schema must be a JSON object"))?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidatorError::validation("name", "missing or not a string"))?
        .to_string();
    let uuid = match obj.get("uuid") {
        None | Some(Value::Null) => uuid::Uuid::new_v4().to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ValidatorError::validation("uuid", "expected a string")),
    };
    let data = match obj.get("data") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(ValidatorError::validation("data", "expected an object")),
    };

    let mut resolver = Resolver::new(registry);

    let context_spec = obj
        .get("context_plugin")
        .ok_or_else(|| ValidatorError::validation("context_plugin", "missing"))?;
    let context = ContextNode::from_resolved(
        resolver.resolve_plugin_spec(context_spec, "context_plugin")?,
        "context_plugin",
    )?;
    if !context.plugin.enabled {
        return Err(ValidatorError::validation(
            "context_plugin.enabled",
            "the root context plugin cannot be disabled",
        ));
    }

    let check_specs = obj
        .get("check_plugins")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidatorError::validation("check_plugins", "expected a list"))?;
    if check_specs.is_empty() {
        return Err(ValidatorError::validation(
            "check_plugins",
            "at least one check plugin is required",
        ));
    }

    // Stable set semantics: first occurrence wins, order preserved.
    let mut seen = HashSet::new();
    let mut checks = Vec::new();
    for (i, spec) in check_specs.iter().enumerate() {
        let path = index_path("check_plugins", i);
        let plugin = resolver.resolve_plugin_spec(spec, &path)?;
        if !seen.insert(plugin.key.clone()) {
            tracing::debug!(check = %plugin.name, path = %path, "Duplicate check collapsed");
            continue;
        }
        checks.push(Arc::new(CheckNode::from_resolved(plugin, &path)?));
    }
    if !checks.iter().any(|c| c.enabled()) {
        return Err(ValidatorError::validation(
            "check_plugins",
            NO_ENABLED_CHECKS,
        ));
    }

    let mut resultors = Vec::new();
    match obj.get("resultor_plugins") {
        None | Some(Value::Null) => {}
        Some(Value::Array(specs)) => {
            let mut seen = HashSet::new();
            for (i, spec) in specs.iter().enumerate() {
                let path = index_path("resultor_plugins", i);
                let plugin = resolver.resolve_plugin_spec(spec, &path)?;
                if seen.insert(plugin.key.clone()) {
                    resultors.push(ResultorNode::from_resolved(plugin, &path)?);
                }
            }
        }
        Some(_) => {
            return Err(ValidatorError::validation(
                "resultor_plugins",
                "expected a list",
            ))
        }
    }

    Ok(PipelineModel {
        name,
        uuid,
        data,
        context,
        checks,
        resultors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_registry;
    use serde_json::json;

    fn example_schema() -> Value {
        json!({
            "name": "Example",
            "uuid": "00000000-0000-0000-0000-000000000001",
            "context_plugin": {"name": "USDFile", "data": {"file": "cubes.usda"}},
            "check_plugins": [
                {"name": "PrintPrims", "selector_plugins": [{"name": "AllPrims"}]}
            ]
        })
    }

    #[test]
    fn resolves_example_schema() {
        let registry = default_registry();
        let model = resolve_pipeline(&registry, &example_schema()).unwrap();
        assert_eq!(model.name, "Example");
        assert_eq!(model.context.name(), "USDFile");
        assert_eq!(model.checks.len(), 1);
        assert_eq!(model.checks[0].selectors.len(), 1);
        assert_eq!(model.checks[0].selectors[0].name(), "AllPrims");
        assert!(model.checks[0].context.is_none());
    }

    #[test]
    fn generates_uuid_when_missing() {
        let registry = default_registry();
        let mut schema = example_schema();
        schema.as_object_mut().unwrap().remove("uuid");
        let a = resolve_pipeline(&registry, &schema).unwrap();
        let b = resolve_pipeline(&registry, &schema).unwrap();
        assert_ne!(a.uuid, b.uuid);
        assert!(uuid::Uuid::parse_str(&a.uuid).is_ok());
    }

    #[test]
    fn resolution_is_idempotent() {
        let registry = default_registry();
        let schema = json!({
            "name": "Twice",
            "uuid": "fixed",
            "context_plugin": {"name": "Empty"},
            "check_plugins": [
                {"name": "PrimCount", "data": {"min": 1}},
                {"name": "PrintPrims"},
                {"name": "PrimCount", "data": {"min": 1}}
            ]
        });
        let a = resolve_pipeline(&registry, &schema).unwrap();
        let b = resolve_pipeline(&registry, &schema).unwrap();
        assert_eq!(a.checks.len(), 2);
        assert_eq!(a.checks.len(), b.checks.len());
        let names = |m: &PipelineModel| m.checks.iter().map(|c| c.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(&a), vec!["PrimCount", "PrintPrims"]);
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.to_schema(), b.to_schema());

        // The wire form resolves to the same structure again.
        let c = resolve_pipeline(&registry, &a.to_schema()).unwrap();
        assert_eq!(c.to_schema(), a.to_schema());
    }

    #[test]
    fn identical_specs_share_one_instance() {
        let registry = default_registry();
        let schema = json!({
            "name": "Shared",
            "context_plugin": {"name": "Empty"},
            "check_plugins": [
                {"name": "PrintPrims", "selector_plugins": [{"name": "PrimRegex", "data": {"pattern": "Cube"}}]},
                {"name": "PrimCount", "selector_plugins": [{"name": "PrimRegex", "data": {"pattern": "Cube"}}]}
            ]
        });
        let model = resolve_pipeline(&registry, &schema).unwrap();
        let a = &model.checks[0].selectors[0].plugin;
        let b = &model.checks[1].selectors[0].plugin;
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn default_selector_applied_when_unset() {
        let registry = default_registry();
        let schema = json!({
            "name": "Defaults",
            "context_plugin": {"name": "Empty"},
            "check_plugins": [{"name": "PrintPrims"}]
        });
        let model = resolve_pipeline(&registry, &schema).unwrap();
        assert_eq!(model.checks[0].selectors.len(), 1);
        assert_eq!(model.checks[0].selectors[0].name(), "AllPrims");
    }

    #[test]
    fn explicit_empty_selector_list_is_kept() {
        let registry = default_registry();
        let schema = json!({
            "name": "NoSelectors",
            "context_plugin": {"name": "Empty"},
            "check_plugins": [{"name": "PrintPrims", "selector_plugins": []}]
        });
        let model = resolve_pipeline(&registry, &schema).unwrap();
        assert!(model.checks[0].selectors.is_empty());
    }

    #[test]
    fn unregistered_plugin_names_offending_key() {
        let registry = default_registry();
        let schema = json!({
            "name": "Bad",
            "context_plugin": {"name": "Empty"},
            "check_plugins": [
                {"name": "PrintPrims"},
                {"name": "PrintPrims", "selector_plugins": [{"name": "Nope"}]}
            ]
        });
        let err = resolve_pipeline(&registry, &schema).unwrap_err();
        match err {
            ValidatorError::UnregisteredPlugin { name, path } => {
                assert_eq!(name, "Nope");
                assert_eq!(path, "check_plugins[1].selector_plugins[0]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_plugin_kind_is_a_validation_error() {
        let registry = default_registry();
        let schema = json!({
            "name": "Kind",
            "context_plugin": {"name": "AllPrims"},
            "check_plugins": [{"name": "PrintPrims"}]
        });
        let err = resolve_pipeline(&registry, &schema).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.field_path(), Some("context_plugin"));
    }

    #[test]
    fn shape_errors() {
        let registry = default_registry();
        let cases = [
            (json!([]), ""),
            (json!({"context_plugin": {"name": "Empty"}, "check_plugins": [{"name": "PrintPrims"}]}), "name"),
            (json!({"name": "x", "check_plugins": [{"name": "PrintPrims"}]}), "context_plugin"),
            (json!({"name": "x", "context_plugin": {"name": "Empty"}, "check_plugins": []}), "check_plugins"),
            (json!({"name": "x", "context_plugin": {"name": "Empty"}, "check_plugins": [{"name": "PrintPrims", "enabled": false}]}), "check_plugins"),
            (json!({"name": "x", "context_plugin": {"name": "Empty", "enabled": false}, "check_plugins": [{"name": "PrintPrims"}]}), "context_plugin.enabled"),
            (json!({"name": "x", "context_plugin": {"name": "Empty", "enabled": "yes"}, "check_plugins": [{"name": "PrintPrims"}]}), "context_plugin.enabled"),
            (json!({"name": "x", "context_plugin": {"name": "USDFile", "data": {"file": 4}}, "check_plugins": [{"name": "PrintPrims"}]}), "context_plugin.data"),
            (json!({"name": "x", "context_plugin": {"name": "Empty"}, "check_plugins": [{"name": "PrintPrims"}], "resultor_plugins": {}}), "resultor_plugins"),
        ];
        for (schema, path) in cases {
            let err = resolve_pipeline(&registry, &schema).unwrap_err();
            assert!(err.is_validation(), "{err}");
            assert_eq!(err.field_path(), Some(path), "{err}");
        }
    }

    #[test]
    fn nested_maps_without_name_are_walked() {
        let registry = default_registry();
        let mut resolver = Resolver::new(&registry);
        let value = json!({"group": {"inner": [{"name": "AllPrims"}, 3]}});
        let resolved = resolver.resolve(&value, "").unwrap();
        let Resolved::Map(map) = &resolved else {
            panic!("expected a map");
        };
        let Resolved::Map(group) = &map["group"] else {
            panic!("expected a nested map");
        };
        let Resolved::List(items) = &group["inner"] else {
            panic!("expected a list");
        };
        assert_eq!(items[0].as_plugin().unwrap().name, "AllPrims");
        assert_eq!(items[0].as_plugin().unwrap().path, "group.inner[0]");
        assert!(matches!(items[1], Resolved::Scalar(ref v) if v == &json!(3)));
        assert_eq!(resolved.to_wire()["group"]["inner"][1], json!(3));
    }
}
