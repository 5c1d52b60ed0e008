//! Template cooking: expand a template pipeline into concrete pipelines.
//!
//! A plugin slot is a template when its plugin returns variants from
//! `cook_template()`. The cooker takes the Cartesian product over all template
//! slots, substitutes each combination into a copy of the wire schema and
//! resolves the copy again, so shape errors surface before anything runs.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use validator_types::{Result, ValidatorError};

use crate::model::{PipelineModel, PluginSlot};
use crate::plugin::TemplateVariant;
use crate::registry::PluginRegistry;
use crate::resolver::{join_path, resolve_pipeline};

/// Slots sharing one plugin spec, expanded together.
struct TemplateGroup {
    plugin: String,
    slots: Vec<PluginSlot>,
    variants: Vec<TemplateVariant>,
}

fn cook_error(slot: &PluginSlot, err: ValidatorError) -> ValidatorError {
    let source = match err {
        e @ ValidatorError::TemplateCook { .. } => return e,
        ValidatorError::Validation { path, message } => ValidatorError::Validation {
            path: join_path(&slot.path, &path),
            message,
        },
        other => other,
    };
    ValidatorError::TemplateCook {
        plugin: slot.plugin.name.clone(),
        source: Box::new(source),
    }
}

/// Every combination of one index per group; the first group varies slowest.
fn cartesian(sizes: &[usize]) -> Vec<Vec<usize>> {
    let mut combos: Vec<Vec<usize>> = vec![Vec::new()];
    for &size in sizes {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                (0..size).map(move |i| {
                    let mut combo = prefix.clone();
                    combo.push(i);
                    combo
                })
            })
            .collect();
    }
    combos
}

async fn template_groups(pipeline: &PipelineModel) -> Result<Vec<TemplateGroup>> {
    let mut groups: Vec<TemplateGroup> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut plain: HashSet<String> = HashSet::new();

    let slots = pipeline.slots();
    // A disabled plugin never runs, and neither does anything nested under it.
    let disabled: Vec<String> = slots
        .iter()
        .filter(|s| !s.plugin.enabled)
        .map(|s| format!("{}.", s.path))
        .collect();

    for slot in slots {
        if !slot.plugin.enabled || disabled.iter().any(|p| slot.path.starts_with(p.as_str())) {
            continue;
        }
        let key = &slot.plugin.key;
        if plain.contains(key) {
            continue;
        }
        if let Some(&i) = by_key.get(key) {
            groups[i].slots.push(slot);
            continue;
        }
        let variants = match slot.plugin.instance.cook_template().await {
            Ok(Some(variants)) => variants,
            Ok(None) => {
                plain.insert(key.clone());
                continue;
            }
            Err(e) => return Err(cook_error(&slot, e)),
        };
        if variants.is_empty() {
            return Err(cook_error(
                &slot,
                ValidatorError::validation("data", "template produced no concrete value"),
            ));
        }
        tracing::debug!(
            plugin = %slot.plugin.name,
            path = %slot.path,
            variants = variants.len(),
            "Template slot"
        );
        by_key.insert(key.clone(), groups.len());
        groups.push(TemplateGroup {
            plugin: slot.plugin.name.clone(),
            slots: vec![slot],
            variants,
        });
    }
    Ok(groups)
}

/// Expand `pipeline` into concrete pipelines.
///
/// A pipeline without template slots cooks to `[pipeline]` unchanged. Every
/// cooked pipeline gets a fresh uuid, a display name built from the chosen
/// variants and a `name_tooltip` entry in its `data`.
pub async fn cook(registry: &PluginRegistry, pipeline: &PipelineModel) -> Result<Vec<PipelineModel>> {
    let groups = template_groups(pipeline).await?;
    if groups.is_empty() {
        return Ok(vec![pipeline.clone()]);
    }

    let base = pipeline.to_schema();
    let sizes: Vec<usize> = groups.iter().map(|g| g.variants.len()).collect();
    let mut cooked = Vec::new();

    for combo in cartesian(&sizes) {
        let mut schema = base.clone();
        let mut names = Vec::with_capacity(groups.len());
        let mut tooltips = Vec::with_capacity(groups.len());

        for (group, &choice) in groups.iter().zip(&combo) {
            let variant = &group.variants[choice];
            for slot in &group.slots {
                if let Some(node) = schema.pointer_mut(&slot.pointer).and_then(Value::as_object_mut) {
                    node.insert("data".into(), variant.data.clone());
                }
            }
            names.push(variant.display_name.clone());
            tooltips.push(variant.tooltip.clone());
        }

        if let Some(obj) = schema.as_object_mut() {
            obj.insert("uuid".into(), Value::String(uuid::Uuid::new_v4().to_string()));
            obj.insert("name".into(), Value::String(names.join(" / ")));
            if let Some(data) = obj.get_mut("data").and_then(Value::as_object_mut) {
                data.insert("name_tooltip".into(), Value::String(tooltips.join("\n")));
            }
        }

        let model = resolve_pipeline(registry, &schema).map_err(|e| ValidatorError::TemplateCook {
            plugin: groups
                .iter()
                .map(|g| g.plugin.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            source: Box::new(e),
        })?;
        cooked.push(model);
    }

    tracing::info!(pipeline = %pipeline.name, count = cooked.len(), "Cooked template");
    Ok(cooked)
}

/// Cook every pipeline, keeping input order.
pub async fn cook_all(registry: &PluginRegistry, pipelines: &[PipelineModel]) -> Result<Vec<PipelineModel>> {
    let mut out = Vec::new();
    for pipeline in pipelines {
        out.extend(cook(registry, pipeline).await?);
    }
    Ok(out)
}
