//! Built-in check plugins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use validator_types::{Context, Result, StepOutcome};

use super::context::PRIMS_KEY;
use super::selector::AllPrims;
use crate::plugin::{CheckPlugin, Plugin, PluginInstance, PluginKind};
use crate::registry::{BuildPlugin, PluginArgs};

fn all_prims_selector() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        "selector_plugins".into(),
        json!([{ "name": AllPrims::NAME }]),
    );
    fields
}

async fn targets_or_all(ctx: &Context, targets: Option<&[String]>) -> Vec<String> {
    match targets {
        Some(t) => t.to_vec(),
        None => ctx.get_strings(PRIMS_KEY).await,
    }
}

// ---------------------------------------------------------------------------
// PrintPrims
// ---------------------------------------------------------------------------

/// Logs every selected prim. Always passes.
pub struct PrintPrims;

impl BuildPlugin for PrintPrims {
    const NAME: &'static str = "PrintPrims";
    const KIND: PluginKind = PluginKind::Check;
    const TOOLTIP: &'static str = "Print the selected prims";

    fn build(_args: &PluginArgs<'_>) -> Result<PluginInstance> {
        Ok(PluginInstance::check(PrintPrims))
    }
}

#[async_trait]
impl Plugin for PrintPrims {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_fields(&self) -> Map<String, Value> {
        all_prims_selector()
    }
}

#[async_trait]
impl CheckPlugin for PrintPrims {
    async fn check(&self, ctx: &Context, targets: Option<&[String]>) -> Result<StepOutcome> {
        let prims = targets_or_all(ctx, targets).await;
        for prim in &prims {
            tracing::info!(prim = %prim, "Prim");
            ctx.append_log(prim.clone()).await;
        }
        Ok(StepOutcome::success(format!("{} prims", prims.len())))
    }
}

// ---------------------------------------------------------------------------
// PrimCount
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrimCountData {
    #[serde(default)]
    pub min: usize,
    #[serde(default)]
    pub max: Option<usize>,
}

/// Passes when the number of selected prims lies in `[min, max]`.
pub struct PrimCount {
    data: PrimCountData,
}

impl BuildPlugin for PrimCount {
    const NAME: &'static str = "PrimCount";
    const KIND: PluginKind = PluginKind::Check;
    const TOOLTIP: &'static str = "Check how many prims are selected";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: PrimCountData = args.data()?;
        if let Some(max) = data.max {
            if max < data.min {
                return Err(args.invalid("max", format!("must be >= min ({})", data.min)));
            }
        }
        Ok(PluginInstance::check(PrimCount { data }))
    }
}

#[async_trait]
impl Plugin for PrimCount {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn default_fields(&self) -> Map<String, Value> {
        all_prims_selector()
    }
}

#[async_trait]
impl CheckPlugin for PrimCount {
    async fn check(&self, ctx: &Context, targets: Option<&[String]>) -> Result<StepOutcome> {
        let count = targets_or_all(ctx, targets).await.len();
        if count < self.data.min {
            return Ok(StepOutcome::fail(format!(
                "Expected at least {} prims, found {}",
                self.data.min, count
            )));
        }
        if let Some(max) = self.data.max {
            if count > max {
                return Ok(StepOutcome::fail(format!(
                    "Expected at most {} prims, found {}",
                    max, count
                )));
            }
        }
        Ok(StepOutcome::success(format!("{} prims", count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn build<T: BuildPlugin>(data: Value) -> Result<PluginInstance> {
        let fields = BTreeMap::new();
        T::build(&PluginArgs {
            path: "check_plugins[1]",
            data: &data,
            fields: &fields,
        })
    }

    fn check(instance: PluginInstance) -> Arc<dyn CheckPlugin> {
        instance.as_check().unwrap().clone()
    }

    #[tokio::test]
    async fn print_prims_logs_each_target() {
        let ctx = Context::new();
        let plugin = check(build::<PrintPrims>(Value::Null).unwrap());
        let targets = vec!["/World".to_string(), "/World/Cube".to_string()];
        let outcome = plugin.check(&ctx, Some(&targets)).await.unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.message, "2 prims");
        assert_eq!(ctx.logs().await, targets);
    }

    #[tokio::test]
    async fn print_prims_without_selection_uses_context() {
        let ctx = Context::new();
        ctx.set(PRIMS_KEY, json!(["/A"])).await;
        let plugin = check(build::<PrintPrims>(Value::Null).unwrap());
        assert_eq!(plugin.check(&ctx, None).await.unwrap().message, "1 prims");
    }

    #[test]
    fn checks_default_to_all_prims() {
        let instance = build::<PrimCount>(Value::Null).unwrap();
        assert_eq!(
            instance.default_fields().get("selector_plugins"),
            Some(&json!([{"name": "AllPrims"}]))
        );
    }

    #[tokio::test]
    async fn prim_count_bounds() {
        let ctx = Context::new();
        let three: Vec<String> = ["/A", "/B", "/C"].iter().map(|s| s.to_string()).collect();

        let in_range = check(build::<PrimCount>(json!({"min": 1, "max": 3})).unwrap());
        assert!(in_range.check(&ctx, Some(&three)).await.unwrap().passed);

        let too_few = check(build::<PrimCount>(json!({"min": 4})).unwrap());
        let outcome = too_few.check(&ctx, Some(&three)).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.message, "Expected at least 4 prims, found 3");

        let too_many = check(build::<PrimCount>(json!({"max": 2})).unwrap());
        assert!(!too_many.check(&ctx, Some(&three)).await.unwrap().passed);
    }

    #[test]
    fn prim_count_rejects_inverted_bounds() {
        let err = build::<PrimCount>(json!({"min": 5, "max": 1})).err().unwrap();
        assert_eq!(err.field_path(), Some("check_plugins[1].data.max"));
    }
}
