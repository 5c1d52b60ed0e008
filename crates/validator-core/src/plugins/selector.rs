//! Built-in selector plugins.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use validator_types::{Context, Result, ValidatorError};

use super::context::PRIMS_KEY;
use crate::plugin::{Plugin, PluginInstance, PluginKind, SelectorPlugin, TemplateVariant};
use crate::registry::{BuildPlugin, PluginArgs};

/// Every prim of the opened layers.
pub struct AllPrims;

impl BuildPlugin for AllPrims {
    const NAME: &'static str = "AllPrims";
    const KIND: PluginKind = PluginKind::Selector;
    const TOOLTIP: &'static str = "Select every prim";

    fn build(_args: &PluginArgs<'_>) -> Result<PluginInstance> {
        Ok(PluginInstance::selector(AllPrims))
    }
}

#[async_trait]
impl Plugin for AllPrims {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl SelectorPlugin for AllPrims {
    async fn select(&self, ctx: &Context, _previous: Option<Vec<String>>) -> Result<Vec<String>> {
        Ok(ctx.get_strings(PRIMS_KEY).await)
    }
}

// ---------------------------------------------------------------------------
// PrimPaths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimPathsData {
    pub paths: Vec<String>,
    /// Template mode: cook one pipeline per path.
    #[serde(default)]
    pub per_item: bool,
}

/// A fixed list of prim paths.
pub struct PrimPaths {
    data: PrimPathsData,
}

impl BuildPlugin for PrimPaths {
    const NAME: &'static str = "PrimPaths";
    const KIND: PluginKind = PluginKind::Selector;
    const TOOLTIP: &'static str = "Select the listed prim paths";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: PrimPathsData = args.data()?;
        if let Some(bad) = data.paths.iter().find(|p| !p.starts_with('/')) {
            return Err(args.invalid("paths", format!("'{}' is not an absolute prim path", bad)));
        }
        Ok(PluginInstance::selector(PrimPaths { data }))
    }
}

#[async_trait]
impl Plugin for PrimPaths {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn cook_template(&self) -> Result<Option<Vec<TemplateVariant>>> {
        if !self.data.per_item {
            return Ok(None);
        }
        if self.data.paths.is_empty() {
            return Err(ValidatorError::validation("data.paths", "no path to expand"));
        }
        let variants = self
            .data
            .paths
            .iter()
            .map(|path| TemplateVariant {
                data: json!({"paths": [path], "per_item": false}),
                display_name: path.rsplit('/').next().unwrap_or(path).to_string(),
                tooltip: path.clone(),
            })
            .collect();
        Ok(Some(variants))
    }
}

#[async_trait]
impl SelectorPlugin for PrimPaths {
    async fn select(&self, _ctx: &Context, _previous: Option<Vec<String>>) -> Result<Vec<String>> {
        Ok(self.data.paths.clone())
    }
}

// ---------------------------------------------------------------------------
// PrimRegex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimRegexData {
    pub pattern: String,
}

/// Narrows the previous selection (or all prims) to paths matching `pattern`.
pub struct PrimRegex {
    regex: Regex,
}

impl BuildPlugin for PrimRegex {
    const NAME: &'static str = "PrimRegex";
    const KIND: PluginKind = PluginKind::Selector;
    const TOOLTIP: &'static str = "Filter prim paths with a regular expression";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: PrimRegexData = args.data()?;
        let regex = Regex::new(&data.pattern).map_err(|e| args.invalid("pattern", e.to_string()))?;
        Ok(PluginInstance::selector(PrimRegex { regex }))
    }
}

#[async_trait]
impl Plugin for PrimRegex {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl SelectorPlugin for PrimRegex {
    async fn select(&self, ctx: &Context, previous: Option<Vec<String>>) -> Result<Vec<String>> {
        let input = match previous {
            Some(prev) => prev,
            None => ctx.get_strings(PRIMS_KEY).await,
        };
        Ok(input.into_iter().filter(|p| self.regex.is_match(p)).collect())
    }
}
