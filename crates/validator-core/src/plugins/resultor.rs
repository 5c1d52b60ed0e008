//! Built-in resultor plugins.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use validator_types::{Result, RunResult};

use super::usda::normalize_path;
use crate::plugin::{Plugin, PluginInstance, PluginKind, ResultorPlugin};
use crate::registry::{BuildPlugin, PluginArgs};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToJsonData {
    pub json_path: String,
}

/// What [`ToJson`] writes.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResultRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub result: RunResult,
}

/// Writes the run result to a JSON file, creating parent directories.
pub struct ToJson {
    path: PathBuf,
}

impl BuildPlugin for ToJson {
    const NAME: &'static str = "ToJson";
    const KIND: PluginKind = PluginKind::Resultor;
    const TOOLTIP: &'static str = "Write the run result to a JSON file";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: ToJsonData = args.data()?;
        if data.json_path.trim().is_empty() {
            return Err(args.invalid("json_path", "must not be empty"));
        }
        Ok(PluginInstance::resultor(ToJson {
            path: normalize_path(data.json_path.as_ref()),
        }))
    }
}

#[async_trait]
impl Plugin for ToJson {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl ResultorPlugin for ToJson {
    async fn result(&self, result: &RunResult) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = ResultRecord {
            timestamp: chrono::Utc::now(),
            result: result.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::debug!(path = %self.path.display(), "Wrote run result");
        Ok(())
    }
}
