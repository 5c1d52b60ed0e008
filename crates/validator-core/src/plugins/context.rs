//! Built-in context plugins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use validator_types::{Context, Result, StepOutcome, ValidatorError};

use super::usda::{glob_files, normalize_path, scan_prims};
use crate::plugin::{ContextPlugin, Plugin, PluginInstance, PluginKind, TemplateVariant};
use crate::registry::{BuildPlugin, PluginArgs};

/// Context keys written by the layer plugins.
pub const FILE_KEY: &str = "file";
pub const FILES_KEY: &str = "files";
pub const PRIMS_KEY: &str = "prims";

fn cannot_read(path: &Path) -> StepOutcome {
    StepOutcome::fail(format!("Can't read the file {}", path.display()))
}

// ---------------------------------------------------------------------------
// Empty
// ---------------------------------------------------------------------------

/// An environment with nothing in it.
pub struct Empty;

impl BuildPlugin for Empty {
    const NAME: &'static str = "Empty";
    const KIND: PluginKind = PluginKind::Context;
    const TOOLTIP: &'static str = "Context that sets nothing up";

    fn build(_args: &PluginArgs<'_>) -> Result<PluginInstance> {
        Ok(PluginInstance::context(Empty))
    }
}

#[async_trait]
impl Plugin for Empty {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl ContextPlugin for Empty {
    async fn setup(&self, _ctx: &Context) -> Result<StepOutcome> {
        Ok(StepOutcome::success("Ok"))
    }
}

// ---------------------------------------------------------------------------
// USDFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsdFileData {
    pub file: String,
}

/// Opens one text layer and exposes its prims.
pub struct UsdFile {
    data: UsdFileData,
}

impl BuildPlugin for UsdFile {
    const NAME: &'static str = "USDFile";
    const KIND: PluginKind = PluginKind::Context;
    const TOOLTIP: &'static str = "Open a USD text layer";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: UsdFileData = args.data()?;
        if data.file.trim().is_empty() {
            return Err(args.invalid("file", "must not be empty"));
        }
        Ok(PluginInstance::context(UsdFile { data }))
    }
}

#[async_trait]
impl Plugin for UsdFile {
    fn name(&self) -> &str {
        Self::NAME
    }
}

#[async_trait]
impl ContextPlugin for UsdFile {
    async fn setup(&self, ctx: &Context) -> Result<StepOutcome> {
        let path = normalize_path(Path::new(&self.data.file));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Failed to open layer");
                return Ok(cannot_read(&path));
            }
        };
        let prims = scan_prims(&text);
        tracing::info!(file = %path.display(), prims = prims.len(), "Opened layer");
        ctx.set(FILE_KEY, json!(path.to_string_lossy())).await;
        ctx.set(PRIMS_KEY, json!(prims)).await;
        Ok(StepOutcome::success("Ok"))
    }

    async fn teardown(&self, ctx: &Context) -> Result<()> {
        ctx.remove(FILE_KEY).await;
        ctx.remove(PRIMS_KEY).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// USDDirectory
// ---------------------------------------------------------------------------

fn default_pattern() -> String {
    "*.{usd,usda}".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsdDirectoryData {
    pub directory: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Set on cooked pipelines: the single file this job works on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooked_files: Option<Vec<String>>,
}

/// Template context: one job per file matching `pattern` under `directory`.
pub struct UsdDirectory {
    data: UsdDirectoryData,
}

impl UsdDirectory {
    async fn matching_files(&self) -> Result<Vec<PathBuf>> {
        let dir = normalize_path(Path::new(&self.data.directory));
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(ValidatorError::validation(
                    "data.directory",
                    format!("Can't read the directory {}", dir.display()),
                ))
            }
        }
        glob_files(&dir, &self.data.pattern).await
    }
}

impl BuildPlugin for UsdDirectory {
    const NAME: &'static str = "USDDirectory";
    const KIND: PluginKind = PluginKind::Context;
    const TOOLTIP: &'static str = "Open every USD layer of a directory, one job per file";

    fn build(args: &PluginArgs<'_>) -> Result<PluginInstance> {
        let data: UsdDirectoryData = args.data()?;
        if data.directory.trim().is_empty() {
            return Err(args.invalid("directory", "must not be empty"));
        }
        Ok(PluginInstance::context(UsdDirectory { data }))
    }
}

#[async_trait]
impl Plugin for UsdDirectory {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn cook_template(&self) -> Result<Option<Vec<TemplateVariant>>> {
        if self.data.cooked_files.is_some() {
            return Ok(None);
        }
        let files = self.matching_files().await?;
        if files.is_empty() {
            return Err(ValidatorError::validation(
                "data.directory",
                format!(
                    "No file matching '{}' in {}",
                    self.data.pattern,
                    normalize_path(Path::new(&self.data.directory)).display()
                ),
            ));
        }

        let mut variants = Vec::with_capacity(files.len());
        for file in files {
            let full = file.to_string_lossy().to_string();
            let data = UsdDirectoryData {
                cooked_files: Some(vec![full.clone()]),
                ..self.data.clone()
            };
            variants.push(TemplateVariant {
                data: serde_json::to_value(&data)?,
                display_name: file
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| full.clone()),
                tooltip: full,
            });
        }
        Ok(Some(variants))
    }
}

#[async_trait]
impl ContextPlugin for UsdDirectory {
    async fn setup(&self, ctx: &Context) -> Result<StepOutcome> {
        let files = match &self.data.cooked_files {
            Some(files) => files.iter().map(PathBuf::from).collect(),
            None => match self.matching_files().await {
                Ok(files) => files,
                Err(e) => return Ok(StepOutcome::fail(e.to_string())),
            },
        };

        let mut opened = Vec::with_capacity(files.len());
        let mut prims = Vec::new();
        for file in &files {
            let path = normalize_path(file);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => prims.extend(scan_prims(&text)),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to open layer");
                    return Ok(cannot_read(&path));
                }
            }
            opened.push(path.to_string_lossy().to_string());
        }

        tracing::info!(files = opened.len(), prims = prims.len(), "Opened directory layers");
        if let [single] = opened.as_slice() {
            ctx.set(FILE_KEY, json!(single)).await;
        }
        ctx.set(FILES_KEY, json!(opened)).await;
        ctx.set(PRIMS_KEY, json!(prims)).await;
        Ok(StepOutcome::success("Ok"))
    }

    async fn teardown(&self, ctx: &Context) -> Result<()> {
        ctx.remove(FILE_KEY).await;
        ctx.remove(FILES_KEY).await;
        ctx.remove(PRIMS_KEY).await;
        Ok(())
    }
}
