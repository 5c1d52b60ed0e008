//! Built-in plugins for text USD layers.

mod check;
mod context;
mod resultor;
mod selector;
mod usda;

pub use check::{PrimCount, PrimCountData, PrintPrims};
pub use context::{Empty, UsdDirectory, UsdDirectoryData, UsdFile, UsdFileData, FILES_KEY, FILE_KEY, PRIMS_KEY};
pub use resultor::{ResultRecord, ToJson, ToJsonData};
pub use selector::{AllPrims, PrimPaths, PrimPathsData, PrimRegex, PrimRegexData};
pub use usda::{glob_files, normalize_path, scan_prims};

use crate::registry::PluginRegistry;

/// Add every built-in plugin to `registry`.
pub(crate) fn register_builtins(registry: PluginRegistry) -> PluginRegistry {
    registry
        .with::<Empty>()
        .with::<UsdFile>()
        .with::<UsdDirectory>()
        .with::<AllPrims>()
        .with::<PrimPaths>()
        .with::<PrimRegex>()
        .with::<PrintPrims>()
        .with::<PrimCount>()
        .with::<ToJson>()
}
