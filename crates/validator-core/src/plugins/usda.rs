//! Helpers for text USD layers: prim scanning, path normalization, globbing.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSetBuilder};

use validator_types::{Result, ValidatorError};

/// Make `path` absolute (relative to the working directory) and fold `.` and
/// `..` lexically. The file does not need to exist.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Name of the prim declared on `line`, if any.
fn prim_name(line: &str) -> Option<&str> {
    let rest = ["def ", "over ", "class "]
        .iter()
        .find_map(|kw| line.strip_prefix(kw))?;
    let start = rest.find('"')? + 1;
    let len = rest[start..].find('"')?;
    let name = &rest[start..start + len];
    (!name.is_empty()).then_some(name)
}

/// List every prim path declared in a `.usda` text layer, in file order.
///
/// Nesting follows prim bodies (`{ ... }`); braces inside metadata parentheses
/// and strings are ignored, as are `#` comments.
pub fn scan_prims(text: &str) -> Vec<String> {
    let mut prims = Vec::new();
    // (prim path, brace depth of its body)
    let mut open: Vec<(String, usize)> = Vec::new();
    let mut pending: Option<String> = None;
    let mut depth = 0usize;
    let mut parens = 0usize;

    for line in text.lines() {
        if parens == 0 {
            if let Some(name) = prim_name(line.trim_start()) {
                let parent = open.last().map(|(p, _)| p.as_str()).unwrap_or("");
                let path = format!("{}/{}", parent, name);
                prims.push(path.clone());
                pending = Some(path);
            }
        }

        let mut in_string = false;
        let mut escaped = false;
        for ch in line.chars() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if ch == '\\' {
                    escaped = true;
                } else if ch == '"' {
                    in_string = false;
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '#' => break,
                '(' => parens += 1,
                ')' => parens = parens.saturating_sub(1),
                '{' => {
                    depth += 1;
                    if parens == 0 {
                        if let Some(path) = pending.take() {
                            open.push((path, depth));
                        }
                    }
                }
                '}' => {
                    if open.last().is_some_and(|(_, d)| *d == depth) {
                        open.pop();
                    }
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
        }
    }
    prims
}

/// Files under `base` whose path relative to `base` matches `pattern`, sorted.
pub async fn glob_files(base: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let glob = Glob::new(pattern)
        .map_err(|e| ValidatorError::validation("data.pattern", e.to_string()))?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    let set = builder
        .build()
        .map_err(|e| ValidatorError::validation("data.pattern", e.to_string()))?;

    let mut matches = Vec::new();
    let mut visited = HashSet::new();
    collect_glob_matches(base, base, &set, &mut visited, &mut matches).await?;
    matches.sort();
    Ok(matches)
}

/// Walks `current`, following symlinks. Each real directory is entered once,
/// which keeps symlink cycles finite.
async fn collect_glob_matches(
    base: &Path,
    current: &Path,
    set: &globset::GlobSet,
    visited: &mut HashSet<PathBuf>,
    matches: &mut Vec<PathBuf>,
) -> Result<()> {
    let meta = tokio::fs::metadata(current).await?;
    if meta.is_file() {
        if let Ok(rel) = current.strip_prefix(base) {
            if set.is_match(rel) {
                matches.push(current.to_path_buf());
            }
        }
    } else if meta.is_dir() {
        if !visited.insert(tokio::fs::canonicalize(current).await?) {
            tracing::debug!(path = %current.display(), "Directory already walked");
            return Ok(());
        }
        let mut read_dir = tokio::fs::read_dir(current).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            Box::pin(collect_glob_matches(base, &entry.path(), set, visited, matches)).await?;
        }
    }
    Ok(())
}
