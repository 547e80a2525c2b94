//! JSON dependency lists kept inside device trees.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// One entry of a `*.dependencies` file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Dependency {
    /// Repository name as the manifest should carry it (`org/repo`).
    pub repository: String,
    pub target_path: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
}

/// One entry of a removal list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Removal {
    pub repository: String,
}

/// Parse the JSON list at `path`; `None` when the file does not exist.
pub fn load_list<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    let entries =
        serde_json::from_str(&text).with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(Some(entries))
}
