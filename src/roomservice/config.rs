use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the device and dependency repositories come from, and which local
/// manifests are rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoomserviceConfig {
    /// Base URL of the forge API.
    pub api_url: String,
    /// Forge user or organization whose repositories are listed.
    pub organization: String,
    /// File name under `.repo/local_manifests/`.
    pub local_manifest: String,
    /// Remote written on newly added projects.
    pub remote: String,
    /// Revision used when a dependency names no branch.
    pub default_revision: String,
    /// File name of the dependency list inside a device tree.
    pub dependencies_file: String,
    pub cleaner: CleanerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanerConfig {
    /// File name under `.repo/local_manifests/` holding `remove-project` entries.
    pub removal_manifest: String,
    /// File name of the removal list inside a device tree.
    pub removal_dependencies_file: String,
    /// Organization prefix shown when a removal already exists.
    pub organization: String,
}

impl Default for RoomserviceConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            organization: "SlimRoms".to_string(),
            local_manifest: "slim_manifest.xml".to_string(),
            remote: "github".to_string(),
            default_revision: "lp5.0".to_string(),
            dependencies_file: "slim.dependencies".to_string(),
            cleaner: CleanerConfig::default(),
        }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            removal_manifest: "00_aicp_removals.xml".to_string(),
            removal_dependencies_file: "aicp.removal.dependencies".to_string(),
            organization: "AICP".to_string(),
        }
    }
}

impl RoomserviceConfig {
    /// Load the config from `explicit`, or from the per-user default location.
    ///
    /// An explicit path must exist. A missing default file yields the
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading roomservice config '{}'", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("parsing roomservice config '{}'", path.display()))
    }
}

/// `$XDG_CONFIG_HOME/releasetools/roomservice.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("releasetools").join("roomservice.toml"))
}
