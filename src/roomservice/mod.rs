//! Local-manifest helpers for a repo-managed source tree.
//!
//! `roomservice` finds a device repository on the forge, adds it to the
//! local manifest, syncs it and then pulls in the dependencies the device
//! tree declares. `roomcleaner` adds `remove-project` entries a device tree
//! asks for.
//!
//! Every path is relative to the source tree root (the directory holding
//! `.repo/`).

pub mod cleaner;
pub mod config;
pub mod dependencies;
pub mod forge;
pub mod manifest;

pub use cleaner::run_roomcleaner;
pub use config::RoomserviceConfig;
pub use forge::{HttpClient, ReqwestClient};

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::process::{Cmd, ToolRunner};
use dependencies::{load_list, Dependency};
use forge::list_repositories;
use manifest::{Manifest, ProjectSpec};

/// `.repo/local_manifests` under `root`.
pub fn local_manifests_dir(root: &Path) -> PathBuf {
    root.join(".repo").join("local_manifests")
}

/// The device name is whatever follows the first `_` of the product.
pub fn device_from_product(product: &str) -> &str {
    product
        .split_once('_')
        .map_or(product, |(_, device)| device)
}

/// How a roomservice run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomserviceOutcome {
    /// The device repository was added and synced at `path`.
    DeviceSynced { path: String },
    /// Dependencies of the tree at `path` were processed.
    DependenciesFetched { path: String },
    /// No device repository could be located.
    DeviceNotFound,
}

pub struct RoomService<'a> {
    pub root: &'a Path,
    pub config: &'a RoomserviceConfig,
    pub http: &'a dyn HttpClient,
    pub runner: &'a dyn ToolRunner,
}

impl RoomService<'_> {
    fn local_manifest_path(&self) -> PathBuf {
        local_manifests_dir(self.root).join(&self.config.local_manifest)
    }

    pub fn run(&self, product: &str, depsonly: bool) -> Result<RoomserviceOutcome> {
        let device = device_from_product(product);
        if depsonly {
            return self.dependencies_only(device);
        }

        let config = self.config;
        info!(
            "Device {device} not found. Attempting to retrieve device repository from {} ({})",
            config.organization, config.api_url
        );
        let repositories = list_repositories(self.http, &config.api_url, &config.organization)?;

        let suffix = format!("_{device}");
        // `device_<device>` has no manufacturer part; it collapses onto the device name.
        let found = repositories.iter().find_map(|repo| {
            if !repo.name.ends_with(&suffix) {
                return None;
            }
            let rest = repo.name.strip_prefix("device_")?;
            let manufacturer = rest.strip_suffix(&suffix).unwrap_or(rest);
            Some((repo.name.as_str(), manufacturer))
        });
        let Some((repo_name, manufacturer)) = found else {
            warn!(
                "Repository for {device} not found in the {} repository list. If this is in error, you may need to manually add it to {}",
                config.organization,
                Path::new(".repo/local_manifests")
                    .join(&config.local_manifest)
                    .display()
            );
            return Ok(RoomserviceOutcome::DeviceNotFound);
        };

        info!("Found repository: {repo_name}");
        let repo_path = format!("device/{manufacturer}/{device}");
        let full_name = format!("{}/{}", config.organization, repo_name);

        let manifest_path = self.local_manifest_path();
        let mut manifest = Manifest::load(&manifest_path);
        manifest.add_device_project(
            repo_name,
            &ProjectSpec {
                name: &full_name,
                path: &repo_path,
                remote: &config.remote,
                revision: &config.default_revision,
            },
        );
        manifest.save(&manifest_path)?;

        info!("Syncing repository to retrieve project.");
        self.repo_sync(&[repo_path.as_str()])?;
        info!("Repository synced!");

        self.fetch_dependencies(&repo_path)?;
        info!("Done");
        Ok(RoomserviceOutcome::DeviceSynced { path: repo_path })
    }

    fn dependencies_only(&self, device: &str) -> Result<RoomserviceOutcome> {
        let local = Manifest::load(&self.local_manifest_path());
        let path = match local.device_path(device) {
            Some(path) => Some(path.to_string()),
            None => Manifest::load(&self.root.join(".repo").join("manifest.xml"))
                .device_path(device)
                .map(str::to_string),
        };
        let Some(path) = path else {
            warn!("Trying dependencies-only mode on a non-existing device tree?");
            return Ok(RoomserviceOutcome::DeviceNotFound);
        };
        self.fetch_dependencies(&path)?;
        Ok(RoomserviceOutcome::DependenciesFetched { path })
    }

    /// Merge the dependencies declared by the tree at `repo_path` and sync the
    /// ones that were not already pinned. Returns the synced target paths.
    pub fn fetch_dependencies(&self, repo_path: &str) -> Result<Vec<String>> {
        info!("Looking for dependencies");
        let config = self.config;
        let deps_path = self.root.join(repo_path).join(&config.dependencies_file);
        let Some(dependencies) = load_list::<Dependency>(&deps_path)? else {
            info!("Dependencies file not found, bailing out.");
            return Ok(Vec::new());
        };

        let manifest_path = self.local_manifest_path();
        let mut manifest = Manifest::load(&manifest_path);
        let revision_of = |dep: &Dependency| {
            dep.branch
                .clone()
                .unwrap_or_else(|| config.default_revision.clone())
        };

        let pending: Vec<&Dependency> = dependencies
            .iter()
            .filter(|dep| !manifest.has_project(&dep.repository, &revision_of(dep)))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        info!("Adding dependencies to manifest");
        for dep in &pending {
            let revision = revision_of(dep);
            manifest.add_dependency_project(&ProjectSpec {
                name: &dep.repository,
                path: &dep.target_path,
                remote: dep.remote.as_deref().unwrap_or(&config.remote),
                revision: &revision,
            });
        }
        manifest.save(&manifest_path)?;

        let targets: Vec<&str> = pending.iter().map(|dep| dep.target_path.as_str()).collect();
        info!("Syncing dependencies");
        self.repo_sync(&targets)?;
        Ok(targets.into_iter().map(str::to_string).collect())
    }

    fn repo_sync(&self, paths: &[&str]) -> Result<()> {
        Cmd::new("repo")
            .arg("sync")
            .args(paths.iter().copied())
            .current_dir(self.root)
            .error_msg(format!("repo sync {} failed", paths.join(" ")))
            .run_with(self.runner)?;
        Ok(())
    }
}
