//! Local manifests under `.repo/local_manifests/`.
//!
//! Only the elements the helpers touch are modelled. A rewrite emits them
//! grouped by element type, pretty-printed behind an XML declaration.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use xmlem::display::Config;
use xmlem::Document;

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "manifest")]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remote: Vec<Remote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ManifestDefault>,
    #[serde(
        default,
        rename = "remove-project",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub remove_project: Vec<RemoveProject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project: Vec<Project>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<Include>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remote {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@fetch", default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<String>,
    #[serde(rename = "@review", default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
    #[serde(rename = "@revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDefault {
    #[serde(rename = "@remote", default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(rename = "@revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveProject {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "@path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "@remote", default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@revision", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(rename = "@groups", default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copyfile: Vec<FileLink>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linkfile: Vec<FileLink>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Include {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLink {
    #[serde(rename = "@src")]
    pub src: String,
    #[serde(rename = "@dest")]
    pub dest: String,
}

/// What a manifest update did to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectChange {
    Added,
    Updated,
    Unchanged,
}

/// A project entry to merge into a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec<'a> {
    pub name: &'a str,
    pub path: &'a str,
    pub remote: &'a str,
    pub revision: &'a str,
}

impl Manifest {
    /// Read `path`. A missing or unparsable file is an empty manifest.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no manifest, starting empty");
                return Self::default();
            }
        };
        match Self::parse(&text) {
            Ok(manifest) => manifest,
            Err(e) => {
                debug!(path = %path.display(), error = %format!("{e:#}"), "unparsable manifest, starting empty");
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        quick_xml::de::from_str(text).context("parsing manifest XML")
    }

    /// Pretty-printed XML, starting with the XML declaration.
    pub fn to_xml(&self) -> Result<String> {
        let raw = quick_xml::se::to_string(self).context("serializing manifest")?;
        let doc = Document::from_str(&raw)
            .map_err(|e| anyhow!("re-reading serialized manifest: {e:?}"))?;
        let pretty = doc.to_string_pretty_with_config(&Config::default_pretty());
        let mut body = pretty.trim_start();
        if body.starts_with("<?xml") {
            body = body.split_once("?>").map_or(body, |(_, rest)| rest.trim_start());
        }
        Ok(format!("{XML_DECLARATION}\n{}\n", body.trim_end()))
    }

    /// Write the manifest to `path`, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        let xml = self.to_xml()?;
        fs::write(path, xml).with_context(|| format!("writing manifest '{}'", path.display()))
    }

    /// Whether a project with exactly this name and revision is present.
    pub fn has_project(&self, name: &str, revision: &str) -> bool {
        self.project
            .iter()
            .any(|p| p.name == name && p.revision.as_deref() == Some(revision))
    }

    /// Path of the first project named `device_<anything>_<device>`.
    pub fn device_path(&self, device: &str) -> Option<&str> {
        let suffix = format!("_{device}");
        self.project
            .iter()
            .find(|p| {
                p.name
                    .find("device_")
                    .is_some_and(|i| p.name[i + "device_".len()..].ends_with(&suffix))
            })
            .and_then(|p| p.path.as_deref())
    }

    /// Merge a device repository: an existing project whose name ends with
    /// `repo_name` only gets its revision updated.
    pub fn add_device_project(&mut self, repo_name: &str, spec: &ProjectSpec<'_>) -> ProjectChange {
        if let Some(existing) = self.project.iter_mut().find(|p| p.name.ends_with(repo_name)) {
            return update_revision(existing, spec);
        }
        info!("Adding dependency: {} -> {}", spec.name, spec.path);
        self.project.push(new_project(spec));
        ProjectChange::Added
    }

    /// Merge a dependency: an existing project whose path ends with the
    /// target path takes the new name and revision.
    pub fn add_dependency_project(&mut self, spec: &ProjectSpec<'_>) -> ProjectChange {
        let existing = self.project.iter_mut().find(|p| {
            p.path
                .as_deref()
                .is_some_and(|path| path.ends_with(spec.path))
        });
        if let Some(existing) = existing {
            let renamed = existing.name != spec.name;
            if renamed {
                info!("Updating dependency {}", spec.name);
                existing.name = spec.name.to_string();
            }
            return match update_revision(existing, spec) {
                ProjectChange::Unchanged if renamed => ProjectChange::Updated,
                change => change,
            };
        }
        info!("Adding dependency: {} -> {}", spec.name, spec.path);
        self.project.push(new_project(spec));
        ProjectChange::Added
    }

    pub fn has_remove_project(&self, name: &str) -> bool {
        self.remove_project.iter().any(|r| r.name == name)
    }

    /// First `remove-project` whose name ends with `suffix`.
    pub fn remove_project_ending_with(&self, suffix: &str) -> Option<&RemoveProject> {
        self.remove_project.iter().find(|r| r.name.ends_with(suffix))
    }

    pub fn add_remove_project(&mut self, name: &str) {
        self.remove_project.push(RemoveProject {
            name: name.to_string(),
        });
    }
}

fn new_project(spec: &ProjectSpec<'_>) -> Project {
    Project {
        path: Some(spec.path.to_string()),
        remote: Some(spec.remote.to_string()),
        name: spec.name.to_string(),
        revision: Some(spec.revision.to_string()),
        ..Default::default()
    }
}

fn update_revision(project: &mut Project, spec: &ProjectSpec<'_>) -> ProjectChange {
    if project.revision.as_deref() == Some(spec.revision) {
        info!("{} already exists", spec.name);
        return ProjectChange::Unchanged;
    }
    info!("updating branch for {} to {}", spec.name, spec.revision);
    project.revision = Some(spec.revision.to_string());
    ProjectChange::Updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const LOCAL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <remote name="github" fetch="https://github.com/" />
  <project path="device/lge/hammerhead" remote="github" name="Roms/device_lge_hammerhead" revision="lp5.0" />
  <remove-project name="platform/external/foo" />
  <project path="kernel/lge/hammerhead" remote="github" name="Roms/kernel_lge_hammerhead" revision="lp5.0">
    <linkfile src="a" dest="b" />
  </project>
  <include name="other.xml" />
</manifest>
"#;

    fn spec<'a>(name: &'a str, path: &'a str, revision: &'a str) -> ProjectSpec<'a> {
        ProjectSpec {
            name,
            path,
            remote: "github",
            revision,
        }
    }

    #[test]
    fn test_parse_interleaved_elements() {
        let manifest = Manifest::parse(LOCAL).unwrap();
        assert_eq!(manifest.remote.len(), 1);
        assert_eq!(manifest.project.len(), 2);
        assert_eq!(manifest.remove_project[0].name, "platform/external/foo");
        assert_eq!(manifest.project[1].linkfile[0].dest, "b");
        assert_eq!(manifest.include[0].name, "other.xml");
    }

    #[test]
    fn test_rewrite_reparses_to_same_model() {
        let manifest = Manifest::parse(LOCAL).unwrap();
        let xml = manifest.to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<manifest"));
        assert_eq!(xml.matches("<?xml").count(), 1);
        assert_eq!(Manifest::parse(&xml).unwrap(), manifest);
    }

    #[test]
    fn test_empty_manifest_writes_root_element() {
        let xml = Manifest::default().to_xml().unwrap();
        assert!(xml.contains("<manifest"));
        assert_eq!(Manifest::parse(&xml).unwrap(), Manifest::default());
    }

    #[test]
    fn test_load_falls_back_to_empty() {
        let temp = TempDir::new().unwrap();
        assert_eq!(Manifest::load(&temp.path().join("missing.xml")), Manifest::default());

        let broken = temp.path().join("broken.xml");
        fs::write(&broken, "<manifest><project").unwrap();
        assert_eq!(Manifest::load(&broken), Manifest::default());
    }

    #[test]
    fn test_save_creates_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".repo/local_manifests/local.xml");
        let mut manifest = Manifest::default();
        manifest.add_remove_project("platform/packages/apps/Foo");
        manifest.save(&path).unwrap();

        let reloaded = Manifest::load(&path);
        assert!(reloaded.has_remove_project("platform/packages/apps/Foo"));
    }

    #[test]
    fn test_device_path_matches_suffix() {
        let manifest = Manifest::parse(LOCAL).unwrap();
        assert_eq!(manifest.device_path("hammerhead"), Some("device/lge/hammerhead"));
        assert_eq!(manifest.device_path("head"), None);
        assert_eq!(manifest.device_path("bullhead"), None);
    }

    #[test]
    fn test_has_project_needs_name_and_revision() {
        let manifest = Manifest::parse(LOCAL).unwrap();
        assert!(manifest.has_project("Roms/kernel_lge_hammerhead", "lp5.0"));
        assert!(!manifest.has_project("Roms/kernel_lge_hammerhead", "lp5.1"));
        assert!(!manifest.has_project("kernel_lge_hammerhead", "lp5.0"));
    }

    #[traced_test]
    #[test]
    fn test_dependency_merge_is_idempotent() {
        let mut manifest = Manifest::parse(LOCAL).unwrap();
        let dep = spec("Roms/vendor_lge", "vendor/lge", "lp5.0");

        assert_eq!(manifest.add_dependency_project(&dep), ProjectChange::Added);
        let after_first = manifest.clone();
        assert_eq!(manifest.add_dependency_project(&dep), ProjectChange::Unchanged);
        assert_eq!(manifest, after_first);
        assert!(logs_contain("Adding dependency: Roms/vendor_lge -> vendor/lge"));
        assert!(logs_contain("Roms/vendor_lge already exists"));
    }

    #[test]
    fn test_dependency_on_existing_path_updates_name_and_revision() {
        let mut manifest = Manifest::parse(LOCAL).unwrap();
        let dep = spec("Other/kernel_lge_hammerhead", "kernel/lge/hammerhead", "lp5.1");

        assert_eq!(manifest.add_dependency_project(&dep), ProjectChange::Updated);
        assert_eq!(manifest.project.len(), 2);
        let kernel = &manifest.project[1];
        assert_eq!(kernel.name, "Other/kernel_lge_hammerhead");
        assert_eq!(kernel.revision.as_deref(), Some("lp5.1"));
        assert_eq!(kernel.linkfile.len(), 1);
    }

    #[test]
    fn test_device_merge_matches_name_suffix() {
        let mut manifest = Manifest::parse(LOCAL).unwrap();
        let device = spec("Roms/device_lge_hammerhead", "device/lge/hammerhead", "lp5.1");

        assert_eq!(
            manifest.add_device_project("device_lge_hammerhead", &device),
            ProjectChange::Updated
        );
        assert_eq!(manifest.project[0].revision.as_deref(), Some("lp5.1"));

        let other = spec("Roms/device_lge_bullhead", "device/lge/bullhead", "lp5.1");
        assert_eq!(
            manifest.add_device_project("device_lge_bullhead", &other),
            ProjectChange::Added
        );
        let added = manifest.project.last().unwrap();
        assert_eq!(added.path.as_deref(), Some("device/lge/bullhead"));
        assert_eq!(added.remote.as_deref(), Some("github"));
    }

    #[test]
    fn test_remove_project_lookup() {
        let manifest = Manifest::parse(LOCAL).unwrap();
        assert!(manifest.has_remove_project("platform/external/foo"));
        assert!(!manifest.has_remove_project("foo"));
        assert!(manifest.remove_project_ending_with("external/foo").is_some());
        assert!(manifest.remove_project_ending_with("bar").is_none());
    }
}
