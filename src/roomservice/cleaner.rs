use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::config::RoomserviceConfig;
use super::dependencies::{load_list, Removal};
use super::manifest::Manifest;
use super::local_manifests_dir;

/// Append a `remove-project` for every entry of the device tree's removal
/// list that the removal manifest does not carry yet.
///
/// Returns the names that were added. The manifest is only rewritten when
/// something was added.
pub fn run_roomcleaner(
    root: &Path,
    config: &RoomserviceConfig,
    device_path: &str,
) -> Result<Vec<String>> {
    let device_path = device_path.strip_suffix('/').unwrap_or(device_path);
    let list_path = root
        .join(device_path)
        .join(&config.cleaner.removal_dependencies_file);
    let manifest_path = local_manifests_dir(root).join(&config.cleaner.removal_manifest);

    let Some(removals) = load_list::<Removal>(&list_path)? else {
        info!(path = %list_path.display(), "no removal list, nothing to do");
        return Ok(Vec::new());
    };

    let mut manifest = Manifest::load(&manifest_path);
    let mut added = Vec::new();
    for removal in removals {
        let name = removal.repository;
        if manifest.has_remove_project(&name) {
            continue;
        }
        if manifest.remove_project_ending_with(&name).is_some() {
            info!(
                "Remove-project for {}/{} already exists",
                config.cleaner.organization, name
            );
            continue;
        }
        info!("Adding remove-project to manifest: {name}");
        manifest.add_remove_project(&name);
        added.push(name);
    }

    if !added.is_empty() {
        manifest.save(&manifest_path)?;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn setup(removals: &str, existing: Option<&str>) -> TempDir {
        let temp = TempDir::new().unwrap();
        let device = temp.path().join("device/lge/hammerhead");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("aicp.removal.dependencies"), removals).unwrap();
        if let Some(xml) = existing {
            let dir = temp.path().join(".repo/local_manifests");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("00_aicp_removals.xml"), xml).unwrap();
        }
        temp
    }

    fn removal_manifest(root: &Path) -> Manifest {
        Manifest::load(&root.join(".repo/local_manifests/00_aicp_removals.xml"))
    }

    #[test]
    fn test_adds_missing_entries_and_strips_trailing_slash() {
        let temp = setup(
            r#"[{"repository": "platform/packages/apps/Foo"}, {"repository": "platform/external/bar"}]"#,
            None,
        );
        let added = run_roomcleaner(
            temp.path(),
            &RoomserviceConfig::default(),
            "device/lge/hammerhead/",
        )
        .unwrap();

        assert_eq!(added, ["platform/packages/apps/Foo", "platform/external/bar"]);
        let manifest = removal_manifest(temp.path());
        assert!(manifest.has_remove_project("platform/packages/apps/Foo"));
        assert!(manifest.has_remove_project("platform/external/bar"));
        assert!(manifest.project.is_empty());
    }

    #[traced_test]
    #[test]
    fn test_existing_entries_are_skipped() {
        let temp = setup(
            r#"[{"repository": "platform/external/bar"}, {"repository": "external/baz"}, {"repository": "new/one"}]"#,
            Some(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<manifest>
  <remove-project name="platform/external/bar" />
  <remove-project name="platform/external/baz" />
</manifest>
"#,
            ),
        );
        let added =
            run_roomcleaner(temp.path(), &RoomserviceConfig::default(), "device/lge/hammerhead")
                .unwrap();

        assert_eq!(added, ["new/one"]);
        assert_eq!(removal_manifest(temp.path()).remove_project.len(), 3);
        assert!(logs_contain("Remove-project for AICP/external/baz already exists"));
    }

    #[test]
    fn test_nothing_added_leaves_manifest_untouched() {
        let existing = "<manifest><remove-project name=\"a\"/></manifest>";
        let temp = setup(r#"[{"repository": "a"}]"#, Some(existing));
        let added =
            run_roomcleaner(temp.path(), &RoomserviceConfig::default(), "device/lge/hammerhead")
                .unwrap();

        assert!(added.is_empty());
        let on_disk =
            fs::read_to_string(temp.path().join(".repo/local_manifests/00_aicp_removals.xml"))
                .unwrap();
        assert_eq!(on_disk, existing);
    }

    #[test]
    fn test_missing_removal_list_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let added =
            run_roomcleaner(temp.path(), &RoomserviceConfig::default(), "device/x/y").unwrap();
        assert!(added.is_empty());
        assert!(!temp.path().join(".repo").exists());
    }
}
