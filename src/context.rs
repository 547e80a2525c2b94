//! Run configuration shared by every step of an image run.

use std::path::{Path, PathBuf};

use crate::info::InfoDict;
use crate::process::ToolRunner;
use crate::scratch::Scratch;
use crate::tools::ToolPaths;

/// Command-line options of `add_img_to_target_files`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddImagesOptions {
    /// Build only the images missing from `IMAGES/`.
    pub add_missing: bool,
    /// Regenerate the recovery patch inside the system partition.
    pub rebuild_recovery: bool,
    pub replace_verity_private_key: Option<PathBuf>,
    pub replace_verity_public_key: Option<PathBuf>,
    /// Skip userdata, which signing never changes.
    pub is_signing: bool,
}

/// Everything a build step reads. Constructed once per run and never
/// mutated; results flow back as return values.
pub struct RunContext<'a> {
    /// Working tree of the target-files package.
    pub tree: &'a Path,
    pub info: &'a InfoDict,
    pub options: &'a AddImagesOptions,
    pub tools: &'a ToolPaths,
    pub runner: &'a dyn ToolRunner,
    pub scratch: &'a Scratch,
}

impl RunContext<'_> {
    /// Path of a package-relative entry inside the working tree.
    pub fn tree_path(&self, rel: &str) -> PathBuf {
        self.tree.join(rel)
    }
}
