//! Per-run scratch space.
//!
//! All temporary directories and files of a run live under one
//! [`tempfile::TempDir`]; dropping the [`Scratch`] removes them, whether the run
//! succeeded or not.

use anyhow::{Context, Result};
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Scratch {
    root: TempDir,
    counter: Cell<u32>,
}

impl Scratch {
    pub fn new() -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("targetfiles-")
            .tempdir()
            .context("creating scratch directory")?;
        Ok(Self {
            root,
            counter: Cell::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    fn next_name(&self, prefix: &str, suffix: &str) -> String {
        let n = self.counter.get();
        self.counter.set(n + 1);
        format!("{prefix}{n}{suffix}")
    }

    /// Create a fresh, empty directory.
    pub fn dir(&self, prefix: &str) -> Result<PathBuf> {
        let path = self.root.path().join(self.next_name(prefix, ""));
        fs::create_dir(&path)
            .with_context(|| format!("creating scratch directory '{}'", path.display()))?;
        Ok(path)
    }

    /// Reserve a path for a temporary file. The file itself is not created.
    pub fn file(&self, prefix: &str, suffix: &str) -> PathBuf {
        self.root.path().join(self.next_name(prefix, suffix))
    }
}
