//! Opening a target-files package.
//!
//! A package is either an unpacked directory or a zip archive. Archives are
//! extracted into scratch space and stay locked for the rest of the run; the
//! archive handle is kept so metadata is read from the archive itself.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::ZipArchive;

use crate::info::InfoDict;
use crate::scratch::Scratch;

pub struct TargetFiles {
    root: PathBuf,
    archive: Option<ArchiveInput>,
}

struct ArchiveInput {
    path: PathBuf,
    reader: RefCell<Option<ZipArchive<BufReader<File>>>>,
    // Held for the advisory lock only.
    _lock: File,
}

impl TargetFiles {
    pub fn open(path: &Path, scratch: &Scratch) -> Result<Self> {
        if path.is_dir() {
            let root = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .context("resolving current directory")?
                    .join(path)
            };
            debug!(root = %root.display(), "using target-files directory in place");
            return Ok(Self {
                root,
                archive: None,
            });
        }

        if !path.is_file() {
            bail!("cannot open target-files '{}': no such file or directory", path.display());
        }

        let lock = File::open(path)
            .with_context(|| format!("opening target-files archive '{}'", path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "target-files archive '{}' is locked by another process",
                path.display()
            )
        })?;

        let file = File::open(path)
            .with_context(|| format!("opening target-files archive '{}'", path.display()))?;
        let mut reader = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("reading zip archive '{}'", path.display()))?;

        let root = scratch.dir("targetfiles-")?;
        info!(archive = %path.display(), into = %root.display(), "extracting target-files");
        reader
            .extract(&root)
            .with_context(|| format!("extracting '{}' into '{}'", path.display(), root.display()))?;

        Ok(Self {
            root,
            archive: Some(ArchiveInput {
                path: path.to_path_buf(),
                reader: RefCell::new(Some(reader)),
                _lock: lock,
            }),
        })
    }

    /// Working tree: the input directory, or the extraction of the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_path(&self) -> Option<&Path> {
        self.archive.as_ref().map(|archive| archive.path.as_path())
    }

    pub fn has_dir(&self, name: &str) -> bool {
        self.root.join(name).is_dir()
    }

    /// Read a text file by its package-relative path, `Ok(None)` if absent.
    pub fn read_metadata(&self, rel: &str) -> Result<Option<String>> {
        if let Some(archive) = &self.archive {
            let mut reader = archive.reader.borrow_mut();
            if let Some(reader) = reader.as_mut() {
                let mut entry = match reader.by_name(rel) {
                    Ok(entry) => entry,
                    Err(zip::result::ZipError::FileNotFound) => return Ok(None),
                    Err(err) => {
                        return Err(err).with_context(|| {
                            format!("reading '{}' from '{}'", rel, archive.path.display())
                        })
                    }
                };
                let mut text = String::new();
                entry.read_to_string(&mut text).with_context(|| {
                    format!("reading '{}' from '{}'", rel, archive.path.display())
                })?;
                return Ok(Some(text));
            }
        }

        let path = self.root.join(rel);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("reading '{}'", path.display()))
    }

    pub fn load_info_dict(&self) -> Result<InfoDict> {
        InfoDict::load(|rel| self.read_metadata(rel))
    }

    /// Close the read handle before the archive is reopened for appending.
    /// Later metadata reads fall back to the extracted tree.
    pub fn release_reader(&self) {
        if let Some(archive) = &self.archive {
            archive.reader.borrow_mut().take();
        }
    }
}
