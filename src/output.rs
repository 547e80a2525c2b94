//! Where built images go.
//!
//! A zip input is appended to in place; a directory input gets the files under
//! its own tree. Either way every written file carries the same fixed
//! modification time, so repeated runs produce identical packages.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use time::{Date, Month, OffsetDateTime};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::scratch::Scratch;

/// Entries at or above this size need zip64 records.
const ZIP64_LIMIT: u64 = 0xFFFF_FFFF;

/// The fixed build instant, 2009-01-01 00:00:00 UTC.
pub fn build_epoch() -> Result<OffsetDateTime> {
    let date = Date::from_calendar_date(2009, Month::January, 1)
        .context("constructing build epoch")?;
    Ok(date.midnight().assume_utc())
}

/// [`build_epoch`] as seconds since the Unix epoch.
pub fn build_timestamp() -> Result<i64> {
    Ok(build_epoch()?.unix_timestamp())
}

fn zip_timestamp() -> Result<zip::DateTime> {
    let epoch = build_epoch()?;
    zip::DateTime::from_date_and_time(
        u16::try_from(epoch.year()).context("build epoch year out of range")?,
        u8::from(epoch.month()),
        epoch.day(),
        epoch.hour(),
        epoch.minute(),
        epoch.second(),
    )
    .map_err(|_| anyhow!("build epoch is not representable in a zip entry"))
}

fn set_fixed_mtime(path: &Path) -> Result<()> {
    let seconds = u64::try_from(build_timestamp()?).context("build epoch before 1970")?;
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(seconds);
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening '{}' to set its timestamp", path.display()))?;
    file.set_modified(mtime)
        .with_context(|| format!("setting timestamp on '{}'", path.display()))
}

pub struct ArchiveSink {
    path: PathBuf,
    writer: ZipWriter<File>,
    names: BTreeSet<String>,
}

/// Destination for everything the run produces.
pub enum OutputSink {
    Directory { root: PathBuf },
    Archive(ArchiveSink),
}

impl OutputSink {
    pub fn directory(root: &Path) -> Self {
        Self::Directory {
            root: root.to_path_buf(),
        }
    }

    /// Open `path` for appending. Any reader on the archive must be closed
    /// first.
    pub fn append_to(path: &Path) -> Result<Self> {
        let names = {
            let file = File::open(path)
                .with_context(|| format!("opening archive '{}'", path.display()))?;
            let archive = ZipArchive::new(BufReader::new(file))
                .with_context(|| format!("reading zip archive '{}'", path.display()))?;
            archive.file_names().map(str::to_string).collect()
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening archive '{}' for writing", path.display()))?;
        let writer = ZipWriter::new_append(file)
            .with_context(|| format!("opening archive '{}' for appending", path.display()))?;

        Ok(Self::Archive(ArchiveSink {
            path: path.to_path_buf(),
            writer,
            names,
        }))
    }

    pub fn is_archive(&self) -> bool {
        matches!(self, Self::Archive(_))
    }

    /// Whether `name` (package-relative, forward slashes) is in the output.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::Directory { root } => root.join(name).exists(),
            Self::Archive(sink) => sink.names.contains(name),
        }
    }

    /// Store the file at `src` as `name`. Returns `false` when the archive
    /// already holds `name` and nothing was written.
    pub fn write_file(&mut self, src: &Path, name: &str) -> Result<bool> {
        match self {
            Self::Directory { root } => {
                let dest = root.join(name);
                if dest != src {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).with_context(|| {
                            format!("creating directory '{}'", parent.display())
                        })?;
                    }
                    fs::copy(src, &dest).with_context(|| {
                        format!("copying '{}' to '{}'", src.display(), dest.display())
                    })?;
                }
                set_fixed_mtime(&dest)?;
                debug!(file = %dest.display(), "wrote file");
                Ok(true)
            }
            Self::Archive(sink) => {
                let size = fs::metadata(src)
                    .with_context(|| format!("reading metadata of '{}'", src.display()))?
                    .len();
                let mut input = File::open(src)
                    .with_context(|| format!("opening '{}'", src.display()))?;
                sink.add(name, size, |writer| io::copy(&mut input, writer).map(|_| ()))
            }
        }
    }

    /// Store `contents` as `name`, with the same duplicate rule as
    /// [`OutputSink::write_file`].
    pub fn write_bytes(&mut self, name: &str, contents: &[u8]) -> Result<bool> {
        match self {
            Self::Directory { root } => {
                let dest = root.join(name);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating directory '{}'", parent.display()))?;
                }
                fs::write(&dest, contents)
                    .with_context(|| format!("writing '{}'", dest.display()))?;
                set_fixed_mtime(&dest)?;
                debug!(file = %dest.display(), "wrote file");
                Ok(true)
            }
            Self::Archive(sink) => sink.add(name, contents.len() as u64, |writer| {
                writer.write_all(contents)
            }),
        }
    }

    /// Flush the archive's central directory. A no-op for directories.
    pub fn finish(self) -> Result<()> {
        if let Self::Archive(sink) = self {
            sink.writer
                .finish()
                .with_context(|| format!("finalizing archive '{}'", sink.path.display()))?;
        }
        Ok(())
    }
}

impl ArchiveSink {
    fn add(
        &mut self,
        name: &str,
        size: u64,
        body: impl FnOnce(&mut ZipWriter<File>) -> io::Result<()>,
    ) -> Result<bool> {
        if self.names.contains(name) {
            warn!(entry = name, archive = %self.path.display(), "entry already in archive, not adding it again");
            return Ok(false);
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip_timestamp()?)
            .large_file(size >= ZIP64_LIMIT)
            .unix_permissions(0o644);
        self.writer
            .start_file(name, options)
            .with_context(|| format!("adding '{}' to '{}'", name, self.path.display()))?;
        body(&mut self.writer)
            .with_context(|| format!("writing '{}' to '{}'", name, self.path.display()))?;

        self.names.insert(name.to_string());
        debug!(entry = name, size, "added archive entry");
        Ok(true)
    }
}

/// Handle for one output file of a run.
///
/// The producing tool writes to [`OutputFile::path`]. In directory mode that
/// is the final location under the tree; in archive mode it is a scratch file
/// that [`OutputFile::write`] then adds to the archive.
#[derive(Debug, Clone)]
pub struct OutputFile {
    name: String,
    input_name: PathBuf,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(sink: &OutputSink, tree: &Path, scratch: &Scratch, prefix: &str, file: &str) -> Self {
        let name = format!("{}/{}", prefix.trim_end_matches('/'), file);
        let input_name = tree.join(&name);
        let path = if sink.is_archive() {
            let (stem, suffix) = match file.rfind('.') {
                Some(idx) => (&file[..idx], &file[idx..]),
                None => (file, ""),
            };
            scratch.file(&format!("{stem}-"), suffix)
        } else {
            input_name.clone()
        };
        Self {
            name,
            input_name,
            path,
        }
    }

    /// Package-relative name, e.g. `IMAGES/system.img`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of this file inside the working tree.
    pub fn input_name(&self) -> &Path {
        &self.input_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, sink: &mut OutputSink) -> Result<bool> {
        sink.write_file(&self.path, &self.name)
    }
}
