//! The image run: builds every missing image of a target-files package in a
//! fixed order and adds them to the package.
//!
//! Steps run one after another. The first failure aborts the run; whatever
//! was already written stays in the output.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::care_map::{compute_care_map, format_care_map, CareMapEntry, CARE_MAP_PATH};
use crate::context::{AddImagesOptions, RunContext};
use crate::image::{
    build_partition_image, get_bootable_image, make_recovery_patch, BootableImage,
    ImageOutcome, Partition, IMAGES_DIR,
};
use crate::output::OutputSink;
use crate::process::ToolRunner;
use crate::scratch::Scratch;
use crate::sign::{build_partition_table, build_vbmeta};
use crate::target_files::TargetFiles;
use crate::tools::ToolPaths;

const AB_PARTITIONS_PATH: &str = "META/ab_partitions.txt";

/// Where one output of the run stands.
///
/// `Skipped` and `Written` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    NotPresent,
    /// Already in the package, left as is.
    Skipped,
    Built,
    /// Checked and ready to be added to the output.
    Staged,
    Written,
}

impl PartitionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Written)
    }

    fn can_advance_to(self, next: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, next),
            (NotPresent, Skipped) | (NotPresent, Built) | (Built, Staged) | (Staged, Written)
        )
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotPresent => "not present",
            Self::Skipped => "skipped",
            Self::Built => "built",
            Self::Staged => "staged",
            Self::Written => "written",
        };
        f.write_str(s)
    }
}

/// Per-output state, in the order outputs were first touched.
#[derive(Debug, Default)]
pub struct Progress {
    order: Vec<String>,
    states: BTreeMap<String, PartitionState>,
}

impl Progress {
    pub fn state(&self, name: &str) -> PartitionState {
        self.states
            .get(name)
            .copied()
            .unwrap_or(PartitionState::NotPresent)
    }

    pub fn advance(&mut self, name: &str, next: PartitionState) -> Result<()> {
        let current = self.state(name);
        if !current.can_advance_to(next) {
            bail!("{name}: invalid state change from {current} to {next}");
        }
        if !self.states.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.states.insert(name.to_string(), next);
        Ok(())
    }

    /// Walk `name` through built, staged and written around `write`.
    fn publish(
        &mut self,
        name: &str,
        sink: &mut OutputSink,
        write: impl FnOnce(&mut OutputSink) -> Result<()>,
    ) -> Result<()> {
        self.advance(name, PartitionState::Built)?;
        self.advance(name, PartitionState::Staged)?;
        write(sink)?;
        self.advance(name, PartitionState::Written)
    }
}

/// Terminal state of every output the run considered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub states: Vec<(String, PartitionState)>,
    pub care_map: Vec<CareMapEntry>,
}

impl RunSummary {
    pub fn state(&self, name: &str) -> PartitionState {
        self.states
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, state)| *state)
            .unwrap_or(PartitionState::NotPresent)
    }
}

impl From<Progress> for RunSummary {
    fn from(progress: Progress) -> Self {
        let states = progress
            .order
            .iter()
            .map(|name| (name.clone(), progress.state(name)))
            .collect();
        Self {
            states,
            care_map: Vec::new(),
        }
    }
}

fn banner(s: &str) {
    println!("\n\n++++ {s} ++++\n\n");
}

/// Build and add the images of the target-files package at `path`, a
/// directory or a zip archive.
pub fn add_images_to_target_files(
    path: &Path,
    options: &AddImagesOptions,
    tools: &ToolPaths,
    runner: &dyn ToolRunner,
) -> Result<RunSummary> {
    let scratch = Scratch::new()?;
    let target = TargetFiles::open(path, &scratch)?;

    if !options.add_missing && target.has_dir(IMAGES_DIR) {
        bail!("target_files appears to already contain images.");
    }

    let info = target.load_info_dict()?;
    let mut sink = if let Some(archive) = target.archive_path() {
        target.release_reader();
        OutputSink::append_to(archive)?
    } else {
        let images = target.root().join(IMAGES_DIR);
        fs::create_dir_all(&images)
            .with_context(|| format!("creating '{}'", images.display()))?;
        OutputSink::directory(target.root())
    };

    let ctx = RunContext {
        tree: target.root(),
        info: &info,
        options,
        tools,
        runner,
        scratch: &scratch,
    };
    let summary = run_steps(&ctx, &target, &mut sink)?;
    sink.finish()?;
    Ok(summary)
}

fn run_steps(ctx: &RunContext<'_>, target: &TargetFiles, sink: &mut OutputSink) -> Result<RunSummary> {
    let options = ctx.options;
    let info = ctx.info;
    let mut progress = Progress::default();

    banner("boot");
    let boot_image = add_bootable(ctx, sink, &mut progress, "boot", "BOOT")?;

    let mut recovery_image = None;
    if !info.no_recovery {
        banner("recovery");
        let built_fresh = !ctx.tree_path("IMAGES/recovery.img").exists();
        recovery_image = add_bootable(ctx, sink, &mut progress, "recovery", "RECOVERY")?;

        if built_fresh {
            banner("recovery (two-step image)");
            if let Some(image) =
                get_bootable_image(ctx, "recovery-two-step.img", "RECOVERY", true)?
            {
                progress.publish("recovery-two-step", sink, |sink| {
                    image.write(sink).map(|_| ())
                })?;
            }
        }
    }

    banner("system");
    let system_name = Partition::System.image_name();
    if options.rebuild_recovery && !ctx.tree_path(&format!("{IMAGES_DIR}/{system_name}")).exists() {
        println!("Building new recovery patch");
        match (&recovery_image, &boot_image) {
            (Some(recovery), Some(boot)) => make_recovery_patch(ctx, recovery, boot)?,
            _ => warn!("boot.img or recovery.img unavailable, not rebuilding the recovery patch"),
        }
    }
    let system = add_partition(ctx, sink, &mut progress, Partition::System)?;

    let vendor = if target.has_dir(Partition::Vendor.source_dir()) {
        banner("vendor");
        Some(add_partition(ctx, sink, &mut progress, Partition::Vendor)?)
    } else {
        None
    };

    if target.has_dir(Partition::SystemOther.source_dir()) {
        banner("system_other");
        add_partition(ctx, sink, &mut progress, Partition::SystemOther)?;
    }

    if !options.is_signing {
        banner("userdata");
        add_partition(ctx, sink, &mut progress, Partition::Userdata)?;
    }

    if info.bpt.enabled {
        banner("partition-table");
        let table = build_partition_table(ctx, sink)?;
        progress.publish("partition-table", sink, |sink| table.write(sink))?;
    }

    if info.avb.enabled {
        banner("vbmeta");
        let prebuilt_boot = ctx.tree_path("IMAGES/boot.img");
        let boot_path = match &boot_image {
            Some(image) => image.path.clone(),
            None if prebuilt_boot.exists() => prebuilt_boot,
            None => bail!("boot.img is required to build vbmeta.img"),
        };
        let system_path = system
            .path()
            .context("system.img is required to build vbmeta.img")?;
        let vendor_path = vendor.as_ref().and_then(|outcome| outcome.path());
        let vbmeta = build_vbmeta(ctx, sink, &boot_path, system_path, vendor_path)?;
        progress.publish("vbmeta", sink, |sink| vbmeta.write(sink).map(|_| ()))?;
    }

    banner("radio");
    let care_map = add_ab_images(ctx, sink, &mut progress, &system, vendor.as_ref())?;
    if !care_map.is_empty() {
        sink.write_bytes(CARE_MAP_PATH, format_care_map(&care_map).as_bytes())?;
    }

    let mut summary = RunSummary::from(progress);
    summary.care_map = care_map;
    for (name, state) in &summary.states {
        debug!(output = name.as_str(), %state, "final state");
    }
    Ok(summary)
}

/// Boot or recovery. An image already under `IMAGES/` is kept; it is still
/// loaded when the recovery patch is rebuilt, which needs both images.
fn add_bootable(
    ctx: &RunContext<'_>,
    sink: &mut OutputSink,
    progress: &mut Progress,
    name: &str,
    tree_subdir: &str,
) -> Result<Option<BootableImage>> {
    let file_name = format!("{name}.img");
    if ctx.tree_path(&format!("{IMAGES_DIR}/{file_name}")).exists() {
        println!("{file_name} already exists in {IMAGES_DIR}/, no need to rebuild...");
        progress.advance(name, PartitionState::Skipped)?;
        if ctx.options.rebuild_recovery {
            return get_bootable_image(ctx, &file_name, tree_subdir, false);
        }
        return Ok(None);
    }

    let image = get_bootable_image(ctx, &file_name, tree_subdir, false)?;
    match &image {
        Some(image) => {
            progress.publish(name, sink, |sink| image.write(sink).map(|_| ()))?;
        }
        None => info!(image = file_name.as_str(), "no kernel in {}, skipping", tree_subdir),
    }
    Ok(image)
}

fn add_partition(
    ctx: &RunContext<'_>,
    sink: &mut OutputSink,
    progress: &mut Progress,
    partition: Partition,
) -> Result<ImageOutcome> {
    let outcome = build_partition_image(ctx, sink, partition)?;
    let name = partition.name();
    match &outcome {
        ImageOutcome::Existing(_) => progress.advance(name, PartitionState::Skipped)?,
        ImageOutcome::Built(image) => {
            progress.publish(name, sink, |sink| image.write(sink))?;
        }
        ImageOutcome::NotConfigured => {}
    }
    Ok(outcome)
}

/// Copy the A/B images listed in `META/ab_partitions.txt` into `IMAGES/` and
/// collect care maps for the verified partitions among them.
fn add_ab_images(
    ctx: &RunContext<'_>,
    sink: &mut OutputSink,
    progress: &mut Progress,
    system: &ImageOutcome,
    vendor: Option<&ImageOutcome>,
) -> Result<Vec<CareMapEntry>> {
    let ab_partitions = ctx.tree_path(AB_PARTITIONS_PATH);
    if !ab_partitions.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&ab_partitions)
        .with_context(|| format!("reading '{}'", ab_partitions.display()))?;

    let mut care_map = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let verified = match line {
            "system" => ctx
                .info
                .system
                .verity_block_device
                .as_ref()
                .map(|_| Some(system)),
            "vendor" => ctx.info.vendor.verity_block_device.as_ref().map(|_| vendor),
            _ => None,
        };
        if let Some(outcome) = verified {
            let image = outcome
                .and_then(ImageOutcome::path)
                .with_context(|| format!("{line}.img is required for its care map"))?;
            if !image.exists() {
                bail!("{line}.img is required for its care map: '{}' is missing", image.display());
            }
            let adjusted = outcome.and_then(ImageOutcome::adjusted_blocks);
            care_map.push(compute_care_map(line, image, adjusted)?);
        }

        let img_name = format!("{line}.img");
        let arcname = format!("{IMAGES_DIR}/{img_name}");
        // Zip runs write into the archive, so only the progress knows about
        // images added earlier in this run.
        if ctx.tree_path(&arcname).exists() || progress.state(line).is_terminal() {
            println!("{img_name} already exists, no need to overwrite...");
            continue;
        }

        if let Some(source) = find_ab_image(ctx, &img_name) {
            debug!(image = img_name.as_str(), source = %source.display(), "copying A/B image");
            progress.publish(line, sink, |sink| sink.write_file(&source, &arcname).map(|_| ()))?;
        }

        if !sink.contains(&arcname) {
            bail!("cannot find {img_name}");
        }
    }
    Ok(care_map)
}

/// `RADIO/<name>`, else the first `<name>` anywhere under `VENDOR_IMAGES/`.
fn find_ab_image(ctx: &RunContext<'_>, img_name: &str) -> Option<PathBuf> {
    let radio = ctx.tree_path(&format!("RADIO/{img_name}"));
    if radio.exists() {
        return Some(radio);
    }
    WalkDir::new(ctx.tree_path("VENDOR_IMAGES"))
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == img_name)
        .map(|entry| entry.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::care_map::sparse::build::{sparse_image, Chunk};
    use crate::info::parse_key_value;
    use crate::process::fake::{exit, FakeRunner};
    use std::fs::File;
    use std::io::{Read, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::{ZipArchive, ZipWriter};

    /// Blocks in every fabricated partition image.
    const IMAGE_BLOCKS: u32 = 10;

    /// Stands in for every host tool: creates each requested output, builds
    /// sparse partition images and, given `adjusted_size`, rewrites
    /// `partition_size` for verity images to that many bytes.
    fn host_tools(adjusted_size: Option<u64>) -> FakeRunner {
        FakeRunner::new(move |cmd| {
            let args = cmd.get_args();
            if let Some(out) = cmd.stdout_file() {
                fs::write(out, b"stdout").unwrap();
            }
            for flag in ["--output", "--output_json", "--output_gpt"] {
                if let Some(idx) = args.iter().position(|a| a == flag) {
                    fs::write(&args[idx + 1], flag.as_bytes()).unwrap();
                }
            }
            if cmd.program() == "build_image" {
                fs::write(&args[2], sparse_image(4096, &[Chunk::Raw(IMAGE_BLOCKS)])).unwrap();
                let props = parse_key_value(&fs::read_to_string(&args[1]).unwrap());
                if let Some(block_list) = props.get("block_list") {
                    fs::write(block_list, b"map").unwrap();
                }
                if let (Some(adjusted_size), true) =
                    (adjusted_size, props.contains_key("verity_block_device"))
                {
                    let mut text = fs::read_to_string(&args[1]).unwrap();
                    text.push_str(&format!("partition_size={adjusted_size}\n"));
                    fs::write(&args[1], text).unwrap();
                }
            }
            Ok(exit(0))
        })
    }

    fn write(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// A package with system, boot and radio content.
    fn package(root: &Path, misc_info: &str) {
        write(root, "META/misc_info.txt", misc_info.as_bytes());
        write(root, "SYSTEM/build.prop", b"ro.build.id=TEST\n");
        write(root, "BOOT/kernel", b"kernel");
        write(root, "BOOT/RAMDISK/init", b"init");
    }

    const VERITY_INFO: &str = "\
system_size=1048576
system_verity_block_device=/dev/block/by-name/system
verity=true
";

    #[test]
    fn test_existing_images_without_add_missing_is_fatal() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), VERITY_INFO);
        write(temp.path(), "IMAGES/boot.img", b"old");
        let runner = FakeRunner::succeeding();

        let err = add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &runner,
        )
        .unwrap_err();
        assert!(err.to_string().contains("already contain images"));
        assert!(runner.calls().is_empty());
        let images: Vec<_> = fs::read_dir(temp.path().join("IMAGES")).unwrap().collect();
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_directory_run_builds_images_and_care_map() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), VERITY_INFO);
        write(temp.path(), "META/ab_partitions.txt", b"system\nmodem\n");
        write(temp.path(), "RADIO/modem.img", b"modem");
        let runner = host_tools(Some(4096 * 8));

        let summary = add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &runner,
        )
        .unwrap();

        let images = temp.path().join("IMAGES");
        for name in ["boot.img", "system.img", "system.map", "modem.img"] {
            assert!(images.join(name).is_file(), "{name} missing");
        }
        assert!(!images.join("vendor.img").exists());
        assert!(!images.join("userdata.img").exists());
        assert_eq!(
            fs::read_to_string(temp.path().join(CARE_MAP_PATH)).unwrap(),
            "system\n0-7"
        );

        assert_eq!(summary.state("boot"), PartitionState::Written);
        assert_eq!(summary.state("system"), PartitionState::Written);
        assert_eq!(summary.state("modem"), PartitionState::Written);
        assert_eq!(summary.state("recovery"), PartitionState::NotPresent);
        assert_eq!(summary.state("vendor"), PartitionState::NotPresent);
        assert!(runner.calls_to("build_image").len() == 1);
    }

    #[test]
    fn test_missing_vendor_skips_vendor_everywhere() {
        let temp = TempDir::new().unwrap();
        package(
            temp.path(),
            "system_size=1048576\nboard_avb_enable=true\nboot_size=67108864\nvendor_verity_block_device=/dev/block/vendor\n",
        );
        write(temp.path(), "META/ab_partitions.txt", b"system\nboot\n");
        let runner = host_tools(None);

        let summary = add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &runner,
        )
        .unwrap();

        let vbmeta = runner
            .calls_to("avbtool")
            .into_iter()
            .find(|c| c.get_args()[0] == "make_vbmeta_image")
            .unwrap();
        let includes = vbmeta
            .get_args()
            .iter()
            .filter(|a| *a == "--include_descriptors_from_image")
            .count();
        assert_eq!(includes, 2);
        assert_eq!(summary.state("vbmeta"), PartitionState::Written);
        assert!(summary.care_map.is_empty());
        assert!(!temp.path().join(CARE_MAP_PATH).exists());
        assert!(temp.path().join("IMAGES/vbmeta.img").is_file());
    }

    #[test]
    fn test_missing_ab_image_is_fatal() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "system_size=1048576\n");
        write(temp.path(), "META/ab_partitions.txt", b"system\nxbl\n");

        let err = add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &host_tools(None),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "cannot find xbl.img");
    }

    #[test]
    fn test_ab_image_found_in_vendor_images() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "system_size=1048576\n");
        write(temp.path(), "META/ab_partitions.txt", b"tz\n");
        write(temp.path(), "VENDOR_IMAGES/firmware/qcom/tz.img", b"tz");

        add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &host_tools(None),
        )
        .unwrap();
        assert_eq!(fs::read(temp.path().join("IMAGES/tz.img")).unwrap(), b"tz");
    }

    #[test]
    fn test_signing_run_skips_userdata() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "system_size=1048576\nuserdata_size=1048576\n");
        let runner = host_tools(None);
        let options = AddImagesOptions {
            is_signing: true,
            ..Default::default()
        };

        add_images_to_target_files(temp.path(), &options, &ToolPaths::default(), &runner)
            .unwrap();
        assert_eq!(runner.calls_to("build_image").len(), 1);
        assert!(!temp.path().join("IMAGES/userdata.img").exists());
    }

    fn zip_package(path: &Path, files: &[(&str, &[u8])]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, contents) in files {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_zip_run_appends_without_duplicates() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("target_files.zip");
        zip_package(
            &zip_path,
            &[
                ("META/misc_info.txt", VERITY_INFO.as_bytes()),
                ("META/ab_partitions.txt", b"system\n"),
                ("SYSTEM/build.prop", b"ro.build.id=TEST\n"),
                ("BOOT/kernel", b"kernel"),
                ("BOOT/RAMDISK/init", b"init"),
                ("IMAGES/boot.img", b"prebuilt boot"),
            ],
        );
        let options = AddImagesOptions {
            add_missing: true,
            ..Default::default()
        };

        let summary = add_images_to_target_files(
            &zip_path,
            &options,
            &ToolPaths::default(),
            &host_tools(Some(4096 * 4)),
        )
        .unwrap();
        assert_eq!(summary.state("boot"), PartitionState::Skipped);
        assert_eq!(summary.state("system"), PartitionState::Written);

        let mut archive = ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
        for name in ["IMAGES/system.img", "IMAGES/system.map", CARE_MAP_PATH] {
            assert!(names.iter().any(|n| n == name), "{name} missing");
        }

        let mut body = String::new();
        archive
            .by_name(CARE_MAP_PATH)
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "system\n0-3");

        let mut boot = Vec::new();
        archive
            .by_name("IMAGES/boot.img")
            .unwrap()
            .read_to_end(&mut boot)
            .unwrap();
        assert_eq!(boot, b"prebuilt boot");
    }

    #[test]
    fn test_zip_with_images_without_add_missing_is_untouched() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("target_files.zip");
        zip_package(
            &zip_path,
            &[
                ("META/misc_info.txt", VERITY_INFO.as_bytes()),
                ("SYSTEM/build.prop", b"ro.build.id=TEST\n"),
                ("IMAGES/boot.img", b"prebuilt boot"),
            ],
        );
        let before = fs::read(&zip_path).unwrap();
        let runner = FakeRunner::succeeding();

        let err = add_images_to_target_files(
            &zip_path,
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &runner,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "target_files appears to already contain images.");
        assert!(runner.calls().is_empty());
        assert_eq!(fs::read(&zip_path).unwrap(), before);
    }

    #[test]
    fn test_zip_ab_image_built_this_run_is_not_copied_again() {
        let temp = TempDir::new().unwrap();
        let zip_path = temp.path().join("target_files.zip");
        zip_package(
            &zip_path,
            &[
                ("META/misc_info.txt", b"system_size=1048576\n"),
                ("META/ab_partitions.txt", b"boot\n"),
                ("SYSTEM/build.prop", b"ro.build.id=TEST\n"),
                ("BOOT/kernel", b"kernel"),
                ("BOOT/RAMDISK/init", b"init"),
                ("RADIO/boot.img", b"radio boot"),
            ],
        );

        let summary = add_images_to_target_files(
            &zip_path,
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &host_tools(None),
        )
        .unwrap();
        assert_eq!(summary.state("boot"), PartitionState::Written);

        let mut archive = ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        let boots = archive
            .file_names()
            .filter(|name| *name == "IMAGES/boot.img")
            .count();
        assert_eq!(boots, 1);
        let mut boot = Vec::new();
        archive
            .by_name("IMAGES/boot.img")
            .unwrap()
            .read_to_end(&mut boot)
            .unwrap();
        assert_ne!(boot, b"radio boot");
    }

    #[test]
    fn test_care_map_excludes_verity_when_tool_keeps_partition_size() {
        let temp = TempDir::new().unwrap();
        package(
            temp.path(),
            "system_size=40960\nsystem_verity_block_device=/dev/block/by-name/system\nverity=true\n",
        );
        write(temp.path(), "META/ab_partitions.txt", b"system\n");

        let summary = add_images_to_target_files(
            temp.path(),
            &AddImagesOptions::default(),
            &ToolPaths::default(),
            &host_tools(None),
        )
        .unwrap();
        assert_eq!(
            summary.care_map,
            [CareMapEntry {
                partition: "system".to_string(),
                ranges: "0".to_string(),
            }]
        );
        assert_eq!(
            fs::read_to_string(temp.path().join(CARE_MAP_PATH)).unwrap(),
            "system\n0"
        );
    }

    #[test]
    fn test_rebuild_recovery_patches_system_before_build() {
        let temp = TempDir::new().unwrap();
        package(temp.path(), "system_size=1048576\nfull_recovery_image=true\n");
        write(temp.path(), "RECOVERY/kernel", b"kernel");
        write(temp.path(), "RECOVERY/RAMDISK/init", b"init");
        let options = AddImagesOptions {
            rebuild_recovery: true,
            ..Default::default()
        };

        let summary =
            add_images_to_target_files(temp.path(), &options, &ToolPaths::default(), &host_tools(None))
                .unwrap();
        assert_eq!(summary.state("recovery"), PartitionState::Written);
        assert_eq!(summary.state("recovery-two-step"), PartitionState::Written);
        assert!(temp.path().join("SYSTEM/etc/recovery.img").is_file());
    }

    #[test]
    fn test_state_regression_is_rejected() {
        let mut progress = Progress::default();
        progress.advance("system", PartitionState::Built).unwrap();
        progress.advance("system", PartitionState::Staged).unwrap();
        assert!(progress.advance("system", PartitionState::Built).is_err());
        progress.advance("system", PartitionState::Written).unwrap();
        assert!(progress.advance("system", PartitionState::Written).is_err());

        progress.advance("boot", PartitionState::Skipped).unwrap();
        assert!(progress.advance("boot", PartitionState::Built).is_err());

        let summary = RunSummary::from(progress);
        assert_eq!(
            summary.states,
            [
                ("system".to_string(), PartitionState::Written),
                ("boot".to_string(), PartitionState::Skipped)
            ]
        );
    }
}
