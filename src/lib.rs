//! Release tooling for Android platform builds.
//!
//! The main flow takes a target-files package (a zip archive or an unpacked
//! directory) and adds the images a flashable build needs:
//!
//! - **Bootable images** - boot and recovery (prebuilt or assembled with
//!   `mkbootimg`), optionally signed with a verity key or an AVB hash footer
//! - **Filesystem images** - system, vendor, system_other and userdata via
//!   `build_image`, with their block lists
//! - **Signing artifacts** - partition table (`bpttool`) and `vbmeta.img`
//!   (`avbtool`)
//! - **Care map** - the blocks of the verity-protected images, for A/B OTAs
//!
//! Next to it live two helpers for repo-managed source trees that edit the
//! local manifest: `roomservice` and `roomcleaner`.
//!
//! # Architecture
//!
//! ```text
//! add_img_to_target_files (bin)
//!     │
//!     └── orchestrate ── target_files (open, lock, read META/)
//!             │          info (typed misc_info + fstab)
//!             │
//!             ├── image::bootable ──┐
//!             ├── image (build_image)├── process (Cmd + ToolRunner)
//!             ├── sign ─────────────┘
//!             ├── care_map (sparse chunk scan)
//!             └── output (zip append or tree copy, fixed timestamps)
//!
//! roomservice / roomcleaner (bins)
//!     │
//!     └── roomservice ── forge (HTTP listing)
//!                        manifest (local manifest XML)
//!                        dependencies (JSON lists in device trees)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use releasetools::context::AddImagesOptions;
//! use releasetools::process::HostRunner;
//! use releasetools::tools::ToolPaths;
//!
//! let options = AddImagesOptions { add_missing: true, ..Default::default() };
//! let summary = releasetools::add_images_to_target_files(
//!     "out/target-files.zip".as_ref(),
//!     &options,
//!     &ToolPaths::from_env(),
//!     &HostRunner,
//! )?;
//! println!("{:?}", summary.state("system"));
//! ```

pub mod care_map;
pub mod context;
pub mod image;
pub mod info;
pub mod logging;
pub mod orchestrate;
pub mod output;
pub mod preflight;
pub mod process;
pub mod roomservice;
pub mod scratch;
pub mod sign;
pub mod target_files;
pub mod tools;

pub use context::AddImagesOptions;
pub use orchestrate::{add_images_to_target_files, PartitionState, RunSummary};
pub use tools::ToolPaths;
