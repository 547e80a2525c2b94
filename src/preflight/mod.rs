//! Preflight checks for host tools.
//!
//! Validates that the host has the tools a run will invoke, so a missing
//! program is reported up front instead of halfway through an image build.
//!
//! # Example
//!
//! ```rust
//! use releasetools::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("repo") {
//!     println!("git-repo not installed");
//! }
//!
//! let tools = &[("repo", "git-repo"), ("git", "git")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};
use tracing::warn;

use crate::tools::ToolPaths;

/// Tools roomservice needs. Each tuple is (command_name, package_name).
pub const ROOMSERVICE_TOOLS: &[(&str, &str)] = &[("repo", "git-repo")];

/// Check if a command exists on the host system, either as a path or on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// The subset of `tools` that cannot be found.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = missing_tools(tools);
    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Warn about image tools that cannot be found.
///
/// Not fatal: which tools a run needs depends on what the target-files
/// already carries. Returns the number of missing tools.
pub fn warn_missing_image_tools(tools: &ToolPaths) -> usize {
    let missing = missing_tools(&tools.entries());
    for (tool, env) in &missing {
        warn!(tool, "tool not found on PATH; set {env} if a step needs it");
    }
    missing.len()
}
