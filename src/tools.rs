//! Locations of the external tools, taken from the environment.

/// Program names (or paths) for every external tool the image flow runs.
///
/// Each one can be overridden with an environment variable; an unset or empty
/// variable falls back to the bare tool name, resolved on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub avbtool: String,
    pub bpttool: String,
    pub build_image: String,
    pub mkbootimg: String,
    pub mkbootfs: String,
    pub minigzip: String,
    pub imgdiff: String,
    pub boot_signer: String,
}

/// (environment variable, default program) for each tool.
const TOOL_ENV: &[(&str, &str)] = &[
    ("AVBTOOL", "avbtool"),
    ("BPTTOOL", "bpttool"),
    ("BUILD_IMAGE", "build_image"),
    ("MKBOOTIMG", "mkbootimg"),
    ("MKBOOTFS", "mkbootfs"),
    ("MINIGZIP", "minigzip"),
    ("IMGDIFF", "imgdiff"),
    ("BOOT_SIGNER", "boot_signer"),
];

impl ToolPaths {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let resolve = |key: &str| -> String {
            let default = TOOL_ENV
                .iter()
                .find(|(env, _)| *env == key)
                .map(|(_, program)| *program)
                .unwrap_or(key);
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            avbtool: resolve("AVBTOOL"),
            bpttool: resolve("BPTTOOL"),
            build_image: resolve("BUILD_IMAGE"),
            mkbootimg: resolve("MKBOOTIMG"),
            mkbootfs: resolve("MKBOOTFS"),
            minigzip: resolve("MINIGZIP"),
            imgdiff: resolve("IMGDIFF"),
            boot_signer: resolve("BOOT_SIGNER"),
        }
    }
}

impl ToolPaths {
    /// `(program, environment variable)` for every tool.
    pub fn entries(&self) -> [(&str, &'static str); 8] {
        [
            (self.avbtool.as_str(), "AVBTOOL"),
            (self.bpttool.as_str(), "BPTTOOL"),
            (self.build_image.as_str(), "BUILD_IMAGE"),
            (self.mkbootimg.as_str(), "MKBOOTIMG"),
            (self.mkbootfs.as_str(), "MKBOOTFS"),
            (self.minigzip.as_str(), "MINIGZIP"),
            (self.imgdiff.as_str(), "IMGDIFF"),
            (self.boot_signer.as_str(), "BOOT_SIGNER"),
        ]
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
