//! Allocator configuration and its TOML loader.

use loopalloc_error::{LoopError, LoopResult};
use loopalloc_hal::OpenMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_MAX_LOOP_DEVICES: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Devices `/dev/loop0` .. `/dev/loop{max_devices-1}` are candidates.
    pub max_devices: u32,
    /// Adopt an existing binding with the same fingerprint instead of attaching.
    pub share: bool,
    /// Mode the loop device itself is opened with.
    pub mode: OpenMode,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_LOOP_DEVICES,
            share: false,
            mode: OpenMode::ReadOnly,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default, rename = "loop")]
    section: AllocatorConfig,
}

impl AllocatorConfig {
    pub fn new(max_devices: u32) -> Self {
        Self {
            max_devices,
            ..Self::default()
        }
    }

    pub fn with_share(mut self, share: bool) -> Self {
        self.share = share;
        self
    }

    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parses the `[loop]` table of a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> LoopResult<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|err| LoopError::Config(err.to_string()))?;
        Ok(file.section)
    }

    pub fn load(path: &Path) -> LoopResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|err| match err {
            LoopError::Config(msg) => LoopError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }
}
