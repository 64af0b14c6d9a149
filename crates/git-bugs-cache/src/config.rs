//! Project configuration read from `.git-bugs/config.toml`.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

const CONFIG_DIR: &str = ".git-bugs";
const CONFIG_FILE: &str = "config.toml";

/// Top-level project configuration loaded from `.git-bugs/config.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// `[cache]` table.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ProjectConfig {
    /// Load configuration from a known working tree directory. A missing file yields
    /// the defaults.
    ///
    /// # Errors
    /// Fails if the file exists but cannot be read or parsed.
    pub fn from_workdir(workdir: impl AsRef<Path>) -> Result<Self> {
        let config_path = workdir.as_ref().join(CONFIG_DIR).join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        Ok(config)
    }
}

/// Cache behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Remove lock files left by dead processes. Disable on shared filesystems,
    /// where a pid recorded by another host always looks dead.
    pub reclaim_stale_lock: bool,
    /// Rebuild over cache files with an unknown format version instead of failing.
    pub rebuild_incompatible: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reclaim_stale_lock: true,
            rebuild_incompatible: false,
        }
    }
}
