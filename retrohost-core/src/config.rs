//! Host configuration.
//!
//! Values come from the environment first (`HostConfig::from_env`); the CLI
//! layers its own arguments on top with the `with_*` builders.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

/// Replaces whatever core library path a caller asks for.
pub const CORE_OVERRIDE_VAR: &str = "RETROHOST_CORE_OVERRIDE";

/// Directory handed to cores asking for their system/BIOS directory.
pub const SYSTEM_DIR_VAR: &str = "RETROHOST_SYSTEM_DIR";

/// Settings shared by every core a host opens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    /// Answer to `GET_SYSTEM_DIRECTORY` and friends
    pub system_directory: Option<PathBuf>,
    /// Core library used instead of the requested one
    pub core_override: Option<PathBuf>,
    /// Core option values that win over the core's defaults
    pub option_overrides: BTreeMap<String, String>,
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `RETROHOST_CORE_OVERRIDE` and `RETROHOST_SYSTEM_DIR`.
    pub fn from_env() -> Self {
        let var = |name: &str| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            system_directory: var(SYSTEM_DIR_VAR),
            core_override: var(CORE_OVERRIDE_VAR),
            option_overrides: BTreeMap::new(),
        }
    }

    pub fn with_system_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_directory = Some(dir.into());
        self
    }

    pub fn with_core_override(mut self, path: impl Into<PathBuf>) -> Self {
        self.core_override = Some(path.into());
        self
    }

    /// Force a core option to `value`.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.option_overrides.insert(key.into(), value.into());
        self
    }

    /// Parse a `key=value` option as written on the command line.
    pub fn parse_option(text: &str) -> Option<(String, String)> {
        let (key, value) = text.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    }

    /// The library that will actually be opened for `requested`.
    pub fn resolve_core_path(&self, requested: &Path) -> PathBuf {
        match &self.core_override {
            Some(path) => {
                info!(requested = %requested.display(), using = %path.display(), "core path overridden");
                path.clone()
            }
            None => requested.to_path_buf(),
        }
    }
}
