// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::{Path, PathBuf};

/// Compiled-in store root, overridable with `FS_STORE_ROOT`.
pub const DEFAULT_STORE_ROOT: &str = "/var/lib/quadstore";

/// Default TCP port of the backend daemon.
pub const DEFAULT_PORT: u16 = 6734;

/// Default free-disk threshold in GB below which imports are refused.
pub const DEFAULT_DISK_LIMIT_GB: f64 = 1.0;

/// Process-wide configuration, built once at entry and passed by reference.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory containing one subdirectory per KB
    pub store_root: PathBuf,

    /// Imports are refused while the store filesystem has less free space
    /// than this (GB)
    pub disk_limit_gb: f64,

    /// Listen port of the backend daemon
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: DEFAULT_STORE_ROOT.into(),
            disk_limit_gb: DEFAULT_DISK_LIMIT_GB,
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Starts a config with the given store root.
    pub fn new(store_root: impl AsRef<Path>) -> Self {
        Self {
            store_root: store_root.as_ref().into(),
            ..Self::default()
        }
    }

    /// Reads the compiled-in defaults, then applies environment overrides
    /// (`FS_STORE_ROOT`, `FS_DISK_LIMIT`, `DISK_LIMIT`).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("FS_STORE_ROOT") {
            if !root.is_empty() {
                config.store_root = root.into();
            }
        }

        let limit = std::env::var("FS_DISK_LIMIT").or_else(|_| std::env::var("DISK_LIMIT"));
        if let Ok(limit) = limit {
            if let Ok(gb) = limit.parse::<f64>() {
                config.disk_limit_gb = gb;
            } else {
                log::warn!("ignoring unparsable disk limit {limit:?}");
            }
        }

        config
    }

    #[must_use]
    pub fn disk_limit_gb(mut self, gb: f64) -> Self {
        self.disk_limit_gb = gb;
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn config_builder() {
        let config = Config::new("/tmp/kbs").disk_limit_gb(5.0).port(1234);
        assert_eq!(PathBuf::from("/tmp/kbs"), config.store_root);
        assert!((config.disk_limit_gb - 5.0).abs() < f64::EPSILON);
        assert_eq!(1234, config.port);
    }
}
