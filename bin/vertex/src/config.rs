//! Figment-based configuration loading.
//!
//! Configuration priority (highest wins):
//! 1. CLI arguments
//! 2. Config file (TOML)
//! 3. Environment variables (`VERTEX_` prefix, `__` between sections)
//! 4. Defaults

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use vertex_swarm_localstore::LocalStoreArgs;

use crate::cli::Cli;

/// Default data directory, relative to the working directory.
const DEFAULT_DATADIR: &str = "vertex-data";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct VertexConfig {
    pub(crate) datadir: PathBuf,
    pub(crate) localstore: LocalStoreArgs,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            datadir: PathBuf::from(DEFAULT_DATADIR),
            localstore: LocalStoreArgs::default(),
        }
    }
}

impl VertexConfig {
    /// Load configuration from defaults, environment, and config file.
    pub(crate) fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("VERTEX_").split("__"));

        if let Some(path) = config_path {
            if !path.exists() {
                eyre::bail!("config file {} does not exist", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        figment.extract().wrap_err("Failed to load configuration")
    }

    pub(crate) fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(datadir) = &cli.datadir {
            self.datadir = datadir.clone();
        }
        if let Some(shards) = cli.shards {
            self.localstore.shards = shards;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = VertexConfig::default();
        assert_eq!(config.datadir, PathBuf::from(DEFAULT_DATADIR));
        assert!(!config.localstore.in_memory);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
datadir = "/var/lib/vertex"

[localstore]
shards = 4
reserve_chunks = 1000
"#,
        )
        .unwrap();

        let config = VertexConfig::load(Some(&config_path)).unwrap();
        assert_eq!(config.datadir, PathBuf::from("/var/lib/vertex"));
        assert_eq!(config.localstore.shards, 4);
        assert_eq!(config.localstore.reserve_chunks, 1000);
        assert_eq!(
            config.localstore.cache_chunks,
            LocalStoreArgs::default().cache_chunks
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(VertexConfig::load(Some(&temp_dir.path().join("nope.toml"))).is_err());
    }
}
