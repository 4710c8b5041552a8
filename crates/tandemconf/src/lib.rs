//! Configuration loading for Tandem.
//!
//! Shared by the conductor and the sensor nodes. Every section has compiled
//! defaults, so an empty file (or no file at all) yields a working config.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, table by table):
//! 1. `/etc/tandem/config.toml` (system)
//! 2. `~/.config/tandem/config.toml` (user)
//! 3. `./tandem.toml` (local override) or the path given on the command line
//! 4. Environment variables (`TANDEM_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! archive_dir = "/data/tandem/archive"
//!
//! [bind]
//! listen = "0.0.0.0:7450"
//!
//! [sync]
//! samples_per_round = 8
//! max_rtt_ms = 50
//!
//! [session]
//! start_tolerance_us = 2000
//!
//! [node]
//! node_id = "phone-a"
//! capabilities = ["camera", "ppg"]
//! ```

pub mod infra;
pub mod loader;
pub mod timing;

pub use infra::{BindConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};
pub use timing::{
    LinkConfig, NodeConfig, RetryConfig, SessionConfig, SyncConfig, TransferConfig,
    MAX_CHUNK_SIZE,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete Tandem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TandemConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

impl TandemConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, with `config_path` replacing `./tandem.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and report where values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources, |key| std::env::var(key).ok());
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a config from a TOML string (defaults fill the gaps).
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let origin = Path::new("<inline>");
        let table = loader::parse_table(contents, origin)?;
        let config = loader::from_table(table, origin)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the protocol misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.ewma_alpha <= 0.0 || self.sync.ewma_alpha > 1.0 {
            return Err(ConfigError::Invalid(format!(
                "sync.ewma_alpha must be in (0, 1], got {}",
                self.sync.ewma_alpha
            )));
        }
        if self.sync.window == 0 {
            return Err(ConfigError::Invalid("sync.window must be at least 1".into()));
        }
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transfer.chunk_size must be in 1..={}, got {}",
                MAX_CHUNK_SIZE, self.transfer.chunk_size
            )));
        }
        if self.transfer.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if self.node.archive_queue_capacity == 0 || self.node.preview_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "node queue capacities must be at least 1".into(),
            ));
        }
        if self.node.preview_interval_ms == 0 || self.node.status_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "node preview and status intervals must be non-zero".into(),
            ));
        }
        if self.sync.resync_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.resync_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self)
            .unwrap_or_else(|e| format!("# failed to render config: {}\n", e));
        format!("# Tandem Configuration\n\n{}", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TandemConfig::default();
        assert_eq!(config.bind.listen, "0.0.0.0:7450");
        assert_eq!(config.sync.samples_per_round, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_roundtrips() {
        let config = TandemConfig::default();
        let rendered = config.to_toml();
        assert!(rendered.contains("[sync]"));
        assert!(rendered.contains("[session]"));

        let parsed = TandemConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let result = TandemConfig::from_toml_str("[sync]\newma_alpha = 0.0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_chunk_size_bounded_by_frame() {
        let ok = format!("[transfer]\nchunk_size = {}\n", MAX_CHUNK_SIZE);
        assert!(TandemConfig::from_toml_str(&ok).is_ok());

        let too_big = format!("[transfer]\nchunk_size = {}\n", 13 * 1024 * 1024);
        assert!(matches!(
            TandemConfig::from_toml_str(&too_big),
            Err(ConfigError::Invalid(msg)) if msg.contains("chunk_size")
        ));
    }

    #[test]
    fn test_load_defaults() {
        // Load should work even with no config files
        let config = TandemConfig::load_from(Some(Path::new("/nonexistent/tandem.toml")));
        assert!(config.is_ok());
    }
}
