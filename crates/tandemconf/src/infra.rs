//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for conductor and node state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for runtime state.
    /// Default: ~/.local/share/tandem
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Central archive where the conductor stores pulled bundles and manifests.
    /// Default: ~/.local/share/tandem/archive
    #[serde(default = "PathsConfig::default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Node-local session storage (one directory per session).
    /// Default: ~/.local/share/tandem/sessions
    #[serde(default = "PathsConfig::default_storage_dir")]
    pub storage_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tandem"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tandem"))
    }

    fn default_archive_dir() -> PathBuf {
        Self::default_state_dir().join("archive")
    }

    fn default_storage_dir() -> PathBuf {
        Self::default_state_dir().join("sessions")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            archive_dir: Self::default_archive_dir(),
            storage_dir: Self::default_storage_dir(),
        }
    }
}

/// Network addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Address the conductor listens on for node connections.
    /// Default: 0.0.0.0:7450
    #[serde(default = "BindConfig::default_listen")]
    pub listen: String,

    /// Address a sensor node dials to reach the conductor.
    /// Default: 127.0.0.1:7450
    #[serde(default = "BindConfig::default_conductor")]
    pub conductor: String,
}

impl BindConfig {
    fn default_listen() -> String {
        "0.0.0.0:7450".to_string()
    }

    fn default_conductor() -> String {
        "127.0.0.1:7450".to_string()
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            conductor: Self::default_conductor(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or full `EnvFilter` directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
