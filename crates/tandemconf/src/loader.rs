//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, TandemConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli). Only existing
/// files are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tandem/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tandem/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tandem.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key,
/// everything else is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table, expanding `~` in the paths section.
pub(crate) fn from_table(table: toml::Table, origin: &Path) -> Result<TandemConfig, ConfigError> {
    let mut config: TandemConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

    config.paths.state_dir = expand_path(&config.paths.state_dir.to_string_lossy());
    config.paths.archive_dir = expand_path(&config.paths.archive_dir.to_string_lossy());
    config.paths.storage_dir = expand_path(&config.paths.storage_dir.to_string_lossy());

    Ok(config)
}

/// Apply environment variable overrides to config.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn apply_env_overrides<F>(config: &mut TandemConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| {
        let value = lookup(key);
        if value.is_some() {
            sources.env_overrides.push(key.to_string());
        }
        value
    };

    if let Some(v) = take("TANDEM_STATE_DIR") {
        config.paths.state_dir = expand_path(&v);
    }
    if let Some(v) = take("TANDEM_ARCHIVE_DIR") {
        config.paths.archive_dir = expand_path(&v);
    }
    if let Some(v) = take("TANDEM_STORAGE_DIR") {
        config.paths.storage_dir = expand_path(&v);
    }
    if let Some(v) = take("TANDEM_LISTEN") {
        config.bind.listen = v;
    }
    if let Some(v) = take("TANDEM_CONDUCTOR") {
        config.bind.conductor = v;
    }
    if let Some(v) = take("TANDEM_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = take("TANDEM_NODE_ID") {
        config.node.node_id = v;
    }
    if let Some(v) = take("TANDEM_CAPABILITIES") {
        config.node.capabilities = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
}

/// Expand `~/` and a leading `$VAR/` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(slash) => (&stripped[..slash], Some(&stripped[slash + 1..])),
            None => (stripped, None),
        };
        if let Ok(value) = std::env::var(var_name) {
            let base = PathBuf::from(value);
            return match rest {
                Some(rest) => base.join(rest),
                None => base,
            };
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_merge_is_per_key() {
        let mut base: toml::Table = "[sync]\nmax_rtt_ms = 40\nwindow = 8\n".parse().unwrap();
        let overlay: toml::Table = "[sync]\nmax_rtt_ms = 20\n".parse().unwrap();
        merge_tables(&mut base, overlay);

        let config = from_table(base, Path::new("test.toml")).unwrap();
        assert_eq!(config.sync.max_rtt_ms, 20);
        assert_eq!(config.sync.window, 8);
        assert_eq!(config.sync.samples_per_round, 5);
    }

    #[test]
    fn test_layered_files() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.toml");
        let second = dir.path().join("b.toml");
        std::fs::write(&first, "[node]\nnode_id = \"phone-a\"\nsample_rate_hz = 50\n").unwrap();
        std::fs::write(&second, "[node]\nsample_rate_hz = 200\n").unwrap();

        let mut merged = load_table(&first).unwrap();
        merge_tables(&mut merged, load_table(&second).unwrap());
        let config = from_table(merged, &second).unwrap();

        assert_eq!(config.node.node_id, "phone-a");
        assert_eq!(config.node.sample_rate_hz, 200);
    }

    #[test]
    fn test_parse_error_names_file() {
        let result = parse_table("[sync\n", Path::new("broken.toml"));
        match result {
            Err(ConfigError::Parse { path, .. }) => assert_eq!(path, PathBuf::from("broken.toml")),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TANDEM_NODE_ID", "thermal-1"),
            ("TANDEM_CAPABILITIES", "thermal, camera"),
            ("TANDEM_LISTEN", "127.0.0.1:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = TandemConfig::default();
        let mut sources = ConfigSources::default();
        apply_env_overrides(&mut config, &mut sources, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.node.node_id, "thermal-1");
        assert_eq!(config.node.capabilities, vec!["thermal", "camera"]);
        assert_eq!(config.bind.listen, "127.0.0.1:9000");
        assert_eq!(sources.env_overrides.len(), 3);
    }
}
