use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from follow.toml.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct FollowConfig {
    pub lookup: LookupConfig,
    pub tracer: TracerConfig,
    pub filter: FilterConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LookupConfig {
    pub command: String,
    pub args: Vec<String>,
    pub retry_interval_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TracerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub string_limit: u32,
    pub restart_delay_ms: u64,
    pub max_restart_delay_ms: u64,
    pub max_consecutive_failures: u32,
    pub stop_grace_ms: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct FilterConfig {
    /// File descriptors whose writes are relayed. Empty relays every fd.
    pub fds: Vec<u32>,
}

/// Errors raised while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl FollowConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

// --- Default implementations ---

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            command: "pgrep".to_string(),
            args: vec!["{name}".to_string()],
            retry_interval_ms: 500,
            max_attempts: None,
        }
    }
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            command: "strace".to_string(),
            args: vec![
                "-p".to_string(),
                "{pid}".to_string(),
                "-s".to_string(),
                "{string_limit}".to_string(),
                "-e".to_string(),
                "trace=write".to_string(),
            ],
            string_limit: 9999,
            restart_delay_ms: 500,
            max_restart_delay_ms: 30_000,
            max_consecutive_failures: 5,
            stop_grace_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_classic_invocation() {
        let config = FollowConfig::default();
        assert_eq!(config.lookup.command, "pgrep");
        assert_eq!(config.lookup.retry_interval_ms, 500);
        assert_eq!(config.lookup.max_attempts, None);
        assert_eq!(config.tracer.command, "strace");
        assert_eq!(config.tracer.string_limit, 9999);
        assert!(config.tracer.args.contains(&"trace=write".to_string()));
        assert!(config.filter.fds.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = FollowConfig::from_toml(
            r#"
            [lookup]
            retry_interval_ms = 250

            [filter]
            fds = [1]
            "#,
        )
        .unwrap();
        assert_eq!(config.lookup.retry_interval_ms, 250);
        assert_eq!(config.lookup.command, "pgrep");
        assert_eq!(config.tracer.max_consecutive_failures, 5);
        assert_eq!(config.filter.fds, vec![1]);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = FollowConfig::from_toml("").unwrap();
        assert_eq!(config.tracer.command, "strace");
    }

    #[test]
    fn test_bounded_lookup() {
        let config = FollowConfig::from_toml("[lookup]\nmax_attempts = 3\n").unwrap();
        assert_eq!(config.lookup.max_attempts, Some(3));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FollowConfig::load(&dir.path().join("follow.toml")).unwrap();
        assert_eq!(config.lookup.retry_interval_ms, 500);
    }

    #[test]
    fn test_load_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follow.toml");
        std::fs::write(&path, "[lookup]\nretry_interval_ms = \"soon\"\n").unwrap();
        let err = FollowConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_load_reads_tracer_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("follow.toml");
        std::fs::write(
            &path,
            "[tracer]\ncommand = \"/usr/local/bin/strace\"\nstring_limit = 128\n",
        )
        .unwrap();
        let config = FollowConfig::load(&path).unwrap();
        assert_eq!(config.tracer.command, "/usr/local/bin/strace");
        assert_eq!(config.tracer.string_limit, 128);
        assert_eq!(config.tracer.args.len(), 6);
    }
}
