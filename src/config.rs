//! Server configuration, loaded from TOML.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn default_bind() -> SocketAddr {
    "127.0.0.1:4422".parse().unwrap()
}

fn default_idle_timeout_mins() -> u64 {
    30
}

fn default_token_ttl_mins() -> u64 {
    15
}

/// Top-level server config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// TLS certificate and key paths. Both must be set to enable TLS.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Shell sessions idle longer than this are reaped.
    #[serde(default = "default_idle_timeout_mins")]
    pub session_idle_timeout_mins: u64,
    /// Lifetime of issued auth tokens.
    #[serde(default = "default_token_ttl_mins")]
    pub token_ttl_mins: u64,
    /// Optional cap on concurrently live sessions.
    pub max_sessions: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tls_cert: None,
            tls_key: None,
            session_idle_timeout_mins: default_idle_timeout_mins(),
            token_ttl_mins: default_token_ttl_mins(),
            max_sessions: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

impl ServerConfig {
    /// Default config path: `$HOME/.webterm/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".webterm/config.toml"))
    }

    /// Load config from a TOML file. Returns `Ok(None)` if the file does not
    /// exist. Warns when the file is world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.session_idle_timeout_mins * 60)
    }

    pub fn token_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.token_ttl_mins * 60)
    }
}

/// Warn if a config file is world-readable; it sits next to token material.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}); consider restricting to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}
