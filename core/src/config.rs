//! Config: tunnel credentials and listener options.
//! Sources, lowest to highest priority: settings.json, environment (NGROK_AUTHTOKEN, NGROK_DOMAIN),
//! then whatever the embedder applies on top (e.g. CLI flags). Returned as an owned value; there is
//! no process-wide config instance.

use std::path::{Path, PathBuf};

/// Default first port tried by the listener.
pub const DEFAULT_PORT: u16 = 4000;
/// Default cap on bind attempts (first port included) before giving up.
pub const DEFAULT_MAX_PORT_ATTEMPTS: u32 = 100;

pub const ENV_AUTH_TOKEN: &str = "NGROK_AUTHTOKEN";
pub const ENV_DOMAIN: &str = "NGROK_DOMAIN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Tunnel credentials handed to the listener. Immutable once the listener is constructed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct HandlerConfig {
    pub tunnel_auth_token: String,
    /// Reserved/static hostname (e.g. myapp.ngrok.app). If set, the tunnel uses it instead of a random URL.
    pub reserved_hostname: Option<String>,
}

impl HandlerConfig {
    pub fn new(tunnel_auth_token: impl Into<String>, reserved_hostname: Option<String>) -> Self {
        Self {
            tunnel_auth_token: tunnel_auth_token.into(),
            reserved_hostname: reserved_hostname
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    /// Token trimmed; None when empty or whitespace only.
    pub fn auth_token(&self) -> Option<&str> {
        Some(self.tunnel_auth_token.trim()).filter(|s| !s.is_empty())
    }
}

// Keep the token out of logs.
impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("tunnel_auth_token", &if self.auth_token().is_some() { "<set>" } else { "<empty>" })
            .field("reserved_hostname", &self.reserved_hostname)
            .finish()
    }
}

/// How the listener picks its local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    /// First port tried; on conflict the next port up is tried.
    pub port: u16,
    /// Total bind attempts allowed, first port included. 0 is treated as 1.
    pub max_port_attempts: u32,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_port_attempts: DEFAULT_MAX_PORT_ATTEMPTS,
        }
    }
}

/// Everything the binary needs to build a listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub handler: HandlerConfig,
    pub listener: ListenerOptions,
}

impl Config {
    /// Load settings.json (if `path` is given and exists), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => load_settings_from(p)?,
            _ => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override credentials from environment-style lookups. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_AUTH_TOKEN).filter(|s| !s.trim().is_empty()) {
            self.handler.tunnel_auth_token = token.trim().to_string();
        }
        if let Some(domain) = lookup(ENV_DOMAIN).map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            self.handler.reserved_hostname = Some(domain);
        }
    }
}

fn load_settings_from(path: &Path) -> Result<Config, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let root = serde_json::from_str::<serde_json::Value>(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    parse_settings(&root)
}

/// Read the known keys out of a settings.json document. Unknown keys are ignored.
pub fn parse_settings(root: &serde_json::Value) -> Result<Config, ConfigError> {
    let tunnel_ngrok = root.get("tunnel").and_then(|t| t.get("ngrok"));
    let tunnel_auth_token = tunnel_ngrok
        .and_then(|n| n.get("auth_token"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let reserved_hostname = tunnel_ngrok
        .and_then(|n| n.get("domain"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let listener = root.get("listener");
    let port = match listener.and_then(|l| l.get("port")) {
        None => DEFAULT_PORT,
        Some(v) => v
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| ConfigError::Invalid {
                key: "listener.port",
                message: format!("expected 0..=65535, got {}", v),
            })?,
    };
    let max_port_attempts = match listener.and_then(|l| l.get("max_port_attempts")) {
        None => DEFAULT_MAX_PORT_ATTEMPTS,
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::Invalid {
                key: "listener.max_port_attempts",
                message: format!("expected a positive integer, got {}", v),
            })?,
    };

    Ok(Config {
        handler: HandlerConfig::new(tunnel_auth_token, reserved_hostname),
        listener: ListenerOptions {
            port,
            max_port_attempts,
        },
    })
}
