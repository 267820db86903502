//! Configuration loading and validation.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

fn default_prefix() -> String {
    "bnc".to_string()
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Prefix used when the bouncer synthesizes lines to clients.
    pub prefix: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            log_format: LogFormat::default(),
        }
    }
}

/// `[listen]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub address: SocketAddr,
}

fn default_db_path() -> String {
    "slbnc.db".to_string()
}

/// `[database]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// `[[seed_user]]` blocks: accounts created idempotently at boot.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

fn default_port() -> u16 {
    6697
}

fn default_true() -> bool {
    true
}

/// `[[seed_network]]` blocks: network definitions created idempotently at
/// boot for a seed user.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedNetwork {
    pub user: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub nick: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub listen: ListenConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default, rename = "seed_user")]
    pub seed_users: Vec<SeedUser>,
    #[serde(default, rename = "seed_network")]
    pub seed_networks: Vec<SeedNetwork>,
}

impl Config {
    /// Load and parse a TOML config file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}

/// Validate a loaded configuration, collecting every problem.
pub fn validate(config: &Config) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.server.prefix.is_empty() || config.server.prefix.contains(' ') {
        errors.push("server.prefix must be a single non-empty token".to_string());
    }

    for (i, user) in config.seed_users.iter().enumerate() {
        if user.username.is_empty() {
            errors.push(format!("seed_user[{}]: username must not be empty", i));
        }
        if user.username.contains(['/', ':', ' ']) {
            errors.push(format!(
                "seed_user[{}]: username must not contain '/', ':' or spaces",
                i
            ));
        }
        if user.password.is_empty() {
            errors.push(format!("seed_user[{}]: password must not be empty", i));
        }
    }

    for (i, net) in config.seed_networks.iter().enumerate() {
        if net.name.is_empty() || net.name.contains([':', ' ']) {
            errors.push(format!("seed_network[{}]: invalid name", i));
        }
        if net.host.is_empty() {
            errors.push(format!("seed_network[{}]: host must not be empty", i));
        }
        if !config.seed_users.iter().any(|u| u.username == net.user) {
            errors.push(format!(
                "seed_network[{}]: user {:?} has no seed_user block",
                i, net.user
            ));
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
