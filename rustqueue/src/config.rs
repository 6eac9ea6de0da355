//! Configuration management

use rustqueue_queue::QueueLimits;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: QueueLimits,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Storage backend, chosen once at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "file")]
    File {
        #[serde(default = "default_data_dir")]
        data_dir: PathBuf,
    },

    #[serde(rename = "sqlite")]
    Sqlite {
        #[serde(default = "default_db_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::File {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AuthConfig {
    /// Require an API key on every request
    #[serde(default)]
    pub enabled: bool,

    /// JSON document of API keys
    pub keys_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from("data/queues")
}

pub fn default_db_path() -> PathBuf {
    PathBuf::from("data/rustqueue.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Without an explicit path an optional `rustqueue.toml` in the working
    /// directory is used. Environment variables look like
    /// `RUSTQUEUE__STORAGE__TYPE=sqlite`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("rustqueue").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("RUSTQUEUE").separator("__"))
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }
}
