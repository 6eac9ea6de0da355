//! RustQueue - single-node message queue server
//!
//! SQS-style at-least-once delivery over HTTP, stored either as one JSON file
//! per queue or in a SQLite database.

mod config;
mod router;

use clap::{Parser, ValueEnum};
use rustqueue_auth::{AllowAll, ApiKeyAuthorizer, Authorizer};
use rustqueue_queue::{FileStorage, QueueEngine, QueueStorage, SqliteStorage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StorageConfig};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    File,
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "rustqueue")]
#[command(about = "Single-node message queue server", long_about = None)]
struct Args {
    /// Configuration file (defaults to ./rustqueue.toml when present)
    #[arg(short, long, env = "RUSTQUEUE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RUSTQUEUE_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RUSTQUEUE_HOST")]
    host: Option<String>,

    /// Storage backend
    #[arg(long, value_enum, env = "RUSTQUEUE_BACKEND")]
    backend: Option<Backend>,

    /// Queue directory for the file backend
    #[arg(long, env = "RUSTQUEUE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Database path for the sqlite backend
    #[arg(long, env = "RUSTQUEUE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Require API keys
    #[arg(long, env = "RUSTQUEUE_AUTH")]
    auth: Option<bool>,

    /// API keys JSON file
    #[arg(long, env = "RUSTQUEUE_KEYS_FILE")]
    keys_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUSTQUEUE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    /// Command line flags win over the configuration file
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(enabled) = self.auth {
            config.auth.enabled = enabled;
        }
        if self.keys_file.is_some() {
            config.auth.keys_file = self.keys_file;
        }

        let backend = self.backend.unwrap_or(match config.storage {
            StorageConfig::File { .. } => Backend::File,
            StorageConfig::Sqlite { .. } => Backend::Sqlite,
        });
        config.storage = match (backend, &config.storage) {
            (Backend::File, StorageConfig::File { data_dir }) => StorageConfig::File {
                data_dir: self.data_dir.unwrap_or_else(|| data_dir.clone()),
            },
            (Backend::File, StorageConfig::Sqlite { .. }) => StorageConfig::File {
                data_dir: self.data_dir.unwrap_or_else(crate::config::default_data_dir),
            },
            (Backend::Sqlite, StorageConfig::Sqlite { path }) => StorageConfig::Sqlite {
                path: self.db_path.unwrap_or_else(|| path.clone()),
            },
            (Backend::Sqlite, StorageConfig::File { .. }) => StorageConfig::Sqlite {
                path: self.db_path.unwrap_or_else(crate::config::default_db_path),
            },
        };
    }
}

async fn open_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn QueueStorage>> {
    let storage: Arc<dyn QueueStorage> = match config {
        StorageConfig::File { data_dir } => Arc::new(FileStorage::open(data_dir).await?),
        StorageConfig::Sqlite { path } => Arc::new(SqliteStorage::open(path).await?),
    };
    Ok(storage)
}

fn build_authorizer(config: &Config) -> Arc<dyn Authorizer> {
    if !config.auth.enabled {
        info!("  Auth: disabled");
        return Arc::new(AllowAll);
    }

    let keys = ApiKeyAuthorizer::load(config.auth.keys_file.as_deref());
    if keys.is_empty() {
        warn!("Authentication enabled but no API keys loaded; every request will be rejected");
    }
    info!("  Auth: {} API key(s)", keys.len());
    Arc::new(keys)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("rustqueue={},tower_http=debug", config.logging.level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RustQueue...");

    let storage = open_storage(&config.storage).await?;
    info!("  Storage: {} ({:?})", storage.backend_name(), config.storage);

    let engine = QueueEngine::new(storage, config.queue.clone())
        .with_authorizer(build_authorizer(&config));

    if engine.health_check(None).await? {
        info!("Storage health check passed");
    } else {
        warn!("Storage health check failed; continuing");
    }

    // Create router
    let app = router::create_router(engine);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
