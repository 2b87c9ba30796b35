use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rpc_client::dynconfig::{ConfigStore, MemoryStore, RemoteStore};
use rpc_client::error::ConfigLoadError;
use rpc_client::metrics::MemoryMetrics;
use rpc_client::{report, ClientSet, Collaborators, Context, RpcError};
use rpc_core::config::ClientConfig;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigLoadError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("no client configured for {0}")]
    UnknownService(String),
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Config(e.into())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(e: toml::de::Error) -> Self {
        AppError::Config(e.into())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Config(e.into())
    }
}

type Result<T> = std::result::Result<T, AppError>;

/// Calls `service` a few times with each method and prints what the
/// client saw.
async fn drive(clients: &ClientSet, service: &str) -> Result<()> {
    let client = clients.get(service).ok_or_else(|| AppError::UnknownService(service.to_string()))?;
    let calls: [(&str, &[u8]); 3] = [("echo", b"hello"), ("sleep", b"20"), ("fail", b"")];
    for round in 0..3 {
        for (method, payload) in calls {
            let ctx = Context::new().with_log_id(format!("demo-{round}-{method}"));
            match client.call(method, ctx, Bytes::copy_from_slice(payload)).await {
                Ok(resp) => info!(method, bytes = resp.len(), "call ok"),
                Err(e) => warn!(method, code = e.code(), error = %e, "call failed"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .init();

    let config_path = std::env::args().nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "demos/client.toml".to_string());
    let config = ClientConfig::<AppError>::from_file(&config_path).await?;
    info!(config = %config.to_json()?, "loaded config");

    let store: Arc<dyn ConfigStore> = match &config.config_plane {
        Some(url) => Arc::new(RemoteStore::connect(url, Duration::from_secs(5))),
        None => Arc::new(MemoryStore::new()),
    };
    let metrics = Arc::new(MemoryMetrics::new());
    let deps = Collaborators {
        store,
        metrics: metrics.clone(),
        ..Default::default()
    };
    let clients = ClientSet::from_config(&config, deps)?;

    let services: Vec<String> = clients.iter().map(|(name, _)| name.to_string()).collect();
    for service in &services {
        drive(&clients, service).await?;
    }

    println!("{}", report::render_text(&clients));
    for (series, value) in metrics.counters() {
        println!("{series} {value}");
    }
    Ok(())
}
