use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod error;
type Result<T> = std::result::Result<T, error::Error>;

const POLL_TIMEOUT: Duration = Duration::from_millis(3000);

type SharedState = Arc<RwLock<AppState>>;

struct AppState {
    values: HashMap<String, String>,
    changes: broadcast::Sender<Change>,
}

impl AppState {
    fn new(values: HashMap<String, String>) -> Self {
        Self {
            values,
            changes: broadcast::channel(64).0,
        }
    }

    fn set(&mut self, key: String, value: String) {
        if self.values.get(&key) == Some(&value) {
            return;
        }
        self.values.insert(key.clone(), value.clone());
        // no subscribers is fine
        let _ = self.changes.send(Change { key, value });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Change {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: String,
}

#[derive(Debug, Deserialize)]
struct GetOrSet {
    key: String,
    default: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Value {
    value: String,
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || !key.starts_with('/') {
        return Err(error::Error::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn app(state: SharedState) -> Router {
    Router::new()
        .route("/kv", get(get_value).put(put_value))
        .route("/kv/get_or_set", post(get_or_set))
        .route("/kv/all", get(all))
        .route("/poll", get(poll))
        .with_state(state)
}

/// Initial values from a JSON object file, if one is given.
async fn load_seed(path: Option<String>) -> Result<HashMap<String, String>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let content = tokio::fs::read_to_string(&path).await?;
    let values: HashMap<String, String> = serde_json::from_str(&content)?;
    info!(path = %path, keys = values.len(), "loaded seed values");
    Ok(values)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let values = load_seed(std::env::var("SEED_PATH").ok()).await?;
    let state = Arc::new(RwLock::new(AppState::new(values)));

    let addr = std::env::var("CONFIG_PLANE_ADDR").unwrap_or_else(|_| "0.0.0.0:7200".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "config plane listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn get_value(
    State(s): State<SharedState>,
    Query(q): Query<KeyQuery>,
) -> Result<String> {
    let s = s.read().await;
    s.values.get(&q.key)
        .cloned()
        .ok_or(error::Error::NotFound(q.key))
}

async fn put_value(
    State(s): State<SharedState>,
    Query(q): Query<KeyQuery>,
    body: Bytes,
) -> Result<()> {
    check_key(&q.key)?;
    let value = String::from_utf8_lossy(&body).trim().to_string();
    debug!(key = %q.key, value = %value, "set");
    s.write().await.set(q.key, value);
    Ok(())
}

async fn get_or_set(
    State(s): State<SharedState>,
    Json(req): Json<GetOrSet>,
) -> Result<Json<Value>> {
    check_key(&req.key)?;
    if let Some(v) = s.read().await.values.get(&req.key) {
        return Ok(Json(Value { value: v.clone() }));
    }
    let mut s = s.write().await;
    let value = match s.values.get(&req.key) {
        Some(v) => v.clone(),
        None => {
            debug!(key = %req.key, default = %req.default, "seeded");
            s.set(req.key, req.default.clone());
            req.default
        }
    };
    Ok(Json(Value { value }))
}

async fn all(State(s): State<SharedState>) -> Json<HashMap<String, String>> {
    Json(s.read().await.values.clone())
}

/// Waits for the next change, up to three seconds.
async fn poll(State(s): State<SharedState>) -> Result<Json<Change>> {
    let mut rx = {
        let s = s.read().await;
        s.changes.subscribe()
    };
    match tokio::time::timeout(POLL_TIMEOUT, rx.recv()).await {
        Ok(Ok(change)) => Ok(Json(change)),
        Ok(Err(e)) => {
            warn!(error = %e, "change stream broken");
            Err(error::Error::Timeout)
        }
        Err(_) => Err(error::Error::Timeout),
    }
}
