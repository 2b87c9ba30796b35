use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConfigError, ConfigStore};

#[derive(Debug, Serialize)]
struct GetOrSet<'a> {
    key: &'a str,
    default: &'a str,
}

#[derive(Debug, Deserialize)]
struct Value {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Change {
    key: String,
    value: String,
}

type Values = Arc<RwLock<HashMap<String, String>>>;

/// Config store backed by the config plane.
///
/// Reads are served from a local copy that a background task refreshes
/// every `poll_interval`, while a second task long-polls the plane so
/// changes land in between. Keys missing locally are seeded with their
/// default right away and pushed to the plane in the background.
pub struct RemoteStore {
    values: Values,
    seed_tx: mpsc::UnboundedSender<(String, String)>,
}

impl RemoteStore {
    /// Must be called from within a tokio runtime.
    pub fn connect(base_url: &str, poll_interval: Duration) -> Self {
        let values: Values = Arc::default();
        let (seed_tx, seed_rx) = mpsc::unbounded_channel();
        let syncer = Syncer {
            base: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            values: values.clone(),
        };
        tokio::spawn(watch(
            syncer.base.clone(),
            syncer.http.clone(),
            Arc::downgrade(&values),
            poll_interval,
        ));
        tokio::spawn(syncer.run(seed_rx, poll_interval));
        Self { values, seed_tx }
    }
}

impl ConfigStore for RemoteStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn get_or_set(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        if let Some(v) = self.values.read().get(key) {
            return Ok(v.clone());
        }
        self.seed_tx.send((key.to_string(), default.to_string()))
            .map_err(|_| ConfigError::Unavailable("config sync task stopped".into()))?;
        Ok(self.values.write()
            .entry(key.to_string())
            .or_insert_with(|| default.to_string())
            .clone())
    }
}

struct Syncer {
    base: String,
    http: reqwest::Client,
    values: Values,
}

impl Syncer {
    /// Runs until the owning store is dropped.
    async fn run(self, mut seed_rx: mpsc::UnboundedReceiver<(String, String)>, poll_interval: Duration) {
        let mut tick = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                seed = seed_rx.recv() => {
                    let Some((key, default)) = seed else { break };
                    match self.seed(&key, &default).await {
                        Ok(value) => {
                            self.values.write().insert(key, value);
                        }
                        Err(e) => warn!(key = %key, error = %e, "failed to seed config key"),
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "failed to refresh config");
                    }
                }
            }
        }
        debug!("config sync stopped");
    }

    async fn seed(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        let resp: Value = self.http
            .post(format!("{}/kv/get_or_set", self.base))
            .json(&GetOrSet { key, default })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.value)
    }

    async fn refresh(&self) -> Result<(), ConfigError> {
        let all: HashMap<String, String> = self.http
            .get(format!("{}/kv/all", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut values = self.values.write();
        for (k, v) in all {
            values.insert(k, v);
        }
        Ok(())
    }
}

async fn next_change(http: &reqwest::Client, base: &str) -> Result<Option<Change>, ConfigError> {
    let resp = http.get(format!("{base}/poll")).send().await?;
    if resp.status() == reqwest::StatusCode::GATEWAY_TIMEOUT {
        return Ok(None);
    }
    Ok(Some(resp.error_for_status()?.json().await?))
}

/// Applies changes pushed through `/poll` until the store is dropped.
/// Failures back off for `retry_after` and leave catching up to the
/// periodic refresh.
async fn watch(base: String, http: reqwest::Client, values: Weak<RwLock<HashMap<String, String>>>, retry_after: Duration) {
    while values.strong_count() > 0 {
        match next_change(&http, &base).await {
            Ok(Some(change)) => {
                let Some(values) = values.upgrade() else { break };
                debug!(key = %change.key, value = %change.value, "config changed");
                values.write().insert(change.key, change.value);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "config long-poll failed");
                tokio::time::sleep(retry_after).await;
            }
        }
    }
    debug!("config watch stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::{http::StatusCode, routing::get, Json, Router};

    use super::*;

    /// Plane that reports one change on the first poll, then times out.
    async fn plane() -> String {
        let sent = Arc::new(AtomicBool::new(false));
        let app = Router::new()
            .route("/kv/all", get(|| async { Json(HashMap::<String, String>::new()) }))
            .route("/poll", get(move || {
                let sent = sent.clone();
                async move {
                    if sent.swap(true, Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        return Err(StatusCode::GATEWAY_TIMEOUT);
                    }
                    Ok(Json(serde_json::json!({ "key": "/rpc/acl/a/b/M", "value": "1" })))
                }
            }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_long_poll_applies_change() {
        let store = RemoteStore::connect(&plane().await, Duration::from_secs(60));
        let mut seen = None;
        for _ in 0..100 {
            seen = store.get("/rpc/acl/a/b/M").unwrap();
            if seen.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_seeds_locally_when_plane_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = RemoteStore::connect(&format!("http://{addr}"), Duration::from_secs(60));
        assert_eq!(store.get("/rpc/acl/a/b/M").unwrap(), None);
        assert_eq!(store.get_or_set("/rpc/acl/a/b/M", "0").unwrap(), "0");
        assert_eq!(store.get("/rpc/acl/a/b/M").unwrap().as_deref(), Some("0"));
    }
}
