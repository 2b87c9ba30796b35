use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use crate::PoolKind;

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig<E> {
    /// name of the calling service, required for every call
    pub service: String,
    pub cluster: String,
    /// upstream environment, "" matches prod and canary
    pub env: String,
    pub local_idc: String,

    /// base url of the dynamic config plane, in-memory store if absent
    pub config_plane: Option<String>,

    /// A map of downstream service name -> how to reach it
    pub services: HashMap<String, ServiceConfig>,

    #[serde(skip, default)]
    _marker: std::marker::PhantomData<E>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub cluster: String,
    /// pin every call to this IDC instead of traffic policy / local IDC
    pub idc: Option<String>,
    pub timeout_ms: Option<u64>,
    /// per-method timeouts in milliseconds, `.` separated with `*` wildcards
    pub method_timeout: HashMap<String, u64>,
    pub conn_max_retry_ms: Option<u64>,

    pub pool: PoolKind,
    pub max_idle: Option<usize>,
    pub max_idle_timeout_ms: Option<u64>,

    pub breaker: Option<BreakerConfig>,
    pub disable_breaker: bool,
    pub retry: Option<RetryConfig>,

    /// static instance list; registry lookups are used when empty
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    pub error_rate: f64,
    pub min_samples: u64,
    pub max_concurrency: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub limit_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InstanceConfig {
    Addr(String),
    Tagged {
        addr: String,
        #[serde(default)]
        tags: HashMap<String, String>,
    },
}

impl InstanceConfig {
    pub fn addr(&self) -> &str {
        match self {
            InstanceConfig::Addr(addr) => addr,
            InstanceConfig::Tagged { addr, .. } => addr,
        }
    }

    pub fn tags(&self) -> HashMap<String, String> {
        match self {
            InstanceConfig::Addr(_) => HashMap::new(),
            InstanceConfig::Tagged { tags, .. } => tags.clone(),
        }
    }
}

impl<E> ClientConfig<E>
where E: From<std::io::Error> + From<serde_json::Error> + From<toml::de::Error>
{
    pub fn new(service: impl Into<String>) -> Self {
        ClientConfig {
            service: service.into(),
            ..Default::default()
        }
    }

    pub async fn from_file(path: &str) -> Result<Self, E> {
        let mut file = File::open(path).await?;
        let mut content: String = String::new();
        file.read_to_string(&mut content).await?;
        ClientConfig::from_content(&content)
    }

    pub fn from_content(content: &str) -> Result<Self, E> {
        let config: ClientConfig<E> = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, E> {
        serde_json::to_string(self)
            .map_err(|e| e.into())
    }
}

impl<E> Default for ClientConfig<E> {
    fn default() -> Self {
        ClientConfig {
            service: String::new(),
            cluster: String::new(),
            env: String::new(),
            local_idc: "lf".to_string(),
            config_plane: None,
            services: HashMap::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<E> Clone for ClientConfig<E> {
    fn clone(&self) -> Self {
        ClientConfig {
            service: self.service.clone(),
            cluster: self.cluster.clone(),
            env: self.env.clone(),
            local_idc: self.local_idc.clone(),
            config_plane: self.config_plane.clone(),
            services: self.services.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}
