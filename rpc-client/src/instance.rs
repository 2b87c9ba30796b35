use std::collections::HashMap;
use std::fmt;

use crate::error::RpcError;

pub const DEFAULT_CLUSTER: &str = "default";
pub const ENV_PROD: &str = "prod";
pub const ENV_CANARY: &str = "canary";
pub const DEFAULT_WEIGHT: u32 = 100;

/// One downstream endpoint as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    host: String,
    port: u16,
    tags: HashMap<String, String>,
}

impl Instance {
    pub fn new(host: impl Into<String>, port: u16, tags: HashMap<String, String>) -> Self {
        Self { host: host.into(), port, tags }
    }

    /// Parse a `host:port` address.
    pub fn parse(addr: &str, tags: HashMap<String, String>) -> Result<Self, RpcError> {
        let (host, port) = addr.rsplit_once(':')
            .ok_or_else(|| RpcError::Config(format!("missing port in instance address {addr:?}")))?;
        let port = port.parse::<u16>()
            .map_err(|_| RpcError::Config(format!("invalid port in instance address {addr:?}")))?;
        if host.is_empty() {
            return Err(RpcError::Config(format!("missing host in instance address {addr:?}")));
        }
        Ok(Self::new(host, port, tags))
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn host(&self) -> &str { &self.host }
    pub fn port(&self) -> u16 { self.port }
    pub fn tags(&self) -> &HashMap<String, String> { &self.tags }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cluster(&self) -> &str {
        self.tag("cluster").unwrap_or(DEFAULT_CLUSTER)
    }

    pub fn env(&self) -> &str {
        self.tag("env").unwrap_or(ENV_PROD)
    }

    pub fn idc(&self) -> Option<&str> {
        self.tag("idc")
    }

    /// Absent or unparsable weights count as [`DEFAULT_WEIGHT`].
    pub fn weight(&self) -> u32 {
        self.tags.get("weight")
            .and_then(|w| w.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_WEIGHT)
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
