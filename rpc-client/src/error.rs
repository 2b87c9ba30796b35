use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("not allowed by service breaker: {0}")]
    ServiceBreaker(String),

    #[error("not allowed by instance breaker: {0}")]
    InstanceBreaker(String),

    #[error("rpc timeout after {timeout:?}, remote={remote}")]
    RpcTimeout { timeout: Duration, remote: String },

    #[error("forbidden by degradation: {0}%")]
    Degradation(u32),

    #[error("no available instance for balancer")]
    NoAvailableInstance,

    #[error("connect retry exhausted: {}", join_errors(.0))]
    ConnectRetry(Vec<RpcError>),

    #[error("get connection to {addr} failed: {source}")]
    GetConnection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service discovery failed: {0}")]
    ServiceDiscovery(String),

    #[error("IDC selection failed: {0}")]
    IdcSelection(String),

    #[error("not allowed by ACL: {0}")]
    Acl(String),

    #[error("read timeout: {0}")]
    ReadTimeout(std::io::Error),

    #[error("write timeout: {0}")]
    WriteTimeout(std::io::Error),

    #[error("connection reset by peer: {0}")]
    ConnectionReset(std::io::Error),

    #[error("no expected field in call context: {0}")]
    NoExpectedContextField(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid client configuration: {0}")]
    Config(String),
}

/// Failure to load a client configuration file.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_errors(errs: &[RpcError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stable classification of an [`RpcError`], carrying the numeric code
/// reported in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ServiceBreaker,
    InstanceBreaker,
    RpcTimeout,
    Degradation,
    NoAvailableInstance,
    ConnectRetry,
    NoExpectedContextField,
    GetConnection,
    ServiceDiscovery,
    IdcSelection,
    Acl,
    ReadTimeout,
    WriteTimeout,
    ConnectionReset,
    Remote,
    Transport,
    Internal,
    Config,
}

/// What the service breaker should record for a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    Succeed,
    Fail,
    Ignore,
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ServiceBreaker => 101,
            ErrorKind::InstanceBreaker => 102,
            ErrorKind::RpcTimeout => 103,
            ErrorKind::Degradation => 104,
            ErrorKind::NoAvailableInstance => 106,
            ErrorKind::ConnectRetry => 108,
            ErrorKind::NoExpectedContextField => 111,
            ErrorKind::GetConnection => 112,
            ErrorKind::ServiceDiscovery => 113,
            ErrorKind::IdcSelection => 114,
            ErrorKind::Acl => 115,
            ErrorKind::ReadTimeout => 116,
            ErrorKind::WriteTimeout => 117,
            ErrorKind::ConnectionReset => 118,
            ErrorKind::Transport => 119,
            ErrorKind::Internal => 120,
            ErrorKind::Config => 121,
            ErrorKind::Remote => -1,
        }
    }

    /// Policy errors neither trip nor reset the breaker, connectivity
    /// errors count as failures, anything else reached the downstream.
    pub fn breaker_outcome(self) -> BreakerOutcome {
        match self {
            ErrorKind::ServiceBreaker
            | ErrorKind::Acl
            | ErrorKind::Degradation
            | ErrorKind::RpcTimeout
            | ErrorKind::NoAvailableInstance
            | ErrorKind::NoExpectedContextField
            | ErrorKind::ServiceDiscovery
            | ErrorKind::IdcSelection
            | ErrorKind::Internal
            | ErrorKind::Config => BreakerOutcome::Ignore,
            ErrorKind::InstanceBreaker
            | ErrorKind::ConnectRetry
            | ErrorKind::GetConnection
            | ErrorKind::ReadTimeout
            | ErrorKind::WriteTimeout
            | ErrorKind::ConnectionReset => BreakerOutcome::Fail,
            ErrorKind::Transport | ErrorKind::Remote => BreakerOutcome::Succeed,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::ServiceBreaker
                | ErrorKind::InstanceBreaker
                | ErrorKind::Degradation
                | ErrorKind::Acl
                | ErrorKind::NoExpectedContextField
                | ErrorKind::Internal
                | ErrorKind::Config
                | ErrorKind::Remote
        )
    }

    /// Errors that count as a network failure for the stability counter.
    pub fn is_network(self) -> bool {
        matches!(
            self,
            ErrorKind::RpcTimeout
                | ErrorKind::ConnectRetry
                | ErrorKind::GetConnection
                | ErrorKind::ReadTimeout
                | ErrorKind::WriteTimeout
                | ErrorKind::ConnectionReset
                | ErrorKind::Transport
                | ErrorKind::InstanceBreaker
                | ErrorKind::ServiceBreaker
        )
    }
}

impl RpcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::ServiceBreaker(_) => ErrorKind::ServiceBreaker,
            RpcError::InstanceBreaker(_) => ErrorKind::InstanceBreaker,
            RpcError::RpcTimeout { .. } => ErrorKind::RpcTimeout,
            RpcError::Degradation(_) => ErrorKind::Degradation,
            RpcError::NoAvailableInstance => ErrorKind::NoAvailableInstance,
            RpcError::ConnectRetry(_) => ErrorKind::ConnectRetry,
            RpcError::GetConnection { .. } => ErrorKind::GetConnection,
            RpcError::ServiceDiscovery(_) => ErrorKind::ServiceDiscovery,
            RpcError::IdcSelection(_) => ErrorKind::IdcSelection,
            RpcError::Acl(_) => ErrorKind::Acl,
            RpcError::ReadTimeout(_) => ErrorKind::ReadTimeout,
            RpcError::WriteTimeout(_) => ErrorKind::WriteTimeout,
            RpcError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            RpcError::NoExpectedContextField(_) => ErrorKind::NoExpectedContextField,
            RpcError::Transport(_) => ErrorKind::Transport,
            RpcError::Remote(_) => ErrorKind::Remote,
            RpcError::Internal(_) => ErrorKind::Internal,
            RpcError::Config(_) => ErrorKind::Config,
        }
    }

    #[inline]
    pub fn code(&self) -> i32 {
        self.kind().code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
