//! Resilient RPC client runtime.
//!
//! Every call runs through a fixed interceptor chain: logging, metrics,
//! dynamic config, the service breaker and its deadline, ACL, degradation,
//! IDC selection, discovery, the connect-retry loop over a weighted
//! balancer, the instance breaker, connection pooling and I/O error
//! classification. Whole calls are retried under a per-key budget.

use std::pin::Pin;

pub mod balance;
pub mod breaker;
pub mod client;
pub mod context;
pub mod discovery;
pub mod dynconfig;
pub mod error;
pub mod instance;
pub mod keyed;
pub mod logid;
pub mod metrics;
pub mod middleware;
pub mod options;
pub mod pool;
pub mod report;
pub mod retry;
pub mod transport;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type Result<T> = std::result::Result<T, error::RpcError>;

pub use client::{Client, ClientSet};
pub use context::Context;
pub use error::{ErrorKind, RpcError};
pub use options::{ClientBuilder, ClientOptions, Collaborators};
