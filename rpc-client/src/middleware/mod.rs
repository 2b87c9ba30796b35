//! The interceptor chain wrapped around every attempt.
//!
//! Each stage is an [`Interceptor`] lifted into a tower [`Layer`] by
//! [`InterceptLayer`]; the innermost service is [`Invoke`], which runs the
//! codec over the connection the pool stage checked out.

use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};

use crate::context::RpcRequest;
use crate::error::RpcError;
use crate::BoxFuture;

pub mod acl;
pub mod base;
pub mod breaker_config;
pub mod conn_retry;
pub mod degradation;
pub mod discover;
pub mod dynamic;
pub mod idc;
pub mod instance_breaker;
pub mod invoke;
pub mod io_error;
pub mod log;
pub mod metrics;
pub mod pool;
pub mod reporter;
pub mod service_breaker;

pub use acl::Acl;
pub use base::BaseInfo;
pub use breaker_config::{BreakerDefaults, BreakerConfigLoader};
pub use conn_retry::ConnRetry;
pub use degradation::Degradation;
pub use discover::Discover;
pub use dynamic::DynamicConfig;
pub use idc::IdcSelector;
pub use instance_breaker::InstanceBreaker;
pub use invoke::Invoke;
pub use io_error::IoErrorClassifier;
pub use log::RpcLogger;
pub use metrics::MetricsEmitter;
pub use pool::Pool;
pub use reporter::{ConfigReport, ConfigReporter, Reporter, TracingReporter};
pub use service_breaker::ServiceBreaker;

pub type Chain = BoxCloneSyncService<RpcRequest, Bytes, RpcError>;

/// The rest of the chain, as seen from one stage.
#[derive(Clone)]
pub struct Next {
    inner: Chain,
}

impl Next {
    pub fn new(inner: Chain) -> Self {
        Self { inner }
    }

    pub async fn run(self, req: RpcRequest) -> Result<Bytes, RpcError> {
        self.inner.oneshot(req).await
    }
}

pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, req: RpcRequest, next: Next) -> impl Future<Output = Result<Bytes, RpcError>> + Send;
}

pub struct InterceptLayer<I> {
    interceptor: Arc<I>,
}

impl<I> InterceptLayer<I> {
    pub fn new(interceptor: I) -> Self {
        Self { interceptor: Arc::new(interceptor) }
    }
}

impl<I> Clone for InterceptLayer<I> {
    fn clone(&self) -> Self {
        Self { interceptor: self.interceptor.clone() }
    }
}

impl<I, S> Layer<S> for InterceptLayer<I> {
    type Service = Intercept<I, S>;

    fn layer(&self, inner: S) -> Self::Service {
        Intercept {
            interceptor: self.interceptor.clone(),
            inner,
        }
    }
}

pub struct Intercept<I, S> {
    interceptor: Arc<I>,
    inner: S,
}

impl<I, S: Clone> Clone for Intercept<I, S> {
    fn clone(&self) -> Self {
        Self {
            interceptor: self.interceptor.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<I, S> Service<RpcRequest> for Intercept<I, S>
where
    I: Interceptor,
    S: Service<RpcRequest, Response = Bytes, Error = RpcError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Response = Bytes;
    type Error = RpcError;
    type Future = BoxFuture<'static, Result<Bytes, RpcError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // readiness of the inner stages is awaited by `Next::run`
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RpcRequest) -> Self::Future {
        let next = Next::new(BoxCloneSyncService::new(self.inner.clone()));
        let interceptor = self.interceptor.clone();
        Box::pin(async move { interceptor.intercept(req, next).await })
    }
}
