use std::io;

use bytes::Bytes;

use crate::context::RpcRequest;
use crate::error::RpcError;

use super::{Interceptor, Next};

/// Turns raw transport errors into read/write timeouts and resets.
pub struct IoErrorClassifier;

pub fn classify(e: io::Error) -> RpcError {
    let msg = e.to_string();
    if e.kind() == io::ErrorKind::TimedOut && msg.ends_with("i/o timeout") {
        if msg.starts_with("read") {
            return RpcError::ReadTimeout(e);
        }
        if msg.starts_with("write") {
            return RpcError::WriteTimeout(e);
        }
    }
    if e.kind() == io::ErrorKind::ConnectionReset || msg.contains("connection reset by peer") {
        return RpcError::ConnectionReset(e);
    }
    RpcError::Transport(e)
}

impl Interceptor for IoErrorClassifier {
    async fn intercept(&self, req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        match next.run(req).await {
            Err(RpcError::Transport(e)) => Err(classify(e)),
            other => other,
        }
    }
}
