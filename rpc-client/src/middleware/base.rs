use bytes::Bytes;

use crate::context::{RemoteAddr, RpcRequest};
use crate::error::RpcError;
use crate::logid::new_log_id;

use super::{Interceptor, Next};

/// Fills caller-side identity into the call context: log id, env, local
/// address and IDC.
pub struct BaseInfo {
    env: String,
    local_addr: String,
    local_idc: String,
}

impl BaseInfo {
    pub fn new(env: &str, local_addr: &str, local_idc: &str) -> Self {
        Self {
            env: env.to_string(),
            local_addr: local_addr.to_string(),
            local_idc: local_idc.to_string(),
        }
    }
}

impl Interceptor for BaseInfo {
    async fn intercept(&self, mut req: RpcRequest, next: Next) -> Result<Bytes, RpcError> {
        let ctx = &mut req.ctx;
        if ctx.log_id.is_empty() {
            ctx.log_id = new_log_id();
        }
        if ctx.env.is_empty() {
            ctx.env = self.env.clone();
        }
        ctx.local_addr = self.local_addr.clone();
        ctx.local_idc = self.local_idc.clone();
        ctx.remote = RemoteAddr::default();
        next.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logid::is_log_id;
    use crate::middleware::testing::*;

    #[tokio::test]
    async fn test_fills_missing_fields() {
        let end = Scripted::ok();
        let base = BaseInfo::new("prod", "10.1.1.1", "lf");
        base.intercept(request(), next(end.clone())).await.unwrap();
        let ctx = end.last();
        assert!(is_log_id(&ctx.log_id));
        assert_eq!(ctx.env, "prod");
        assert_eq!(ctx.local_addr, "10.1.1.1");
        assert_eq!(ctx.local_idc, "lf");
    }

    #[tokio::test]
    async fn test_keeps_caller_values() {
        let end = Scripted::ok();
        let mut req = request();
        req.ctx.log_id = "given".into();
        req.ctx.env = "canary".into();
        BaseInfo::new("prod", "", "lf").intercept(req, next(end.clone())).await.unwrap();
        assert_eq!(end.last().log_id, "given");
        assert_eq!(end.last().env, "canary");
    }
}
