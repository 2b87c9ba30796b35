use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::instance::Instance;
use crate::transport::{Connection, Dialer};
use crate::BoxFuture;

use super::ConnPool;

/// Dial per call, close after use.
pub struct EphemeralPool {
    dialer: Arc<dyn Dialer>,
}

impl EphemeralPool {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self { dialer }
    }
}

impl ConnPool for EphemeralPool {
    fn get<'a>(&'a self, ins: &'a Instance, timeout: Duration) -> BoxFuture<'a, io::Result<Connection>> {
        Box::pin(async move {
            let addr = ins.addr();
            self.dialer.dial(&addr, timeout).await
        })
    }

    fn put(&self, conn: Connection, failed: bool) {
        trace!(addr = %conn.remote_addr(), failed, "closing connection");
        drop(conn);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::pool::testing::DuplexDialer;

    #[tokio::test]
    async fn test_dials_every_time() {
        let dialer = Arc::new(DuplexDialer::default());
        let pool = EphemeralPool::new(dialer.clone());
        let ins = Instance::new("10.0.0.1", 80, HashMap::new());

        let c = pool.get(&ins, Duration::from_millis(30)).await.unwrap();
        assert_eq!(c.remote_addr(), "10.0.0.1:80");
        pool.put(c, false);
        let c = pool.get(&ins, Duration::from_millis(30)).await.unwrap();
        pool.put(c, false);

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(pool.idle().is_empty());
    }
}
