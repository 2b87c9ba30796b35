use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::instance::Instance;
use crate::transport::Connection;
use crate::BoxFuture;

pub mod ephemeral;
pub mod persistent;

pub use ephemeral::EphemeralPool;
pub use persistent::PersistentPool;

/// Source of connections to downstream instances.
pub trait ConnPool: Send + Sync {
    fn get<'a>(&'a self, ins: &'a Instance, timeout: Duration) -> BoxFuture<'a, io::Result<Connection>>;

    /// Give a connection back. A failed connection is never reused.
    fn put(&self, conn: Connection, failed: bool);

    /// Idle connection count per endpoint.
    fn idle(&self) -> Vec<(String, usize)> {
        Vec::new()
    }
}

/// A connection checked out of a pool for one exchange.
///
/// The first I/O error seen on it is remembered. Call [`PoolConn::release`]
/// when the exchange completes; dropping it without releasing means the
/// exchange was abandoned midway and the connection is closed.
pub struct PoolConn {
    conn: Option<Connection>,
    pool: Arc<dyn ConnPool>,
    error: Option<io::ErrorKind>,
}

impl PoolConn {
    pub fn new(conn: Connection, pool: Arc<dyn ConnPool>) -> Self {
        Self { conn: Some(conn), pool, error: None }
    }

    pub fn remote_addr(&self) -> &str {
        self.conn.as_ref().map_or("", |c| c.remote_addr())
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn release(mut self, failed: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, failed || self.error.is_some());
        }
    }

    fn conn(&mut self) -> io::Result<&mut Connection> {
        self.conn.as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection already released"))
    }

    fn track<T>(&mut self, res: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &res && self.error.is_none() {
            self.error = Some(e.kind());
        }
        res
    }
}

impl Drop for PoolConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, true);
        }
    }
}

impl AsyncRead for PoolConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(res)
    }
}

impl AsyncWrite for PoolConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(res)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(res)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let res = match this.conn() {
            Ok(conn) => Pin::new(conn).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        };
        this.track(res)
    }
}
