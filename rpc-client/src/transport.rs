use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rpc_core::frame::{self, RequestFrame, ResponseFrame};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RpcError;
use crate::BoxFuture;

/// Anything a connection can be built on.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A dialed byte stream plus the bookkeeping the pools need.
pub struct Connection {
    stream: Box<dyn Stream>,
    remote_addr: String,
    pub(crate) idle_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(stream: impl Stream + 'static, remote_addr: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            remote_addr: remote_addr.into(),
            idle_deadline: None,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("idle_deadline", &self.idle_deadline)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Connection {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().stream).poll_shutdown(cx)
    }
}

pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, addr: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<Connection>>;
}

#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, addr: &'a str, timeout: Duration) -> BoxFuture<'a, io::Result<Connection>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial tcp {addr}: i/o timeout")))??;
            stream.set_nodelay(true)?;
            debug!(addr = %addr, "dialed new connection");
            Ok(Connection::new(stream, addr))
        })
    }
}

/// What the innermost stage sends on a connection.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub method: String,
    pub log_id: String,
    pub payload: Bytes,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Request/response encoding on top of a pooled connection.
pub trait Codec: Send + Sync {
    fn call<'a>(&'a self, conn: &'a mut (dyn Stream + 'a), remote: &'a str, ex: Exchange) -> BoxFuture<'a, Result<Bytes, RpcError>>;
}

/// Length-prefixed frames from `rpc_core::frame`. I/O deadlines surface
/// as `TimedOut` errors worded the way the error classifier expects.
#[derive(Debug, Clone, Default)]
pub struct FramedCodec;

impl Codec for FramedCodec {
    fn call<'a>(&'a self, conn: &'a mut (dyn Stream + 'a), remote: &'a str, ex: Exchange) -> BoxFuture<'a, Result<Bytes, RpcError>> {
        Box::pin(async move {
            let req = RequestFrame {
                method: ex.method,
                log_id: ex.log_id,
                payload: ex.payload,
            };
            let write = frame::write_request(conn, &req);
            let written = match ex.write_timeout {
                Some(t) => tokio::time::timeout(t, write).await
                    .map_err(|_| timed_out("write", remote))?,
                None => write.await,
            };
            written.map_err(io::Error::from)?;

            let read = frame::read_response(conn);
            let resp = match ex.read_timeout {
                Some(t) => tokio::time::timeout(t, read).await
                    .map_err(|_| timed_out("read", remote))?,
                None => read.await,
            };
            let resp = resp.map_err(io::Error::from)?;

            match resp {
                ResponseFrame::Ok(body) => Ok(body),
                ResponseFrame::Err(msg) => Err(RpcError::Remote(msg)),
            }
        })
    }
}

fn timed_out(op: &str, remote: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} tcp {remote}: i/o timeout"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_debug_hides_stream() {
        let (a, _b) = tokio::io::duplex(8);
        let out = format!("{:?}", Connection::new(a, "10.0.0.1:80"));
        assert!(out.starts_with("Connection {"), "{out}");
        assert!(out.contains("10.0.0.1:80"), "{out}");
    }

    #[tokio::test]
    async fn test_framed_codec_ok_and_remote_err() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let req = frame::read_request(&mut server).await.unwrap();
            assert_eq!(req.method, "echo");
            frame::write_response(&mut server, &ResponseFrame::Ok(req.payload)).await.unwrap();
            let _ = frame::read_request(&mut server).await.unwrap();
            frame::write_response(&mut server, &ResponseFrame::Err("bad input".into())).await.unwrap();
        });

        let ex = Exchange {
            method: "echo".into(),
            log_id: "id".into(),
            payload: Bytes::from_static(b"hi"),
            read_timeout: Some(Duration::from_secs(1)),
            write_timeout: Some(Duration::from_secs(1)),
        };
        let codec = FramedCodec;
        let body = codec.call(&mut client, "duplex", ex.clone()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hi"));

        let err = codec.call(&mut client, "duplex", ex).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote(ref m) if m == "bad input"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_framed_codec_read_timeout() {
        let (mut client, _server) = tokio::io::duplex(1024);
        let ex = Exchange {
            method: "sleep".into(),
            log_id: "id".into(),
            payload: Bytes::new(),
            read_timeout: Some(Duration::from_millis(20)),
            write_timeout: None,
        };
        let err = FramedCodec.call(&mut client, "10.0.0.1:80", ex).await.unwrap_err();
        match err {
            RpcError::Transport(e) => {
                assert_eq!(e.kind(), io::ErrorKind::TimedOut);
                assert_eq!(e.to_string(), "read tcp 10.0.0.1:80: i/o timeout");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let res = TcpDialer.dial(&addr, Duration::from_millis(200)).await;
        assert!(res.is_err());
    }
}
