use std::net::SocketAddr;
use std::time::Duration;

use rpc_core::frame::{self, FrameError, RequestFrame, ResponseFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Shutdown { tx }, rx)
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Answers one request frame. `sleep` waits for the number of milliseconds
/// in the payload, `fail` reports an application error, everything else
/// echoes the payload back.
pub async fn handle(req: RequestFrame) -> ResponseFrame {
    match req.method.to_ascii_lowercase().as_str() {
        "sleep" => {
            let ms = std::str::from_utf8(&req.payload).ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ResponseFrame::Ok(req.payload)
        }
        "fail" => ResponseFrame::Err(format!("{} failed on request", req.method)),
        _ => ResponseFrame::Ok(req.payload),
    }
}

async fn serve_conn(mut stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    loop {
        let req = tokio::select! {
            res = frame::read_request(&mut stream) => res,
            _ = shutdown.changed() => {
                debug!(%peer, "closing idle connection");
                return;
            }
        };
        let req = match req {
            Ok(req) => req,
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                warn!(%peer, error = %e, "bad request frame");
                return;
            }
        };
        debug!(%peer, method = %req.method, log_id = %req.log_id, "request");
        let resp = handle(req).await;
        if let Err(e) = frame::write_response(&mut stream, &resp).await {
            debug!(%peer, error = %e, "write failed");
            return;
        }
    }
}

/// Accepts connections until `shutdown` fires, then gives open connections
/// ten seconds to finish their current request.
pub async fn run(listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let mut tasks = JoinSet::<()>::new();
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = res?;
                tasks.spawn(serve_conn(stream, peer, shutdown.clone()));
            }
            _ = shutdown.changed() => {
                debug!("shutdown requested");
                break;
            }
        }
    }
    drop(listener);

    let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                debug!("Task failed: {}", err);
            }
        }
    }).await.is_ok();

    if drained {
        info!("graceful shutdown complete");
    } else {
        warn!("drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    Ok(())
}
