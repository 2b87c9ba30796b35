use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::instance::Instance;
use crate::keyed::KeyedCache;
use crate::transport::{Connection, Dialer};
use crate::BoxFuture;

use super::ConnPool;

/// Bounded FIFO of idle connections.
struct ConnRing {
    conns: VecDeque<Connection>,
    cap: usize,
}

impl ConnRing {
    fn new(cap: usize) -> Self {
        Self { conns: VecDeque::with_capacity(cap), cap }
    }

    /// Hands the connection back when the ring is full.
    fn push(&mut self, conn: Connection) -> Result<(), Connection> {
        if self.conns.len() >= self.cap {
            return Err(conn);
        }
        self.conns.push_back(conn);
        Ok(())
    }

    fn pop(&mut self) -> Option<Connection> {
        self.conns.pop_front()
    }
}

/// Per-endpoint idle connections.
pub struct Peer {
    addr: String,
    ring: Mutex<ConnRing>,
}

impl Peer {
    fn new(addr: &str, max_idle: usize) -> Self {
        Self {
            addr: addr.to_string(),
            ring: Mutex::new(ConnRing::new(max_idle)),
        }
    }

    /// Pop the first live idle connection, closing expired ones on the way.
    fn take_idle(&self, now: Instant) -> Option<Connection> {
        loop {
            let conn = self.ring.lock().pop()?;
            match conn.idle_deadline {
                Some(deadline) if deadline > now => return Some(conn),
                _ => debug!(addr = %self.addr, "closing expired idle connection"),
            }
        }
    }

    fn idle(&self) -> usize {
        self.ring.lock().conns.len()
    }
}

/// Keeps up to `max_idle` connections per endpoint for reuse within
/// `idle_timeout`.
pub struct PersistentPool {
    dialer: Arc<dyn Dialer>,
    peers: KeyedCache<Arc<Peer>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl PersistentPool {
    pub fn new(dialer: Arc<dyn Dialer>, max_idle: usize, idle_timeout: Duration, capacity: usize) -> Self {
        Self {
            dialer,
            peers: KeyedCache::new(capacity),
            max_idle,
            idle_timeout,
        }
    }

    fn peer(&self, addr: &str) -> Arc<Peer> {
        self.peers.get_or_insert_with(addr, || Arc::new(Peer::new(addr, self.max_idle)))
    }
}

impl ConnPool for PersistentPool {
    fn get<'a>(&'a self, ins: &'a Instance, timeout: Duration) -> BoxFuture<'a, io::Result<Connection>> {
        Box::pin(async move {
            let addr = ins.addr();
            if let Some(conn) = self.peer(&addr).take_idle(Instant::now()) {
                return Ok(conn);
            }
            self.dialer.dial(&addr, timeout).await
        })
    }

    fn put(&self, mut conn: Connection, failed: bool) {
        if failed {
            debug!(addr = %conn.remote_addr(), "discarding failed connection");
            return;
        }
        conn.idle_deadline = Some(Instant::now() + self.idle_timeout);
        let peer = self.peer(conn.remote_addr());
        if let Err(conn) = peer.ring.lock().push(conn) {
            debug!(addr = %conn.remote_addr(), "idle ring full, closing connection");
        }
    }

    fn idle(&self) -> Vec<(String, usize)> {
        let mut all: Vec<_> = self.peers.snapshot()
            .into_iter()
            .map(|(addr, peer)| (addr, peer.idle()))
            .collect();
        all.sort();
        all
    }
}
