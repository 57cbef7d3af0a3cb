use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::send_pipeline::SendPipeline;

/// Hands out stream ids for newly registered peers: monotonic starting at 1,
///  skipping ids that are still bound to a live connection.
pub struct StreamIdAllocator {
    inner: Mutex<StreamIdAllocatorInner>,
}

struct StreamIdAllocatorInner {
    next_id: u32,
    in_use: FxHashSet<u32>,
}

impl StreamIdAllocator {
    pub fn new() -> StreamIdAllocator {
        StreamIdAllocator {
            inner: Mutex::new(StreamIdAllocatorInner {
                next_id: 0,
                in_use: FxHashSet::default(),
            }),
        }
    }

    pub fn allocate(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        loop {
            inner.next_id = inner.next_id.wrapping_add(1);
            if inner.next_id != 0 && !inner.in_use.contains(&inner.next_id) {
                break;
            }
        }
        let id = inner.next_id;
        inner.in_use.insert(id);
        id
    }

    pub fn release(&self, id: u32) {
        self.inner.lock().unwrap().in_use.remove(&id);
    }
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// All live connections of an endpoint, keyed by peer address. One entry per
///  peer at a time.
pub struct ConnectionPool {
    config: Arc<Config>,
    connections: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(config: Arc<Config>) -> ConnectionPool {
        ConnectionPool {
            config,
            connections: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&addr).cloned()
    }

    /// Register a connection for a previously unknown peer.
    pub fn insert(
        &self,
        pipeline: SendPipeline,
        addr: SocketAddr,
        stream_id: u32,
    ) -> Result<Arc<Connection>, TransportError> {
        let mut connections = self.connections.lock().unwrap();
        if connections.contains_key(&addr) {
            return Err(TransportError::ClientAlreadyExists);
        }

        let conn = Arc::new(Connection::new(pipeline, addr, stream_id, self.config.clone()));
        connections.insert(addr, conn.clone());
        Ok(conn)
    }

    pub fn remove(&self, conn: &Connection) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().remove(&conn.remote_addr())
    }

    /// Drop every connection that went idle past the configured timeout or was
    ///  closed. Reaped connections get their shutdown signal cancelled so
    ///  in-flight operations on them fail fast instead of running into their
    ///  own timeouts. Returns the reaped connections so the caller can release
    ///  their stream ids.
    pub fn garbage_collect(&self) -> Vec<Arc<Connection>> {
        let now = Instant::now();

        let mut connections = self.connections.lock().unwrap();
        let expired: Vec<SocketAddr> = connections
            .iter()
            .filter(|(_, conn)| {
                conn.is_shut_down()
                    || now.duration_since(conn.last_active()) > self.config.conn_timeout
            })
            .map(|(addr, _)| *addr)
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for addr in expired {
            if let Some(conn) = connections.remove(&addr) {
                debug!("{} timed out or was closed, removing from pool", conn);
                conn.close();
                reaped.push(conn);
            }
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().unwrap().is_empty()
    }
}
