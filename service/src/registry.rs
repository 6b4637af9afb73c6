//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Connection registry implementation
//!
//! The ConnectionRegistry is responsible for:
//! - Tracking the live set of connections and their outbound sinks
//! - Broadcasting lines to every live connection
//! - Evicting connections whose writes fail or time out
//! - Asking sessions to close at shutdown
//!
//! The registry never owns a connection's socket. It keeps a [`Weak`]
//! reference to each outbound sink; the session task holds the only strong
//! one, so a finished session releases its socket even while its entry is
//! still being removed.

use crate::connection::into_io_error;
use crate::{
    ConnectionId, ConnectionInfo, ConnectionState, ControlMessage, LineSink, RelayError,
    RelayMetrics, Result,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::SinkExt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

/// Result of a broadcast operation
#[derive(Debug, Clone)]
pub struct BroadcastResult {
    /// Number of connections in the snapshot
    pub total: usize,
    /// Number of successful writes
    pub succeeded: usize,
    /// Number of failed writes (each target was evicted)
    pub failed: usize,
    /// Errors that occurred (ConnectionId and error message)
    pub errors: Vec<(ConnectionId, String)>,
}

impl BroadcastResult {
    fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            errors: Vec::new(),
        }
    }

    /// Check if every write succeeded
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// Get the success rate as a percentage
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

/// What a session hands the registry when it joins the live set
pub struct Registration {
    sink: Weak<Mutex<LineSink>>,
    control_tx: mpsc::Sender<ControlMessage>,
    state: Arc<AtomicU8>,
    peer_addr: Option<SocketAddr>,
}

impl Registration {
    /// Describe a connection by its outbound sink, control channel and state
    ///
    /// Only a weak reference to `sink` is kept.
    pub fn new(
        sink: &Arc<Mutex<LineSink>>,
        control_tx: mpsc::Sender<ControlMessage>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            sink: Arc::downgrade(sink),
            control_tx,
            state,
            peer_addr: None,
        }
    }

    /// Attach the remote address
    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }
}

/// Registered connection entry
struct RegisteredConnection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    sink: Weak<Mutex<LineSink>>,
    control_tx: mpsc::Sender<ControlMessage>,
    state: Arc<AtomicU8>,
    lines_delivered: Arc<AtomicU64>,
    registered_at: Instant,
}

impl RegisteredConnection {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            state: self.state(),
            peer_addr: self.peer_addr,
            registered_at: self.registered_at,
            lines_delivered: self.lines_delivered.load(Ordering::Relaxed),
        }
    }

    fn target(&self) -> Target {
        Target {
            id: self.id,
            sink: self.sink.clone(),
            control_tx: self.control_tx.clone(),
            lines_delivered: self.lines_delivered.clone(),
        }
    }
}

/// Broadcast target cloned out of the map so no shard lock is held across I/O
struct Target {
    id: ConnectionId,
    sink: Weak<Mutex<LineSink>>,
    control_tx: mpsc::Sender<ControlMessage>,
    lines_delivered: Arc<AtomicU64>,
}

impl Target {
    async fn deliver(&self, line: Arc<str>) -> io::Result<()> {
        let Some(sink) = self.sink.upgrade() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection sink already released",
            ));
        };
        // Locking is inside the caller's timeout; a peer stuck behind another
        // broadcast's write counts as a slow consumer too.
        let mut sink = sink.lock().await;
        sink.send(line).await.map_err(into_io_error)?;
        self.lines_delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Connection registry
pub struct ConnectionRegistry {
    /// Live set (sharded concurrent map)
    connections: DashMap<ConnectionId, RegisteredConnection>,
    /// Next connection ID (monotonically increasing)
    next_id: AtomicU64,
    /// Relay metrics
    metrics: Arc<RelayMetrics>,
    /// Upper bound on a single broadcast write
    write_timeout: Duration,
}

impl ConnectionRegistry {
    /// Create a new registry
    pub fn new(metrics: Arc<RelayMetrics>, write_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
            write_timeout,
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the metrics this registry records into
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Get the broadcast write timeout
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Add a connection to the live set
    ///
    /// The connection is visible to every broadcast that snapshots the live
    /// set after this returns.
    pub fn register(&self, registration: Registration) -> Result<ConnectionId> {
        let id = self.next_connection_id();
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                error!(connection_id = %id, "Connection id already registered");
                Err(RelayError::RegistryFault(format!(
                    "connection id {} already registered",
                    id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(RegisteredConnection {
                    id,
                    peer_addr: registration.peer_addr,
                    sink: registration.sink,
                    control_tx: registration.control_tx,
                    state: registration.state,
                    lines_delivered: Arc::new(AtomicU64::new(0)),
                    registered_at: Instant::now(),
                });
                self.metrics.connection_opened();
                debug!(connection_id = %id, "Connection registered");
                Ok(id)
            }
        }
    }

    /// Remove a connection from the live set
    ///
    /// Idempotent: returns `false` when the connection was already removed.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, entry)) => {
                self.metrics
                    .connection_closed(entry.registered_at.elapsed());
                debug!(connection_id = %id, "Connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Check if a connection is in the live set
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Get connection info
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|entry| entry.info())
    }

    /// Get all connection IDs
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Get all connection infos
    pub fn all_connection_infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Get the number of connections in the live set
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot the live set
    ///
    /// Shard locks are held only while the targets are cloned out.
    fn snapshot(&self) -> Vec<Target> {
        self.connections
            .iter()
            .filter(|entry| entry.state().is_live())
            .map(|entry| entry.target())
            .collect()
    }

    /// Write `line` to every connection in the live set
    ///
    /// Every target in the snapshot gets exactly one write attempt, and all
    /// writes run concurrently, each bounded by the write timeout. A target
    /// whose write fails is unregistered and its session told to terminate;
    /// the remaining targets are unaffected.
    pub async fn broadcast(&self, line: &str) -> BroadcastResult {
        let started = Instant::now();
        let targets = self.snapshot();
        let line: Arc<str> = Arc::from(line);

        let mut result = BroadcastResult::new();
        result.total = targets.len();

        let write_timeout = self.write_timeout;
        let writes = targets.iter().map(|target| {
            let line = line.clone();
            async move {
                let outcome = match timeout(write_timeout, target.deliver(line)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write did not complete within {:?}", write_timeout),
                    )),
                };
                (target, outcome)
            }
        });

        for (target, outcome) in futures_util::future::join_all(writes).await {
            match outcome {
                Ok(()) => result.succeeded += 1,
                Err(source) => {
                    result.failed += 1;
                    result.errors.push((target.id, source.to_string()));
                    self.evict(target, source);
                }
            }
        }

        self.metrics
            .broadcast_completed(result.succeeded as u64, started.elapsed());
        trace!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            "Broadcast complete"
        );
        result
    }

    /// Remove a target after a failed write and tell its session why
    fn evict(&self, target: &Target, source: io::Error) {
        if self.unregister(target.id) {
            self.metrics.write_fault();
            warn!(
                connection_id = %target.id,
                error = %source,
                "Evicting connection after write fault"
            );
        }
        // The session may already be gone; the fault has nowhere to go then.
        let _ = target.control_tx.try_send(ControlMessage::Evict(source));
    }

    /// Ask one session to close
    ///
    /// Returns `false` if the connection is not registered.
    pub fn close(&self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(entry) => {
                let _ = entry.control_tx.try_send(ControlMessage::Close);
                true
            }
            None => false,
        }
    }

    /// Ask every registered session to close
    ///
    /// Returns the number of sessions signalled.
    pub fn close_all(&self) -> usize {
        let senders: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.control_tx.clone())
            .collect();
        for tx in &senders {
            let _ = tx.try_send(ControlMessage::Close);
        }
        senders.len()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connection_count())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}
