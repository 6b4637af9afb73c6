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

//! Broadcast relay implementation
//!
//! The BroadcastRelay is the main entry point. It owns the acceptor, runs
//! the accept loop, opens a session per accepted connection and coordinates
//! shutdown with the ConnectionRegistry.

use crate::{
    Acceptor, ConnectionRegistry, ConnectionSession, LineConnection, RelayConfig, RelayError,
    RelayMetrics, RelayObserver, RelaySnapshot, Result, SessionConfig, TcpAcceptor,
    is_transient_accept_error,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after a transient accept error
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Broadcast relay
///
/// Accepts connections and relays every line any client sends to all
/// connected clients, the sender included.
///
/// # Example
///
/// ```no_run
/// use linerelay_service::{BroadcastRelay, LoggingObserver, RelayConfig};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let relay = BroadcastRelay::bind(RelayConfig::with_port(6789)).await?;
///     relay.start(Arc::new(LoggingObserver)).await?;
///
///     tokio::signal::ctrl_c().await?;
///     relay.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct BroadcastRelay {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    /// Taken by the accept loop when the relay starts
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    local_addr: Option<SocketAddr>,
    started_at: Instant,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    sessions: TaskTracker,
    accept_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl BroadcastRelay {
    /// Bind a TCP listener at the configured address
    ///
    /// The relay does not accept connections until `start()` or `serve()`.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate().map_err(RelayError::InvalidConfig)?;
        let acceptor = TcpAcceptor::bind(config.bind_address, config.nodelay).await?;
        info!(
            "Broadcast relay bound to {}",
            acceptor.local_addr().unwrap_or(config.bind_address)
        );
        Self::with_acceptor(config, acceptor)
    }

    /// Create a relay over any acceptor
    pub fn with_acceptor(config: RelayConfig, acceptor: impl Acceptor) -> Result<Self> {
        config.validate().map_err(RelayError::InvalidConfig)?;
        let metrics = Arc::new(RelayMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(
            metrics.clone(),
            config.write_timeout,
        ));
        let local_addr = acceptor.local_addr();

        Ok(Self {
            config,
            registry,
            metrics,
            acceptor: Mutex::new(Some(Box::new(acceptor))),
            local_addr,
            started_at: Instant::now(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            sessions: TaskTracker::new(),
            accept_handle: Mutex::new(None),
        })
    }

    /// Run the accept loop on the current task
    ///
    /// Returns `Ok(())` after `shutdown()` and `Err(ListenerFault)` when the
    /// listener fails; in the latter case every session has already been
    /// asked to close.
    pub async fn serve(&self, observer: Arc<dyn RelayObserver>) -> Result<()> {
        let accept_loop = self.prepare(observer).await?;
        accept_loop.run().await
    }

    /// Spawn the accept loop and return immediately
    pub async fn start(&self, observer: Arc<dyn RelayObserver>) -> Result<()> {
        let accept_loop = self.prepare(observer).await?;
        let handle = tokio::spawn(accept_loop.run());
        *self.accept_handle.lock().await = Some(handle);
        Ok(())
    }

    async fn prepare(&self, observer: Arc<dyn RelayObserver>) -> Result<AcceptLoop> {
        let acceptor = self
            .acceptor
            .lock()
            .await
            .take()
            .ok_or(RelayError::AlreadyRunning)?;
        self.running.store(true, Ordering::SeqCst);

        match self.local_addr {
            Some(addr) => info!("Starting broadcast relay on {}", addr),
            None => info!("Starting broadcast relay"),
        }

        Ok(AcceptLoop {
            acceptor,
            observer,
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            sessions: self.sessions.clone(),
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
            session_config: SessionConfig::from(&self.config),
            max_connections: self.config.max_connections,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }

    /// Shutdown the relay
    ///
    /// Stops accepting, asks every session to close and waits for them up to
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(RelayError::NotRunning);
        }

        info!("Shutting down broadcast relay");
        self.shutdown.cancel();

        if let Some(handle) = self.accept_handle.lock().await.take() {
            let _ = timeout(self.config.shutdown_timeout, handle).await;
        }

        drain_sessions(&self.registry, &self.sessions, self.config.shutdown_timeout).await;

        info!("Broadcast relay shutdown complete");
        Ok(())
    }

    /// Wait for the accept loop spawned by `start()` to finish
    ///
    /// Returns the loop's result: `Err(ListenerFault)` when the listener
    /// failed, `Ok(())` once it stopped for shutdown. Fails with `NotRunning`
    /// when no spawned loop is left to wait on, including after `shutdown()`
    /// has collected it.
    pub async fn wait(&self) -> Result<()> {
        let handle = self
            .accept_handle
            .lock()
            .await
            .take()
            .ok_or(RelayError::NotRunning)?;
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(RelayError::ListenerFault(io::Error::other(e))),
        }
    }

    /// Check if the relay is accepting connections
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the listening address, if the acceptor has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the number of live connections
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Get a snapshot of the relay state
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            active_connections: self.registry.connection_count(),
            total_connections: self.metrics.total_connections(),
            local_addr: self.local_addr,
            uptime: self.started_at.elapsed(),
            started_at: self.started_at,
        }
    }

    /// Get the relay metrics
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Get the connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Get the relay configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl std::fmt::Debug for BroadcastRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRelay")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .field("connection_count", &self.connection_count())
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl Drop for BroadcastRelay {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("BroadcastRelay dropped while still running");
            self.running.store(false, Ordering::SeqCst);
            self.shutdown.cancel();
            self.registry.close_all();
        }
    }
}

/// Everything the accept loop needs, detached from the relay so it can be spawned
struct AcceptLoop {
    acceptor: Box<dyn Acceptor>,
    observer: Arc<dyn RelayObserver>,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    sessions: TaskTracker,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    session_config: SessionConfig,
    max_connections: Option<usize>,
    shutdown_timeout: Duration,
}

impl AcceptLoop {
    async fn run(mut self) -> Result<()> {
        let result = loop {
            let accepted = select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = self.acceptor.accept() => accepted,
            };

            match accepted {
                Ok(connection) => {
                    if let Err(e) = self.admit(connection).await {
                        break Err(e);
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    self.metrics.accept_error();
                    sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    break Err(RelayError::ListenerFault(e));
                }
            }
        };

        if let Err(e) = &result {
            self.observer.on_listener_fault(e).await;
            if self.running.swap(false, Ordering::SeqCst) {
                drain_sessions(&self.registry, &self.sessions, self.shutdown_timeout).await;
            }
        }

        info!("Accept loop terminated");
        result
    }

    /// Register an accepted connection and spawn its session
    ///
    /// Only a registry fault is returned; capacity rejections are handled here.
    async fn admit(&self, connection: LineConnection) -> Result<()> {
        let peer_addr = connection.peer_addr();

        if let Some(max) = self.max_connections {
            if self.registry.connection_count() >= max {
                let rejection = RelayError::CapacityReached(max);
                warn!(peer_addr = ?peer_addr, "Connection limit reached ({}), rejecting", max);
                self.metrics.connection_rejected();
                self.observer.on_rejected(peer_addr, &rejection).await;
                return Ok(());
            }
        }

        let session = ConnectionSession::open(
            connection,
            self.registry.clone(),
            self.observer.clone(),
            self.session_config.clone(),
        )?;
        debug!(connection_id = %session.id(), peer_addr = ?peer_addr, "Connection established");
        self.sessions.spawn(session.run());
        Ok(())
    }
}

/// Ask every session to close and wait for their tasks to finish
async fn drain_sessions(
    registry: &ConnectionRegistry,
    sessions: &TaskTracker,
    limit: Duration,
) {
    let signalled = registry.close_all();
    debug!(sessions = signalled, "Closing sessions");
    sessions.close();
    if timeout(limit, sessions.wait()).await.is_err() {
        warn!(
            remaining = registry.connection_count(),
            "Sessions still open after shutdown timeout"
        );
    }
}
