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

//! Connection session implementation
//!
//! A ConnectionSession owns one connection for its whole lifetime:
//! - Reads lines and hands each one to the registry for broadcast
//! - Watches its control channel for close and eviction requests
//! - Unregisters itself and releases the socket when it ends
//!
//! States advance `Connected -> Reading -> (Closed | Faulted)`.

use crate::connection::into_io_error;
use crate::{
    CloseReason, ConnectionId, ConnectionRegistry, ConnectionState, LineConnection, LineSink,
    LineStream, Registration, RelayConfig, RelayError, RelayObserver, Result, SessionOutcome,
};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

/// Control messages for a session
#[derive(Debug)]
pub enum ControlMessage {
    /// End the session in an orderly way
    Close,
    /// A broadcast write to this connection failed; end the session as faulted
    Evict(io::Error),
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Max time to wait for a line (`None` waits forever)
    pub read_timeout: Option<Duration>,
    /// Longest inbound line accepted
    pub max_line_length: usize,
    /// Max time to flush and close the outbound half at teardown
    pub close_timeout: Duration,
    /// Control channel buffer size
    pub control_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for SessionConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            max_line_length: config.max_line_length,
            close_timeout: config.write_timeout,
            control_buffer_size: config.control_buffer_size,
        }
    }
}

/// One connection's read-and-relay activity
pub struct ConnectionSession {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    lines: LineStream,
    /// The only strong reference to the outbound sink
    sink: Arc<Mutex<LineSink>>,
    registry: Arc<ConnectionRegistry>,
    observer: Arc<dyn RelayObserver>,
    config: SessionConfig,
    state: Arc<AtomicU8>,
    control_rx: mpsc::Receiver<ControlMessage>,
    opened_at: Instant,
}

impl ConnectionSession {
    /// Frame a connection and add it to the live set
    ///
    /// On success the connection is already visible to broadcasts and the
    /// session is in the `Connected` state; call [`run`](Self::run) to start
    /// reading.
    pub fn open(
        connection: LineConnection,
        registry: Arc<ConnectionRegistry>,
        observer: Arc<dyn RelayObserver>,
        config: SessionConfig,
    ) -> Result<Self> {
        let peer_addr = connection.peer_addr();
        let (lines, sink) = connection.framed(config.max_line_length);
        let sink = Arc::new(Mutex::new(sink));
        let state = Arc::new(AtomicU8::new(ConnectionState::Connected.as_u8()));
        let (control_tx, control_rx) = mpsc::channel(config.control_buffer_size);

        let id = registry.register(
            Registration::new(&sink, control_tx, state.clone()).with_peer_addr(peer_addr),
        )?;

        Ok(Self {
            id,
            peer_addr,
            lines,
            sink,
            registry,
            observer,
            config,
            state,
            control_rx,
            opened_at: Instant::now(),
        })
    }

    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Run the session until the connection closes or faults
    ///
    /// Whatever the outcome, the connection is unregistered and its socket
    /// released before this returns.
    #[instrument(skip(self), fields(connection_id = %self.id))]
    pub async fn run(mut self) -> SessionOutcome {
        self.set_state(ConnectionState::Reading);
        self.observer.on_connect(self.id, self.peer_addr).await;

        let outcome = self.read_loop().await;

        self.set_state(outcome.state());
        self.registry.unregister(self.id);

        match &outcome {
            SessionOutcome::Closed(reason) => {
                info!(reason = ?reason, duration = ?self.opened_at.elapsed(), "Session closed");
            }
            SessionOutcome::Faulted(error) => {
                if matches!(error, RelayError::ConnectionReadFault { .. }) {
                    self.registry.metrics().read_fault();
                }
                warn!(error = %error, "Session faulted");
                self.observer.on_fault(self.id, error).await;
            }
        }

        self.release().await;
        self.observer.on_disconnect(self.id, &outcome).await;
        outcome
    }

    async fn read_loop(&mut self) -> SessionOutcome {
        loop {
            let next = select! {
                biased;

                msg = self.control_rx.recv() => match msg {
                    Some(ControlMessage::Close) | None => {
                        return SessionOutcome::Closed(CloseReason::Requested);
                    }
                    Some(ControlMessage::Evict(source)) => {
                        return SessionOutcome::Faulted(RelayError::ConnectionWriteFault {
                            id: self.id,
                            source,
                        });
                    }
                },

                next = next_line(&mut self.lines, self.config.read_timeout) => next,
            };

            match next {
                Ok(Some(line)) => self.relay(line).await,
                Ok(None) => return SessionOutcome::Closed(CloseReason::EndOfStream),
                Err(source) => {
                    return SessionOutcome::Faulted(RelayError::ConnectionReadFault {
                        id: self.id,
                        source,
                    });
                }
            }
        }
    }

    async fn relay(&mut self, line: String) {
        self.registry.metrics().line_received();
        trace!(length = line.len(), "Line received");
        self.observer.on_line(self.id, &line).await;

        let result = self.registry.broadcast(&line).await;
        if !result.all_succeeded() {
            debug!(
                failed = result.failed,
                total = result.total,
                "Broadcast evicted unreachable connections"
            );
        }
    }

    /// Flush and shut down the outbound half
    async fn release(&mut self) {
        let mut sink = match timeout(self.config.close_timeout, self.sink.lock()).await {
            Ok(sink) => sink,
            Err(_) => {
                debug!("Outbound sink busy at teardown, dropping without close");
                return;
            }
        };
        match timeout(
            self.config.close_timeout,
            SinkExt::<Arc<str>>::close(&mut *sink),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %into_io_error(e), "Outbound close failed"),
            Err(_) => debug!("Outbound close timed out"),
        }
    }
}

/// Read one line, honoring the optional read timeout
async fn next_line(
    lines: &mut LineStream,
    read_timeout: Option<Duration>,
) -> io::Result<Option<String>> {
    let next = match read_timeout {
        Some(limit) => timeout(limit, lines.next()).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no line received within {:?}", limit),
            )
        })?,
        None => lines.next().await,
    };
    next.transpose()
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoopObserver, RelayMetrics};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    #[derive(Default)]
    struct CountingObserver {
        connected: AtomicUsize,
        lines: AtomicUsize,
        faults: AtomicUsize,
        disconnected: AtomicUsize,
    }

    #[async_trait]
    impl RelayObserver for CountingObserver {
        async fn on_connect(&self, _id: ConnectionId, _peer_addr: Option<SocketAddr>) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_line(&self, _id: ConnectionId, _line: &str) {
            self.lines.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_fault(&self, _id: ConnectionId, _error: &RelayError) {
            self.faults.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_disconnect(&self, _id: ConnectionId, _outcome: &SessionOutcome) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Arc::new(RelayMetrics::new()),
            Duration::from_secs(1),
        ))
    }

    fn open(
        registry: &Arc<ConnectionRegistry>,
        observer: Arc<dyn RelayObserver>,
        config: SessionConfig,
    ) -> (ConnectionSession, DuplexStream) {
        let (local, remote) = duplex(1024);
        let session = ConnectionSession::open(
            LineConnection::from_stream(local),
            registry.clone(),
            observer,
            config,
        )
        .unwrap();
        (session, remote)
    }

    #[tokio::test]
    async fn test_open_registers_connected() {
        let registry = registry();
        let (session, _remote) = open(&registry, Arc::new(NoopObserver), SessionConfig::default());

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(registry.contains(session.id()));
    }

    #[tokio::test]
    async fn test_line_is_echoed_to_sender() {
        let registry = registry();
        let observer = Arc::new(CountingObserver::default());
        let (session, mut remote) = open(&registry, observer.clone(), SessionConfig::default());
        let id = session.id();
        let task = tokio::spawn(session.run());

        remote.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        drop(remote);
        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Closed(CloseReason::EndOfStream)
        ));
        assert!(!registry.contains(id));
        assert_eq!(observer.connected.load(Ordering::SeqCst), 1);
        assert_eq!(observer.lines.load(Ordering::SeqCst), 1);
        assert_eq!(observer.faults.load(Ordering::SeqCst), 0);
        assert_eq!(observer.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_request_ends_session() {
        let registry = registry();
        let (session, _remote) = open(&registry, Arc::new(NoopObserver), SessionConfig::default());
        let id = session.id();
        let task = tokio::spawn(session.run());

        assert!(registry.close(id));
        let outcome = task.await.unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Closed(CloseReason::Requested)
        ));
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_over_long_line_faults() {
        let registry = registry();
        let observer = Arc::new(CountingObserver::default());
        let config = SessionConfig {
            max_line_length: 8,
            ..SessionConfig::default()
        };
        let (session, mut remote) = open(&registry, observer.clone(), config);
        let task = tokio::spawn(session.run());

        remote.write_all(b"this line is too long\n").await.unwrap();
        let outcome = task.await.unwrap();
        match outcome {
            SessionOutcome::Faulted(RelayError::ConnectionReadFault { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::InvalidData);
            }
            other => panic!("expected read fault, got {:?}", other),
        }
        assert_eq!(observer.faults.load(Ordering::SeqCst), 1);
        assert_eq!(registry.metrics().snapshot().read_faults, 1);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_read_timeout_faults() {
        let registry = registry();
        let config = SessionConfig {
            read_timeout: Some(Duration::from_millis(50)),
            ..SessionConfig::default()
        };
        let (session, _remote) = open(&registry, Arc::new(NoopObserver), config);

        let outcome = session.run().await;
        match outcome {
            SessionOutcome::Faulted(RelayError::ConnectionReadFault { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("expected read timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eviction_ends_session_as_write_fault() {
        let registry = registry();
        let (speaker, mut speaker_remote) =
            open(&registry, Arc::new(NoopObserver), SessionConfig::default());
        let (listener, listener_remote) =
            open(&registry, Arc::new(NoopObserver), SessionConfig::default());
        let listener_id = listener.id();

        // The listener's client is gone, so its inbound side sees EOF as well;
        // hold the session back until the broadcast has evicted it.
        drop(listener_remote);
        let speaker_task = tokio::spawn(speaker.run());
        speaker_remote.write_all(b"anyone?\n").await.unwrap();

        let mut buf = [0u8; 8];
        speaker_remote.read_exact(&mut buf).await.unwrap();
        assert!(!registry.contains(listener_id));

        match listener.run().await {
            SessionOutcome::Faulted(RelayError::ConnectionWriteFault { id, .. }) => {
                assert_eq!(id, listener_id);
            }
            other => panic!("expected write fault, got {:?}", other),
        }

        drop(speaker_remote);
        speaker_task.await.unwrap();
    }
}
