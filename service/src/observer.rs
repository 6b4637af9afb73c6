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

//! Observer hooks for relay activity and faults

use crate::{ConnectionId, RelayError, SessionOutcome};
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::{error, info, warn};

/// Relay observer trait
///
/// Implement this trait to be told about connections, relayed lines and
/// faults. Every method has a default implementation that does nothing.
/// Hooks run inline on the session or accept task that raised them, so they
/// should return promptly.
///
/// # Example
///
/// ```no_run
/// use linerelay_service::{ConnectionId, RelayError, RelayObserver};
/// use async_trait::async_trait;
///
/// struct FaultCounter;
///
/// #[async_trait]
/// impl RelayObserver for FaultCounter {
///     async fn on_fault(&self, id: ConnectionId, error: &RelayError) {
///         eprintln!("{} faulted: {}", id, error);
///     }
/// }
/// ```
#[async_trait]
pub trait RelayObserver: Send + Sync + 'static {
    /// Called when a session starts reading
    async fn on_connect(&self, _id: ConnectionId, _peer_addr: Option<SocketAddr>) {}

    /// Called for every inbound line, before it is broadcast
    async fn on_line(&self, _id: ConnectionId, _line: &str) {}

    /// Called when a session ends on a read or write fault
    async fn on_fault(&self, _id: ConnectionId, _error: &RelayError) {}

    /// Called after a session has been unregistered and its socket released
    async fn on_disconnect(&self, _id: ConnectionId, _outcome: &SessionOutcome) {}

    /// Called when an accepted connection is turned away by the capacity policy
    async fn on_rejected(&self, _peer_addr: Option<SocketAddr>, _error: &RelayError) {}

    /// Called once when the accept loop stops on a fatal error
    async fn on_listener_fault(&self, _error: &RelayError) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl RelayObserver for NoopObserver {}

/// Observer that reports through `tracing`
///
/// Inbound lines are logged at `info`, matching a console relay that prints
/// everything it forwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

#[async_trait]
impl RelayObserver for LoggingObserver {
    async fn on_connect(&self, id: ConnectionId, peer_addr: Option<SocketAddr>) {
        info!(connection_id = %id, peer_addr = ?peer_addr, "Got a connection");
    }

    async fn on_line(&self, id: ConnectionId, line: &str) {
        info!(connection_id = %id, "{}", line);
    }

    async fn on_fault(&self, id: ConnectionId, error: &RelayError) {
        warn!(connection_id = %id, error = %error, "Connection fault");
    }

    async fn on_disconnect(&self, id: ConnectionId, outcome: &SessionOutcome) {
        info!(connection_id = %id, state = %outcome.state(), "Connection ended");
    }

    async fn on_rejected(&self, peer_addr: Option<SocketAddr>, error: &RelayError) {
        warn!(peer_addr = ?peer_addr, error = %error, "Connection rejected");
    }

    async fn on_listener_fault(&self, error: &RelayError) {
        error!(error = %error, "Listener fault, relay stopping");
    }
}
