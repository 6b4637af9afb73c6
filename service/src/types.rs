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

//! Core types for the broadcast relay

use crate::RelayError;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session state (stored as atomic u8 so the registry can read it lock-free)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted and registered, session not yet reading
    Connected = 0,
    /// Steady state: reading lines and relaying them
    Reading = 1,
    /// Peer closed the stream or a close was requested
    Closed = 2,
    /// An unrecoverable read or write fault ended the session
    Faulted = 3,
}

impl ConnectionState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Reading,
            2 => Self::Closed,
            _ => Self::Faulted,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if the session has ended
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }

    /// Check if the connection still belongs in the live set
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reading => write!(f, "reading"),
            Self::Closed => write!(f, "closed"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Why a session ended without a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer signalled end-of-stream
    EndOfStream,
    /// The registry asked the session to close (shutdown or explicit close)
    Requested,
}

/// How a session terminated
#[derive(Debug)]
pub enum SessionOutcome {
    /// Orderly termination
    Closed(CloseReason),
    /// Terminated by a read or write fault
    Faulted(RelayError),
}

impl SessionOutcome {
    /// The terminal state this outcome maps to
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Closed(_) => ConnectionState::Closed,
            Self::Faulted(_) => ConnectionState::Faulted,
        }
    }

    /// Check if the session ended with a fault
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}

/// Connection information snapshot (for non-blocking queries)
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Current state
    pub state: ConnectionState,
    /// Peer address, when the transport has one
    pub peer_addr: Option<SocketAddr>,
    /// When the connection was registered
    pub registered_at: Instant,
    /// Lines successfully written to this connection
    pub lines_delivered: u64,
}

impl ConnectionInfo {
    /// Get the time since registration
    pub fn duration(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Relay snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct RelaySnapshot {
    /// Number of connections in the live set
    pub active_connections: usize,
    /// Total connections since the relay was created
    pub total_connections: u64,
    /// Listening address, if the acceptor exposes one
    pub local_addr: Option<SocketAddr>,
    /// Relay uptime
    pub uptime: Duration,
    /// Relay start time
    pub started_at: Instant,
}

impl fmt::Display for RelaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = self
            .local_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "BroadcastRelay {{ active: {}, total: {}, addr: {}, uptime: {:?} }}",
            self.active_connections, self.total_connections, addr, self.uptime
        )
    }
}
