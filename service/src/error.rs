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

//! Error types for the broadcast relay

use crate::types::ConnectionId;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
///
/// Connection-scoped variants never leave the session or broadcast that
/// produced them; [`RelayError::ListenerFault`] is the only variant that ends
/// the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening resource is unusable; the accept loop has stopped
    #[error("Listener fault: {0}")]
    ListenerFault(#[source] std::io::Error),

    /// Reading from a connection failed
    #[error("Read fault on {id}: {source}")]
    ConnectionReadFault {
        /// Connection the read belonged to
        id: ConnectionId,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Writing a broadcast line to a connection failed or timed out
    #[error("Write fault on {id}: {source}")]
    ConnectionWriteFault {
        /// Connection the write targeted
        id: ConnectionId,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The shared connection set is internally inconsistent
    #[error("Registry fault: {0}")]
    RegistryFault(String),

    /// The configured connection cap has been reached
    #[error("Maximum connections ({0}) reached")]
    CapacityReached(usize),

    /// The relay is already serving
    #[error("Relay already running")]
    AlreadyRunning,

    /// The relay is not serving
    #[error("Relay not running")]
    NotRunning,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error outside of any connection (bind, local address lookup)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Check if the error is confined to a single connection
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectionReadFault { .. }
                | RelayError::ConnectionWriteFault { .. }
                | RelayError::CapacityReached(_)
        )
    }

    /// Check if the error terminates the relay
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::ListenerFault(_) | RelayError::RegistryFault(_)
        )
    }

    /// The connection this error belongs to, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            RelayError::ConnectionReadFault { id, .. }
            | RelayError::ConnectionWriteFault { id, .. } => Some(*id),
            _ => None,
        }
    }
}
