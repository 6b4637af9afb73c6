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

//! Line Broadcast Relay
//!
//! This crate accepts stream connections, reads newline-delimited text from
//! each of them, and writes every line it receives to every connected client,
//! the sender included.
//!
//! - Concurrency-safe registry of live connections with idempotent removal
//! - Broadcast that snapshots the live set and never holds a lock across I/O
//! - Bounded writes: a slow or dead peer is evicted, never waited on forever
//! - Failure isolation: a connection fault only ever ends that connection
//!
//! # Architecture
//!
//! ```text
//! BroadcastRelay (accept loop)
//!     ↓
//! ConnectionSession (one task per connection) → ConnectionRegistry::broadcast
//!     ↓
//! LineConnection (LossyLinesCodec in, LinesCodec out)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use linerelay_service::{BroadcastRelay, LoggingObserver, RelayConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = BroadcastRelay::bind(RelayConfig::with_port(6789)).await?;
//!     relay.serve(Arc::new(LoggingObserver)).await?;
//!     Ok(())
//! }
//! ```

mod acceptor;
mod config;
mod connection;
mod error;
mod metrics;
mod observer;
mod registry;
mod relay;
mod session;
mod types;

pub use acceptor::{Acceptor, ChannelAcceptor, TcpAcceptor, is_transient_accept_error};
pub use config::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT, RelayConfig};
pub use connection::{
    BoxedReader, BoxedWriter, LineConnection, LineSink, LineStream, LossyLinesCodec,
};
pub use error::{RelayError, Result};
pub use crate::metrics::{MetricsSnapshot, RelayMetrics};
pub use observer::{LoggingObserver, NoopObserver, RelayObserver};
pub use registry::{BroadcastResult, ConnectionRegistry, Registration};
pub use relay::BroadcastRelay;
pub use session::{ConnectionSession, ControlMessage, SessionConfig};
pub use types::{
    CloseReason, ConnectionId, ConnectionInfo, ConnectionState, RelaySnapshot, SessionOutcome,
};
