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

//! Relay configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Port the relay listens on when none is configured
pub const DEFAULT_PORT: u16 = 6789;

/// Longest accepted inbound line, in bytes, unless configured otherwise
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Relay configuration
///
/// Use the builder methods to customize the defaults.
///
/// # Example
///
/// ```
/// use linerelay_service::RelayConfig;
/// use std::time::Duration;
///
/// let config = RelayConfig::default()
///     .with_max_connections(Some(500))
///     .with_write_timeout(Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the listener to
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections
    ///
    /// `None` leaves the live set unbounded. When set, connections accepted
    /// past the cap are dropped immediately.
    pub max_connections: Option<usize>,

    /// Maximum time to wait for a line from a client
    ///
    /// `None` waits indefinitely. When set, a silent client is faulted.
    pub read_timeout: Option<Duration>,

    /// Maximum time a single broadcast write may take before the target is
    /// evicted as a slow consumer
    pub write_timeout: Duration,

    /// Maximum time to wait for sessions to finish during shutdown
    pub shutdown_timeout: Duration,

    /// Longest inbound line accepted, in bytes, excluding the delimiter
    pub max_line_length: usize,

    /// Set `TCP_NODELAY` on accepted sockets
    pub nodelay: bool,

    /// Capacity of each session's control channel
    pub control_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: None,
            read_timeout: None,
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            nodelay: true,
            control_buffer_size: 4,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with the given bind address
    ///
    /// All other settings will use their default values.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Create a configuration listening on all interfaces at `port`
    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Set the connection cap
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the maximum inbound line length
    pub fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    /// Enable or disable `TCP_NODELAY`
    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }

        if self.read_timeout.is_some_and(|t| t.is_zero()) {
            return Err("read_timeout must be greater than 0".to_string());
        }

        if self.write_timeout.is_zero() {
            return Err("write_timeout must be greater than 0".to_string());
        }

        if self.shutdown_timeout.is_zero() {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }

        if self.max_line_length == 0 {
            return Err("max_line_length must be greater than 0".to_string());
        }

        if self.control_buffer_size == 0 {
            return Err("control_buffer_size must be greater than 0".to_string());
        }

        Ok(())
    }
}
