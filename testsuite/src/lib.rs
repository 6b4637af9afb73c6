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

//! End-to-end test helpers for the line relay
//!
//! [`TestClient`] speaks the relay's wire format over a real TCP socket and
//! [`spawn_relay`] starts a relay on an ephemeral loopback port.

use futures_util::{SinkExt, StreamExt};
use linerelay_service::{BroadcastRelay, RelayConfig, RelayObserver, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// How long helpers wait for the relay before giving up
pub const DEFAULT_WAIT: Duration = Duration::from_secs(2);

/// Start a relay on `127.0.0.1:0` with the given configuration tweaks
pub async fn spawn_relay(
    configure: impl FnOnce(RelayConfig) -> RelayConfig,
    observer: Arc<dyn RelayObserver>,
) -> Result<BroadcastRelay> {
    let config = configure(RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))));
    let relay = BroadcastRelay::bind(config).await?;
    relay.start(observer).await?;
    Ok(relay)
}

/// Poll until the relay reports `expected` live connections
pub async fn wait_for_connections(relay: &BroadcastRelay, expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
    while tokio::time::Instant::now() < deadline {
        if relay.connection_count() == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    relay.connection_count() == expected
}

/// Line-oriented TCP client
pub struct TestClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl TestClient {
    /// Connect to a relay
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Send one line; the newline is appended
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.framed.send(line).await.map_err(codec_error)
    }

    /// Send raw bytes without framing
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Receive the next line, waiting at most [`DEFAULT_WAIT`]
    ///
    /// Returns `Ok(None)` when the relay closed the connection.
    pub async fn recv_line(&mut self) -> io::Result<Option<String>> {
        self.recv_line_within(DEFAULT_WAIT).await
    }

    /// Receive the next line, waiting at most `wait`
    pub async fn recv_line_within(&mut self, wait: Duration) -> io::Result<Option<String>> {
        match timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(line))) => Ok(Some(line)),
            Ok(Some(Err(e))) => Err(codec_error(e)),
            Ok(None) => Ok(None),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no line received")),
        }
    }

    /// Check that nothing arrives within `wait`
    pub async fn is_quiet_for(&mut self, wait: Duration) -> bool {
        timeout(wait, self.framed.next()).await.is_err()
    }
}

fn codec_error(error: LinesCodecError) -> io::Error {
    match error {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
    }
}
