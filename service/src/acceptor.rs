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

//! Sources of accepted connections
//!
//! The relay only ever asks for "the next accepted connection". Binding,
//! socket tuning and the transport itself live behind [`Acceptor`].

use crate::LineConnection;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Supplies the relay with accepted connections
///
/// The accept loop runs on a spawned task and holds the acceptor across
/// awaits, hence `Sync`.
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Wait for the next inbound connection
    ///
    /// Errors are classified with [`is_transient_accept_error`]; anything
    /// not transient ends the relay.
    async fn accept(&mut self) -> io::Result<LineConnection>;

    /// Address the acceptor listens on, if it has one
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Check whether an accept error only affected the connection being accepted
///
/// Descriptor exhaustion is included: the listener itself is healthy and
/// recovers once other connections close.
pub fn is_transient_accept_error(error: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        error.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | TimedOut | WouldBlock
    ) {
        return true;
    }
    // EMFILE / ENFILE
    matches!(error.raw_os_error(), Some(23) | Some(24))
}

/// TCP listener acceptor
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
}

impl TcpAcceptor {
    /// Bind a new listener
    pub async fn bind(addr: impl ToSocketAddrs, nodelay: bool) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener, nodelay)
    }

    /// Use an already bound listener
    pub fn from_listener(listener: TcpListener, nodelay: bool) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            nodelay,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> io::Result<LineConnection> {
        let (socket, peer_addr) = self.listener.accept().await?;
        if self.nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                warn!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        Ok(LineConnection::wrap(socket, peer_addr))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

/// In-process acceptor fed through a channel
///
/// Each value sent on the paired sender is returned by one `accept` call,
/// errors included. Dropping every sender makes `accept` fail with
/// `BrokenPipe`, which the relay treats as a listener fault.
#[derive(Debug)]
pub struct ChannelAcceptor {
    incoming: mpsc::UnboundedReceiver<io::Result<LineConnection>>,
}

impl ChannelAcceptor {
    /// Create an acceptor and the sender that feeds it
    pub fn new() -> (Self, mpsc::UnboundedSender<io::Result<LineConnection>>) {
        let (tx, incoming) = mpsc::unbounded_channel();
        (Self { incoming }, tx)
    }
}

#[async_trait]
impl Acceptor for ChannelAcceptor {
    async fn accept(&mut self) -> io::Result<LineConnection> {
        match self.incoming.recv().await {
            Some(accepted) => accepted,
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "acceptor channel closed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::BrokenPipe
        )));
        assert!(!is_transient_accept_error(&io::Error::other("closed")));
    }

    #[tokio::test]
    async fn test_tcp_acceptor_accepts() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0", true).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let connection = acceptor.accept().await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(connection.peer_addr(), Some(client.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_channel_acceptor_closes_as_broken_pipe() {
        let (mut acceptor, tx) = ChannelAcceptor::new();
        let (local, _remote) = tokio::io::duplex(64);
        tx.send(Ok(LineConnection::from_stream(local))).unwrap();
        drop(tx);

        assert!(acceptor.accept().await.is_ok());
        let err = acceptor.accept().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(!is_transient_accept_error(&err));
    }
}
