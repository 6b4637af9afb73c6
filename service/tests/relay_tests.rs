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

//! In-process relay tests driven through a channel acceptor and duplex pipes

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use linerelay_service::{
    BroadcastRelay, ChannelAcceptor, ConnectionId, LineConnection, NoopObserver, RelayConfig,
    RelayError, RelayObserver, SessionOutcome,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Framed, LinesCodec};

type Client = Framed<DuplexStream, LinesCodec>;

/// Observer that counts what it sees
#[derive(Default)]
struct TrackingObserver {
    faults: AtomicUsize,
    disconnects: AtomicUsize,
    rejected: AtomicUsize,
    listener_faults: AtomicUsize,
}

#[async_trait]
impl RelayObserver for TrackingObserver {
    async fn on_fault(&self, _id: ConnectionId, _error: &RelayError) {
        self.faults.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_disconnect(&self, _id: ConnectionId, _outcome: &SessionOutcome) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_rejected(&self, _peer_addr: Option<SocketAddr>, _error: &RelayError) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_listener_fault(&self, _error: &RelayError) {
        self.listener_faults.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hand a fresh duplex connection to the relay and return the client end
fn connect(tx: &UnboundedSender<io::Result<LineConnection>>) -> Client {
    let (local, remote) = duplex(4096);
    tx.send(Ok(LineConnection::from_stream(local))).unwrap();
    Framed::new(remote, LinesCodec::new())
}

async fn wait_for_connections(relay: &BroadcastRelay, expected: usize) {
    for _ in 0..100 {
        if relay.connection_count() == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} connections, found {}",
        expected,
        relay.connection_count()
    );
}

async fn recv(client: &mut Client) -> String {
    timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for a line")
        .expect("connection closed")
        .expect("decode failed")
}

async fn assert_silent(client: &mut Client) {
    let next = timeout(Duration::from_millis(100), client.next()).await;
    assert!(next.is_err(), "unexpected line: {:?}", next);
}

#[tokio::test]
async fn test_every_client_receives_each_line_once() {
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(Arc::new(NoopObserver)).await.unwrap();

    let mut a = connect(&tx);
    let mut b = connect(&tx);
    let mut c = connect(&tx);
    wait_for_connections(&relay, 3).await;

    a.send("hello").await.unwrap();

    for client in [&mut a, &mut b, &mut c] {
        assert_eq!(recv(client).await, "hello");
        assert_silent(client).await;
    }

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abrupt_disconnect_does_not_affect_others() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(observer.clone()).await.unwrap();

    let a = connect(&tx);
    let mut b = connect(&tx);
    let mut c = connect(&tx);
    wait_for_connections(&relay, 3).await;

    drop(a);
    wait_for_connections(&relay, 2).await;

    b.send("ping").await.unwrap();
    assert_eq!(recv(&mut b).await, "ping");
    assert_eq!(recv(&mut c).await, "ping");
    assert_eq!(observer.faults.load(Ordering::SeqCst), 0);

    relay.shutdown().await.unwrap();
    assert_eq!(observer.disconnects.load(Ordering::SeqCst), 3);
    assert_eq!(observer.faults.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_lines_from_one_sender_arrive_in_order() {
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(Arc::new(NoopObserver)).await.unwrap();

    let mut sender = connect(&tx);
    let mut receiver = connect(&tx);
    wait_for_connections(&relay, 2).await;

    for i in 0..20 {
        sender.send(format!("msg-{}", i)).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(recv(&mut receiver).await, format!("msg-{}", i));
    }

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stalled_client_is_evicted() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let config = RelayConfig::default().with_write_timeout(Duration::from_millis(100));
    let relay = BroadcastRelay::with_acceptor(config, acceptor).unwrap();
    relay.start(observer.clone()).await.unwrap();

    let mut talker = connect(&tx);
    // A pipe too small for one line, never read from.
    let (local, _stalled) = duplex(8);
    tx.send(Ok(LineConnection::from_stream(local))).unwrap();
    wait_for_connections(&relay, 2).await;

    talker.send("this line does not fit").await.unwrap();
    assert_eq!(recv(&mut talker).await, "this line does not fit");

    wait_for_connections(&relay, 1).await;
    assert_eq!(relay.metrics().snapshot().write_faults, 1);

    talker.send("after eviction").await.unwrap();
    assert_eq!(recv(&mut talker).await, "after eviction");

    relay.shutdown().await.unwrap();
    assert_eq!(observer.faults.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_capacity_limit_rejects_extra_connections() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let config = RelayConfig::default().with_max_connections(Some(2));
    let relay = BroadcastRelay::with_acceptor(config, acceptor).unwrap();
    relay.start(observer.clone()).await.unwrap();

    let mut a = connect(&tx);
    let _b = connect(&tx);
    wait_for_connections(&relay, 2).await;

    let mut rejected = connect(&tx);
    let closed = timeout(Duration::from_secs(2), rejected.next()).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(relay.connection_count(), 2);
    assert_eq!(observer.rejected.load(Ordering::SeqCst), 1);
    assert_eq!(relay.metrics().snapshot().rejected_connections, 1);

    a.send("still relaying").await.unwrap();
    assert_eq!(recv(&mut a).await, "still relaying");

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_utf8_is_relayed_with_replacement() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(observer.clone()).await.unwrap();

    let mut a = connect(&tx);
    let mut b = connect(&tx);
    wait_for_connections(&relay, 2).await;

    a.get_mut().write_all(b"caf\xe9\n").await.unwrap();
    assert_eq!(recv(&mut b).await, "caf\u{FFFD}");
    assert_eq!(recv(&mut a).await, "caf\u{FFFD}");
    assert_eq!(relay.connection_count(), 2);

    a.send("still connected").await.unwrap();
    assert_eq!(recv(&mut b).await, "still connected");
    assert_eq!(observer.faults.load(Ordering::SeqCst), 0);

    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_started_relay_reports_listener_fault_through_wait() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(observer.clone()).await.unwrap();

    let mut client = connect(&tx);
    wait_for_connections(&relay, 1).await;
    drop(tx);

    let result = timeout(Duration::from_secs(5), relay.wait()).await.unwrap();
    assert!(matches!(result, Err(RelayError::ListenerFault(_))));
    assert_eq!(observer.listener_faults.load(Ordering::SeqCst), 1);
    assert_eq!(relay.connection_count(), 0);

    let closed = timeout(Duration::from_secs(2), client.next()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_listener_fault_stops_relay_and_closes_sessions() {
    let observer = Arc::new(TrackingObserver::default());
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();

    let mut client = connect(&tx);
    tx.send(Err(io::Error::other("listening socket destroyed")))
        .unwrap();

    let result = timeout(Duration::from_secs(5), relay.serve(observer.clone()))
        .await
        .unwrap();
    assert!(matches!(result, Err(RelayError::ListenerFault(_))));
    assert!(!relay.is_running());
    assert_eq!(relay.connection_count(), 0);
    assert_eq!(observer.listener_faults.load(Ordering::SeqCst), 1);

    let closed = timeout(Duration::from_secs(2), client.next()).await.unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(Arc::new(NoopObserver)).await.unwrap();

    let mut clients: Vec<_> = (0..3).map(|_| connect(&tx)).collect();
    wait_for_connections(&relay, 3).await;

    relay.shutdown().await.unwrap();
    assert_eq!(relay.connection_count(), 0);
    assert_eq!(relay.metrics().active_connections(), 0);

    for client in &mut clients {
        let closed = timeout(Duration::from_secs(2), client.next()).await.unwrap();
        assert!(closed.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connections_joining_during_traffic() {
    let (acceptor, tx) = ChannelAcceptor::new();
    let relay = BroadcastRelay::with_acceptor(RelayConfig::default(), acceptor).unwrap();
    relay.start(Arc::new(NoopObserver)).await.unwrap();

    let mut talker = connect(&tx);
    wait_for_connections(&relay, 1).await;

    let joiner = {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut late = Vec::new();
            for _ in 0..20 {
                late.push(connect(&tx));
                tokio::task::yield_now().await;
            }
            late
        })
    };
    for i in 0..20 {
        talker.send(format!("line-{}", i)).await.unwrap();
    }
    let late = joiner.await.unwrap();

    // The talker sees all of its own lines exactly once, in order.
    for i in 0..20 {
        assert_eq!(recv(&mut talker).await, format!("line-{}", i));
    }
    wait_for_connections(&relay, 21).await;
    drop(late);

    relay.shutdown().await.unwrap();
}
