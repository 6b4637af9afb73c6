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

//! Lock-free metrics for the broadcast relay
//!
//! Every update is recorded twice: in local atomics, so callers can take a
//! [`MetricsSnapshot`] without an exporter, and through the `metrics` facade
//! under the `linerelay.*` namespace for whichever recorder the process installs.

use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free relay metrics
#[derive(Debug)]
pub struct RelayMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    closed_connections: AtomicU64,
    rejected_connections: AtomicU64,

    // Throughput
    lines_received: AtomicU64,
    lines_delivered: AtomicU64,
    broadcasts: AtomicU64,

    // Faults
    read_faults: AtomicU64,
    write_faults: AtomicU64,
    accept_errors: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,

    started_at: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            lines_delivered: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            read_faults: AtomicU64::new(0),
            write_faults: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Record a connection entering the live set
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.connections.total").increment(1);
        gauge!("linerelay.connections.active").increment(1.0);
    }

    /// Record a connection leaving the live set
    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connection_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        gauge!("linerelay.connections.active").decrement(1.0);
        histogram!("linerelay.connection.duration").record(duration.as_secs_f64());
    }

    /// Record a connection dropped by the capacity policy
    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.connections.rejected").increment(1);
    }

    /// Get the current number of live connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of connections since start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    // Throughput tracking

    /// Record a line read from a client
    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.lines.received").increment(1);
    }

    /// Record a completed broadcast and how many targets accepted the line
    pub fn broadcast_completed(&self, delivered: u64, elapsed: Duration) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.lines_delivered.fetch_add(delivered, Ordering::Relaxed);
        counter!("linerelay.broadcasts").increment(1);
        counter!("linerelay.lines.delivered").increment(delivered);
        histogram!("linerelay.broadcast.duration").record(elapsed.as_secs_f64());
    }

    // Fault tracking

    /// Record a session ending on a read fault
    pub fn read_fault(&self) {
        self.read_faults.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.faults.read").increment(1);
    }

    /// Record a target evicted by a write fault
    pub fn write_fault(&self) {
        self.write_faults.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.faults.write").increment(1);
    }

    /// Record a transient accept error
    pub fn accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
        counter!("linerelay.faults.accept").increment(1);
    }

    // Snapshot

    /// Get a point-in-time view of all metrics
    ///
    /// Counters are read individually, so a snapshot taken under load may be
    /// slightly skewed between fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            lines_delivered: self.lines_delivered.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            read_faults: self.read_faults.load(Ordering::Relaxed),
            write_faults: self.write_faults.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    fn average_connection_duration(&self) -> Duration {
        // Derived from its own counter; total and active move independently.
        let closed = self.closed_connections.load(Ordering::Relaxed);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// A snapshot of relay metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total connections since start
    pub total_connections: u64,
    /// Current live connections
    pub active_connections: u64,
    /// Connections dropped by the capacity policy
    pub rejected_connections: u64,
    /// Lines read from clients
    pub lines_received: u64,
    /// Lines written to clients
    pub lines_delivered: u64,
    /// Broadcast invocations
    pub broadcasts: u64,
    /// Sessions ended by a read fault
    pub read_faults: u64,
    /// Targets evicted by a write fault
    pub write_faults: u64,
    /// Transient accept errors
    pub accept_errors: u64,
    /// Relay uptime
    pub uptime: Duration,
    /// Average lifetime of closed connections
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate total fault count
    pub fn total_faults(&self) -> u64 {
        self.read_faults + self.write_faults + self.accept_errors
    }

    /// Average number of targets reached per broadcast
    pub fn average_fan_out(&self) -> f64 {
        if self.broadcasts == 0 {
            return 0.0;
        }
        self.lines_delivered as f64 / self.broadcasts as f64
    }
}
