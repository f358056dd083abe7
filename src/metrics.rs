// knhk-registry: Metrics collection

#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters snapshot, cloned out of the collector for reporting.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub publishes: u64,
    pub unpublishes: u64,
    pub subscribes: u64,
    pub pushes_sent: u64,
    pub pushes_acked: u64,
    pub pushes_retransmitted: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub idle_disconnects: u64,
}

/// Registry-wide counters. Plain atomics rather than `Mutex`-guarded
/// structs: every field is an independent monotonic count, so there is no
/// cross-field invariant a lock would need to protect.
#[derive(Default)]
pub struct MetricsCollector {
    publishes: AtomicU64,
    unpublishes: AtomicU64,
    subscribes: AtomicU64,
    pushes_sent: AtomicU64,
    pushes_acked: AtomicU64,
    pushes_retransmitted: AtomicU64,
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    idle_disconnects: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unpublish(&self) {
        self.unpublishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_sent(&self) {
        self.pushes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_acked(&self) {
        self.pushes_acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Scanner resends happen in batches per scan tick, so this takes a
    /// count rather than being called once per message.
    pub fn record_pushes_retransmitted(&self, count: u64) {
        self.pushes_retransmitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_idle_disconnect(&self) {
        self.idle_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            publishes: self.publishes.load(Ordering::Relaxed),
            unpublishes: self.unpublishes.load(Ordering::Relaxed),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            pushes_sent: self.pushes_sent.load(Ordering::Relaxed),
            pushes_acked: self.pushes_acked.load(Ordering::Relaxed),
            pushes_retransmitted: self.pushes_retransmitted.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            idle_disconnects: self.idle_disconnects.load(Ordering::Relaxed),
        }
    }
}
