//! At-least-once delivery for server pushes. Every push that requires an ack
//! is registered here; a scanner task resends anything still unacknowledged
//! after the timeout. Resends replay the original `Message` unchanged — a
//! wrapper or re-derived frame would drift from what the client actually
//! missed.

use crate::channel::ChannelHandle;
use crate::clock::Clock;
use crate::codec::OutboundFrame;
use crate::model::Message;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct PendingEntry {
    channel: ChannelHandle,
    message: Message,
    sent_at_ms: i64,
}

/// Keyed by `(channel id, sequence)`: the same sequence number can be
/// in-flight to multiple channels at once (e.g. a fan-out push).
type Key = (u64, u64);

/// Tracks unacknowledged pushes and resends them on a timer. Construct one
/// per server and share it (it's cheap to clone) between the handler that
/// registers pushes and the scanner task.
#[derive(Clone)]
pub struct AckRetransmitter {
    pending: Arc<DashMap<Key, PendingEntry>>,
    clock: Clock,
    ack_timeout_ms: i64,
}

impl AckRetransmitter {
    pub fn new(clock: Clock, ack_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            clock,
            ack_timeout_ms: ack_timeout.as_millis() as i64,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record that `message` was just sent to `channel` and needs an ack.
    pub fn register(&self, channel: ChannelHandle, message: Message) {
        let key = (channel.id(), message.sequence);
        self.pending.insert(key, PendingEntry { channel, message, sent_at_ms: self.clock.now_ms() });
    }

    /// Clear a pending entry on ack receipt. Returns `true` if one was
    /// outstanding (a second or late ack for the same sequence is a no-op).
    pub fn acknowledge(&self, channel_id: u64, sequence: u64) -> bool {
        self.pending.remove(&(channel_id, sequence)).is_some()
    }

    /// Drop all pending entries for a channel, called on disconnect so a
    /// dead connection's unacked pushes don't linger forever.
    pub fn clear_channel(&self, channel_id: u64) {
        self.pending.retain(|(id, _), _| *id != channel_id);
    }

    /// One scan pass: resend anything older than the ack timeout. `is_current`
    /// lets the caller drop entries superseded by a newer version (the stale
    /// push itself is discarded rather than retransmitted) instead of
    /// retransmitting something a client no longer needs. Returns the number
    /// of messages actually resent.
    pub fn scan_once(&self, is_current: impl Fn(&Message) -> bool) -> usize {
        let now = self.clock.now_ms();
        let mut resent = 0;
        let mut stale_keys = Vec::new();

        for mut entry in self.pending.iter_mut() {
            if now - entry.sent_at_ms < self.ack_timeout_ms {
                continue;
            }
            if !is_current(&entry.message) {
                stale_keys.push(*entry.key());
                continue;
            }
            if !entry.channel.is_active() {
                stale_keys.push(*entry.key());
                continue;
            }
            if let Ok(frame) = OutboundFrame::for_message(&entry.message) {
                match entry.channel.try_send(frame) {
                    Ok(()) => {
                        entry.sent_at_ms = now;
                        resent += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale_keys.push(*entry.key());
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Egress queue momentarily saturated, not a dead
                        // connection. Leave the entry in place; the next
                        // scan will try again.
                    }
                }
            }
        }
        for key in stale_keys {
            self.pending.remove(&key);
        }
        resent
    }

    /// Spawn the periodic scanner. Aborts when the returned handle is
    /// dropped and aborted, or the process exits.
    pub fn spawn_scanner(
        self,
        interval: Duration,
        is_current: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let resent = self.scan_once(&is_current);
                if resent > 0 {
                    tracing::debug!(resent, "ack scanner resent unacknowledged pushes");
                }
            }
        })
    }
}
