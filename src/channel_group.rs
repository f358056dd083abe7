//! Copy-on-write round-robin selector over a service's subscriber
//! connections, the Rust analogue of the Java source's `Unsafe`-backed
//! array-swap channel group: reads never take a lock, writers replace the
//! whole backing `Vec` atomically.

use crate::channel::ChannelHandle;
use crate::error::ChannelGroupError;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// All channels currently subscribed to one service, selected round-robin.
pub struct ChannelGroup {
    label: String,
    channels: ArcSwap<Vec<ChannelHandle>>,
    cursor: AtomicUsize,
}

impl ChannelGroup {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channels: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent: adding an already-present channel (by id) is a no-op.
    pub fn add(&self, channel: ChannelHandle) {
        self.channels.rcu(|current| {
            if current.iter().any(|c| c.id() == channel.id()) {
                current.clone()
            } else {
                let mut next = (**current).clone();
                next.push(channel.clone());
                std::sync::Arc::new(next)
            }
        });
    }

    pub fn remove(&self, channel: &ChannelHandle) {
        self.channels.rcu(|current| {
            let mut next = (**current).clone();
            next.retain(|c| c.id() != channel.id());
            std::sync::Arc::new(next)
        });
    }

    /// Snapshot of all member channels, for broadcast fan-out.
    pub fn snapshot(&self) -> Vec<ChannelHandle> {
        (**self.channels.load()).clone()
    }

    /// One round through the current snapshot looking for a live channel,
    /// without waiting. `None` if the group is empty or every member is
    /// inactive.
    fn try_next(&self) -> Option<ChannelHandle> {
        let snapshot = self.channels.load();
        let len = snapshot.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &snapshot[idx];
            if candidate.is_active() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Select the next live channel round-robin. Skips channels observed
    /// inactive (a disconnect raced ahead of its `remove()`) without
    /// advancing past the whole group more than once. If the group is
    /// momentarily empty (a fresh connection is still being established),
    /// waits with escalating backoff across three observations before
    /// giving up.
    pub async fn next(&self) -> Result<ChannelHandle, ChannelGroupError> {
        for attempt in 1u32..=3 {
            if let Some(channel) = self.try_next() {
                return Ok(channel);
            }
            if attempt == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
        }
        Err(ChannelGroupError::NoChannelAvailable(self.label.clone()))
    }
}
