//! Per-connection handle: identity, egress queue, and attachments. One
//! `ChannelHandle` is created per accepted socket and shared (via `Arc`)
//! between the connection's read/write tasks and the registry's channel
//! groups.

use crate::attachments::AttributeMap;
use crate::codec::OutboundFrame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A connected peer. Cheap to clone (it's an `Arc` wrapper); identity and
/// equality are by `id`.
#[derive(Clone)]
pub struct ChannelHandle(Arc<Inner>);

struct Inner {
    id: u64,
    remote_addr: SocketAddr,
    egress: mpsc::Sender<OutboundFrame>,
    active: AtomicBool,
    attachments: AttributeMap,
    close_signal: Notify,
}

impl ChannelHandle {
    /// `egress` is the sender half of the channel drained by this
    /// connection's write task; sending here never blocks the registry's
    /// critical sections (the spec's "non-blocking enqueue" requirement).
    pub fn new(remote_addr: SocketAddr, egress: mpsc::Sender<OutboundFrame>) -> Self {
        Self(Arc::new(Inner {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            egress,
            active: AtomicBool::new(true),
            attachments: AttributeMap::new(),
            close_signal: Notify::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_addr
    }

    pub fn is_active(&self) -> bool {
        self.0.active.load(Ordering::Acquire)
    }

    pub fn mark_inactive(&self) {
        self.0.active.store(false, Ordering::Release);
    }

    /// Request this connection's read loop wake up and close, e.g. after an
    /// idle timeout. Idempotent: closing an already-inactive channel is a
    /// no-op beyond waking any waiter.
    pub fn request_close(&self) {
        self.mark_inactive();
        self.0.close_signal.notify_one();
    }

    /// Resolves once `request_close` has been called.
    pub async fn closed(&self) {
        if !self.is_active() {
            return;
        }
        self.0.close_signal.notified().await;
    }

    pub fn attachments(&self) -> &AttributeMap {
        &self.0.attachments
    }

    /// Enqueue a frame for this connection's write task. Returns an error
    /// if the connection has already closed; never blocks.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), mpsc::error::TrySendError<OutboundFrame>> {
        self.0.egress.try_send(frame)
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for ChannelHandle {}

impl std::hash::Hash for ChannelHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.0.id)
            .field("remote_addr", &self.0.remote_addr)
            .field("active", &self.is_active())
            .finish()
    }
}
