//! Fan-out of provider-list changes to every subscriber of a service. A
//! publish or unpublish calls `broadcast`; each live subscriber gets its own
//! sequence number and ack-tracked push so a slow or disconnecting
//! subscriber can't stall delivery to the rest of the group.

use crate::ack::AckRetransmitter;
use crate::channel::ChannelHandle;
use crate::codec::OutboundFrame;
use crate::metrics::MetricsCollector;
use crate::model::{Message, RegisterMeta, ServiceMeta};
use crate::registry_context::RegistryContext;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Which stage of delivery a push has reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvokeState {
    Pending,
    Sent,
}

/// Tracks one push's delivery lifecycle from issuance to egress-queue
/// acceptance. Cheap to clone; every clone observes the same transition.
/// Distinct from ack tracking (`AckRetransmitter`), which covers the longer
/// pending-until-acknowledged window — this future only covers the write
/// itself.
#[derive(Clone)]
pub struct InvokeFuture {
    state: Arc<AtomicU8>,
}

impl InvokeFuture {
    fn pending() -> Self {
        Self { state: Arc::new(AtomicU8::new(InvokeState::Pending as u8)) }
    }

    fn mark_sent(&self) {
        self.state.store(InvokeState::Sent as u8, Ordering::Release);
    }

    pub fn state(&self) -> InvokeState {
        if self.state.load(Ordering::Acquire) == InvokeState::Sent as u8 {
            InvokeState::Sent
        } else {
            InvokeState::Pending
        }
    }

    pub fn is_sent(&self) -> bool {
        self.state() == InvokeState::Sent
    }
}

type BeforeSendHook = dyn Fn(&Message) + Send + Sync;

/// Pushes provider snapshots to subscribers and registers each push with
/// the ack-retransmitter so it's retried until acknowledged. Every push's
/// `InvokeFuture` transitions `Pending → Sent` once the egress-queue write
/// succeeds, and any registered before-send hooks run at that point, before
/// ack-tracking begins.
pub struct BroadcastDispatcher {
    registry: Arc<RegistryContext>,
    acks: AckRetransmitter,
    metrics: Arc<MetricsCollector>,
    next_sequence: AtomicU64,
    before_send_hooks: Vec<Arc<BeforeSendHook>>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<RegistryContext>, acks: AckRetransmitter, metrics: Arc<MetricsCollector>) -> Self {
        Self { registry, acks, metrics, next_sequence: AtomicU64::new(1), before_send_hooks: Vec::new() }
    }

    /// Register a hook invoked with every message as its `InvokeFuture`
    /// transitions to `Sent`, mirroring the source's "before(request) hooks"
    /// fired from the send-success listener.
    pub fn with_before_send_hook(mut self, hook: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.before_send_hooks.push(Arc::new(hook));
        self
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Push `version`/`providers` to every channel currently subscribed to
    /// `service`. Channels observed inactive are skipped; the subscriber
    /// list itself is pruned on disconnect, not here.
    pub fn broadcast(&self, service: &ServiceMeta, version: i64, providers: &[RegisterMeta]) {
        let group = self.registry.subscribers(service);
        let subscribers = group.snapshot();
        if subscribers.is_empty() {
            return;
        }
        for channel in subscribers {
            if !channel.is_active() {
                continue;
            }
            self.push_to_channel(&channel, service, version, providers);
        }
    }

    /// Push to exactly one channel, e.g. the initial snapshot sent in
    /// response to a subscribe before the channel is added to the group.
    /// Returns the push's `InvokeFuture`, `Sent` if the egress-queue write
    /// succeeded and still `Pending` otherwise (queue closed or encode
    /// failure).
    pub fn push_to_channel(&self, channel: &ChannelHandle, service: &ServiceMeta, version: i64, providers: &[RegisterMeta]) -> InvokeFuture {
        let future = InvokeFuture::pending();
        let message = Message::push(self.next_sequence(), version, service.clone(), providers.to_vec());
        match OutboundFrame::for_message(&message) {
            Ok(frame) => {
                if channel.try_send(frame).is_ok() {
                    future.mark_sent();
                    for hook in &self.before_send_hooks {
                        hook(&message);
                    }
                    self.metrics.record_push_sent();
                    self.acks.register(channel.clone(), message);
                } else {
                    tracing::debug!(channel = channel.id(), "push dropped, egress queue closed");
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to encode push frame"),
        }
        future
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::model::Address;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel() -> (ChannelHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (ChannelHandle::new("127.0.0.1:9000".parse().unwrap(), tx), rx)
    }

    #[tokio::test]
    async fn broadcast_pushes_to_every_subscriber() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone(), acks.clone(), metrics);

        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let (a, mut a_rx) = channel();
        let (b, mut b_rx) = channel();
        registry.subscribers(&service).add(a);
        registry.subscribers(&service).add(b);

        let providers = vec![RegisterMeta::new(service.clone(), Address::new("10.0.0.1", 9000))];
        dispatcher.broadcast(&service, 1, &providers);

        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_ok());
        assert_eq!(acks.len(), 2);
        assert_eq!(dispatcher.metrics.snapshot().pushes_sent, 2);
    }

    #[tokio::test]
    async fn broadcast_to_empty_group_is_a_no_op() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone(), acks.clone(), metrics);
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        dispatcher.broadcast(&service, 1, &[]);
        assert_eq!(acks.len(), 0);
    }

    #[tokio::test]
    async fn push_to_channel_transitions_the_invoke_future_to_sent() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(registry, acks, metrics);
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let (channel, mut rx) = channel();

        let future = dispatcher.push_to_channel(&channel, &service, 1, &[]);

        assert_eq!(future.state(), InvokeState::Sent);
        assert!(future.is_sent());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn push_to_channel_leaves_the_future_pending_on_a_closed_queue() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(registry, acks, metrics);
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let (channel, rx) = channel();
        drop(rx);

        let future = dispatcher.push_to_channel(&channel, &service, 1, &[]);

        assert_eq!(future.state(), InvokeState::Pending);
    }

    #[tokio::test]
    async fn before_send_hooks_run_once_the_future_is_sent() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let seen: Arc<std::sync::Mutex<Vec<u64>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let dispatcher = BroadcastDispatcher::new(registry, acks, metrics).with_before_send_hook(move |msg| {
            seen2.lock().unwrap().push(msg.sequence);
        });
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let (channel, _rx) = channel();

        dispatcher.push_to_channel(&channel, &service, 1, &[]);

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inactive_subscribers_are_skipped() {
        let registry = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(Clock::new(), Duration::from_secs(10));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(registry.clone(), acks.clone(), metrics);
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let (a, _a_rx) = channel();
        a.mark_inactive();
        registry.subscribers(&service).add(a);

        dispatcher.broadcast(&service, 1, &[]);
        assert_eq!(acks.len(), 0);
    }
}
