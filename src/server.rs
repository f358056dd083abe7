//! The registry server: wires the connection lifecycle (connect, read,
//! disconnect) to the provider registry, the broadcast dispatcher, and the
//! per-connection idle checker. `transport::handle_connection` calls back
//! into this one object for every event it sees on the wire.

use crate::ack::AckRetransmitter;
use crate::attachments::{PUBLISH_KEY, SUBSCRIBE_KEY};
use crate::channel::ChannelHandle;
use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::dispatcher::BroadcastDispatcher;
use crate::error::RegistryResult;
use crate::health::{HealthChecker, ACK_SCANNER_COMPONENT, WHEEL_COMPONENT};
use crate::idle::{IdleConfig, IdleKind, IdleStateChecker};
use crate::metrics::MetricsCollector;
use crate::model::{Acknowledge, Message, MessageData, RegisterMeta, ServiceMeta};
use crate::registry_context::RegistryContext;
use crate::timing_wheel::TimingWheel;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Owns every shared subsystem and exposes the handful of entry points the
/// transport layer calls into. One instance per process, shared behind an
/// `Arc` across all connection tasks.
pub struct RegistryServer {
    config: RegistryConfig,
    context: Arc<RegistryContext>,
    dispatcher: BroadcastDispatcher,
    acks: AckRetransmitter,
    wheel: Arc<TimingWheel>,
    clock: Clock,
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthChecker>,
    idle_checkers: DashMap<u64, IdleStateChecker>,
}

impl RegistryServer {
    /// Wire up every subsystem from a loaded config and spawn the
    /// background ack-retransmit scanner. Does not bind a socket; call
    /// `transport::bind_listener`/`run_accept_loop` with the result.
    pub fn bootstrap(config: RegistryConfig) -> Arc<Self> {
        let clock = Clock::new();
        let context = Arc::new(RegistryContext::new());
        let acks = AckRetransmitter::new(clock.clone(), std::time::Duration::from_millis(config.ack.ack_timeout_ms));
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = BroadcastDispatcher::new(context.clone(), acks.clone(), metrics.clone());
        let wheel_tick_interval = std::time::Duration::from_millis(config.wheel.tick_ms);
        let ack_scan_interval = std::time::Duration::from_millis(config.ack.scan_interval_ms);
        let health = Arc::new(HealthChecker::new(wheel_tick_interval, ack_scan_interval));

        // Heartbeat the wheel component from the wheel's own driver tick, so
        // its health reflects whether the wheel is actually advancing rather
        // than some unrelated event.
        let wheel_health = health.clone();
        let wheel = TimingWheel::with_tick_listener(config.wheel.tick_ms, config.wheel.wheel_size, move || {
            wheel_health.heartbeat(WHEEL_COMPONENT);
        });

        let server = Arc::new(Self {
            config,
            context,
            dispatcher,
            acks: acks.clone(),
            wheel,
            clock,
            metrics,
            health: health.clone(),
            idle_checkers: DashMap::new(),
        });

        let scanner_ctx = server.context.clone();
        let scanner_health = health;
        let scanner_metrics = server.metrics.clone();
        let scan_interval = std::time::Duration::from_millis(server.config.ack.scan_interval_ms);
        let is_current = move |m: &Message| match &m.data {
            MessageData::Push(service, _) => scanner_ctx.current(service).version <= m.version,
            _ => true,
        };
        let scanner_acks = acks;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_interval);
            loop {
                ticker.tick().await;
                let resent = scanner_acks.scan_once(&is_current);
                scanner_health.heartbeat(ACK_SCANNER_COMPONENT);
                if resent > 0 {
                    scanner_metrics.record_pushes_retransmitted(resent as u64);
                    tracing::debug!(resent, "ack scanner resent unacknowledged pushes");
                }
            }
        });

        server
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    /// Called once a connection's channel and framed stream are ready.
    /// Installs the idle checker configured from the server's idle section.
    pub fn on_connect(&self, channel: &ChannelHandle) {
        self.metrics.record_connection_accepted();

        let idle_config = IdleConfig {
            reader_idle: self.config.reader_idle(),
            writer_idle: self.config.writer_idle(),
            all_idle: self.config.all_idle(),
        };
        let closed = Arc::new(AtomicBool::new(false));
        let channel_for_idle = channel.clone();
        let metrics = self.metrics.clone();
        let checker = IdleStateChecker::new(self.wheel.clone(), self.clock.clone(), idle_config, closed, move |kind| {
            if matches!(kind, IdleKind::FirstReaderIdle | IdleKind::ReaderIdle | IdleKind::FirstAllIdle | IdleKind::AllIdle) {
                tracing::debug!(channel = channel_for_idle.id(), ?kind, "idle timeout, closing connection");
                metrics.record_idle_disconnect();
                channel_for_idle.request_close();
            }
            Ok(())
        });
        checker.initialize();
        self.idle_checkers.insert(channel.id(), checker);
    }

    /// Called after every inbound frame, including heartbeats, to reset the
    /// reader-idle deadline.
    pub fn on_read(&self, channel: &ChannelHandle) {
        if let Some(checker) = self.idle_checkers.get(&channel.id()) {
            checker.on_read();
        }
    }

    /// Called after every outbound frame write *completes* (not merely gets
    /// issued), to reset the writer/all-idle deadline.
    pub fn on_write_complete(&self, channel: &ChannelHandle) {
        if let Some(checker) = self.idle_checkers.get(&channel.id()) {
            checker.on_write_complete();
        }
    }

    /// Called once the connection's read loop has exited, for any reason.
    pub fn on_disconnect(&self, channel: &ChannelHandle) {
        self.metrics.record_connection_closed();
        if let Some((_, checker)) = self.idle_checkers.remove(&channel.id()) {
            checker.destroy();
        }
        self.acks.clear_channel(channel.id());
        self.channel_inactive(channel);
    }

    /// Unwind everything this connection published and subscribed to over
    /// its lifetime, so a dropped connection doesn't leave stale providers
    /// or a dangling subscriber behind.
    fn channel_inactive(&self, channel: &ChannelHandle) {
        if let Some(published) = channel.attachments().get(&PUBLISH_KEY) {
            let metas: Vec<RegisterMeta> = published.lock().iter().cloned().collect();
            for meta in metas {
                let (snapshot, changed) = self.context.unpublish(&meta);
                if !changed {
                    continue;
                }
                self.metrics.record_unpublish();
                self.dispatcher.broadcast(&meta.service, snapshot.version, &snapshot.value);
            }
        }
        if let Some(subscribed) = channel.attachments().get(&SUBSCRIBE_KEY) {
            let services: Vec<ServiceMeta> = subscribed.lock().iter().cloned().collect();
            for service in services {
                self.context.remove_subscriber(&service, channel);
            }
        }
    }

    /// Route one decoded inbound message to its handler.
    pub async fn dispatch_inbound(&self, channel: &ChannelHandle, message: Message) -> RegistryResult<()> {
        match message.data {
            MessageData::Publish(meta) => self.handle_publish(channel, meta),
            MessageData::UnPublish(meta) => self.handle_unpublish(channel, meta),
            MessageData::Subscribe(service) => self.handle_subscribe(channel, service),
            MessageData::Push(..) => {
                tracing::warn!(channel = channel.id(), "ignoring client-sent push frame");
                Ok(())
            }
        }
    }

    fn handle_publish(&self, channel: &ChannelHandle, mut meta: RegisterMeta) -> RegistryResult<()> {
        self.backfill_host(channel, &mut meta)?;
        let tracked = channel.attachments().set_if_absent(&PUBLISH_KEY, Mutex::new(HashSet::new()));
        tracked.lock().insert(meta.clone());

        let (snapshot, changed) = self.context.publish(meta.clone());
        if !changed {
            return Ok(());
        }
        self.metrics.record_publish();
        self.dispatcher.broadcast(&meta.service, snapshot.version, &snapshot.value);
        Ok(())
    }

    fn handle_unpublish(&self, channel: &ChannelHandle, mut meta: RegisterMeta) -> RegistryResult<()> {
        self.backfill_host(channel, &mut meta)?;
        if let Some(tracked) = channel.attachments().get(&PUBLISH_KEY) {
            tracked.lock().remove(&meta);
        }

        let (snapshot, changed) = self.context.unpublish(&meta);
        if !changed {
            return Ok(());
        }
        self.metrics.record_unpublish();
        self.dispatcher.broadcast(&meta.service, snapshot.version, &snapshot.value);
        Ok(())
    }

    fn handle_subscribe(&self, channel: &ChannelHandle, service: ServiceMeta) -> RegistryResult<()> {
        let tracked = channel.attachments().set_if_absent(&SUBSCRIBE_KEY, Mutex::new(HashSet::new()));
        tracked.lock().insert(service.clone());

        let snapshot = self.context.current(&service);
        if !snapshot.value.is_empty() {
            self.dispatcher.push_to_channel(channel, &service, snapshot.version, &snapshot.value);
        }

        self.context.subscribers(&service).add(channel.clone());
        self.metrics.record_subscribe();
        Ok(())
    }

    pub fn handle_acknowledge(&self, channel: &ChannelHandle, ack: Acknowledge) {
        if self.acks.acknowledge(channel.id(), ack.sequence) {
            self.metrics.record_push_acked();
        }
    }

    /// Clients that don't know their own externally-visible address publish
    /// with an empty host; fill it in from the peer socket address rather
    /// than trusting a possibly-unreachable self-report.
    fn backfill_host(&self, channel: &ChannelHandle, meta: &mut RegisterMeta) -> RegistryResult<()> {
        if meta.address.is_host_empty() {
            meta.address = meta.address.with_host(channel.remote_addr().ip());
        }
        Ok(())
    }
}
