// tests/registry_invariants_test.rs
// Property tests driving RegistryContext/RegistryServer through randomized
// publish/unpublish/subscribe sequences, checking R1/R2/R3/R7 hold at every
// quiescent point rather than just the hand-scripted scenarios in the other
// integration tests.

use knhk_registry::channel::ChannelHandle;
use knhk_registry::codec::OutboundFrame;
use knhk_registry::config::RegistryConfig;
use knhk_registry::model::{Address, Message, MessageData, RegisterMeta, ServiceMeta};
use knhk_registry::registry_context::RegistryContext;
use knhk_registry::server::RegistryServer;
use proptest::prelude::*;
use tokio::sync::mpsc;

fn connected_channel(addr: &str) -> (ChannelHandle, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(16);
    (ChannelHandle::new(addr.parse().unwrap(), tx), rx)
}

fn decode_push(frame: OutboundFrame) -> (u64, i64, Vec<RegisterMeta>) {
    let message: Message = bincode::deserialize(&frame.body).unwrap();
    match message.data {
        MessageData::Push(_service, providers) => (message.sequence, message.version, providers),
        other => panic!("expected a push frame, got {other:?}"),
    }
}

fn fast_scan_config() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.ack.scan_interval_ms = 50;
    config.ack.ack_timeout_ms = 200;
    config
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

#[derive(Debug, Clone, Copy)]
enum ContextOp {
    Publish { service_idx: usize, address_idx: usize },
    Unpublish { service_idx: usize, address_idx: usize },
}

fn context_op() -> impl Strategy<Value = ContextOp> {
    prop_oneof![
        (0usize..3, 0usize..3).prop_map(|(service_idx, address_idx)| ContextOp::Publish { service_idx, address_idx }),
        (0usize..3, 0usize..3).prop_map(|(service_idx, address_idx)| ContextOp::Unpublish { service_idx, address_idx }),
    ]
}

proptest! {
    /// R1: `providers` and `service_meta` stay each other's inverse after
    /// every operation, regardless of interleaving or repetition.
    #[test]
    fn r1_inverse_map_stays_consistent(ops in prop::collection::vec(context_op(), 0..60)) {
        let ctx = RegistryContext::new();
        let services: Vec<ServiceMeta> = (0..3).map(|i| ServiceMeta::new("g", format!("svc{i}"), "1.0.0")).collect();
        let addresses: Vec<Address> = (0..3).map(|i| Address::new(format!("10.0.0.{i}"), 9000)).collect();

        for op in ops {
            match op {
                ContextOp::Publish { service_idx, address_idx } => {
                    let meta = RegisterMeta::new(services[service_idx].clone(), addresses[address_idx].clone());
                    ctx.publish(meta);
                }
                ContextOp::Unpublish { service_idx, address_idx } => {
                    let meta = RegisterMeta::new(services[service_idx].clone(), addresses[address_idx].clone());
                    ctx.unpublish(&meta);
                }
            }
            prop_assert!(ctx.check_inverse_invariant());
        }
    }
}

proptest! {
    /// R3: republishing an already-present `(service, address)` identity is
    /// always a no-op, no matter how many times or with what attribute
    /// values it's repeated — exactly one of the calls actually changes
    /// anything.
    #[test]
    fn r3_republishing_the_same_identity_never_changes_after_the_first(
        weights in prop::collection::vec(0i32..100, 1..20)
    ) {
        let ctx = RegistryContext::new();
        let service = ServiceMeta::new("g", "svc", "1.0.0");
        let address = Address::new("10.0.0.1", 9000);

        let mut changed_count = 0;
        for weight in weights {
            let mut meta = RegisterMeta::new(service.clone(), address.clone());
            meta.weight = weight;
            let (_, changed) = ctx.publish(meta);
            if changed {
                changed_count += 1;
            }
        }

        prop_assert_eq!(changed_count, 1);
        let snapshot = ctx.current(&service);
        prop_assert_eq!(snapshot.version, 1);
        prop_assert_eq!(snapshot.value.len(), 1);
    }
}

#[derive(Debug, Clone, Copy)]
enum ServerOp {
    Publish(usize),
    Unpublish(usize),
}

fn server_op() -> impl Strategy<Value = ServerOp> {
    prop_oneof![(0usize..4).prop_map(ServerOp::Publish), (0usize..4).prop_map(ServerOp::Unpublish),]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    /// R2: a single subscriber's observed push versions strictly increase,
    /// for any interleaving of publish/unpublish across several providers of
    /// the same service.
    #[test]
    fn r2_subscriber_observes_strictly_increasing_versions(ops in prop::collection::vec(server_op(), 0..40)) {
        let rt = paused_runtime();
        rt.block_on(async {
            // Freeze the clock so the background ack-scanner never ticks mid-test;
            // a stray retransmit of an already-observed version would otherwise
            // make the "strictly increasing" assertion flaky under real time.
            tokio::time::pause();
            let server = RegistryServer::bootstrap(fast_scan_config());
            let service = ServiceMeta::new("g", "svc", "1.0.0");

            let (subscriber, mut sub_rx) = connected_channel("10.0.0.9:9000");
            server.on_connect(&subscriber);
            server.dispatch_inbound(&subscriber, Message::subscribe(1, service.clone())).await.unwrap();

            let providers: Vec<ChannelHandle> = (0..4)
                .map(|i| {
                    let (provider, _rx) = connected_channel(&format!("10.0.0.{i}:9000"));
                    server.on_connect(&provider);
                    provider
                })
                .collect();

            let mut last_version = 0i64;
            let mut sequence = 2u64;
            for op in ops {
                let (provider_idx, message) = match op {
                    ServerOp::Publish(i) => {
                        let meta = RegisterMeta::new(service.clone(), Address::new(format!("10.0.0.{i}"), 9000));
                        (i, Message::publish(sequence, meta))
                    }
                    ServerOp::Unpublish(i) => {
                        let meta = RegisterMeta::new(service.clone(), Address::new(format!("10.0.0.{i}"), 9000));
                        (i, Message::unpublish(sequence, meta))
                    }
                };
                sequence += 1;
                server.dispatch_inbound(&providers[provider_idx], message).await.unwrap();

                while let Ok(frame) = sub_rx.try_recv() {
                    let (_, version, _) = decode_push(frame);
                    assert!(version > last_version, "version must strictly increase: {version} did not exceed {last_version}");
                    last_version = version;
                }
            }
        });
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]
    /// R7: once a push is superseded by a newer publish, the scanner resends
    /// only the current version — it never retransmits a stale pending one,
    /// for any number of publishes piling up before the ack timeout fires.
    #[test]
    fn r7_only_the_current_version_is_retransmitted(num_publishes in 1usize..6) {
        let rt = paused_runtime();
        rt.block_on(async {
            tokio::time::pause();
            let server = RegistryServer::bootstrap(fast_scan_config());
            let service = ServiceMeta::new("g", "svc", "1.0.0");

            let (subscriber, mut sub_rx) = connected_channel("10.0.0.9:9000");
            server.on_connect(&subscriber);
            server.dispatch_inbound(&subscriber, Message::subscribe(1, service.clone())).await.unwrap();

            let mut last_version = 0i64;
            for i in 0..num_publishes {
                let (provider, _rx) = connected_channel(&format!("10.0.0.{i}:9000"));
                server.on_connect(&provider);
                let meta = RegisterMeta::new(service.clone(), Address::new(format!("10.0.0.{i}"), 9000));
                server.dispatch_inbound(&provider, Message::publish((i + 2) as u64, meta)).await.unwrap();

                let frame = sub_rx.try_recv().expect("fan-out push for each publish");
                let (_, version, _) = decode_push(frame);
                last_version = version;
            }

            tokio::time::advance(std::time::Duration::from_millis(250)).await;
            tokio::task::yield_now().await;

            let resend = sub_rx.try_recv().expect("scanner resends the unacked push");
            let (_, resent_version, _) = decode_push(resend);
            assert_eq!(resent_version, last_version);
            assert!(sub_rx.try_recv().is_err(), "only the current version is ever resent, never a stale earlier one");
        });
    }
}
