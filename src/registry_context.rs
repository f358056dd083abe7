//! The registry's core state: provider lists and subscriber channel groups,
//! keyed by `ServiceMeta`. Mutations to a service's provider list and its
//! version number happen together under that service's own lock, so a
//! reader fanning out a push always sees a version that matches the
//! providers it is about to serialize.

use crate::channel::ChannelHandle;
use crate::channel_group::ChannelGroup;
use crate::model::{Address, RegisterMeta, ServiceMeta};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// A value paired with the monotonic version that produced it. Readers
/// snapshot both fields together while holding the service lock, so a
/// concurrent writer's bump can never be observed alongside stale providers.
#[derive(Clone, Debug)]
pub struct ConfigWithVersion<T> {
    pub version: i64,
    pub value: T,
}

impl<T> ConfigWithVersion<T> {
    fn new(value: T) -> Self {
        Self { version: 0, value }
    }
}

/// Per-process registry state. Cheap to clone (wraps `Arc`s internally via
/// `DashMap`), so it can be shared across connection tasks directly.
///
/// `providers` (`register_meta` in SPEC_FULL.md §3) and `service_meta` are
/// kept as each other's inverse: every `(service, address)` pair present in
/// one is present in the other (invariant R1), maintained by updating both
/// under the same per-service lock in `publish`/`unpublish`.
#[derive(Default)]
pub struct RegistryContext {
    providers: DashMap<ServiceMeta, ConfigWithVersion<Vec<RegisterMeta>>>,
    service_meta: DashMap<Address, HashSet<ServiceMeta>>,
    subscribers: DashMap<ServiceMeta, Arc<ChannelGroup>>,
    locks: DashMap<ServiceMeta, Arc<Mutex<()>>>,
}

impl RegistryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily creates a service's lock on first use. `entry().or_insert_with`
    /// keeps the creation itself race-free without a second global lock.
    fn service_lock(&self, service: &ServiceMeta) -> Arc<Mutex<()>> {
        self.locks.entry(service.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn subscribers(&self, service: &ServiceMeta) -> Arc<ChannelGroup> {
        self.subscribers
            .entry(service.clone())
            .or_insert_with(|| Arc::new(ChannelGroup::new(service.to_string())))
            .clone()
    }

    /// Current providers and version for a service, or an empty snapshot at
    /// version 0 if nothing has published yet.
    pub fn current(&self, service: &ServiceMeta) -> ConfigWithVersion<Vec<RegisterMeta>> {
        self.providers.get(service).map(|e| e.clone()).unwrap_or_else(|| ConfigWithVersion::new(Vec::new()))
    }

    /// Add `meta` to its service's provider list if its `(service, address)`
    /// identity isn't already present, matching the source's
    /// `putIfAbsent`-then-only-bump-on-success contract: publishing an
    /// already-present address is a no-op, not an update. Returns the
    /// snapshot the caller should fan out, and whether this call actually
    /// changed anything (bump + fan-out only happen when it did).
    pub fn publish(&self, meta: RegisterMeta) -> (ConfigWithVersion<Vec<RegisterMeta>>, bool) {
        let lock = self.service_lock(&meta.service);
        let _guard = lock.lock();

        let mut entry = self.providers.entry(meta.service.clone()).or_insert_with(|| ConfigWithVersion::new(Vec::new()));
        if entry.value.iter().any(|p| p.address == meta.address) {
            return (entry.clone(), false);
        }
        self.service_meta.entry(meta.address.clone()).or_default().insert(meta.service.clone());
        entry.value.push(meta);
        entry.version += 1;
        (entry.clone(), true)
    }

    /// Remove a provider by `(service, address)` identity and bump the
    /// version. No-op (but still returns the current snapshot) if the
    /// provider was already absent — mirrors `publish`'s changed flag so the
    /// caller only fans out when something actually changed.
    pub fn unpublish(&self, meta: &RegisterMeta) -> (ConfigWithVersion<Vec<RegisterMeta>>, bool) {
        let lock = self.service_lock(&meta.service);
        let _guard = lock.lock();

        let mut entry = self.providers.entry(meta.service.clone()).or_insert_with(|| ConfigWithVersion::new(Vec::new()));
        let before = entry.value.len();
        entry.value.retain(|p| p.address != meta.address);
        let changed = entry.value.len() != before;
        if changed {
            entry.version += 1;
            self.remove_from_inverse(&meta.address, &meta.service);
        }
        (entry.clone(), changed)
    }

    /// Drop `service` from `address`'s inverse entry, removing the entry
    /// entirely once it's empty rather than leaving an orphaned empty set.
    fn remove_from_inverse(&self, address: &Address, service: &ServiceMeta) {
        if let Some(mut services) = self.service_meta.get_mut(address) {
            services.remove(service);
            if services.is_empty() {
                drop(services);
                self.service_meta.remove(address);
            }
        }
    }

    /// The services currently published at `address` (§3's `service_meta`
    /// inverse lookup).
    pub fn services_for_address(&self, address: &Address) -> HashSet<ServiceMeta> {
        self.service_meta.get(address).map(|s| s.clone()).unwrap_or_default()
    }

    /// R1: every `(service, address)` in `providers` has a matching entry in
    /// `service_meta`, and vice versa. Used by tests, not production code.
    pub fn check_inverse_invariant(&self) -> bool {
        for entry in self.providers.iter() {
            let service = entry.key();
            for provider in entry.value.iter() {
                if !self.service_meta.get(&provider.address).map(|s| s.contains(service)).unwrap_or(false) {
                    return false;
                }
            }
        }
        for entry in self.service_meta.iter() {
            let address = entry.key();
            for service in entry.iter() {
                let published = self.providers.get(service).map(|p| p.value.iter().any(|r| &r.address == address)).unwrap_or(false);
                if !published {
                    return false;
                }
            }
        }
        true
    }

    /// Remove every provider registered at `address` across all services,
    /// used when a publishing connection drops without a clean unpublish.
    /// Returns the services that actually changed, with their new
    /// snapshots, so the caller can push updates only where needed.
    pub fn unpublish_all_at(&self, services: &[ServiceMeta], address: &crate::model::Address) -> Vec<(ServiceMeta, ConfigWithVersion<Vec<RegisterMeta>>)> {
        let mut changed = Vec::new();
        for service in services {
            let lock = self.service_lock(service);
            let _guard = lock.lock();
            if let Some(mut entry) = self.providers.get_mut(service) {
                let before = entry.value.len();
                entry.value.retain(|p| &p.address != address);
                if entry.value.len() != before {
                    entry.version += 1;
                    self.remove_from_inverse(address, service);
                    changed.push((service.clone(), entry.clone()));
                }
            }
        }
        changed
    }

    pub fn remove_subscriber(&self, service: &ServiceMeta, channel: &ChannelHandle) {
        if let Some(group) = self.subscribers.get(service) {
            group.remove(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Address;

    fn meta(group: &str, svc: &str, port: u16) -> RegisterMeta {
        RegisterMeta::new(ServiceMeta::new(group, svc, "1.0.0"), Address::new("10.0.0.1", port))
    }

    #[test]
    fn publish_bumps_version_and_stores_the_provider() {
        let ctx = RegistryContext::new();
        let (snapshot, changed) = ctx.publish(meta("g", "svc", 9000));
        assert!(changed);
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.value.len(), 1);
    }

    #[test]
    fn republishing_the_same_address_is_a_no_op() {
        let ctx = RegistryContext::new();
        ctx.publish(meta("g", "svc", 9000));
        let mut repeat = meta("g", "svc", 9000);
        repeat.weight = 5;
        let (snapshot, changed) = ctx.publish(repeat);
        assert!(!changed);
        assert_eq!(snapshot.value.len(), 1);
        assert_eq!(snapshot.value[0].weight, 0);
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn unpublish_removes_and_bumps_version() {
        let ctx = RegistryContext::new();
        let m = meta("g", "svc", 9000);
        ctx.publish(m.clone());
        let (snapshot, changed) = ctx.unpublish(&m);
        assert!(changed);
        assert!(snapshot.value.is_empty());
        assert_eq!(snapshot.version, 2);
    }

    #[test]
    fn unpublish_of_absent_provider_does_not_bump_version() {
        let ctx = RegistryContext::new();
        let m = meta("g", "svc", 9000);
        let (snapshot, changed) = ctx.unpublish(&m);
        assert!(!changed);
        assert_eq!(snapshot.version, 0);
    }

    #[test]
    fn publish_populates_the_inverse_service_meta_map() {
        let ctx = RegistryContext::new();
        let m = meta("g", "svc", 9000);
        ctx.publish(m.clone());
        assert_eq!(ctx.services_for_address(&m.address), HashSet::from([m.service.clone()]));
        assert!(ctx.check_inverse_invariant());
    }

    #[test]
    fn unpublish_clears_the_address_from_the_inverse_map_once_empty() {
        let ctx = RegistryContext::new();
        let m = meta("g", "svc", 9000);
        ctx.publish(m.clone());
        ctx.unpublish(&m);
        assert!(ctx.services_for_address(&m.address).is_empty());
        assert!(ctx.check_inverse_invariant());
    }

    #[test]
    fn one_address_can_expose_multiple_services() {
        let ctx = RegistryContext::new();
        let addr = Address::new("10.0.0.1", 9000);
        let svc_a = ServiceMeta::new("g", "a", "1.0.0");
        let svc_b = ServiceMeta::new("g", "b", "1.0.0");
        ctx.publish(RegisterMeta::new(svc_a.clone(), addr.clone()));
        ctx.publish(RegisterMeta::new(svc_b.clone(), addr.clone()));
        assert_eq!(ctx.services_for_address(&addr), HashSet::from([svc_a, svc_b]));
        assert!(ctx.check_inverse_invariant());
    }

    #[test]
    fn unpublish_all_at_only_reports_changed_services() {
        let ctx = RegistryContext::new();
        let svc_a = ServiceMeta::new("g", "a", "1.0.0");
        let svc_b = ServiceMeta::new("g", "b", "1.0.0");
        let addr = Address::new("10.0.0.1", 9000);
        ctx.publish(RegisterMeta::new(svc_a.clone(), addr.clone()));

        let changed = ctx.unpublish_all_at(&[svc_a.clone(), svc_b.clone()], &addr);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, svc_a);
        assert!(ctx.services_for_address(&addr).is_empty());
        assert!(ctx.check_inverse_invariant());
    }
}
