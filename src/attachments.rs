//! Type-erased per-channel attachment slots. A connection's publish/subscribe
//! state lives here instead of on `ChannelHandle` directly, mirroring
//! Netty's `AttributeKey`/`AttributeMap` so new per-channel state can be
//! added without touching the channel type.

use dashmap::DashMap;
use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

/// An interned, typed key. Two `AttributeKey`s with the same name are
/// interchangeable; construct once and share via a `static` or `const fn`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: std::marker::PhantomData }
    }
}

/// Every `RegisterMeta`/`ServiceMeta` a connection has published or
/// subscribed to, so `channel_inactive` can unwind them all without a
/// reverse index. A `HashSet`, matching SPEC_FULL.md's "two attached sets"
/// data model: a repeated publish/subscribe of the same identity is absorbed
/// rather than appended, so disconnect unwind stays proportional to distinct
/// identities instead of redundant-call count. Guarded by a
/// `parking_lot::Mutex` since a connection can issue several
/// publishes/subscribes over its lifetime.
pub static PUBLISH_KEY: AttributeKey<parking_lot::Mutex<HashSet<crate::model::RegisterMeta>>> = AttributeKey::new("registry.publish");
pub static SUBSCRIBE_KEY: AttributeKey<parking_lot::Mutex<HashSet<crate::model::ServiceMeta>>> = AttributeKey::new("registry.subscribe");

/// A small map of type-erased values, set-if-absent under a per-key lock.
#[derive(Default)]
pub struct AttributeMap {
    slots: DashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        self.slots.get(key.name).and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn set<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) {
        self.slots.insert(key.name, Arc::new(value));
    }

    /// Insert `value` only if the key is unset; returns the value now in the
    /// map (either the caller's or a racing writer's).
    pub fn set_if_absent<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>, value: T) -> Arc<T> {
        let entry = self.slots.entry(key.name).or_insert_with(|| Arc::new(value) as Arc<dyn Any + Send + Sync>);
        entry.value().clone().downcast::<T>().expect("attribute type mismatch for interned key")
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &AttributeKey<T>) -> Option<Arc<T>> {
        self.slots.remove(key.name).and_then(|(_, v)| v.downcast::<T>().ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Address, RegisterMeta, ServiceMeta};
    use parking_lot::Mutex;

    #[test]
    fn set_if_absent_then_mutate_tracks_multiple_publishes() {
        let map = AttributeMap::new();
        let meta = RegisterMeta::new(ServiceMeta::new("g", "s", "1.0"), Address::new("127.0.0.1", 9000));
        let published = map.set_if_absent(&PUBLISH_KEY, Mutex::new(HashSet::new()));
        published.lock().insert(meta.clone());
        assert_eq!(map.get(&PUBLISH_KEY).unwrap().lock().len(), 1);
    }

    #[test]
    fn repeated_insert_of_the_same_identity_does_not_grow_the_set() {
        let map = AttributeMap::new();
        let meta = RegisterMeta::new(ServiceMeta::new("g", "s", "1.0"), Address::new("127.0.0.1", 9000));
        let published = map.set_if_absent(&PUBLISH_KEY, Mutex::new(HashSet::new()));
        published.lock().insert(meta.clone());
        published.lock().insert(meta.clone());
        published.lock().insert(meta);
        assert_eq!(map.get(&PUBLISH_KEY).unwrap().lock().len(), 1);
    }

    #[test]
    fn set_if_absent_keeps_first_writer() {
        let map = AttributeMap::new();
        let first = map.set_if_absent(&SUBSCRIBE_KEY, Mutex::new(HashSet::from([ServiceMeta::new("g", "s", "1.0")])));
        let second = map.set_if_absent(&SUBSCRIBE_KEY, Mutex::new(HashSet::from([ServiceMeta::new("g", "other", "1.0")])));
        assert!(std::sync::Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn remove_clears_the_slot() {
        let map = AttributeMap::new();
        map.set(&SUBSCRIBE_KEY, Mutex::new(HashSet::from([ServiceMeta::new("g", "s", "1.0")])));
        assert!(map.remove(&SUBSCRIBE_KEY).is_some());
        assert!(map.get(&SUBSCRIBE_KEY).is_none());
    }
}
