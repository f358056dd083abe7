//! Registry data model: service identity, provider records, and the typed
//! message envelopes carried over the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identity of a service: group, name, and version. Equality and hashing
/// depend only on these three fields, matching the Java source's
/// `ServiceMeta` identity contract.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub group: String,
    pub service_name: String,
    pub version: String,
}

impl ServiceMeta {
    pub fn new(group: impl Into<String>, service_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            service_name: service_name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.group, self.service_name, self.version)
    }
}

/// `(host, port)` of a provider. `host` may be empty at ingress; the server
/// fills it in from the peer socket address before storing it (see
/// `RegistryServer::backfill_host`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn is_host_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn with_host(&self, ip: IpAddr) -> Self {
        Self { host: ip.to_string(), port: self.port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A provider record for one service at one address. Map identity is
/// `Address` within a `ServiceMeta` scope; `weight`/`conn_count` are plain
/// attributes, not part of that identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterMeta {
    pub service: ServiceMeta,
    pub address: Address,
    pub weight: i32,
    pub conn_count: i32,
}

impl RegisterMeta {
    pub fn new(service: ServiceMeta, address: Address) -> Self {
        Self { service, address, weight: 0, conn_count: 0 }
    }
}

// Identity for the attachment sets is address+service, matching the spec's
// "(ServiceMeta, Address) scope" keying — weight/conn_count don't affect it.
// Eq/Hash are hand-written (rather than derived) so they agree with each
// other on exactly those two fields: a `HashSet<RegisterMeta>` then dedupes
// by provider identity regardless of a differing weight/connCount, matching
// `RegistryContext::publish`'s own `putIfAbsent`-by-address contract.
impl PartialEq for RegisterMeta {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.address == other.address
    }
}
impl Eq for RegisterMeta {}
impl std::hash::Hash for RegisterMeta {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.service.hash(state);
        self.address.hash(state);
    }
}

/// Wire `sign` byte selecting payload type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Sign {
    Heartbeat = 0,
    PublishService = 1,
    UnPublishService = 2,
    SubscribeService = 3,
    Ack = 4,
}

impl TryFrom<u8> for Sign {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Sign::Heartbeat),
            1 => Ok(Sign::PublishService),
            2 => Ok(Sign::UnPublishService),
            3 => Ok(Sign::SubscribeService),
            4 => Ok(Sign::Ack),
            other => Err(other),
        }
    }
}

/// Payload carried by a `Message`, tagged by `Sign`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MessageData {
    Publish(RegisterMeta),
    UnPublish(RegisterMeta),
    Subscribe(ServiceMeta),
    Push(ServiceMeta, Vec<RegisterMeta>),
}

/// `(sign, sequence, version, payload)`. `sequence` is assigned by the
/// sender and echoed by the receiver in ACKs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub sign: Sign,
    pub sequence: u64,
    pub version: i64,
    pub data: MessageData,
}

impl Message {
    pub fn publish(sequence: u64, meta: RegisterMeta) -> Self {
        Self { sign: Sign::PublishService, sequence, version: 0, data: MessageData::Publish(meta) }
    }

    pub fn unpublish(sequence: u64, meta: RegisterMeta) -> Self {
        Self { sign: Sign::UnPublishService, sequence, version: 0, data: MessageData::UnPublish(meta) }
    }

    pub fn subscribe(sequence: u64, service: ServiceMeta) -> Self {
        Self { sign: Sign::SubscribeService, sequence, version: 0, data: MessageData::Subscribe(service) }
    }

    pub fn push(sequence: u64, version: i64, service: ServiceMeta, providers: Vec<RegisterMeta>) -> Self {
        Self { sign: Sign::PublishService, sequence, version, data: MessageData::Push(service, providers) }
    }
}

/// Body of an ACK frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub sequence: u64,
}
