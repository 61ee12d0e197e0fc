//! Topic Membership and Discovery
//!
//! Beacon does not implement peer discovery itself. A [`DiscoveryFactory`]
//! supplied by the caller creates the backend on the first `listen`, and the
//! backend reports peers it finds through a [`DiscoverySink`].
//! [`MemoryDiscovery`] is an in-process backend for local swarms and tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::TransportKind;
use crate::config::BackendConfig;
use crate::error::Result;

/// Canonical byte form of a topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Bytes);

impl Topic {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(name) => f.write_str(name),
            Err(_) => f.write_str(&hex::encode(&self.0)),
        }
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self(Bytes::copy_from_slice(name.as_bytes()))
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(Bytes::from(name))
    }
}

impl From<&[u8]> for Topic {
    fn from(name: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(name))
    }
}

impl From<Vec<u8>> for Topic {
    fn from(name: Vec<u8>) -> Self {
        Self(Bytes::from(name))
    }
}

impl From<Bytes> for Topic {
    fn from(name: Bytes) -> Self {
        Self(name)
    }
}

/// Options for joining a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Publish our port. When false we only look up peers.
    pub announce: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self { announce: true }
    }
}

impl JoinOptions {
    /// Look up peers without announcing ourselves
    pub fn lookup_only() -> Self {
        Self { announce: false }
    }
}

/// Hints passed to the discovery backend with an announcement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceOptions {
    /// Use the source port of the announce request instead of the given port
    pub implied_port: bool,
}

/// A peer reported by a discovery backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Topic the peer was found under
    pub channel: Bytes,
    pub host: IpAddr,
    pub port: u16,
    /// Transport the peer is known to accept, if the backend knows
    pub kind: Option<TransportKind>,
}

/// Settings handed to a discovery backend on creation
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    pub dns: BackendConfig,
    pub dht: BackendConfig,
    /// Whether the datagram transport is active and may be shared with the backend
    pub datagram: bool,
}

/// What a backend reports back to the manager
#[derive(Debug)]
pub(crate) enum DiscoveryEvent {
    Peer(DiscoveredPeer),
    Error(String),
}

/// Channel from a discovery backend back to its manager
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl DiscoverySink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<DiscoveryEvent>) -> Self {
        Self { tx }
    }

    /// Report a peer. Returns false once the manager is gone.
    pub fn peer(&self, peer: DiscoveredPeer) -> bool {
        self.tx.send(DiscoveryEvent::Peer(peer)).is_ok()
    }

    /// Report a backend failure; surfaces as an error event
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.tx.send(DiscoveryEvent::Error(message.into())).is_ok()
    }
}

/// A running discovery backend
pub trait Discovery: Send + 'static {
    /// Start announcing and looking up `topic`. Must not block.
    fn join(&mut self, topic: &Topic, port: Option<u16>, options: AnnounceOptions) -> Result<()>;

    /// Stop announcing and looking up `topic`
    fn leave(&mut self, topic: &Topic, port: Option<u16>);

    fn destroy(&mut self);
}

/// Creates the discovery backend of a manager
pub trait DiscoveryFactory: Send + Sync + 'static {
    fn create(&self, config: DiscoveryConfig, sink: DiscoverySink) -> Result<Box<dyn Discovery>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process discovery
// ─────────────────────────────────────────────────────────────────────────────

struct Member {
    member: u64,
    sink: DiscoverySink,
    port: Option<u16>,
}

#[derive(Default)]
struct Table {
    topics: HashMap<Topic, Vec<Member>>,
}

/// Discovery backend shared by every manager created from the same value
#[derive(Clone)]
pub struct MemoryDiscovery {
    table: Arc<Mutex<Table>>,
    next_member: Arc<AtomicU64>,
    host: IpAddr,
}

impl MemoryDiscovery {
    /// A fresh, empty swarm whose members are reachable on localhost
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// A fresh, empty swarm whose members are reachable on `host`
    pub fn with_host(host: IpAddr) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            next_member: Arc::new(AtomicU64::new(0)),
            host,
        }
    }

    /// Number of members currently announcing `topic`
    pub fn announced(&self, topic: &Topic) -> usize {
        lock(&self.table)
            .topics
            .get(topic)
            .map(|members| members.iter().filter(|m| m.port.is_some()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DiscoveryFactory for MemoryDiscovery {
    fn create(&self, _config: DiscoveryConfig, sink: DiscoverySink) -> Result<Box<dyn Discovery>> {
        Ok(Box::new(MemoryMember {
            table: Arc::clone(&self.table),
            member: self.next_member.fetch_add(1, Ordering::Relaxed),
            host: self.host,
            sink,
        }))
    }
}

struct MemoryMember {
    table: Arc<Mutex<Table>>,
    member: u64,
    host: IpAddr,
    sink: DiscoverySink,
}

impl Discovery for MemoryMember {
    fn join(&mut self, topic: &Topic, port: Option<u16>, _options: AnnounceOptions) -> Result<()> {
        let mut table = lock(&self.table);
        let members = table.topics.entry(topic.clone()).or_default();
        members.retain(|m| m.member != self.member);

        for other in members.iter() {
            if let Some(other_port) = other.port {
                self.sink.peer(DiscoveredPeer {
                    channel: topic.to_bytes(),
                    host: self.host,
                    port: other_port,
                    kind: None,
                });
            }
            if let Some(port) = port {
                other.sink.peer(DiscoveredPeer {
                    channel: topic.to_bytes(),
                    host: self.host,
                    port,
                    kind: None,
                });
            }
        }

        debug!("Member {} joined {} ({} others)", self.member, topic, members.len());
        members.push(Member {
            member: self.member,
            sink: self.sink.clone(),
            port,
        });
        Ok(())
    }

    fn leave(&mut self, topic: &Topic, _port: Option<u16>) {
        let mut table = lock(&self.table);
        if let Some(members) = table.topics.get_mut(topic) {
            members.retain(|m| m.member != self.member);
            if members.is_empty() {
                table.topics.remove(topic);
            }
        }
    }

    fn destroy(&mut self) {
        let mut table = lock(&self.table);
        for members in table.topics.values_mut() {
            members.retain(|m| m.member != self.member);
        }
        table.topics.retain(|_, members| !members.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(
        discovery: &MemoryDiscovery,
    ) -> (Box<dyn Discovery>, mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = discovery
            .create(DiscoveryConfig::default(), DiscoverySink::new(tx))
            .unwrap();
        (backend, rx)
    }

    fn next_peer(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Option<DiscoveredPeer> {
        match rx.try_recv() {
            Ok(DiscoveryEvent::Peer(peer)) => Some(peer),
            _ => None,
        }
    }

    #[test]
    fn test_topic_forms_are_canonical() {
        assert_eq!(Topic::from("chat"), Topic::from(b"chat".as_slice()));
        assert_eq!(Topic::from("chat".to_string()), Topic::from(b"chat".to_vec()));
        assert_eq!(Topic::from("chat").to_string(), "chat");
        assert_eq!(Topic::from(vec![0xff, 0x00]).to_string(), "ff00");
    }

    #[test]
    fn test_join_options_default_to_announce() {
        assert!(JoinOptions::default().announce);
        assert!(!JoinOptions::lookup_only().announce);
    }

    #[test]
    fn test_members_learn_about_each_other() {
        let discovery = MemoryDiscovery::new();
        let topic = Topic::from("swarm");
        let (mut a, mut a_rx) = member(&discovery);
        let (mut b, mut b_rx) = member(&discovery);

        a.join(&topic, Some(4001), AnnounceOptions::default()).unwrap();
        assert!(next_peer(&mut a_rx).is_none());

        b.join(&topic, Some(4002), AnnounceOptions::default()).unwrap();
        assert_eq!(next_peer(&mut b_rx).map(|p| p.port), Some(4001));
        let seen_by_a = next_peer(&mut a_rx).unwrap();
        assert_eq!(seen_by_a.port, 4002);
        assert_eq!(seen_by_a.channel, topic.to_bytes());
        assert_eq!(discovery.announced(&topic), 2);
    }

    #[test]
    fn test_lookup_only_member_is_not_announced() {
        let discovery = MemoryDiscovery::new();
        let topic = Topic::from("swarm");
        let (mut a, mut a_rx) = member(&discovery);
        let (mut b, mut b_rx) = member(&discovery);

        a.join(&topic, Some(4001), AnnounceOptions::default()).unwrap();
        b.join(&topic, None, AnnounceOptions::default()).unwrap();

        assert_eq!(next_peer(&mut b_rx).map(|p| p.port), Some(4001));
        assert!(next_peer(&mut a_rx).is_none());
        assert_eq!(discovery.announced(&topic), 1);
    }

    #[test]
    fn test_leave_and_destroy_remove_member() {
        let discovery = MemoryDiscovery::new();
        let topic = Topic::from("swarm");
        let (mut a, _a_rx) = member(&discovery);

        a.join(&topic, Some(4001), AnnounceOptions::default()).unwrap();
        a.leave(&topic, Some(4001));
        assert_eq!(discovery.announced(&topic), 0);

        a.join(&topic, Some(4001), AnnounceOptions::default()).unwrap();
        a.destroy();
        assert_eq!(discovery.announced(&topic), 0);
    }
}
