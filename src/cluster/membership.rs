//! Membership bookkeeping.
//!
//! This is the state the node actor owns: its own descriptor, the pool of
//! known peers with their heartbeat deadlines, and the join phase. Nothing
//! here does I/O or reads a clock; every time-dependent call takes `now`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// One cluster member. Its identity is the publish endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(rename = "pub")]
    pub publish: String,
    pub router: String,
    #[serde(default)]
    pub ready: bool,
}

impl NodeDescriptor {
    pub fn new(publish: impl Into<String>, router: impl Into<String>) -> Self {
        Self {
            publish: publish.into(),
            router: router.into(),
            ready: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.publish
    }

    /// The form stored in the discovery set: readiness is never persisted.
    pub fn discoverable(&self) -> Self {
        Self {
            ready: false,
            ..self.clone()
        }
    }
}

/// Snapshot returned by the status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    /// Number of members, self included.
    #[serde(rename = "count")]
    pub member_count: usize,
    pub current: NodeDescriptor,
    pub pool: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Joining,
    Ready,
    /// Every join attempt failed; only an external event restarts a join.
    GaveUp,
}

/// What the caller must do after a join pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Ready,
    Retry { next_attempt: u32 },
    GaveUp,
}

/// How a `cluster:ready` announcement was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyAnnouncement {
    /// Our own announcement, looped back.
    Own,
    /// A pool member; it is now flagged ready.
    Known,
    /// A node we never heard of; it was added and we demoted ourselves.
    Unknown,
}

#[derive(Debug, Clone)]
struct Peer {
    descriptor: NodeDescriptor,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Membership {
    me: NodeDescriptor,
    minimum_nodes: usize,
    retry_limit: u32,
    expiry: Duration,
    phase: Phase,
    pool: BTreeMap<String, Peer>,
}

impl Membership {
    pub fn new(me: NodeDescriptor, minimum_nodes: usize, retry_limit: u32, expiry: Duration) -> Self {
        Self {
            me: NodeDescriptor { ready: false, ..me },
            minimum_nodes,
            retry_limit,
            expiry,
            phase: Phase::Initializing,
            pool: BTreeMap::new(),
        }
    }

    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.me
    }

    pub fn id(&self) -> &str {
        self.me.id()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.me.ready
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pool.contains_key(id)
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.pool.len() + 1 >= self.minimum_nodes
    }

    pub fn peers(&self) -> Vec<NodeDescriptor> {
        self.pool.values().map(|p| p.descriptor.clone()).collect()
    }

    /// Add a peer. Returns false for ourselves and for already known peers.
    pub fn add_peer(&mut self, descriptor: NodeDescriptor, now: Instant) -> bool {
        if descriptor.publish == self.me.publish || self.pool.contains_key(&descriptor.publish) {
            return false;
        }
        self.pool.insert(
            descriptor.publish.clone(),
            Peer {
                descriptor,
                deadline: now + self.expiry,
            },
        );
        true
    }

    /// Remove a peer. Removing an unknown peer is a no-op returning `None`.
    pub fn remove_peer(&mut self, id: &str) -> Option<NodeDescriptor> {
        self.pool.remove(id).map(|p| p.descriptor)
    }

    /// Push back the expiry of a known peer. Unknown senders are ignored.
    pub fn heartbeat(&mut self, id: &str, now: Instant) -> bool {
        match self.pool.get_mut(id) {
            Some(peer) => {
                peer.deadline = now + self.expiry;
                true
            }
            None => false,
        }
    }

    pub fn peer_ready(&mut self, descriptor: NodeDescriptor, now: Instant) -> ReadyAnnouncement {
        if descriptor.publish == self.me.publish {
            return ReadyAnnouncement::Own;
        }
        if let Some(peer) = self.pool.get_mut(&descriptor.publish) {
            peer.descriptor.ready = true;
            return ReadyAnnouncement::Known;
        }

        self.add_peer(NodeDescriptor { ready: true, ..descriptor }, now);
        self.demote();
        ReadyAnnouncement::Unknown
    }

    /// Earliest heartbeat deadline in the pool.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pool.values().map(|p| p.deadline).min()
    }

    /// Peers whose deadline has passed.
    pub fn expired(&self, now: Instant) -> Vec<String> {
        self.pool
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn begin_join(&mut self) {
        if self.phase != Phase::Ready {
            self.phase = Phase::Joining;
        }
    }

    /// Evaluate quorum at the end of join attempt `attempt`.
    pub fn complete_join(&mut self, attempt: u32) -> JoinOutcome {
        if self.has_quorum() {
            self.phase = Phase::Ready;
            self.me.ready = true;
            JoinOutcome::Ready
        } else {
            self.abort_join(attempt)
        }
    }

    /// A join pass that could not reach quorum or failed midway.
    pub fn abort_join(&mut self, attempt: u32) -> JoinOutcome {
        self.me.ready = false;
        if attempt < self.retry_limit {
            self.phase = Phase::Joining;
            JoinOutcome::Retry {
                next_attempt: attempt + 1,
            }
        } else {
            self.phase = Phase::GaveUp;
            JoinOutcome::GaveUp
        }
    }

    /// Drop back to a not-ready, joining node.
    pub fn demote(&mut self) {
        self.me.ready = false;
        self.phase = Phase::Joining;
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            member_count: self.pool.len() + 1,
            current: self.me.clone(),
            pool: self.peers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPIRY: Duration = Duration::from_secs(10);

    fn node(name: &str) -> NodeDescriptor {
        NodeDescriptor::new(format!("tcp://{}:7511", name), format!("tcp://{}:7510", name))
    }

    fn membership(minimum_nodes: usize) -> Membership {
        Membership::new(node("self"), minimum_nodes, 3, EXPIRY)
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = serde_json::to_value(node("a")).unwrap();
        assert_eq!(json["pub"], "tcp://a:7511");
        assert_eq!(json["router"], "tcp://a:7510");
        assert_eq!(json["ready"], false);

        let parsed: NodeDescriptor =
            serde_json::from_str(r#"{"pub":"tcp://b:1","router":"tcp://b:2"}"#).unwrap();
        assert_eq!(parsed, NodeDescriptor::new("tcp://b:1", "tcp://b:2"));
    }

    #[test]
    fn test_never_its_own_peer() {
        let mut m = membership(1);
        let now = Instant::now();
        assert!(!m.add_peer(node("self"), now));
        assert_eq!(m.pool_len(), 0);
    }

    #[test]
    fn test_add_peer_is_idempotent() {
        let mut m = membership(1);
        let now = Instant::now();
        assert!(m.add_peer(node("a"), now));
        assert!(!m.add_peer(node("a"), now));
        assert_eq!(m.pool_len(), 1);
    }

    #[test]
    fn test_not_ready_before_first_join() {
        let mut m = membership(1);
        assert!(!m.is_ready());
        assert_eq!(m.phase(), Phase::Initializing);
        m.begin_join();
        assert!(!m.is_ready());
        assert_eq!(m.complete_join(1), JoinOutcome::Ready);
        assert!(m.is_ready());
        assert_eq!(m.phase(), Phase::Ready);
    }

    #[test]
    fn test_quorum_gating_and_retry_limit() {
        let mut m = membership(2);
        m.begin_join();
        assert_eq!(m.complete_join(1), JoinOutcome::Retry { next_attempt: 2 });
        assert_eq!(m.complete_join(2), JoinOutcome::Retry { next_attempt: 3 });
        assert_eq!(m.complete_join(3), JoinOutcome::GaveUp);
        assert_eq!(m.phase(), Phase::GaveUp);
        assert!(!m.is_ready());

        m.add_peer(node("a"), Instant::now());
        assert_eq!(m.complete_join(1), JoinOutcome::Ready);
        assert!(m.is_ready());
    }

    #[test]
    fn test_aborted_pass_follows_retry_budget() {
        let mut m = membership(1);
        m.begin_join();
        assert_eq!(m.abort_join(2), JoinOutcome::Retry { next_attempt: 3 });
        assert!(!m.is_ready());
        assert_eq!(m.abort_join(3), JoinOutcome::GaveUp);
    }

    #[test]
    fn test_heartbeat_extends_deadline() {
        let mut m = membership(1);
        let start = Instant::now();
        m.add_peer(node("a"), start);
        assert_eq!(m.next_deadline(), Some(start + EXPIRY));

        let later = start + Duration::from_secs(4);
        assert!(m.heartbeat("tcp://a:7511", later));
        assert_eq!(m.next_deadline(), Some(later + EXPIRY));
        assert!(m.expired(start + EXPIRY).is_empty());
        assert_eq!(m.expired(later + EXPIRY), vec!["tcp://a:7511".to_string()]);
    }

    #[test]
    fn test_heartbeat_from_unknown_ignored() {
        let mut m = membership(1);
        assert!(!m.heartbeat("tcp://ghost:7511", Instant::now()));
        assert_eq!(m.pool_len(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut m = membership(1);
        m.add_peer(node("a"), Instant::now());
        assert!(m.remove_peer("tcp://a:7511").is_some());
        assert!(m.remove_peer("tcp://a:7511").is_none());
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn test_ready_from_known_peer() {
        let mut m = membership(1);
        let now = Instant::now();
        m.add_peer(node("a"), now);
        m.complete_join(1);

        let mut announced = node("a");
        announced.ready = true;
        assert_eq!(m.peer_ready(announced, now), ReadyAnnouncement::Known);
        assert!(m.peers()[0].ready);
        assert!(m.is_ready());
    }

    #[test]
    fn test_ready_from_unknown_peer_demotes() {
        let mut m = membership(1);
        let now = Instant::now();
        m.complete_join(1);
        assert!(m.is_ready());

        assert_eq!(m.peer_ready(node("b"), now), ReadyAnnouncement::Unknown);
        assert!(!m.is_ready());
        assert_eq!(m.phase(), Phase::Joining);
        assert!(m.contains("tcp://b:7511"));

        // a second announcement from the same node is a plain update
        assert_eq!(m.peer_ready(node("b"), now), ReadyAnnouncement::Known);
    }

    #[test]
    fn test_own_ready_ignored() {
        let mut m = membership(1);
        assert_eq!(m.peer_ready(node("self"), Instant::now()), ReadyAnnouncement::Own);
        assert_eq!(m.pool_len(), 0);
    }

    #[test]
    fn test_removed_peer_reannouncing_is_fresh_join() {
        let mut m = membership(2);
        let now = Instant::now();
        m.add_peer(node("a"), now);
        m.complete_join(1);
        m.remove_peer("tcp://a:7511");
        assert!(!m.has_quorum());
        m.demote();

        assert_eq!(m.peer_ready(node("a"), now), ReadyAnnouncement::Unknown);
        assert!(m.has_quorum());
    }

    #[test]
    fn test_status() {
        let mut m = membership(1);
        m.add_peer(node("a"), Instant::now());
        m.complete_join(1);

        let status = m.status();
        assert_eq!(status.member_count, 2);
        assert!(status.current.ready);
        assert_eq!(status.pool.len(), 1);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["current"]["pub"], "tcp://self:7511");
    }
}
