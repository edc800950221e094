use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::storage::KeyValueStore;
use crate::token::Identity;

/// Storage key of the serialized graph blob.
pub const GRAPH_KEY: &str = "referral_graph";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReferralGraph {
    #[serde(default)]
    pub referrals: BTreeMap<Identity, Vec<Identity>>,
    #[serde(default)]
    pub referrers: BTreeMap<Identity, Identity>,
}

impl ReferralGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the graph changed. Self-referrals and users that
    /// already have a referrer are left untouched.
    pub fn record(&mut self, referrer: &str, referred: &str) -> bool {
        if referrer == referred || referrer.is_empty() || referred.is_empty() {
            return false;
        }
        if self.referrers.contains_key(referred) {
            return false;
        }
        self.referrers
            .insert(referred.to_string(), referrer.to_string());
        let referred_set = self.referrals.entry(referrer.to_string()).or_default();
        if !referred_set.iter().any(|r| r == referred) {
            referred_set.push(referred.to_string());
        }
        true
    }

    pub fn count(&self, identity: &str) -> usize {
        self.referrals.get(identity).map_or(0, Vec::len)
    }

    pub fn referrer_of(&self, identity: &str) -> Option<&Identity> {
        self.referrers.get(identity)
    }

    pub fn referred_by(&self, identity: &str) -> &[Identity] {
        self.referrals
            .get(identity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every `referred -> referrer` entry has its mirror in `referrals`.
    pub fn is_consistent(&self) -> bool {
        self.referrers.iter().all(|(referred, referrer)| {
            self.referrals
                .get(referrer)
                .is_some_and(|set| set.contains(referred))
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"referral-graph-v1");
        for (referrer, referred) in &self.referrals {
            hasher.update((referrer.len() as u64).to_le_bytes());
            hasher.update(referrer.as_bytes());
            hasher.update((referred.len() as u64).to_le_bytes());
            for id in referred {
                hasher.update((id.len() as u64).to_le_bytes());
                hasher.update(id.as_bytes());
            }
        }
        hasher.finalize().into()
    }
}

/// Device-local referral bookkeeping shared by every app instance on the
/// device. Each call re-reads the blob through the port, so credits written
/// by another instance are never lost. Never fails toward the caller: an
/// unreadable port falls back to the last graph this instance saw, and write
/// problems are logged and dropped.
pub struct ReferralStore {
    port: Arc<dyn KeyValueStore>,
    last_known: Mutex<ReferralGraph>,
}

impl ReferralStore {
    pub fn open(port: Arc<dyn KeyValueStore>) -> Self {
        let store = Self {
            port,
            last_known: Mutex::new(ReferralGraph::new()),
        };
        drop(store.current());
        store
    }

    pub fn record_referral(&self, referrer: &str, referred: &str) -> bool {
        let mut graph = self.current();
        if !graph.record(referrer, referred) {
            debug!(referrer, referred, "referral not recorded");
            return false;
        }
        info!(referrer, referred, "referral recorded");
        self.persist(&graph);
        true
    }

    pub fn count_referrals(&self, identity: &str) -> usize {
        self.current().count(identity)
    }

    pub fn referrer_of(&self, identity: &str) -> Option<Identity> {
        self.current().referrer_of(identity).cloned()
    }

    pub fn referred_by(&self, identity: &str) -> Vec<Identity> {
        self.current().referred_by(identity).to_vec()
    }

    pub fn graph_snapshot(&self) -> ReferralGraph {
        self.current().clone()
    }

    /// Refreshes the cached graph from the port and returns it locked, so a
    /// read-modify-write in this instance is not interleaved with another.
    fn current(&self) -> MutexGuard<'_, ReferralGraph> {
        let mut graph = self.last_known.lock().unwrap_or_else(PoisonError::into_inner);
        match self.port.read(GRAPH_KEY) {
            Ok(raw) => *graph = decode_graph(raw.as_deref()),
            Err(error) => warn!(%error, "referral graph unreadable, using last known copy"),
        }
        graph
    }

    fn persist(&self, graph: &ReferralGraph) {
        let blob = match graph.to_json() {
            Ok(blob) => blob,
            Err(error) => {
                warn!(%error, "referral graph encode failed, write dropped");
                return;
            }
        };
        if let Err(error) = self.port.write(GRAPH_KEY, &blob) {
            warn!(%error, "referral graph write failed, keeping in-memory copy");
        }
    }
}

fn decode_graph(raw: Option<&str>) -> ReferralGraph {
    let Some(raw) = raw else {
        return ReferralGraph::new();
    };
    match ReferralGraph::from_json(raw) {
        Ok(graph) if graph.is_consistent() => graph,
        Ok(_) => {
            warn!("referral graph inconsistent, treating as empty");
            ReferralGraph::new()
        }
        Err(error) => {
            warn!(%error, "referral graph corrupt, treating as empty");
            ReferralGraph::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn memory_store() -> (Arc<MemoryStore>, ReferralStore) {
        let port = Arc::new(MemoryStore::new());
        let store = ReferralStore::open(port.clone());
        (port, store)
    }

    #[test]
    fn record_sets_both_directions() {
        let (_, store) = memory_store();
        assert!(store.record_referral("alice", "bob"));
        assert_eq!(store.referrer_of("bob").as_deref(), Some("alice"));
        assert_eq!(store.count_referrals("alice"), 1);
        assert_eq!(store.count_referrals("bob"), 0);
        assert!(store.graph_snapshot().is_consistent());
    }

    #[test]
    fn repeat_record_is_idempotent() {
        let (_, store) = memory_store();
        store.record_referral("alice", "bob");
        let once = store.graph_snapshot();
        assert!(!store.record_referral("alice", "bob"));
        assert_eq!(store.graph_snapshot(), once);
    }

    #[test]
    fn first_referrer_wins() {
        let (_, store) = memory_store();
        store.record_referral("alice", "bob");
        assert!(!store.record_referral("carol", "bob"));
        assert_eq!(store.referrer_of("bob").as_deref(), Some("alice"));
        assert_eq!(store.count_referrals("carol"), 0);
    }

    #[test]
    fn self_referral_is_ignored() {
        let (_, store) = memory_store();
        assert!(!store.record_referral("alice", "alice"));
        assert_eq!(store.graph_snapshot(), ReferralGraph::new());
    }

    #[test]
    fn referred_set_keeps_insertion_order() {
        let (_, store) = memory_store();
        store.record_referral("alice", "zed");
        store.record_referral("alice", "bob");
        store.record_referral("alice", "mia");
        assert_eq!(store.referred_by("alice"), vec!["zed", "bob", "mia"]);
        assert_eq!(store.count_referrals("alice"), 3);
    }

    #[test]
    fn graph_reloads_from_port() {
        let (port, store) = memory_store();
        store.record_referral("alice", "bob");
        store.record_referral("alice", "carol");
        store.record_referral("bob", "dave");
        let reopened = ReferralStore::open(port);
        assert_eq!(reopened.graph_snapshot(), store.graph_snapshot());
        assert_eq!(
            reopened.graph_snapshot().digest(),
            store.graph_snapshot().digest()
        );
    }

    #[test]
    fn persisted_layout_uses_two_named_records() {
        let (port, store) = memory_store();
        store.record_referral("alice", "bob");
        let raw = port.read(GRAPH_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["referrals"]["alice"][0], "bob");
        assert_eq!(value["referrers"]["bob"], "alice");
    }

    #[test]
    fn corrupt_blob_degrades_to_empty_graph() {
        let port = Arc::new(MemoryStore::new());
        port.write(GRAPH_KEY, "{not json").unwrap();
        let store = ReferralStore::open(port);
        assert_eq!(store.graph_snapshot(), ReferralGraph::new());
        assert!(store.record_referral("alice", "bob"));
    }

    #[test]
    fn inconsistent_blob_degrades_to_empty_graph() {
        let port = Arc::new(MemoryStore::new());
        port.write(
            GRAPH_KEY,
            r#"{"referrals":{},"referrers":{"bob":"alice"}}"#,
        )
        .unwrap();
        let store = ReferralStore::open(port);
        assert_eq!(store.referrer_of("bob"), None);
    }

    #[test]
    fn unavailable_storage_never_reaches_caller() {
        let port = Arc::new(MemoryStore::new());
        port.set_available(false);
        let store = ReferralStore::open(port.clone());
        assert!(store.record_referral("alice", "bob"));
        assert_eq!(store.count_referrals("alice"), 1);
        port.set_available(true);
        assert_eq!(port.read(GRAPH_KEY).unwrap(), None);
    }

    #[test]
    fn instances_sharing_a_port_see_each_others_credits() {
        let port = Arc::new(MemoryStore::new());
        let tab_a = ReferralStore::open(port.clone());
        let tab_b = ReferralStore::open(port.clone());

        assert!(tab_a.record_referral("alice", "bob"));
        assert_eq!(tab_b.count_referrals("alice"), 1);
        assert!(!tab_b.record_referral("carol", "bob"));

        assert!(tab_b.record_referral("carol", "dave"));
        assert_eq!(tab_a.referrer_of("bob").as_deref(), Some("alice"));
        assert_eq!(tab_a.count_referrals("carol"), 1);

        let reopened = ReferralStore::open(port);
        assert_eq!(reopened.count_referrals("alice"), 1);
        assert_eq!(reopened.count_referrals("carol"), 1);
        assert!(reopened.graph_snapshot().is_consistent());
    }

    #[test]
    fn outage_falls_back_to_last_known_graph() {
        let port = Arc::new(MemoryStore::new());
        let store = ReferralStore::open(port.clone());
        store.record_referral("alice", "bob");
        port.set_available(false);
        assert_eq!(store.count_referrals("alice"), 1);
        assert!(store.record_referral("alice", "carol"));
        assert_eq!(store.count_referrals("alice"), 2);
    }

    #[test]
    fn digest_separates_identity_boundaries() {
        let mut left = ReferralGraph::new();
        left.record("ab", "c");
        let mut right = ReferralGraph::new();
        right.record("a", "bc");
        assert_ne!(left.digest(), right.digest());
    }
}
