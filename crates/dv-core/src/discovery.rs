//! Node discovery
//!
//! Two sources describe nodes: the ledger (authoritative, polled) and the
//! broadcast topic (unauthenticated, pushed). [`NodeCache`] keeps one facet
//! per source for each identity; the ledger facet wins whenever it exists.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::ledger::{decode_node, AccountKind, LedgerClient, NodeAccount, Pubkey};
use crate::protocol::Announcement;

/// Node identity shared by both sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeKey {
    pub operator: Pubkey,
    pub node_id: u64,
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.operator, self.node_id)
    }
}

/// Which sources vouch for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    Announced,
    Ledger,
    LedgerAndAnnounced,
}

impl Provenance {
    /// Higher is more trusted
    pub fn rank(&self) -> u8 {
        match self {
            Provenance::Announced => 1,
            Provenance::Ledger => 2,
            Provenance::LedgerAndAnnounced => 3,
        }
    }
}

impl std::str::FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "announced" | "pubsub" | "1" => Ok(Provenance::Announced),
            "ledger" | "chain" | "2" => Ok(Provenance::Ledger),
            "ledger+announced" | "ledgerandannounced" | "3" => Ok(Provenance::LedgerAndAnnounced),
            other => Err(format!("unknown trust level {}", other)),
        }
    }
}

/// What one source says about a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFacts {
    pub node_address: Option<Pubkey>,
    pub endpoint: String,
    pub region: String,
    pub price_per_minute: u64,
    pub max_capacity: u32,
    pub tunnel_pubkey: [u8; 32],
    pub is_active: bool,
    pub seen_at: i64,
}

impl NodeFacts {
    pub fn from_ledger(address: Pubkey, node: &NodeAccount, seen_at: i64) -> Self {
        Self {
            node_address: Some(address),
            endpoint: node.endpoint.clone(),
            region: node.region.clone(),
            price_per_minute: node.price_per_minute_lamports,
            max_capacity: node.max_capacity,
            tunnel_pubkey: node.wg_server_pubkey,
            is_active: node.is_active,
            seen_at,
        }
    }

    /// Announcements carry no activity flag; a node announcing itself is up
    pub fn from_announcement(a: &Announcement, seen_at: i64) -> Self {
        Self {
            node_address: a.node_address,
            endpoint: a.endpoint.clone(),
            region: a.region.clone(),
            price_per_minute: a.price_per_minute,
            max_capacity: a.max_capacity,
            tunnel_pubkey: a.tunnel_pubkey,
            is_active: true,
            seen_at,
        }
    }

    fn same_content(&self, other: &NodeFacts) -> bool {
        NodeFacts { seen_at: 0, ..self.clone() } == NodeFacts { seen_at: 0, ..other.clone() }
    }
}

/// Merged view of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub key: NodeKey,
    pub node_address: Option<Pubkey>,
    pub endpoint: String,
    pub region: String,
    pub price_per_minute: u64,
    pub max_capacity: u32,
    #[serde(with = "crate::ledger::base64_bytes")]
    pub tunnel_pubkey: [u8; 32],
    pub is_active: bool,
    pub provenance: Provenance,
    pub seen_at: i64,
}

#[derive(Debug, Default)]
struct Entry {
    ledger: Option<NodeFacts>,
    announced: Option<NodeFacts>,
}

impl Entry {
    fn record(&self, key: NodeKey) -> Option<NodeRecord> {
        let (facts, provenance) = match (&self.ledger, &self.announced) {
            (Some(l), Some(_)) => (l, Provenance::LedgerAndAnnounced),
            (Some(l), None) => (l, Provenance::Ledger),
            (None, Some(a)) => (a, Provenance::Announced),
            (None, None) => return None,
        };
        let seen_at = self
            .ledger
            .iter()
            .chain(self.announced.iter())
            .map(|f| f.seen_at)
            .max()
            .unwrap_or(facts.seen_at);
        Some(NodeRecord {
            key,
            node_address: facts
                .node_address
                .or_else(|| self.announced.as_ref().and_then(|a| a.node_address)),
            endpoint: facts.endpoint.clone(),
            region: facts.region.clone(),
            price_per_minute: facts.price_per_minute,
            max_capacity: facts.max_capacity,
            tunnel_pubkey: facts.tunnel_pubkey,
            is_active: facts.is_active,
            provenance,
            seen_at,
        })
    }
}

/// Owned node cache; one lock around every facet
pub struct NodeCache {
    entries: RwLock<HashMap<NodeKey, Entry>>,
    freshness: i64,
}

impl NodeCache {
    /// `freshness` bounds how long an announcement counts as current
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            freshness: freshness.as_secs() as i64,
        }
    }

    fn is_fresh(&self, facts: &NodeFacts, now: i64) -> bool {
        now - facts.seen_at < self.freshness
    }

    /// Replace every ledger facet with `snapshot`
    pub fn apply_ledger_snapshot(&self, snapshot: Vec<(NodeKey, NodeFacts)>) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            entry.ledger = None;
        }
        for (key, facts) in snapshot {
            entries.entry(key).or_default().ledger = Some(facts);
        }
        entries.retain(|_, e| e.ledger.is_some() || e.announced.is_some());
    }

    /// Merge one announcement facet; returns false when it was already stale
    pub fn merge_announcement(&self, key: NodeKey, facts: NodeFacts, now: i64) -> bool {
        if !self.is_fresh(&facts, now) {
            return false;
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        match &mut entry.announced {
            Some(existing) if existing.same_content(&facts) => {
                existing.seen_at = existing.seen_at.max(facts.seen_at);
            }
            slot => *slot = Some(facts),
        }
        true
    }

    /// Drop announcement facets past the freshness window
    pub fn evict_stale(&self, now: i64) -> usize {
        let mut entries = self.entries.write();
        let mut evicted = 0;
        for entry in entries.values_mut() {
            if let Some(facts) = &entry.announced {
                if !self.is_fresh(facts, now) {
                    entry.announced = None;
                    evicted += 1;
                }
            }
        }
        entries.retain(|_, e| e.ledger.is_some() || e.announced.is_some());
        evicted
    }

    pub fn get(&self, key: &NodeKey, now: i64) -> Option<NodeRecord> {
        self.evict_stale(now);
        self.entries.read().get(key).and_then(|e| e.record(*key))
    }

    pub fn records(&self, now: i64) -> Vec<NodeRecord> {
        self.evict_stale(now);
        self.entries
            .read()
            .iter()
            .filter_map(|(key, e)| e.record(*key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listing query
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFilter {
    /// Case-insensitive substring of the region tag
    pub region: Option<String>,
    pub min_trust: Option<Provenance>,
    #[serde(default)]
    pub include_unverified: bool,
}

impl NodeFilter {
    fn matches(&self, record: &NodeRecord) -> bool {
        if !record.is_active {
            return false;
        }
        if record.provenance == Provenance::Announced && !self.include_unverified {
            return false;
        }
        if let Some(min) = self.min_trust {
            if record.provenance.rank() < min.rank() {
                return false;
            }
        }
        if let Some(region) = &self.region {
            if !record.region.to_lowercase().contains(&region.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Result of a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// A ledger read actually happened and succeeded
    pub refreshed: bool,
    /// The ledger view is from an earlier successful read
    pub stale: bool,
    pub ledger_nodes: usize,
}

struct RefreshState {
    last_success: Option<i64>,
    stale: bool,
    ledger_nodes: usize,
}

/// Merges ledger and broadcast node facts into a ranked listing
pub struct DiscoveryAggregator {
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    cache: Arc<NodeCache>,
    layout: u16,
    ttl: i64,
    read_timeout: Duration,
    state: tokio::sync::Mutex<RefreshState>,
    stale: std::sync::atomic::AtomicBool,
}

impl DiscoveryAggregator {
    pub fn new(ledger: Arc<dyn LedgerClient>, clock: Arc<dyn Clock>, cache: Arc<NodeCache>, layout: u16) -> Self {
        Self {
            ledger,
            clock,
            cache,
            layout,
            ttl: 60,
            read_timeout: Duration::from_secs(10),
            state: tokio::sync::Mutex::new(RefreshState {
                last_success: None,
                stale: false,
                ledger_nodes: 0,
            }),
            stale: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Builder pattern: minimum gap between ledger reads
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl.as_secs() as i64;
        self
    }

    /// Builder pattern: bound each ledger read
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Whether the ledger facets come from an older read than the last attempt
    pub fn is_stale(&self) -> bool {
        self.stale.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Pull every node account from the ledger, at most once per TTL
    pub async fn refresh_from_ledger(&self) -> RefreshOutcome {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        if let Some(last) = state.last_success {
            if now - last < self.ttl {
                debug!(age = now - last, "Ledger view still fresh, skipping refresh");
                return RefreshOutcome { refreshed: false, stale: state.stale, ledger_nodes: state.ledger_nodes };
            }
        }

        let discriminator = AccountKind::Node.discriminator();
        let listed = match tokio::time::timeout(self.read_timeout, self.ledger.list_accounts(&discriminator)).await {
            Ok(Ok(listed)) => listed,
            Ok(Err(e)) => return self.mark_stale(&mut state, &e.to_string()),
            Err(_) => return self.mark_stale(&mut state, "timed out"),
        };

        let mut snapshot = Vec::with_capacity(listed.len());
        for (address, data) in listed {
            match decode_node(&data, self.layout) {
                Ok(node) => {
                    let key = NodeKey { operator: node.provider, node_id: node.node_id };
                    snapshot.push((key, NodeFacts::from_ledger(address, &node, now)));
                }
                Err(e) => warn!(account = %address, "Skipping undecodable node account: {}", e),
            }
        }

        state.ledger_nodes = snapshot.len();
        state.last_success = Some(now);
        state.stale = false;
        self.stale.store(false, std::sync::atomic::Ordering::SeqCst);
        self.cache.apply_ledger_snapshot(snapshot);
        info!(nodes = state.ledger_nodes, "Refreshed node view from ledger");

        RefreshOutcome { refreshed: true, stale: false, ledger_nodes: state.ledger_nodes }
    }

    fn mark_stale(&self, state: &mut RefreshState, reason: &str) -> RefreshOutcome {
        warn!("Ledger refresh failed, serving cached view: {}", reason);
        state.stale = true;
        self.stale.store(true, std::sync::atomic::Ordering::SeqCst);
        RefreshOutcome { refreshed: false, stale: true, ledger_nodes: state.ledger_nodes }
    }

    /// Merge one broadcast message; malformed or stale messages are dropped
    pub fn on_announcement(&self, data: &[u8]) -> bool {
        let announcement = match Announcement::from_bytes(data) {
            Ok(a) => a,
            Err(e) => {
                debug!("Dropping announcement: {}", e);
                return false;
            }
        };

        let now = self.clock.now();
        let key = NodeKey { operator: announcement.operator, node_id: announcement.node_id };
        // Future timestamps count as received now
        let seen_at = announcement.timestamp.min(now);
        let merged = self
            .cache
            .merge_announcement(key, NodeFacts::from_announcement(&announcement, seen_at), now);
        if !merged {
            debug!(node = %key, "Dropping stale announcement");
        }
        merged
    }

    /// Feed a message stream through [`Self::on_announcement`] until it ends
    pub async fn consume<S, B>(&self, stream: S) -> usize
    where
        S: Stream<Item = B>,
        B: AsRef<[u8]>,
    {
        futures::pin_mut!(stream);
        let mut merged = 0;
        while let Some(message) = stream.next().await {
            if self.on_announcement(message.as_ref()) {
                merged += 1;
            }
        }
        merged
    }

    /// Matching nodes, most trusted first, then cheapest
    pub fn list(&self, filter: &NodeFilter) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self
            .cache
            .records(self.clock.now())
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by_key(|r| (Reverse(r.provenance.rank()), r.price_per_minute, r.key));
        records
    }

    pub fn get(&self, key: &NodeKey) -> Option<NodeRecord> {
        self.cache.get(key, self.clock.now())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
