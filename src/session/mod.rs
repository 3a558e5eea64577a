//! Per-miner session state: the data model of SPEC_FULL.md §3.
//!
//! Grounded on `src/stratum/v1/connection.rs::StratumConnection` and
//! `src/stratum/v1/jobs.rs::JobManager` for the "bounded cache with pruning"
//! idiom, generalized from one upstream to two and from a raw job cache to
//! the fuller bookkeeping `dpmpv2.py::ProxySession` keeps.

pub mod emitter;
pub mod handshake;
pub mod reader;
pub mod router;
pub mod supervisor;

use crate::pool::PoolId;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

const JOB_OWNER_CAP: usize = 200;
const SEEN_IDS_CAP: usize = 500;
const INTERNAL_IDS_CAP: usize = 50;
const SUBMIT_OWNER_CAP: usize = 200;
const SUBMIT_FINGERPRINT_CAP: usize = 512;
const SUBMIT_FINGERPRINT_TTL_SECONDS: u64 = 45;
/// "recent window" used for rebalancing/urgency bookkeeping (DESIGN.md open
/// question #2): 5 minutes, matching the source constant.
pub const RECENT_WINDOW_SECONDS: u64 = 300;

/// Canonical string key for a JSON-RPC id, since `serde_json::Value` is not
/// `Hash`. `Value::to_string()` is stable for the scalar ids (numbers,
/// strings) Stratum actually uses.
pub fn msg_id_key(id: &Value) -> String {
    id.to_string()
}

#[derive(Debug, Clone)]
pub struct SubmitFingerprint {
    pub jobid: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub versionbits: Option<String>,
}

impl SubmitFingerprint {
    fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.jobid,
            self.extranonce2,
            self.ntime,
            self.nonce,
            self.versionbits.as_deref().unwrap_or("")
        )
    }
}

/// Per-pool connection and protocol state within one session.
pub struct PoolState {
    pub alive: bool,
    pub fail_count: u32,
    pub last_fail: Option<Instant>,

    pub extranonce1: Option<String>,
    pub extranonce2_size: Option<usize>,

    pub latest_notify_raw: Option<Value>,
    pub latest_jobid: Option<String>,
    pub notify_seq: u64,
    pub last_sent_seq: u64,
    pub last_notify_instant: Option<Instant>,

    pub latest_diff: Option<f64>,

    pub internal_subscribe_id: Option<u64>,
    pub internal_authorize_id: Option<u64>,

    submit_fingerprints: HashMap<String, Instant>,
    submit_fingerprint_order: VecDeque<(String, Instant)>,

    pub accepted_diff_accum: f64,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            alive: false,
            fail_count: 0,
            last_fail: None,
            extranonce1: None,
            extranonce2_size: None,
            latest_notify_raw: None,
            latest_jobid: None,
            notify_seq: 0,
            last_sent_seq: 0,
            last_notify_instant: None,
            latest_diff: None,
            internal_subscribe_id: None,
            internal_authorize_id: None,
            submit_fingerprints: HashMap::new(),
            submit_fingerprint_order: VecDeque::new(),
            accepted_diff_accum: 0.0,
        }
    }
}

impl PoolState {
    /// Record a submit fingerprint; returns `true` if it was already seen
    /// within the dedupe TTL (the caller should reject as a duplicate).
    pub fn check_and_record_fingerprint(&mut self, fp: &SubmitFingerprint, now: Instant) -> bool {
        let key = fp.key();
        if let Some(seen_at) = self.submit_fingerprints.get(&key) {
            if now.duration_since(*seen_at).as_secs() < SUBMIT_FINGERPRINT_TTL_SECONDS {
                return true;
            }
        }
        self.submit_fingerprints.insert(key.clone(), now);
        self.submit_fingerprint_order.push_back((key, now));
        while self.submit_fingerprint_order.len() > SUBMIT_FINGERPRINT_CAP {
            if let Some((oldest_key, _)) = self.submit_fingerprint_order.pop_front() {
                self.submit_fingerprints.remove(&oldest_key);
            }
        }
        false
    }

    /// Clear pool-scoped state on disconnect (SPEC_FULL.md §4.8): everything
    /// learned about the pool's live context, but not the accepted-difficulty
    /// accumulator (that's scheduler-owned fairness history).
    pub fn clear_on_disconnect(&mut self) {
        self.alive = false;
        self.extranonce1 = None;
        self.extranonce2_size = None;
        self.latest_notify_raw = None;
        self.latest_jobid = None;
        self.latest_diff = None;
    }
}

/// The last extranonce pushed to the miner, and which pool it came from.
#[derive(Debug, Clone)]
pub struct LastSentExtranonce {
    pub extranonce1: String,
    pub extranonce2_size: usize,
    pub pool: PoolId,
}

/// Bounded, insertion-ordered map used for job ownership / submit ownership
/// / seen-id tracking (SPEC_FULL.md §3 tables).
pub struct BoundedMap<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    cap: usize,
}

impl<K: std::hash::Hash + Eq + Clone, V> BoundedMap<K, V> {
    fn new(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, value);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop entries until the map is at or under `cap`, oldest first.
    pub fn prune(&mut self) {
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }
}

/// Bounded insertion-ordered set (seen upstream response ids, internal ids).
pub struct BoundedSet<K> {
    set: HashSet<K>,
    order: VecDeque<K>,
    cap: usize,
}

impl<K: std::hash::Hash + Eq + Clone> BoundedSet<K> {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub fn insert(&mut self, key: K) {
        if self.set.insert(key.clone()) {
            self.order.push_back(key);
        }
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.set.contains(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn prune(&mut self) {
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }
}

pub struct Session {
    pub worker_name: String,
    pub handshake_pool: PoolId,
    pub active_pool: PoolId,
    pub miner_ready: bool,

    pub subscribe_id: Option<Value>,
    pub authorize_id: Option<Value>,

    pub pool_a: PoolState,
    pub pool_b: PoolState,

    pub last_sent_extranonce: Option<LastSentExtranonce>,
    pub last_sent_difficulty_by_pool: HashMap<PoolId, u64>,
    pub raw_subscribe_forwarded_pool: Option<PoolId>,
    pub last_forwarded_pool: Option<PoolId>,
    pub last_forwarded_jobid: Option<String>,
    pub last_switch_instant: Instant,

    pub job_owner: BoundedMap<(PoolId, String), PoolId>,
    pub submit_owner: BoundedMap<String, PoolId>,
    pub submit_diff: BoundedMap<String, f64>,
    pub seen_upstream_ids: BoundedSet<(PoolId, String)>,
    pub internal_ids: BoundedSet<u64>,
    next_internal_id: u64,

    pub last_pruned: Instant,
}

impl Session {
    pub fn new(handshake_pool: PoolId) -> Self {
        let now = Instant::now();
        Self {
            worker_name: "unknown".to_string(),
            handshake_pool,
            active_pool: handshake_pool,
            miner_ready: false,
            subscribe_id: None,
            authorize_id: None,
            pool_a: PoolState::default(),
            pool_b: PoolState::default(),
            last_sent_extranonce: None,
            last_sent_difficulty_by_pool: HashMap::new(),
            raw_subscribe_forwarded_pool: None,
            last_forwarded_pool: None,
            last_forwarded_jobid: None,
            last_switch_instant: now,
            job_owner: BoundedMap::new(JOB_OWNER_CAP),
            submit_owner: BoundedMap::new(SUBMIT_OWNER_CAP),
            submit_diff: BoundedMap::new(SUBMIT_OWNER_CAP),
            seen_upstream_ids: BoundedSet::new(SEEN_IDS_CAP),
            internal_ids: BoundedSet::new(INTERNAL_IDS_CAP),
            // Offset well above typical miner-assigned ids (usually small
            // sequential integers) to avoid accidental collisions.
            next_internal_id: 1_000_000,
            last_pruned: now,
        }
    }

    pub fn pool(&self, id: PoolId) -> &PoolState {
        match id {
            PoolId::A => &self.pool_a,
            PoolId::B => &self.pool_b,
        }
    }

    pub fn pool_mut(&mut self, id: PoolId) -> &mut PoolState {
        match id {
            PoolId::A => &mut self.pool_a,
            PoolId::B => &mut self.pool_b,
        }
    }

    /// Allocate a fresh internal (proxy-originated) request id and register
    /// it so its eventual response is suppressed rather than forwarded.
    pub fn next_internal_id(&mut self) -> u64 {
        let id = self.next_internal_id;
        self.next_internal_id += 1;
        self.internal_ids.insert(id);
        id
    }

    /// Set the worker name once, from the miner's authorize username.
    /// Never overwritten by an empty/"unknown" value thereafter (SPEC_FULL.md §3).
    pub fn set_worker_name(&mut self, name: String) {
        if name != "unknown" || self.worker_name == "unknown" {
            self.worker_name = name;
        }
    }

    /// Periodic pruning (SPEC_FULL.md §4.6 step 1): trim all bounded
    /// collections. Called roughly every 60s from the scheduler tick.
    pub fn prune_all(&mut self) {
        self.job_owner.prune();
        self.submit_owner.prune();
        self.submit_diff.prune();
        self.seen_upstream_ids.prune();
        self.internal_ids.prune();
        self.last_pruned = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_map_evicts_oldest() {
        let mut m: BoundedMap<u32, &str> = BoundedMap::new(2);
        m.insert(1, "a");
        m.insert(2, "b");
        m.insert(3, "c");
        assert_eq!(m.len(), 2);
        assert!(m.get(&1).is_none());
        assert_eq!(m.get(&3), Some(&"c"));
    }

    #[test]
    fn bounded_set_evicts_oldest() {
        let mut s: BoundedSet<u32> = BoundedSet::new(2);
        s.insert(1);
        s.insert(2);
        s.insert(3);
        assert_eq!(s.len(), 2);
        assert!(!s.contains(&1));
        assert!(s.contains(&3));
    }

    #[test]
    fn worker_name_not_overwritten_by_unknown() {
        let mut session = Session::new(PoolId::A);
        session.set_worker_name("w1".to_string());
        session.set_worker_name("unknown".to_string());
        assert_eq!(session.worker_name, "w1");
    }

    #[test]
    fn fingerprint_dedup_within_ttl() {
        let mut pool = PoolState::default();
        let fp = SubmitFingerprint {
            jobid: "j1".into(),
            extranonce2: "00".into(),
            ntime: "5f".into(),
            nonce: "de".into(),
            versionbits: None,
        };
        let now = Instant::now();
        assert!(!pool.check_and_record_fingerprint(&fp, now));
        assert!(pool.check_and_record_fingerprint(&fp, now));
    }

    #[test]
    fn internal_id_registered_in_internal_ids() {
        let mut session = Session::new(PoolId::A);
        let id = session.next_internal_id();
        assert!(session.internal_ids.contains(&id));
    }
}
