use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::clock::LogicalClock;
use crate::codec::Object;

pub const ID_FIELD: &str = "id";
pub const RECEIVED_AT_FIELD: &str = "lastUpdated";
pub const STAMP_FIELD: &str = "lamportTime";

/// Latest reading for one station. Never mutated; an update replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRecord {
    pub id: String,
    pub payload: Object,
    pub received_at: SystemTime,
    pub logical_stamp: u64,
}

impl StationRecord {
    /// Build a record, writing the bookkeeping fields into the payload so the
    /// payload alone is enough to reconstruct it from a snapshot.
    pub fn new(id: String, mut payload: Object, received_at: SystemTime, logical_stamp: u64) -> Self {
        payload.insert(
            RECEIVED_AT_FIELD.to_string(),
            Value::from(epoch_millis(received_at)),
        );
        payload.insert(STAMP_FIELD.to_string(), Value::from(logical_stamp));
        Self { id, payload, received_at, logical_stamp }
    }
}

pub fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn from_epoch_millis(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upsert {
    pub created: bool,
    pub stamp: u64,
}

/// Bounded station map. Eviction order is insertion order: re-inserting an id
/// moves it to the newest position regardless of its logical stamp.
#[derive(Debug, Clone)]
pub struct StationStore {
    clock: Arc<LogicalClock>,
    max_entries: usize,
    // id -> (insertion seq, record)
    entries: HashMap<String, (u64, Arc<StationRecord>)>,
    // insertion seq -> id, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl StationStore {
    pub fn new(clock: Arc<LogicalClock>, max_entries: usize) -> Self {
        Self {
            clock,
            max_entries,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp `payload` with the next clock tick and the current time and make
    /// it the newest entry, replacing any previous record for `id`.
    pub fn upsert(&mut self, id: &str, payload: Object) -> Upsert {
        let stamp = self.clock.tick();
        let record = StationRecord::new(id.to_string(), payload, SystemTime::now(), stamp);
        let created = self.insert(record);
        Upsert { created, stamp }
    }

    /// Insert an already-stamped record at the newest position.
    pub fn insert(&mut self, record: StationRecord) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = record.id.clone();
        let prev = self.entries.insert(id.clone(), (seq, Arc::new(record)));
        if let Some((old_seq, _)) = &prev {
            self.order.remove(old_seq);
        }
        self.order.insert(seq, id);
        prev.is_none()
    }

    pub fn read(&self, id: &str) -> Option<Arc<StationRecord>> {
        self.entries.get(id).map(|(_, r)| r.clone())
    }

    /// All records, oldest insertion first.
    pub fn read_all(&self) -> Vec<(String, Arc<StationRecord>)> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id).map(|(_, r)| (id.clone(), r.clone())))
            .collect()
    }

    /// Drop the single oldest entry when over capacity.
    pub fn enforce_capacity(&mut self) -> Option<String> {
        if self.entries.len() <= self.max_entries {
            return None;
        }
        let (_, id) = self.order.pop_first()?;
        self.entries.remove(&id);
        Some(id)
    }

    /// Remove every record older than `ttl` as of `now`.
    pub fn prune_expired(&mut self, now: SystemTime, ttl: Duration) -> Vec<String> {
        let expired: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(_, (_, r))| now.duration_since(r.received_at).unwrap_or_default() > ttl)
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for (seq, id) in expired {
            self.order.remove(&seq);
            self.entries.remove(&id);
            tracing::info!(station = %id, "expired stale station");
            removed.push(id);
        }
        removed
    }

    /// Records by descending logical stamp, the order snapshots are written in.
    pub fn by_stamp_desc(&self) -> Vec<Arc<StationRecord>> {
        let mut records: Vec<_> = self.read_all().into_iter().map(|(_, r)| r).collect();
        records.sort_by(|a, b| b.logical_stamp.cmp(&a.logical_stamp));
        records
    }
}
