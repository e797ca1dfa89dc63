use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::event::{HalfRecord, MergedRecord, StreamSide};
use crate::metrics_consts::{JOIN_ORPHANS_EVICTED, JOIN_PENDING_KEYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinCacheConfig {
    /// Maximum age of a pending half before the reaper evicts it. `None` keeps halves forever.
    pub pending_ttl: Option<Duration>,
    pub max_pending_keys: usize,
}

impl Default for JoinCacheConfig {
    fn default() -> Self {
        Self {
            pending_ttl: Some(Duration::from_secs(3600)),
            max_pending_keys: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Expired,
    CapacityExceeded,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Expired => "expired",
            EvictionReason::CapacityExceeded => "capacity_exceeded",
        }
    }
}

#[derive(Debug)]
struct PendingHalf {
    record: HalfRecord,
    received_at: Instant,
}

#[derive(Debug)]
struct PendingPair {
    /// Position of this key in the arrival order index.
    seq: u64,
    customer: Option<PendingHalf>,
    inventory: Option<PendingHalf>,
}

impl PendingPair {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            customer: None,
            inventory: None,
        }
    }

    fn slot(&mut self, side: StreamSide) -> &mut Option<PendingHalf> {
        match side {
            StreamSide::Customer => &mut self.customer,
            StreamSide::Inventory => &mut self.inventory,
        }
    }

    /// Last write wins for a (key, side) pair.
    fn store(&mut self, record: HalfRecord, received_at: Instant) {
        let side = record.side;
        *self.slot(side) = Some(PendingHalf {
            record,
            received_at,
        });
    }

    fn is_complete(&self) -> bool {
        self.customer.is_some() && self.inventory.is_some()
    }

    fn is_empty(&self) -> bool {
        self.customer.is_none() && self.inventory.is_none()
    }

    fn into_merged(self) -> Option<MergedRecord> {
        match (self.customer, self.inventory) {
            (Some(customer), Some(inventory)) => {
                Some(MergedRecord::from_halves(customer.record, inventory.record))
            }
            _ => None,
        }
    }

    fn into_halves(self) -> impl Iterator<Item = HalfRecord> {
        [self.customer, self.inventory]
            .into_iter()
            .flatten()
            .map(|half| half.record)
    }

    fn expire(&mut self, cutoff: Instant, expired: &mut Vec<HalfRecord>) {
        for side in [StreamSide::Customer, StreamSide::Inventory] {
            let slot = self.slot(side);
            if slot.as_ref().is_some_and(|half| half.received_at <= cutoff) {
                if let Some(half) = slot.take() {
                    expired.push(half.record);
                }
            }
        }
    }
}

/// Holds half-completed records until their partner from the other stream arrives.
///
/// Every mutation for a key happens under that key's shard lock, so two concurrent offers for
/// the same key can never both see a complete pair and a half is never silently dropped.
///
/// Keys are also indexed by the order in which they became pending. When the cache is over
/// capacity the longest-waiting key is popped from that index, so eviction costs O(log n).
/// The index lock is only ever taken after a shard lock or on its own, never before one.
pub struct JoinCache {
    pending: DashMap<String, PendingPair>,
    arrivals: Mutex<BTreeMap<u64, String>>,
    next_seq: AtomicU64,
    len: AtomicUsize,
    config: JoinCacheConfig,
    evicted: Mutex<Vec<(HalfRecord, EvictionReason)>>,
}

impl JoinCache {
    pub fn new(config: JoinCacheConfig) -> Self {
        Self {
            pending: DashMap::new(),
            arrivals: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            config,
            evicted: Mutex::new(Vec::new()),
        }
    }

    pub fn offer(&self, half: HalfRecord) -> Option<MergedRecord> {
        self.offer_at(half, Instant::now())
    }

    /// Store `half` and, if its partner is already waiting, remove both and return the merge.
    pub fn offer_at(&self, half: HalfRecord, now: Instant) -> Option<MergedRecord> {
        let merged = match self.pending.entry(half.correlation_key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().store(half, now);
                if occupied.get().is_complete() {
                    let (_, pair) = occupied.remove_entry();
                    self.forget(pair.seq);
                    pair.into_merged()
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                // Counted before the key becomes visible to an evictor.
                self.len.fetch_add(1, Ordering::AcqRel);
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                self.arrivals().insert(seq, vacant.key().clone());
                let mut pair = PendingPair::new(seq);
                pair.store(half, now);
                vacant.insert(pair);
                None
            }
        };

        while self.len.load(Ordering::Acquire) > self.config.max_pending_keys {
            if !self.evict_oldest() {
                break;
            }
        }

        gauge!(JOIN_PENDING_KEYS).set(self.len.load(Ordering::Acquire) as f64);
        merged
    }

    fn arrivals(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
        self.arrivals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a key that left the cache from the arrival index. Called under the key's shard lock.
    fn forget(&self, seq: u64) {
        self.arrivals().remove(&seq);
        self.len.fetch_sub(1, Ordering::AcqRel);
    }

    /// Evict the key that has been pending the longest. `false` when nothing is left to evict.
    fn evict_oldest(&self) -> bool {
        let Some((seq, key)) = self.arrivals().pop_first() else {
            return false;
        };

        // A concurrent merge may have removed the key since it was popped.
        if let Some((key, pair)) = self.pending.remove_if(&key, |_, pair| pair.seq == seq) {
            self.len.fetch_sub(1, Ordering::AcqRel);
            debug!(key = %key, "join cache at capacity, evicting oldest pending key");
            let halves = pair
                .into_halves()
                .map(|half| (half, EvictionReason::CapacityExceeded));
            self.push_evicted(halves);
        }
        true
    }

    fn push_evicted(&self, halves: impl Iterator<Item = (HalfRecord, EvictionReason)>) {
        match self.evicted.lock() {
            Ok(mut evicted) => evicted.extend(halves),
            Err(_) => error!("join cache eviction buffer poisoned, dropping evicted halves"),
        }
    }

    /// Remove every half older than the pending TTL and return them together with any halves
    /// displaced by the capacity bound since the last call.
    pub fn take_orphans(&self, now: Instant) -> Vec<(HalfRecord, EvictionReason)> {
        let mut orphans = match self.evicted.lock() {
            Ok(mut evicted) => std::mem::take(&mut *evicted),
            Err(_) => Vec::new(),
        };

        if let Some(cutoff) = self
            .config
            .pending_ttl
            .and_then(|ttl| now.checked_sub(ttl))
        {
            let mut expired = Vec::new();
            self.pending.retain(|_, pair| {
                pair.expire(cutoff, &mut expired);
                if pair.is_empty() {
                    self.forget(pair.seq);
                    false
                } else {
                    true
                }
            });
            orphans.extend(
                expired
                    .into_iter()
                    .map(|half| (half, EvictionReason::Expired)),
            );
        }

        for (_, reason) in &orphans {
            counter!(JOIN_ORPHANS_EVICTED, "reason" => reason.as_str()).increment(1);
        }
        gauge!(JOIN_PENDING_KEYS).set(self.len.load(Ordering::Acquire) as f64);

        orphans
    }

    pub fn pending_keys(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn contains(&self, key: &str, side: StreamSide) -> bool {
        self.pending.get(key).is_some_and(|pair| match side {
            StreamSide::Customer => pair.customer.is_some(),
            StreamSide::Inventory => pair.inventory.is_some(),
        })
    }
}
