//! # Routing Table
//!
//! Distance-bucketed storage of known peers. Bucket `i` holds peers whose
//! address shares exactly `i` leading bits with the local address, so far
//! peers (small `i`) fall into a few wide buckets and near peers into many
//! narrow ones.
//!
//! Each bucket keeps up to `k` [`PeerRecord`]s ordered by recency (most
//! recently seen last) and a bounded replacement cache of candidates waiting
//! for space. Candidates only enter the bucket after a verified liveness race
//! against the bucket's least-recently-seen record (see [`RoutingTable::replace`]).
//!
//! The table itself is synchronous and not shared: the discovery actor owns it
//! and applies every operation as a single message, which makes each method
//! here atomic with respect to all others.

use std::collections::{BinaryHeap, HashSet};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::identity::{Address, ADDRESS_LEN, Peer, TABLE_SIZE, bucket_index, distance_cmp};

/// Maximum records per bucket (K).
pub const BUCKET_SIZE: usize = 16;

/// Maximum candidates per replacement cache (C).
pub const REPLACEMENT_CACHE_SIZE: usize = 16;

/// Consecutive failed refreshes after which a record is removed.
pub const MAX_REFRESH_FAILURES: u32 = 3;

/// A routing table entry. Replaced as a whole on every update.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub peer: Peer,
    pub last_seen: Instant,
    pub latency: Option<Duration>,
    /// Consecutive refreshes this peer failed to answer.
    pub failures: u32,
}

impl PeerRecord {
    fn new(peer: Peer, latency: Option<Duration>, seen_at: Instant) -> Self {
        Self { peer, last_seen: seen_at, latency, failures: 0 }
    }

    /// Time since the peer was last heard from.
    pub fn staleness(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// Record inserted or refreshed in its bucket.
    Accepted,
    /// Bucket full; peer waits in the replacement cache.
    Cached,
    /// Peer can never live in this table (own address or forged address).
    Rejected,
}

/// Result of offering a verified candidate to its bucket.
#[derive(Clone, Debug)]
pub enum PromoteOutcome {
    Promoted,
    /// Bucket is full; the incumbent must fail a liveness check first.
    Contested { incumbent: PeerRecord },
    Rejected,
}

/// Bounded FIFO of candidate peers; the oldest is evicted when full.
#[derive(Debug)]
pub struct ReplacementCache {
    entries: LruCache<Address, Peer>,
}

impl ReplacementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: LruCache::new(cap) }
    }

    /// Queue a candidate. Returns the evicted oldest candidate, if any.
    ///
    /// A candidate already queued is updated in place and keeps its turn.
    pub fn push(&mut self, peer: Peer) -> Option<Peer> {
        if let Some(slot) = self.entries.peek_mut(&peer.address) {
            *slot = peer;
            return None;
        }
        self.entries.push(peer.address, peer).map(|(_, evicted)| evicted)
    }

    pub fn oldest(&self) -> Option<&Peer> {
        self.entries.peek_lru().map(|(_, peer)| peer)
    }

    pub fn remove(&mut self, address: &Address) -> Option<Peer> {
        self.entries.pop(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
struct Bucket {
    records: Vec<PeerRecord>,
    cache: ReplacementCache,
}

impl Bucket {
    fn new(cache_capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            cache: ReplacementCache::new(cache_capacity),
        }
    }

    fn position(&self, address: &Address) -> Option<usize> {
        self.records.iter().position(|r| &r.peer.address == address)
    }

    fn oldest(&self) -> Option<&PeerRecord> {
        self.records.first()
    }

    /// Insert keeping `records` sorted by `last_seen`, oldest first.
    fn insert(&mut self, record: PeerRecord) {
        let pos = self.records.partition_point(|r| r.last_seen <= record.last_seen);
        self.records.insert(pos, record);
    }

    /// Merge a fresh observation into an existing record and re-sort it by
    /// its new `last_seen`. Observations older than the stored one are
    /// ignored.
    fn refresh_at(&mut self, pos: usize, peer: Peer, latency: Option<Duration>, seen_at: Instant) {
        if seen_at < self.records[pos].last_seen {
            return;
        }
        let existing = self.records.remove(pos);
        let public_ip = peer.public_ip.or(existing.peer.public_ip);
        let record = PeerRecord {
            peer: peer.with_public_ip(public_ip),
            last_seen: seen_at,
            latency: latency.or(existing.latency),
            failures: 0,
        };
        self.insert(record);
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local: Address,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local: Address) -> Self {
        Self::with_limits(local, BUCKET_SIZE, REPLACEMENT_CACHE_SIZE)
    }

    /// Table with `k` records and `cache_capacity` candidates per bucket.
    ///
    /// Both limits are raised to at least 1: a bucket that can hold nothing
    /// would reject every peer, and the cache is backed by a non-empty LRU.
    pub fn with_limits(local: Address, k: usize, cache_capacity: usize) -> Self {
        let k = k.max(1);
        let cache_capacity = cache_capacity.max(1);
        let buckets = (0..TABLE_SIZE).map(|_| Bucket::new(cache_capacity)).collect();
        Self { local, k, buckets }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    fn index_for(&self, address: &Address) -> Option<usize> {
        if *address == self.local {
            return None;
        }
        Some(bucket_index(&self.local, address))
    }

    /// Insert or refresh `peer` as seen at `seen_at`.
    ///
    /// `latency` of `None` keeps any previously measured latency.
    pub fn add_or_update(
        &mut self,
        peer: Peer,
        latency: Option<Duration>,
        seen_at: Instant,
    ) -> AddOutcome {
        if !peer.is_consistent() {
            return AddOutcome::Rejected;
        }
        let Some(idx) = self.index_for(&peer.address) else {
            return AddOutcome::Rejected;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&peer.address) {
            bucket.refresh_at(pos, peer, latency, seen_at);
            return AddOutcome::Accepted;
        }

        if bucket.records.len() < k {
            bucket.cache.remove(&peer.address);
            bucket.insert(PeerRecord::new(peer, latency, seen_at));
            return AddOutcome::Accepted;
        }

        bucket.cache.push(peer);
        AddOutcome::Cached
    }

    /// Like [`add_or_update`](Self::add_or_update) for a peer that must stay
    /// in the table. When the bucket is full, the least-recently-seen record
    /// not in `pinned` is moved to the replacement cache to make room. The
    /// peer is only cached if every record in the bucket is pinned.
    pub fn admit_pinned(
        &mut self,
        peer: Peer,
        latency: Option<Duration>,
        seen_at: Instant,
        pinned: &HashSet<Address>,
    ) -> AddOutcome {
        if !peer.is_consistent() {
            return AddOutcome::Rejected;
        }
        let Some(idx) = self.index_for(&peer.address) else {
            return AddOutcome::Rejected;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&peer.address) {
            bucket.refresh_at(pos, peer, latency, seen_at);
            return AddOutcome::Accepted;
        }

        if bucket.records.len() >= k {
            let Some(pos) = bucket
                .records
                .iter()
                .position(|r| !pinned.contains(&r.peer.address))
            else {
                bucket.cache.push(peer);
                return AddOutcome::Cached;
            };
            let displaced = bucket.records.remove(pos);
            bucket.cache.push(displaced.peer);
        }

        bucket.cache.remove(&peer.address);
        bucket.insert(PeerRecord::new(peer, latency, seen_at));
        AddOutcome::Accepted
    }

    /// Delete the record for `address`. No-op when absent.
    pub fn remove(&mut self, address: &Address) -> Option<PeerRecord> {
        let idx = self.index_for(address)?;
        let bucket = &mut self.buckets[idx];
        let pos = bucket.position(address)?;
        Some(bucket.records.remove(pos))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    pub fn get(&self, address: &Address) -> Option<&PeerRecord> {
        let idx = self.index_for(address)?;
        let bucket = &self.buckets[idx];
        bucket.position(address).map(|pos| &bucket.records[pos])
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.records.is_empty())
    }

    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map_or(0, |b| b.records.len())
    }

    pub fn cache_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map_or(0, |b| b.cache.len())
    }

    pub fn in_cache(&self, address: &Address) -> bool {
        self.index_for(address)
            .is_some_and(|idx| self.buckets[idx].cache.contains(address))
    }

    /// Up to `count` peers ordered by ascending distance to `target`; ties
    /// go to the more recently seen peer.
    pub fn closest(&self, target: &Address, count: usize) -> Vec<Peer> {
        if count == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            dist: [u8; ADDRESS_LEN],
            last_seen: Instant,
            record: &'a PeerRecord,
        }

        impl PartialEq for Candidate<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.cmp(other) == std::cmp::Ordering::Equal
            }
        }

        impl Eq for Candidate<'_> {}

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
                    .then_with(|| other.last_seen.cmp(&self.last_seen))
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the best `count` seen so far; the root is the worst.
        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(count + 1);
        for record in self.buckets.iter().flat_map(|b| b.records.iter()) {
            let candidate = Candidate {
                dist: record.peer.address.xor_distance(target),
                last_seen: record.last_seen,
                record,
            };
            if heap.len() < count {
                heap.push(candidate);
            } else if let Some(worst) = heap.peek()
                && candidate < *worst
            {
                heap.pop();
                heap.push(candidate);
            }
        }

        heap.into_sorted_vec()
            .into_iter()
            .map(|c| c.record.peer.clone())
            .collect()
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    /// Records not seen for longer than `staleness`, oldest first across the
    /// whole table, capped at `max`.
    pub fn stale_records(&self, staleness: Duration, max: usize, now: Instant) -> Vec<PeerRecord> {
        let mut stale: Vec<PeerRecord> = self
            .buckets
            .iter()
            .flat_map(|b| b.records.iter())
            .filter(|r| now.saturating_duration_since(r.last_seen) > staleness)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.last_seen);
        stale.truncate(max);
        stale
    }

    /// Count a failed refresh. Returns `true` when the record was removed.
    pub fn record_failure(&mut self, address: &Address) -> bool {
        let Some(idx) = self.index_for(address) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(address) else {
            return false;
        };
        bucket.records[pos].failures += 1;
        if bucket.records[pos].failures >= MAX_REFRESH_FAILURES {
            bucket.records.remove(pos);
            return true;
        }
        false
    }

    /// Oldest cached candidate of every bucket that has one.
    pub fn cache_heads(&self) -> Vec<(usize, Peer)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| b.cache.oldest().map(|p| (idx, p.clone())))
            .collect()
    }

    pub fn drop_candidate(&mut self, address: &Address) -> Option<Peer> {
        let idx = self.index_for(address)?;
        self.buckets[idx].cache.remove(address)
    }

    /// Offer a candidate that just answered a probe.
    pub fn promote(&mut self, candidate: Peer, latency: Option<Duration>, seen_at: Instant) -> PromoteOutcome {
        if !candidate.is_consistent() {
            return PromoteOutcome::Rejected;
        }
        let Some(idx) = self.index_for(&candidate.address) else {
            return PromoteOutcome::Rejected;
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&candidate.address) {
            bucket.cache.remove(&candidate.address);
            bucket.refresh_at(pos, candidate, latency, seen_at);
            return PromoteOutcome::Promoted;
        }
        if bucket.records.len() < k {
            bucket.cache.remove(&candidate.address);
            bucket.insert(PeerRecord::new(candidate, latency, seen_at));
            return PromoteOutcome::Promoted;
        }
        match bucket.oldest() {
            Some(incumbent) => PromoteOutcome::Contested { incumbent: incumbent.clone() },
            None => PromoteOutcome::Rejected,
        }
    }

    /// Evict `incumbent` and admit `candidate` in one step.
    ///
    /// The eviction only happens if the incumbent has not been seen since
    /// `incumbent_seen`; otherwise a concurrent contact proved it alive and
    /// the candidate stays cached. Returns `true` when the candidate entered
    /// the bucket.
    pub fn replace(
        &mut self,
        incumbent: &Address,
        incumbent_seen: Instant,
        candidate: Peer,
        latency: Option<Duration>,
        seen_at: Instant,
    ) -> bool {
        let Some(idx) = self.index_for(&candidate.address) else {
            return false;
        };
        if !candidate.is_consistent() {
            return false;
        }
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(incumbent) {
            if bucket.records[pos].last_seen > incumbent_seen {
                return false;
            }
            bucket.records.remove(pos);
        }
        bucket.cache.remove(&candidate.address);
        if let Some(pos) = bucket.position(&candidate.address) {
            bucket.refresh_at(pos, candidate, latency, seen_at);
            return true;
        }
        if bucket.records.len() >= k {
            return false;
        }
        bucket.insert(PeerRecord::new(candidate, latency, seen_at));
        true
    }
}
