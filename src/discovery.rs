//! # Discovery Protocol
//!
//! Algorithms that keep the routing table populated and fresh, built on the
//! [`DiscoveryRpc`] abstraction:
//!
//! | Operation | Purpose |
//! |-----------|---------|
//! | [`DiscoveryNode::add_peers`] | Probe candidates concurrently, admit responders |
//! | [`DiscoveryNode::refresh_table`] | Re-probe the stalest records, evict the persistently silent |
//! | [`DiscoveryNode::check_replacement_cache`] | Promote live candidates over dead incumbents |
//! | [`DiscoveryNode::rebuild_connections`] | Re-explore sparse distance classes via neighbor queries |
//! | [`DiscoveryNode::heal_static_peers`] | Re-admit pinned peers missing from the table |
//!
//! ## Architecture
//!
//! Uses the **Actor Pattern**:
//! - [`DiscoveryNode`]: public handle (cheap to clone)
//! - `DiscoveryActor`: private task owning the [`RoutingTable`]
//!
//! Every table operation is one command, so each is atomic with respect to
//! the others. Network I/O never happens inside the actor; maintenance
//! operations read what they need, probe without holding anything, and apply
//! the results as separate commands.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::identity::{Address, Peer, TABLE_SIZE, random_address_in_bucket};
use crate::protocols::DiscoveryRpc;
use crate::routing::{AddOutcome, PeerRecord, PromoteOutcome, RoutingTable};
use crate::rpc::{RpcError, is_cancelled};

/// Default number of buckets walked by a rebuild.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Known peers queried per rebuilt bucket.
pub const NEIGHBOR_QUERY_FANOUT: usize = 3;

const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub probed: usize,
    pub refreshed: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub promoted: usize,
    pub dropped: usize,
    pub retained: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub queried: usize,
    pub discovered: usize,
    pub admitted: usize,
}

enum Command {
    Observe(Peer, Instant),
    RecordContact(Peer, Option<Duration>, Instant, oneshot::Sender<AddOutcome>),
    AdmitPinned(Peer, Duration, Instant, Arc<HashSet<Address>>, oneshot::Sender<AddOutcome>),
    RecordFailure(Address, oneshot::Sender<bool>),
    Remove(Address, oneshot::Sender<Option<PeerRecord>>),
    Contains(Address, oneshot::Sender<bool>),
    Closest(Address, usize, oneshot::Sender<Vec<Peer>>),
    Snapshot(oneshot::Sender<Vec<PeerRecord>>),
    StaleRecords(Duration, usize, oneshot::Sender<Vec<PeerRecord>>),
    CacheHeads(oneshot::Sender<Vec<(usize, Peer)>>),
    DropCandidate(Address),
    Promote(Peer, Duration, Instant, oneshot::Sender<PromoteOutcome>),
    Replace {
        incumbent: Address,
        incumbent_seen: Instant,
        candidate: Peer,
        latency: Duration,
        seen_at: Instant,
        reply: oneshot::Sender<bool>,
    },
    Quit,
}

pub struct DiscoveryNode<N: DiscoveryRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: Address,
    network: Arc<N>,
}

impl<N: DiscoveryRpc> Clone for DiscoveryNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            network: self.network.clone(),
        }
    }
}

struct DiscoveryActor {
    routing: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

/// Outcome of one probe in a fan-out, with the time the answer arrived.
struct ProbeResult {
    peer: Peer,
    outcome: Result<Duration>,
    at: Instant,
}

impl<N: DiscoveryRpc> DiscoveryNode<N> {
    pub fn new(local: Address, network: Arc<N>) -> Self {
        Self::with_table(RoutingTable::new(local), network)
    }

    pub fn with_table(routing: RoutingTable, network: Arc<N>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let local = routing.local_address();
        let actor = DiscoveryActor { routing, cmd_rx };
        tokio::spawn(actor.run());
        Self { cmd_tx, local, network }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    async fn ask<T: Default>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Opportunistic refresh from an inbound message; keeps any known latency.
    pub async fn observe(&self, peer: Peer) {
        let _ = self.cmd_tx.send(Command::Observe(peer, Instant::now())).await;
    }

    /// Record a successful contact, optionally with a measured round trip.
    pub async fn record_contact(&self, peer: Peer, latency: Option<Duration>) -> AddOutcome {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::RecordContact(peer, latency, Instant::now(), tx);
        if self.cmd_tx.send(cmd).await.is_err() {
            return AddOutcome::Rejected;
        }
        rx.await.unwrap_or(AddOutcome::Rejected)
    }

    pub async fn remove(&self, address: Address) -> Option<PeerRecord> {
        self.ask(|tx| Command::Remove(address, tx)).await
    }

    pub async fn contains(&self, address: Address) -> bool {
        self.ask(|tx| Command::Contains(address, tx)).await
    }

    /// Local answer to a neighbor query. Never touches the network.
    pub async fn closest(&self, target: Address, count: usize) -> Vec<Peer> {
        self.ask(|tx| Command::Closest(target, count, tx)).await
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.ask(Command::Snapshot).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Probe every peer concurrently, each bounded by `timeout`, and wait for
    /// all of them. Cancellation aborts the outstanding probes.
    async fn probe_all(
        &self,
        peers: Vec<Peer>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProbeResult>> {
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled.into());
        }

        let mut probes = JoinSet::new();
        for peer in peers {
            let network = self.network.clone();
            let cancel = cancel.clone();
            probes.spawn(async move {
                let outcome = network.probe(&peer, timeout, &cancel).await;
                ProbeResult { peer, outcome, at: Instant::now() }
            });
        }

        let mut results = Vec::with_capacity(probes.len());
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    probes.abort_all();
                    return Err(RpcError::Cancelled.into());
                }
                joined = probes.join_next() => joined,
            };
            match joined {
                Some(Ok(result)) => {
                    if let Err(e) = &result.outcome
                        && is_cancelled(e)
                    {
                        return Err(RpcError::Cancelled.into());
                    }
                    results.push(result);
                }
                Some(Err(e)) => warn!(error = %e, "probe task failed"),
                None => break,
            }
        }
        Ok(results)
    }

    /// Probe `candidates` and admit every responder with its measured
    /// latency. Non-responders are dropped without retry.
    pub async fn add_peers(
        &self,
        candidates: Vec<Peer>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        let mut seen = HashSet::new();
        let candidates: Vec<Peer> = candidates
            .into_iter()
            .filter(|p| p.address != self.local && seen.insert(p.address))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.probe_all(candidates, timeout, cancel).await?;
        let mut admitted = Vec::new();
        for result in results {
            match result.outcome {
                Ok(rtt) => {
                    let (tx, rx) = oneshot::channel();
                    let cmd = Command::RecordContact(result.peer.clone(), Some(rtt), result.at, tx);
                    if self.cmd_tx.send(cmd).await.is_err() {
                        break;
                    }
                    if rx.await == Ok(AddOutcome::Accepted) {
                        admitted.push(result.peer);
                    }
                }
                Err(e) => {
                    debug!(peer = %result.peer.address, error = %e, "candidate did not answer probe");
                }
            }
        }
        debug!(admitted = admitted.len(), "add_peers complete");
        Ok(admitted)
    }

    /// Re-probe up to `max_peers` records older than `staleness`, oldest
    /// first across the whole table. Silent peers accumulate failures and
    /// are removed after repeated misses.
    pub async fn refresh_table(
        &self,
        staleness: Duration,
        max_peers: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RefreshStats> {
        let stale: Vec<Peer> = self
            .ask(|tx| Command::StaleRecords(staleness, max_peers, tx))
            .await
            .into_iter()
            .map(|r| r.peer)
            .collect();
        if stale.is_empty() {
            trace!("no stale peers to refresh");
            return Ok(RefreshStats::default());
        }

        let mut stats = RefreshStats { probed: stale.len(), ..RefreshStats::default() };
        for result in self.probe_all(stale, timeout, cancel).await? {
            match result.outcome {
                Ok(rtt) => {
                    let (tx, rx) = oneshot::channel();
                    let cmd = Command::RecordContact(result.peer, Some(rtt), result.at, tx);
                    if self.cmd_tx.send(cmd).await.is_ok() && rx.await.is_ok() {
                        stats.refreshed += 1;
                    }
                }
                Err(e) => {
                    let address = result.peer.address;
                    if self.ask(|tx| Command::RecordFailure(address, tx)).await {
                        debug!(peer = %address, error = %e, "evicted unresponsive peer");
                        stats.evicted += 1;
                    }
                }
            }
        }
        debug!(
            probed = stats.probed,
            refreshed = stats.refreshed,
            evicted = stats.evicted,
            "refreshed routing table"
        );
        Ok(stats)
    }

    /// For every bucket with cached candidates, probe the oldest one. A live
    /// candidate enters its bucket if there is room or if the bucket's
    /// least-recently-seen record fails a fresh probe; a dead one is dropped.
    pub async fn check_replacement_cache(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CacheStats> {
        let heads: Vec<Peer> = self
            .ask(Command::CacheHeads)
            .await
            .into_iter()
            .map(|(_, peer)| peer)
            .collect();
        if heads.is_empty() {
            return Ok(CacheStats::default());
        }

        let mut stats = CacheStats::default();
        let mut contested = Vec::new();
        for result in self.probe_all(heads, timeout, cancel).await? {
            let address = result.peer.address;
            let rtt = match result.outcome {
                Ok(rtt) => rtt,
                Err(_) => {
                    let _ = self.cmd_tx.send(Command::DropCandidate(address)).await;
                    stats.dropped += 1;
                    continue;
                }
            };
            let outcome = self
                .ask_promote(result.peer.clone(), rtt, result.at)
                .await;
            match outcome {
                PromoteOutcome::Promoted => stats.promoted += 1,
                PromoteOutcome::Contested { incumbent } => {
                    contested.push((result.peer, rtt, result.at, incumbent));
                }
                PromoteOutcome::Rejected => {
                    let _ = self.cmd_tx.send(Command::DropCandidate(address)).await;
                    stats.dropped += 1;
                }
            }
        }

        if contested.is_empty() {
            return Ok(stats);
        }

        let incumbents = contested.iter().map(|(_, _, _, inc)| inc.peer.clone()).collect();
        let checks = self.probe_all(incumbents, timeout, cancel).await?;
        for (candidate, rtt, seen_at, incumbent) in contested {
            let check = checks.iter().find(|c| c.peer.address == incumbent.peer.address);
            if let Some(ProbeResult { outcome: Ok(alive_rtt), at, .. }) = check {
                let (tx, rx) = oneshot::channel();
                let cmd = Command::RecordContact(incumbent.peer, Some(*alive_rtt), *at, tx);
                if self.cmd_tx.send(cmd).await.is_ok() {
                    let _ = rx.await;
                }
                stats.retained += 1;
                continue;
            }

            let candidate_addr = candidate.address;
            let replaced = self
                .ask(|reply| Command::Replace {
                    incumbent: incumbent.peer.address,
                    incumbent_seen: incumbent.last_seen,
                    candidate,
                    latency: rtt,
                    seen_at,
                    reply,
                })
                .await;
            if replaced {
                debug!(
                    evicted = %incumbent.peer.address,
                    promoted = %candidate_addr,
                    "replaced dead peer with cached candidate"
                );
                stats.promoted += 1;
            } else {
                stats.retained += 1;
            }
        }
        Ok(stats)
    }

    async fn ask_promote(&self, peer: Peer, rtt: Duration, at: Instant) -> PromoteOutcome {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Promote(peer, rtt, at, tx)).await.is_err() {
            return PromoteOutcome::Rejected;
        }
        rx.await.unwrap_or(PromoteOutcome::Rejected)
    }

    /// Walk buckets `0..max_depth`, asking the closest known peers for
    /// neighbors of a random address in each bucket's range. Unknown peers in
    /// the replies are probed before admission.
    pub async fn rebuild_connections(
        &self,
        max_depth: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RebuildStats> {
        let mut stats = RebuildStats::default();

        for bucket in 0..max_depth.min(TABLE_SIZE) {
            if cancel.is_cancelled() {
                return Err(RpcError::Cancelled.into());
            }
            let target = random_address_in_bucket(&self.local, bucket);
            let queried = self.closest(target, NEIGHBOR_QUERY_FANOUT).await;
            if queried.is_empty() {
                continue;
            }
            stats.queried += queried.len();

            let mut queries = JoinSet::new();
            for peer in queried {
                let network = self.network.clone();
                let cancel = cancel.clone();
                queries.spawn(async move {
                    let result = network.neighbors(&peer, target, timeout, &cancel).await;
                    (peer, result)
                });
            }

            let mut learned = Vec::new();
            let mut seen = HashSet::new();
            loop {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        queries.abort_all();
                        return Err(RpcError::Cancelled.into());
                    }
                    joined = queries.join_next() => joined,
                };
                match joined {
                    Some(Ok((_, Ok(peers)))) => {
                        for peer in peers {
                            if peer.address != self.local && seen.insert(peer.address) {
                                learned.push(peer);
                            }
                        }
                    }
                    Some(Ok((peer, Err(e)))) => {
                        if is_cancelled(&e) {
                            return Err(e);
                        }
                        debug!(peer = %peer.address, error = %e, "neighbor query failed");
                    }
                    Some(Err(e)) => warn!(error = %e, "neighbor query task failed"),
                    None => break,
                }
            }

            let mut unknown = Vec::new();
            for peer in learned {
                if !self.contains(peer.address).await {
                    unknown.push(peer);
                }
            }
            stats.discovered += unknown.len();
            stats.admitted += self.add_peers(unknown, timeout, cancel).await?.len();
            trace!(bucket, "rebuilt bucket");
        }

        debug!(
            queried = stats.queried,
            discovered = stats.discovered,
            admitted = stats.admitted,
            "rebuilt connections"
        );
        Ok(stats)
    }

    /// Probe every pinned peer missing from the table and re-admit those
    /// that answer. A full bucket makes room by moving its least-recently-seen
    /// unpinned record to the replacement cache.
    pub async fn heal_static_peers(
        &self,
        pinned: &[Peer],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        let present: HashSet<Address> = self
            .snapshot()
            .await
            .into_iter()
            .map(|r| r.peer.address)
            .collect();
        let missing: Vec<Peer> = pinned
            .iter()
            .filter(|p| !present.contains(&p.address))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        debug!(missing = missing.len(), "re-adding static peers");

        let pinned: Arc<HashSet<Address>> = Arc::new(pinned.iter().map(|p| p.address).collect());
        let mut restored = Vec::new();
        for result in self.probe_all(missing, timeout, cancel).await? {
            let rtt = match result.outcome {
                Ok(rtt) => rtt,
                Err(e) => {
                    debug!(peer = %result.peer.address, error = %e, "static peer did not answer probe");
                    continue;
                }
            };
            let (tx, rx) = oneshot::channel();
            let cmd = Command::AdmitPinned(result.peer.clone(), rtt, result.at, pinned.clone(), tx);
            if self.cmd_tx.send(cmd).await.is_err() {
                break;
            }
            match rx.await {
                Ok(AddOutcome::Accepted) => restored.push(result.peer),
                Ok(outcome) => {
                    warn!(peer = %result.peer.address, outcome = ?outcome, "static peer could not be restored");
                }
                Err(_) => break,
            }
        }
        Ok(restored)
    }
}

impl DiscoveryActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(peer, at) => {
                    let address = peer.address;
                    let outcome = self.routing.add_or_update(peer, None, at);
                    trace!(peer = %address, outcome = ?outcome, "observed peer");
                }
                Command::RecordContact(peer, latency, at, reply) => {
                    let _ = reply.send(self.routing.add_or_update(peer, latency, at));
                }
                Command::AdmitPinned(peer, latency, at, pinned, reply) => {
                    let _ = reply.send(self.routing.admit_pinned(peer, Some(latency), at, &pinned));
                }
                Command::RecordFailure(address, reply) => {
                    let _ = reply.send(self.routing.record_failure(&address));
                }
                Command::Remove(address, reply) => {
                    let _ = reply.send(self.routing.remove(&address));
                }
                Command::Contains(address, reply) => {
                    let _ = reply.send(self.routing.contains(&address));
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.routing.snapshot());
                }
                Command::StaleRecords(staleness, max, reply) => {
                    let stale = self.routing.stale_records(staleness, max, Instant::now());
                    let _ = reply.send(stale);
                }
                Command::CacheHeads(reply) => {
                    let _ = reply.send(self.routing.cache_heads());
                }
                Command::DropCandidate(address) => {
                    self.routing.drop_candidate(&address);
                }
                Command::Promote(peer, latency, at, reply) => {
                    let _ = reply.send(self.routing.promote(peer, Some(latency), at));
                }
                Command::Replace { incumbent, incumbent_seen, candidate, latency, seen_at, reply } => {
                    let replaced =
                        self.routing
                            .replace(&incumbent, incumbent_seen, candidate, Some(latency), seen_at);
                    let _ = reply.send(replaced);
                }
                Command::Quit => break,
            }
        }
        trace!("discovery actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::sleep;

    use crate::identity::{Keypair, bucket_index};
    use crate::routing::MAX_REFRESH_FAILURES;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[derive(Clone, Default)]
    struct TestNetwork {
        alive: Arc<Mutex<HashSet<Address>>>,
        latencies: Arc<Mutex<HashMap<Address, Duration>>>,
        neighbors: Arc<Mutex<HashMap<Address, Vec<Peer>>>>,
        probes: Arc<Mutex<Vec<Address>>>,
    }

    impl TestNetwork {
        async fn set_alive(&self, peer: &Peer, alive: bool) {
            let mut set = self.alive.lock().await;
            if alive { set.insert(peer.address); } else { set.remove(&peer.address); }
        }

        async fn set_latency(&self, peer: &Peer, latency: Duration) {
            self.latencies.lock().await.insert(peer.address, latency);
        }

        async fn set_neighbors(&self, peer: &Peer, neighbors: Vec<Peer>) {
            self.neighbors.lock().await.insert(peer.address, neighbors);
        }

        async fn probe_calls(&self) -> Vec<Address> {
            self.probes.lock().await.clone()
        }

        async fn is_alive(&self, address: &Address) -> bool {
            self.alive.lock().await.contains(address)
        }

        /// Silent peers hold the caller until its timeout or cancellation.
        async fn wait_out(&self, to: &Peer, timeout: Duration, cancel: &CancellationToken) -> anyhow::Error {
            tokio::select! {
                _ = cancel.cancelled() => RpcError::Cancelled.into(),
                _ = sleep(timeout) => RpcError::Timeout {
                    peer: to.address,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into(),
            }
        }
    }

    #[async_trait]
    impl DiscoveryRpc for TestNetwork {
        async fn probe(&self, to: &Peer, timeout: Duration, cancel: &CancellationToken) -> Result<Duration> {
            self.probes.lock().await.push(to.address);
            if !self.is_alive(&to.address).await {
                return Err(self.wait_out(to, timeout, cancel).await);
            }
            let latency = self
                .latencies
                .lock()
                .await
                .get(&to.address)
                .copied()
                .unwrap_or(Duration::from_millis(1));
            sleep(latency).await;
            Ok(latency)
        }

        async fn neighbors(
            &self,
            to: &Peer,
            _target: Address,
            timeout: Duration,
            cancel: &CancellationToken,
        ) -> Result<Vec<Peer>> {
            if !self.is_alive(&to.address).await {
                return Err(self.wait_out(to, timeout, cancel).await);
            }
            Ok(self.neighbors.lock().await.get(&to.address).cloned().unwrap_or_default())
        }
    }

    fn random_peer() -> Peer {
        Peer::new(Keypair::generate().identity(), "10.0.0.1:9001")
    }

    fn peer_in_bucket(local: &Address, idx: usize) -> Peer {
        loop {
            let peer = random_peer();
            if bucket_index(local, &peer.address) == idx {
                return peer;
            }
        }
    }

    fn node() -> (DiscoveryNode<TestNetwork>, TestNetwork) {
        let network = TestNetwork::default();
        let node = DiscoveryNode::new(Keypair::generate().address(), Arc::new(network.clone()));
        (node, network)
    }

    #[tokio::test(start_paused = true)]
    async fn add_peers_isolates_silent_candidate() {
        let (node, network) = node();
        let a = random_peer();
        let b = random_peer();
        let c = random_peer();
        network.set_alive(&a, true).await;
        network.set_alive(&c, true).await;
        network.set_latency(&a, Duration::from_millis(30)).await;
        network.set_latency(&c, Duration::from_millis(60)).await;

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let admitted = node
            .add_peers(vec![a.clone(), b.clone(), c.clone()], TIMEOUT, &cancel)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        let admitted: HashSet<Address> = admitted.iter().map(|p| p.address).collect();
        assert_eq!(admitted, HashSet::from([a.address, c.address]));
        assert!(elapsed < TIMEOUT * 2, "fan-out took {:?}", elapsed);
        assert!(!node.contains(b.address).await);

        let snapshot = node.snapshot().await;
        let a_record = snapshot.iter().find(|r| r.peer == a).unwrap();
        assert_eq!(a_record.latency, Some(Duration::from_millis(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_table_refresh_sends_no_probes() {
        let (node, network) = node();
        for _ in 0..4 {
            node.record_contact(random_peer(), None).await;
        }

        let stats = node
            .refresh_table(Duration::from_secs(60), usize::MAX, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, RefreshStats::default());
        assert!(network.probe_calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_is_capped_oldest_first() {
        let (node, network) = node();
        let mut peers = Vec::new();
        for _ in 0..5 {
            let peer = random_peer();
            network.set_alive(&peer, true).await;
            node.record_contact(peer.clone(), None).await;
            peers.push(peer);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        tokio::time::advance(Duration::from_secs(200)).await;

        let stats = node
            .refresh_table(Duration::from_secs(120), 2, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.probed, 2);
        assert_eq!(stats.refreshed, 2);
        let probed: HashSet<Address> = network.probe_calls().await.into_iter().collect();
        assert_eq!(probed, HashSet::from([peers[0].address, peers[1].address]));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_evicts_only_after_repeated_silence() {
        let (node, network) = node();
        let live = random_peer();
        let dead = random_peer();
        network.set_alive(&live, true).await;
        node.record_contact(live.clone(), None).await;
        node.record_contact(dead.clone(), None).await;

        let cancel = CancellationToken::new();
        for round in 1..=MAX_REFRESH_FAILURES {
            tokio::time::advance(Duration::from_secs(121)).await;
            let stats = node
                .refresh_table(Duration::from_secs(120), usize::MAX, TIMEOUT, &cancel)
                .await
                .unwrap();
            assert_eq!(stats.refreshed, 1);
            let expected_present = round < MAX_REFRESH_FAILURES;
            assert_eq!(node.contains(dead.address).await, expected_present, "round {}", round);
        }
        assert!(node.contains(live.address).await);
        let record = node.snapshot().await.into_iter().find(|r| r.peer == live).unwrap();
        assert!(record.latency.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn live_candidate_replaces_dead_incumbent() {
        let network = TestNetwork::default();
        let local = Keypair::generate().address();
        let table = RoutingTable::with_limits(local, 2, 4);
        let node = DiscoveryNode::with_table(table, Arc::new(network.clone()));

        let incumbent = peer_in_bucket(&local, 0);
        let survivor = peer_in_bucket(&local, 0);
        let candidate = peer_in_bucket(&local, 0);
        node.record_contact(incumbent.clone(), None).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        node.record_contact(survivor.clone(), None).await;
        assert_eq!(node.record_contact(candidate.clone(), None).await, AddOutcome::Cached);

        network.set_alive(&survivor, true).await;
        network.set_alive(&candidate, true).await;

        let stats = node
            .check_replacement_cache(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.promoted, 1);
        assert!(node.contains(candidate.address).await);
        assert!(!node.contains(incumbent.address).await);
        assert!(node.contains(survivor.address).await);
    }

    #[tokio::test(start_paused = true)]
    async fn live_incumbent_keeps_its_slot() {
        let network = TestNetwork::default();
        let local = Keypair::generate().address();
        let node = DiscoveryNode::with_table(RoutingTable::with_limits(local, 1, 4), Arc::new(network.clone()));

        let incumbent = peer_in_bucket(&local, 0);
        let candidate = peer_in_bucket(&local, 0);
        node.record_contact(incumbent.clone(), None).await;
        node.record_contact(candidate.clone(), None).await;
        network.set_alive(&incumbent, true).await;
        network.set_alive(&candidate, true).await;

        let stats = node
            .check_replacement_cache(TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, CacheStats { promoted: 0, dropped: 0, retained: 1 });
        assert!(node.contains(incumbent.address).await);
        assert!(!node.contains(candidate.address).await);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_candidate_is_dropped() {
        let network = TestNetwork::default();
        let local = Keypair::generate().address();
        let node = DiscoveryNode::with_table(RoutingTable::with_limits(local, 1, 4), Arc::new(network.clone()));

        node.record_contact(peer_in_bucket(&local, 0), None).await;
        node.record_contact(peer_in_bucket(&local, 0), None).await;

        let cancel = CancellationToken::new();
        let stats = node.check_replacement_cache(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(stats.dropped, 1);
        let again = node.check_replacement_cache(TIMEOUT, &cancel).await.unwrap();
        assert_eq!(again, CacheStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_admits_only_verified_neighbors() {
        let (node, network) = node();
        let known = random_peer();
        let reachable = random_peer();
        let unreachable = random_peer();
        network.set_alive(&known, true).await;
        network.set_alive(&reachable, true).await;
        network
            .set_neighbors(&known, vec![reachable.clone(), unreachable.clone(), known.clone()])
            .await;
        node.record_contact(known.clone(), None).await;

        let stats = node
            .rebuild_connections(1, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.queried, 1);
        assert_eq!(stats.discovered, 2);
        assert_eq!(stats.admitted, 1);
        assert!(node.contains(reachable.address).await);
        assert!(!node.contains(unreachable.address).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_on_empty_table_is_a_noop() {
        let (node, _network) = node();
        let stats = node
            .rebuild_connections(DEFAULT_MAX_DEPTH, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, RebuildStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn static_peer_restored_after_eviction() {
        let (node, network) = node();
        let pinned = random_peer();
        network.set_alive(&pinned, true).await;
        let cancel = CancellationToken::new();

        node.add_peers(vec![pinned.clone()], TIMEOUT, &cancel).await.unwrap();
        assert!(node.remove(pinned.address).await.is_some());
        assert!(!node.contains(pinned.address).await);

        let restored = node
            .heal_static_peers(std::slice::from_ref(&pinned), TIMEOUT, &cancel)
            .await
            .unwrap();
        assert_eq!(restored, vec![pinned.clone()]);
        assert!(node.contains(pinned.address).await);

        let nothing = node.heal_static_peers(&[pinned], TIMEOUT, &cancel).await.unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn static_peer_reclaims_slot_in_full_bucket() {
        let network = TestNetwork::default();
        let local = Keypair::generate().address();
        let node = DiscoveryNode::with_table(
            RoutingTable::with_limits(local, 1, 4),
            Arc::new(network.clone()),
        );
        let pinned = peer_in_bucket(&local, 0);
        let usurper = peer_in_bucket(&local, 0);
        network.set_alive(&pinned, true).await;
        network.set_alive(&usurper, true).await;
        let cancel = CancellationToken::new();

        node.add_peers(vec![pinned.clone()], TIMEOUT, &cancel).await.unwrap();
        node.remove(pinned.address).await;
        assert_eq!(node.record_contact(usurper.clone(), None).await, AddOutcome::Accepted);

        let restored = node
            .heal_static_peers(std::slice::from_ref(&pinned), TIMEOUT, &cancel)
            .await
            .unwrap();
        assert_eq!(restored, vec![pinned.clone()]);
        assert!(node.contains(pinned.address).await);
        assert!(!node.contains(usurper.address).await);

        let again = node.heal_static_peers(&[pinned], TIMEOUT, &cancel).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_fan_out_promptly() {
        let (node, _network) = node();
        let silent: Vec<Peer> = (0..8).map(|_| random_peer()).collect();
        let cancel = CancellationToken::new();

        let task_node = node.clone();
        let task_cancel = cancel.clone();
        let fan_out = tokio::spawn(async move {
            task_node.add_peers(silent, Duration::from_secs(60), &task_cancel).await
        });

        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), fan_out)
            .await
            .expect("fan-out must stop promptly")
            .unwrap()
            .unwrap_err();
        assert!(is_cancelled(&err));
    }

    #[tokio::test]
    async fn observe_refreshes_without_latency() {
        let (node, _network) = node();
        let peer = random_peer();
        node.record_contact(peer.clone(), Some(Duration::from_millis(12))).await;
        node.observe(peer.clone()).await;

        let closest = node.closest(peer.address, 4).await;
        assert_eq!(closest, vec![peer.clone()]);
        let record = node.snapshot().await.into_iter().next().unwrap();
        assert_eq!(record.latency, Some(Duration::from_millis(12)));
    }

    #[tokio::test]
    async fn closed_actor_answers_with_defaults() {
        let (node, _network) = node();
        node.quit().await;
        sleep(Duration::from_millis(20)).await;
        assert!(node.snapshot().await.is_empty());
        assert_eq!(node.record_contact(random_peer(), None).await, AddOutcome::Rejected);
    }
}
