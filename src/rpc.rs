//! # RPC Exchange
//!
//! Request/reply correlation layered over a fire-and-forget [`Transport`].
//!
//! Every outbound request gets a fresh random [`Token`] and a pending entry
//! holding a oneshot sender. The inbound dispatcher ([`serve_inbound`])
//! completes the entry when a reply with that token arrives from the peer the
//! request was sent to. The entry is removed on reply, timeout, cancellation
//! or when the caller's future is dropped, so abandoned requests never leak.
//!
//! Cancellation wins over a simultaneous timeout or reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::discovery::DiscoveryNode;
use crate::identity::{Address, Keypair, Peer};
use crate::messages::{Envelope, MAX_NEIGHBORS, Message, Token, fresh_token};
use crate::protocols::DiscoveryRpc;
use crate::transport::{Inbound, ReplyPath, Transport};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request to {peer} timed out after {timeout_ms} ms")]
    Timeout { peer: Address, timeout_ms: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("expected {expected} reply, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
    #[error("pending request abandoned")]
    Closed,
}

/// Whether `err` is (or wraps) a cancellation rather than a real failure.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<RpcError>(), Some(RpcError::Cancelled)))
}

struct PendingRequest {
    peer: Address,
    issued_at: Instant,
    tx: oneshot::Sender<Envelope>,
}

type PendingMap = Mutex<HashMap<Token, PendingRequest>>;

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<Token, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    token: Token,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.token);
    }
}

struct ExchangeInner {
    keypair: Keypair,
    local: Peer,
    version: u32,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
}

/// Cheap-to-clone handle for issuing probes and neighbor queries.
#[derive(Clone)]
pub struct RpcExchange {
    inner: Arc<ExchangeInner>,
}

impl RpcExchange {
    pub fn new(keypair: Keypair, local: Peer, version: u32, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                keypair,
                local,
                version,
                transport,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Requests currently awaiting a reply.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Drop every pending entry; waiters fail with [`RpcError::Closed`].
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.inner.pending).drain().collect();
        for (_, request) in &drained {
            trace!(
                peer = %request.peer,
                age_ms = request.issued_at.elapsed().as_millis() as u64,
                "abandoning pending request"
            );
        }
        drained.len()
    }

    fn seal(&self, token: Token, message: Message) -> Result<Envelope> {
        Ok(Envelope::seal(
            &self.inner.keypair,
            self.inner.version,
            token,
            self.inner.local.clone(),
            message,
        )?)
    }

    fn register(&self, peer: Address) -> (Token, oneshot::Receiver<Envelope>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.inner.pending);
        let token = loop {
            let token = fresh_token();
            if !pending.contains_key(&token) {
                break token;
            }
        };
        pending.insert(token, PendingRequest { peer, issued_at: Instant::now(), tx });
        (token, rx)
    }

    /// Send `message` to `to` and wait for the correlated reply.
    async fn request(
        &self,
        to: &Peer,
        message: Message,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(Envelope, Duration)> {
        let (token, rx) = self.register(to.address);
        let _guard = PendingGuard { pending: &self.inner.pending, token };

        let envelope = self.seal(token, message)?;
        let started = Instant::now();

        let exchange = async {
            self.inner
                .transport
                .send(&to.endpoint, &envelope)
                .await
                .map_err(|e| RpcError::Transport(format!("{:#}", e)))?;
            rx.await.map_err(|_| RpcError::Closed)
        };

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled.into()),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(reply) => reply?,
                Err(_) => {
                    return Err(RpcError::Timeout {
                        peer: to.address,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into())
                }
            },
        };
        Ok((reply, started.elapsed()))
    }

    /// Hand a reply to its waiting request. Returns `false` if nothing was
    /// waiting for it or it came from a peer other than the one asked.
    pub fn complete(&self, envelope: Envelope) -> bool {
        let mut pending = lock(&self.inner.pending);
        match pending.get(&envelope.token) {
            Some(request) if request.peer == envelope.sender.address => {}
            Some(request) => {
                warn!(
                    expected = %request.peer,
                    got = %envelope.sender.address,
                    "ignoring reply from unexpected responder"
                );
                return false;
            }
            None => return false,
        }
        let Some(request) = pending.remove(&envelope.token) else {
            return false;
        };
        drop(pending);
        request.tx.send(envelope).is_ok()
    }

    /// Answer an inbound request.
    pub async fn reply(&self, path: ReplyPath, token: Token, message: Message) -> Result<()> {
        let envelope = self.seal(token, message)?;
        path.send(envelope).await
    }
}

#[async_trait]
impl DiscoveryRpc for RpcExchange {
    async fn probe(&self, to: &Peer, timeout: Duration, cancel: &CancellationToken) -> Result<Duration> {
        let (reply, rtt) = self.request(to, Message::Probe, timeout, cancel).await?;
        match reply.message {
            Message::ProbeAck => Ok(rtt),
            other => Err(RpcError::UnexpectedReply { expected: "probe_ack", got: other.kind() }.into()),
        }
    }

    async fn neighbors(
        &self,
        to: &Peer,
        target: Address,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>> {
        let (reply, _) = self
            .request(to, Message::NeighborQuery { target }, timeout, cancel)
            .await?;
        match reply.message {
            Message::NeighborReply { peers } => {
                let total = peers.len();
                let peers: Vec<Peer> = peers
                    .into_iter()
                    .filter(Peer::is_consistent)
                    .take(MAX_NEIGHBORS)
                    .collect();
                if peers.len() < total {
                    debug!(
                        peer = %to.address,
                        received = total,
                        kept = peers.len(),
                        "discarded peers from neighbor reply"
                    );
                }
                Ok(peers)
            }
            other => Err(RpcError::UnexpectedReply { expected: "neighbor_reply", got: other.kind() }.into()),
        }
    }
}

/// Dispatch inbound envelopes until `cancel` fires or the transport closes.
///
/// Every sender is observed in the routing table (refresh only, no latency);
/// replies complete pending requests; probes and neighbor queries are
/// answered from local state.
pub async fn serve_inbound<N: DiscoveryRpc>(
    rpc: RpcExchange,
    discovery: DiscoveryNode<N>,
    mut inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = inbound.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let Inbound { envelope, remote, reply } = item;

        let sender = envelope
            .sender
            .clone()
            .with_public_ip(remote.map(|addr| addr.ip()));
        discovery.observe(sender).await;

        if envelope.message.is_reply() {
            let from = envelope.sender.address;
            if !rpc.complete(envelope) {
                trace!(peer = %from, "unmatched reply");
            }
            continue;
        }

        let token = envelope.token;
        let response = match &envelope.message {
            Message::Probe => Message::ProbeAck,
            Message::NeighborQuery { target } => Message::NeighborReply {
                peers: discovery.closest(*target, MAX_NEIGHBORS).await,
            },
            Message::ProbeAck | Message::NeighborReply { .. } => continue,
        };

        let rpc = rpc.clone();
        let endpoint = envelope.sender.endpoint.clone();
        tokio::spawn(async move {
            let result = match reply {
                Some(path) => rpc.reply(path, token, response).await,
                None => match rpc.seal(token, response) {
                    Ok(env) => rpc.transport().send(&endpoint, &env).await,
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = result {
                debug!(endpoint = %endpoint, error = %e, "failed to send reply");
            }
        });
    }
    debug!("inbound dispatcher stopped");
}
