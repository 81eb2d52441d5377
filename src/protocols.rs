//! Protocol trait definitions for the seed node's discovery layer.
//!
//! The discovery protocol only depends on [`DiscoveryRpc`], never on a
//! concrete transport, so it can be driven by the real [`RpcExchange`] or by
//! an in-process test network.
//!
//! [`RpcExchange`]: crate::rpc::RpcExchange

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::identity::{Address, Peer};

/// Outbound discovery RPCs. Each call is independent: a failure for one peer
/// carries no state into calls to another.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync + 'static {
    /// Liveness probe. Returns the measured round-trip time.
    async fn probe(&self, to: &Peer, timeout: Duration, cancel: &CancellationToken) -> Result<Duration>;

    /// Ask `to` for its closest known peers to `target` (at most K).
    async fn neighbors(
        &self,
        to: &Peer,
        target: Address,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Peer>>;
}
