//! # Seed Node
//!
//! [`SeedNode`] wires the transport, the [`RpcExchange`] and the
//! [`DiscoveryNode`] together and runs the maintenance schedule:
//!
//! | Loop | Interval | Work |
//! |------|----------|------|
//! | refresh | `refresh_interval` | `refresh_table`, then `check_replacement_cache` |
//! | rebuild | `rebuild_interval` | `rebuild_connections` |
//! | static peers | `static_peer_interval` | `heal_static_peers` (only with pinned peers) |
//!
//! Each loop waits one interval, runs its work, logs anything that is not a
//! cancellation and goes around again. A single [`CancellationToken`] ends
//! every loop and drives the node through `Stopping` to `Stopped`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SeedConfig;
use crate::discovery::DiscoveryNode;
use crate::identity::{Address, Keypair, Peer};
use crate::rpc::{RpcExchange, is_cancelled, serve_inbound};
use crate::transport::{Transport, bind_transport};

/// Inbound envelopes buffered between the transport and the dispatcher.
const INBOUND_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct SeedNode {
    config: SeedConfig,
    local: Peer,
    transport: Arc<dyn Transport>,
    rpc: RpcExchange,
    discovery: DiscoveryNode<RpcExchange>,
    state: watch::Sender<NodeState>,
}

impl SeedNode {
    /// Validate `config` and bind the configured transport. Nothing runs
    /// until [`run`](Self::run) is called.
    pub async fn bind(config: SeedConfig, keypair: Keypair) -> Result<Self> {
        config.validate()?;
        for relay in &config.relay_servers {
            info!(relay = %relay, "relay server configured");
        }

        let listen = config.listen_addr();
        let transport = bind_transport(
            config.transport,
            &listen,
            config.workers,
            config.app_protocol_version,
        )
        .await
        .with_context(|| format!("failed to bind {} transport on {}", config.transport, listen))?;

        let local = Peer::new(
            keypair.identity(),
            config.advertised_endpoint(transport.local_addr()),
        );
        let rpc = RpcExchange::new(
            keypair,
            local.clone(),
            config.app_protocol_version,
            transport.clone(),
        );
        let discovery = DiscoveryNode::new(local.address, Arc::new(rpc.clone()));
        let (state, _) = watch::channel(NodeState::NotStarted);

        info!(
            address = %local.address,
            identity = %local.identity,
            endpoint = %local.endpoint,
            transport = %config.transport,
            "seed node bound"
        );

        Ok(Self { config, local, transport, rpc, discovery, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    pub fn address(&self) -> Address {
        self.local.address
    }

    pub fn config(&self) -> &SeedConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoveryNode<RpcExchange> {
        &self.discovery
    }

    pub fn rpc(&self) -> &RpcExchange {
        &self.rpc
    }

    /// Lifecycle updates. The current value is readable immediately.
    pub fn state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires, then shut down within the configured grace
    /// period. A node runs at most once.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == NodeState::NotStarted {
                *state = NodeState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            bail!("seed node already started");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        if let Err(e) = self.transport.start(inbound_tx).await {
            self.state.send_replace(NodeState::Stopped);
            return Err(e.context("failed to start transport"));
        }
        tokio::select! {
            _ = self.transport.wait_until_running() => {}
            _ = cancel.cancelled() => {
                self.shutdown(JoinSet::new()).await;
                return Ok(());
            }
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(serve_inbound(
            self.rpc.clone(),
            self.discovery.clone(),
            inbound_rx,
            cancel.clone(),
        ));
        self.state.send_replace(NodeState::Running);
        info!(local_addr = %self.local_addr(), "seed node running");

        self.bootstrap(&cancel).await;
        self.spawn_maintenance(&mut tasks, &cancel);

        cancel.cancelled().await;
        self.shutdown(tasks).await;
        Ok(())
    }

    async fn bootstrap(&self, cancel: &CancellationToken) {
        let pinned = self.config.static_peer_set();
        if pinned.is_empty() {
            return;
        }
        let configured = pinned.len();
        match self
            .discovery
            .add_peers(pinned, self.config.static_peer_timeout, cancel)
            .await
        {
            Ok(admitted) => info!(admitted = admitted.len(), configured, "bootstrapped from static peers"),
            Err(e) if is_cancelled(&e) => debug!("bootstrap cancelled"),
            Err(e) => warn!(error = %e, "bootstrap failed"),
        }
    }

    fn spawn_maintenance(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) {
        let config = &self.config;

        let discovery = self.discovery.clone();
        let (lifetime, max_peers, timeout) =
            (config.peer_lifetime, config.max_peers_to_refresh, config.ping_timeout);
        let token = cancel.clone();
        tasks.spawn(maintain("refresh", config.refresh_interval, cancel.clone(), move || {
            let discovery = discovery.clone();
            let cancel = token.clone();
            async move {
                discovery.refresh_table(lifetime, max_peers, timeout, &cancel).await?;
                discovery.check_replacement_cache(timeout, &cancel).await?;
                Ok(())
            }
        }));

        let discovery = self.discovery.clone();
        let depth = config.rebuild_depth;
        let token = cancel.clone();
        tasks.spawn(maintain("rebuild", config.rebuild_interval, cancel.clone(), move || {
            let discovery = discovery.clone();
            let cancel = token.clone();
            async move {
                discovery.rebuild_connections(depth, timeout, &cancel).await?;
                Ok(())
            }
        }));

        let pinned: Arc<[Peer]> = config.static_peer_set().into();
        if pinned.is_empty() {
            return;
        }
        let discovery = self.discovery.clone();
        let static_timeout = config.static_peer_timeout;
        let token = cancel.clone();
        tasks.spawn(maintain("static peers", config.static_peer_interval, cancel.clone(), move || {
            let discovery = discovery.clone();
            let pinned = pinned.clone();
            let cancel = token.clone();
            async move {
                discovery.heal_static_peers(&pinned, static_timeout, &cancel).await?;
                Ok(())
            }
        }));
    }

    async fn shutdown(&self, mut tasks: JoinSet<()>) {
        self.state.send_replace(NodeState::Stopping);
        info!("stopping seed node");
        let grace = self.config.shutdown_grace;

        self.transport.stop(grace).await;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "maintenance tasks did not stop in time, aborting");
            tasks.abort_all();
        }

        let abandoned = self.rpc.abandon_all();
        if abandoned > 0 {
            debug!(abandoned, "abandoned outstanding requests");
        }
        self.discovery.quit().await;
        self.state.send_replace(NodeState::Stopped);
        info!("seed node stopped");
    }
}

/// Repeat `tick` every `interval` until cancelled. Failures other than
/// cancellation are logged and the loop carries on.
async fn maintain<F, Fut>(name: &'static str, interval: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match tick().await {
            Ok(()) => {}
            Err(e) if is_cancelled(&e) => break,
            Err(e) => warn!(task = name, error = %e, "maintenance tick failed"),
        }
    }
    debug!(task = name, "maintenance loop stopped");
}
