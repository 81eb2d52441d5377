//! # Korium Seed - Peer Discovery Seed Node
//!
//! A seed node keeps a routing table of reachable peers so that newcomers to
//! the overlay have somewhere to bootstrap from. It does not relay traffic or
//! store application data; it only discovers peers, checks that they are
//! alive, and answers neighbor queries.
//!
//! ## Architecture
//!
//! - The routing table is owned by a single actor behind the
//!   [`DiscoveryNode`] handle; every table operation is one command.
//! - The discovery protocol talks to peers through the [`DiscoveryRpc`]
//!   trait, implemented by [`RpcExchange`] on top of a [`Transport`].
//! - [`SeedNode`] runs the maintenance loops and owns the lifecycle; a
//!   single `CancellationToken` shuts everything down.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key; the routing address is derived from it
//! - Every envelope is signed and verified before it reaches the protocol
//! - Envelopes from other app protocol versions are dropped
//! - Frames, neighbor replies and tables are all bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Seed node orchestration and maintenance loops |
//! | `identity` | Keypairs, identities, addresses, XOR distance |
//! | `crypto` | Domain-separated envelope signatures |
//! | `routing` | Bucketed routing table with replacement caches |
//! | `discovery` | AddPeers, RefreshTable, CheckReplacementCache, RebuildConnections |
//! | `transport` | TCP stream and UDP queue transports |
//! | `protocols` | Protocol trait definitions (`DiscoveryRpc`) |
//! | `rpc` | Request correlation, timeouts, inbound dispatch |
//! | `messages` | Wire envelope and message codec |
//! | `config` | Configuration surface and validation |
//! | `report` | Read-only HTTP peer report |

mod crypto;
pub mod config;
pub mod discovery;
mod identity;
mod messages;
mod node;
mod protocols;
mod report;
pub mod routing;
mod rpc;
mod transport;

pub use config::{ConfigError, LogLevel, RelayServer, SeedConfig, StaticPeer, TransportKind};
pub use discovery::{CacheStats, DiscoveryNode, RebuildStats, RefreshStats};
pub use identity::{Address, Identity, Keypair, Peer};
pub use messages::{Envelope, Message};
pub use node::{NodeState, SeedNode};
pub use protocols::DiscoveryRpc;
pub use report::{FieldDescriptor, PeerReport, ReportApi};
pub use routing::{AddOutcome, PeerRecord, RoutingTable};
pub use rpc::{RpcError, RpcExchange, is_cancelled};
pub use transport::Transport;
