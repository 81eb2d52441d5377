//! Read-only peer report over HTTP.
//!
//! - `GET /peers`: every record in the routing table as a [`PeerReport`]
//! - `GET /schema`: field descriptors for [`PeerReport`]
//!
//! The schema is built once when the [`ReportApi`] is constructed and owned
//! by it. Nothing here mutates the table.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::discovery::DiscoveryNode;
use crate::protocols::DiscoveryRpc;
use crate::routing::PeerRecord;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerReport {
    pub address: String,
    pub endpoint: String,
    pub public_ip: Option<IpAddr>,
    /// Unix time of the last contact, in milliseconds.
    pub last_updated_ms: u64,
    pub latency_ms: Option<u64>,
    pub stale_ms: u64,
}

impl PeerReport {
    pub fn from_record(record: &PeerRecord, now_ms: u64) -> Self {
        let stale_ms = record.staleness().as_millis() as u64;
        Self {
            address: record.peer.address.to_hex(),
            endpoint: record.peer.endpoint.clone(),
            public_ip: record.peer.public_ip,
            last_updated_ms: now_ms.saturating_sub(stale_ms),
            latency_ms: record.latency.map(|l| l.as_millis() as u64),
            stale_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDescriptor {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub nullable: bool,
    pub description: &'static str,
}

fn peer_schema() -> Vec<FieldDescriptor> {
    let field = |name, kind, nullable, description| FieldDescriptor { name, kind, nullable, description };
    vec![
        field("address", "string", false, "Hex-encoded routing address"),
        field("endpoint", "string", false, "host:port the peer is reached at"),
        field("public_ip", "string", true, "Source IP observed on the peer's last message"),
        field("last_updated_ms", "integer", false, "Unix time of the last contact in milliseconds"),
        field("latency_ms", "integer", true, "Last measured round-trip time in milliseconds"),
        field("stale_ms", "integer", false, "Milliseconds since the last contact"),
    ]
}

pub struct ReportApi<N: DiscoveryRpc> {
    discovery: DiscoveryNode<N>,
    schema: Arc<Vec<FieldDescriptor>>,
}

impl<N: DiscoveryRpc> Clone for ReportApi<N> {
    fn clone(&self) -> Self {
        Self {
            discovery: self.discovery.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl<N: DiscoveryRpc> ReportApi<N> {
    pub fn new(discovery: DiscoveryNode<N>) -> Self {
        Self {
            discovery,
            schema: Arc::new(peer_schema()),
        }
    }

    pub async fn peers(&self) -> Vec<PeerReport> {
        let now = now_ms();
        let mut reports: Vec<PeerReport> = self
            .discovery
            .snapshot()
            .await
            .iter()
            .map(|r| PeerReport::from_record(r, now))
            .collect();
        reports.sort_by_key(|r| r.stale_ms);
        reports
    }

    pub fn schema(&self) -> &[FieldDescriptor] {
        &self.schema
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/peers", get(list_peers::<N>))
            .route("/schema", get(schema::<N>))
            .with_state(self.clone())
    }

    /// Serve the report on `addr` until `cancel` fires.
    pub async fn serve(self, addr: &str, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind report API on {}", addr))?;
        info!(addr = %listener.local_addr()?, "report API listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("report API failed")
    }
}

async fn list_peers<N: DiscoveryRpc>(State(api): State<ReportApi<N>>) -> Json<Vec<PeerReport>> {
    Json(api.peers().await)
}

async fn schema<N: DiscoveryRpc>(State(api): State<ReportApi<N>>) -> Json<Vec<FieldDescriptor>> {
    Json(api.schema.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::identity::{Address, Keypair, Peer};

    struct Offline;

    #[async_trait]
    impl DiscoveryRpc for Offline {
        async fn probe(&self, _: &Peer, _: Duration, _: &CancellationToken) -> Result<Duration> {
            Err(anyhow!("offline"))
        }

        async fn neighbors(&self, _: &Peer, _: Address, _: Duration, _: &CancellationToken) -> Result<Vec<Peer>> {
            Err(anyhow!("offline"))
        }
    }

    fn api() -> ReportApi<Offline> {
        ReportApi::new(DiscoveryNode::new(Keypair::generate().address(), Arc::new(Offline)))
    }

    #[tokio::test]
    async fn peers_reports_every_record() {
        let api = api();
        let peer = Peer::new(Keypair::generate().identity(), "10.1.2.3:4000")
            .with_public_ip(Some("203.0.113.7".parse().unwrap()));
        api.discovery.record_contact(peer.clone(), Some(Duration::from_millis(42))).await;
        api.discovery.record_contact(Peer::new(Keypair::generate().identity(), "10.1.2.4:4000"), None).await;

        let Json(reports) = list_peers(State(api.clone())).await;
        assert_eq!(reports.len(), 2);
        let report = reports.iter().find(|r| r.address == peer.address.to_hex()).unwrap();
        assert_eq!(report.endpoint, "10.1.2.3:4000");
        assert_eq!(report.public_ip, peer.public_ip);
        assert_eq!(report.latency_ms, Some(42));
        assert!(report.last_updated_ms <= now_ms());

        assert_eq!(api.discovery.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn schema_matches_report_fields() {
        let api = api();
        let record = {
            let peer = Peer::new(Keypair::generate().identity(), "10.1.2.3:4000");
            api.discovery.record_contact(peer, None).await;
            api.discovery.snapshot().await.remove(0)
        };
        let value = serde_json::to_value(PeerReport::from_record(&record, now_ms())).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();

        let Json(schema) = schema(State(api)).await;
        let mut names: Vec<&str> = schema.iter().map(|f| f.name).collect();
        let mut keys = keys;
        names.sort_unstable();
        keys.sort_unstable();
        assert_eq!(names, keys);
    }

    #[tokio::test]
    async fn empty_table_reports_nothing() {
        let api = api();
        assert!(api.peers().await.is_empty());
        assert_eq!(api.schema().len(), 6);
    }
}
