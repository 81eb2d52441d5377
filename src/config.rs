//! Seed node configuration.
//!
//! [`SeedConfig`] carries every tunable of the node as already-parsed values.
//! The binary builds it from command-line flags; tests build it directly.
//! [`SeedConfig::validate`] must pass before anything is bound or spawned.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::identity::{Identity, Peer};

/// Fatal configuration problems, reported before startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown transport type {0:?} (expected \"tcp\" or \"queue\")")]
    UnknownTransport(String),
    #[error("unknown log level {0:?} (expected error, warning, information, debug or verbose)")]
    UnknownLogLevel(String),
    #[error("-h/--host is required if -I/--ice-server is not given")]
    MissingHost,
    #[error("invalid peer {input:?}: {reason}")]
    InvalidPeer { input: String, reason: String },
    #[error("invalid relay server {input:?}: {reason}")]
    InvalidRelay { input: String, reason: String },
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Tcp,
    Queue,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "queue" => Ok(TransportKind::Queue),
            _ => Err(ConfigError::UnknownTransport(s.to_string())),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Queue => f.write_str("queue"),
        }
    }
}

/// Minimum severity for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Information,
    Debug,
    Verbose,
}

impl LogLevel {
    /// Equivalent `tracing` filter directive.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Information => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "information" | "info" => Ok(LogLevel::Information),
            "debug" => Ok(LogLevel::Debug),
            "verbose" | "trace" => Ok(LogLevel::Verbose),
            _ => Err(ConfigError::UnknownLogLevel(s.to_string())),
        }
    }
}

/// A peer that must always be present in the routing table.
///
/// Parsed from `publickeyhex,host,port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPeer {
    pub identity: Identity,
    pub host: String,
    pub port: u16,
}

impl StaticPeer {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.identity, self.endpoint())
    }
}

impl FromStr for StaticPeer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidPeer {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [key, host, port] = parts.as_slice() else {
            return Err(invalid("expected a comma-separated triple of public key, host and port"));
        };
        let identity = Identity::from_hex(key).map_err(|_| invalid("public key must be 64 hex characters"))?;
        if !identity.is_valid() {
            return Err(invalid("public key is not a valid Ed25519 key"));
        }
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number in 0..=65535"))?;

        Ok(Self { identity, host: host.to_string(), port })
    }
}

impl fmt::Display for StaticPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.identity.to_hex(), self.host, self.port)
    }
}

/// NAT relay (TURN/STUN) server descriptor:
/// `scheme://[user[:credential]@]host:port`.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credential: Option<String>,
}

const RELAY_SCHEMES: &[&str] = &["turn", "turns", "stun", "stuns"];

impl FromStr for RelayServer {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidRelay {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let scheme = scheme.to_ascii_lowercase();
        if !RELAY_SCHEMES.contains(&scheme.as_str()) {
            return Err(invalid("scheme must be turn, turns, stun or stuns"));
        }

        let (user_info, host_port) = match rest.rsplit_once('@') {
            Some((user_info, host_port)) => (Some(user_info), host_port),
            None => (None, rest),
        };
        let (username, credential) = match user_info {
            Some(info) => match info.split_once(':') {
                Some((user, cred)) => (Some(user.to_string()), Some(cred.to_string())),
                None => (Some(info.to_string()), None),
            },
            None => (None, None),
        };

        let host_port = host_port.trim_end_matches('/');
        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            username,
            credential,
        })
    }
}

impl fmt::Display for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// Credentials stay out of logs.
impl fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayServer")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SeedConfig {
    /// Host to listen on and advertise. Optional when a relay is configured.
    pub host: Option<String>,
    /// Listen port; `0` picks an ephemeral port.
    pub port: u16,
    pub transport: TransportKind,
    /// Concurrent message workers (queue transport only).
    pub workers: usize,
    pub relay_servers: Vec<RelayServer>,
    pub app_protocol_version: u32,
    pub static_peers: Vec<StaticPeer>,
    pub refresh_interval: Duration,
    /// Age after which a record is considered stale and re-probed.
    pub peer_lifetime: Duration,
    pub max_peers_to_refresh: usize,
    pub ping_timeout: Duration,
    pub rebuild_interval: Duration,
    pub rebuild_depth: usize,
    pub static_peer_interval: Duration,
    pub static_peer_timeout: Duration,
    pub shutdown_grace: Duration,
    /// `host:port` for the read-only peer report, if served.
    pub report_addr: Option<String>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            transport: TransportKind::Tcp,
            workers: 30,
            relay_servers: Vec::new(),
            app_protocol_version: 1,
            static_peers: Vec::new(),
            refresh_interval: Duration::from_secs(5),
            peer_lifetime: Duration::from_secs(120),
            max_peers_to_refresh: usize::MAX,
            ping_timeout: Duration::from_secs(5),
            rebuild_interval: Duration::from_secs(10 * 60),
            rebuild_depth: crate::discovery::DEFAULT_MAX_DEPTH,
            static_peer_interval: Duration::from_secs(60),
            static_peer_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            report_addr: Some("localhost:5000".to_string()),
        }
    }
}

impl SeedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.host, self.relay_servers.is_empty()) {
            (None, true) => return Err(ConfigError::MissingHost),
            (Some(_), false) => {
                warn!("-I/--ice-server will not be used because -h/--host is given");
            }
            _ => {}
        }
        if self.transport == TransportKind::Queue && self.workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        let durations = [
            (self.refresh_interval, "refresh interval"),
            (self.peer_lifetime, "peer lifetime"),
            (self.ping_timeout, "ping timeout"),
            (self.rebuild_interval, "rebuild interval"),
            (self.static_peer_interval, "static peer interval"),
            (self.static_peer_timeout, "static peer timeout"),
        ];
        for (value, name) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.max_peers_to_refresh == 0 {
            return Err(ConfigError::Zero("maximum peers to refresh"));
        }
        Ok(())
    }

    /// Address the transport binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("0.0.0.0"), self.port)
    }

    /// Endpoint advertised to other peers once bound to `local_port`.
    pub fn advertised_endpoint(&self, local: std::net::SocketAddr) -> String {
        match &self.host {
            Some(host) => format!("{}:{}", host, local.port()),
            None => local.to_string(),
        }
    }

    pub fn static_peer_set(&self) -> Vec<Peer> {
        self.static_peers.iter().map(StaticPeer::peer).collect()
    }
}
