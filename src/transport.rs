//! # Message Transports
//!
//! Two interchangeable carriers for signed [`Envelope`]s, selected once at
//! startup by [`TransportKind`]:
//!
//! - [`TcpTransport`]: reliable stream transport. Each outbound message opens
//!   a connection, writes one length-prefixed frame and keeps reading replies
//!   from the same connection for a bounded window.
//! - [`QueueTransport`]: unreliable datagram queue over UDP. Received
//!   datagrams are handed to a bounded pool of workers.
//!
//! Both transports decode and verify every envelope (app protocol version,
//! sender address derivation, signature) before it reaches the inbound
//! channel; anything else is dropped. Replies travel back over a
//! [`ReplyPath`] attached to each inbound request.
//!
//! ## Frame Format (TCP)
//!
//! ```text
//! +----------------+----------------------+
//! | len: u32 (BE)  | bincode(Envelope)    |
//! +----------------+----------------------+
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket, lookup_host};
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::TransportKind;
use crate::messages::{Envelope, EnvelopeError, MAX_FRAME_SIZE};

/// How long an outbound connection waits for its replies.
const REPLY_WINDOW: Duration = Duration::from_secs(30);

/// Idle limit for an inbound connection between frames.
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Replies queued per inbound connection before writers apply backpressure.
const REPLY_QUEUE_DEPTH: usize = 32;

/// A verified envelope delivered by a transport.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: Envelope,
    /// Socket address the envelope arrived from.
    pub remote: Option<SocketAddr>,
    /// Where to answer a request; `None` for replies and one-way messages.
    pub reply: Option<ReplyPath>,
}

/// Return route to the sender of an inbound request.
#[derive(Debug)]
pub enum ReplyPath {
    Stream(mpsc::Sender<Envelope>),
    Datagram { socket: Arc<UdpSocket>, to: SocketAddr },
}

impl ReplyPath {
    pub async fn send(self, envelope: Envelope) -> Result<()> {
        match self {
            ReplyPath::Stream(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| anyhow!("connection closed before reply")),
            ReplyPath::Datagram { socket, to } => {
                let bytes = envelope.encode()?;
                socket.send_to(&bytes, to).await.context("failed to send reply datagram")?;
                Ok(())
            }
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    /// Begin delivering inbound envelopes to `inbound`.
    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()>;

    async fn wait_until_running(&self);

    /// Stop receiving; background tasks get `grace` to wind down.
    async fn stop(&self, grace: Duration);

    /// Fire-and-forget delivery of `envelope` to `endpoint` (`host:port`).
    async fn send(&self, endpoint: &str, envelope: &Envelope) -> Result<()>;
}

/// Bind the transport selected by `kind` on `addr`.
pub async fn bind_transport(
    kind: TransportKind,
    addr: &str,
    workers: usize,
    version: u32,
) -> Result<Arc<dyn Transport>> {
    Ok(match kind {
        TransportKind::Tcp => Arc::new(TcpTransport::bind(addr, version).await?),
        TransportKind::Queue => Arc::new(QueueTransport::bind(addr, workers, version).await?),
    })
}

fn open_envelope(bytes: &[u8], version: u32) -> Result<Envelope, EnvelopeError> {
    let envelope = Envelope::decode(bytes)?;
    envelope.verify(version)?;
    Ok(envelope)
}

/// Verify and forward one received frame. Returns `false` once the inbound
/// channel is gone.
async fn deliver(
    bytes: &[u8],
    version: u32,
    remote: SocketAddr,
    reply: Option<ReplyPath>,
    inbound: &mpsc::Sender<Inbound>,
) -> bool {
    match open_envelope(bytes, version) {
        Ok(envelope) => {
            trace!(
                remote = %remote,
                kind = envelope.message.kind(),
                peer = %envelope.sender.address,
                "received envelope"
            );
            inbound
                .send(Inbound { envelope, remote: Some(remote), reply })
                .await
                .is_ok()
        }
        Err(e) => {
            debug!(remote = %remote, error = %e, "dropping envelope");
            true
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds limit", bytes.len());
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        bail!("frame of {} bytes exceeds limit", len);
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Shared start/stop bookkeeping for both transports.
struct Lifecycle {
    running: watch::Sender<bool>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    fn new() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    async fn wait_until_running(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| *running).await;
    }

    async fn stop(&self, grace: Duration) {
        self.shutdown.cancel();
        self.running.send_replace(false);
        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "transport did not stop in time, aborting");
            handle.abort();
        }
    }
}

// ============================================================================
// TCP Transport
// ============================================================================

pub struct TcpTransport {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    version: u32,
    inbound: OnceLock<mpsc::Sender<Inbound>>,
    lifecycle: Lifecycle,
}

impl TcpTransport {
    pub async fn bind(addr: &str, version: u32) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind tcp listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            version,
            inbound: OnceLock::new(),
            lifecycle: Lifecycle::new(),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        version: u32,
        inbound: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    trace!(remote = %remote, "accepted connection");
                    tokio::spawn(Self::serve_connection(
                        stream,
                        remote,
                        version,
                        inbound.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
        debug!("tcp accept loop stopped");
    }

    async fn serve_connection(
        stream: TcpStream,
        remote: SocketAddr,
        version: u32,
        inbound: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) {
        let (mut rd, mut wr) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(REPLY_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(envelope) = reply_rx.recv().await {
                let written = match envelope.encode() {
                    Ok(bytes) => write_frame(&mut wr, &bytes).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    debug!(remote = %remote, error = %e, "failed to write reply");
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, read_frame(&mut rd)) => frame,
            };
            match frame {
                Ok(Ok(Some(bytes))) => {
                    let reply = Some(ReplyPath::Stream(reply_tx.clone()));
                    if !deliver(&bytes, version, remote, reply, &inbound).await {
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!(remote = %remote, error = %e, "connection read failed");
                    break;
                }
                Err(_) => {
                    trace!(remote = %remote, "connection idle timeout");
                    break;
                }
            }
        }
    }

    async fn read_replies(
        mut stream: TcpStream,
        remote: SocketAddr,
        version: u32,
        inbound: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) {
        let deadline = tokio::time::Instant::now() + REPLY_WINDOW;
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = tokio::time::timeout_at(deadline, read_frame(&mut stream)) => frame,
            };
            match frame {
                Ok(Ok(Some(bytes))) => {
                    if !deliver(&bytes, version, remote, None, &inbound).await {
                        break;
                    }
                }
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(e)) => {
                    debug!(remote = %remote, error = %e, "reply read failed");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("tcp transport already started"))?;
        let _ = self.inbound.set(inbound.clone());

        let handle = tokio::spawn(Self::accept_loop(
            listener,
            self.version,
            inbound,
            self.lifecycle.shutdown.clone(),
        ));
        *self.lifecycle.task.lock().await = Some(handle);
        self.lifecycle.running.send_replace(true);
        debug!(addr = %self.local_addr, "tcp transport running");
        Ok(())
    }

    async fn wait_until_running(&self) {
        self.lifecycle.wait_until_running().await
    }

    async fn stop(&self, grace: Duration) {
        self.lifecycle.stop(grace).await
    }

    async fn send(&self, endpoint: &str, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", endpoint))?
            .with_context(|| format!("failed to connect to {}", endpoint))?;
        let remote = stream.peer_addr()?;

        write_frame(&mut stream, &bytes).await?;
        stream.shutdown().await?;

        if let Some(inbound) = self.inbound.get() {
            tokio::spawn(Self::read_replies(
                stream,
                remote,
                self.version,
                inbound.clone(),
                self.lifecycle.shutdown.child_token(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Queue (UDP) Transport
// ============================================================================

pub struct QueueTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    version: u32,
    workers: Arc<Semaphore>,
    lifecycle: Lifecycle,
}

impl QueueTransport {
    pub async fn bind(addr: &str, workers: usize, version: u32) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind udp socket on {}", addr))?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            version,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            lifecycle: Lifecycle::new(),
        })
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        version: u32,
        workers: Arc<Semaphore>,
        inbound: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let (len, remote) = match received {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "udp receive failed");
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = workers.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let datagram = buf[..len].to_vec();
            let reply_socket = socket.clone();
            let inbound = inbound.clone();
            tokio::spawn(async move {
                let reply = Some(ReplyPath::Datagram { socket: reply_socket, to: remote });
                deliver(&datagram, version, remote, reply, &inbound).await;
                drop(permit);
            });
        }
        debug!("udp receive loop stopped");
    }
}

#[async_trait]
impl Transport for QueueTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn start(&self, inbound: mpsc::Sender<Inbound>) -> Result<()> {
        let mut task = self.lifecycle.task.lock().await;
        if task.is_some() {
            bail!("queue transport already started");
        }
        *task = Some(tokio::spawn(Self::recv_loop(
            self.socket.clone(),
            self.version,
            self.workers.clone(),
            inbound,
            self.lifecycle.shutdown.clone(),
        )));
        self.lifecycle.running.send_replace(true);
        debug!(addr = %self.local_addr, workers = self.workers.available_permits(), "queue transport running");
        Ok(())
    }

    async fn wait_until_running(&self) {
        self.lifecycle.wait_until_running().await
    }

    async fn stop(&self, grace: Duration) {
        self.lifecycle.stop(grace).await
    }

    async fn send(&self, endpoint: &str, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.encode()?;
        let target = lookup_host(endpoint)
            .await
            .with_context(|| format!("failed to resolve {}", endpoint))?
            .find(|addr| addr.is_ipv4() == self.local_addr.is_ipv4())
            .ok_or_else(|| anyhow!("no usable address for {}", endpoint))?;
        self.socket
            .send_to(&bytes, target)
            .await
            .with_context(|| format!("failed to send datagram to {}", target))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, Peer};
    use crate::messages::{Message, fresh_token};

    const VERSION: u32 = 1;
    const WAIT: Duration = Duration::from_secs(5);

    fn probe_from(kp: &Keypair, endpoint: SocketAddr) -> Envelope {
        let sender = Peer::new(kp.identity(), endpoint.to_string());
        Envelope::seal(kp, VERSION, fresh_token(), sender, Message::Probe).unwrap()
    }

    async fn exchange_probe(a: Arc<dyn Transport>, b: Arc<dyn Transport>) {
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        a.start(a_tx).await.unwrap();
        b.start(b_tx).await.unwrap();
        a.wait_until_running().await;
        b.wait_until_running().await;

        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let request = probe_from(&kp_a, a.local_addr());
        a.send(&b.local_addr().to_string(), &request).await.unwrap();

        let inbound = tokio::time::timeout(WAIT, b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.envelope.token, request.token);
        assert_eq!(inbound.envelope.sender.address, kp_a.address());
        assert!(inbound.remote.is_some());

        let sender = Peer::new(kp_b.identity(), b.local_addr().to_string());
        let ack = Envelope::seal(&kp_b, VERSION, request.token, sender, Message::ProbeAck).unwrap();
        inbound.reply.unwrap().send(ack).await.unwrap();

        let reply = tokio::time::timeout(WAIT, a_rx.recv()).await.unwrap().unwrap();
        assert_eq!(reply.envelope.token, request.token);
        assert_eq!(reply.envelope.message, Message::ProbeAck);

        a.stop(Duration::from_secs(1)).await;
        b.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn tcp_request_and_reply() {
        let a = bind_transport(TransportKind::Tcp, "127.0.0.1:0", 1, VERSION).await.unwrap();
        let b = bind_transport(TransportKind::Tcp, "127.0.0.1:0", 1, VERSION).await.unwrap();
        exchange_probe(a, b).await;
    }

    #[tokio::test]
    async fn queue_request_and_reply() {
        let a = bind_transport(TransportKind::Queue, "127.0.0.1:0", 4, VERSION).await.unwrap();
        let b = bind_transport(TransportKind::Queue, "127.0.0.1:0", 4, VERSION).await.unwrap();
        exchange_probe(a, b).await;
    }

    #[tokio::test]
    async fn tcp_drops_garbage_and_wrong_version() {
        let transport = TcpTransport::bind("127.0.0.1:0", VERSION).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        transport.start(tx).await.unwrap();

        let mut raw = TcpStream::connect(transport.local_addr()).await.unwrap();
        write_frame(&mut raw, b"definitely not an envelope").await.unwrap();

        let kp = Keypair::generate();
        let sender = Peer::new(kp.identity(), "127.0.0.1:1");
        let stale = Envelope::seal(&kp, VERSION + 1, fresh_token(), sender, Message::Probe).unwrap();
        write_frame(&mut raw, &stale.encode().unwrap()).await.unwrap();
        raw.shutdown().await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(received.is_err(), "invalid envelopes must not be delivered");
        transport.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let transport = QueueTransport::bind("127.0.0.1:0", 2, VERSION).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        transport.start(tx.clone()).await.unwrap();
        assert!(transport.start(tx).await.is_err());
        transport.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_is_bounded_by_grace() {
        let transport = TcpTransport::bind("127.0.0.1:0", VERSION).await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        transport.start(tx).await.unwrap();
        transport.wait_until_running().await;

        let started = tokio::time::Instant::now();
        transport.stop(Duration::from_millis(500)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
