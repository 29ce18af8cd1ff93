//! Session lifecycle shared by the client and relay roles.
//!
//! A session moves `Idle -> Active -> ShuttingDown -> Idle`. While active it
//! owns one transport, one [`ConnectionMultiplexer`], and the background
//! tasks that pump frames between them. Tearing down closes every connection
//! the session owns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::consent::Axis;
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::peer::{PeerRegistry, SessionStatus};
use crate::proxy::mux::{ConnectionEvent, ConnectionMultiplexer, Frame, Tag, MAX_FRAME_PAYLOAD};
use crate::transport::{Link, TransportSender};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport, no connections.
    Idle,
    /// Serving connections for one peer.
    Active,
    /// Closing connections; returns to `Idle` once done.
    ShuttingDown,
}

/// Session statistics (safe to expose, no destinations).
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub peer_id: Option<String>,
    pub state: SessionState,
    pub started_at: Option<Instant>,
    pub open_connections: usize,
    pub connections_opened: u64,
    /// Bytes sent to the peer
    pub bytes_sent: u64,
    /// Bytes received from the peer
    pub bytes_received: u64,
}

/// What a teardown closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub peer_id: String,
    pub closed_connections: usize,
}

struct ActiveSession {
    generation: u64,
    peer_id: String,
    mux: Arc<ConnectionMultiplexer>,
    link: Link,
    local_addr: Option<SocketAddr>,
    started_at: Instant,
    tasks: Vec<JoinHandle<()>>,
}

/// State, resources and counters of one session slot.
pub struct SessionLifecycle {
    axis: Axis,
    state: Mutex<SessionState>,
    active: Mutex<Option<ActiveSession>>,
    generation: AtomicU64,
    /// Set by a teardown that lands while a start is still connecting.
    start_cancelled: AtomicBool,
    connections_opened: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionLifecycle {
    /// `axis` is the consent axis that gates this session.
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            state: Mutex::new(SessionState::Idle),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            start_cancelled: AtomicBool::new(false),
            connections_opened: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Reserve the slot for a start. Fails unless idle.
    pub(crate) fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Idle => {
                *state = SessionState::Active;
                self.start_cancelled.store(false, Ordering::Relaxed);
                Ok(())
            }
            SessionState::Active => Err(Error::Session("session already active".into())),
            SessionState::ShuttingDown => Err(Error::Session("session is shutting down".into())),
        }
    }

    /// Give the slot back after a failed start.
    pub(crate) fn abandon(&self) {
        *self.state.lock() = SessionState::Idle;
    }

    /// Install the resources of a started session. Returns its generation.
    ///
    /// Fails if the session was stopped while the start was in flight; the
    /// caller then abandons the start.
    pub(crate) fn activate(
        &self,
        peer_id: &str,
        mux: Arc<ConnectionMultiplexer>,
        link: Link,
        local_addr: Option<SocketAddr>,
    ) -> Result<u64> {
        let mut active = self.active.lock();
        if self.start_cancelled.swap(false, Ordering::Relaxed) {
            return Err(Error::Session(format!(
                "session with {} stopped while starting",
                peer_id
            )));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *active = Some(ActiveSession {
            generation,
            peer_id: peer_id.to_string(),
            mux,
            link,
            local_addr,
            started_at: Instant::now(),
            tasks: Vec::new(),
        });
        Ok(generation)
    }

    /// Attach a background task. If that generation is already gone the
    /// task is aborted at once.
    pub(crate) fn add_task(&self, generation: u64, handle: JoinHandle<()>) {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(session) if session.generation == generation => session.tasks.push(handle),
            _ => handle.abort(),
        }
    }

    /// Stop whatever is active. A start still in flight is cancelled and
    /// will fail instead of activating.
    pub fn teardown(&self) -> Option<Teardown> {
        self.teardown_where(true, |_| true)
    }

    /// Stop the session only if it is still `generation`.
    pub(crate) fn teardown_generation(&self, generation: u64) -> Option<Teardown> {
        self.teardown_where(false, |s| s.generation == generation)
    }

    fn teardown_where(
        &self,
        cancel_start: bool,
        matches: impl FnOnce(&ActiveSession) -> bool,
    ) -> Option<Teardown> {
        let session = {
            let mut active = self.active.lock();
            let Some(current) = active.as_ref() else {
                if cancel_start && *self.state.lock() == SessionState::Active {
                    tracing::debug!("{:?} session stopped before it started", self.axis);
                    self.start_cancelled.store(true, Ordering::Relaxed);
                }
                return None;
            };
            if !matches(current) {
                return None;
            }
            *self.state.lock() = SessionState::ShuttingDown;
            active.take()?
        };

        for task in &session.tasks {
            task.abort();
        }
        let closed_connections = session.mux.close_all();
        session.link.close();
        *self.state.lock() = SessionState::Idle;

        tracing::info!(
            "{:?} session with {} stopped, {} connections closed",
            self.axis,
            session.peer_id,
            closed_connections
        );
        Some(Teardown {
            peer_id: session.peer_id,
            closed_connections,
        })
    }

    pub fn peer_id(&self) -> Option<String> {
        self.active.lock().as_ref().map(|s| s.peer_id.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().and_then(|s| s.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.active.lock().as_ref().map_or(0, |s| s.mux.len())
    }

    pub(crate) fn record_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        let active = self.active.lock();
        SessionStats {
            peer_id: active.as_ref().map(|s| s.peer_id.clone()),
            state: self.state(),
            started_at: active.as_ref().map(|s| s.started_at),
            open_connections: active.as_ref().map_or(0, |s| s.mux.len()),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Encode queued frames onto the transport. Closes the link on failure.
pub(crate) async fn transport_writer(sender: TransportSender, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sender.send_data(frame.encode()).await {
            tracing::debug!("Transport writer stopped: {}", e);
            sender.link().close();
            break;
        }
    }
}

/// Lets a session's background tasks fail the generation they belong to.
#[derive(Clone)]
pub(crate) struct SessionWatch {
    generation: u64,
    lifecycle: Arc<SessionLifecycle>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProxyMetrics>,
}

impl SessionWatch {
    pub(crate) fn new(
        generation: u64,
        lifecycle: Arc<SessionLifecycle>,
        registry: Arc<PeerRegistry>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            generation,
            lifecycle,
            registry,
            metrics,
        }
    }

    /// Tear the session down after its transport failed. No-op once that
    /// generation is gone.
    pub(crate) fn fail(&self, reason: &str) {
        if let Some(teardown) = self.lifecycle.teardown_generation(self.generation) {
            tracing::warn!("Transport to {} failed: {}", teardown.peer_id, reason);
            self.metrics.increment_transport_failures();
            self.registry.report_session_status(
                &teardown.peer_id,
                self.lifecycle.axis(),
                SessionStatus::Failed(reason.to_string()),
            );
        }
    }
}

/// Tear the session down when its transport closes underneath it.
pub(crate) async fn watch_link(link: Link, watch: SessionWatch) {
    link.once_closed().await;
    watch.fail("transport closed");
}

/// Shuttle bytes between a TCP stream and one tag until either side ends.
pub(crate) async fn relay_stream(
    stream: TcpStream,
    tag: Tag,
    mut events: mpsc::Receiver<ConnectionEvent>,
    mux: &ConnectionMultiplexer,
    lifecycle: &SessionLifecycle,
    metrics: &ProxyMetrics,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Socket -> peer
    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if mux.send_data(tag, &buf[..n]).await.is_err() {
                        break;
                    }
                    lifecycle.add_bytes_sent(n as u64);
                    metrics.add_bytes_sent(n as u64);
                }
            }
        }
    };

    // Peer -> socket
    let downstream = async {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Data(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                    lifecycle.add_bytes_received(data.len() as u64);
                    metrics.add_bytes_received(data.len() as u64);
                }
                ConnectionEvent::Closed | ConnectionEvent::Error(_) => break,
                ConnectionEvent::Opened => {}
            }
        }
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }

    mux.close(tag).await;
}
