//! Local SOCKS5 listener that tunnels connections to one consented peer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::consent::Axis;
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::peer::{PeerRegistry, SessionStatus};
use crate::proxy::mux::{ConnectionEvent, ConnectionMultiplexer, Dispatched, Frame};
use crate::proxy::session::{
    relay_stream, transport_writer, watch_link, SessionLifecycle, SessionState, SessionStats,
    SessionWatch, Teardown,
};
use crate::proxy::socks5::{Reply, SocksRequestParser, Step};
use crate::transport::{Transport, TransportReceiver, CHANNEL_CAPACITY};

/// Client role: applications connect to a local SOCKS5 port and their
/// traffic egresses through the peer.
pub struct ProxyClientSession {
    config: Arc<ProxyConfig>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProxyMetrics>,
    lifecycle: Arc<SessionLifecycle>,
}

#[derive(Clone)]
struct ConnectionContext {
    mux: Arc<ConnectionMultiplexer>,
    config: Arc<ProxyConfig>,
    metrics: Arc<ProxyMetrics>,
    lifecycle: Arc<SessionLifecycle>,
}

impl ProxyClientSession {
    pub fn new(
        config: Arc<ProxyConfig>,
        registry: Arc<PeerRegistry>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            lifecycle: Arc::new(SessionLifecycle::new(Axis::Proxy)),
        }
    }

    /// Start proxying through `peer_id` over `transport`.
    ///
    /// Refused unless the peer has GRANTED proxy consent. Returns the bound
    /// SOCKS5 address. A refused start closes `transport`.
    pub async fn start(&self, peer_id: &str, transport: Transport) -> Result<SocketAddr> {
        let link = transport.link().clone();
        let started = self.start_with(peer_id, move || Ok(transport)).await;
        if started.is_err() {
            link.close();
        }
        started
    }

    /// Like [`start`](Self::start), but `connect` only runs once the session
    /// slot is reserved. A start rejected because a session is already
    /// running never opens a transport, so the running one is untouched.
    pub async fn start_with<F>(&self, peer_id: &str, connect: F) -> Result<SocketAddr>
    where
        F: FnOnce() -> Result<Transport>,
    {
        if !self.registry.is_proxy_granted(peer_id) {
            tracing::warn!("Refusing to start proxying through {}: no consent", peer_id);
            return Err(Error::consent(peer_id));
        }

        self.lifecycle.begin()?;
        let transport = match connect() {
            Ok(transport) => transport,
            Err(e) => {
                self.lifecycle.abandon();
                return Err(e);
            }
        };

        match self.launch(peer_id, transport).await {
            Ok(addr) => {
                tracing::info!("Proxying through {} on {}", peer_id, addr);
                self.registry
                    .report_session_status(peer_id, Axis::Proxy, SessionStatus::Started);
                Ok(addr)
            }
            Err(e) => {
                self.lifecycle.abandon();
                Err(e)
            }
        }
    }

    async fn launch(&self, peer_id: &str, transport: Transport) -> Result<SocketAddr> {
        let link = transport.link().clone();
        let wait = self.config.transport_connect_timeout;
        match timeout(wait, link.once_connected()).await {
            Ok(connected) => connected?,
            Err(_) => {
                link.close();
                return Err(Error::transport(format!(
                    "transport to {} not connected after {}ms",
                    peer_id,
                    wait.as_millis()
                )));
            }
        }

        // Consent may have moved while the transport was connecting.
        if !self.registry.is_proxy_granted(peer_id) {
            link.close();
            return Err(Error::consent(peer_id));
        }

        let listener = match TcpListener::bind(self.config.socks_endpoint()).await {
            Ok(listener) => listener,
            Err(e) => {
                link.close();
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;

        let (sender, receiver) = transport.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let mux = Arc::new(ConnectionMultiplexer::new(frame_tx));

        let generation = match self.lifecycle.activate(
            peer_id,
            Arc::clone(&mux),
            link.clone(),
            Some(local_addr),
        ) {
            Ok(generation) => generation,
            Err(e) => {
                link.close();
                return Err(e);
            }
        };
        let watch = SessionWatch::new(
            generation,
            Arc::clone(&self.lifecycle),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        );

        let ctx = ConnectionContext {
            mux: Arc::clone(&mux),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            lifecycle: Arc::clone(&self.lifecycle),
        };

        self.lifecycle
            .add_task(generation, tokio::spawn(transport_writer(sender, frame_rx)));
        self.lifecycle
            .add_task(generation, tokio::spawn(tunnel_reader(receiver, mux, watch.clone())));
        self.lifecycle
            .add_task(generation, tokio::spawn(accept_loop(listener, ctx)));
        self.lifecycle
            .add_task(generation, tokio::spawn(watch_link(link, watch)));

        Ok(local_addr)
    }

    /// Stop the session and close every connection it owns.
    ///
    /// Returns immediately; sockets finish closing in the background.
    pub fn stop(&self) -> Option<Teardown> {
        let teardown = self.lifecycle.teardown()?;
        self.registry.report_session_status(
            &teardown.peer_id,
            Axis::Proxy,
            SessionStatus::Stopped,
        );
        Some(teardown)
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn peer_id(&self) -> Option<String> {
        self.lifecycle.peer_id()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.lifecycle.connection_count()
    }

    pub fn stats(&self) -> SessionStats {
        self.lifecycle.stats()
    }
}

/// Read frames from the peer and route them to connections. The session
/// ends with the inbound stream.
async fn tunnel_reader(
    mut receiver: TransportReceiver,
    mux: Arc<ConnectionMultiplexer>,
    watch: SessionWatch,
) {
    while let Some(data) = receiver.recv_data().await {
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {}", e);
                continue;
            }
        };

        if let Dispatched::ConnectRequest { tag, .. } = mux.dispatch(frame).await {
            // The peer relays for us, not the other way round.
            tracing::warn!("Peer tried to open connection {} on a client session", tag);
            if mux.reply(tag, Reply::NotAllowed).await.is_err() {
                break;
            }
        }
    }
    watch.fail("inbound stream ended");
}

async fn accept_loop(listener: TcpListener, ctx: ConnectionContext) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                if ctx.mux.len() >= ctx.config.max_connections_per_session {
                    tracing::debug!("Connection limit reached, dropping {}", peer);
                    continue;
                }
                tracing::debug!("SOCKS5 connection from {}", peer);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_socks5_client(client, &ctx).await {
                        tracing::debug!("SOCKS5 connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
            }
        }
    }
}

/// Serve one local SOCKS5 connection end to end.
async fn handle_socks5_client(mut client: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let mut parser = SocksRequestParser::new();
    let mut buf = [0u8; 512];

    let destination = loop {
        let read = timeout(ctx.config.handshake_timeout, client.read(&mut buf)).await;
        let n = match read {
            Ok(n) => n?,
            Err(_) => {
                return Err(Error::Timeout(ctx.config.handshake_timeout.as_millis() as u64));
            }
        };
        if n == 0 {
            return Err(Error::protocol("client closed during handshake"));
        }

        match parser.feed(&buf[..n]) {
            Ok(Step::Reply(reply)) => client.write_all(&reply).await?,
            Ok(Step::Request(destination)) => break destination,
            Err(e) => {
                ctx.metrics.increment_protocol_errors();
                if let Some(reply) = parser.error_reply() {
                    let _ = client.write_all(&reply).await;
                }
                return Err(e);
            }
        }
    };

    tracing::debug!("CONNECT {}", destination);
    let (tag, mut events) = match ctx.mux.open(destination).await {
        Ok(opened) => opened,
        Err(e) => {
            let _ = client.write_all(&Reply::GeneralFailure.encode()).await;
            return Err(e);
        }
    };

    match timeout(ctx.config.connect_timeout, events.recv()).await {
        Ok(Some(ConnectionEvent::Opened)) => {}
        Ok(Some(ConnectionEvent::Error(reply))) => {
            tracing::debug!("Connection {} refused by peer: {:?}", tag, reply);
            client.write_all(&reply.encode()).await?;
            return Ok(());
        }
        Ok(_) => {
            ctx.mux.close(tag).await;
            client.write_all(&Reply::GeneralFailure.encode()).await?;
            return Ok(());
        }
        Err(_) => {
            ctx.mux.close(tag).await;
            let _ = client.write_all(&Reply::TtlExpired.encode()).await;
            return Err(Error::Timeout(ctx.config.connect_timeout.as_millis() as u64));
        }
    }

    if let Err(e) = client.write_all(&Reply::Succeeded.encode()).await {
        ctx.mux.close(tag).await;
        return Err(e.into());
    }

    ctx.lifecycle.record_opened();
    ctx.metrics.increment_connections();
    relay_stream(client, tag, events, &ctx.mux, &ctx.lifecycle, &ctx.metrics).await;
    ctx.metrics.decrement_connections();

    Ok(())
}
