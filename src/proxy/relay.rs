//! Relay role: open real outbound sockets on behalf of a consented peer.
//!
//! Every CONNECT is checked against the registry as it arrives, so a revoke
//! stops new connections immediately.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::consent::Axis;
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::peer::{PeerRegistry, SessionStatus};
use crate::proxy::mux::{ConnectionMultiplexer, Dispatched, Frame, Tag};
use crate::proxy::policy::DestinationPolicy;
use crate::proxy::session::{
    relay_stream, transport_writer, watch_link, SessionLifecycle, SessionState, SessionStats,
    SessionWatch, Teardown,
};
use crate::proxy::socks5::{Destination, Host, Reply};
use crate::transport::{Transport, TransportReceiver, CHANNEL_CAPACITY};

/// Serves CONNECT requests from one peer.
pub struct ProxyRelaySession {
    config: Arc<ProxyConfig>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProxyMetrics>,
    lifecycle: Arc<SessionLifecycle>,
}

#[derive(Clone)]
struct RelayContext {
    peer_id: Arc<str>,
    mux: Arc<ConnectionMultiplexer>,
    config: Arc<ProxyConfig>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProxyMetrics>,
    lifecycle: Arc<SessionLifecycle>,
    policy: DestinationPolicy,
}

impl ProxyRelaySession {
    pub fn new(
        config: Arc<ProxyConfig>,
        registry: Arc<PeerRegistry>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            lifecycle: Arc::new(SessionLifecycle::new(Axis::Client)),
        }
    }

    /// Start relaying for `peer_id`. Refused unless we have GRANTED them
    /// client consent.
    pub async fn start(&self, peer_id: &str, transport: Transport) -> Result<()> {
        if !self.registry.is_client_granted(peer_id) {
            tracing::warn!("Refusing relay session for {}: no consent", peer_id);
            self.metrics.increment_refused_consent();
            transport.link().close();
            return Err(Error::consent(peer_id));
        }

        if let Err(e) = self.lifecycle.begin() {
            transport.link().close();
            return Err(e);
        }
        if let Err(e) = self.launch(peer_id, transport).await {
            self.lifecycle.abandon();
            return Err(e);
        }

        tracing::info!("Relaying for {}", peer_id);
        self.registry
            .report_session_status(peer_id, Axis::Client, SessionStatus::Started);
        Ok(())
    }

    async fn launch(&self, peer_id: &str, transport: Transport) -> Result<()> {
        let link = transport.link().clone();
        let wait = self.config.transport_connect_timeout;
        match timeout(wait, link.once_connected()).await {
            Ok(connected) => connected?,
            Err(_) => {
                link.close();
                return Err(Error::transport(format!(
                    "transport from {} not connected after {}ms",
                    peer_id,
                    wait.as_millis()
                )));
            }
        }

        // Consent may have been revoked while the transport was connecting.
        if !self.registry.is_client_granted(peer_id) {
            tracing::warn!("Consent for {} revoked before relaying started", peer_id);
            self.metrics.increment_refused_consent();
            link.close();
            return Err(Error::consent(peer_id));
        }

        let (sender, receiver) = transport.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let mux = Arc::new(ConnectionMultiplexer::new(frame_tx));
        let generation = match self
            .lifecycle
            .activate(peer_id, Arc::clone(&mux), link.clone(), None)
        {
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

        let ctx = RelayContext {
            peer_id: Arc::from(peer_id),
            mux,
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            lifecycle: Arc::clone(&self.lifecycle),
            policy: DestinationPolicy::new(self.config.allow_non_unicast),
        };

        self.lifecycle
            .add_task(generation, tokio::spawn(transport_writer(sender, frame_rx)));
        self.lifecycle
            .add_task(generation, tokio::spawn(relay_reader(receiver, ctx, watch.clone())));
        self.lifecycle
            .add_task(generation, tokio::spawn(watch_link(link, watch)));
        Ok(())
    }

    /// Stop relaying and close every outbound connection.
    pub fn stop(&self) -> Option<Teardown> {
        let teardown = self.lifecycle.teardown()?;
        self.registry.report_session_status(
            &teardown.peer_id,
            Axis::Client,
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

    pub fn connection_count(&self) -> usize {
        self.lifecycle.connection_count()
    }

    pub fn stats(&self) -> SessionStats {
        self.lifecycle.stats()
    }
}

/// Read frames from the peer, vetting CONNECT requests as they arrive. The
/// session ends with the inbound stream.
async fn relay_reader(mut receiver: TransportReceiver, ctx: RelayContext, watch: SessionWatch) {
    while let Some(data) = receiver.recv_data().await {
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame from {}: {}", ctx.peer_id, e);
                continue;
            }
        };

        if let Dispatched::ConnectRequest { tag, payload } = ctx.mux.dispatch(frame).await {
            if let Err(e) = handle_connect(&ctx, tag, payload).await {
                if e.is_session_fatal() {
                    break;
                }
                tracing::debug!("Connection {} from {} refused: {}", tag, ctx.peer_id, e);
            }
        }
    }
    watch.fail("inbound stream ended");
}

/// Vet one CONNECT request and, if allowed, start connecting.
async fn handle_connect(ctx: &RelayContext, tag: Tag, payload: Bytes) -> Result<()> {
    if !ctx.registry.is_client_granted(&ctx.peer_id) {
        tracing::warn!(
            "Refusing connection {} from {}: consent not granted",
            tag,
            ctx.peer_id
        );
        ctx.metrics.increment_refused_consent();
        ctx.mux.reply(tag, Reply::NotAllowed).await?;
        return Err(Error::consent(ctx.peer_id.as_ref()));
    }

    let destination = match Destination::decode(&payload) {
        Ok((destination, used)) if used == payload.len() => destination,
        Ok(_) => {
            ctx.mux.reply(tag, Reply::GeneralFailure).await?;
            return Err(Error::protocol("trailing bytes after address"));
        }
        Err(e) => {
            let reply = match e {
                Error::Unsupported(_) => Reply::AddressTypeNotSupported,
                _ => Reply::GeneralFailure,
            };
            ctx.mux.reply(tag, reply).await?;
            return Err(e);
        }
    };

    if !ctx.policy.permits(&destination) {
        tracing::debug!("Destination {} refused by policy", destination);
        ctx.metrics.increment_refused_policy();
        ctx.mux.reply(tag, Reply::NotAllowed).await?;
        return Err(Error::unsupported("non-unicast destination"));
    }

    if ctx.mux.len() >= ctx.config.max_connections_per_session {
        ctx.mux.reply(tag, Reply::GeneralFailure).await?;
        return Err(Error::Session("connection limit reached".into()));
    }

    // Duplicate tags get no reply; the live connection keeps the tag.
    let events = ctx.mux.register(tag)?;

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let stream = match connect(&ctx, &destination).await {
            Ok(stream) => stream,
            Err(reply) => {
                let _ = ctx.mux.reply(tag, reply).await;
                return;
            }
        };

        // Torn down while we were connecting.
        if !ctx.mux.contains(tag) {
            return;
        }
        if ctx.mux.reply(tag, Reply::Succeeded).await.is_err() {
            return;
        }

        ctx.lifecycle.record_opened();
        ctx.metrics.increment_connections();
        relay_stream(stream, tag, events, &ctx.mux, &ctx.lifecycle, &ctx.metrics).await;
        ctx.metrics.decrement_connections();
    });

    Ok(())
}

/// Resolve, filter and connect. Failures come back as the SOCKS reply to send.
async fn connect(
    ctx: &RelayContext,
    destination: &Destination,
) -> std::result::Result<TcpStream, Reply> {
    let wait = ctx.config.connect_timeout;

    let candidates: Vec<SocketAddr> = match &destination.host {
        Host::Ipv4(ip) => vec![SocketAddr::from((*ip, destination.port))],
        Host::Domain(name) => {
            match timeout(wait, tokio::net::lookup_host((name.as_str(), destination.port))).await
            {
                Ok(Ok(addrs)) => addrs.collect(),
                Ok(Err(e)) => {
                    tracing::debug!("Resolving {} failed: {}", destination, e);
                    return Err(Reply::HostUnreachable);
                }
                Err(_) => return Err(Reply::TtlExpired),
            }
        }
    };

    let allowed: Vec<SocketAddr> = candidates
        .into_iter()
        .filter(|addr| ctx.policy.permits_addr(addr.ip()))
        .collect();
    if allowed.is_empty() {
        tracing::debug!("{} resolves only to refused addresses", destination);
        ctx.metrics.increment_refused_policy();
        return Err(Reply::GeneralFailure);
    }

    match timeout(wait, TcpStream::connect(&allowed[..])).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            tracing::debug!("Connecting to {} failed: {}", destination, e);
            Err(Reply::from_io_error(&e, ctx.policy.allows_non_unicast()))
        }
        Err(_) => Err(Reply::TtlExpired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::{ConsentAction, ConsentMessage, RemoteConsentSignal};
    use crate::peer::{ChannelMessenger, InstanceHandshake};
    use crate::proxy::mux::FrameType;
    use crate::transport::TransportSender;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(allow_non_unicast: bool) -> Arc<ProxyConfig> {
        let mut config = ProxyConfig::new_random("127.0.0.1", 0);
        config.allow_non_unicast = allow_non_unicast;
        config.connect_timeout = Duration::from_secs(2);
        Arc::new(config)
    }

    /// Registry where "alice" holds GRANTED client consent.
    fn registry() -> Arc<PeerRegistry> {
        let (messenger, _rx) = ChannelMessenger::new();
        let registry = Arc::new(PeerRegistry::new(
            InstanceHandshake::new("bob", "kb"),
            Arc::new(messenger),
        ));
        registry
            .handle_handshake(&InstanceHandshake::new("alice", "ka"))
            .unwrap();
        registry
            .handle_consent_message(&ConsentMessage::new("alice", RemoteConsentSignal::Requesting))
            .unwrap();
        registry
            .modify_consent("alice", ConsentAction::AllowRequest)
            .unwrap();
        assert!(registry.is_client_granted("alice"));
        registry
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn connect_frame(tag: u32, addr: SocketAddr) -> Bytes {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => unreachable!(),
        };
        Frame::connect(Tag(tag), &Destination::ipv4(ip, addr.port())).encode()
    }

    async fn next_frame(rx: &mut TransportReceiver) -> Frame {
        let data = tokio::time::timeout(Duration::from_secs(3), rx.recv_data())
            .await
            .unwrap()
            .unwrap();
        Frame::decode(&data).unwrap()
    }

    async fn started(
        registry: Arc<PeerRegistry>,
        allow_non_unicast: bool,
    ) -> (ProxyRelaySession, TransportSender, TransportReceiver) {
        let relay = ProxyRelaySession::new(
            config(allow_non_unicast),
            registry,
            Arc::new(ProxyMetrics::new()),
        );
        let (local, remote) = Transport::pair();
        relay.start("alice", local).await.unwrap();
        let (tx, rx) = remote.split();
        (relay, tx, rx)
    }

    #[tokio::test]
    async fn test_relays_to_destination() {
        let echo = echo_server().await;
        let (relay, tx, mut rx) = started(registry(), true).await;

        tx.send_data(connect_frame(1, echo)).await.unwrap();
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.frame_type, FrameType::ConnectReply);
        assert_eq!(reply.payload[0], Reply::Succeeded as u8);

        tx.send_data(Frame::data(Tag(1), Bytes::from_static(b"hello")).encode())
            .await
            .unwrap();
        let echoed = next_frame(&mut rx).await;
        assert_eq!(echoed.frame_type, FrameType::Data);
        assert_eq!(echoed.payload, Bytes::from_static(b"hello"));
        assert_eq!(relay.connection_count(), 1);

        tx.send_data(Frame::close(Tag(1)).encode()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.connection_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_client_consent() {
        let (messenger, _rx) = ChannelMessenger::new();
        let registry = Arc::new(PeerRegistry::new(
            InstanceHandshake::new("bob", "kb"),
            Arc::new(messenger),
        ));
        registry
            .handle_handshake(&InstanceHandshake::new("alice", "ka"))
            .unwrap();

        let relay = ProxyRelaySession::new(config(true), registry, Arc::new(ProxyMetrics::new()));
        let (local, _remote) = Transport::pair();
        assert!(matches!(
            relay.start("alice", local).await,
            Err(Error::ConsentViolation { .. })
        ));
        assert_eq!(relay.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_revoke_blocks_new_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let registry = registry();
        let (relay, tx, mut rx) = started(Arc::clone(&registry), true).await;

        tx.send_data(connect_frame(1, target)).await.unwrap();
        assert_eq!(next_frame(&mut rx).await.payload[0], Reply::Succeeded as u8);
        let (_first, _) = listener.accept().await.unwrap();

        // Alice withdraws her request; the relay's session is left running.
        registry
            .handle_consent_message(&ConsentMessage::new("alice", RemoteConsentSignal::None))
            .unwrap();
        assert!(!registry.is_client_granted("alice"));

        tx.send_data(connect_frame(2, target)).await.unwrap();
        let refused = next_frame(&mut rx).await;
        assert_eq!(refused.tag, Tag(2));
        assert_eq!(refused.payload[0], Reply::NotAllowed as u8);

        // No outbound socket was opened for the refused request.
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err());
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_refuses_loopback() {
        let echo = echo_server().await;
        let (relay, tx, mut rx) = started(registry(), false).await;

        tx.send_data(connect_frame(5, echo)).await.unwrap();
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.payload[0], Reply::NotAllowed as u8);
        assert_eq!(relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        // Bind then drop to find a port with nothing listening.
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (_relay, tx, mut rx) = started(registry(), true).await;

        tx.send_data(connect_frame(9, closed)).await.unwrap();
        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.payload[0], Reply::ConnectionRefused as u8);
    }

    #[tokio::test]
    async fn test_ipv6_connect_payload_rejected() {
        let (_relay, tx, mut rx) = started(registry(), true).await;

        let mut payload = vec![0x04];
        payload.extend_from_slice(&[0u8; 16]);
        payload.extend_from_slice(&80u16.to_be_bytes());
        let frame = Frame {
            frame_type: FrameType::Connect,
            tag: Tag(3),
            payload: Bytes::from(payload),
        };
        tx.send_data(frame.encode()).await.unwrap();

        let reply = next_frame(&mut rx).await;
        assert_eq!(reply.payload[0], Reply::AddressTypeNotSupported as u8);
    }

    #[tokio::test]
    async fn test_peer_dropping_its_end_tears_down() {
        let (relay, tx, rx) = started(registry(), true).await;
        assert_eq!(relay.state(), SessionState::Active);

        drop(tx);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.state() != SessionState::Idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(relay.peer_id().is_none());
    }

    #[tokio::test]
    async fn test_stop_while_connecting_cancels_start() {
        let relay = Arc::new(ProxyRelaySession::new(
            config(true),
            registry(),
            Arc::new(ProxyMetrics::new()),
        ));
        let (local, remote) = Transport::pending_pair();

        let starting = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.start("alice", local).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.state() != SessionState::Active {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Nothing to tear down yet; the start itself is cancelled.
        assert!(relay.stop().is_none());
        remote.link().set_connected();

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(Error::Session(_))));
        assert_eq!(relay.state(), SessionState::Idle);
        assert!(remote.link().is_closed());
    }

    #[tokio::test]
    async fn test_revoke_while_connecting_refuses_start() {
        let registry = registry();
        let relay = Arc::new(ProxyRelaySession::new(
            config(true),
            Arc::clone(&registry),
            Arc::new(ProxyMetrics::new()),
        ));
        let (local, remote) = Transport::pending_pair();

        let starting = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.start("alice", local).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.state() != SessionState::Active {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        registry
            .handle_consent_message(&ConsentMessage::new("alice", RemoteConsentSignal::None))
            .unwrap();
        remote.link().set_connected();

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(Error::ConsentViolation { .. })));
        assert_eq!(relay.state(), SessionState::Idle);
        assert!(remote.link().is_closed());
    }

    #[tokio::test]
    async fn test_stop_closes_outbound_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (relay, tx, mut rx) = started(registry(), true).await;

        let mut accepted = Vec::new();
        for tag in 1..=2 {
            tx.send_data(connect_frame(tag, target)).await.unwrap();
            assert_eq!(next_frame(&mut rx).await.payload[0], Reply::Succeeded as u8);
            accepted.push(listener.accept().await.unwrap().0);
        }

        let teardown = relay.stop().unwrap();
        assert_eq!(teardown.closed_connections, 2);
        assert_eq!(relay.state(), SessionState::Idle);

        for mut stream in accepted {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }
}
