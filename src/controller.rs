//! Command boundary between the UI and the proxy core.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  UI: start(peer) / stop() / modify_consent(peer, action)      │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Controller                            │
//! │  PeerRegistry ◄── peer messages (handshake, consent)          │
//! │       │                                                       │
//! │       ├── proxy axis GRANTED ──► ProxyClientSession (SOCKS5)  │
//! │       └── client axis GRANTED ─► ProxyRelaySession per peer   │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//!                  TransportProvider (one transport per session)
//! ```
//!
//! Losing GRANTED on an axis stops that axis's session for the peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ProxyConfig;
use crate::consent::{ConsentAction, Transition};
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::peer::{InstanceHandshake, PeerMessage, PeerMessenger, PeerRegistry};
use crate::proxy::{ProxyClientSession, ProxyRelaySession, SessionState, Teardown};
use crate::transport::{Transport, TransportProvider};

/// Owns the registry and every session of one local instance.
pub struct Controller {
    config: Arc<ProxyConfig>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<ProxyMetrics>,
    transports: Arc<dyn TransportProvider>,
    client: ProxyClientSession,
    relays: Mutex<HashMap<String, Arc<ProxyRelaySession>>>,
}

impl Controller {
    pub fn new(
        config: ProxyConfig,
        local: InstanceHandshake,
        messenger: Arc<dyn PeerMessenger>,
        transports: Arc<dyn TransportProvider>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(PeerRegistry::new(local, messenger));
        let metrics = Arc::new(ProxyMetrics::new());

        Self {
            client: ProxyClientSession::new(
                Arc::clone(&config),
                Arc::clone(&registry),
                Arc::clone(&metrics),
            ),
            relays: Mutex::new(HashMap::new()),
            config,
            registry,
            metrics,
            transports,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Announce ourselves to a peer.
    pub fn introduce(&self, peer_id: &str) -> Result<()> {
        self.registry.send_handshake(peer_id)
    }

    /// Start proxying through `peer_id`. Returns the local SOCKS5 address.
    ///
    /// Fails with [`Error::Session`] while a session is already running; the
    /// running session is left alone and no transport is opened.
    pub async fn start(&self, peer_id: &str) -> Result<SocketAddr> {
        if !self.registry.is_proxy_granted(peer_id) {
            tracing::warn!("Not starting proxy through {}: no consent", peer_id);
            self.metrics.increment_refused_consent();
            return Err(Error::consent(peer_id));
        }
        self.client
            .start_with(peer_id, || self.transports.connect(peer_id))
            .await
    }

    /// Stop the local proxy session, if any.
    pub fn stop(&self) -> Option<Teardown> {
        self.client.stop()
    }

    pub fn client_state(&self) -> SessionState {
        self.client.state()
    }

    /// Address of the local SOCKS5 listener while a session is active.
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.client.local_addr()
    }

    /// Apply a local consent action and stop whatever it revokes.
    pub fn modify_consent(&self, peer_id: &str, action: ConsentAction) -> Result<Transition> {
        let transition = self.registry.modify_consent(peer_id, action)?;
        self.apply_access(peer_id, &transition);
        Ok(transition)
    }

    /// Dispatch a message the roster delivered from `peer_id`.
    pub fn on_message_from_peer(&self, peer_id: &str, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Handshake(handshake) => {
                if handshake.instance_id != peer_id {
                    return Err(Error::InvalidMessage(format!(
                        "handshake for {} arrived from {}",
                        handshake.instance_id, peer_id
                    )));
                }
                if self.registry.handle_handshake(&handshake)? {
                    // They know us now; make sure we are known back.
                    self.registry.send_handshake(peer_id)?;
                }
                Ok(())
            }
            PeerMessage::Consent(msg) => {
                if msg.instance_id != peer_id {
                    return Err(Error::InvalidMessage(format!(
                        "consent for {} arrived from {}",
                        msg.instance_id, peer_id
                    )));
                }
                let transition = self.registry.handle_consent_message(&msg)?;
                self.apply_access(peer_id, &transition);
                Ok(())
            }
        }
    }

    /// The roster lost `peer_id`: mark it offline and stop its sessions.
    pub fn peer_offline(&self, peer_id: &str) -> Result<()> {
        self.registry.set_online(peer_id, false)?;
        self.stop_sessions_for(peer_id);
        Ok(())
    }

    /// Forget `peer_id` entirely.
    pub fn forget(&self, peer_id: &str) -> Result<()> {
        self.stop_sessions_for(peer_id);
        self.registry.forget(peer_id)?;
        Ok(())
    }

    /// Serve a transport opened by `peer_id` to use us as its proxy.
    pub async fn accept_relay(&self, peer_id: &str, transport: Transport) -> Result<()> {
        let relay = Arc::new(ProxyRelaySession::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        ));
        let previous = self
            .relays
            .lock()
            .insert(peer_id.to_string(), Arc::clone(&relay));
        if let Some(previous) = previous {
            if previous.stop().is_some() {
                tracing::info!("Replaced relay session for {}", peer_id);
            }
        }

        if let Err(e) = relay.start(peer_id, transport).await {
            let mut relays = self.relays.lock();
            if relays.get(peer_id).is_some_and(|r| Arc::ptr_eq(r, &relay)) {
                relays.remove(peer_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Accept incoming transports until the channel closes.
    pub async fn run_incoming(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<(String, Transport)>,
    ) {
        while let Some((peer_id, transport)) = incoming.recv().await {
            let controller = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = controller.accept_relay(&peer_id, transport).await {
                    tracing::warn!("Relay for {} not started: {}", peer_id, e);
                }
            });
        }
    }

    pub fn relay_state(&self, peer_id: &str) -> SessionState {
        self.relays
            .lock()
            .get(peer_id)
            .map_or(SessionState::Idle, |r| r.state())
    }

    /// Number of peers we are currently relaying for.
    pub fn active_relays(&self) -> usize {
        self.relays
            .lock()
            .values()
            .filter(|r| r.state() == SessionState::Active)
            .count()
    }

    fn apply_access(&self, peer_id: &str, transition: &Transition) {
        if transition.proxy_access_changed() == Some(false)
            && self.client.peer_id().as_deref() == Some(peer_id)
            && self.client.stop().is_some()
        {
            tracing::info!("Stopped proxying through {}: consent revoked", peer_id);
        }

        if transition.client_access_changed() == Some(false) {
            let relay = self.relays.lock().remove(peer_id);
            if relay.and_then(|r| r.stop()).is_some() {
                tracing::info!("Stopped relaying for {}: consent revoked", peer_id);
            }
        }
    }

    fn stop_sessions_for(&self, peer_id: &str) {
        if self.client.peer_id().as_deref() == Some(peer_id) {
            self.client.stop();
        }
        if let Some(relay) = self.relays.lock().remove(peer_id) {
            relay.stop();
        }
    }
}
