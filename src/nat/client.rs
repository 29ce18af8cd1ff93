//! UDP front door for [`NatAllocationFrontend`] and the matching client.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use zeroize::Zeroizing;

use crate::config::NatConfig;
use crate::crypto::IntegrityKey;
use crate::error::{Error, Result};
use crate::nat::frontend::NatAllocationFrontend;
use crate::nat::message::{attr, Class, Message, Method, TRANSPORT_UDP};

/// Largest datagram we read.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// How often expired mappings are purged.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Answer allocation requests on `socket` until it fails.
pub async fn serve_udp(socket: UdpSocket, frontend: Arc<NatAllocationFrontend>) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut purge = tokio::time::interval(PURGE_INTERVAL);

    if let Ok(addr) = socket.local_addr() {
        tracing::info!("Allocation frontend listening on {}", addr);
    }

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                match frontend.handle_datagram(&buf[..len], from) {
                    Ok(response) => {
                        if let Err(e) = socket.send_to(&response, from).await {
                            tracing::debug!("Failed to answer {}: {}", from, e);
                        }
                    }
                    Err(e) => tracing::debug!("Ignoring datagram from {}: {}", from, e),
                }
            }
            _ = purge.tick() => {
                let purged = frontend.purge_expired(Instant::now());
                if purged > 0 {
                    tracing::debug!("Purged {} expired mappings", purged);
                }
            }
        }
    }
}

/// A successful allocation as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub relayed: SocketAddrV4,
    /// Our endpoint as the server saw it
    pub mapped: Option<SocketAddrV4>,
    pub lifetime_secs: u32,
}

/// Realm and nonce learned from the last challenge.
struct ServerChallenge {
    realm: String,
    nonce: String,
    key: IntegrityKey,
}

/// Performs the challenge and authenticated ALLOCATE against one server.
pub struct AllocationClient {
    socket: UdpSocket,
    server: SocketAddr,
    username: String,
    password: Zeroizing<String>,
    round_timeout: Duration,
    challenge: Option<ServerChallenge>,
}

impl AllocationClient {
    pub fn new(
        socket: UdpSocket,
        server: SocketAddr,
        username: impl Into<String>,
        password: impl Into<String>,
        round_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            server,
            username: username.into(),
            password: Zeroizing::new(password.into()),
            round_timeout,
            challenge: None,
        }
    }

    /// Client using the credentials and timeout in `config`.
    pub fn from_config(socket: UdpSocket, server: SocketAddr, config: &NatConfig) -> Self {
        Self::new(
            socket,
            server,
            config.username.clone(),
            config.password.as_str(),
            config.allocate_timeout,
        )
    }

    /// Obtain (or refresh) a relayed endpoint.
    pub async fn allocate(&mut self, lifetime: Option<u32>) -> Result<Allocation> {
        if self.challenge.is_none() {
            self.fetch_challenge().await?;
        }

        let response = self
            .authenticated_round(Method::Allocate, |request| {
                request.push_requested_transport(TRANSPORT_UDP);
                if let Some(lifetime) = lifetime {
                    request.push_lifetime(lifetime);
                }
            })
            .await?;

        let relayed = response
            .xor_address(attr::XOR_RELAYED_ADDRESS)
            .ok_or_else(|| Error::allocation("success response without XOR-RELAYED-ADDRESS"))?;
        let allocation = Allocation {
            relayed,
            mapped: response.xor_address(attr::XOR_MAPPED_ADDRESS),
            lifetime_secs: response.lifetime().unwrap_or(0),
        };
        tracing::info!(
            "Allocated {} for {}s via {}",
            allocation.relayed,
            allocation.lifetime_secs,
            self.server
        );
        Ok(allocation)
    }

    /// Refresh the allocation. A lifetime of 0 releases it.
    pub async fn refresh(&mut self, lifetime: u32) -> Result<u32> {
        if self.challenge.is_none() {
            return Err(Error::allocation("no allocation to refresh"));
        }
        let response = self
            .authenticated_round(Method::Refresh, |request| request.push_lifetime(lifetime))
            .await?;
        Ok(response.lifetime().unwrap_or(lifetime))
    }

    /// Unauthenticated ALLOCATE, expected to come back as a 401 challenge.
    async fn fetch_challenge(&mut self) -> Result<()> {
        let mut request = Message::request(Method::Allocate);
        request.push_requested_transport(TRANSPORT_UDP);
        let response = self.round(&request, request.encode()).await?;

        match response.class {
            Class::FailureResponse => self.learn_challenge(&response),
            _ => Err(Error::allocation("server allocated without credentials")),
        }
    }

    fn learn_challenge(&mut self, response: &Message) -> Result<()> {
        let realm = response
            .text(attr::REALM)
            .ok_or_else(|| Error::allocation("challenge without REALM"))?;
        let nonce = response
            .text(attr::NONCE)
            .ok_or_else(|| Error::allocation("challenge without NONCE"))?;
        self.challenge = Some(ServerChallenge {
            realm: realm.to_string(),
            nonce: nonce.to_string(),
            key: IntegrityKey::derive(&self.username, realm, &self.password),
        });
        Ok(())
    }

    /// Signed request with credentials; one retry on a stale nonce.
    async fn authenticated_round<F>(&mut self, method: Method, build: F) -> Result<Message>
    where
        F: Fn(&mut Message),
    {
        for _ in 0..2 {
            let Some(challenge) = &self.challenge else {
                return Err(Error::allocation("no server challenge"));
            };

            let mut request = Message::request(method);
            request.push_text(attr::USERNAME, &self.username);
            request.push_text(attr::REALM, &challenge.realm);
            request.push_text(attr::NONCE, &challenge.nonce);
            build(&mut request);
            let signed = request.encode_signed(&challenge.key);

            let (response, raw) = self.round_raw(&request, signed).await?;
            if response.class == Class::SuccessResponse {
                if !Message::verify_integrity(&raw, &challenge.key) {
                    return Err(Error::allocation("response failed integrity check"));
                }
                return Ok(response);
            }

            match response.error_code() {
                Some((438, _)) => {
                    tracing::debug!("Nonce went stale, retrying {:?}", method);
                    self.learn_challenge(&response)?;
                }
                Some((code, reason)) => {
                    return Err(Error::allocation(format!("{} {}", code, reason)));
                }
                None => return Err(Error::allocation("failure response without ERROR-CODE")),
            }
        }
        Err(Error::allocation("nonce kept going stale"))
    }

    async fn round(&self, request: &Message, bytes: Bytes) -> Result<Message> {
        self.round_raw(request, bytes).await.map(|(message, _)| message)
    }

    /// Send `bytes` and wait for the response to `request`'s transaction.
    async fn round_raw(&self, request: &Message, bytes: Bytes) -> Result<(Message, Bytes)> {
        self.socket.send_to(&bytes, self.server).await?;

        let wait = async {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = self.socket.recv_from(&mut buf).await?;
                if from != self.server {
                    continue;
                }
                let raw = Bytes::copy_from_slice(&buf[..len]);
                match Message::decode(&raw) {
                    Ok(response) if response.transaction_id == request.transaction_id => {
                        return Ok::<_, Error>((response, raw));
                    }
                    Ok(_) => continue,
                    Err(e) => tracing::debug!("Ignoring reply from {}: {}", from, e),
                }
            }
        };

        match timeout(self.round_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::allocation(format!(
                "no {:?} response from {} within {}ms",
                request.method,
                self.server,
                self.round_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nat_config() -> NatConfig {
        NatConfig {
            listen_addr: "127.0.0.1:0".into(),
            username: "alice".into(),
            password: Zeroizing::new("secret".into()),
            relay_port_range: (50000, 50010),
            allocate_timeout: Duration::from_millis(500),
            ..NatConfig::default()
        }
    }

    async fn spawn_frontend(config: NatConfig) -> (SocketAddr, Arc<NatAllocationFrontend>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let frontend = Arc::new(NatAllocationFrontend::new(config).unwrap());
        tokio::spawn(serve_udp(socket, Arc::clone(&frontend)));
        (addr, frontend)
    }

    async fn client_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_allocate_over_udp() {
        let config = nat_config();
        let (server, frontend) = spawn_frontend(config.clone()).await;

        let socket = client_socket().await;
        let local = socket.local_addr().unwrap();
        let mut client = AllocationClient::from_config(socket, server, &config);

        let allocation = client.allocate(None).await.unwrap();
        assert_eq!(allocation.relayed.port(), 50000);
        assert_eq!(allocation.lifetime_secs, 600);
        assert_eq!(allocation.mapped.map(SocketAddr::V4), Some(local));
        assert_eq!(frontend.mapping_count(), 1);

        // Repeating refreshes instead of allocating a second mapping.
        let again = client.allocate(Some(1200)).await.unwrap();
        assert_eq!(again.relayed, allocation.relayed);
        assert_eq!(again.lifetime_secs, 1200);
        assert_eq!(frontend.mapping_count(), 1);

        assert_eq!(client.refresh(0).await.unwrap(), 0);
        assert_eq!(frontend.mapping_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_password_fails() {
        let config = nat_config();
        let (server, frontend) = spawn_frontend(config).await;

        let mut client = AllocationClient::new(
            client_socket().await,
            server,
            "alice",
            "guess",
            Duration::from_millis(500),
        );
        assert!(matches!(
            client.allocate(None).await,
            Err(Error::Allocation(_))
        ));
        assert_eq!(frontend.mapping_count(), 0);
    }

    #[tokio::test]
    async fn test_round_timeout() {
        // Bound but never answered.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = silent.local_addr().unwrap();

        let mut client = AllocationClient::new(
            client_socket().await,
            server,
            "alice",
            "secret",
            Duration::from_millis(100),
        );
        let err = client.allocate(None).await.unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_refresh_without_allocation() {
        let mut client = AllocationClient::new(
            client_socket().await,
            "127.0.0.1:9".parse().unwrap(),
            "alice",
            "secret",
            Duration::from_millis(100),
        );
        assert!(client.refresh(600).await.is_err());
    }
}
