//! ALLOCATE negotiation and mapping bookkeeping.
//!
//! The first ALLOCATE from a client carries no credentials and is answered
//! with a 401 challenge holding a fresh NONCE and our REALM. The client
//! repeats the request with USERNAME, REALM, NONCE and a
//! MESSAGE-INTEGRITY-SHA256 over the long-term key, and gets one mapping.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::NatConfig;
use crate::crypto::{IntegrityKey, SecureRandom};
use crate::error::{Error, Result};
use crate::nat::message::{attr, Class, Message, Method, TRANSPORT_UDP};

/// Upper bound on outstanding challenge nonces; the oldest is evicted first.
pub const MAX_OUTSTANDING_NONCES: usize = 1024;

/// An external endpoint reserved for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Client endpoint the request came from
    pub internal: SocketAddr,
    /// Relayed endpoint handed to the client
    pub external: SocketAddrV4,
    pub lifetime_secs: u32,
    /// IANA protocol number of the relayed transport
    pub protocol: u8,
    /// Nonce the allocation was authenticated with
    pub nonce: String,
    pub expires_at: Instant,
}

impl Mapping {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct FrontendState {
    /// Outstanding nonces and when they were issued
    nonces: HashMap<String, Instant>,
    mappings: HashMap<SocketAddr, Mapping>,
    next_port: u16,
}

/// Outcome of checking the credential attributes on a request.
enum Credentials {
    Valid { nonce: String },
    Rejected(Message),
}

/// Answers ALLOCATE, REFRESH and CREATE_PERMISSION requests.
pub struct NatAllocationFrontend {
    config: NatConfig,
    key: IntegrityKey,
    state: Mutex<FrontendState>,
}

impl NatAllocationFrontend {
    /// Fails with [`Error::Config`] on unusable settings such as an empty
    /// or inverted relay port range.
    pub fn new(config: NatConfig) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        let key = IntegrityKey::derive(&config.username, &config.realm, &config.password);
        let state = FrontendState {
            next_port: config.relay_port_range.0,
            ..Default::default()
        };
        Ok(Self {
            config,
            key,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    /// Decode one datagram from `client` and produce the signed response.
    ///
    /// Malformed datagrams and unsupported methods of any class are errors;
    /// the caller drops them without replying.
    pub fn handle_datagram(&self, data: &[u8], client: SocketAddr) -> Result<Bytes> {
        self.handle_datagram_at(data, client, Instant::now())
    }

    fn handle_datagram_at(&self, data: &[u8], client: SocketAddr, now: Instant) -> Result<Bytes> {
        let request = Message::decode(data)?;
        let response = self.handle_request(&request, data, client, now)?;
        Ok(response.encode_signed(&self.key))
    }

    fn handle_request(
        &self,
        request: &Message,
        raw: &[u8],
        client: SocketAddr,
        now: Instant,
    ) -> Result<Message> {
        match (request.method, request.class) {
            (Method::Allocate, Class::Request) => Ok(self.handle_allocate(request, raw, client, now)),
            (Method::Refresh, Class::Request) => Ok(self.handle_refresh(request, raw, client, now)),
            (Method::CreatePermission, Class::Request) => {
                Ok(Message::response_to(request, Class::SuccessResponse))
            }
            (method, class) => Err(Error::unsupported(format!(
                "{:?} {:?} from {}",
                method, class, client
            ))),
        }
    }

    fn handle_allocate(
        &self,
        request: &Message,
        raw: &[u8],
        client: SocketAddr,
        now: Instant,
    ) -> Message {
        let nonce = match self.check_credentials(request, raw, now) {
            Credentials::Valid { nonce } => nonce,
            Credentials::Rejected(response) => return response,
        };

        let Some(protocol) = request.requested_transport() else {
            return error_response(request, 400, "Bad Request");
        };
        if protocol != TRANSPORT_UDP {
            return error_response(request, 442, "Unsupported Transport Protocol");
        }

        let lifetime = self.granted_lifetime(request.lifetime());
        let expires_at = now + Duration::from_secs(lifetime as u64);

        let mut state = self.state.lock();
        let external = match state.mappings.get_mut(&client) {
            Some(mapping) if !mapping.is_expired(now) => {
                // Repeat ALLOCATE refreshes the existing mapping.
                mapping.lifetime_secs = lifetime;
                mapping.expires_at = expires_at;
                mapping.nonce = nonce;
                tracing::debug!("Refreshed mapping {} for {}", mapping.external, client);
                mapping.external
            }
            _ => {
                let Some(port) = self.free_port(&mut state, client, now) else {
                    tracing::warn!("No relay ports left for {}", client);
                    return error_response(request, 508, "Insufficient Capacity");
                };
                let external = SocketAddrV4::new(self.config.relay_address, port);
                state.mappings.insert(
                    client,
                    Mapping {
                        internal: client,
                        external,
                        lifetime_secs: lifetime,
                        protocol,
                        nonce,
                        expires_at,
                    },
                );
                tracing::info!("Allocated {} for {}", external, client);
                external
            }
        };
        drop(state);

        let mut response = Message::response_to(request, Class::SuccessResponse);
        response.push_xor_address(attr::XOR_RELAYED_ADDRESS, external);
        response.push_lifetime(lifetime);
        if let SocketAddr::V4(mapped) = client {
            response.push_xor_address(attr::XOR_MAPPED_ADDRESS, mapped);
        }
        response
    }

    fn handle_refresh(
        &self,
        request: &Message,
        raw: &[u8],
        client: SocketAddr,
        now: Instant,
    ) -> Message {
        if let Credentials::Rejected(response) = self.check_credentials(request, raw, now) {
            return response;
        }

        let mut state = self.state.lock();
        let live = state
            .mappings
            .get(&client)
            .is_some_and(|m| !m.is_expired(now));
        if !live {
            state.mappings.remove(&client);
            return error_response(request, 437, "Allocation Mismatch");
        }

        let lifetime = match request.lifetime() {
            Some(0) => {
                state.mappings.remove(&client);
                tracing::info!("Released mapping for {}", client);
                0
            }
            requested => {
                let lifetime = self.granted_lifetime(requested);
                if let Some(mapping) = state.mappings.get_mut(&client) {
                    mapping.lifetime_secs = lifetime;
                    mapping.expires_at = now + Duration::from_secs(lifetime as u64);
                }
                lifetime
            }
        };
        drop(state);

        let mut response = Message::response_to(request, Class::SuccessResponse);
        response.push_lifetime(lifetime);
        response
    }

    /// Check USERNAME, REALM, NONCE and the integrity attribute.
    fn check_credentials(&self, request: &Message, raw: &[u8], now: Instant) -> Credentials {
        if !request.has_attribute(attr::USERNAME) {
            return Credentials::Rejected(self.challenge(request, 401, "Unauthorized", now));
        }

        let realm_ok = request.text(attr::REALM) == Some(self.config.realm.as_str());
        let username_ok = request.text(attr::USERNAME) == Some(self.config.username.as_str());
        if !realm_ok || !username_ok {
            tracing::debug!("Unknown credentials in {}", request);
            return Credentials::Rejected(self.challenge(request, 401, "Unauthorized", now));
        }

        let nonce = match request.text(attr::NONCE) {
            Some(nonce) if self.nonce_is_fresh(nonce, now) => nonce.to_string(),
            _ => return Credentials::Rejected(self.challenge(request, 438, "Stale Nonce", now)),
        };

        if !Message::verify_integrity(raw, &self.key) {
            tracing::debug!("Integrity check failed for {}", request);
            return Credentials::Rejected(self.challenge(request, 401, "Unauthorized", now));
        }

        Credentials::Valid { nonce }
    }

    /// Failure response carrying a fresh NONCE and our REALM.
    fn challenge(&self, request: &Message, code: u16, reason: &str, now: Instant) -> Message {
        let nonce = self.issue_nonce(now);
        let mut response = error_response(request, code, reason);
        response.push_text(attr::NONCE, &nonce);
        response.push_text(attr::REALM, &self.config.realm);
        response
    }

    fn issue_nonce(&self, now: Instant) -> String {
        let nonce = SecureRandom::hex::<16>();
        let ttl = self.config.nonce_ttl;
        let mut state = self.state.lock();
        state
            .nonces
            .retain(|_, issued| now.saturating_duration_since(*issued) < ttl);
        while state.nonces.len() >= MAX_OUTSTANDING_NONCES {
            let Some(oldest) = state
                .nonces
                .iter()
                .min_by_key(|(_, issued)| **issued)
                .map(|(nonce, _)| nonce.clone())
            else {
                break;
            };
            state.nonces.remove(&oldest);
        }
        state.nonces.insert(nonce.clone(), now);
        nonce
    }

    fn nonce_is_fresh(&self, nonce: &str, now: Instant) -> bool {
        self.state
            .lock()
            .nonces
            .get(nonce)
            .is_some_and(|issued| now.saturating_duration_since(*issued) < self.config.nonce_ttl)
    }

    fn granted_lifetime(&self, requested: Option<u32>) -> u32 {
        let default = self.config.default_lifetime.as_secs() as u32;
        let max = self.config.max_lifetime.as_secs() as u32;
        requested.map_or(default, |l| l.max(default).min(max))
    }

    /// Next port in the relay range not held by a live mapping.
    fn free_port(&self, state: &mut FrontendState, client: SocketAddr, now: Instant) -> Option<u16> {
        let (low, high) = self.config.relay_port_range;
        let span = (high - low) as u32 + 1;
        let start = state.next_port.clamp(low, high);

        for step in 0..span {
            let port = low + ((start - low) as u32 + step).rem_euclid(span) as u16;
            let taken = state
                .mappings
                .values()
                .any(|m| m.external.port() == port && m.internal != client && !m.is_expired(now));
            if !taken {
                state.next_port = if port == high { low } else { port + 1 };
                return Some(port);
            }
        }
        None
    }

    /// Drop expired mappings and nonces. Returns the number of mappings removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let ttl = self.config.nonce_ttl;
        let mut state = self.state.lock();
        state
            .nonces
            .retain(|_, issued| now.saturating_duration_since(*issued) < ttl);
        let before = state.mappings.len();
        state.mappings.retain(|_, m| !m.is_expired(now));
        before - state.mappings.len()
    }

    pub fn mapping_for(&self, client: SocketAddr) -> Option<Mapping> {
        self.state.lock().mappings.get(&client).cloned()
    }

    pub fn mapping_count(&self) -> usize {
        self.state.lock().mappings.len()
    }
}

fn error_response(request: &Message, code: u16, reason: &str) -> Message {
    let mut response = Message::response_to(request, Class::FailureResponse);
    response.push_error_code(code, reason);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use zeroize::Zeroizing;

    fn config() -> NatConfig {
        NatConfig {
            username: "alice".into(),
            password: Zeroizing::new("secret".into()),
            relay_address: Ipv4Addr::new(203, 0, 113, 7),
            relay_port_range: (50000, 50002),
            ..NatConfig::default()
        }
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    fn key() -> IntegrityKey {
        IntegrityKey::derive("alice", "myrealm", "secret")
    }

    fn respond(frontend: &NatAllocationFrontend, bytes: &[u8], from: SocketAddr, now: Instant) -> Message {
        let raw = frontend.handle_datagram_at(bytes, from, now).unwrap();
        assert!(Message::verify_integrity(&raw, &key()));
        Message::decode(&raw).unwrap()
    }

    fn authenticated(method: Method, nonce: &str) -> Message {
        let mut request = Message::request(method);
        request.push_text(attr::USERNAME, "alice");
        request.push_text(attr::REALM, "myrealm");
        request.push_text(attr::NONCE, nonce);
        request
    }

    fn allocate_request(nonce: &str) -> Message {
        let mut request = authenticated(Method::Allocate, nonce);
        request.push_requested_transport(TRANSPORT_UDP);
        request
    }

    /// Run the challenge and return a fresh nonce.
    fn challenge_nonce(frontend: &NatAllocationFrontend, from: SocketAddr, now: Instant) -> String {
        let mut request = Message::request(Method::Allocate);
        request.push_requested_transport(TRANSPORT_UDP);
        let response = respond(frontend, &request.encode(), from, now);
        response.text(attr::NONCE).unwrap().to_string()
    }

    #[test]
    fn test_initial_allocate_is_challenged() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let mut request = Message::request(Method::Allocate);
        request.push_requested_transport(TRANSPORT_UDP);

        let response = respond(&frontend, &request.encode(), client(4000), Instant::now());
        assert_eq!(response.class, Class::FailureResponse);
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.error_code().unwrap().0, 401);
        assert!(response.text(attr::NONCE).is_some());
        assert_eq!(response.text(attr::REALM), Some("myrealm"));
        assert_eq!(frontend.mapping_count(), 0);
    }

    #[test]
    fn test_authenticated_allocate_creates_one_mapping() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let request = allocate_request(&nonce);
        let response = respond(&frontend, &request.encode_signed(&key()), client(4000), now);
        assert_eq!(response.class, Class::SuccessResponse);
        let relayed = response.xor_address(attr::XOR_RELAYED_ADDRESS).unwrap();
        assert_eq!(relayed, SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 50000));
        assert_eq!(response.lifetime(), Some(600));
        assert_eq!(
            response.xor_address(attr::XOR_MAPPED_ADDRESS),
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 4000))
        );

        let mapping = frontend.mapping_for(client(4000)).unwrap();
        assert_eq!(mapping.external, relayed);
        assert_eq!(mapping.protocol, TRANSPORT_UDP);
        assert_eq!(mapping.nonce, nonce);

        // Same credentials again: same mapping, no duplicate.
        let later = now + Duration::from_secs(100);
        let again = allocate_request(&nonce);
        let response = respond(&frontend, &again.encode_signed(&key()), client(4000), later);
        assert_eq!(response.xor_address(attr::XOR_RELAYED_ADDRESS), Some(relayed));
        assert_eq!(frontend.mapping_count(), 1);
        assert_eq!(
            frontend.mapping_for(client(4000)).unwrap().expires_at,
            later + Duration::from_secs(600)
        );
    }

    #[test]
    fn test_unknown_nonce_is_stale() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let request = allocate_request("not-a-nonce");
        let response = respond(&frontend, &request.encode_signed(&key()), client(4000), Instant::now());
        assert_eq!(response.error_code().unwrap().0, 438);
        assert!(response.text(attr::NONCE).is_some());
    }

    #[test]
    fn test_expired_nonce_is_stale() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let request = allocate_request(&nonce);
        let later = now + Duration::from_secs(601);
        let response = respond(&frontend, &request.encode_signed(&key()), client(4000), later);
        assert_eq!(response.error_code().unwrap().0, 438);
    }

    #[test]
    fn test_bad_credentials_rechallenged() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        // Wrong password
        let wrong = IntegrityKey::derive("alice", "myrealm", "guess");
        let request = allocate_request(&nonce);
        let response = respond(&frontend, &request.encode_signed(&wrong), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 401);

        // Unsigned
        let response = respond(&frontend, &request.encode(), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 401);

        // Wrong username
        let mut request = Message::request(Method::Allocate);
        request.push_text(attr::USERNAME, "mallory");
        request.push_text(attr::REALM, "myrealm");
        request.push_text(attr::NONCE, &nonce);
        request.push_requested_transport(TRANSPORT_UDP);
        let response = respond(&frontend, &request.encode_signed(&key()), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 401);
        assert_eq!(frontend.mapping_count(), 0);
    }

    #[test]
    fn test_requested_transport_checked() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let missing = authenticated(Method::Allocate, &nonce);
        let response = respond(&frontend, &missing.encode_signed(&key()), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 400);

        let mut tcp = authenticated(Method::Allocate, &nonce);
        tcp.push_requested_transport(6);
        let response = respond(&frontend, &tcp.encode_signed(&key()), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 442);
    }

    #[test]
    fn test_port_exhaustion() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let mut ports = Vec::new();
        for port in 4000..4003 {
            let request = allocate_request(&nonce);
            let response = respond(&frontend, &request.encode_signed(&key()), client(port), now);
            ports.push(response.xor_address(attr::XOR_RELAYED_ADDRESS).unwrap().port());
        }
        ports.sort_unstable();
        assert_eq!(ports, vec![50000, 50001, 50002]);

        let request = allocate_request(&nonce);
        let response = respond(&frontend, &request.encode_signed(&key()), client(4003), now);
        assert_eq!(response.error_code().unwrap().0, 508);

        // Expired mappings free their ports.
        let later = now + Duration::from_secs(601);
        assert_eq!(frontend.purge_expired(later), 3);
        let nonce = challenge_nonce(&frontend, client(4003), later);
        let request = allocate_request(&nonce);
        let response = respond(&frontend, &request.encode_signed(&key()), client(4003), later);
        assert_eq!(response.class, Class::SuccessResponse);
    }

    #[test]
    fn test_refresh_and_release() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let refresh = authenticated(Method::Refresh, &nonce);
        let response = respond(&frontend, &refresh.encode_signed(&key()), client(4000), now);
        assert_eq!(response.error_code().unwrap().0, 437);

        let request = allocate_request(&nonce);
        respond(&frontend, &request.encode_signed(&key()), client(4000), now);

        let mut refresh = authenticated(Method::Refresh, &nonce);
        refresh.push_lifetime(7200);
        let response = respond(&frontend, &refresh.encode_signed(&key()), client(4000), now);
        assert_eq!(response.class, Class::SuccessResponse);
        assert_eq!(response.lifetime(), Some(3600));

        let mut release = authenticated(Method::Refresh, &nonce);
        release.push_lifetime(0);
        let response = respond(&frontend, &release.encode_signed(&key()), client(4000), now);
        assert_eq!(response.lifetime(), Some(0));
        assert!(frontend.mapping_for(client(4000)).is_none());
    }

    #[test]
    fn test_create_permission_succeeds() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let request = Message::request(Method::CreatePermission);
        let response = respond(&frontend, &request.encode(), client(4000), Instant::now());
        assert_eq!(response.class, Class::SuccessResponse);
        assert_eq!(response.method, Method::CreatePermission);
    }

    #[test]
    fn test_unsupported_methods() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();

        let binding = Message::request(Method::Binding);
        assert!(matches!(
            frontend.handle_datagram(&binding.encode(), client(4000)),
            Err(Error::Unsupported(_))
        ));

        let send = Message::new(Method::Send, Class::Indication, [1u8; 12]);
        assert!(matches!(
            frontend.handle_datagram(&send.encode(), client(4000)),
            Err(Error::Unsupported(_))
        ));

        let allocate_indication = Message::new(Method::Allocate, Class::Indication, [2u8; 12]);
        assert!(matches!(
            frontend.handle_datagram(&allocate_indication.encode(), client(4000)),
            Err(Error::Unsupported(_))
        ));

        assert!(matches!(
            frontend.handle_datagram(b"garbage", client(4000)),
            Err(Error::InvalidMessage(_))
        ));
        assert_eq!(frontend.mapping_count(), 0);
    }

    #[test]
    fn test_outstanding_nonces_are_bounded() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();

        let first = challenge_nonce(&frontend, client(4000), now);
        let mut latest = first.clone();
        for i in 1..=MAX_OUTSTANDING_NONCES as u64 + 10 {
            latest = challenge_nonce(&frontend, client(4000), now + Duration::from_millis(i));
        }
        assert!(frontend.state.lock().nonces.len() <= MAX_OUTSTANDING_NONCES);

        let at = now + Duration::from_secs(2);
        let evicted = allocate_request(&first);
        let response = respond(&frontend, &evicted.encode_signed(&key()), client(4000), at);
        assert_eq!(response.error_code().unwrap().0, 438);

        let fresh = allocate_request(&latest);
        let response = respond(&frontend, &fresh.encode_signed(&key()), client(4000), at);
        assert_eq!(response.class, Class::SuccessResponse);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let mut inverted = config();
        inverted.relay_port_range = (50010, 50000);
        assert!(matches!(
            NatAllocationFrontend::new(inverted),
            Err(Error::Config(_))
        ));

        let mut zero = config();
        zero.relay_port_range = (0, 10);
        assert!(NatAllocationFrontend::new(zero).is_err());

        let mut single = config();
        single.relay_port_range = (50000, 50000);
        assert!(NatAllocationFrontend::new(single).is_ok());
    }

    #[test]
    fn test_attributes_after_integrity_ignored() {
        let frontend = NatAllocationFrontend::new(config()).unwrap();
        let now = Instant::now();
        let nonce = challenge_nonce(&frontend, client(4000), now);

        let request = allocate_request(&nonce);
        let mut raw = request.encode_signed(&key()).to_vec();
        // LIFETIME 3600 appended after the integrity attribute
        raw.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0x00, 0x00, 0x0E, 0x10]);
        let length = (raw.len() - 20) as u16;
        raw[2..4].copy_from_slice(&length.to_be_bytes());

        let response = respond(&frontend, &raw, client(4000), now);
        assert_eq!(response.class, Class::SuccessResponse);
        assert_eq!(response.lifetime(), Some(600));
        assert_eq!(
            frontend.mapping_for(client(4000)).unwrap().lifetime_secs,
            600
        );
    }
}
