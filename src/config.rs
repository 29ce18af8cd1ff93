//! Runtime and on-disk configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::SecureRandom;

/// Default SOCKS5 listen port for the local client role.
pub const DEFAULT_SOCKS_PORT: u16 = 9999;

/// Proxy configuration shared by both session roles.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// This installation's instance id
    pub instance_id: String,
    /// Address the local SOCKS5 listener binds to
    pub socks_listen_addr: String,
    /// Port for the local SOCKS5 listener (0 picks a free port)
    pub socks_listen_port: u16,
    /// Let the relay connect to loopback, private and other non-unicast addresses
    pub allow_non_unicast: bool,
    /// Bound on each SOCKS handshake read
    pub handshake_timeout: Duration,
    /// Bound on waiting for the peer's CONNECT reply, and on the relay's outbound connect
    pub connect_timeout: Duration,
    /// Bound on the transport reaching the connected state
    pub transport_connect_timeout: Duration,
    /// Maximum concurrently open connections per session
    pub max_connections_per_session: usize,
    /// NAT allocation frontend settings
    pub nat: NatConfig,
}

/// NAT allocation frontend configuration.
#[derive(Debug, Clone)]
pub struct NatConfig {
    /// UDP address the frontend listens on
    pub listen_addr: String,
    /// Realm returned in credential challenges
    pub realm: String,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: Zeroizing<String>,
    /// External address handed out in mappings
    pub relay_address: Ipv4Addr,
    /// Inclusive port range for external endpoints
    pub relay_port_range: (u16, u16),
    /// Lifetime granted when the client asks for none
    pub default_lifetime: Duration,
    /// Upper bound on any requested lifetime
    pub max_lifetime: Duration,
    /// How long an issued nonce stays valid
    pub nonce_ttl: Duration,
    /// Per-round bound for the allocation client
    pub allocate_timeout: Duration,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3478".to_string(),
            realm: "myrealm".to_string(),
            username: "peershare".to_string(),
            password: Zeroizing::new(SecureRandom::hex::<16>()),
            relay_address: Ipv4Addr::LOCALHOST,
            relay_port_range: (49152, 65535),
            default_lifetime: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(3600),
            nonce_ttl: Duration::from_secs(600),
            allocate_timeout: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Create a configuration with a random instance id.
    pub fn new_random(socks_listen_addr: impl Into<String>, socks_listen_port: u16) -> Self {
        Self {
            instance_id: SecureRandom::hex::<16>(),
            socks_listen_addr: socks_listen_addr.into(),
            socks_listen_port,
            allow_non_unicast: false,
            handshake_timeout: Duration::from_millis(crate::HANDSHAKE_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(30),
            transport_connect_timeout: Duration::from_secs(30),
            max_connections_per_session: 256,
            nat: NatConfig::default(),
        }
    }

    /// `host:port` for the SOCKS5 listener.
    pub fn socks_endpoint(&self) -> String {
        format!("{}:{}", self.socks_listen_addr, self.socks_listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.instance_id.is_empty() {
            return Err("instance_id cannot be empty".into());
        }
        if self.socks_listen_addr.is_empty() {
            return Err("socks_listen_addr cannot be empty".into());
        }
        if self.handshake_timeout.is_zero()
            || self.connect_timeout.is_zero()
            || self.transport_connect_timeout.is_zero()
        {
            return Err("timeouts must be non-zero".into());
        }
        if self.max_connections_per_session == 0 {
            return Err("max_connections_per_session must be at least 1".into());
        }
        self.nat.validate()
    }
}

impl NatConfig {
    /// Validate the NAT settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err("NAT credentials cannot be empty".into());
        }
        if self.realm.is_empty() {
            return Err("NAT realm cannot be empty".into());
        }
        let (low, high) = self.relay_port_range;
        if low == 0 || low > high {
            return Err(format!("invalid relay port range {}-{}", low, high));
        }
        if self.default_lifetime > self.max_lifetime {
            return Err("default_lifetime exceeds max_lifetime".into());
        }
        if self.nonce_ttl.is_zero() || self.allocate_timeout.is_zero() {
            return Err("NAT timeouts must be non-zero".into());
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    pub instance_id: String,
    pub socks_listen_addr: String,
    pub socks_listen_port: u16,
    #[serde(default)]
    pub allow_non_unicast: bool,
    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub transport_connect_timeout_secs: u64,
    pub max_connections_per_session: usize,
    pub nat: NatConfigFile,
}

/// NAT section of [`ProxyConfigFile`].
#[derive(Debug, Serialize, Deserialize)]
pub struct NatConfigFile {
    pub listen_addr: String,
    pub realm: String,
    pub username: String,
    pub password: String,
    pub relay_address: String,
    pub relay_port_low: u16,
    pub relay_port_high: u16,
    pub default_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub nonce_ttl_secs: u64,
    pub allocate_timeout_secs: u64,
}

impl ProxyConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ProxyConfig, String> {
        let relay_address: Ipv4Addr = self
            .nat
            .relay_address
            .parse()
            .map_err(|e| format!("Invalid relay_address: {}", e))?;

        Ok(ProxyConfig {
            instance_id: self.instance_id.clone(),
            socks_listen_addr: self.socks_listen_addr.clone(),
            socks_listen_port: self.socks_listen_port,
            allow_non_unicast: self.allow_non_unicast,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            transport_connect_timeout: Duration::from_secs(self.transport_connect_timeout_secs),
            max_connections_per_session: self.max_connections_per_session,
            nat: NatConfig {
                listen_addr: self.nat.listen_addr.clone(),
                realm: self.nat.realm.clone(),
                username: self.nat.username.clone(),
                password: Zeroizing::new(self.nat.password.clone()),
                relay_address,
                relay_port_range: (self.nat.relay_port_low, self.nat.relay_port_high),
                default_lifetime: Duration::from_secs(self.nat.default_lifetime_secs),
                max_lifetime: Duration::from_secs(self.nat.max_lifetime_secs),
                nonce_ttl: Duration::from_secs(self.nat.nonce_ttl_secs),
                allocate_timeout: Duration::from_secs(self.nat.allocate_timeout_secs),
            },
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            socks_listen_addr: config.socks_listen_addr.clone(),
            socks_listen_port: config.socks_listen_port,
            allow_non_unicast: config.allow_non_unicast,
            handshake_timeout_secs: config.handshake_timeout.as_secs(),
            connect_timeout_secs: config.connect_timeout.as_secs(),
            transport_connect_timeout_secs: config.transport_connect_timeout.as_secs(),
            max_connections_per_session: config.max_connections_per_session,
            nat: NatConfigFile {
                listen_addr: config.nat.listen_addr.clone(),
                realm: config.nat.realm.clone(),
                username: config.nat.username.clone(),
                password: config.nat.password.to_string(),
                relay_address: config.nat.relay_address.to_string(),
                relay_port_low: config.nat.relay_port_range.0,
                relay_port_high: config.nat.relay_port_range.1,
                default_lifetime_secs: config.nat.default_lifetime.as_secs(),
                max_lifetime_secs: config.nat.max_lifetime.as_secs(),
                nonce_ttl_secs: config.nat.nonce_ttl.as_secs(),
                allocate_timeout_secs: config.nat.allocate_timeout.as_secs(),
            },
        }
    }
}
