//! # peershare
//!
//! Share network egress with a peer you have mutually agreed to trust.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Controller (start / stop / modify_consent, peer msgs)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  PeerRegistry + consent state machine per peer          │
//! ├─────────────────────────────────────────────────────────┤
//! │  ProxyClientSession (SOCKS5) │ ProxyRelaySession        │
//! ├─────────────────────────────────────────────────────────┤
//! │  ConnectionMultiplexer (tagged frames, one transport)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport (ordered channel + signaling sideband)       │
//! └─────────────────────────────────────────────────────────┘
//!                NAT allocation frontend (ALLOCATE)
//! ```
//!
//! ## Guarantees
//!
//! 1. **Consent first**: no traffic flows on an axis unless both sides agreed
//! 2. **Per-request checks**: the relay re-checks consent on every CONNECT
//! 3. **Ordered streams**: bytes of one connection arrive in order

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod consent;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod nat;
pub mod peer;
pub mod proxy;
pub mod transport;

pub use config::{NatConfig, ProxyConfig};
pub use controller::Controller;
pub use error::{Error, Result};

/// Default bound on reading a SOCKS5 handshake (milliseconds)
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
