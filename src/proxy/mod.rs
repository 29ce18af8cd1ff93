//! SOCKS5 egress sharing over a peer transport.
//!
//! Proxy side: a local SOCKS5 listener whose connections are tunneled to the
//! peer. Relay side: the peer's CONNECT requests are vetted and turned into
//! real outbound sockets.

pub mod client;
pub mod mux;
pub mod policy;
pub mod relay;
pub mod session;
pub mod socks5;

pub use client::ProxyClientSession;
pub use mux::{ConnectionMultiplexer, Frame, FrameType, Tag};
pub use policy::DestinationPolicy;
pub use relay::ProxyRelaySession;
pub use session::{SessionState, SessionStats, Teardown};
pub use socks5::{Destination, Host, Reply, SocksRequestParser};
