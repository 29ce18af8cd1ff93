//! NAT allocation: a STUN/TURN-style ALLOCATE exchange that reserves an
//! externally reachable relay endpoint when peers cannot connect directly.
//!
//! - [`message`]: the wire codec
//! - [`frontend`]: credential challenge, mappings and lifetimes
//! - [`client`]: UDP serve loop and the allocating client

pub mod client;
pub mod frontend;
pub mod message;

pub use client::{serve_udp, Allocation, AllocationClient};
pub use frontend::{Mapping, NatAllocationFrontend};
pub use message::{Class, Message, Method};
