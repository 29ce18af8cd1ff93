//! Known peers, their consent state, and the messages exchanged with them.
//!
//! The roster/identity layer is external: it reports peers coming online and
//! carries [`PeerMessage`]s through a [`PeerMessenger`]. Peers are keyed by
//! instance id.

mod instance;
mod registry;
mod store;

pub use instance::RemoteInstance;
pub use registry::PeerRegistry;
pub use store::{InstanceStore, MemoryStore};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::consent::{Axis, ConsentMessage, TrustState};
use crate::error::{Error, Result};

/// Identity an instance announces to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHandshake {
    pub instance_id: String,
    /// Fingerprint of the instance's long-term key.
    pub key_hash: String,
    #[serde(default)]
    pub description: String,
}

impl InstanceHandshake {
    pub fn new(instance_id: impl Into<String>, key_hash: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            key_hash: key_hash.into(),
            description: String::new(),
        }
    }
}

/// Messages carried between instances by the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum PeerMessage {
    Handshake(InstanceHandshake),
    Consent(ConsentMessage),
}

impl PeerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::InvalidMessage(format!("bad peer message: {}", e)))
    }
}

/// Send primitive supplied by the roster.
pub trait PeerMessenger: Send + Sync {
    fn send_to_peer(&self, peer_id: &str, message: PeerMessage) -> Result<()>;
}

/// Messenger that queues `(peer_id, message)` on a channel.
#[derive(Debug, Clone)]
pub struct ChannelMessenger {
    tx: mpsc::UnboundedSender<(String, PeerMessage)>,
}

impl ChannelMessenger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, PeerMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerMessenger for ChannelMessenger {
    fn send_to_peer(&self, peer_id: &str, message: PeerMessage) -> Result<()> {
        self.tx
            .send((peer_id.to_string(), message))
            .map_err(|_| Error::transport("roster channel closed"))
    }
}

/// Status of a proxy session as seen by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Started,
    Stopped,
    /// Torn down by an error, e.g. transport loss.
    Failed(String),
}

/// Change notifications published by [`PeerRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    ConsentChanged {
        instance_id: String,
        trust: TrustState,
    },
    /// The remote may (or may no longer) proxy for us.
    ProxyAccessChanged { instance_id: String, granted: bool },
    /// We may (or may no longer) proxy for the remote.
    ClientAccessChanged { instance_id: String, granted: bool },
    OnlineChanged { instance_id: String, online: bool },
    Forgotten { instance_id: String },
    SessionStatus {
        instance_id: String,
        axis: Axis,
        status: SessionStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::RemoteConsentSignal;

    #[test]
    fn test_peer_message_wire_format() {
        let msg = PeerMessage::Consent(ConsentMessage::new("a", RemoteConsentSignal::Offering));
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"type":"consent","payload":{"instanceId":"a","consent":2}}"#
        );
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), msg);

        assert!(PeerMessage::from_bytes(b"{\"type\":\"bogus\"}").is_err());
    }

    #[test]
    fn test_channel_messenger() {
        let (messenger, mut rx) = ChannelMessenger::new();
        let hs = PeerMessage::Handshake(InstanceHandshake::new("me", "ab12"));
        messenger.send_to_peer("you", hs.clone()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), ("you".to_string(), hs));

        drop(rx);
        assert!(messenger
            .send_to_peer("you", PeerMessage::Handshake(InstanceHandshake::new("me", "")))
            .is_err());
    }
}
