use serde::{Deserialize, Serialize};

use crate::consent::{ClientState, ProxyState, TrustState};
use crate::peer::InstanceHandshake;

/// Everything known about one remote instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInstance {
    pub instance_id: String,
    pub key_hash: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub trust: TrustState,
    /// Not persisted; every instance starts offline after a load.
    #[serde(skip)]
    pub online: bool,
}

impl RemoteInstance {
    pub fn from_handshake(handshake: &InstanceHandshake) -> Self {
        Self {
            instance_id: handshake.instance_id.clone(),
            key_hash: handshake.key_hash.clone(),
            description: handshake.description.clone(),
            trust: TrustState::default(),
            online: true,
        }
    }

    /// Refresh identity fields. Returns true if the key changed.
    pub fn update(&mut self, handshake: &InstanceHandshake) -> bool {
        let key_changed = self.key_hash != handshake.key_hash;
        self.key_hash = handshake.key_hash.clone();
        self.description = handshake.description.clone();
        key_changed
    }

    pub fn proxy_consent(&self) -> ProxyState {
        self.trust.proxy_consent
    }

    pub fn client_consent(&self) -> ClientState {
        self.trust.client_consent
    }
}
