//! Mutual consent between two instances.
//!
//! Consent is REQUESTED by the side that wants a proxy and OFFERED by the
//! side that gives one; once both have happened it is GRANTED. The two
//! relationships are tracked independently:
//!
//! - [`ProxyState`]: may the remote proxy *for us*?
//! - [`ClientState`]: may the remote proxy *through us*?
//!
//! Local clicks arrive as [`ConsentAction`]s, the remote's view arrives as a
//! [`RemoteConsentSignal`] inside a [`ConsentMessage`].

mod state;
mod transition;

pub use state::{Axis, ClientState, ConsentAction, ProxyState, RemoteConsentSignal};
pub use transition::{
    client_after_action, client_after_signal, proxy_after_action, proxy_after_signal,
    ConsentInput, Transition, TrustState,
};

use serde::{Deserialize, Serialize};

/// Consent message sent to a peer on every local consent transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentMessage {
    /// Sender's instance id.
    pub instance_id: String,
    pub consent: RemoteConsentSignal,
}

impl ConsentMessage {
    pub fn new(instance_id: impl Into<String>, consent: RemoteConsentSignal) -> Self {
        Self {
            instance_id: instance_id.into(),
            consent,
        }
    }
}
