//! Consent states, user actions, and the wire signal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which relationship an action or state refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// The remote acting as a proxy for the local user.
    Proxy,
    /// The remote acting as a client of the local user.
    Client,
}

/// Action issued by the local user. Never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentAction {
    /// Ask the remote to proxy for us.
    Request,
    /// Withdraw a request (or stop using a granted proxy).
    CancelRequest,
    /// Accept the remote's standing offer.
    AcceptOffer,
    /// Hide the remote's offer without rejecting it outright.
    IgnoreOffer,
    /// Offer to proxy for the remote.
    Offer,
    /// Withdraw an offer (or stop sharing with a granted client).
    CancelOffer,
    /// Allow the remote's outstanding request.
    AllowRequest,
    /// Hide the remote's request without rejecting it outright.
    IgnoreRequest,
}

impl ConsentAction {
    /// Every action, in declaration order.
    pub const ALL: [ConsentAction; 8] = [
        ConsentAction::Request,
        ConsentAction::CancelRequest,
        ConsentAction::AcceptOffer,
        ConsentAction::IgnoreOffer,
        ConsentAction::Offer,
        ConsentAction::CancelOffer,
        ConsentAction::AllowRequest,
        ConsentAction::IgnoreRequest,
    ];

    /// The axis this action changes.
    pub fn axis(self) -> Axis {
        match self {
            ConsentAction::Request
            | ConsentAction::CancelRequest
            | ConsentAction::AcceptOffer
            | ConsentAction::IgnoreOffer => Axis::Proxy,
            ConsentAction::Offer
            | ConsentAction::CancelOffer
            | ConsentAction::AllowRequest
            | ConsentAction::IgnoreRequest => Axis::Client,
        }
    }
}

impl fmt::Display for ConsentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The other side's local consent, as carried on the wire.
///
/// `REQUESTING` means the sender wants us as a proxy; `OFFERING` means the
/// sender will proxy for us.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RemoteConsentSignal {
    None = 0,
    Requesting = 1,
    Offering = 2,
    Both = 3,
}

impl RemoteConsentSignal {
    /// Build a signal from its two bits.
    pub fn from_bits(requesting: bool, offering: bool) -> Self {
        match (requesting, offering) {
            (false, false) => RemoteConsentSignal::None,
            (true, false) => RemoteConsentSignal::Requesting,
            (false, true) => RemoteConsentSignal::Offering,
            (true, true) => RemoteConsentSignal::Both,
        }
    }

    pub fn is_requesting(self) -> bool {
        matches!(
            self,
            RemoteConsentSignal::Requesting | RemoteConsentSignal::Both
        )
    }

    pub fn is_offering(self) -> bool {
        matches!(self, RemoteConsentSignal::Offering | RemoteConsentSignal::Both)
    }
}

impl From<RemoteConsentSignal> for u8 {
    fn from(signal: RemoteConsentSignal) -> u8 {
        signal as u8
    }
}

impl TryFrom<u8> for RemoteConsentSignal {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RemoteConsentSignal::None),
            1 => Ok(RemoteConsentSignal::Requesting),
            2 => Ok(RemoteConsentSignal::Offering),
            3 => Ok(RemoteConsentSignal::Both),
            _ => Err(Error::InvalidMessage(format!(
                "unknown consent signal: {}",
                v
            ))),
        }
    }
}

/// Whether the remote may act as a proxy for the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyState {
    #[default]
    None,
    UserRequested,
    RemoteOffered,
    UserIgnoredOffer,
    Granted,
}

impl ProxyState {
    pub const ALL: [ProxyState; 5] = [
        ProxyState::None,
        ProxyState::UserRequested,
        ProxyState::RemoteOffered,
        ProxyState::UserIgnoredOffer,
        ProxyState::Granted,
    ];

    /// The REQUESTING bit we advertise to the remote.
    pub fn user_is_requesting(self) -> bool {
        matches!(self, ProxyState::UserRequested | ProxyState::Granted)
    }

    /// Whether the remote has an outstanding offer, ignored or not.
    pub fn remote_is_offering(self) -> bool {
        matches!(
            self,
            ProxyState::RemoteOffered | ProxyState::UserIgnoredOffer | ProxyState::Granted
        )
    }

    pub fn is_granted(self) -> bool {
        self == ProxyState::Granted
    }
}

/// Whether the local user will act as a proxy for the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    #[default]
    None,
    UserOffered,
    RemoteRequested,
    UserIgnoredRequest,
    Granted,
}

impl ClientState {
    pub const ALL: [ClientState; 5] = [
        ClientState::None,
        ClientState::UserOffered,
        ClientState::RemoteRequested,
        ClientState::UserIgnoredRequest,
        ClientState::Granted,
    ];

    /// The OFFERING bit we advertise to the remote.
    pub fn user_is_offering(self) -> bool {
        matches!(self, ClientState::UserOffered | ClientState::Granted)
    }

    /// Whether the remote has an outstanding request, ignored or not.
    pub fn remote_is_requesting(self) -> bool {
        matches!(
            self,
            ClientState::RemoteRequested | ClientState::UserIgnoredRequest | ClientState::Granted
        )
    }

    pub fn is_granted(self) -> bool {
        self == ClientState::Granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_bits() {
        for requesting in [false, true] {
            for offering in [false, true] {
                let signal = RemoteConsentSignal::from_bits(requesting, offering);
                assert_eq!(signal.is_requesting(), requesting);
                assert_eq!(signal.is_offering(), offering);
            }
        }
    }

    #[test]
    fn test_signal_wire_value() {
        assert_eq!(u8::from(RemoteConsentSignal::Both), 3);
        assert_eq!(
            RemoteConsentSignal::try_from(2).unwrap(),
            RemoteConsentSignal::Offering
        );
        assert!(RemoteConsentSignal::try_from(4).is_err());

        let json = serde_json::to_string(&RemoteConsentSignal::Requesting).unwrap();
        assert_eq!(json, "1");
    }

    #[test]
    fn test_action_axis() {
        let proxy: Vec<_> = ConsentAction::ALL
            .iter()
            .filter(|a| a.axis() == Axis::Proxy)
            .collect();
        assert_eq!(proxy.len(), 4);
        assert_eq!(ConsentAction::AllowRequest.axis(), Axis::Client);
    }

    #[test]
    fn test_ignored_states_track_remote() {
        assert!(ProxyState::UserIgnoredOffer.remote_is_offering());
        assert!(!ProxyState::UserIgnoredOffer.user_is_requesting());
        assert!(ClientState::UserIgnoredRequest.remote_is_requesting());
        assert!(!ClientState::UserIgnoredRequest.user_is_offering());
    }
}
