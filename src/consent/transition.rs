//! Transition tables for both consent axes.
//!
//! User actions are a partial table: anything not listed is an error.
//! Remote signals are total: every state has a successor for both values of
//! the relevant bit.

use serde::{Deserialize, Serialize};

use super::state::{Axis, ClientState, ConsentAction, ProxyState, RemoteConsentSignal};
use crate::error::{Error, Result};

fn invalid(state: impl std::fmt::Debug, action: impl std::fmt::Debug) -> Error {
    Error::InvalidTransition {
        state: format!("{:?}", state),
        action: format!("{:?}", action),
    }
}

/// Apply a local user action to the proxy axis.
pub fn proxy_after_action(state: ProxyState, action: ConsentAction) -> Result<ProxyState> {
    use ConsentAction as A;
    use ProxyState as S;

    let next = match (state, action) {
        (S::None, A::Request) => S::UserRequested,
        (S::UserRequested, A::CancelRequest) => S::None,
        (S::RemoteOffered, A::Request) => S::Granted,
        (S::RemoteOffered, A::AcceptOffer) => S::Granted,
        (S::RemoteOffered, A::IgnoreOffer) => S::UserIgnoredOffer,
        (S::UserIgnoredOffer, A::AcceptOffer) => S::Granted,
        (S::Granted, A::CancelRequest) => S::RemoteOffered,
        _ => return Err(invalid(state, action)),
    };
    Ok(next)
}

/// Apply a local user action to the client axis.
pub fn client_after_action(state: ClientState, action: ConsentAction) -> Result<ClientState> {
    use ClientState as S;
    use ConsentAction as A;

    let next = match (state, action) {
        (S::None, A::Offer) => S::UserOffered,
        (S::UserOffered, A::CancelOffer) => S::None,
        (S::RemoteRequested, A::Offer) => S::Granted,
        (S::RemoteRequested, A::AllowRequest) => S::Granted,
        (S::RemoteRequested, A::IgnoreRequest) => S::UserIgnoredRequest,
        (S::UserIgnoredRequest, A::AllowRequest) => S::Granted,
        (S::Granted, A::CancelOffer) => S::RemoteRequested,
        _ => return Err(invalid(state, action)),
    };
    Ok(next)
}

/// Update the proxy axis from the remote's OFFERING bit.
pub fn proxy_after_signal(state: ProxyState, remote_offering: bool) -> ProxyState {
    use ProxyState as S;

    match (state, remote_offering) {
        (S::None, false) => S::None,
        (S::None, true) => S::RemoteOffered,
        (S::RemoteOffered, false) => S::None,
        (S::RemoteOffered, true) => S::RemoteOffered,
        (S::UserRequested, false) => S::UserRequested,
        (S::UserRequested, true) => S::Granted,
        // The remote can re-surface an ignored offer by withdrawing and re-offering.
        (S::UserIgnoredOffer, false) => S::None,
        (S::UserIgnoredOffer, true) => S::UserIgnoredOffer,
        (S::Granted, false) => S::UserRequested,
        (S::Granted, true) => S::Granted,
    }
}

/// Update the client axis from the remote's REQUESTING bit.
pub fn client_after_signal(state: ClientState, remote_requesting: bool) -> ClientState {
    use ClientState as S;

    match (state, remote_requesting) {
        (S::None, false) => S::None,
        (S::None, true) => S::RemoteRequested,
        (S::RemoteRequested, false) => S::None,
        (S::RemoteRequested, true) => S::RemoteRequested,
        (S::UserOffered, false) => S::UserOffered,
        (S::UserOffered, true) => S::Granted,
        (S::UserIgnoredRequest, false) => S::None,
        (S::UserIgnoredRequest, true) => S::UserIgnoredRequest,
        (S::Granted, false) => S::UserOffered,
        (S::Granted, true) => S::Granted,
    }
}

/// Input to the trust state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentInput {
    /// Something the local user clicked.
    Local(ConsentAction),
    /// A consent message received from the remote.
    Remote(RemoteConsentSignal),
}

/// Both consent axes for one remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustState {
    pub proxy_consent: ProxyState,
    pub client_consent: ClientState,
}

/// Result of feeding one input to a [`TrustState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub before: TrustState,
    pub after: TrustState,
    /// Signal to send to the remote; present for every local transition.
    pub outbound: Option<RemoteConsentSignal>,
}

impl Transition {
    /// `Some(granted)` if GRANTED was entered or left on the proxy axis.
    pub fn proxy_access_changed(&self) -> Option<bool> {
        let was = self.before.proxy_consent.is_granted();
        let now = self.after.proxy_consent.is_granted();
        (was != now).then_some(now)
    }

    /// `Some(granted)` if GRANTED was entered or left on the client axis.
    pub fn client_access_changed(&self) -> Option<bool> {
        let was = self.before.client_consent.is_granted();
        let now = self.after.client_consent.is_granted();
        (was != now).then_some(now)
    }

    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

impl TrustState {
    pub fn new(proxy_consent: ProxyState, client_consent: ClientState) -> Self {
        Self {
            proxy_consent,
            client_consent,
        }
    }

    /// The signal the remote should see for our current local state.
    pub fn outbound_signal(&self) -> RemoteConsentSignal {
        RemoteConsentSignal::from_bits(
            self.proxy_consent.user_is_requesting(),
            self.client_consent.user_is_offering(),
        )
    }

    /// Compute the successor state without mutating `self`.
    pub fn next(&self, input: ConsentInput) -> Result<Transition> {
        let before = *self;
        let (after, outbound) = match input {
            ConsentInput::Local(action) => {
                let after = match action.axis() {
                    Axis::Proxy => TrustState {
                        proxy_consent: proxy_after_action(self.proxy_consent, action)?,
                        ..before
                    },
                    Axis::Client => TrustState {
                        client_consent: client_after_action(self.client_consent, action)?,
                        ..before
                    },
                };
                (after, Some(after.outbound_signal()))
            }
            ConsentInput::Remote(signal) => {
                let after = TrustState {
                    proxy_consent: proxy_after_signal(self.proxy_consent, signal.is_offering()),
                    client_consent: client_after_signal(
                        self.client_consent,
                        signal.is_requesting(),
                    ),
                };
                (after, None)
            }
        };

        Ok(Transition {
            before,
            after,
            outbound,
        })
    }

    /// Apply `input`, leaving `self` untouched on error.
    pub fn apply(&mut self, input: ConsentInput) -> Result<Transition> {
        let transition = self.next(input)?;
        *self = transition.after;
        Ok(transition)
    }
}
