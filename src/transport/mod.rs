//! Shared point-to-point transport to a peer.
//!
//! Connection negotiation (ICE/SDP or equivalent) happens outside this
//! crate. Sessions only see an ordered, reliable message channel with a
//! sideband for opaque signaling blobs, plus a link state that moves
//! `Connecting -> Connected -> Closed`.
//!
//! [`Transport::pair`] builds two connected in-memory ends; it stands in for
//! a real network transport in tests and in the loopback CLI mode.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};

/// Messages that may be queued per direction before senders wait.
pub const CHANNEL_CAPACITY: usize = 256;

/// Link state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Closed,
}

/// Link state shared by both ends of a transport.
#[derive(Debug, Clone)]
pub struct Link {
    state: Arc<watch::Sender<LinkState>>,
}

impl Link {
    fn new(initial: LinkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Mark the link connected. Has no effect once closed.
    pub fn set_connected(&self) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Connecting {
                *state = LinkState::Connected;
                true
            } else {
                false
            }
        });
    }

    /// Close the link for both ends.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Closed {
                false
            } else {
                *state = LinkState::Closed;
                true
            }
        });
    }

    /// Resolve once the link is connected; fails if it closes first.
    pub async fn once_connected(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                LinkState::Connected => return Ok(()),
                LinkState::Closed => {
                    return Err(Error::transport("closed before connecting"));
                }
                LinkState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::transport("link dropped"));
            }
        }
    }

    /// Resolve once the link is closed.
    pub async fn once_closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == LinkState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Sending half of a transport.
#[derive(Debug, Clone)]
pub struct TransportSender {
    data: mpsc::Sender<Bytes>,
    signals: mpsc::UnboundedSender<Vec<u8>>,
    link: Link,
}

impl TransportSender {
    /// Send one message to the peer.
    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        if self.link.is_closed() {
            return Err(Error::transport("link closed"));
        }
        self.data
            .send(data)
            .await
            .map_err(|_| Error::transport("peer end dropped"))
    }

    /// Send an opaque signaling blob on the sideband.
    pub fn send_signal(&self, blob: Vec<u8>) -> Result<()> {
        if self.link.is_closed() {
            return Err(Error::transport("link closed"));
        }
        self.signals
            .send(blob)
            .map_err(|_| Error::transport("peer end dropped"))
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// Receiving half of a transport.
#[derive(Debug)]
pub struct TransportReceiver {
    data: mpsc::Receiver<Bytes>,
    signals: mpsc::UnboundedReceiver<Vec<u8>>,
    link: Link,
}

impl TransportReceiver {
    /// Next message from the peer, or `None` once the link is closed.
    pub async fn recv_data(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            data = self.data.recv() => data,
            _ = self.link.once_closed() => None,
        }
    }

    /// Next signaling blob from the peer, or `None` once the link is closed.
    pub async fn recv_signal(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            blob = self.signals.recv() => blob,
            _ = self.link.once_closed() => None,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }
}

/// One end of a transport to a peer.
#[derive(Debug)]
pub struct Transport {
    sender: TransportSender,
    receiver: TransportReceiver,
}

impl Transport {
    /// Two connected in-memory ends.
    pub fn pair() -> (Transport, Transport) {
        Self::pair_with_state(LinkState::Connected)
    }

    /// Two in-memory ends still negotiating; call [`Link::set_connected`]
    /// to finish.
    pub fn pending_pair() -> (Transport, Transport) {
        Self::pair_with_state(LinkState::Connecting)
    }

    fn pair_with_state(initial: LinkState) -> (Transport, Transport) {
        let link = Link::new(initial);
        let (a_data_tx, b_data_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_data_tx, a_data_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (a_sig_tx, b_sig_rx) = mpsc::unbounded_channel();
        let (b_sig_tx, a_sig_rx) = mpsc::unbounded_channel();

        let a = Transport {
            sender: TransportSender {
                data: a_data_tx,
                signals: a_sig_tx,
                link: link.clone(),
            },
            receiver: TransportReceiver {
                data: a_data_rx,
                signals: a_sig_rx,
                link: link.clone(),
            },
        };
        let b = Transport {
            sender: TransportSender {
                data: b_data_tx,
                signals: b_sig_tx,
                link: link.clone(),
            },
            receiver: TransportReceiver {
                data: b_data_rx,
                signals: b_sig_rx,
                link,
            },
        };
        (a, b)
    }

    pub fn link(&self) -> &Link {
        &self.sender.link
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (TransportSender, TransportReceiver) {
        (self.sender, self.receiver)
    }
}

/// Opens transports to peers.
pub trait TransportProvider: Send + Sync {
    /// Start connecting to `peer_id`. The returned transport may still be
    /// `Connecting`.
    fn connect(&self, peer_id: &str) -> Result<Transport>;
}

/// Provider that hands the far end of an in-memory pair to a local acceptor.
pub struct LoopbackConnector {
    local_id: String,
    acceptor: mpsc::UnboundedSender<(String, Transport)>,
}

impl LoopbackConnector {
    /// Far ends arrive on the returned receiver tagged with `local_id`.
    pub fn new(local_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<(String, Transport)>) {
        let (acceptor, incoming) = mpsc::unbounded_channel();
        (
            Self {
                local_id: local_id.into(),
                acceptor,
            },
            incoming,
        )
    }
}

impl TransportProvider for LoopbackConnector {
    fn connect(&self, peer_id: &str) -> Result<Transport> {
        let (local, remote) = Transport::pair();
        self.acceptor
            .send((self.local_id.clone(), remote))
            .map_err(|_| Error::transport(format!("no acceptor for {}", peer_id)))?;
        Ok(local)
    }
}
