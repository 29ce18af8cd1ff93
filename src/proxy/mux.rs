//! Connection multiplexing over a shared transport.
//!
//! Each frame has a 7-byte header: type(1) + tag(4) + data_len(2) + payload.
//!
//! The [`ConnectionMultiplexer`] owns the tag table for one transport
//! session. Frames for a tag are delivered to that connection's event
//! channel in arrival order; connections never see each other's frames.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::proxy::socks5::{Destination, Reply};

/// Maximum payload size per frame.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Events queued per connection before the frame reader waits.
pub const CONNECTION_QUEUE: usize = 64;

/// Per-connection identifier, unique for the lifetime of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u32);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out tags from a monotonic counter. Tags are never reused.
#[derive(Debug)]
pub struct TagAllocator {
    next: AtomicU64,
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Next unused tag; fails once the 32-bit space is spent.
    pub fn allocate(&self) -> Result<Tag> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        u32::try_from(n)
            .map(Tag)
            .map_err(|_| Error::transport("connection tags exhausted"))
    }
}

/// Multiplexing frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Open a connection. Payload: SOCKS5 address form.
    Connect = 0x01,
    /// Outcome of a connect. Payload: SOCKS5 reply code(1).
    ConnectReply = 0x02,
    /// Data for an open connection.
    Data = 0x03,
    /// Graceful close.
    Close = 0x04,
    /// Abrupt teardown.
    Reset = 0x05,
}

impl FrameType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::ConnectReply),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Reset),
            _ => Err(Error::InvalidMessage(format!(
                "unknown frame type: 0x{:02x}",
                v
            ))),
        }
    }
}

/// A multiplexing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub tag: Tag,
    pub payload: Bytes,
}

impl Frame {
    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Bytes {
        let len = self.payload.len() as u16;
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.tag.0.to_be_bytes());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Decode a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let frame_type = FrameType::from_u8(data[0])?;
        let tag = Tag(u32::from_be_bytes([data[1], data[2], data[3], data[4]]));
        let data_len = u16::from_be_bytes([data[5], data[6]]) as usize;

        if data.len() != FRAME_HEADER_SIZE + data_len {
            return Err(Error::InvalidMessage(format!(
                "frame length mismatch: header says {} payload bytes, got {}",
                data_len,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        Ok(Self {
            frame_type,
            tag,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..]),
        })
    }

    pub fn connect(tag: Tag, destination: &Destination) -> Self {
        Self {
            frame_type: FrameType::Connect,
            tag,
            payload: Bytes::from(destination.encode()),
        }
    }

    pub fn connect_reply(tag: Tag, reply: Reply) -> Self {
        Self {
            frame_type: FrameType::ConnectReply,
            tag,
            payload: Bytes::copy_from_slice(&[reply as u8]),
        }
    }

    pub fn data(tag: Tag, data: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            tag,
            payload: data,
        }
    }

    pub fn close(tag: Tag) -> Self {
        Self {
            frame_type: FrameType::Close,
            tag,
            payload: Bytes::new(),
        }
    }

    pub fn reset(tag: Tag) -> Self {
        Self {
            frame_type: FrameType::Reset,
            tag,
            payload: Bytes::new(),
        }
    }
}

/// Lifecycle of one multiplexed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Closed,
    Error,
}

/// Events delivered to the task serving one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The far side connected to the destination.
    Opened,
    /// Bytes from the far side.
    Data(Bytes),
    /// The far side closed the connection.
    Closed,
    /// The far side failed to connect.
    Error(Reply),
}

/// What [`ConnectionMultiplexer::dispatch`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Routed to a known connection.
    Delivered,
    /// Tag unknown; the frame was dropped.
    Dropped(Tag),
    /// A new connection request for the owner to vet and register.
    ConnectRequest { tag: Tag, payload: Bytes },
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    events: mpsc::Sender<ConnectionEvent>,
}

/// Bidirectional map between tags and local connection tasks.
#[derive(Debug)]
pub struct ConnectionMultiplexer {
    tags: TagAllocator,
    connections: Mutex<HashMap<Tag, Connection>>,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionMultiplexer {
    /// Frames to send to the peer are queued on `outbound`.
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            tags: TagAllocator::new(),
            connections: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Initiating side: allocate a tag and ask the peer to connect.
    pub async fn open(
        &self,
        destination: Destination,
    ) -> Result<(Tag, mpsc::Receiver<ConnectionEvent>)> {
        let tag = self.tags.allocate()?;
        let frame = Frame::connect(tag, &destination);
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

        self.connections.lock().insert(
            tag,
            Connection {
                state: ConnectionState::Connecting,
                events: tx,
            },
        );

        if let Err(e) = self.send(frame).await {
            self.connections.lock().remove(&tag);
            return Err(e);
        }
        Ok((tag, rx))
    }

    /// Relay side: track a tag the peer opened.
    pub fn register(&self, tag: Tag) -> Result<mpsc::Receiver<ConnectionEvent>> {
        let mut connections = self.connections.lock();
        if connections.contains_key(&tag) {
            return Err(Error::protocol(format!("tag {} already in use", tag)));
        }
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        connections.insert(
            tag,
            Connection {
                state: ConnectionState::New,
                events: tx,
            },
        );
        Ok(rx)
    }

    /// Relay side: report the connect outcome for `tag`.
    ///
    /// Anything but [`Reply::Succeeded`] also forgets the tag.
    pub async fn reply(&self, tag: Tag, reply: Reply) -> Result<()> {
        {
            let mut connections = self.connections.lock();
            if reply == Reply::Succeeded {
                if let Some(conn) = connections.get_mut(&tag) {
                    conn.state = ConnectionState::Connected;
                }
            } else {
                connections.remove(&tag);
            }
        }
        self.send(Frame::connect_reply(tag, reply)).await
    }

    /// Queue bytes for the peer, split into frames.
    pub async fn send_data(&self, tag: Tag, data: &[u8]) -> Result<()> {
        if !self.connections.lock().contains_key(&tag) {
            return Err(Error::Session(format!("connection {} is closed", tag)));
        }
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            self.send(Frame::data(tag, Bytes::copy_from_slice(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Local side closed: forget the tag and tell the peer.
    ///
    /// Returns false if the tag was already gone.
    pub async fn close(&self, tag: Tag) -> bool {
        let removed = self.connections.lock().remove(&tag).is_some();
        if removed {
            let _ = self.send(Frame::close(tag)).await;
        }
        removed
    }

    /// Route one inbound frame.
    ///
    /// Waits while the target connection's queue is full, which holds back
    /// the frame reader until that connection catches up.
    pub async fn dispatch(&self, frame: Frame) -> Dispatched {
        let tag = frame.tag;
        let frame_type = frame.frame_type;

        let event = match frame_type {
            FrameType::Connect => {
                return Dispatched::ConnectRequest {
                    tag,
                    payload: frame.payload,
                }
            }
            FrameType::ConnectReply => {
                match Reply::from_u8(frame.payload.first().copied().unwrap_or(0x01)) {
                    Reply::Succeeded => ConnectionEvent::Opened,
                    reply => ConnectionEvent::Error(reply),
                }
            }
            FrameType::Data => ConnectionEvent::Data(frame.payload),
            FrameType::Close | FrameType::Reset => ConnectionEvent::Closed,
        };

        let events = {
            let mut connections = self.connections.lock();
            let terminal = matches!(event, ConnectionEvent::Closed | ConnectionEvent::Error(_));
            if terminal {
                connections.remove(&tag).map(|conn| conn.events)
            } else {
                connections.get_mut(&tag).map(|conn| {
                    if event == ConnectionEvent::Opened {
                        conn.state = ConnectionState::Connected;
                    }
                    conn.events.clone()
                })
            }
        };

        let Some(events) = events else {
            tracing::debug!("Dropping {:?} frame for unknown tag {}", frame_type, tag);
            return Dispatched::Dropped(tag);
        };
        // A closed receiver means the connection task already finished.
        let _ = events.send(event).await;
        Dispatched::Delivered
    }

    /// Tear down every connection. Returns how many were open.
    ///
    /// Connection tasks see their event queue end. Reset frames are queued
    /// for the peer where the outbound queue has room.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.lock().drain().collect();
        let mut unsent = 0;
        for (tag, conn) in &drained {
            let _ = conn.events.try_send(ConnectionEvent::Closed);
            if self.outbound.try_send(Frame::reset(*tag)).is_err() {
                unsent += 1;
            }
        }
        if unsent > 0 {
            tracing::debug!(
                "{} of {} reset frames not queued; the peer sees the transport close instead",
                unsent,
                drained.len()
            );
        }
        drained.len()
    }

    pub fn state(&self, tag: Tag) -> Option<ConnectionState> {
        self.connections.lock().get(&tag).map(|c| c.state)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.connections.lock().contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::transport("transport writer stopped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn dest(port: u16) -> Destination {
        Destination::ipv4(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::data(Tag(42), Bytes::from_static(b"hello world"));
        let decoded = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.tag, Tag(42));
        assert_eq!(decoded.payload, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_frame_rejects_bad_input() {
        assert!(Frame::decode(&[0x03, 0, 0]).is_err());
        assert!(Frame::decode(&[0x09, 0, 0, 0, 1, 0, 0]).is_err());
        // Length field larger than the payload.
        assert!(Frame::decode(&[0x03, 0, 0, 0, 1, 0, 5, 1]).is_err());
    }

    #[test]
    fn test_tags_are_monotonic() {
        let tags = TagAllocator::new();
        let a = tags.allocate().unwrap();
        let b = tags.allocate().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_tag_exhaustion() {
        let tags = TagAllocator::starting_at(u32::MAX as u64);
        assert_eq!(tags.allocate().unwrap(), Tag(u32::MAX));
        assert!(matches!(tags.allocate(), Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_open_sends_connect() {
        let (tx, mut rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);

        let (tag, _events) = mux.open(dest(80)).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Connect);
        assert_eq!(frame.tag, tag);
        assert_eq!(Destination::decode(&frame.payload).unwrap().0, dest(80));
        assert_eq!(mux.state(tag), Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_isolation_between_tags() {
        let (tx, _rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);

        let (a, mut a_events) = mux.open(dest(1)).await.unwrap();
        let (b, mut b_events) = mux.open(dest(2)).await.unwrap();
        let (c, mut c_events) = mux.open(dest(3)).await.unwrap();

        // Queue data for C before A goes away.
        mux.dispatch(Frame::data(c, Bytes::from_static(b"for c"))).await;
        mux.dispatch(Frame::data(b, Bytes::from_static(b"for b"))).await;

        assert_eq!(
            b_events.recv().await.unwrap(),
            ConnectionEvent::Data(Bytes::from_static(b"for b"))
        );
        assert!(a_events.try_recv().is_err());

        assert!(mux.close(a).await);
        assert!(!mux.contains(a));
        assert_eq!(mux.len(), 2);
        assert_eq!(mux.state(b), Some(ConnectionState::Connecting));
        assert_eq!(
            c_events.recv().await.unwrap(),
            ConnectionEvent::Data(Bytes::from_static(b"for c"))
        );
    }

    #[tokio::test]
    async fn test_unknown_tag_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);

        let got = mux
            .dispatch(Frame::data(Tag(99), Bytes::from_static(b"late")))
            .await;
        assert_eq!(got, Dispatched::Dropped(Tag(99)));
    }

    #[tokio::test]
    async fn test_connect_reply_and_remote_close() {
        let (tx, _rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);

        let (ok, mut ok_events) = mux.open(dest(1)).await.unwrap();
        let (bad, mut bad_events) = mux.open(dest(2)).await.unwrap();

        mux.dispatch(Frame::connect_reply(ok, Reply::Succeeded)).await;
        mux.dispatch(Frame::connect_reply(bad, Reply::ConnectionRefused)).await;

        assert_eq!(ok_events.recv().await.unwrap(), ConnectionEvent::Opened);
        assert_eq!(mux.state(ok), Some(ConnectionState::Connected));
        assert_eq!(
            bad_events.recv().await.unwrap(),
            ConnectionEvent::Error(Reply::ConnectionRefused)
        );
        assert!(!mux.contains(bad));

        mux.dispatch(Frame::close(ok)).await;
        assert_eq!(ok_events.recv().await.unwrap(), ConnectionEvent::Closed);
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_connect_frames_surface_to_owner() {
        let (tx, mut rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);

        let payload = Bytes::from(dest(443).encode());
        let got = mux
            .dispatch(Frame {
                frame_type: FrameType::Connect,
                tag: Tag(7),
                payload: payload.clone(),
            })
            .await;
        assert_eq!(
            got,
            Dispatched::ConnectRequest {
                tag: Tag(7),
                payload
            }
        );

        let _events = mux.register(Tag(7)).unwrap();
        assert!(mux.register(Tag(7)).is_err());
        assert_eq!(mux.state(Tag(7)), Some(ConnectionState::New));

        mux.reply(Tag(7), Reply::Succeeded).await.unwrap();
        assert_eq!(mux.state(Tag(7)), Some(ConnectionState::Connected));
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::ConnectReply);
        assert_eq!(frame.payload[0], 0x00);
    }

    #[tokio::test]
    async fn test_send_data_chunks_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);
        let (tag, _events) = mux.open(dest(80)).await.unwrap();
        rx.recv().await.unwrap();

        let data: Vec<u8> = (0..MAX_FRAME_PAYLOAD * 2 + 10).map(|i| i as u8).collect();
        mux.send_data(tag, &data).await.unwrap();

        let mut joined = Vec::new();
        for _ in 0..3 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.tag, tag);
            joined.extend_from_slice(&frame.payload);
        }
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_close_all_empties_table() {
        let (tx, mut rx) = mpsc::channel(64);
        let mux = ConnectionMultiplexer::new(tx);

        let mut receivers = Vec::new();
        for port in 1..=5 {
            receivers.push(mux.open(dest(port)).await.unwrap().1);
        }

        assert_eq!(mux.close_all(), 5);
        assert!(mux.is_empty());
        for mut events in receivers {
            assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
            assert!(events.recv().await.is_none());
        }

        let mut resets = 0;
        while let Ok(frame) = rx.try_recv() {
            if frame.frame_type == FrameType::Reset {
                resets += 1;
            }
        }
        assert_eq!(resets, 5);
    }

    #[tokio::test]
    async fn test_close_all_with_full_outbound_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let mux = ConnectionMultiplexer::new(tx);
        let (_tag, mut events) = mux.open(dest(1)).await.unwrap();
        mux.register(Tag(1000)).unwrap();

        // The connect frame fills the queue; resets cannot be queued.
        assert_eq!(mux.close_all(), 2);
        assert!(mux.is_empty());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Closed);
    }

    #[tokio::test]
    async fn test_full_connection_queue_holds_dispatch() {
        let (tx, _rx) = mpsc::channel(16);
        let mux = ConnectionMultiplexer::new(tx);
        let (tag, mut events) = mux.open(dest(80)).await.unwrap();

        for _ in 0..CONNECTION_QUEUE {
            mux.dispatch(Frame::data(tag, Bytes::from_static(b"x"))).await;
        }

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            mux.dispatch(Frame::data(tag, Bytes::from_static(b"y"))),
        )
        .await;
        assert!(blocked.is_err());

        // Draining one event makes room again.
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Data(Bytes::from_static(b"x"))
        );
        let got = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            mux.dispatch(Frame::data(tag, Bytes::from_static(b"z"))),
        )
        .await
        .unwrap();
        assert_eq!(got, Dispatched::Delivered);
    }
}
