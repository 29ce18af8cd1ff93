//! SOCKS5 handshake parsing.
//!
//! Sans-io: the caller feeds each read from the local socket and writes the
//! returned reply bytes. Only the no-auth method and the CONNECT command are
//! served; IPv6 destinations are refused.
//!
//! Each handshake message must arrive whole in a single read. A greeting or
//! request split across reads (or followed by extra bytes) is a protocol
//! error and the connection is dropped.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain name a one-byte length prefix can carry.
pub const MAX_DOMAIN_LEN: usize = 255;

/// Size of every reply this parser emits.
pub const REPLY_SIZE: usize = 10;

/// SOCKS5 reply codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn from_u8(v: u8) -> Reply {
        match v {
            0x00 => Reply::Succeeded,
            0x02 => Reply::NotAllowed,
            0x03 => Reply::NetworkUnreachable,
            0x04 => Reply::HostUnreachable,
            0x05 => Reply::ConnectionRefused,
            0x06 => Reply::TtlExpired,
            0x07 => Reply::CommandNotSupported,
            0x08 => Reply::AddressTypeNotSupported,
            _ => Reply::GeneralFailure,
        }
    }

    /// Map an outbound connect failure to a reply code.
    ///
    /// With `reveal_refused` false, refused and reset both become
    /// [`Reply::GeneralFailure`] so the relay can't be used as a port scanner.
    pub fn from_io_error(e: &io::Error, reveal_refused: bool) -> Reply {
        match e.kind() {
            io::ErrorKind::TimedOut => Reply::TtlExpired,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                if reveal_refused =>
            {
                Reply::ConnectionRefused
            }
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }

    /// The full reply message with the placeholder bound address.
    pub fn encode(self) -> [u8; REPLY_SIZE] {
        [SOCKS_VERSION, self as u8, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 0]
    }
}

/// Destination host of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Domain(String),
}

/// Where a proxied connection should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: Host,
    pub port: u16,
}

impl Destination {
    pub fn ipv4(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            host: Host::Ipv4(addr),
            port,
        }
    }

    /// Fails on names that don't fit the one-byte SOCKS5 length prefix.
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_DOMAIN_LEN {
            return Err(Error::InvalidMessage(format!(
                "domain name length {} outside 1-{}",
                name.len(),
                MAX_DOMAIN_LEN
            )));
        }
        Ok(Self {
            host: Host::Domain(name),
            port,
        })
    }

    /// Encode in SOCKS5 address form: atyp(1) + address + port(2).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(7);
        match &self.host {
            Host::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Host::Domain(name) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }

    /// Decode SOCKS5 address form. Returns the destination and bytes consumed.
    pub fn decode(payload: &[u8]) -> Result<(Self, usize)> {
        let atyp = *payload
            .first()
            .ok_or_else(|| Error::InvalidMessage("empty address payload".into()))?;

        let (host, port_at) = match atyp {
            ATYP_IPV4 => {
                if payload.len() < 7 {
                    return Err(Error::InvalidMessage("IPv4 address too short".into()));
                }
                let ip = Ipv4Addr::new(payload[1], payload[2], payload[3], payload[4]);
                (Host::Ipv4(ip), 5)
            }
            ATYP_DOMAIN => {
                if payload.len() < 2 {
                    return Err(Error::InvalidMessage("domain address too short".into()));
                }
                let len = payload[1] as usize;
                if len == 0 {
                    return Err(Error::InvalidMessage("empty domain name".into()));
                }
                if payload.len() < 2 + len + 2 {
                    return Err(Error::InvalidMessage("domain address truncated".into()));
                }
                let name = std::str::from_utf8(&payload[2..2 + len])
                    .map_err(|_| Error::InvalidMessage("domain name is not UTF-8".into()))?;
                (Host::Domain(name.to_string()), 2 + len)
            }
            ATYP_IPV6 => return Err(Error::unsupported("IPv6 destinations")),
            _ => {
                return Err(Error::InvalidMessage(format!(
                    "unknown address type: 0x{:02x}",
                    atyp
                )))
            }
        };

        let port = u16::from_be_bytes([payload[port_at], payload[port_at + 1]]);
        Ok((Self { host, port }, port_at + 2))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for the method greeting.
    New,
    /// Greeting answered; waiting for the request.
    Connecting,
    /// CONNECT request parsed.
    Connected,
    /// Terminal failure.
    Error,
}

/// What the caller should do after a successful [`SocksRequestParser::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write these bytes to the client and read again.
    Reply(Vec<u8>),
    /// The request is complete.
    Request(Destination),
}

/// Incremental SOCKS5 greeting and request parser for one local connection.
#[derive(Debug)]
pub struct SocksRequestParser {
    state: ParserState,
    failure: Option<Reply>,
}

impl Default for SocksRequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksRequestParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::New,
            failure: None,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Feed one read's worth of bytes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Step> {
        let result = match self.state {
            ParserState::New => self.parse_greeting(chunk),
            ParserState::Connecting => self.parse_request(chunk),
            ParserState::Connected => Err(Error::protocol("handshake already complete")),
            ParserState::Error => Err(Error::protocol("parser is in the error state")),
        };

        match result {
            Ok(step) => {
                self.state = match step {
                    Step::Reply(_) => ParserState::Connecting,
                    Step::Request(_) => ParserState::Connected,
                };
                Ok(step)
            }
            Err(e) => {
                self.state = ParserState::Error;
                Err(e)
            }
        }
    }

    /// Reply to send before closing, if the failure has one.
    pub fn error_reply(&self) -> Option<[u8; REPLY_SIZE]> {
        self.failure.map(Reply::encode)
    }

    fn parse_greeting(&mut self, chunk: &[u8]) -> Result<Step> {
        if chunk.len() < 2 {
            return Err(Error::protocol("fragmented greeting"));
        }
        if chunk[0] != SOCKS_VERSION {
            return Err(Error::protocol(format!(
                "unsupported SOCKS version: {}",
                chunk[0]
            )));
        }

        let nmethods = chunk[1] as usize;
        if chunk.len() != 2 + nmethods {
            return Err(Error::protocol(format!(
                "fragmented greeting: expected {} bytes, got {}",
                2 + nmethods,
                chunk.len()
            )));
        }

        Ok(Step::Reply(vec![SOCKS_VERSION, METHOD_NO_AUTH]))
    }

    fn parse_request(&mut self, chunk: &[u8]) -> Result<Step> {
        if chunk.len() < 4 {
            return Err(Error::protocol("fragmented request"));
        }
        if chunk[0] != SOCKS_VERSION {
            self.failure = Some(Reply::GeneralFailure);
            return Err(Error::protocol(format!(
                "unsupported SOCKS version: {}",
                chunk[0]
            )));
        }

        match chunk[1] {
            CMD_CONNECT => {}
            CMD_BIND | CMD_UDP_ASSOCIATE => {
                self.failure = Some(Reply::CommandNotSupported);
                let name = if chunk[1] == CMD_BIND {
                    "BIND"
                } else {
                    "UDP ASSOCIATE"
                };
                return Err(Error::unsupported(name));
            }
            other => {
                self.failure = Some(Reply::CommandNotSupported);
                return Err(Error::protocol(format!("unknown command: {}", other)));
            }
        }

        if chunk[2] != 0x00 {
            self.failure = Some(Reply::GeneralFailure);
            return Err(Error::protocol("reserved byte must be zero"));
        }

        let (destination, used) = match Destination::decode(&chunk[3..]) {
            Ok(v) => v,
            Err(Error::Unsupported(what)) => {
                self.failure = Some(Reply::AddressTypeNotSupported);
                return Err(Error::Unsupported(what));
            }
            Err(Error::InvalidMessage(msg)) if chunk[3] == ATYP_IPV4 || chunk[3] == ATYP_DOMAIN => {
                return Err(Error::protocol(format!("fragmented request: {}", msg)));
            }
            Err(e) => {
                self.failure = Some(Reply::AddressTypeNotSupported);
                return Err(Error::protocol(e.to_string()));
            }
        };

        if 3 + used != chunk.len() {
            return Err(Error::protocol(format!(
                "fragmented request: {} trailing bytes",
                chunk.len() - 3 - used
            )));
        }

        Ok(Step::Request(destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_connect() {
        let mut parser = SocksRequestParser::new();

        let step = parser.feed(&[5, 1, 0]).unwrap();
        assert_eq!(step, Step::Reply(vec![5, 0]));
        assert_eq!(parser.state(), ParserState::Connecting);

        let step = parser.feed(&[5, 1, 0, 1, 1, 2, 3, 4, 0, 80]).unwrap();
        assert_eq!(
            step,
            Step::Request(Destination::ipv4(Ipv4Addr::new(1, 2, 3, 4), 80))
        );
        assert_eq!(parser.state(), ParserState::Connected);
        assert_eq!(Reply::Succeeded.encode(), [5, 0, 0, 1, 127, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_domain_connect() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 2, 0, 2]).unwrap();

        let mut req = vec![5, 1, 0, 3, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());

        match parser.feed(&req).unwrap() {
            Step::Request(dest) => {
                assert_eq!(dest, Destination::domain("example.com", 443).unwrap());
                assert_eq!(dest.to_string(), "example.com:443");
            }
            other => panic!("unexpected step: {:?}", other),
        }
    }

    #[test]
    fn test_bad_version() {
        let mut parser = SocksRequestParser::new();
        let err = parser.feed(&[4, 1, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(parser.state(), ParserState::Error);
        assert!(parser.error_reply().is_none());

        // Nothing is accepted afterwards.
        assert!(parser.feed(&[5, 1, 0]).is_err());
    }

    #[test]
    fn test_bind_rejected() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 1, 0]).unwrap();

        let err = parser.feed(&[5, 2, 0, 1, 1, 2, 3, 4, 0, 80]).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(parser.state(), ParserState::Error);
        assert_eq!(parser.error_reply().unwrap()[1], Reply::CommandNotSupported as u8);
    }

    #[test]
    fn test_udp_associate_rejected() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 1, 0]).unwrap();
        assert!(matches!(
            parser.feed(&[5, 3, 0, 1, 0, 0, 0, 0, 0, 0]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_ipv6_rejected() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 1, 0]).unwrap();

        let mut req = vec![5, 1, 0, 4];
        req.extend_from_slice(&[0u8; 16]);
        req.extend_from_slice(&80u16.to_be_bytes());

        let err = parser.feed(&req).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(
            parser.error_reply().unwrap()[1],
            Reply::AddressTypeNotSupported as u8
        );
    }

    #[test]
    fn test_fragmented_greeting_is_fatal() {
        // Method list split across reads.
        let mut parser = SocksRequestParser::new();
        assert!(matches!(parser.feed(&[5, 2, 0]), Err(Error::Protocol(_))));

        // Greeting and request coalesced into one read.
        let mut parser = SocksRequestParser::new();
        assert!(parser
            .feed(&[5, 1, 0, 5, 1, 0, 1, 1, 2, 3, 4, 0, 80])
            .is_err());
    }

    #[test]
    fn test_fragmented_request_is_fatal() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 1, 0]).unwrap();
        assert!(matches!(
            parser.feed(&[5, 1, 0, 1, 1, 2]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_nonzero_reserved() {
        let mut parser = SocksRequestParser::new();
        parser.feed(&[5, 1, 0]).unwrap();
        assert!(parser.feed(&[5, 1, 1, 1, 1, 2, 3, 4, 0, 80]).is_err());
    }

    #[test]
    fn test_destination_payload() {
        let dest = Destination::domain("example.org", 8080).unwrap();
        let encoded = dest.encode();
        let (decoded, used) = Destination::decode(&encoded).unwrap();
        assert_eq!(decoded, dest);
        assert_eq!(used, encoded.len());

        let payload = vec![0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let (dest, _) = Destination::decode(&payload).unwrap();
        assert_eq!(dest.to_string(), "93.184.216.34:443");
    }

    #[test]
    fn test_domain_length_bounds() {
        let longest = "a".repeat(MAX_DOMAIN_LEN);
        let dest = Destination::domain(longest, 80).unwrap();
        let encoded = dest.encode();
        assert_eq!(encoded[1] as usize, MAX_DOMAIN_LEN);
        assert_eq!(Destination::decode(&encoded).unwrap().0, dest);

        assert!(matches!(
            Destination::domain("a".repeat(MAX_DOMAIN_LEN + 1), 80),
            Err(Error::InvalidMessage(_))
        ));
        assert!(Destination::domain("", 80).is_err());
    }

    #[test]
    fn test_reply_from_io_error() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(Reply::from_io_error(&refused, true), Reply::ConnectionRefused);
        assert_eq!(Reply::from_io_error(&refused, false), Reply::GeneralFailure);

        let timeout = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(Reply::from_io_error(&timeout, false), Reply::TtlExpired);
        assert_eq!(Reply::from_u8(0x42), Reply::GeneralFailure);
    }
}
