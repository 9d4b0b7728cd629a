//! Multiaddresses: `/`-separated (protocol, value) segments describing one endpoint,
//! optionally suffixed with the peer's identity.
//!
//! Composition rules checked on every construction:
//! - a host segment (`ip4`, `ip6`, `dns`, `dns4`, `dns6`) opens an address or a
//!   relayed tail; `memory` stands alone in place of host + port;
//! - `tcp` and `udp` follow a host; `ws` and `wss` follow `tcp`;
//! - `p2p` is terminal, except that `p2p-circuit` may follow it
//!   (`<relay addr>/p2p/<relay>/p2p-circuit/p2p/<target>`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::identity::PeerId;

/// One segment of a multiaddress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Dns4(String),
    Dns6(String),
    Tcp(u16),
    Udp(u16),
    Ws,
    Wss,
    Memory(u64),
    P2p(PeerId),
    P2pCircuit,
}

impl Protocol {
    /// Segment name as it appears in text form.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Dns(_) => "dns",
            Protocol::Dns4(_) => "dns4",
            Protocol::Dns6(_) => "dns6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Memory(_) => "memory",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
        }
    }

    fn is_host(&self) -> bool {
        matches!(
            self,
            Protocol::Ip4(_)
                | Protocol::Ip6(_)
                | Protocol::Dns(_)
                | Protocol::Dns4(_)
                | Protocol::Dns6(_)
        )
    }

    fn parse_next<'a, I>(tag: &str, parts: &mut I) -> Result<Self, MultiaddrError>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut value = || {
            parts
                .next()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| MultiaddrError::MissingValue(tag.to_string()))
        };
        let invalid = |v: &str| MultiaddrError::InvalidValue {
            protocol: tag.to_string(),
            value: v.to_string(),
        };
        let proto = match tag {
            "ip4" => {
                let v = value()?;
                Protocol::Ip4(v.parse().map_err(|_| invalid(v))?)
            }
            "ip6" => {
                let v = value()?;
                Protocol::Ip6(v.parse().map_err(|_| invalid(v))?)
            }
            "dns" => Protocol::Dns(value()?.to_string()),
            "dns4" => Protocol::Dns4(value()?.to_string()),
            "dns6" => Protocol::Dns6(value()?.to_string()),
            "tcp" => {
                let v = value()?;
                Protocol::Tcp(v.parse().map_err(|_| invalid(v))?)
            }
            "udp" => {
                let v = value()?;
                Protocol::Udp(v.parse().map_err(|_| invalid(v))?)
            }
            "ws" => Protocol::Ws,
            "wss" => Protocol::Wss,
            "memory" => {
                let v = value()?;
                Protocol::Memory(v.parse().map_err(|_| invalid(v))?)
            }
            "p2p" => {
                let v = value()?;
                Protocol::P2p(v.parse().map_err(|_| invalid(v))?)
            }
            "p2p-circuit" => Protocol::P2pCircuit,
            other => return Err(MultiaddrError::UnknownProtocol(other.to_string())),
        };
        Ok(proto)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.tag())?;
        match self {
            Protocol::Ip4(a) => write!(f, "/{a}"),
            Protocol::Ip6(a) => write!(f, "/{a}"),
            Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h) => write!(f, "/{h}"),
            Protocol::Tcp(p) | Protocol::Udp(p) => write!(f, "/{p}"),
            Protocol::Memory(p) => write!(f, "/{p}"),
            Protocol::P2p(id) => write!(f, "/{id}"),
            Protocol::Ws | Protocol::Wss | Protocol::P2pCircuit => Ok(()),
        }
    }
}

/// Validated, ordered sequence of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    segments: Vec<Protocol>,
}

impl Multiaddr {
    /// Build from segments, checking composition rules.
    pub fn from_segments(segments: Vec<Protocol>) -> Result<Self, MultiaddrError> {
        validate(&segments)?;
        Ok(Self { segments })
    }

    /// `/ip4|ip6/<ip>/tcp/<port>` for a socket address.
    pub fn from_tcp(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Self {
            segments: vec![host, Protocol::Tcp(addr.port())],
        }
    }

    pub fn memory(port: u64) -> Self {
        Self {
            segments: vec![Protocol::Memory(port)],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment, rejecting it if the result would be malformed.
    pub fn push(&mut self, proto: Protocol) -> Result<(), MultiaddrError> {
        self.segments.push(proto);
        if let Err(e) = validate(&self.segments) {
            self.segments.pop();
            return Err(e);
        }
        Ok(())
    }

    pub fn with(mut self, proto: Protocol) -> Result<Self, MultiaddrError> {
        self.push(proto)?;
        Ok(self)
    }

    /// Concatenate `other` onto `self`.
    pub fn encapsulate(&self, other: &Multiaddr) -> Result<Self, MultiaddrError> {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self::from_segments(segments)
    }

    /// Terminal peer identity, if any.
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.segments.last() {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    /// Append `/p2p/<id>` unless an identity suffix is already present.
    pub fn with_p2p(&self, id: PeerId) -> Result<Self, MultiaddrError> {
        match self.peer_id() {
            Some(existing) if existing == id => Ok(self.clone()),
            Some(existing) => Err(MultiaddrError::PeerIdConflict {
                existing,
                requested: id,
            }),
            None => self.clone().with(Protocol::P2p(id)),
        }
    }

    /// Address with any terminal `/p2p/<id>` removed.
    pub fn without_p2p(&self) -> Self {
        let mut segments = self.segments.clone();
        if matches!(segments.last(), Some(Protocol::P2p(_))) {
            segments.pop();
        }
        Self { segments }
    }

    /// True for addresses that route through a relay.
    pub fn is_relayed(&self) -> bool {
        self.segments.contains(&Protocol::P2pCircuit)
    }

    /// Socket address for `/ip4|ip6/<ip>/tcp/<port>` prefixes.
    pub fn tcp_socket_addr(&self) -> Option<SocketAddr> {
        match self.segments.as_slice() {
            [Protocol::Ip4(ip), Protocol::Tcp(port), ..] => {
                Some(SocketAddr::new(IpAddr::V4(*ip), *port))
            }
            [Protocol::Ip6(ip), Protocol::Tcp(port), ..] => {
                Some(SocketAddr::new(IpAddr::V6(*ip), *port))
            }
            _ => None,
        }
    }

    /// `(host, port)` for any host kind followed by `tcp`.
    pub fn tcp_host_port(&self) -> Option<(String, u16)> {
        match self.segments.as_slice() {
            [Protocol::Ip4(ip), Protocol::Tcp(port), ..] => Some((ip.to_string(), *port)),
            [Protocol::Ip6(ip), Protocol::Tcp(port), ..] => Some((ip.to_string(), *port)),
            [Protocol::Dns(h) | Protocol::Dns4(h) | Protocol::Dns6(h), Protocol::Tcp(port), ..] => {
                Some((h.clone(), *port))
            }
            _ => None,
        }
    }
}

fn validate(segments: &[Protocol]) -> Result<(), MultiaddrError> {
    if segments.is_empty() {
        return Err(MultiaddrError::Empty);
    }
    let misplaced = |p: &Protocol| MultiaddrError::Misplaced(p.tag().to_string());
    let mut prev: Option<&Protocol> = None;
    for seg in segments {
        let ok = match seg {
            Protocol::Ip4(_)
            | Protocol::Ip6(_)
            | Protocol::Dns(_)
            | Protocol::Dns4(_)
            | Protocol::Dns6(_) => matches!(prev, None | Some(Protocol::P2pCircuit)),
            Protocol::Memory(_) => matches!(prev, None | Some(Protocol::P2pCircuit)),
            Protocol::Tcp(_) | Protocol::Udp(_) => prev.is_some_and(Protocol::is_host),
            Protocol::Ws | Protocol::Wss => matches!(prev, Some(Protocol::Tcp(_))),
            Protocol::P2p(_) => !matches!(prev, Some(Protocol::P2p(_))),
            Protocol::P2pCircuit => matches!(prev, Some(Protocol::P2p(_))),
        };
        if !ok {
            return Err(misplaced(seg));
        }
        if let Some(Protocol::P2p(_)) = prev {
            if *seg != Protocol::P2pCircuit {
                return Err(MultiaddrError::P2pNotTerminal);
            }
        }
        prev = Some(seg);
    }
    match segments.last() {
        Some(last) if last.is_host() => Err(MultiaddrError::Incomplete(last.tag().to_string())),
        _ => Ok(()),
    }
}

impl FromStr for Multiaddr {
    type Err = MultiaddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| MultiaddrError::MissingLeadingSlash(s.to_string()))?;
        let mut parts = rest.split('/');
        let mut segments = Vec::new();
        while let Some(tag) = parts.next() {
            if tag.is_empty() {
                if parts.next().is_none() && !segments.is_empty() {
                    break; // trailing slash
                }
                return Err(MultiaddrError::EmptySegment);
            }
            segments.push(Protocol::parse_next(tag, &mut parts)?);
        }
        Self::from_segments(segments)
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, "{seg}")?;
        }
        Ok(())
    }
}

impl Serialize for Multiaddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Multiaddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiaddrError {
    #[error("empty multiaddr")]
    Empty,
    #[error("multiaddr must start with '/': {0:?}")]
    MissingLeadingSlash(String),
    #[error("empty segment in multiaddr")]
    EmptySegment,
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
    #[error("protocol {0:?} requires a value")]
    MissingValue(String),
    #[error("invalid value {value:?} for protocol {protocol:?}")]
    InvalidValue { protocol: String, value: String },
    #[error("protocol {0:?} is not allowed at this position")]
    Misplaced(String),
    #[error("host segment {0:?} must be followed by a transport")]
    Incomplete(String),
    #[error("/p2p must be the last segment")]
    P2pNotTerminal,
    #[error("address already names peer {existing}, not {requested}")]
    PeerIdConflict { existing: PeerId, requested: PeerId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use proptest::prelude::*;

    fn peer() -> PeerId {
        Keypair::random().unwrap().peer_id()
    }

    #[test]
    fn parses_websocket_listen_addr() {
        let addr: Multiaddr = "/ip4/0.0.0.0/tcp/4003/ws".parse().unwrap();
        let segs: Vec<_> = addr.iter().cloned().collect();
        assert_eq!(
            segs,
            vec![
                Protocol::Ip4(Ipv4Addr::UNSPECIFIED),
                Protocol::Tcp(4003),
                Protocol::Ws
            ]
        );
        assert_eq!(addr.to_string(), "/ip4/0.0.0.0/tcp/4003/ws");
    }

    #[test]
    fn parses_relayed_addr() {
        let relay = peer();
        let target = peer();
        let text = format!("/ip4/10.0.0.1/tcp/4003/ws/p2p/{relay}/p2p-circuit/p2p/{target}");
        let addr: Multiaddr = text.parse().unwrap();
        assert!(addr.is_relayed());
        assert_eq!(addr.peer_id(), Some(target));
        assert_eq!(addr.to_string(), text);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            "ip4/1.2.3.4/tcp/1".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingLeadingSlash("ip4/1.2.3.4/tcp/1".into()))
        );
        assert!(matches!(
            "/ip4/999.1.1.1/tcp/1".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { .. })
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/tcp/70000".parse::<Multiaddr>(),
            Err(MultiaddrError::InvalidValue { .. })
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/quic".parse::<Multiaddr>(),
            Err(MultiaddrError::UnknownProtocol(_))
        ));
        assert!(matches!(
            "/tcp/80".parse::<Multiaddr>(),
            Err(MultiaddrError::Misplaced(_))
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/udp/5/ws".parse::<Multiaddr>(),
            Err(MultiaddrError::Misplaced(_))
        ));
        assert!(matches!(
            "/ip4/1.2.3.4".parse::<Multiaddr>(),
            Err(MultiaddrError::Incomplete(_))
        ));
        assert!(matches!(
            "/ip4/1.2.3.4/tcp".parse::<Multiaddr>(),
            Err(MultiaddrError::MissingValue(_))
        ));
        assert_eq!("/".parse::<Multiaddr>(), Err(MultiaddrError::EmptySegment));
    }

    #[test]
    fn p2p_must_be_terminal() {
        let id = peer();
        let bad = format!("/ip4/1.2.3.4/tcp/1/p2p/{id}/ws");
        assert!(bad.parse::<Multiaddr>().is_err());
        let mut addr: Multiaddr = format!("/ip4/1.2.3.4/tcp/1/p2p/{id}").parse().unwrap();
        assert!(addr.push(Protocol::Tcp(5)).is_err());
        // failed push leaves address unchanged
        assert_eq!(addr.peer_id(), Some(id));
    }

    #[test]
    fn with_and_without_p2p() {
        let id = peer();
        let base: Multiaddr = "/memory/7".parse().unwrap();
        let full = base.with_p2p(id).unwrap();
        assert_eq!(full.peer_id(), Some(id));
        assert_eq!(full.with_p2p(id).unwrap(), full);
        assert!(matches!(
            full.with_p2p(peer()),
            Err(MultiaddrError::PeerIdConflict { .. })
        ));
        assert_eq!(full.without_p2p(), base);
    }

    #[test]
    fn socket_helpers() {
        let addr: Multiaddr = "/ip6/::1/tcp/9000/ws".parse().unwrap();
        assert_eq!(
            addr.tcp_socket_addr(),
            Some("[::1]:9000".parse().unwrap())
        );
        let dns: Multiaddr = "/dns4/relay.example.com/tcp/443/wss".parse().unwrap();
        assert_eq!(dns.tcp_socket_addr(), None);
        assert_eq!(
            dns.tcp_host_port(),
            Some(("relay.example.com".to_string(), 443))
        );
    }

    #[test]
    fn trailing_slash_tolerated() {
        let a: Multiaddr = "/ip4/1.2.3.4/tcp/80/".parse().unwrap();
        assert_eq!(a.to_string(), "/ip4/1.2.3.4/tcp/80");
    }

    fn arb_transport() -> impl Strategy<Value = Vec<Protocol>> {
        let host = prop_oneof![
            any::<[u8; 4]>().prop_map(|b| Protocol::Ip4(Ipv4Addr::from(b))),
            any::<[u8; 16]>().prop_map(|b| Protocol::Ip6(Ipv6Addr::from(b))),
            "[a-z][a-z0-9]{0,10}(\\.[a-z]{2,5})?".prop_map(Protocol::Dns4),
        ];
        prop_oneof![
            (host.clone(), any::<u16>(), any::<bool>()).prop_map(|(h, p, ws)| {
                let mut v = vec![h, Protocol::Tcp(p)];
                if ws {
                    v.push(Protocol::Ws);
                }
                v
            }),
            (host, any::<u16>()).prop_map(|(h, p)| vec![h, Protocol::Udp(p)]),
            any::<u64>().prop_map(|p| vec![Protocol::Memory(p)]),
        ]
    }

    proptest! {
        #[test]
        fn parse_format_roundtrip(
            segs in arb_transport(),
            id_bytes in proptest::option::of(any::<[u8; 32]>()),
        ) {
            let mut segs = segs;
            if let Some(b) = id_bytes {
                segs.push(Protocol::P2p(PeerId::from_bytes(b)));
            }
            let addr = Multiaddr::from_segments(segs).unwrap();
            let text = addr.to_string();
            let reparsed: Multiaddr = text.parse().unwrap();
            prop_assert_eq!(&reparsed, &addr);
            prop_assert_eq!(reparsed.to_string(), text);
        }
    }
}
