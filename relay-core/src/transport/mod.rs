//! Transports: raw byte connections, selected by the scheme segments of a multiaddr.
//!
//! A [`TransportRegistry`] holds `(matcher, transport)` pairs in registration order.
//! `dial` and `listen` use the first transport whose matcher accepts the address
//! (with any `/p2p/<id>` suffix stripped). Several transports can be registered side
//! by side; the address decides, not a global preference.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::multiaddr::Multiaddr;

pub mod memory;
pub mod tcp;
pub mod websocket;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;
pub use websocket::WsTransport;

/// Pause after a failed accept before trying again, so resource exhaustion does not spin.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bidirectional byte channel produced by a transport.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError>;
}

#[async_trait]
pub trait Listener: Send {
    /// Address actually bound (port 0 resolved).
    fn local_addr(&self) -> Multiaddr;

    /// Next inbound connection and the remote's address.
    async fn accept(&mut self) -> Result<(BoxedIo, Multiaddr), TransportError>;
}

/// Predicate over an address's scheme segments.
pub type SchemeMatcher = Box<dyn Fn(&Multiaddr) -> bool + Send + Sync>;

struct Entry {
    matcher: SchemeMatcher,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
pub struct TransportRegistry {
    entries: Vec<Entry>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// TCP and WebSocket-over-TCP.
    pub fn with_network_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(scheme::websocket, WsTransport::new());
        registry.register(scheme::tcp, TcpTransport::new());
        registry
    }

    /// Add a transport. Earlier registrations win when several matchers accept an address.
    pub fn register<M, T>(&mut self, matcher: M, transport: T)
    where
        M: Fn(&Multiaddr) -> bool + Send + Sync + 'static,
        T: Transport + 'static,
    {
        self.entries.push(Entry {
            matcher: Box::new(matcher),
            transport: Arc::new(transport),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transport responsible for `addr`.
    pub fn select(&self, addr: &Multiaddr) -> Result<Arc<dyn Transport>, TransportError> {
        let bare = addr.without_p2p();
        self.entries
            .iter()
            .find(|e| (e.matcher)(&bare))
            .map(|e| e.transport.clone())
            .ok_or_else(|| TransportError::NoMatchingTransport(addr.clone()))
    }

    pub async fn dial(&self, addr: &Multiaddr) -> Result<BoxedIo, TransportError> {
        let transport = self.select(addr)?;
        tracing::debug!(%addr, transport = transport.name(), "dialing");
        transport.dial(&addr.without_p2p()).await
    }

    pub async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, TransportError> {
        let transport = self.select(addr)?;
        let listener = transport.listen(&addr.without_p2p()).await?;
        tracing::debug!(
            requested = %addr,
            bound = %listener.local_addr(),
            transport = transport.name(),
            "listening"
        );
        Ok(listener)
    }
}

/// Stock matchers for the bundled transports.
pub mod scheme {
    use crate::multiaddr::{Multiaddr, Protocol};

    fn segments(addr: &Multiaddr) -> Vec<&Protocol> {
        addr.iter().collect()
    }

    fn is_host(p: &Protocol) -> bool {
        matches!(
            p,
            Protocol::Ip4(_)
                | Protocol::Ip6(_)
                | Protocol::Dns(_)
                | Protocol::Dns4(_)
                | Protocol::Dns6(_)
        )
    }

    /// `/<host>/tcp/<port>`
    pub fn tcp(addr: &Multiaddr) -> bool {
        matches!(segments(addr).as_slice(), [h, Protocol::Tcp(_)] if is_host(h))
    }

    /// `/<host>/tcp/<port>/ws`
    pub fn websocket(addr: &Multiaddr) -> bool {
        matches!(
            segments(addr).as_slice(),
            [h, Protocol::Tcp(_), Protocol::Ws] if is_host(h)
        )
    }

    /// `/memory/<port>`
    pub fn memory(addr: &Multiaddr) -> bool {
        matches!(segments(addr).as_slice(), [Protocol::Memory(_)])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no registered transport can handle {0}")]
    NoMatchingTransport(Multiaddr),
    #[error("transport cannot use address {0}")]
    UnsupportedAddress(Multiaddr),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection refused by {0}")]
    ConnectionRefused(Multiaddr),
    #[error("address {0} already in use")]
    AddressInUse(Multiaddr),
    #[error("listener closed")]
    ListenerClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn matchers_select_by_scheme() {
        assert!(scheme::tcp(&addr("/ip4/127.0.0.1/tcp/1")));
        assert!(!scheme::tcp(&addr("/ip4/127.0.0.1/tcp/1/ws")));
        assert!(scheme::websocket(&addr("/dns4/example.com/tcp/443/ws")));
        assert!(!scheme::websocket(&addr("/ip4/127.0.0.1/udp/1")));
        assert!(scheme::memory(&addr("/memory/9")));
        assert!(!scheme::memory(&addr("/ip4/127.0.0.1/tcp/1")));
    }

    #[test]
    fn select_follows_address_not_order() {
        let reg = TransportRegistry::with_network_defaults();
        assert_eq!(reg.select(&addr("/ip4/127.0.0.1/tcp/1")).unwrap().name(), "tcp");
        assert_eq!(
            reg.select(&addr("/ip4/127.0.0.1/tcp/1/ws")).unwrap().name(),
            "websocket"
        );
        assert!(matches!(
            reg.select(&addr("/ip4/127.0.0.1/udp/0")),
            Err(TransportError::NoMatchingTransport(_))
        ));
    }

    #[test]
    fn registration_order_breaks_ties() {
        let hub = MemoryHub::new();
        let mut reg = TransportRegistry::new();
        reg.register(|_: &Multiaddr| true, MemoryTransport::new(hub.clone()));
        reg.register(scheme::tcp, TcpTransport::new());
        assert_eq!(reg.select(&addr("/ip4/127.0.0.1/tcp/1")).unwrap().name(), "memory");
    }

    #[tokio::test]
    async fn p2p_suffix_ignored_for_selection() {
        let hub = MemoryHub::new();
        let mut reg = TransportRegistry::new();
        reg.register(scheme::memory, MemoryTransport::new(hub));
        let id = crate::identity::Keypair::random().unwrap().peer_id();
        let mut listener = reg.listen(&addr("/memory/0")).await.unwrap();
        let target = listener.local_addr().with_p2p(id).unwrap();
        let (dialed, accepted) = tokio::join!(reg.dial(&target), listener.accept());
        let mut a = dialed.unwrap();
        let (mut b, _) = accepted.unwrap();
        a.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn empty_registry_has_no_transport() {
        let reg = TransportRegistry::new();
        assert!(reg.is_empty());
        assert!(matches!(
            reg.dial(&addr("/memory/1")).await,
            Err(TransportError::NoMatchingTransport(_))
        ));
    }
}
