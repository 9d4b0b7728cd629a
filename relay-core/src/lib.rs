//! Circuit relay node core.
//!
//! Layers, leaves first: [`identity`] keys and peer IDs, [`multiaddr`] addresses,
//! [`transport`] dialers and listeners, [`secure`] authenticated channels, [`mux`]
//! stream multiplexing, [`host`] which ties them into one node, and [`relay`] which
//! reserves slots and forwards circuits between peers.

pub mod host;
pub mod identity;
pub mod multiaddr;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod secure;
pub mod transport;
pub mod wire;

pub use host::{ConnectionInfo, DisconnectHook, HandlerOptions, Host, HostError, StreamHandler};
pub use identity::{KeyGenerationError, KeyType, Keypair, PeerId, PublicKey};
pub use multiaddr::{Multiaddr, MultiaddrError, Protocol};
pub use mux::{Direction, MuxConfig, MuxError, Stream};
pub use protocol::{HOP_PROTOCOL, PROTOCOL_VERSION, STOP_PROTOCOL};
pub use relay::{RelayClient, RelayConfig, RelayService, RelayStats};
pub use transport::{TransportError, TransportRegistry};
