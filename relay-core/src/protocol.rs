//! Relay wire protocol: protocol identifiers and message types.
//!
//! A client talks to the relay over a [`HOP_PROTOCOL`] stream (reserve a slot, or ask
//! to be connected to a peer that holds one). The relay talks to the target over a
//! [`STOP_PROTOCOL`] stream to announce the incoming circuit. Each stream carries
//! length-prefixed bincode frames (see `wire`).

use serde::{Deserialize, Serialize};

use crate::identity::{Keypair, PeerId, PublicKey};
use crate::multiaddr::Multiaddr;

/// Current protocol version. Used in the connection handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Client → relay negotiation.
pub const HOP_PROTOCOL: &str = "/relay/hop/1.0.0";

/// Relay → target circuit announcement.
pub const STOP_PROTOCOL: &str = "/relay/stop/1.0.0";

const VOUCHER_DOMAIN: &[u8] = b"relay-reservation-voucher:";

/// Messages on a hop stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopMessage {
    /// Ask the relay to hold a slot for the sender.
    Reserve,
    /// Ask the relay to bridge the sender to `target`.
    Connect { target: PeerId },
    /// Relay's answer to either request.
    Status {
        code: StatusCode,
        reservation: Option<ReservationInfo>,
        limit: Option<CircuitLimit>,
    },
}

/// Messages on a stop stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMessage {
    /// Relay announces a circuit from `initiator`.
    Connect {
        initiator: PeerId,
        limit: Option<CircuitLimit>,
    },
    /// Target's answer.
    Status { code: StatusCode },
}

/// Negotiation outcome codes shared by hop and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    /// Relay declined to hold a reservation for this peer.
    ReservationRefused,
    /// Reservation or circuit capacity is exhausted.
    ResourceLimitExceeded,
    PermissionDenied,
    /// Relay could not reach the target.
    ConnectionFailed,
    /// Target holds no active reservation.
    NoReservation,
    MalformedMessage,
    UnexpectedMessage,
}

/// Limits the relay applies to a circuit. Both endpoints learn them up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitLimit {
    pub duration_secs: u64,
    pub data_bytes: u64,
}

/// Granted reservation as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    /// Expiry as UNIX seconds.
    pub expires_at: u64,
    /// Relay addresses the reserving peer may advertise (with `/p2p-circuit` appended).
    pub addrs: Vec<Multiaddr>,
    pub voucher: Voucher,
}

/// Relay-signed proof that `peer` holds a reservation until `expiration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub relay: PeerId,
    pub peer: PeerId,
    pub expiration: u64,
    pub relay_key: PublicKey,
    pub signature: Vec<u8>,
}

impl Voucher {
    pub fn sign(relay: &Keypair, peer: PeerId, expiration: u64) -> Self {
        let payload = signing_payload(&relay.peer_id(), &peer, expiration);
        Voucher {
            relay: relay.peer_id(),
            peer,
            expiration,
            relay_key: relay.public_key().clone(),
            signature: relay.sign(&payload).to_vec(),
        }
    }

    /// Check the key matches the relay ID and the signature covers the fields.
    pub fn verify(&self) -> bool {
        if self.relay_key.peer_id() != self.relay {
            return false;
        }
        let payload = signing_payload(&self.relay, &self.peer, self.expiration);
        self.relay_key.verify(&payload, &self.signature)
    }
}

fn signing_payload(relay: &PeerId, peer: &PeerId, expiration: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(VOUCHER_DOMAIN.len() + 72);
    out.extend_from_slice(VOUCHER_DOMAIN);
    out.extend_from_slice(relay.as_bytes());
    out.extend_from_slice(peer.as_bytes());
    out.extend_from_slice(&expiration.to_be_bytes());
    out
}
