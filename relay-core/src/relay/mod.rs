//! Circuit relay.
//!
//! A peer that cannot be dialed directly reserves a slot at a relay
//! ([`RelayClient::reserve`]). Another peer then asks the relay to bridge it to the
//! reserved peer ([`RelayClient::connect`]); the relay opens a stop stream to the target
//! and forwards bytes between the two streams within the configured limits.

pub mod circuit;
pub mod client;
pub mod reservation;
pub mod service;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::PeerId;
use crate::mux::{MuxError, Stream};
use crate::protocol::{CircuitLimit, StatusCode};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

pub use circuit::{CircuitState, CloseReason, FailReason};
pub use client::{IncomingCircuit, IncomingCircuits, RelayClient, RelayReservation, RelayedStream};
pub use reservation::{Granted, Reservation, ReservationTable};
pub use service::{RelayService, RelayServiceError};

/// Largest hop/stop message accepted.
const MAX_MESSAGE_LEN: usize = 8 * 1024;

/// Limits and capacities of a relay. Every value is a deployment decision; `Default`
/// gives conservative settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_reservations: usize,
    pub reservation_ttl: Duration,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    /// Bytes a circuit may carry, both directions combined.
    pub circuit_bytes: u64,
    pub circuit_duration: Duration,
    /// A circuit with no traffic in either direction for this long is closed.
    pub circuit_idle_timeout: Duration,
    /// Bound on each reservation or circuit negotiation.
    pub negotiation_timeout: Duration,
    pub sweep_interval: Duration,
    /// Peers that may not hold reservations.
    pub deny: Vec<PeerId>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            reservation_ttl: Duration::from_secs(60 * 60),
            max_circuits: 16,
            max_circuits_per_peer: 4,
            circuit_bytes: 128 * 1024,
            circuit_duration: Duration::from_secs(2 * 60),
            circuit_idle_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            deny: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayConfigError> {
        let durations = [
            ("reservation_ttl", self.reservation_ttl),
            ("circuit_duration", self.circuit_duration),
            ("circuit_idle_timeout", self.circuit_idle_timeout),
            ("negotiation_timeout", self.negotiation_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        match durations.into_iter().find(|(_, d)| d.is_zero()) {
            Some((name, _)) => Err(RelayConfigError::ZeroDuration(name)),
            None => Ok(()),
        }
    }

    /// Circuit limits as announced to both endpoints.
    pub fn circuit_limit(&self) -> CircuitLimit {
        CircuitLimit {
            duration_secs: self.circuit_duration.as_secs(),
            data_bytes: self.circuit_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelayConfigError {
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
}

/// Point-in-time relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub active_reservations: usize,
    pub active_circuits: usize,
    pub reservations_accepted: u64,
    pub reservations_rejected: u64,
    pub circuits_opened: u64,
    pub circuits_rejected: u64,
    pub bytes_relayed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    reservations_accepted: AtomicU64,
    reservations_rejected: AtomicU64,
    circuits_opened: AtomicU64,
    circuits_rejected: AtomicU64,
    bytes_relayed: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self, active_reservations: usize, active_circuits: usize) -> RelayStats {
        RelayStats {
            active_reservations,
            active_circuits,
            reservations_accepted: self.reservations_accepted.load(Ordering::Relaxed),
            reservations_rejected: self.reservations_rejected.load(Ordering::Relaxed),
            circuits_opened: self.circuits_opened.load(Ordering::Relaxed),
            circuits_rejected: self.circuits_rejected.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
        }
    }
}

/// Why a reservation was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    #[error("relay is at reservation capacity")]
    Full,
    #[error("relay refused the reservation")]
    Rejected,
}

/// Why a circuit could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    #[error("target has no active reservation")]
    NoReservation,
    #[error("relay could not reach the target")]
    TargetUnreachable,
    #[error("circuit limit exceeded")]
    LimitExceeded,
    #[error("relay denied the circuit")]
    PermissionDenied,
}

/// Failure reading or writing a hop/stop message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("stream: {0}")]
    Stream(#[from] MuxError),
    #[error("stream closed before a message arrived")]
    Closed,
    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decode: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("negotiation timed out")]
    Timeout,
    #[error("unexpected message")]
    Unexpected,
}

pub(crate) async fn write_message<T: Serialize>(
    stream: &Stream,
    msg: &T,
) -> Result<(), ProtocolError> {
    let frame = wire::encode_frame(msg)?;
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read exactly one length-prefixed message.
pub(crate) async fn read_message<T: DeserializeOwned>(stream: &Stream) -> Result<T, ProtocolError> {
    let mut buf = vec![0u8; wire::LEN_SIZE];
    read_exact(stream, &mut buf).await?;
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::TooLarge(len));
    }
    buf.resize(wire::LEN_SIZE + len, 0);
    read_exact(stream, &mut buf[wire::LEN_SIZE..]).await?;
    let (msg, _) = wire::decode_frame(&buf)?;
    Ok(msg)
}

async fn read_exact(stream: &Stream, mut buf: &mut [u8]) -> Result<(), ProtocolError> {
    while !buf.is_empty() {
        let n = stream.read(buf).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        let rest = buf;
        buf = &mut rest[n..];
    }
    Ok(())
}

/// Status code a relay answers with when `err` stops a circuit.
pub(crate) fn circuit_status(err: CircuitError) -> StatusCode {
    match err {
        CircuitError::NoReservation => StatusCode::NoReservation,
        CircuitError::TargetUnreachable => StatusCode::ConnectionFailed,
        CircuitError::LimitExceeded => StatusCode::ResourceLimitExceeded,
        CircuitError::PermissionDenied => StatusCode::PermissionDenied,
    }
}

/// Active slot counter shared by the reservation and circuit tables.
pub(crate) fn try_claim(counter: &AtomicUsize, capacity: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < capacity).then_some(n + 1)
        })
        .is_ok()
}
