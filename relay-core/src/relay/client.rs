//! Endpoint side: reserve slots, open circuits, accept circuits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{read_message, write_message, CircuitError, ProtocolError, ReserveError};
use crate::host::{ConnectionInfo, Host, HostError};
use crate::identity::PeerId;
use crate::multiaddr::{Multiaddr, Protocol};
use crate::mux::Stream;
use crate::protocol::{
    CircuitLimit, HopMessage, StatusCode, StopMessage, Voucher, HOP_PROTOCOL, STOP_PROTOCOL,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const INCOMING_BACKLOG: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RelayClientError {
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("relay protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("reservation failed: {0}")]
    Reserve(#[from] ReserveError),
    #[error("circuit failed: {0}")]
    Circuit(#[from] CircuitError),
    #[error("relay returned an invalid voucher")]
    InvalidVoucher,
    #[error("relay answered {0:?}")]
    Status(StatusCode),
}

/// A reservation held at `relay`.
#[derive(Debug, Clone)]
pub struct RelayReservation {
    pub relay: PeerId,
    /// Expiry as UNIX seconds.
    pub expires_at: u64,
    /// The relay's own addresses.
    pub addrs: Vec<Multiaddr>,
    pub limit: Option<CircuitLimit>,
    pub voucher: Voucher,
}

impl RelayReservation {
    /// Addresses through which `peer` (the reservation holder) can be reached:
    /// `<relay addr>/p2p/<relay>/p2p-circuit/p2p/<peer>`.
    pub fn circuit_addrs(&self, peer: PeerId) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter_map(|a| {
                a.with_p2p(self.relay)
                    .and_then(|a| a.with(Protocol::P2pCircuit))
                    .and_then(|a| a.with(Protocol::P2p(peer)))
                    .ok()
            })
            .collect()
    }
}

/// Initiator's end of an established circuit.
#[derive(Debug)]
pub struct RelayedStream {
    pub relay: PeerId,
    pub target: PeerId,
    pub limit: Option<CircuitLimit>,
    pub stream: Stream,
}

/// Target's end of a circuit announced by a relay.
#[derive(Debug)]
pub struct IncomingCircuit {
    pub relay: PeerId,
    pub initiator: PeerId,
    pub limit: Option<CircuitLimit>,
    pub stream: Stream,
}

/// Circuits arriving at this host. Dropping it refuses further circuits.
pub struct IncomingCircuits {
    rx: mpsc::Receiver<IncomingCircuit>,
}

impl IncomingCircuits {
    pub async fn next(&mut self) -> Option<IncomingCircuit> {
        self.rx.recv().await
    }
}

/// Relay operations for one host.
#[derive(Clone)]
pub struct RelayClient {
    host: Host,
    timeout: Duration,
    relays: Arc<Mutex<HashSet<PeerId>>>,
}

impl RelayClient {
    pub fn new(host: Host) -> Self {
        Self {
            host,
            timeout: DEFAULT_TIMEOUT,
            relays: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Bound on each negotiation with a relay.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, stream: &Stream, request: HopMessage) -> Result<HopMessage, ProtocolError> {
        let exchange = async {
            write_message(stream, &request).await?;
            read_message::<HopMessage>(stream).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .unwrap_or(Err(ProtocolError::Timeout))
    }

    /// Ask `relay` (already connected) to hold a slot for this host.
    pub async fn reserve(&self, relay: PeerId) -> Result<RelayReservation, RelayClientError> {
        let stream = self.host.new_stream(relay, HOP_PROTOCOL).await?;
        let response = self.exchange(&stream, HopMessage::Reserve).await?;
        let _ = stream.close();
        let (info, limit) = match response {
            HopMessage::Status {
                code: StatusCode::Ok,
                reservation: Some(info),
                limit,
            } => (info, limit),
            HopMessage::Status {
                code: StatusCode::ResourceLimitExceeded,
                ..
            } => return Err(ReserveError::Full.into()),
            HopMessage::Status {
                code: StatusCode::ReservationRefused | StatusCode::PermissionDenied,
                ..
            } => return Err(ReserveError::Rejected.into()),
            HopMessage::Status { code, .. } => return Err(RelayClientError::Status(code)),
            _ => return Err(ProtocolError::Unexpected.into()),
        };
        let voucher = info.voucher;
        if voucher.relay != relay || voucher.peer != self.host.peer_id() || !voucher.verify() {
            return Err(RelayClientError::InvalidVoucher);
        }
        self.relays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(relay);
        tracing::info!(%relay, expires_at = info.expires_at, "reservation granted");
        Ok(RelayReservation {
            relay,
            expires_at: info.expires_at,
            addrs: info.addrs,
            limit,
            voucher,
        })
    }

    /// Ask `relay` (already connected) to bridge this host to `target`.
    pub async fn connect(
        &self,
        relay: PeerId,
        target: PeerId,
    ) -> Result<RelayedStream, RelayClientError> {
        let stream = self.host.new_stream(relay, HOP_PROTOCOL).await?;
        let response = self.exchange(&stream, HopMessage::Connect { target }).await?;
        let code = match response {
            HopMessage::Status {
                code: StatusCode::Ok,
                limit,
                ..
            } => {
                tracing::debug!(%relay, %target, "circuit established");
                return Ok(RelayedStream {
                    relay,
                    target,
                    limit,
                    stream,
                });
            }
            HopMessage::Status { code, .. } => code,
            _ => return Err(ProtocolError::Unexpected.into()),
        };
        let err = match code {
            StatusCode::NoReservation => CircuitError::NoReservation,
            StatusCode::ConnectionFailed => CircuitError::TargetUnreachable,
            StatusCode::ResourceLimitExceeded => CircuitError::LimitExceeded,
            StatusCode::PermissionDenied => CircuitError::PermissionDenied,
            other => return Err(RelayClientError::Status(other)),
        };
        Err(err.into())
    }

    /// Accept circuits from relays this client holds a reservation with.
    pub fn listen(&self) -> Result<IncomingCircuits, RelayClientError> {
        let (tx, rx) = mpsc::channel(INCOMING_BACKLOG);
        let relays = self.relays.clone();
        let timeout = self.timeout;
        self.host.set_stream_handler(
            STOP_PROTOCOL,
            move |stream: Stream, conn: ConnectionInfo| {
                let tx = tx.clone();
                let relays = relays.clone();
                async move {
                    if let Err(e) = handle_stop(stream, conn, tx, relays, timeout).await {
                        tracing::debug!(error = %e, "stop stream failed");
                    }
                }
            },
        )?;
        Ok(IncomingCircuits { rx })
    }
}

async fn handle_stop(
    stream: Stream,
    conn: ConnectionInfo,
    tx: mpsc::Sender<IncomingCircuit>,
    relays: Arc<Mutex<HashSet<PeerId>>>,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let request = tokio::time::timeout(timeout, read_message::<StopMessage>(&stream))
        .await
        .unwrap_or(Err(ProtocolError::Timeout))?;
    let StopMessage::Connect { initiator, limit } = request else {
        return answer(&stream, StatusCode::UnexpectedMessage).await;
    };
    let relay = conn.remote_peer;
    let known = relays
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(&relay);
    if !known {
        tracing::debug!(%relay, "circuit from relay without a reservation");
        return answer(&stream, StatusCode::PermissionDenied).await;
    }
    let permit = match tx.try_reserve() {
        Ok(permit) => permit,
        Err(_) => return answer(&stream, StatusCode::ConnectionFailed).await,
    };
    write_message(&stream, &StopMessage::Status { code: StatusCode::Ok }).await?;
    tracing::debug!(%relay, %initiator, "accepted relayed circuit");
    permit.send(IncomingCircuit {
        relay,
        initiator,
        limit,
        stream,
    });
    Ok(())
}

async fn answer(stream: &Stream, code: StatusCode) -> Result<(), ProtocolError> {
    write_message(stream, &StopMessage::Status { code }).await?;
    let _ = stream.close_write();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn circuit_addrs_compose() {
        let relay = Keypair::random().unwrap();
        let me = Keypair::random().unwrap().peer_id();
        let reservation = RelayReservation {
            relay: relay.peer_id(),
            expires_at: 0,
            addrs: vec!["/ip4/10.0.0.1/tcp/4003/ws".parse().unwrap()],
            limit: None,
            voucher: Voucher::sign(&relay, me, 0),
        };
        let addrs = reservation.circuit_addrs(me);
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_relayed());
        assert_eq!(addrs[0].peer_id(), Some(me));
        assert_eq!(
            addrs[0].to_string(),
            format!(
                "/ip4/10.0.0.1/tcp/4003/ws/p2p/{}/p2p-circuit/p2p/{me}",
                relay.peer_id()
            )
        );
    }
}
