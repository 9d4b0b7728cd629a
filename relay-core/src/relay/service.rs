//! Relay side of the hop protocol.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::circuit::{forward, CircuitPermit, CircuitTable, ForwardLimits};
use super::reservation::{Granted, ReservationTable};
use super::{
    circuit_status, read_message, write_message, CircuitError, CircuitState, CloseReason,
    FailReason, ProtocolError, RelayConfig, RelayConfigError, RelayStats, ReserveError,
    StatsCounters,
};
use crate::host::{ConnectionInfo, Host, HostError, StreamHandler, WeakHost};
use crate::identity::PeerId;
use crate::mux::Stream;
use crate::protocol::{
    HopMessage, ReservationInfo, StatusCode, StopMessage, Voucher, HOP_PROTOCOL, STOP_PROTOCOL,
};

struct ServiceInner {
    host: WeakHost,
    config: RelayConfig,
    reservations: ReservationTable,
    circuits: Arc<CircuitTable>,
    stats: StatsCounters,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayServiceError {
    #[error(transparent)]
    Config(#[from] RelayConfigError),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// A running relay. Registered on a host as the handler for [`HOP_PROTOCOL`].
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<ServiceInner>,
}

impl RelayService {
    /// Register the hop handler on `host` and start the reservation sweeper. A holder's
    /// reservation is released as soon as its last connection to the relay closes.
    pub fn spawn(host: &Host, config: RelayConfig) -> Result<RelayService, RelayServiceError> {
        config.validate()?;
        let inner = Arc::new(ServiceInner::new(host.downgrade(), config));
        host.set_stream_handler(HOP_PROTOCOL, HopHandler(inner.clone()))?;
        let weak = Arc::downgrade(&inner);
        host.on_disconnect(move |conn: &ConnectionInfo| {
            if let Some(inner) = weak.upgrade() {
                inner.release(conn.remote_peer);
            }
        });
        host.spawn_task(sweep_loop(inner.clone()));
        tracing::info!(
            max_reservations = inner.config.max_reservations,
            reservation_ttl = ?inner.config.reservation_ttl,
            max_circuits = inner.config.max_circuits,
            "relay service enabled"
        );
        Ok(RelayService { inner })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn reservations(&self) -> &ReservationTable {
        &self.inner.reservations
    }

    pub fn circuits(&self) -> &CircuitTable {
        &self.inner.circuits
    }

    pub fn stats(&self) -> RelayStats {
        self.inner
            .stats
            .snapshot(self.inner.reservations.len(), self.inner.circuits.len())
    }

    /// Unregister the hop handler and stop the sweeper. Circuits already relaying finish
    /// on their own limits.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(host) = self.inner.host.upgrade() {
            host.remove_stream_handler(HOP_PROTOCOL);
        }
    }
}

/// Runs on the host's task tracker, so it ends when the host closes.
async fn sweep_loop(inner: Arc<ServiceInner>) {
    let period = inner.config.sweep_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        inner.reservations.sweep(Instant::now());
    }
    tracing::debug!("reservation sweeper stopped");
}

struct HopHandler(Arc<ServiceInner>);

#[async_trait]
impl StreamHandler for HopHandler {
    async fn handle(&self, stream: Stream, conn: ConnectionInfo) {
        let inner = &self.0;
        let request = tokio::time::timeout(
            inner.config.negotiation_timeout,
            read_message::<HopMessage>(&stream),
        )
        .await
        .unwrap_or(Err(ProtocolError::Timeout));
        let result = match request {
            Ok(HopMessage::Reserve) => inner.handle_reserve(&stream, &conn).await,
            Ok(HopMessage::Connect { target }) => inner.handle_connect(stream, &conn, target).await,
            Ok(HopMessage::Status { .. }) => {
                reply(&stream, StatusCode::UnexpectedMessage).await
            }
            Err(ProtocolError::Decode(e)) => {
                tracing::debug!(peer = %conn.remote_peer, error = %e, "malformed hop message");
                reply(&stream, StatusCode::MalformedMessage).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!(peer = %conn.remote_peer, error = %e, "hop stream failed");
        }
    }
}

async fn reply(stream: &Stream, code: StatusCode) -> Result<(), ProtocolError> {
    write_message(
        stream,
        &HopMessage::Status {
            code,
            reservation: None,
            limit: None,
        },
    )
    .await?;
    let _ = stream.close_write();
    Ok(())
}

impl ServiceInner {
    fn new(host: WeakHost, config: RelayConfig) -> Self {
        ServiceInner {
            host,
            reservations: ReservationTable::new(config.max_reservations, config.reservation_ttl),
            circuits: CircuitTable::new(config.max_circuits, config.max_circuits_per_peer),
            stats: StatsCounters::default(),
            cancel: CancellationToken::new(),
            config,
        }
    }

    fn release(&self, peer: PeerId) {
        if self.reservations.release(&peer) {
            tracing::info!(%peer, "reservation released, holder disconnected");
        }
    }

    fn host(&self) -> Option<Host> {
        self.host.upgrade().filter(|h| !h.is_closed())
    }

    fn reserve(&self, peer: PeerId, conn: &ConnectionInfo) -> Result<ReservationInfo, ReserveError> {
        // Relays do not stack: a peer that is itself reached over a circuit cannot hold a
        // slot here.
        if conn.is_relayed() || self.config.deny.contains(&peer) {
            return Err(ReserveError::Rejected);
        }
        let host = self.host().ok_or(ReserveError::Rejected)?;
        let (reservation, granted) = self.reservations.reserve(peer, Instant::now())?;
        let voucher = Voucher::sign(host.keypair(), peer, reservation.expires_unix);
        match granted {
            Granted::New => tracing::info!(%peer, "reservation accepted"),
            Granted::Renewed => tracing::debug!(%peer, "reservation renewed"),
        }
        Ok(ReservationInfo {
            expires_at: reservation.expires_unix,
            addrs: host.p2p_addrs(),
            voucher,
        })
    }

    async fn handle_reserve(
        &self,
        stream: &Stream,
        conn: &ConnectionInfo,
    ) -> Result<(), ProtocolError> {
        let peer = conn.remote_peer;
        let response = match self.reserve(peer, conn) {
            Ok(info) => {
                StatsCounters::bump(&self.stats.reservations_accepted, 1);
                HopMessage::Status {
                    code: StatusCode::Ok,
                    reservation: Some(info),
                    limit: Some(self.config.circuit_limit()),
                }
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.reservations_rejected, 1);
                tracing::info!(%peer, reason = %e, "reservation rejected");
                let code = match e {
                    ReserveError::Full => StatusCode::ResourceLimitExceeded,
                    ReserveError::Rejected => StatusCode::ReservationRefused,
                };
                HopMessage::Status {
                    code,
                    reservation: None,
                    limit: None,
                }
            }
        };
        write_message(stream, &response).await?;
        let _ = stream.close_write();
        Ok(())
    }

    async fn handle_connect(
        &self,
        stream: Stream,
        conn: &ConnectionInfo,
        target: PeerId,
    ) -> Result<(), ProtocolError> {
        let initiator = conn.remote_peer;
        let (permit, target_stream) = match self.open_circuit(conn, target).await {
            Ok(opened) => opened,
            Err(e) => {
                StatsCounters::bump(&self.stats.circuits_rejected, 1);
                tracing::info!(%initiator, %target, reason = %e, "circuit refused");
                return reply(&stream, circuit_status(e)).await;
            }
        };

        let limit = self.config.circuit_limit();
        write_message(
            &stream,
            &HopMessage::Status {
                code: StatusCode::Ok,
                reservation: None,
                limit: Some(limit),
            },
        )
        .await?;
        advance(&permit, CircuitState::Relaying);
        StatsCounters::bump(&self.stats.circuits_opened, 1);
        tracing::info!(%initiator, %target, circuit = %permit.id(), "circuit opened");

        let outcome = forward(
            stream,
            target_stream,
            ForwardLimits {
                bytes: self.config.circuit_bytes,
                duration: self.config.circuit_duration,
                idle: self.config.circuit_idle_timeout,
            },
        )
        .await;
        advance(&permit, CircuitState::Closed(outcome.reason));
        StatsCounters::bump(&self.stats.bytes_relayed, outcome.bytes);
        match outcome.reason {
            CloseReason::Normal => tracing::info!(
                circuit = %permit.id(), bytes = outcome.bytes, "circuit closed"
            ),
            reason => tracing::info!(
                circuit = %permit.id(), bytes = outcome.bytes, ?reason, "circuit terminated"
            ),
        }
        Ok(())
    }

    /// Check the target's reservation, admit the circuit, and get the target to accept a
    /// stop stream.
    async fn open_circuit(
        &self,
        conn: &ConnectionInfo,
        target: PeerId,
    ) -> Result<(CircuitPermit, Stream), CircuitError> {
        // no circuits over circuits
        if conn.is_relayed() {
            return Err(CircuitError::PermissionDenied);
        }
        let permit = self.circuits.admit(conn.remote_peer, target)?;
        if self.reservations.lookup(&target, Instant::now()).is_none() {
            advance(&permit, CircuitState::Failed(FailReason::NoReservation));
            return Err(CircuitError::NoReservation);
        }
        advance(&permit, CircuitState::Reserved);
        advance(&permit, CircuitState::Connecting);

        let stop = tokio::time::timeout(
            self.config.negotiation_timeout,
            self.stop_handshake(conn.remote_peer, target),
        )
        .await;
        match stop {
            Ok(Ok(stream)) => Ok((permit, stream)),
            Ok(Err(e)) => {
                tracing::debug!(%target, error = %e, "stop negotiation failed");
                advance(&permit, CircuitState::Failed(FailReason::TargetUnreachable));
                Err(CircuitError::TargetUnreachable)
            }
            Err(_) => {
                advance(&permit, CircuitState::Failed(FailReason::Timeout));
                Err(CircuitError::TargetUnreachable)
            }
        }
    }

    async fn stop_handshake(&self, initiator: PeerId, target: PeerId) -> Result<Stream, StopError> {
        let host = self.host().ok_or(StopError::HostClosed)?;
        let stream = host.new_stream(target, STOP_PROTOCOL).await?;
        write_message(
            &stream,
            &StopMessage::Connect {
                initiator,
                limit: Some(self.config.circuit_limit()),
            },
        )
        .await?;
        match read_message::<StopMessage>(&stream).await? {
            StopMessage::Status {
                code: StatusCode::Ok,
            } => Ok(stream),
            StopMessage::Status { code } => Err(StopError::Refused(code)),
            StopMessage::Connect { .. } => Err(ProtocolError::Unexpected.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum StopError {
    #[error("host closed")]
    HostClosed,
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("target answered {0:?}")]
    Refused(StatusCode),
}

fn advance(permit: &CircuitPermit, to: CircuitState) {
    if let Err(e) = permit.advance(to) {
        tracing::warn!(circuit = %permit.id(), error = %e, "circuit state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::multiaddr::Multiaddr;
    use crate::mux::{Direction, MuxConfig};
    use crate::transport::{scheme, MemoryHub, MemoryTransport, TransportRegistry};
    use std::time::{Duration, SystemTime};

    async fn memory_host() -> Host {
        let mut transports = TransportRegistry::new();
        transports.register(scheme::memory, MemoryTransport::new(MemoryHub::new()));
        Host::new(
            Keypair::random().unwrap(),
            transports,
            MuxConfig::default(),
            vec![Multiaddr::memory(0)],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn zero_sweep_interval_is_rejected() {
        let host = memory_host().await;
        let config = RelayConfig {
            sweep_interval: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert!(matches!(
            RelayService::spawn(&host, config),
            Err(RelayServiceError::Config(RelayConfigError::ZeroDuration("sweep_interval")))
        ));
        // nothing was registered
        RelayService::spawn(&host, RelayConfig::default()).unwrap();
    }

    #[tokio::test]
    async fn relayed_connections_cannot_reserve_or_open_circuits() {
        let host = memory_host().await;
        let inner = ServiceInner::new(host.downgrade(), RelayConfig::default());
        let relay = host.peer_id();
        let initiator = Keypair::random().unwrap().peer_id();
        let target = Keypair::random().unwrap().peer_id();
        let conn = ConnectionInfo {
            id: 1,
            remote_peer: initiator,
            remote_addr: format!("/memory/7/p2p/{relay}/p2p-circuit/p2p/{initiator}")
                .parse()
                .unwrap(),
            direction: Direction::Inbound,
            opened_at: SystemTime::now(),
        };
        assert!(conn.is_relayed());

        assert_eq!(
            inner.reserve(initiator, &conn).unwrap_err(),
            ReserveError::Rejected
        );
        inner.reservations.reserve(target, Instant::now()).unwrap();
        assert!(matches!(
            inner.open_circuit(&conn, target).await,
            Err(CircuitError::PermissionDenied)
        ));
        assert!(inner.circuits.is_empty());
    }

    #[tokio::test]
    async fn missing_reservation_fails_the_admitted_circuit() {
        let host = memory_host().await;
        let inner = ServiceInner::new(host.downgrade(), RelayConfig::default());
        let conn = ConnectionInfo {
            id: 1,
            remote_peer: Keypair::random().unwrap().peer_id(),
            remote_addr: Multiaddr::memory(9),
            direction: Direction::Inbound,
            opened_at: SystemTime::now(),
        };
        let target = Keypair::random().unwrap().peer_id();
        assert!(matches!(
            inner.open_circuit(&conn, target).await,
            Err(CircuitError::NoReservation)
        ));
        // the permit was released with the failure
        assert!(inner.circuits.is_empty());
    }

    #[test]
    fn default_limits_are_announced() {
        let config = RelayConfig {
            circuit_bytes: 1024,
            circuit_duration: Duration::from_secs(90),
            ..RelayConfig::default()
        };
        let limit = config.circuit_limit();
        assert_eq!(limit.data_bytes, 1024);
        assert_eq!(limit.duration_secs, 90);
    }
}
