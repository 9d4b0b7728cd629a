//! Circuits: lifecycle state, admission, and byte forwarding.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::CircuitError;
use crate::identity::PeerId;
use crate::mux::Stream;

/// How an established circuit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Both sides finished writing.
    Normal,
    QuotaExceeded,
    Expired,
    IdleTimeout,
    /// One side reset its stream.
    Reset,
    Error,
}

/// Why a circuit attempt never reached `Relaying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    Timeout,
    Refused,
    ResourceLimit,
    NoReservation,
    TargetUnreachable,
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Reserving,
    Reserved,
    Connecting,
    Relaying,
    Closed(CloseReason),
    Failed(FailReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid circuit transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl CircuitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CircuitState::Closed(_) | CircuitState::Failed(_))
    }

    /// Move to `to` if the lifecycle allows it.
    pub fn transition(self, to: CircuitState) -> Result<CircuitState, InvalidTransition> {
        use CircuitState::*;
        let allowed = matches!(
            (self, to),
            (Reserving, Reserved)
                | (Reserving, Failed(_))
                | (Reserved, Connecting)
                | (Connecting, Relaying)
                | (Connecting, Failed(_))
                | (Relaying, Closed(_))
        );
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Reserving => f.write_str("reserving"),
            CircuitState::Reserved => f.write_str("reserved"),
            CircuitState::Connecting => f.write_str("connecting"),
            CircuitState::Relaying => f.write_str("relaying"),
            CircuitState::Closed(r) => write!(f, "closed ({r:?})"),
            CircuitState::Failed(r) => write!(f, "failed ({r:?})"),
        }
    }
}

pub type CircuitId = Uuid;

/// One row of the circuit table.
#[derive(Debug, Clone)]
pub struct CircuitInfo {
    pub id: CircuitId,
    pub initiator: PeerId,
    pub target: PeerId,
    pub state: CircuitState,
    pub opened_at: Instant,
}

#[derive(Default)]
struct Circuits {
    entries: HashMap<CircuitId, CircuitInfo>,
    per_peer: HashMap<PeerId, usize>,
}

/// Admission control for circuits: a global limit and a per-initiator limit.
pub struct CircuitTable {
    inner: Mutex<Circuits>,
    max_total: usize,
    max_per_peer: usize,
}

impl CircuitTable {
    pub fn new(max_total: usize, max_per_peer: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Circuits::default()),
            max_total,
            max_per_peer,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Circuits> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a circuit from `initiator` to `target`. It starts in `Reserving` until the
    /// caller has confirmed the target's reservation.
    pub fn admit(
        self: &Arc<Self>,
        initiator: PeerId,
        target: PeerId,
    ) -> Result<CircuitPermit, CircuitError> {
        let mut inner = self.lock();
        let per_peer = inner.per_peer.get(&initiator).copied().unwrap_or(0);
        if inner.entries.len() >= self.max_total || per_peer >= self.max_per_peer {
            return Err(CircuitError::LimitExceeded);
        }
        let id = Uuid::new_v4();
        inner.entries.insert(
            id,
            CircuitInfo {
                id,
                initiator,
                target,
                state: CircuitState::Reserving,
                opened_at: Instant::now(),
            },
        );
        *inner.per_peer.entry(initiator).or_insert(0) += 1;
        Ok(CircuitPermit {
            table: self.clone(),
            id,
            initiator,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<CircuitInfo> {
        self.lock().entries.values().cloned().collect()
    }
}

/// A circuit's admission. Dropping it frees the slot.
pub struct CircuitPermit {
    table: Arc<CircuitTable>,
    id: CircuitId,
    initiator: PeerId,
}

impl CircuitPermit {
    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> Option<CircuitState> {
        self.table.lock().entries.get(&self.id).map(|c| c.state)
    }

    pub fn advance(&self, to: CircuitState) -> Result<CircuitState, InvalidTransition> {
        let mut inner = self.table.lock();
        let Some(entry) = inner.entries.get_mut(&self.id) else {
            return Err(InvalidTransition {
                from: to,
                to,
            });
        };
        entry.state = entry.state.transition(to)?;
        Ok(entry.state)
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        let mut inner = self.table.lock();
        inner.entries.remove(&self.id);
        if let Some(n) = inner.per_peer.get_mut(&self.initiator) {
            *n -= 1;
            if *n == 0 {
                inner.per_peer.remove(&self.initiator);
            }
        }
    }
}

/// Limits enforced while forwarding.
#[derive(Debug, Clone, Copy)]
pub struct ForwardLimits {
    /// Total bytes across both directions.
    pub bytes: u64,
    pub duration: Duration,
    pub idle: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub reason: CloseReason,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    /// Source finished; FIN was passed on.
    Eof,
    Quota,
    Idle,
    Reset,
    Error,
    /// The other direction ended the circuit.
    Stopped,
}

struct Budget {
    remaining: AtomicU64,
    relayed: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Budget {
    /// Take up to `want` bytes from the quota.
    fn claim(&self, want: usize) -> usize {
        let want = want as u64;
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(r.saturating_sub(want))
            })
            .unwrap_or(0);
        prev.min(want) as usize
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

const PUMP_BUF: usize = 16 * 1024;

async fn pump(
    src: &Stream,
    dst: &Stream,
    budget: &Budget,
    idle: Duration,
    stop: &CancellationToken,
) -> PumpEnd {
    let mut buf = vec![0u8; PUMP_BUF];
    let end = loop {
        let read = tokio::select! {
            _ = stop.cancelled() => break PumpEnd::Stopped,
            read = tokio::time::timeout(idle, src.read(&mut buf)) => read,
        };
        let n = match read {
            Err(_) if budget.idle_for() >= idle => break PumpEnd::Idle,
            // the other direction is active
            Err(_) => continue,
            Ok(Ok(0)) => {
                let _ = dst.close_write();
                break PumpEnd::Eof;
            }
            Ok(Ok(n)) => n,
            Ok(Err(crate::mux::MuxError::Reset(_))) => break PumpEnd::Reset,
            Ok(Err(_)) => break PumpEnd::Error,
        };
        let allowed = budget.claim(n);
        if allowed > 0 {
            let written = tokio::select! {
                _ = stop.cancelled() => break PumpEnd::Stopped,
                written = dst.write_all(&buf[..allowed]) => written,
            };
            if written.is_err() {
                break PumpEnd::Error;
            }
            budget.relayed.fetch_add(allowed as u64, Ordering::Relaxed);
            budget.touch();
        }
        if allowed < n {
            break PumpEnd::Quota;
        }
    };
    if !matches!(end, PumpEnd::Eof | PumpEnd::Stopped) {
        stop.cancel();
    }
    end
}

/// Forward bytes between `a` and `b` until both finish or a limit trips. On quota,
/// expiry or idleness both streams are closed gracefully so each endpoint reads
/// end-of-stream; on a reset or I/O error both are reset. Only these two streams are
/// touched.
pub async fn forward(a: Stream, b: Stream, limits: ForwardLimits) -> ForwardOutcome {
    let budget = Budget {
        remaining: AtomicU64::new(limits.bytes),
        relayed: AtomicU64::new(0),
        last_activity: Mutex::new(Instant::now()),
    };
    let stop = CancellationToken::new();
    let deadline = Instant::now() + limits.duration;
    let both = futures::future::join(
        pump(&a, &b, &budget, limits.idle, &stop),
        pump(&b, &a, &budget, limits.idle, &stop),
    );
    let reason = match tokio::time::timeout_at(deadline, both).await {
        Err(_) => CloseReason::Expired,
        Ok((x, y)) => {
            let ends = [x, y];
            if ends.contains(&PumpEnd::Error) {
                CloseReason::Error
            } else if ends.contains(&PumpEnd::Reset) {
                CloseReason::Reset
            } else if ends.contains(&PumpEnd::Quota) {
                CloseReason::QuotaExceeded
            } else if ends.contains(&PumpEnd::Idle) {
                CloseReason::IdleTimeout
            } else {
                CloseReason::Normal
            }
        }
    };
    match reason {
        CloseReason::Normal => {}
        CloseReason::Reset | CloseReason::Error => {
            a.reset();
            b.reset();
        }
        CloseReason::QuotaExceeded | CloseReason::Expired | CloseReason::IdleTimeout => {
            let _ = a.close();
            let _ = b.close();
        }
    }
    ForwardOutcome {
        reason,
        bytes: budget.relayed.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::mux::{Direction, MuxConfig, Muxer};
    use crate::secure::{handshake_inbound, handshake_outbound};
    use tokio::sync::mpsc;

    fn peer() -> PeerId {
        Keypair::random().unwrap().peer_id()
    }

    #[test]
    fn lifecycle_transitions() {
        let s = CircuitState::Reserving;
        let s = s.transition(CircuitState::Reserved).unwrap();
        let s = s.transition(CircuitState::Connecting).unwrap();
        let s = s.transition(CircuitState::Relaying).unwrap();
        let s = s
            .transition(CircuitState::Closed(CloseReason::QuotaExceeded))
            .unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn only_negotiating_states_fail() {
        let fail = CircuitState::Failed(FailReason::Timeout);
        assert!(CircuitState::Reserving.transition(fail).is_ok());
        assert!(CircuitState::Connecting.transition(fail).is_ok());
        assert!(CircuitState::Relaying.transition(fail).is_err());
        assert!(CircuitState::Reserved
            .transition(CircuitState::Relaying)
            .is_err());
        assert!(CircuitState::Closed(CloseReason::Normal)
            .transition(CircuitState::Relaying)
            .is_err());
    }

    #[test]
    fn admission_limits() {
        let table = CircuitTable::new(3, 2);
        let (a, b, t) = (peer(), peer(), peer());
        let p1 = table.admit(a, t).unwrap();
        let _p2 = table.admit(a, t).unwrap();
        assert_eq!(table.admit(a, t).err(), Some(CircuitError::LimitExceeded));
        let _p3 = table.admit(b, t).unwrap();
        assert_eq!(table.admit(b, t).err(), Some(CircuitError::LimitExceeded));
        assert_eq!(table.len(), 3);
        drop(p1);
        assert!(table.admit(a, t).is_ok());
    }

    #[test]
    fn permit_tracks_state() {
        let table = CircuitTable::new(1, 1);
        let permit = table.admit(peer(), peer()).unwrap();
        assert_eq!(permit.state(), Some(CircuitState::Reserving));
        assert!(permit.advance(CircuitState::Connecting).is_err());
        permit.advance(CircuitState::Reserved).unwrap();
        permit.advance(CircuitState::Connecting).unwrap();
        assert!(permit.advance(CircuitState::Reserved).is_err());
        permit.advance(CircuitState::Relaying).unwrap();
        assert_eq!(table.list()[0].state, CircuitState::Relaying);
    }

    /// A relay-side stream and the endpoint stream at the other end of its connection.
    /// The muxers are returned so the connection outlives the test body.
    async fn leg() -> (Stream, Stream, (Muxer, Muxer)) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let ka = Keypair::random().unwrap();
        let kb = Keypair::random().unwrap();
        let (ca, cb) = tokio::join!(
            handshake_outbound(Box::new(a), &ka, None),
            handshake_inbound(Box::new(b), &kb)
        );
        let (ca, cb) = (ca.unwrap(), cb.unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = Muxer::new(
            ca.reader,
            ca.writer,
            Direction::Outbound,
            MuxConfig::default(),
            Arc::new(|s: Stream| drop(s)),
        );
        let relay = Muxer::new(
            cb.reader,
            cb.writer,
            Direction::Inbound,
            MuxConfig::default(),
            Arc::new(move |s: Stream| {
                let _ = tx.send(s);
            }),
        );
        let (opened, accepted) = tokio::join!(endpoint.open_stream("/circuit/1"), async {
            let s = rx.recv().await.unwrap();
            s.accept().unwrap();
            s
        });
        (accepted, opened.unwrap(), (endpoint, relay))
    }

    fn limits(bytes: u64, duration: u64, idle: u64) -> ForwardLimits {
        ForwardLimits {
            bytes,
            duration: Duration::from_secs(duration),
            idle: Duration::from_secs(idle),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forward_expires_at_deadline() {
        let (relay_a, end_a, _ca) = leg().await;
        let (relay_b, end_b, _cb) = leg().await;
        let started = Instant::now();
        let circuit = tokio::spawn(forward(relay_a, relay_b, limits(1 << 20, 5, 60)));

        end_a.write_all(b"early").await.unwrap();
        let outcome = circuit.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Expired);
        assert_eq!(outcome.bytes, 5);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(end_b.read_to_end().await.unwrap(), b"early");
        assert!(end_a.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_closes_idle_circuit() {
        let (relay_a, end_a, _ca) = leg().await;
        let (relay_b, end_b, _cb) = leg().await;
        let circuit = tokio::spawn(forward(relay_a, relay_b, limits(1 << 20, 600, 5)));

        end_b.write_all(b"hi").await.unwrap();
        let outcome = circuit.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::IdleTimeout);
        assert_eq!(outcome.bytes, 2);
        assert_eq!(end_a.read_to_end().await.unwrap(), b"hi");
        assert!(end_b.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_truncates_at_quota() {
        let (relay_a, end_a, _ca) = leg().await;
        let (relay_b, end_b, _cb) = leg().await;
        let circuit = tokio::spawn(forward(relay_a, relay_b, limits(10, 600, 60)));

        let data: Vec<u8> = (0u8..25).collect();
        end_a.write_all(&data).await.unwrap();
        let outcome = circuit.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::QuotaExceeded);
        assert_eq!(outcome.bytes, 10);
        assert_eq!(end_b.read_to_end().await.unwrap(), &data[..10]);
        assert!(end_a.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_finishes_normally_after_both_half_closes() {
        let (relay_a, end_a, _ca) = leg().await;
        let (relay_b, end_b, _cb) = leg().await;
        let circuit = tokio::spawn(forward(relay_a, relay_b, limits(1 << 20, 600, 60)));

        end_a.write_all(b"request").await.unwrap();
        end_a.close_write().unwrap();
        assert_eq!(end_b.read_to_end().await.unwrap(), b"request");
        end_b.write_all(b"reply").await.unwrap();
        end_b.close_write().unwrap();
        assert_eq!(end_a.read_to_end().await.unwrap(), b"reply");

        let outcome = circuit.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Normal);
        assert_eq!(outcome.bytes, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_reset_resets_the_other_side() {
        let (relay_a, end_a, _ca) = leg().await;
        let (relay_b, end_b, _cb) = leg().await;
        let circuit = tokio::spawn(forward(relay_a, relay_b, limits(1 << 20, 600, 60)));

        end_a.reset();
        let outcome = circuit.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::Reset);
        let mut buf = [0u8; 1];
        assert!(end_b.read(&mut buf).await.is_err());
    }

    #[test]
    fn budget_hands_out_prefix() {
        let budget = Budget {
            remaining: AtomicU64::new(10),
            relayed: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        };
        assert_eq!(budget.claim(6), 6);
        assert_eq!(budget.claim(6), 4);
        assert_eq!(budget.claim(6), 0);
    }
}
