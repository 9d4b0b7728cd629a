//! Reservation table: which peers currently hold a slot at this relay.
//!
//! Entries are spread over independently locked shards keyed by peer ID, so reserve
//! calls for different peers rarely contend. The number of live slots is an atomic
//! counter claimed by compare-and-swap while the owning shard is locked, which keeps
//! the capacity check and the insertion a single step.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::{try_claim, ReserveError};
use crate::identity::PeerId;

const SHARDS: usize = 16;

/// A slot held by `peer`. Valid while `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub peer: PeerId,
    pub expires_at: Instant,
    /// Same expiry as UNIX seconds, for vouchers.
    pub expires_unix: u64,
}

impl Reservation {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Whether a reservation was newly created or an existing one was extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granted {
    New,
    Renewed,
}

pub struct ReservationTable {
    shards: Vec<Mutex<HashMap<PeerId, Reservation>>>,
    hasher: RandomState,
    active: AtomicUsize,
    capacity: usize,
    ttl: Duration,
}

impl ReservationTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            active: AtomicUsize::new(0),
            capacity,
            ttl,
        }
    }

    fn shard(&self, peer: &PeerId) -> MutexGuard<'_, HashMap<PeerId, Reservation>> {
        let index = (self.hasher.hash_one(peer) as usize) % SHARDS;
        lock(&self.shards[index])
    }

    fn make(&self, peer: PeerId, now: Instant) -> Reservation {
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Reservation {
            peer,
            expires_at: now + self.ttl,
            expires_unix: (unix_now + self.ttl).as_secs(),
        }
    }

    /// Grant or refresh `peer`'s reservation. Refreshing never takes a new slot. When the
    /// table is full, expired entries are swept once before giving up.
    pub fn reserve(
        &self,
        peer: PeerId,
        now: Instant,
    ) -> Result<(Reservation, Granted), ReserveError> {
        let mut swept = false;
        loop {
            {
                let mut shard = self.shard(&peer);
                if let Some(existing) = shard.get_mut(&peer) {
                    let granted = if existing.is_expired(now) {
                        Granted::New
                    } else {
                        Granted::Renewed
                    };
                    *existing = self.make(peer, now);
                    return Ok((existing.clone(), granted));
                }
                if try_claim(&self.active, self.capacity) {
                    let reservation = self.make(peer, now);
                    shard.insert(peer, reservation.clone());
                    return Ok((reservation, Granted::New));
                }
            }
            if swept || self.sweep(now) == 0 {
                return Err(ReserveError::Full);
            }
            swept = true;
        }
    }

    /// `peer`'s reservation if it is still valid. An expired entry is evicted here.
    pub fn lookup(&self, peer: &PeerId, now: Instant) -> Option<Reservation> {
        let mut shard = self.shard(peer);
        match shard.get(peer) {
            Some(r) if !r.is_expired(now) => Some(r.clone()),
            Some(_) => {
                shard.remove(peer);
                self.active.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(%peer, "reservation expired");
                None
            }
            None => None,
        }
    }

    /// Drop `peer`'s reservation, freeing its slot.
    pub fn release(&self, peer: &PeerId) -> bool {
        let removed = self.shard(peer).remove(peer).is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Evict every expired reservation. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = lock(shard);
            let before = shard.len();
            shard.retain(|_, r| !r.is_expired(now));
            removed += before - shard.len();
        }
        if removed > 0 {
            self.active.fetch_sub(removed, Ordering::AcqRel);
            tracing::debug!(removed, "swept expired reservations");
        }
        removed
    }

    /// Slots currently taken, including entries that expired but were not yet evicted.
    pub fn len(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
