//! # Acquire Coordinator
//!
//! Debounces "no association available" events per (type, destination) so
//! key daemons are not flooded with identical ACQUIRE messages.
//!
//! ```text
//!   miss ──▶ entry live? ──no──▶ send, count = 0, expires_at = now + lifetime
//!                │
//!               yes ──▶ count < max? ──yes──▶ count += 1, suppress
//!                                 │
//!                                no ──▶ send, count = 0, fresh expiry
//! ```
//!
//! The coordinator only decides; delivery happens outside every registry
//! lock. A decision to send hands out an [`AcquireTicket`] that can undo the
//! entry change when no consumer accepted the message.

use crate::error::SaResult;
use crate::key::{DestKey, KeyedIndex};

/// Debounce state for one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Misses suppressed since the last notification
    pub count: u32,
    /// Entry expiry (seconds)
    pub expires_at: u64,
    /// Sequence number of the last notification
    pub seq: u32,
}

/// Reservation for one outgoing ACQUIRE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireTicket {
    /// Destination being acquired
    pub dest: DestKey,
    /// Sequence number to place in the message
    pub seq: u32,
    /// Entry state before this reservation
    previous: Option<AcquireRequest>,
}

/// Outcome of a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireDecision {
    /// Recently notified; stay quiet
    Suppressed,
    /// Notify consumers with this ticket
    Send(AcquireTicket),
}

/// Per-destination acquire bookkeeping
#[derive(Debug)]
pub struct AcquireCoordinator {
    requests: KeyedIndex<DestKey, AcquireRequest>,
    next_seq: u32,
}

impl AcquireCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            requests: KeyedIndex::new(),
            next_seq: 1,
        }
    }

    /// Wrapping sequence counter that skips 0 (reserved for DUMP terminators)
    fn bump(next_seq: &mut u32) -> u32 {
        let seq = *next_seq;
        *next_seq = match next_seq.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        seq
    }

    /// Record a miss for `dest` and decide whether to notify
    pub fn begin(
        &mut self,
        dest: DestKey,
        now: u64,
        max_count: u32,
        lifetime_secs: u64,
    ) -> SaResult<AcquireDecision> {
        let expires_at = now.saturating_add(lifetime_secs);
        let Self { requests, next_seq } = self;

        if let Some(req) = requests.find_mut(&dest, |_| true) {
            if req.expires_at > now && req.count < max_count {
                req.count += 1;
                return Ok(AcquireDecision::Suppressed);
            }

            let previous = *req;
            let seq = Self::bump(next_seq);
            *req = AcquireRequest {
                count: 0,
                expires_at,
                seq,
            };
            return Ok(AcquireDecision::Send(AcquireTicket {
                dest,
                seq,
                previous: Some(previous),
            }));
        }

        let seq = Self::bump(next_seq);
        requests.insert(
            dest,
            AcquireRequest {
                count: 0,
                expires_at,
                seq,
            },
        )?;
        Ok(AcquireDecision::Send(AcquireTicket {
            dest,
            seq,
            previous: None,
        }))
    }

    /// Undo a reservation whose notification reached nobody
    pub fn rollback(&mut self, ticket: &AcquireTicket) {
        // An entry re-armed by someone else meanwhile is left alone
        let remove = match self.requests.find_mut(&ticket.dest, |_| true) {
            Some(req) if req.seq == ticket.seq => match ticket.previous {
                Some(previous) => {
                    *req = previous;
                    false
                },
                None => true,
            },
            _ => false,
        };

        if remove {
            self.requests.remove(&ticket.dest, |_| true);
        }
    }

    /// Drop the entry for `dest` (an association for it was installed)
    pub fn clear(&mut self, dest: &DestKey) -> bool {
        self.requests.remove(dest, |_| true).is_some()
    }

    /// Drop every entry that expired at or before `now`
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, req| req.expires_at > now);
        before - self.requests.len()
    }

    /// Current entry for `dest`
    pub fn get(&self, dest: &DestKey) -> Option<&AcquireRequest> {
        self.requests.find(dest, |_| true)
    }

    /// Number of tracked destinations
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Is nothing tracked?
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl Default for AcquireCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
