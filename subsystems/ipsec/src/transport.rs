//! # Collaborators
//!
//! Seams to the parts of the kernel the registry consumes but does not own:
//! interface address state, the key-daemon channel, time and randomness.

use alloc::sync::Arc;
use core::fmt;
use core::net::IpAddr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::directory::ConsumerId;
use crate::message::KeyMessage;

// =============================================================================
// TRAITS
// =============================================================================

/// "Is this address one of mine?"
pub trait LocalAddressTable: Send + Sync {
    /// Whether `addr` is configured on a local interface
    fn is_local(&self, addr: &IpAddr) -> bool;
}

/// Best-effort, non-blocking channel to key daemons
pub trait KeyTransport: Send + Sync {
    /// Push an ACQUIRE notification; returns whether it was queued
    fn deliver_acquire(&self, consumer: ConsumerId, message: &KeyMessage) -> bool;

    /// Push one DUMP record (or the terminator); returns whether it was queued
    fn deliver_dump(&self, consumer: ConsumerId, message: &KeyMessage) -> bool;
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Seconds since an arbitrary fixed origin
    fn now_secs(&self) -> u64;
}

/// Random numbers for SPI selection
pub trait SpiSource: Send + Sync {
    /// Next uniformly distributed value
    fn next_u32(&self) -> u32;
}

/// The full collaborator set handed to a registry
#[derive(Clone)]
pub struct Collaborators {
    /// Local-address test
    pub local: Arc<dyn LocalAddressTable>,
    /// Notification channel
    pub transport: Arc<dyn KeyTransport>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// SPI randomness
    pub spi: Arc<dyn SpiSource>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

// =============================================================================
// MIXING SPI SOURCE
// =============================================================================

/// Weyl increment added per draw
const WEYL_STEP: u64 = 0x9E37_79B9_7F4A_7C15;

/// Substitute for an all-zero seed
const FALLBACK_SEED: u64 = 0x853c_49e6_748f_ea9b;

/// Lock-free xorshift-multiply generator seeded by the embedder
///
/// Not a CSPRNG. SPIs need to be unpredictable enough to avoid collisions,
/// not secret; kernels with a hardware RNG should implement [`SpiSource`]
/// on top of it instead.
#[derive(Debug)]
pub struct MixingSpiSource {
    state: AtomicU64,
}

impl MixingSpiSource {
    /// Create a generator from a boot-time seed
    pub fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(if seed == 0 { FALLBACK_SEED } else { seed }),
        }
    }

    /// Fold extra entropy into the state
    pub fn mix(&self, entropy: u64) {
        let _ = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |state| {
                let mut s = state ^ entropy;
                s = s.wrapping_mul(0x2545_F491_4F6C_DD1D);
                Some(s ^ (s >> 27))
            });
    }

    fn finalize(mut x: u64) -> u64 {
        x ^= x >> 33;
        x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
        x ^= x >> 33;
        x = x.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
        x ^ (x >> 33)
    }
}

impl SpiSource for MixingSpiSource {
    fn next_u32(&self) -> u32 {
        let state = self
            .state
            .fetch_add(WEYL_STEP, Ordering::Relaxed)
            .wrapping_add(WEYL_STEP);
        (Self::finalize(state) >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixing_source_varies() {
        let source = MixingSpiSource::new(12345);
        let a = source.next_u32();
        let b = source.next_u32();
        let c = source.next_u32();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_mixing_source_deterministic_per_seed() {
        let a = MixingSpiSource::new(42);
        let b = MixingSpiSource::new(42);
        assert_eq!(a.next_u32(), b.next_u32());

        b.mix(0xDEAD_BEEF);
        assert_ne!(a.next_u32(), b.next_u32());
    }

    #[test]
    fn test_zero_seed_is_replaced() {
        let zero = MixingSpiSource::new(0);
        let fallback = MixingSpiSource::new(FALLBACK_SEED);
        assert_eq!(zero.next_u32(), fallback.next_u32());
    }
}
