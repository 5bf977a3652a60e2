//! # Helix IPsec Key Engine
//!
//! Security-association registry: stores, indexes, hands out and retires
//! the associations that protect network flows, and asks key-negotiation
//! daemons for new ones when none is available.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         SaRegistry                               │
//! │                                                                  │
//! │  ┌────────────────────── tables lock ─────────────────────────┐  │
//! │  │  ┌──────────────┐  ┌─────────────────┐  ┌───────────────┐  │  │
//! │  │  │   SaStore    │◀─│ AllocationIndex │  │   FlowTable   │  │  │
//! │  │  │ (type,src,   │  │ (type,src,dst)  │  │ (flow handle) │  │  │
//! │  │  │  dst,spi)    │◀─┴─────────────────┴──│               │  │  │
//! │  │  └──────────────┘                       └───────────────┘  │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────── acquire lock ────────────────────────┐  │
//! │  │  AcquireCoordinator (type,dst)   RegistrationDirectory     │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └───────────────┬──────────────────────────────┬───────────────────┘
//!                 │                              │
//!        LocalAddressTable · Clock        KeyTransport (no lock held)
//!                 │                              │
//!           interface state               key daemons ◀── ControlHandler
//! ```
//!
//! ## Lifecycle
//!
//! An association is created complete by ADD, or PROVISIONAL by GETSPI and
//! completed by UPDATE. DELETE retires it; a retired association that is
//! still referenced by a flow or a lookup-for-use stays behind as a zombie
//! and is erased by the release that drops its last reference.
//!
//! ## Invariants
//!
//! 1. **Visibility**: only COMPLETE associations are returned by lookups
//!    and allocation; a pending PROVISIONAL reservation still blocks an ADD
//!    of its identity.
//!
//! 2. **Uniqueness**: no two COMPLETE associations share
//!    (type, src, dst, spi).
//!
//! 3. **Reference Counting**: the reference count never goes negative; an
//!    underflow is a kernel bug and panics.
//!
//! 4. **Lock Order**: the acquire lock is never taken while the tables lock
//!    is held, and daemons are notified with no lock held.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Error taxonomy
pub mod error;

/// Registry tunables
pub mod config;

/// Composite keys and the chained Keyed Index
pub mod key;

/// Association record, flags and handles
pub mod sa;

/// Arena that owns association records
pub mod store;

/// Shareable-association index
pub mod allocation;

/// Flow binding index
pub mod flow;

/// State transitions and reference counting
pub mod lifecycle;

/// Transactional view over store and indices
pub mod tables;

/// Acquire debouncing
pub mod acquire;

/// Key daemon registrations
pub mod directory;

/// Collaborator traits
pub mod transport;

/// Control message codec
pub mod message;

/// Counters
pub mod stats;

/// The registry
pub mod registry;

/// Control request dispatcher
pub mod handler;

#[cfg(test)]
mod testing;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use config::RegistryConfig;
pub use directory::ConsumerId;
pub use error::{SaError, SaResult};
pub use flow::{FlowHandle, FlowOwner};
pub use handler::ControlHandler;
pub use key::{DestKey, PairKey, SaKey};
pub use lifecycle::{DeleteOutcome, ReleaseOutcome};
pub use message::{KeyMessage, MessageType};
pub use registry::{AcquireOutcome, Allocation, SaRegistry, SweepReport};
pub use sa::{SaFlags, SaHandle, SaState, SaType, SecurityAssociation};
pub use stats::StatsSnapshot;
pub use transport::{
    Clock, Collaborators, KeyTransport, LocalAddressTable, MixingSpiSource, SpiSource,
};

// =============================================================================
// GLOBAL REGISTRY
// =============================================================================

use spin::Once;

static REGISTRY: Once<SaRegistry> = Once::new();

/// Install the kernel-wide registry
///
/// Fails with `AlreadyExists` if a registry was installed before; the
/// argument is dropped in that case.
pub fn init(registry: SaRegistry) -> SaResult<&'static SaRegistry> {
    let mut installed = false;
    let global = REGISTRY.call_once(|| {
        installed = true;
        registry
    });

    if !installed {
        log::warn!("ipsec: registry already initialized");
        return Err(SaError::AlreadyExists);
    }
    log::info!(
        "ipsec: registry online (spi range {:#x}..={:#x})",
        global.config().spi_min,
        global.config().spi_max
    );
    Ok(global)
}

/// The kernel-wide registry, once [`init`] has run
pub fn registry() -> Option<&'static SaRegistry> {
    REGISTRY.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn test_global_init_once() {
        let fx = Fixture::new();

        let first = init(fx.registry()).unwrap();
        assert!(core::ptr::eq(first, registry().unwrap()));
        assert_eq!(init(fx.registry()).unwrap_err(), SaError::AlreadyExists);
    }
}
