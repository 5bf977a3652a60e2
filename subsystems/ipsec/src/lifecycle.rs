//! # Lifecycle & Reference Counting
//!
//! Per-record state transitions. The tables in [`crate::tables`] call these
//! under the store lock; nothing else mutates flags or counters.
//!
//! ```text
//!   GetSpi ──▶ PROVISIONAL ──Update──▶ COMPLETE ──Delete──▶ RETIRED ──▶ erased
//!                  │                                  │  ref_count > 0
//!                  └──────Delete / expiry──▶ erased   ▼
//!                                                  ZOMBIE ──last release──▶ erased
//! ```

use core::net::IpAddr;

use crate::sa::{SaFlags, SecurityAssociation};
use crate::transport::LocalAddressTable;

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of deleting an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Record had no references and is gone
    Erased,
    /// Record is a zombie until its last reference is released
    Deferred,
    /// Only a retired record matched; nothing to do
    AlreadyRetired,
    /// No record with this identity exists
    Absent,
}

impl DeleteOutcome {
    /// Did this call retire a record?
    pub fn retired_now(&self) -> bool {
        matches!(self, Self::Erased | Self::Deferred)
    }
}

/// Result of dropping one reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Record stays, with this many references left
    Released {
        /// References still held
        remaining: u32,
    },
    /// The last reference to a retired record was dropped
    Erased,
}

/// What retiring a record requires of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    /// No references: erase now
    Erase,
    /// Still referenced: keep as zombie
    Zombie,
}

// =============================================================================
// TRANSITIONS
// =============================================================================

/// Report a broken registry invariant and stop
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(what: &str) -> ! {
    log::error!("ipsec: invariant violated: {}", what);
    panic!("ipsec: invariant violated: {}", what);
}

/// Take one reference
pub fn retain(sa: &mut SecurityAssociation) -> u32 {
    sa.ref_count = match sa.ref_count.checked_add(1) {
        Some(count) => count,
        None => invariant_violation("reference count overflow"),
    };
    sa.ref_count
}

/// Drop one reference; returns the references left
pub fn drop_ref(sa: &mut SecurityAssociation) -> u32 {
    sa.ref_count = match sa.ref_count.checked_sub(1) {
        Some(count) => count,
        None => invariant_violation("reference count underflow"),
    };
    sa.ref_count
}

/// Mark a record RETIRED (and ZOMBIE while referenced)
pub fn retire(sa: &mut SecurityAssociation) -> Retirement {
    sa.flags.insert(SaFlags::RETIRED);
    sa.expires_at = None;
    if sa.ref_count > 0 {
        sa.flags.insert(SaFlags::ZOMBIE);
        Retirement::Zombie
    } else {
        Retirement::Erase
    }
}

/// Retired and no longer referenced?
pub fn is_erasable(sa: &SecurityAssociation) -> bool {
    sa.flags.contains(SaFlags::RETIRED) && sa.ref_count == 0
}

/// Apply an Update: new material, lifetime and direction, PROVISIONAL cleared
///
/// Flow bindings and the reference count survive the update.
pub fn complete(sa: &mut SecurityAssociation, update: SecurityAssociation, direction: SaFlags) {
    sa.version = update.version;
    sa.label = update.label;
    sa.material = update.material;
    sa.lifetime = update.lifetime;
    sa.replay = update.replay;
    sa.expires_at = None;

    let kept = sa.flags - SaFlags::DIRECTION - SaFlags::PROVISIONAL;
    let requested = update.flags & SaFlags::CALLER_SETTABLE;
    sa.flags = kept | requested | direction;
}

/// Has a provisional record outlived its lifetime?
pub fn is_expired(sa: &SecurityAssociation, now: u64) -> bool {
    sa.flags.contains(SaFlags::PROVISIONAL)
        && !sa.flags.contains(SaFlags::RETIRED)
        && sa.expires_at.is_some_and(|deadline| deadline <= now)
}

/// Direction flags for an address pair
///
/// OUTBOUND when the source is local, INBOUND when the destination is.
pub fn classify(local: &dyn LocalAddressTable, src: &IpAddr, dst: &IpAddr) -> SaFlags {
    let mut flags = SaFlags::empty();
    if local.is_local(src) {
        flags |= SaFlags::OUTBOUND_CAPABLE;
    }
    if local.is_local(dst) {
        flags |= SaFlags::INBOUND_CAPABLE;
    }
    flags
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::net::Ipv4Addr;

    use super::*;
    use crate::sa::{SaState, SaType};
    use crate::testing::StaticLocalTable;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(172, 16, 0, last))
    }

    fn record() -> SecurityAssociation {
        SecurityAssociation::new(SaType::Esp, addr(1), addr(2), 0x1000)
    }

    #[test]
    fn test_retain_release_balance() {
        let mut sa = record();
        for _ in 0..5 {
            retain(&mut sa);
        }
        for expected in (0..5).rev() {
            assert_eq!(drop_ref(&mut sa), expected);
        }
        assert_eq!(sa.ref_count, 0);
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_release_underflow_panics() {
        let mut sa = record();
        drop_ref(&mut sa);
    }

    #[test]
    fn test_retire_with_references_becomes_zombie() {
        let mut sa = record();
        retain(&mut sa);

        assert_eq!(retire(&mut sa), Retirement::Zombie);
        assert_eq!(sa.state(), SaState::Zombie);
        assert!(!is_erasable(&sa));

        drop_ref(&mut sa);
        assert!(is_erasable(&sa));
    }

    #[test]
    fn test_complete_clears_provisional() {
        let mut sa = record();
        sa.flags = SaFlags::PROVISIONAL | SaFlags::INBOUND_CAPABLE;
        sa.expires_at = Some(30);
        retain(&mut sa);

        let update = record().with_key(&[1, 2, 3]).with_version(2);
        complete(&mut sa, update, SaFlags::OUTBOUND_CAPABLE);

        assert_eq!(sa.state(), SaState::Complete);
        assert_eq!(sa.flags, SaFlags::OUTBOUND_CAPABLE);
        assert_eq!(sa.material.key, [1, 2, 3]);
        assert_eq!(sa.ref_count, 1);
        assert_eq!(sa.expires_at, None);
    }

    #[test]
    fn test_classify_directions() {
        let local = StaticLocalTable::new(&[addr(1)]);
        assert_eq!(
            classify(&local, &addr(1), &addr(2)),
            SaFlags::OUTBOUND_CAPABLE
        );
        assert_eq!(
            classify(&local, &addr(2), &addr(1)),
            SaFlags::INBOUND_CAPABLE
        );
        assert_eq!(classify(&local, &addr(3), &addr(4)), SaFlags::empty());
        assert_eq!(classify(&local, &addr(1), &addr(1)), SaFlags::DIRECTION);
    }

    #[test]
    fn test_provisional_expiry() {
        let mut sa = record();
        sa.flags = SaFlags::PROVISIONAL;
        sa.expires_at = Some(30);
        assert!(!is_expired(&sa, 29));
        assert!(is_expired(&sa, 30));
    }
}
