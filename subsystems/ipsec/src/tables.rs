//! # Association Tables
//!
//! The store, the allocation index and the flow binding index, updated
//! together as one transaction. A [`Tables`] value only ever lives behind
//! the registry's store lock; every method leaves the three structures
//! mutually consistent, rolling back partial work on failure.
//!
//! ```text
//!   FlowTable ──FlowHandle──▶ SaHandle ◀──PairKey── AllocationIndex
//!                                │
//!                                ▼
//!                             SaStore ──owns──▶ SecurityAssociation
//!                                                   └─ bound_flows (back-links)
//! ```

use alloc::vec::Vec;
use core::net::IpAddr;

use crate::allocation::AllocationIndex;
use crate::error::{SaError, SaResult};
use crate::flow::{FlowBinding, FlowHandle, FlowOwner, FlowTable};
use crate::key::{PairKey, SaKey};
use crate::lifecycle::{self, DeleteOutcome, ReleaseOutcome, Retirement};
use crate::sa::{SaFlags, SaHandle, SaType, SecurityAssociation};
use crate::store::SaStore;
use crate::transport::SpiSource;

/// Parameters for one SPI reservation
#[derive(Debug, Clone, Copy)]
pub struct SpiRequest {
    /// Association type
    pub sa_type: SaType,
    /// Association version
    pub version: u8,
    /// Lowest acceptable SPI
    pub low: u32,
    /// Highest acceptable SPI
    pub high: u32,
    /// Probe bound
    pub tries: u32,
    /// Provisional deadline
    pub expires_at: u64,
}

/// A successful reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiGrant {
    /// Reserved SPI
    pub spi: u32,
    /// Provisional record
    pub handle: SaHandle,
    /// Candidates drawn
    pub probes: u32,
}

/// Store + allocation index + flow bindings
#[derive(Debug, Default)]
pub struct Tables {
    store: SaStore,
    allocation: AllocationIndex,
    flows: FlowTable,
}

impl Tables {
    /// Create empty tables sized for `capacity` records
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            store: SaStore::with_capacity(capacity),
            allocation: AllocationIndex::with_capacity(capacity),
            flows: FlowTable::with_capacity(capacity),
        }
    }

    // =========================================================================
    // STORE OPERATIONS
    // =========================================================================

    /// Insert a complete association
    ///
    /// A pending GETSPI reservation holds its identity; only retired
    /// records may be shadowed.
    pub fn add(&mut self, mut sa: SecurityAssociation, direction: SaFlags) -> SaResult<SaHandle> {
        if self.store.find_live(&sa.key).is_some() {
            return Err(SaError::AlreadyExists);
        }

        sa.flags = (sa.flags & SaFlags::CALLER_SETTABLE) | direction;
        sa.ref_count = 0;
        sa.bound_flows.clear();
        sa.expires_at = None;

        let eligible = sa.is_allocation_eligible();
        let pair = sa.pair();
        let handle = self.store.insert(sa)?;

        if eligible {
            if let Err(err) = self.allocation.register(pair, handle) {
                self.store.erase(handle);
                return Err(err);
            }
        }
        Ok(handle)
    }

    /// Copy of the COMPLETE record with this identity
    pub fn get(&self, key: &SaKey) -> SaResult<SecurityAssociation> {
        self.store
            .find_complete(key)
            .and_then(|h| self.store.get(h))
            .cloned()
            .ok_or(SaError::NotFound)
    }

    /// Reserve a random free SPI in `[low, high]` as a PROVISIONAL record
    pub fn get_spi(
        &mut self,
        request: SpiRequest,
        src: IpAddr,
        dst: IpAddr,
        direction: SaFlags,
        rng: &dyn SpiSource,
    ) -> SaResult<SpiGrant> {
        if request.low > request.high {
            return Err(SaError::InvalidArgument);
        }

        // A degenerate range has exactly one candidate
        let tries = if request.low == request.high {
            1
        } else {
            request.tries
        };

        for probe in 1..=tries {
            // A rejected draw still spends a probe
            let Some(spi) = draw_spi(rng, request.low, request.high) else {
                continue;
            };

            let key = SaKey::new(request.sa_type, src, dst, spi);
            if self.store.find_live(&key).is_some() {
                continue;
            }

            let mut sa = SecurityAssociation::new(request.sa_type, src, dst, spi)
                .with_version(request.version);
            sa.flags = SaFlags::PROVISIONAL | direction;
            sa.expires_at = Some(request.expires_at);

            let handle = self.store.insert(sa)?;
            return Ok(SpiGrant {
                spi,
                handle,
                probes: probe,
            });
        }

        Err(SaError::AddressUnavailable)
    }

    /// Complete or refresh the newest live record with this identity
    pub fn update(&mut self, update: SecurityAssociation, direction: SaFlags) -> SaResult<SaHandle> {
        let handle = self.store.find_live(&update.key).ok_or(SaError::NotFound)?;
        let pair = update.pair();

        let mut preview = update.clone();
        preview.flags = (update.flags & SaFlags::CALLER_SETTABLE) | direction;
        match self.store.get(handle) {
            Some(current) => preview.flags |= current.flags & SaFlags::UNIQUE_PER_FLOW,
            None => lifecycle::invariant_violation("index entry for a vacant slot"),
        }
        // A claimed unique association never returns to the shared pool
        let eligible = preview.is_allocation_eligible();
        let was_listed = self.allocation.contains(&pair, handle);

        // Register first: the only fallible step, before anything is touched
        if eligible && !was_listed {
            self.allocation.register(pair, handle)?;
        }

        let Some(sa) = self.store.get_mut(handle) else {
            lifecycle::invariant_violation("index entry for a vacant slot");
        };
        lifecycle::complete(sa, update, direction);

        if !eligible && was_listed {
            self.allocation.unregister(&pair, handle);
        }
        Ok(handle)
    }

    /// Delete the newest live record with this identity
    pub fn delete(&mut self, key: &SaKey) -> DeleteOutcome {
        match self.store.find_live(key) {
            Some(handle) => self.retire(handle),
            None if self.store.find(key, |_| true).is_some() => DeleteOutcome::AlreadyRetired,
            None => DeleteOutcome::Absent,
        }
    }

    /// Retire a record, erasing it when nothing references it
    pub fn retire(&mut self, handle: SaHandle) -> DeleteOutcome {
        let Some(sa) = self.store.get_mut(handle) else {
            return DeleteOutcome::Absent;
        };
        if !sa.is_live() {
            return DeleteOutcome::AlreadyRetired;
        }

        let pair = sa.pair();
        let retirement = lifecycle::retire(sa);
        self.allocation.unregister(&pair, handle);

        match retirement {
            Retirement::Erase => {
                self.erase(handle);
                DeleteOutcome::Erased
            },
            Retirement::Zombie => DeleteOutcome::Deferred,
        }
    }

    /// Physically remove a record and every back-reference to it
    fn erase(&mut self, handle: SaHandle) {
        let Some(mut sa) = self.store.erase(handle) else {
            lifecycle::invariant_violation("erasing a vacant slot");
        };
        for flow in sa.bound_flows.drain(..) {
            self.flows.unbind(&flow);
        }
        self.allocation.unregister(&sa.pair(), handle);
        sa.material.wipe();
        log::debug!(
            "ipsec: erased {} spi={:#x} ({})",
            sa.sa_type(),
            sa.spi(),
            handle
        );
    }

    /// Retire every live record (optionally of one type) within `max_passes`
    pub fn flush(&mut self, sa_type: Option<SaType>, max_passes: u32) -> usize {
        let mut retired = 0;

        for _ in 0..max_passes {
            let targets = self.live_handles(sa_type);
            if targets.is_empty() {
                return retired;
            }
            for handle in targets {
                if self.retire(handle).retired_now() {
                    retired += 1;
                }
            }
        }

        if !self.live_handles(sa_type).is_empty() {
            lifecycle::invariant_violation("flush made no progress");
        }
        retired
    }

    fn live_handles(&self, sa_type: Option<SaType>) -> Vec<SaHandle> {
        self.store
            .handles()
            .filter(|h| {
                self.store.get(*h).is_some_and(|sa| {
                    sa.is_live() && sa_type.map_or(true, |t| sa.sa_type() == t)
                })
            })
            .collect()
    }

    /// Erase provisional records whose lifetime passed
    pub fn expire_provisional(&mut self, now: u64) -> usize {
        let expired: Vec<SaHandle> = self
            .store
            .handles()
            .filter(|h| self.store.get(*h).is_some_and(|sa| lifecycle::is_expired(sa, now)))
            .collect();

        expired
            .into_iter()
            .filter(|h| self.retire(*h).retired_now())
            .count()
    }

    // =========================================================================
    // REFERENCES
    // =========================================================================

    /// Take a reference to the COMPLETE record with this identity
    pub fn acquire_by_spi(&mut self, key: &SaKey) -> SaResult<SaHandle> {
        let handle = self.store.find_complete(key).ok_or(SaError::NotFound)?;
        if let Some(sa) = self.store.get_mut(handle) {
            lifecycle::retain(sa);
        }
        Ok(handle)
    }

    /// Drop a reference taken by [`Tables::acquire_by_spi`]
    pub fn release(&mut self, handle: SaHandle) -> SaResult<ReleaseOutcome> {
        let sa = self.store.get_mut(handle).ok_or(SaError::NotFound)?;
        let remaining = lifecycle::drop_ref(sa);

        if lifecycle::is_erasable(sa) {
            self.erase(handle);
            return Ok(ReleaseOutcome::Erased);
        }
        Ok(ReleaseOutcome::Released { remaining })
    }

    /// Read a record through a held handle (zombies included)
    pub fn snapshot(&self, handle: SaHandle) -> SaResult<SecurityAssociation> {
        self.store.get(handle).cloned().ok_or(SaError::NotFound)
    }

    // =========================================================================
    // FLOWS
    // =========================================================================

    /// Bind `flow` to a shareable association for `pair`; `Ok(None)` on miss
    pub fn allocate(
        &mut self,
        pair: &PairKey,
        flow: FlowHandle,
        require_unique: bool,
    ) -> SaResult<Option<SaHandle>> {
        if let Some(existing) = self.flows.get(&flow) {
            return match self.store.get(existing.sa) {
                Some(sa) if sa.pair() == *pair => Ok(Some(existing.sa)),
                _ => Err(SaError::AlreadyExists),
            };
        }

        let candidate = self.allocation.candidates(pair).find(|h| {
            self.store.get(*h).is_some_and(|sa| {
                sa.is_shareable() && !(require_unique && sa.flags.contains(SaFlags::IN_USE))
            })
        });
        let Some(handle) = candidate else {
            return Ok(None);
        };

        self.flows.bind(
            flow,
            FlowBinding {
                sa: handle,
                unique: require_unique,
            },
        )?;

        let Some(sa) = self.store.get_mut(handle) else {
            lifecycle::invariant_violation("allocation entry for a vacant slot");
        };
        if sa.bound_flows.try_reserve(1).is_err() {
            self.flows.unbind(&flow);
            return Err(SaError::OutOfResources);
        }
        sa.bound_flows.push(flow);
        lifecycle::retain(sa);
        sa.flags.insert(SaFlags::IN_USE);

        if require_unique {
            sa.flags.insert(SaFlags::UNIQUE_PER_FLOW);
            self.allocation.unregister(pair, handle);
        }
        Ok(Some(handle))
    }

    /// Association bound to `flow`
    pub fn flow_association(&self, flow: &FlowHandle) -> SaResult<SecurityAssociation> {
        let binding = self.flows.get(flow).ok_or(SaError::NotFound)?;
        match self.store.get(binding.sa) {
            Some(sa) => Ok(sa.clone()),
            None => lifecycle::invariant_violation("flow bound to a vacant slot"),
        }
    }

    /// Unbind `flow` and drop its reference
    pub fn release_flow(&mut self, flow: &FlowHandle) -> SaResult<ReleaseOutcome> {
        let binding = self.flows.unbind(flow).ok_or(SaError::NotFound)?;
        let Some(sa) = self.store.get_mut(binding.sa) else {
            lifecycle::invariant_violation("flow bound to a vacant slot");
        };

        sa.bound_flows.retain(|f| f != flow);
        if sa.bound_flows.is_empty() {
            sa.flags.remove(SaFlags::IN_USE);
        }
        let remaining = lifecycle::drop_ref(sa);
        let unique = sa.flags.contains(SaFlags::UNIQUE_PER_FLOW) && sa.is_live();

        if unique {
            // A uniquely-bound association has no life beyond its flow
            return Ok(match self.retire(binding.sa) {
                DeleteOutcome::Erased => ReleaseOutcome::Erased,
                _ => ReleaseOutcome::Released { remaining },
            });
        }
        if lifecycle::is_erasable(sa) {
            self.erase(binding.sa);
            return Ok(ReleaseOutcome::Erased);
        }
        Ok(ReleaseOutcome::Released { remaining })
    }

    /// Release every flow of `owner`
    pub fn release_owner(&mut self, owner: FlowOwner) -> usize {
        self.flows
            .flows_of(owner)
            .iter()
            .filter(|flow| self.release_flow(flow).is_ok())
            .count()
    }

    /// Release every bound flow
    pub fn release_all_flows(&mut self) -> usize {
        self.flows
            .flows()
            .iter()
            .filter(|flow| self.release_flow(flow).is_ok())
            .count()
    }

    // =========================================================================
    // ENUMERATION
    // =========================================================================

    /// First exportable record at or after slot `cursor`
    pub fn dump_from(&self, cursor: u32) -> Option<(SaHandle, SecurityAssociation)> {
        self.store
            .next_from(cursor, SecurityAssociation::is_complete)
            .map(|(h, sa)| (h, sa.clone()))
    }

    /// Stored records in every state
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Is nothing stored?
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Listed allocation candidates
    pub fn allocation_len(&self) -> usize {
        self.allocation.len()
    }

    /// Bound flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

/// Uniform draw from `[low, high]`
///
/// Returns `None` when the draw lands in the low tail that would skew
/// `r % width`; the caller counts that as a spent probe.
fn draw_spi(rng: &dyn SpiSource, low: u32, high: u32) -> Option<u32> {
    let r = rng.next_u32();
    let Some(width) = (high - low).checked_add(1) else {
        return Some(r);
    };
    // 2^32 mod width
    let threshold = width.wrapping_neg() % width;
    (r >= threshold).then(|| low + r % width)
}

// =============================================================================
// TESTS
// =============================================================================
