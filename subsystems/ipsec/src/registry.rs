//! # SA Registry
//!
//! The composition of every table behind the registry's lock discipline.
//!
//! ```text
//!   ┌──────────────── tables lock ───────────────┐   ┌──── acquire lock ────┐
//!   │ SaStore · AllocationIndex · FlowTable      │   │ AcquireCoordinator   │
//!   └────────────────────────────────────────────┘   │ RegistrationDirectory│
//!                         │ released first           └──────────────────────┘
//!                         ▼                                     │ released
//!                  KeyTransport::deliver_* (no lock held) ◀─────┘
//! ```
//!
//! The acquire lock is never taken while the tables lock is held, and no
//! collaborator that may talk to the outside world is called under either.

use core::net::IpAddr;

use spin::Mutex;

use crate::acquire::{AcquireCoordinator, AcquireDecision};
use crate::config::RegistryConfig;
use crate::directory::{ConsumerId, RegistrationDirectory};
use crate::error::{SaError, SaResult};
use crate::flow::{FlowHandle, FlowOwner};
use crate::key::{DestKey, PairKey, SaKey};
use crate::lifecycle::{self, DeleteOutcome, ReleaseOutcome};
use crate::message::KeyMessage;
use crate::sa::{SaFlags, SaHandle, SaType, SecurityAssociation};
use crate::stats::{RegistryStats, StatsSnapshot};
use crate::tables::{SpiRequest, Tables};
use crate::transport::{Collaborators, KeyTransport};

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of reporting a miss to the acquire coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// ACQUIRE delivered to this many consumers
    Sent {
        /// Consumers that accepted the message
        delivered: usize,
    },
    /// A recent ACQUIRE is still pending
    Suppressed,
}

/// Result of [`SaRegistry::allocate_or_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// The flow is bound to this association
    Granted(SaHandle),
    /// Nothing available; key daemons were (or recently had been) asked
    Pending(AcquireOutcome),
}

/// Work done by one [`SaRegistry::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Provisional records that expired
    pub provisional_expired: usize,
    /// Acquire entries that expired
    pub acquires_expired: usize,
}

/// State behind the acquire lock
#[derive(Debug, Default)]
struct AcquireState {
    coordinator: AcquireCoordinator,
    directory: RegistrationDirectory,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Security-association registry
#[derive(Debug)]
pub struct SaRegistry {
    config: RegistryConfig,
    tables: Mutex<Tables>,
    acquire: Mutex<AcquireState>,
    env: Collaborators,
    stats: RegistryStats,
}

static_assertions::assert_impl_all!(SaRegistry: Send, Sync);

impl SaRegistry {
    /// Create a registry from a validated configuration
    pub fn new(config: RegistryConfig, env: Collaborators) -> SaResult<Self> {
        config.validate()?;
        Ok(Self {
            tables: Mutex::new(Tables::with_capacity(config.index_capacity)),
            acquire: Mutex::new(AcquireState::default()),
            config,
            env,
            stats: RegistryStats::default(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Notification channel, for request handlers that stream replies
    pub(crate) fn transport(&self) -> &dyn KeyTransport {
        self.env.transport.as_ref()
    }

    fn direction(&self, src: &IpAddr, dst: &IpAddr) -> SaFlags {
        lifecycle::classify(self.env.local.as_ref(), src, dst)
    }

    /// An association for `dest` now exists; stop debouncing misses for it
    fn clear_acquire(&self, dest: &DestKey) {
        if self.acquire.lock().coordinator.clear(dest) {
            log::debug!("ipsec: acquire for {} {} satisfied", dest.sa_type, dest.dst);
        }
    }

    // =========================================================================
    // STORE OPERATIONS
    // =========================================================================

    /// Install a complete association
    pub fn add(&self, sa: SecurityAssociation) -> SaResult<SaHandle> {
        let key = sa.key;
        let direction = self.direction(&key.src, &key.dst);

        let handle = self.tables.lock().add(sa, direction)?;
        self.stats.adds();
        log::debug!(
            "ipsec: add {} {} -> {} spi={:#x} ({:?})",
            key.sa_type,
            key.src,
            key.dst,
            key.spi,
            direction
        );

        self.clear_acquire(&key.dest());
        Ok(handle)
    }

    /// Copy of the COMPLETE association with this identity
    pub fn get(&self, key: &SaKey) -> SaResult<SecurityAssociation> {
        self.tables.lock().get(key)
    }

    /// Reserve an SPI in `range` (or the configured default range)
    pub fn get_spi(
        &self,
        sa_type: SaType,
        version: u8,
        src: IpAddr,
        dst: IpAddr,
        range: Option<(u32, u32)>,
    ) -> SaResult<u32> {
        let (low, high) = range.unwrap_or((self.config.spi_min, self.config.spi_max));
        let request = SpiRequest {
            sa_type,
            version,
            low,
            high,
            tries: self.config.spi_try_count,
            expires_at: self
                .env
                .clock
                .now_secs()
                .saturating_add(self.config.provisional_lifetime_secs),
        };
        let direction = self.direction(&src, &dst);

        let result = self
            .tables
            .lock()
            .get_spi(request, src, dst, direction, self.env.spi.as_ref());

        match result {
            Ok(grant) => {
                self.stats.spi_probes(grant.probes);
                log::debug!(
                    "ipsec: getspi {} {} -> {} reserved {:#x} after {} probes",
                    sa_type,
                    src,
                    dst,
                    grant.spi,
                    grant.probes
                );
                Ok(grant.spi)
            },
            Err(SaError::AddressUnavailable) => {
                let tries = if low == high { 1 } else { request.tries };
                self.stats.spi_probes(tries);
                self.stats.spi_failures();
                log::warn!(
                    "ipsec: no free SPI in {:#x}..={:#x} for {} {} -> {}",
                    low,
                    high,
                    sa_type,
                    src,
                    dst
                );
                Err(SaError::AddressUnavailable)
            },
            Err(err) => Err(err),
        }
    }

    /// Complete a provisional association or refresh a complete one
    pub fn update(&self, sa: SecurityAssociation) -> SaResult<SaHandle> {
        let key = sa.key;
        let direction = self.direction(&key.src, &key.dst);

        let handle = self.tables.lock().update(sa, direction)?;
        self.stats.updates();
        log::debug!(
            "ipsec: update {} {} -> {} spi={:#x}",
            key.sa_type,
            key.src,
            key.dst,
            key.spi
        );

        self.clear_acquire(&key.dest());
        Ok(handle)
    }

    /// Delete by identity
    ///
    /// Deleting an identity that is already retired or absent succeeds with
    /// the corresponding [`DeleteOutcome`]; nothing is freed twice.
    pub fn delete(&self, key: &SaKey) -> SaResult<DeleteOutcome> {
        let outcome = self.tables.lock().delete(key);
        self.count_retirement(outcome);
        log::debug!(
            "ipsec: delete {} {} -> {} spi={:#x}: {:?}",
            key.sa_type,
            key.src,
            key.dst,
            key.spi,
            outcome
        );
        Ok(outcome)
    }

    fn count_retirement(&self, outcome: DeleteOutcome) {
        match outcome {
            DeleteOutcome::Erased => {
                self.stats.deletes();
                self.stats.erasures();
            },
            DeleteOutcome::Deferred => self.stats.deletes(),
            DeleteOutcome::AlreadyRetired | DeleteOutcome::Absent => {},
        }
    }

    fn count_release(&self, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::Erased {
            self.stats.deferred_erasures();
        }
    }

    /// Delete every association
    pub fn flush(&self) -> usize {
        self.flush_filtered(None)
    }

    /// Delete every association of one type
    pub fn flush_type(&self, sa_type: SaType) -> usize {
        self.flush_filtered(Some(sa_type))
    }

    fn flush_filtered(&self, sa_type: Option<SaType>) -> usize {
        let retired = self
            .tables
            .lock()
            .flush(sa_type, self.config.flush_max_passes);
        for _ in 0..retired {
            self.stats.deletes();
        }
        match sa_type {
            Some(t) => log::info!("ipsec: flushed {} {} associations", retired, t),
            None => log::info!("ipsec: flushed {} associations", retired),
        }
        retired
    }

    /// Lazy walk over exportable (COMPLETE) associations
    ///
    /// The walk takes the tables lock once per step; creating a new one
    /// restarts from the beginning.
    pub fn dump(&self) -> Dump<'_> {
        Dump {
            registry: self,
            cursor: Some(0),
        }
    }

    // =========================================================================
    // REFERENCES
    // =========================================================================

    /// Look up a COMPLETE association for use and take a reference
    pub fn acquire_by_spi(&self, key: &SaKey) -> SaResult<SaHandle> {
        self.tables.lock().acquire_by_spi(key)
    }

    /// Drop a reference taken by [`SaRegistry::acquire_by_spi`]
    pub fn release(&self, handle: SaHandle) -> SaResult<ReleaseOutcome> {
        let outcome = self.tables.lock().release(handle);
        if let Err(SaError::NotFound) = outcome {
            log::warn!("ipsec: release of stale handle {}", handle);
        }
        let outcome = outcome?;
        self.count_release(outcome);
        Ok(outcome)
    }

    /// Read an association through a held handle
    pub fn snapshot(&self, handle: SaHandle) -> SaResult<SecurityAssociation> {
        self.tables.lock().snapshot(handle)
    }

    // =========================================================================
    // FLOWS
    // =========================================================================

    /// Bind `flow` to an existing association for (type, src, dst)
    ///
    /// `Ok(None)` means nothing is available; it is not an error.
    pub fn allocate_for(
        &self,
        sa_type: SaType,
        src: IpAddr,
        dst: IpAddr,
        flow: FlowHandle,
        require_unique: bool,
    ) -> SaResult<Option<SaHandle>> {
        let pair = PairKey::new(sa_type, src, dst);
        let granted = self.tables.lock().allocate(&pair, flow, require_unique)?;

        match granted {
            Some(handle) => {
                self.stats.allocation_hits();
                log::debug!("ipsec: {} bound to {} (unique={})", flow, handle, require_unique);
            },
            None => self.stats.allocation_misses(),
        }
        Ok(granted)
    }

    /// [`SaRegistry::allocate_for`], asking key daemons on a miss
    pub fn allocate_or_acquire(
        &self,
        sa_type: SaType,
        src: IpAddr,
        dst: IpAddr,
        flow: FlowHandle,
        require_unique: bool,
    ) -> SaResult<Allocation> {
        // The tables lock is released before the coordinator is consulted
        if let Some(handle) = self.allocate_for(sa_type, src, dst, flow, require_unique)? {
            return Ok(Allocation::Granted(handle));
        }
        let outcome = self.notify_miss(sa_type, Some(src), dst)?;
        Ok(Allocation::Pending(outcome))
    }

    /// Association currently bound to `flow`
    pub fn flow_association(&self, flow: &FlowHandle) -> SaResult<SecurityAssociation> {
        self.tables.lock().flow_association(flow)
    }

    /// Unbind one flow and drop its reference
    pub fn release_flow(&self, flow: &FlowHandle) -> SaResult<ReleaseOutcome> {
        let outcome = self.tables.lock().release_flow(flow)?;
        self.count_release(outcome);
        Ok(outcome)
    }

    /// Release every flow of one owner
    pub fn release_all_for_owner(&self, owner: FlowOwner) -> usize {
        let released = self.tables.lock().release_owner(owner);
        log::debug!("ipsec: released {} flows of owner {}", released, owner.0);
        released
    }

    /// Release every bound flow
    pub fn release_all_flows(&self) -> usize {
        let released = self.tables.lock().release_all_flows();
        log::debug!("ipsec: released all {} flows", released);
        released
    }

    /// Session-layer hook: a flow closed
    ///
    /// Releases the owner's flows, or every flow when `purge_all` is set.
    pub fn on_flow_closed(&self, flow: FlowHandle, purge_all: bool) -> usize {
        if purge_all {
            self.release_all_flows()
        } else {
            self.release_all_for_owner(flow.owner)
        }
    }

    // =========================================================================
    // ACQUIRE
    // =========================================================================

    /// Report that no association was available for (type, dst)
    ///
    /// Fails with `NotFound` when no daemon is registered for the type and
    /// with `OutOfResources` when every delivery failed.
    pub fn notify_miss(
        &self,
        sa_type: SaType,
        src: Option<IpAddr>,
        dst: IpAddr,
    ) -> SaResult<AcquireOutcome> {
        let dest = DestKey::new(sa_type, dst);
        let now = self.env.clock.now_secs();

        let (consumers, ticket) = {
            let mut state = self.acquire.lock();
            let consumers = state.directory.consumers_for(sa_type);
            if consumers.is_empty() {
                return Err(SaError::NotFound);
            }
            let decision = state.coordinator.begin(
                dest,
                now,
                self.config.acquire_max_count,
                self.config.acquire_lifetime_secs,
            )?;
            match decision {
                AcquireDecision::Suppressed => {
                    self.stats.acquires_suppressed();
                    return Ok(AcquireOutcome::Suppressed);
                },
                AcquireDecision::Send(ticket) => (consumers, ticket),
            }
        };

        let message = KeyMessage::acquire(sa_type, src, dst, ticket.seq);
        let delivered = consumers
            .iter()
            .filter(|c| self.env.transport.deliver_acquire(**c, &message))
            .count();

        if delivered == 0 {
            self.acquire.lock().coordinator.rollback(&ticket);
            self.stats.acquires_failed();
            log::warn!(
                "ipsec: acquire for {} {} reached none of {} consumers",
                sa_type,
                dst,
                consumers.len()
            );
            return Err(SaError::OutOfResources);
        }

        self.stats.acquires_sent(delivered);
        log::debug!(
            "ipsec: acquire seq={} for {} {} sent to {} consumers",
            ticket.seq,
            sa_type,
            dst,
            delivered
        );
        Ok(AcquireOutcome::Sent { delivered })
    }

    /// Register a key daemon for one association type
    pub fn register(&self, consumer: ConsumerId, sa_type: SaType) -> SaResult<()> {
        self.acquire.lock().directory.register(consumer, sa_type)?;
        log::info!("ipsec: {} registered for {}", consumer, sa_type);
        Ok(())
    }

    /// Unregister a key daemon from one type, or from all of them
    pub fn unregister(&self, consumer: ConsumerId, sa_type: Option<SaType>) -> usize {
        let dropped = self.acquire.lock().directory.unregister(consumer, sa_type);
        if dropped > 0 {
            log::info!("ipsec: {} dropped {} registrations", consumer, dropped);
        }
        dropped
    }

    /// A key daemon's channel closed
    pub fn on_consumer_closed(&self, consumer: ConsumerId) -> usize {
        self.unregister(consumer, None)
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Expire provisional records and stale acquire entries
    pub fn sweep(&self) -> SweepReport {
        let now = self.env.clock.now_secs();

        let provisional_expired = self.tables.lock().expire_provisional(now);
        for _ in 0..provisional_expired {
            self.stats.deletes();
        }
        let acquires_expired = self.acquire.lock().coordinator.expire(now);

        if provisional_expired > 0 {
            log::debug!("ipsec: {} provisional associations expired", provisional_expired);
        }
        SweepReport {
            provisional_expired,
            acquires_expired,
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stored associations, in any state
    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    /// Is nothing stored?
    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}

// =============================================================================
// DUMP
// =============================================================================

/// Restartable cursor over COMPLETE associations
#[derive(Debug)]
pub struct Dump<'a> {
    registry: &'a SaRegistry,
    cursor: Option<u32>,
}

impl Iterator for Dump<'_> {
    type Item = SecurityAssociation;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor?;
        let found = self.registry.tables.lock().dump_from(cursor);
        match found {
            Some((handle, sa)) => {
                self.cursor = handle.slot().checked_add(1);
                Some(sa)
            },
            None => {
                self.cursor = None;
                None
            },
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
