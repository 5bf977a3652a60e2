//! Lock-free registry counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live counters, bumped outside the registry locks
#[derive(Debug, Default)]
pub struct RegistryStats {
    adds: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    erasures: AtomicU64,
    deferred_erasures: AtomicU64,
    spi_probes: AtomicU64,
    spi_failures: AtomicU64,
    allocation_hits: AtomicU64,
    allocation_misses: AtomicU64,
    acquires_sent: AtomicU64,
    acquires_suppressed: AtomicU64,
    acquires_failed: AtomicU64,
}

/// Point-in-time copy of [`RegistryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful Add requests
    pub adds: u64,
    /// Successful Update requests
    pub updates: u64,
    /// Records retired by Delete, Flush or expiry
    pub deletes: u64,
    /// Records erased immediately on retirement
    pub erasures: u64,
    /// Zombies erased by their last release
    pub deferred_erasures: u64,
    /// SPI candidates drawn
    pub spi_probes: u64,
    /// GetSpi requests that exhausted the probe bound
    pub spi_failures: u64,
    /// Flows granted an association
    pub allocation_hits: u64,
    /// Allocation requests with no candidate
    pub allocation_misses: u64,
    /// ACQUIRE messages delivered
    pub acquires_sent: u64,
    /// Misses debounced
    pub acquires_suppressed: u64,
    /// Misses no consumer accepted
    pub acquires_failed: u64,
}

macro_rules! bump {
    ($($name:ident),* $(,)?) => {
        $(
            #[doc = concat!("Count one `", stringify!($name), "` event")]
            pub fn $name(&self) {
                self.$name.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RegistryStats {
    bump!(
        adds,
        updates,
        deletes,
        erasures,
        deferred_erasures,
        spi_failures,
        allocation_hits,
        allocation_misses,
        acquires_suppressed,
        acquires_failed,
    );

    /// Count `n` SPI probes
    pub fn spi_probes(&self, n: u32) {
        self.spi_probes.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    /// Count `n` delivered ACQUIRE messages
    pub fn acquires_sent(&self, n: usize) {
        self.acquires_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            adds: load(&self.adds),
            updates: load(&self.updates),
            deletes: load(&self.deletes),
            erasures: load(&self.erasures),
            deferred_erasures: load(&self.deferred_erasures),
            spi_probes: load(&self.spi_probes),
            spi_failures: load(&self.spi_failures),
            allocation_hits: load(&self.allocation_hits),
            allocation_misses: load(&self.allocation_misses),
            acquires_sent: load(&self.acquires_sent),
            acquires_suppressed: load(&self.acquires_suppressed),
            acquires_failed: load(&self.acquires_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = RegistryStats::default();
        stats.adds();
        stats.adds();
        stats.spi_probes(7);
        stats.acquires_sent(3);

        let snap = stats.snapshot();
        assert_eq!(snap.adds, 2);
        assert_eq!(snap.spi_probes, 7);
        assert_eq!(snap.acquires_sent, 3);
        assert_eq!(snap.deletes, 0);
    }
}
