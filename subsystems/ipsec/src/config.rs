//! # Registry Configuration
//!
//! Tunables for SPI allocation, provisional lifetimes and acquire
//! debouncing. Defaults follow the classic PF_KEY engine values.

use crate::error::{SaError, SaResult};

// =============================================================================
// DEFAULTS
// =============================================================================

/// Maximum random probes per GetSpi request
pub const DEFAULT_SPI_TRY_COUNT: u32 = 1000;

/// Lowest SPI handed out when a request gives no range
pub const DEFAULT_SPI_MIN: u32 = 0x100;

/// Highest SPI handed out when a request gives no range
pub const DEFAULT_SPI_MAX: u32 = 0x0fff_ffff;

/// Seconds a provisional association waits for its material
pub const DEFAULT_PROVISIONAL_LIFETIME_SECS: u64 = 30;

/// Misses suppressed before an acquire is sent again
pub const DEFAULT_ACQUIRE_MAX_COUNT: u32 = 10;

/// Seconds an acquire request suppresses repeats
pub const DEFAULT_ACQUIRE_LIFETIME_SECS: u64 = 20;

/// Passes a flush may take before it is declared stuck
pub const DEFAULT_FLUSH_MAX_PASSES: u32 = 8;

/// Initial capacity hint for the hash indices
pub const DEFAULT_INDEX_CAPACITY: usize = 64;

// =============================================================================
// CONFIG
// =============================================================================

/// Security-association registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// GetSpi probe bound
    pub spi_try_count: u32,
    /// Default SPI range lower bound (inclusive)
    pub spi_min: u32,
    /// Default SPI range upper bound (inclusive)
    pub spi_max: u32,
    /// Lifetime of a PROVISIONAL record
    pub provisional_lifetime_secs: u64,
    /// Suppressed misses before a forced re-notify
    pub acquire_max_count: u32,
    /// AcquireRequest expiry window
    pub acquire_lifetime_secs: u64,
    /// Bounded retry for flush
    pub flush_max_passes: u32,
    /// Initial capacity hint for the hash indices
    pub index_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            spi_try_count: DEFAULT_SPI_TRY_COUNT,
            spi_min: DEFAULT_SPI_MIN,
            spi_max: DEFAULT_SPI_MAX,
            provisional_lifetime_secs: DEFAULT_PROVISIONAL_LIFETIME_SECS,
            acquire_max_count: DEFAULT_ACQUIRE_MAX_COUNT,
            acquire_lifetime_secs: DEFAULT_ACQUIRE_LIFETIME_SECS,
            flush_max_passes: DEFAULT_FLUSH_MAX_PASSES,
            index_capacity: DEFAULT_INDEX_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Configuration for small embedded profiles
    pub fn minimal() -> Self {
        Self {
            spi_try_count: 64,
            index_capacity: 8,
            ..Default::default()
        }
    }

    /// Override the default SPI range
    pub fn with_spi_range(mut self, min: u32, max: u32) -> Self {
        self.spi_min = min;
        self.spi_max = max;
        self
    }

    /// Override acquire debouncing
    pub fn with_acquire_limits(mut self, max_count: u32, lifetime_secs: u64) -> Self {
        self.acquire_max_count = max_count;
        self.acquire_lifetime_secs = lifetime_secs;
        self
    }

    /// Override the provisional lifetime
    pub fn with_provisional_lifetime(mut self, secs: u64) -> Self {
        self.provisional_lifetime_secs = secs;
        self
    }

    /// Check the configuration for contradictions
    pub fn validate(&self) -> SaResult<()> {
        if self.spi_min > self.spi_max {
            log::warn!(
                "ipsec: rejecting config with SPI range {:#x}..{:#x}",
                self.spi_min,
                self.spi_max
            );
            return Err(SaError::InvalidArgument);
        }
        if self.spi_try_count == 0 || self.flush_max_passes == 0 {
            return Err(SaError::InvalidArgument);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.spi_try_count, 1000);
        assert_eq!(config.spi_min, 0x100);
        assert_eq!(config.spi_max, 0x0fff_ffff);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_inverted_range() {
        let config = RegistryConfig::default().with_spi_range(500, 100);
        assert_eq!(config.validate(), Err(SaError::InvalidArgument));
    }

    #[test]
    fn test_config_rejects_zero_probe_bound() {
        let config = RegistryConfig {
            spi_try_count: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(SaError::InvalidArgument));
        assert!(RegistryConfig::minimal().validate().is_ok());
    }
}
