//! # Security Associations
//!
//! The central record type, its lifecycle flags and the handle used to
//! address it inside the store arena.

use alloc::vec::Vec;
use core::fmt;
use core::net::IpAddr;

use bitflags::bitflags;

use crate::flow::FlowHandle;
use crate::key::{PairKey, SaKey};

// =============================================================================
// ASSOCIATION TYPE
// =============================================================================

/// Protocol / mode tag of an association
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SaType {
    /// Authentication header
    Ah      = 2,
    /// Encapsulating security payload
    Esp     = 3,
    /// RSVP integrity
    Rsvp    = 5,
    /// OSPFv2 authentication
    OspfV2  = 6,
    /// RIPv2 authentication
    RipV2   = 7,
    /// Mobile IP
    Mip     = 8,
    /// IP payload compression
    IpComp  = 9,
}

impl SaType {
    /// Decode a wire type tag
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(Self::Ah),
            3 => Some(Self::Esp),
            5 => Some(Self::Rsvp),
            6 => Some(Self::OspfV2),
            7 => Some(Self::RipV2),
            8 => Some(Self::Mip),
            9 => Some(Self::IpComp),
            _ => None,
        }
    }

    /// Short name for logs
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ah => "ah",
            Self::Esp => "esp",
            Self::Rsvp => "rsvp",
            Self::OspfV2 => "ospfv2",
            Self::RipV2 => "ripv2",
            Self::Mip => "mip",
            Self::IpComp => "ipcomp",
        }
    }
}

impl fmt::Display for SaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// LIFECYCLE FLAGS
// =============================================================================

bitflags! {
    /// Per-association lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SaFlags: u32 {
        /// SPI reserved, material not yet supplied
        const PROVISIONAL      = 1 << 0;
        /// May only ever serve one flow
        const UNIQUE_PER_FLOW  = 1 << 1;
        /// Bound to at least one flow
        const IN_USE           = 1 << 2;
        /// Destination address is local
        const INBOUND_CAPABLE  = 1 << 3;
        /// Source address is local
        const OUTBOUND_CAPABLE = 1 << 4;
        /// Logically deleted
        const RETIRED          = 1 << 5;
        /// Retired while still referenced
        const ZOMBIE           = 1 << 6;

        /// Flags derived from the local-address test
        const DIRECTION = Self::INBOUND_CAPABLE.bits() | Self::OUTBOUND_CAPABLE.bits();
        /// Flags a caller may request on insertion
        const CALLER_SETTABLE = Self::UNIQUE_PER_FLOW.bits();
    }
}

/// Lifecycle state derived from the flag set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaState {
    /// SPI reserved, awaiting material
    Provisional = 0,
    /// Usable for lookups and allocation
    Complete    = 1,
    /// Deleted, no references left
    Retired     = 2,
    /// Deleted while still referenced
    Zombie      = 3,
}

impl SaState {
    /// Derive the state from a flag set
    pub fn of(flags: SaFlags) -> Self {
        if flags.contains(SaFlags::ZOMBIE) {
            Self::Zombie
        } else if flags.contains(SaFlags::RETIRED) {
            Self::Retired
        } else if flags.contains(SaFlags::PROVISIONAL) {
            Self::Provisional
        } else {
            Self::Complete
        }
    }

    /// Decode the wire state byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Provisional),
            1 => Some(Self::Complete),
            2 => Some(Self::Retired),
            3 => Some(Self::Zombie),
            _ => None,
        }
    }
}

// =============================================================================
// MATERIAL & LIFETIME
// =============================================================================

/// Opaque keying material; never interpreted by the registry
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SaMaterial {
    /// Primary key bytes
    pub key: Vec<u8>,
    /// Initialization vector
    pub iv: Vec<u8>,
    /// Secondary (e.g. authentication) key bytes
    pub secondary_key: Vec<u8>,
    /// Algorithm identifier
    pub algorithm: u16,
}

impl SaMaterial {
    /// Is any material present?
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.iv.is_empty() && self.secondary_key.is_empty()
    }

    /// Overwrite and drop all key bytes
    pub fn wipe(&mut self) {
        for buf in [&mut self.key, &mut self.iv, &mut self.secondary_key] {
            buf.iter_mut().for_each(|b| *b = 0);
            buf.clear();
        }
    }
}

// Key bytes stay out of debug output
impl fmt::Debug for SaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaMaterial")
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .field("secondary_key_len", &self.secondary_key.len())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

/// Lifetime parameters (opaque to the registry)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaLifetime {
    /// Lifetime kind tag
    pub kind: u32,
    /// First lifetime value
    pub value_1: u32,
    /// Second lifetime value
    pub value_2: u32,
}

/// Anti-replay state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    /// Anti-replay checking requested
    pub enabled: bool,
    /// Highest sequence number seen
    pub last_sequence: u32,
    /// Window bitmap relative to `last_sequence`
    pub bitmap: u64,
}

// =============================================================================
// SECURITY ASSOCIATION
// =============================================================================

/// A stored security association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityAssociation {
    /// Identity (type, src, dst, spi)
    pub key: SaKey,
    /// Association version
    pub version: u8,
    /// Opaque sensitivity label
    pub label: u8,
    /// Keying material
    pub material: SaMaterial,
    /// Lifetime parameters
    pub lifetime: SaLifetime,
    /// Monotonic outbound sequence number
    pub sequence_number: u32,
    /// Anti-replay state
    pub replay: ReplayWindow,
    /// Lifecycle flags
    pub flags: SaFlags,
    /// In-use counter
    pub ref_count: u32,
    /// Flows currently bound to this association
    pub bound_flows: Vec<FlowHandle>,
    /// Provisional deadline (seconds), PROVISIONAL records only
    pub expires_at: Option<u64>,
}

impl SecurityAssociation {
    /// Create a complete association with empty material
    pub fn new(sa_type: SaType, src: IpAddr, dst: IpAddr, spi: u32) -> Self {
        Self {
            key: SaKey::new(sa_type, src, dst, spi),
            version: 0,
            label: 0,
            material: SaMaterial::default(),
            lifetime: SaLifetime::default(),
            sequence_number: 0,
            replay: ReplayWindow::default(),
            flags: SaFlags::empty(),
            ref_count: 0,
            bound_flows: Vec::new(),
            expires_at: None,
        }
    }

    /// Set the keying material
    pub fn with_material(mut self, material: SaMaterial) -> Self {
        self.material = material;
        self
    }

    /// Set the primary key bytes
    pub fn with_key(mut self, key: &[u8]) -> Self {
        self.material.key = key.to_vec();
        self
    }

    /// Set the lifetime parameters
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Set the association version
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Request a uniquely-bound association
    pub fn unique_per_flow(mut self) -> Self {
        self.flags.insert(SaFlags::UNIQUE_PER_FLOW);
        self
    }

    /// Association type
    pub fn sa_type(&self) -> SaType {
        self.key.sa_type
    }

    /// Security parameter index
    pub fn spi(&self) -> u32 {
        self.key.spi
    }

    /// Allocation key
    pub fn pair(&self) -> PairKey {
        self.key.pair()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SaState {
        SaState::of(self.flags)
    }

    /// Visible to Get, Add duplicate checks and allocation
    pub fn is_complete(&self) -> bool {
        !self
            .flags
            .intersects(SaFlags::PROVISIONAL | SaFlags::RETIRED | SaFlags::ZOMBIE)
    }

    /// Not yet deleted (complete or provisional)
    pub fn is_live(&self) -> bool {
        !self.flags.intersects(SaFlags::RETIRED | SaFlags::ZOMBIE)
    }

    /// May be handed to flows that have not bound one yet
    pub fn is_shareable(&self) -> bool {
        self.is_complete() && !self.flags.contains(SaFlags::UNIQUE_PER_FLOW)
    }

    /// Belongs in the allocation index
    ///
    /// "Neither direction" counts as outbound until the addresses resolve.
    pub fn is_allocation_eligible(&self) -> bool {
        let outbound = self.flags.contains(SaFlags::OUTBOUND_CAPABLE)
            || !self.flags.intersects(SaFlags::DIRECTION);
        self.is_shareable() && outbound
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Generation-checked reference to a stored association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaHandle {
    slot: u32,
    generation: u32,
}

impl SaHandle {
    /// Create a handle
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Arena slot index
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    /// Slot generation at the time the handle was issued
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sa#{}.{}", self.slot, self.generation)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use core::net::Ipv4Addr;

    use super::*;

    fn sample() -> SecurityAssociation {
        SecurityAssociation::new(
            SaType::Esp,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            7,
        )
    }

    #[test]
    fn test_state_derivation() {
        assert_eq!(SaState::of(SaFlags::empty()), SaState::Complete);
        assert_eq!(SaState::of(SaFlags::PROVISIONAL), SaState::Provisional);
        assert_eq!(
            SaState::of(SaFlags::PROVISIONAL | SaFlags::RETIRED),
            SaState::Retired
        );
        assert_eq!(
            SaState::of(SaFlags::RETIRED | SaFlags::ZOMBIE),
            SaState::Zombie
        );
    }

    #[test]
    fn test_allocation_eligibility() {
        let mut sa = sample();
        assert!(sa.is_allocation_eligible(), "neither direction is eligible");

        sa.flags.insert(SaFlags::INBOUND_CAPABLE);
        assert!(!sa.is_allocation_eligible());

        sa.flags.insert(SaFlags::OUTBOUND_CAPABLE);
        assert!(sa.is_allocation_eligible());

        sa.flags.insert(SaFlags::UNIQUE_PER_FLOW);
        assert!(!sa.is_allocation_eligible());
    }

    #[test]
    fn test_material_debug_hides_key() {
        let sa = sample().with_key(&[0xAA; 16]);
        let text = alloc::format!("{:?}", sa.material);
        assert!(text.contains("key_len: 16"));
        assert!(!text.contains("170"));
    }

    #[test]
    fn test_type_tags() {
        assert_eq!(SaType::from_u8(3), Some(SaType::Esp));
        assert_eq!(SaType::from_u8(4), None);
        assert_eq!(SaType::IpComp as u8, 9);
    }
}
