//! # Registry Errors
//!
//! Error taxonomy shared by every registry operation.
//!
//! Operations return [`SaResult`]; nothing in the registry fails silently.
//! Only the control handler turns these values into wire `errno` codes.
//! Broken internal invariants (reference count underflow, dangling index
//! entries) are not represented here: they are kernel bugs and panic.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Result type for registry operations
pub type SaResult<T> = core::result::Result<T, SaError>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Security-association registry error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaError {
    /// Lookup, update or delete target is absent
    NotFound,
    /// An identical association is already stored
    AlreadyExists,
    /// Internal bookkeeping could not be allocated
    OutOfResources,
    /// No free SPI was found within the probe bound
    AddressUnavailable,
    /// Malformed address, length or mandatory field
    InvalidArgument,
    /// Unknown message type or version mismatch
    Unsupported,
}

/// BSD errno values echoed back to key daemons
pub mod errno {
    /// No such entry
    pub const ESRCH: u32 = 3;
    /// Entry exists
    pub const EEXIST: u32 = 17;
    /// Invalid argument
    pub const EINVAL: u32 = 22;
    /// Operation not supported
    pub const EOPNOTSUPP: u32 = 45;
    /// Address not available
    pub const EADDRNOTAVAIL: u32 = 49;
    /// No buffer space
    pub const ENOBUFS: u32 = 55;
}

impl SaError {
    /// Wire errno for this error
    pub const fn errno(&self) -> u32 {
        match self {
            Self::NotFound => errno::ESRCH,
            Self::AlreadyExists => errno::EEXIST,
            Self::OutOfResources => errno::ENOBUFS,
            Self::AddressUnavailable => errno::EADDRNOTAVAIL,
            Self::InvalidArgument => errno::EINVAL,
            Self::Unsupported => errno::EOPNOTSUPP,
        }
    }

    /// Decode a wire errno (0 means success)
    pub const fn from_errno(code: u32) -> Option<Self> {
        match code {
            errno::ESRCH => Some(Self::NotFound),
            errno::EEXIST => Some(Self::AlreadyExists),
            errno::ENOBUFS => Some(Self::OutOfResources),
            errno::EADDRNOTAVAIL => Some(Self::AddressUnavailable),
            errno::EINVAL => Some(Self::InvalidArgument),
            errno::EOPNOTSUPP => Some(Self::Unsupported),
            _ => None,
        }
    }
}

impl fmt::Display for SaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "security association not found"),
            Self::AlreadyExists => write!(f, "security association already exists"),
            Self::OutOfResources => write!(f, "out of registry resources"),
            Self::AddressUnavailable => write!(f, "no SPI available in range"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Unsupported => write!(f, "unsupported message or version"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
