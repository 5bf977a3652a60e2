//! # Registration Directory
//!
//! Which key daemons service acquire requests for which association type.
//! Small and unordered; a linear scan is cheaper than hashing here.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{SaError, SaResult};
use crate::sa::SaType;

/// Opaque handle of a registered key daemon (its channel endpoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u32);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer {}", self.0)
    }
}

/// (association type, consumer) registrations
#[derive(Debug, Default)]
pub struct RegistrationDirectory {
    entries: Vec<(SaType, ConsumerId)>,
}

impl RegistrationDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `consumer` for `sa_type`
    pub fn register(&mut self, consumer: ConsumerId, sa_type: SaType) -> SaResult<()> {
        if self.entries.contains(&(sa_type, consumer)) {
            return Err(SaError::AlreadyExists);
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| SaError::OutOfResources)?;
        self.entries.push((sa_type, consumer));
        Ok(())
    }

    /// Remove `consumer` for one type, or for every type when `sa_type` is
    /// `None`; returns the number of registrations dropped
    pub fn unregister(&mut self, consumer: ConsumerId, sa_type: Option<SaType>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(t, c)| *c != consumer || sa_type.is_some_and(|wanted| wanted != *t));
        before - self.entries.len()
    }

    /// Consumers willing to service `sa_type`, in registration order
    pub fn consumers_for(&self, sa_type: SaType) -> Vec<ConsumerId> {
        self.entries
            .iter()
            .filter(|(t, _)| *t == sa_type)
            .map(|(_, c)| *c)
            .collect()
    }

    /// Is `consumer` registered for `sa_type`?
    pub fn is_registered(&self, consumer: ConsumerId, sa_type: SaType) -> bool {
        self.entries.contains(&(sa_type, consumer))
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the directory empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicates() {
        let mut dir = RegistrationDirectory::new();
        dir.register(ConsumerId(1), SaType::Esp).unwrap();
        assert_eq!(
            dir.register(ConsumerId(1), SaType::Esp),
            Err(SaError::AlreadyExists)
        );
        dir.register(ConsumerId(1), SaType::Ah).unwrap();
        dir.register(ConsumerId(2), SaType::Esp).unwrap();

        assert_eq!(
            dir.consumers_for(SaType::Esp),
            [ConsumerId(1), ConsumerId(2)]
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut dir = RegistrationDirectory::new();
        dir.register(ConsumerId(1), SaType::Esp).unwrap();
        dir.register(ConsumerId(1), SaType::Ah).unwrap();
        dir.register(ConsumerId(2), SaType::Ah).unwrap();

        assert_eq!(dir.unregister(ConsumerId(1), Some(SaType::Esp)), 1);
        assert_eq!(dir.unregister(ConsumerId(1), Some(SaType::Esp)), 0);
        assert_eq!(dir.unregister(ConsumerId(1), None), 1);
        assert_eq!(dir.unregister(ConsumerId(1), None), 0);
        assert!(dir.is_registered(ConsumerId(2), SaType::Ah));
        assert_eq!(dir.len(), 1);
    }
}
