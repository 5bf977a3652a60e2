//! # Flow Binding Index
//!
//! Opaque flow handle → the association currently protecting that flow.
//! The association keeps the reverse link in `bound_flows`, which is what
//! makes owner-wide release cheap.

use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;

use crate::error::{SaError, SaResult};
use crate::sa::SaHandle;

// =============================================================================
// HANDLES
// =============================================================================

/// Flow-owning context (a connection endpoint, a socket)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowOwner(pub u64);

/// Opaque identifier of one traffic flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowHandle {
    /// Context the flow belongs to
    pub owner: FlowOwner,
    /// Flow number within the owner
    pub id: u64,
}

impl FlowHandle {
    /// Create a flow handle
    pub const fn new(owner: FlowOwner, id: u64) -> Self {
        Self { owner, id }
    }
}

impl fmt::Display for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow {}:{}", self.owner.0, self.id)
    }
}

// =============================================================================
// BINDING TABLE
// =============================================================================

/// A flow's grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowBinding {
    /// Bound association
    pub sa: SaHandle,
    /// Granted with `require_unique`
    pub unique: bool,
}

/// Flow → association bindings
#[derive(Debug, Default)]
pub struct FlowTable {
    bindings: HashMap<FlowHandle, FlowBinding>,
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with room for `capacity` flows
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bindings: HashMap::with_capacity(capacity),
        }
    }

    /// Record a grant; a flow holds at most one association
    pub fn bind(&mut self, flow: FlowHandle, binding: FlowBinding) -> SaResult<()> {
        if self.bindings.contains_key(&flow) {
            return Err(SaError::AlreadyExists);
        }
        self.bindings
            .try_reserve(1)
            .map_err(|_| SaError::OutOfResources)?;
        self.bindings.insert(flow, binding);
        Ok(())
    }

    /// Current grant for `flow`
    pub fn get(&self, flow: &FlowHandle) -> Option<FlowBinding> {
        self.bindings.get(flow).copied()
    }

    /// Drop the grant for `flow`
    pub fn unbind(&mut self, flow: &FlowHandle) -> Option<FlowBinding> {
        self.bindings.remove(flow)
    }

    /// All flows of one owner
    pub fn flows_of(&self, owner: FlowOwner) -> Vec<FlowHandle> {
        self.bindings
            .keys()
            .filter(|flow| flow.owner == owner)
            .copied()
            .collect()
    }

    /// Every bound flow
    pub fn flows(&self) -> Vec<FlowHandle> {
        self.bindings.keys().copied().collect()
    }

    /// Number of bound flows
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_once_per_flow() {
        let mut table = FlowTable::new();
        let flow = FlowHandle::new(FlowOwner(1), 1);
        let binding = FlowBinding {
            sa: SaHandle::new(0, 0),
            unique: false,
        };

        table.bind(flow, binding).unwrap();
        assert_eq!(table.bind(flow, binding), Err(SaError::AlreadyExists));
        assert_eq!(table.get(&flow), Some(binding));
        assert_eq!(table.unbind(&flow), Some(binding));
        assert!(table.is_empty());
    }

    #[test]
    fn test_flows_of_owner() {
        let mut table = FlowTable::new();
        let binding = FlowBinding {
            sa: SaHandle::new(3, 1),
            unique: false,
        };
        for id in 0..3 {
            table.bind(FlowHandle::new(FlowOwner(7), id), binding).unwrap();
        }
        table.bind(FlowHandle::new(FlowOwner(8), 0), binding).unwrap();

        assert_eq!(table.flows_of(FlowOwner(7)).len(), 3);
        assert_eq!(table.flows_of(FlowOwner(9)).len(), 0);
        assert_eq!(table.flows().len(), 4);
    }
}
