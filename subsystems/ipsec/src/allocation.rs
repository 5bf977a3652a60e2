//! # Allocation Index
//!
//! (type, src, dst) → associations a new flow may be handed. Only records
//! that are COMPLETE, not UNIQUE_PER_FLOW and outbound-eligible are listed.

use crate::error::SaResult;
use crate::key::{KeyedIndex, PairKey};
use crate::sa::SaHandle;

/// Non-owning index of shareable associations
#[derive(Debug, Default)]
pub struct AllocationIndex {
    index: KeyedIndex<PairKey, SaHandle>,
}

impl AllocationIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index with room for `capacity` address pairs
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: KeyedIndex::with_capacity(capacity),
        }
    }

    /// List `handle` as a candidate for `pair`
    pub fn register(&mut self, pair: PairKey, handle: SaHandle) -> SaResult<()> {
        self.index.insert(pair, handle)
    }

    /// Drop `handle` from `pair`; returns whether it was listed
    pub fn unregister(&mut self, pair: &PairKey, handle: SaHandle) -> bool {
        self.index.remove(pair, |h| *h == handle).is_some()
    }

    /// Is `handle` listed under `pair`?
    pub fn contains(&self, pair: &PairKey, handle: SaHandle) -> bool {
        self.index.contains(pair, |h| *h == handle)
    }

    /// Candidates for `pair`, most recently registered first
    pub fn candidates(&self, pair: &PairKey) -> impl Iterator<Item = SaHandle> + '_ {
        self.index.chain(pair).copied()
    }

    /// Number of listed handles
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use core::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::sa::SaType;

    #[test]
    fn test_register_unregister() {
        let pair = PairKey::new(
            SaType::Ah,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::BROADCAST),
        );
        let a = SaHandle::new(0, 0);
        let b = SaHandle::new(1, 0);

        let mut index = AllocationIndex::new();
        index.register(pair, a).unwrap();
        index.register(pair, b).unwrap();

        let order: alloc::vec::Vec<_> = index.candidates(&pair).collect();
        assert_eq!(order, [b, a]);

        assert!(index.unregister(&pair, a));
        assert!(!index.unregister(&pair, a));
        assert!(!index.contains(&pair, a));
        assert!(index.contains(&pair, b));
        assert_eq!(index.len(), 1);
    }
}
