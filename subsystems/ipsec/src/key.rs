//! # Keyed Index
//!
//! Hash-bucketed, chained lookup structure shared by the store, the
//! allocation index and the acquire coordinator.
//!
//! ```text
//!   SaKey / PairKey / DestKey
//!            │ Hash (structural, address payload only)
//!            ▼
//!   ┌──────────────┐     chain (oldest ──▶ newest)
//!   │ bucket  key  │──▶ [ v0 ][ v1 ][ v2 ]
//!   ├──────────────┤                  ▲
//!   │ bucket  key  │──▶ [ v0 ]        └── examined first
//!   └──────────────┘
//! ```
//!
//! Keys are composite value types: two keys are equal iff their association
//! type, address payloads (and SPI, where present) are equal. Sockaddr
//! padding, ports and scope identifiers never reach a key.

use alloc::vec::Vec;
use core::hash::Hash;
use core::net::IpAddr;

use hashbrown::HashMap;

use crate::error::{SaError, SaResult};
use crate::sa::SaType;

// =============================================================================
// COMPOSITE KEYS
// =============================================================================

/// Full association identity: (type, src, dst, spi)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaKey {
    /// Association type
    pub sa_type: SaType,
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Security parameter index
    pub spi: u32,
}

impl SaKey {
    /// Create a new identity
    pub const fn new(sa_type: SaType, src: IpAddr, dst: IpAddr, spi: u32) -> Self {
        Self {
            sa_type,
            src,
            dst,
            spi,
        }
    }

    /// Allocation key (identity without the SPI)
    pub const fn pair(&self) -> PairKey {
        PairKey {
            sa_type: self.sa_type,
            src: self.src,
            dst: self.dst,
        }
    }

    /// Acquire key (type and destination)
    pub const fn dest(&self) -> DestKey {
        DestKey {
            sa_type: self.sa_type,
            dst: self.dst,
        }
    }
}

/// Allocation key: (type, src, dst)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    /// Association type
    pub sa_type: SaType,
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
}

impl PairKey {
    /// Create a new allocation key
    pub const fn new(sa_type: SaType, src: IpAddr, dst: IpAddr) -> Self {
        Self { sa_type, src, dst }
    }
}

/// Acquire key: (type, dst)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestKey {
    /// Association type
    pub sa_type: SaType,
    /// Destination address
    pub dst: IpAddr,
}

impl DestKey {
    /// Create a new acquire key
    pub const fn new(sa_type: SaType, dst: IpAddr) -> Self {
        Self { sa_type, dst }
    }
}

// =============================================================================
// KEYED INDEX
// =============================================================================

/// Chained multimap with newest-first lookup
#[derive(Debug)]
pub struct KeyedIndex<K, V> {
    /// One chain per distinct key
    chains: HashMap<K, Vec<V>>,
    /// Total number of values
    len: usize,
}

impl<K: Hash + Eq + Copy, V> KeyedIndex<K, V> {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
            len: 0,
        }
    }

    /// Create an index with room for `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chains: HashMap::with_capacity(capacity),
            len: 0,
        }
    }

    /// Insert a value at the head of its key's chain
    pub fn insert(&mut self, key: K, value: V) -> SaResult<()> {
        if !self.chains.contains_key(&key) {
            self.chains
                .try_reserve(1)
                .map_err(|_| SaError::OutOfResources)?;
        }

        let chain = self.chains.entry(key).or_default();
        chain.try_reserve(1).map_err(|_| SaError::OutOfResources)?;
        chain.push(value);
        self.len += 1;
        Ok(())
    }

    /// Values stored under `key`, most recently inserted first
    pub fn chain(&self, key: &K) -> impl Iterator<Item = &V> + '_ {
        self.chains
            .get(key)
            .into_iter()
            .flat_map(|chain| chain.iter().rev())
    }

    /// First value under `key` matching `pred`, newest first
    pub fn find<F>(&self, key: &K, mut pred: F) -> Option<&V>
    where
        F: FnMut(&V) -> bool,
    {
        self.chain(key).find(|v| pred(v))
    }

    /// Mutable variant of [`KeyedIndex::find`]
    pub fn find_mut<F>(&mut self, key: &K, mut pred: F) -> Option<&mut V>
    where
        F: FnMut(&V) -> bool,
    {
        self.chains
            .get_mut(key)?
            .iter_mut()
            .rev()
            .find(|v| pred(v))
    }

    /// Whether any value under `key` matches `pred`
    pub fn contains<F>(&self, key: &K, pred: F) -> bool
    where
        F: FnMut(&V) -> bool,
    {
        self.find(key, pred).is_some()
    }

    /// Remove the newest value under `key` matching `pred`
    pub fn remove<F>(&mut self, key: &K, mut pred: F) -> Option<V>
    where
        F: FnMut(&V) -> bool,
    {
        let chain = self.chains.get_mut(key)?;
        let pos = chain.iter().rposition(|v| pred(v))?;
        let value = chain.remove(pos);
        if chain.is_empty() {
            self.chains.remove(key);
        }
        self.len -= 1;
        Some(value)
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.chains.len()
    }

    /// Iterate over every (key, value) pair in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        self.chains
            .iter()
            .flat_map(|(key, chain)| chain.iter().map(move |v| (key, v)))
    }

    /// Keep only the values for which `keep` returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = 0;
        self.chains.retain(|key, chain| {
            let before = chain.len();
            chain.retain(|v| keep(key, v));
            removed += before - chain.len();
            !chain.is_empty()
        });
        self.len -= removed;
    }
}

impl<K: Hash + Eq + Copy, V> Default for KeyedIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
