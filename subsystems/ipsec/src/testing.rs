//! Deterministic collaborators for unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::IpAddr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::RegistryConfig;
use crate::directory::ConsumerId;
use crate::message::KeyMessage;
use crate::registry::SaRegistry;
use crate::transport::{Clock, Collaborators, KeyTransport, LocalAddressTable, SpiSource};

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Move time forward
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Fixed set of local addresses
#[derive(Debug, Default)]
pub struct StaticLocalTable {
    addrs: Vec<IpAddr>,
}

impl StaticLocalTable {
    /// Table holding `addrs`
    pub fn new(addrs: &[IpAddr]) -> Self {
        Self {
            addrs: addrs.to_vec(),
        }
    }
}

impl LocalAddressTable for StaticLocalTable {
    fn is_local(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(addr)
    }
}

/// Transport that records every delivery
#[derive(Debug)]
pub struct RecordingTransport {
    accepting: AtomicBool,
    acquires: Mutex<Vec<(ConsumerId, KeyMessage)>>,
    dumps: Mutex<Vec<(ConsumerId, KeyMessage)>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            acquires: Mutex::new(Vec::new()),
            dumps: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingTransport {
    /// Make deliveries succeed or fail
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Delivered ACQUIRE messages
    pub fn acquires(&self) -> Vec<(ConsumerId, KeyMessage)> {
        self.acquires.lock().clone()
    }

    /// Delivered DUMP messages
    pub fn dumps(&self) -> Vec<(ConsumerId, KeyMessage)> {
        self.dumps.lock().clone()
    }
}

impl KeyTransport for RecordingTransport {
    fn deliver_acquire(&self, consumer: ConsumerId, message: &KeyMessage) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.acquires.lock().push((consumer, message.clone()));
        true
    }

    fn deliver_dump(&self, consumer: ConsumerId, message: &KeyMessage) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }
        self.dumps.lock().push((consumer, message.clone()));
        true
    }
}

/// Replays a fixed list of values; counts upward when the list is empty
#[derive(Debug, Default)]
pub struct SequenceSpiSource {
    values: Vec<u32>,
    next: AtomicUsize,
}

impl SequenceSpiSource {
    /// Source cycling through `values`
    pub fn new(values: &[u32]) -> Self {
        Self {
            values: values.to_vec(),
            next: AtomicUsize::new(0),
        }
    }
}

impl SpiSource for SequenceSpiSource {
    fn next_u32(&self) -> u32 {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        if self.values.is_empty() {
            i as u32
        } else {
            self.values[i % self.values.len()]
        }
    }
}

/// One set of fakes wired into registries
#[derive(Debug)]
pub struct Fixture {
    /// Time source
    pub clock: Arc<ManualClock>,
    /// Local addresses
    pub local: Arc<StaticLocalTable>,
    /// Delivery log
    pub transport: Arc<RecordingTransport>,
    /// SPI draws
    pub spi: Arc<SequenceSpiSource>,
}

impl Fixture {
    /// No local addresses, counting SPI source
    pub fn new() -> Self {
        Self::build(&[], &[])
    }

    /// Fixture with these local addresses
    pub fn with_local(addrs: &[IpAddr]) -> Self {
        Self::build(addrs, &[])
    }

    /// Fixture drawing these SPI values
    pub fn with_spis(values: &[u32]) -> Self {
        Self::build(&[], values)
    }

    fn build(addrs: &[IpAddr], spis: &[u32]) -> Self {
        Self {
            clock: Arc::new(ManualClock::default()),
            local: Arc::new(StaticLocalTable::new(addrs)),
            transport: Arc::new(RecordingTransport::default()),
            spi: Arc::new(SequenceSpiSource::new(spis)),
        }
    }

    /// Collaborator set sharing this fixture's fakes
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            local: self.local.clone(),
            transport: self.transport.clone(),
            clock: self.clock.clone(),
            spi: self.spi.clone(),
        }
    }

    /// Registry with the default configuration
    pub fn registry(&self) -> SaRegistry {
        self.registry_with(RegistryConfig::default())
    }

    /// Registry with `config`
    pub fn registry_with(&self, config: RegistryConfig) -> SaRegistry {
        SaRegistry::new(config, self.collaborators()).unwrap()
    }
}
