//! Test doubles for the platform seams: a legacy-register PCI function,
//! an interrupt controller that lets tests fire vectors by hand, a token
//! virtqueue, and a fixed CPU topology.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::bus::irq::{InterruptController, MsixBinding};
use crate::bus::pci::{PciDevice, RegisterWindow};
use crate::sched::{lock, CpuTopology};
use crate::virtio::pci_config;
use crate::virtio::queue::{
    Completion, QueueError, Rejected, SgList, Virtqueue, VirtqueueFactory,
};

// ---------------------------------------------------------------- MockPci

#[derive(Default)]
pub struct MockRegs {
    pub host_features: u32,
    pub guest_features: u32,
    pub guest_feature_writes: u32,
    pub status: u8,
    pub queue_sel: u16,
    pub queue_sizes: Vec<u16>,
    pub queue_pfns: Vec<u32>,
    pub notifies: Vec<u16>,
    pub msi_queue_vector: u16,
    pub reject_msix_vectors: bool,
    pub isr_script: VecDeque<u8>,
    pub config: Vec<u8>,
    pub config_base: u32,
}

pub struct MockPci {
    device_id: u16,
    vendor_id: u16,
    revision: u8,
    interrupt_line: u8,
    bar1_present: bool,
    msix: bool,
    bus_master: AtomicBool,
    regs: Arc<MockWindow>,
}

pub struct MockPciBuilder {
    device_id: u16,
    vendor_id: u16,
    revision: u8,
    msix: bool,
    bar1_present: bool,
    host_features: u32,
    queue_sizes: Vec<u16>,
    reject_msix_vectors: bool,
    isr_script: VecDeque<u8>,
    config: Vec<u8>,
}

impl MockPci {
    pub fn builder() -> MockPciBuilder {
        MockPciBuilder {
            device_id: crate::virtio::device_id::NET,
            vendor_id: crate::virtio::VIRTIO_VENDOR_ID,
            revision: 0,
            msix: false,
            bar1_present: true,
            host_features: 0,
            queue_sizes: Vec::new(),
            reject_msix_vectors: false,
            isr_script: VecDeque::new(),
            config: Vec::new(),
        }
    }

    pub fn regs(&self) -> MutexGuard<'_, MockRegs> {
        lock(&self.regs.regs)
    }

    pub fn bus_master(&self) -> bool {
        self.bus_master.load(Ordering::SeqCst)
    }

    pub fn push_isr(&self, value: u8) {
        self.regs().isr_script.push_back(value);
    }
}

impl MockPciBuilder {
    pub fn device_id(mut self, id: u16) -> Self {
        self.device_id = id;
        self
    }

    pub fn vendor_id(mut self, id: u16) -> Self {
        self.vendor_id = id;
        self
    }

    pub fn revision(mut self, rev: u8) -> Self {
        self.revision = rev;
        self
    }

    pub fn msix(mut self, enabled: bool) -> Self {
        self.msix = enabled;
        self
    }

    pub fn without_bar1(mut self) -> Self {
        self.bar1_present = false;
        self
    }

    pub fn host_features(mut self, features: u32) -> Self {
        self.host_features = features;
        self
    }

    pub fn queue_sizes(mut self, sizes: &[u16]) -> Self {
        self.queue_sizes = sizes.to_vec();
        self
    }

    pub fn reject_msix_vectors(mut self) -> Self {
        self.reject_msix_vectors = true;
        self
    }

    pub fn config(mut self, bytes: &[u8]) -> Self {
        self.config = bytes.to_vec();
        self
    }

    pub fn build(self) -> Arc<MockPci> {
        let config_base = if self.msix {
            pci_config::CONFIG_MSIX
        } else {
            pci_config::CONFIG
        };
        let regs = Arc::new(MockWindow {
            regs: Mutex::new(MockRegs {
                host_features: self.host_features,
                queue_sizes: self.queue_sizes,
                reject_msix_vectors: self.reject_msix_vectors,
                isr_script: self.isr_script,
                config: self.config,
                config_base,
                ..MockRegs::default()
            }),
        });
        Arc::new(MockPci {
            device_id: self.device_id,
            vendor_id: self.vendor_id,
            revision: self.revision,
            interrupt_line: 11,
            bar1_present: self.bar1_present,
            msix: self.msix,
            bus_master: AtomicBool::new(false),
            regs,
        })
    }
}

impl PciDevice for MockPci {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn device_id(&self) -> u16 {
        self.device_id
    }

    fn revision_id(&self) -> u8 {
        self.revision
    }

    fn interrupt_line(&self) -> u8 {
        self.interrupt_line
    }

    fn bar(&self, index: u8) -> Option<Arc<dyn RegisterWindow>> {
        if index == 1 && self.bar1_present {
            Some(self.regs.clone())
        } else {
            None
        }
    }

    fn set_bus_master(&self, enabled: bool) {
        self.bus_master.store(enabled, Ordering::SeqCst);
    }

    fn msix_enable(&self) -> bool {
        self.msix
    }

    fn is_msix(&self) -> bool {
        self.msix
    }
}

pub struct MockWindow {
    regs: Mutex<MockRegs>,
}

impl RegisterWindow for MockWindow {
    fn read_u8(&self, offset: u32) -> u8 {
        let mut regs = lock(&self.regs);
        match offset {
            pci_config::STATUS => regs.status,
            pci_config::ISR => regs.isr_script.pop_front().unwrap_or(0),
            _ if offset >= regs.config_base => {
                let index = (offset - regs.config_base) as usize;
                regs.config.get(index).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn read_u16(&self, offset: u32) -> u16 {
        let regs = lock(&self.regs);
        match offset {
            pci_config::QUEUE_NUM => {
                let sel = regs.queue_sel as usize;
                regs.queue_sizes.get(sel).copied().unwrap_or(0)
            }
            pci_config::MSI_QUEUE_VECTOR => {
                if regs.reject_msix_vectors {
                    0xffff
                } else {
                    regs.msi_queue_vector
                }
            }
            _ => 0,
        }
    }

    fn read_u32(&self, offset: u32) -> u32 {
        let regs = lock(&self.regs);
        match offset {
            pci_config::HOST_FEATURES => regs.host_features,
            pci_config::GUEST_FEATURES => regs.guest_features,
            _ => 0,
        }
    }

    fn write_u8(&self, offset: u32, value: u8) {
        let mut regs = lock(&self.regs);
        if offset == pci_config::STATUS {
            regs.status = value;
        }
    }

    fn write_u16(&self, offset: u32, value: u16) {
        let mut regs = lock(&self.regs);
        match offset {
            pci_config::QUEUE_SEL => regs.queue_sel = value,
            pci_config::QUEUE_NOTIFY => regs.notifies.push(value),
            pci_config::MSI_QUEUE_VECTOR => regs.msi_queue_vector = value,
            _ => {}
        }
    }

    fn write_u32(&self, offset: u32, value: u32) {
        let mut regs = lock(&self.regs);
        match offset {
            pci_config::GUEST_FEATURES => {
                regs.guest_features = value;
                regs.guest_feature_writes += 1;
            }
            pci_config::QUEUE_PFN => regs.queue_pfns.push(value),
            _ => {}
        }
    }
}

// --------------------------------------------------------------- MockIntc

struct LegacyRegistration {
    ack: Box<dyn Fn() -> bool + Send + Sync>,
    handler: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
pub struct MockIntc {
    msix: Mutex<Vec<MsixBinding>>,
    legacy: Mutex<Option<LegacyRegistration>>,
}

impl MockIntc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn msix_entries(&self) -> Vec<u16> {
        lock(&self.msix).iter().map(|b| b.entry).collect()
    }

    pub fn has_legacy(&self) -> bool {
        lock(&self.legacy).is_some()
    }

    /// Deliver the MSI-X vector `entry`: ack, then wake.
    pub fn fire_msix(&self, entry: u16) {
        let bindings = lock(&self.msix);
        for binding in bindings.iter().filter(|b| b.entry == entry) {
            if let Some(ack) = &binding.ack {
                ack();
            }
            if let Some(wake) = &binding.wake {
                wake.wake();
            }
        }
    }

    /// Raise the shared legacy line. Returns what the ack claimed.
    pub fn fire_legacy(&self) -> bool {
        let guard = lock(&self.legacy);
        let Some(reg) = &*guard else {
            return false;
        };
        let claimed = (reg.ack)();
        if claimed {
            (reg.handler)();
        }
        claimed
    }
}

impl InterruptController for MockIntc {
    fn register_msix(&self, bindings: Vec<MsixBinding>) {
        lock(&self.msix).extend(bindings);
    }

    fn register_legacy(
        &self,
        _line: u8,
        ack: Box<dyn Fn() -> bool + Send + Sync>,
        handler: Box<dyn Fn() + Send + Sync>,
    ) {
        *lock(&self.legacy) = Some(LegacyRegistration { ack, handler });
    }
}

// -------------------------------------------------------------- MockQueue

struct Pending<T> {
    token: T,
    descs: usize,
}

struct Ready<T> {
    token: T,
    len: u32,
    descs: usize,
}

struct QueueState<T> {
    in_flight: VecDeque<Pending<T>>,
    used: VecDeque<Ready<T>>,
    awaiting_finalize: VecDeque<usize>,
    free_descs: usize,
    staged_on_enable: Vec<(T, u32)>,
    finalized: u64,
    gc_dropped: u64,
}

pub struct MockQueue<T> {
    size: u16,
    paddr: u64,
    interrupts: AtomicBool,
    state: Mutex<QueueState<T>>,
}

impl<T: Send> MockQueue<T> {
    pub fn with_capacity(descs: usize) -> Arc<Self> {
        Self::with_capacity_at(descs, 0, 0x10_0000)
    }

    fn with_capacity_at(descs: usize, index: u16, paddr: u64) -> Arc<Self> {
        Arc::new(Self {
            size: descs as u16,
            paddr: paddr + (index as u64) * 0x1_0000,
            interrupts: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                in_flight: VecDeque::new(),
                used: VecDeque::new(),
                awaiting_finalize: VecDeque::new(),
                free_descs: descs,
                staged_on_enable: Vec::new(),
                finalized: 0,
                gc_dropped: 0,
            }),
        })
    }

    /// Host-side completion of the oldest in-flight buffer, with a chance
    /// to write into the token first. Returns false when nothing is in
    /// flight.
    pub fn complete_in_flight_with(&self, f: impl FnOnce(&mut T) -> u32) -> bool {
        let mut state = lock(&self.state);
        let Some(mut pending) = state.in_flight.pop_front() else {
            return false;
        };
        let len = f(&mut pending.token);
        state.used.push_back(Ready {
            token: pending.token,
            len,
            descs: pending.descs,
        });
        true
    }

    pub fn complete_in_flight(&self, len: u32) -> bool {
        self.complete_in_flight_with(|_| len)
    }

    /// Drop a used-ring entry directly, bypassing `add_buf` accounting.
    pub fn push_ready(&self, token: T, len: u32) {
        let mut state = lock(&self.state);
        state.used.push_back(Ready {
            token,
            len,
            descs: 0,
        });
    }

    /// Stage a completion that only appears once interrupts are enabled,
    /// emulating a device racing the interrupt-arming window.
    pub fn complete_on_enable(&self, token: T, len: u32) {
        lock(&self.state).staged_on_enable.push((token, len));
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    pub fn free_descs(&self) -> usize {
        lock(&self.state).free_descs
    }

    pub fn finalized(&self) -> u64 {
        lock(&self.state).finalized
    }

    pub fn gc_dropped(&self) -> u64 {
        lock(&self.state).gc_dropped
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl<T: Send> Virtqueue<T> for MockQueue<T> {
    fn size(&self) -> u16 {
        self.size
    }

    fn physical_address(&self) -> u64 {
        self.paddr
    }

    fn add_buf(&self, sg: &SgList, token: T) -> Result<(), Rejected<T>> {
        let mut state = lock(&self.state);
        let descs = sg.len();
        if state.free_descs < descs {
            return Err(Rejected { token });
        }
        state.free_descs -= descs;
        state.in_flight.push_back(Pending { token, descs });
        Ok(())
    }

    fn get_buf_elem(&self) -> Option<Completion<T>> {
        let mut state = lock(&self.state);
        let ready = state.used.pop_front()?;
        state.awaiting_finalize.push_back(ready.descs);
        Some(Completion {
            token: ready.token,
            len: ready.len,
        })
    }

    fn get_buf_finalize(&self) {
        let mut state = lock(&self.state);
        if let Some(descs) = state.awaiting_finalize.pop_front() {
            state.free_descs += descs;
            state.finalized += 1;
        }
    }

    fn get_buf_gc(&self) {
        let mut state = lock(&self.state);
        while let Some(ready) = state.used.pop_front() {
            state.free_descs += ready.descs;
            state.gc_dropped += 1;
        }
    }

    fn avail_ring_has_room(&self, descriptors: usize) -> bool {
        lock(&self.state).free_descs >= descriptors
    }

    fn avail_ring_not_empty(&self) -> bool {
        lock(&self.state).free_descs > 0
    }

    fn used_ring_not_empty(&self) -> bool {
        !lock(&self.state).used.is_empty()
    }

    fn used_ring_can_gc(&self) -> bool {
        !lock(&self.state).used.is_empty()
    }

    fn refill_ring_cond(&self) -> bool {
        lock(&self.state).free_descs > 0
    }

    fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
        let mut state = lock(&self.state);
        for (token, len) in state.staged_on_enable.drain(..).collect::<Vec<_>>() {
            state.used.push_back(Ready {
                token,
                len,
                descs: 0,
            });
        }
    }

    fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }
}

// ------------------------------------------------------------- MockFactory

/// Factory creating [`MockQueue`]s and remembering them for the test.
pub struct MockFactory<T> {
    pub created: Vec<Arc<MockQueue<T>>>,
    capacity_override: Option<usize>,
}

impl<T> Default for MockFactory<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            capacity_override: None,
        }
    }
}

impl<T: Send> MockFactory<T> {
    /// Create rings with `descs` descriptors regardless of the size the
    /// device reports; lets tests force tiny rings.
    pub fn with_ring_capacity(descs: usize) -> Self {
        Self {
            created: Vec::new(),
            capacity_override: Some(descs),
        }
    }

    pub fn queue(&self, index: usize) -> Arc<MockQueue<T>> {
        self.created[index].clone()
    }
}

impl<T: Send + 'static> VirtqueueFactory<T> for MockFactory<T> {
    fn create(&mut self, index: u16, size: u16) -> Result<Arc<dyn Virtqueue<T>>, QueueError> {
        if size == 0 {
            return Err(QueueError::InvalidSize(size));
        }
        let descs = self.capacity_override.unwrap_or(size as usize);
        let queue = MockQueue::with_capacity_at(descs, index, 0x10_0000);
        self.created.push(queue.clone());
        Ok(queue)
    }
}

// --------------------------------------------------------------- FixedCpus

/// Deterministic topology: a fixed CPU count and a settable current CPU.
pub struct FixedCpus {
    count: usize,
    current: AtomicUsize,
}

impl FixedCpus {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            count,
            current: AtomicUsize::new(0),
        })
    }

    pub fn set_current(&self, cpu: usize) {
        self.current.store(cpu, Ordering::SeqCst);
    }
}

impl CpuTopology for FixedCpus {
    fn count(&self) -> usize {
        self.count
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn spawn_pinned(
        &self,
        _cpu: usize,
        name: &str,
        body: Box<dyn FnOnce() + Send>,
    ) -> io::Result<JoinHandle<()>> {
        self.spawn(name, body)
    }

    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name.into()).spawn(body)
    }
}
