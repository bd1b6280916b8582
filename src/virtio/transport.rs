//! Transport core for legacy virtio-over-PCI.
//!
//! Owns the PCI handle and the BAR-1 register window, walks the device
//! status machine, negotiates features, discovers virtqueues and routes
//! doorbells. Device drivers embed one [`VirtioTransport`] and drive it
//! in the attach order the ABI requires: acknowledge, negotiate, discover,
//! then `DRIVER_OK`.

use bitflags::bitflags;
use std::sync::Arc;

use crate::bus::pci::{PciDevice, RegisterWindow};
use crate::sched::WaitCell;
use crate::virtio::queue::{QueueError, Virtqueue, VirtqueueFactory};
use crate::virtio::{device_id, pci_config, ring_features, VIRTIO_PCI_ABI_VERSION};
use crate::virtio::{MAX_VIRTQUEUES, VIRTIO_VENDOR_ID};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FAILED = 128;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NotVirtio { vendor: u16 },
    Bar1Missing,
    WrongAbiVersion(u8),
    DeviceIdOutOfRange(u16),
    MsixBindingFailed(u16),
    Queue(QueueError),
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotVirtio { vendor } => write!(f, "vendor {vendor:#06x} is not virtio"),
            Self::Bar1Missing => write!(f, "BAR-1 register window absent"),
            Self::WrongAbiVersion(rev) => write!(f, "wrong virtio revision {rev:#x}"),
            Self::DeviceIdOutOfRange(id) => write!(f, "wrong virtio device id {id:#x}"),
            Self::MsixBindingFailed(queue) => {
                write!(f, "MSI-X entry for queue {queue} did not stick")
            }
            Self::Queue(err) => write!(f, "virtqueue setup: {err}"),
        }
    }
}

impl From<QueueError> for TransportError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

pub struct VirtioTransport<T> {
    dev: Arc<dyn PciDevice>,
    bar1: Arc<dyn RegisterWindow>,
    msix: bool,
    queues: Vec<Arc<dyn Virtqueue<T>>>,
    guest_features: u32,
    cap_indirect_buf: bool,
    cap_event_idx: bool,
}

impl<T> std::fmt::Debug for VirtioTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtioTransport")
            .field("msix", &self.msix)
            .field("guest_features", &self.guest_features)
            .field("cap_indirect_buf", &self.cap_indirect_buf)
            .field("cap_event_idx", &self.cap_event_idx)
            .field("queues", &self.queues.len())
            .finish()
    }
}

impl<T> VirtioTransport<T> {
    /// Bind the transport: validate the function, enable bus mastering
    /// and MSI-X, reset the device and acknowledge it.
    ///
    /// Failures leave no state behind; the caller logs and walks away.
    pub fn attach(dev: Arc<dyn PciDevice>) -> Result<Self, TransportError> {
        let bar1 = Self::parse_pci_config(&dev)?;

        dev.set_bus_master(true);
        let msix = dev.msix_enable();

        let transport = Self {
            dev,
            bar1,
            msix,
            queues: Vec::new(),
            guest_features: 0,
            cap_indirect_buf: false,
            cap_event_idx: false,
        };

        // Make sure the host side is reset before acknowledging.
        transport.reset();
        transport.add_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);

        Ok(transport)
    }

    fn parse_pci_config(dev: &Arc<dyn PciDevice>) -> Result<Arc<dyn RegisterWindow>, TransportError> {
        let vendor = dev.vendor_id();
        if vendor != VIRTIO_VENDOR_ID {
            return Err(TransportError::NotVirtio { vendor });
        }

        let bar1 = dev.bar(1).ok_or(TransportError::Bar1Missing)?;

        let rev = dev.revision_id();
        if rev != VIRTIO_PCI_ABI_VERSION {
            log::error!(target: "virtio", "wrong virtio revision={rev:#x}");
            return Err(TransportError::WrongAbiVersion(rev));
        }

        let id = dev.device_id();
        if !(device_id::MIN..=device_id::MAX).contains(&id) {
            log::error!(target: "virtio", "wrong virtio dev id {id:#x}");
            return Err(TransportError::DeviceIdOutOfRange(id));
        }

        Ok(bar1)
    }

    pub fn is_msix(&self) -> bool {
        self.msix
    }

    pub fn pci_device(&self) -> &Arc<dyn PciDevice> {
        &self.dev
    }

    // Register window helpers.

    pub fn read_u8(&self, offset: u32) -> u8 {
        self.bar1.read_u8(offset)
    }

    pub fn read_u16(&self, offset: u32) -> u16 {
        self.bar1.read_u16(offset)
    }

    pub fn read_u32(&self, offset: u32) -> u32 {
        self.bar1.read_u32(offset)
    }

    pub fn write_u8(&self, offset: u32, value: u8) {
        self.bar1.write_u8(offset, value);
    }

    pub fn write_u16(&self, offset: u32, value: u16) {
        self.bar1.write_u16(offset, value);
    }

    pub fn write_u32(&self, offset: u32, value: u32) {
        self.bar1.write_u32(offset, value);
    }

    /// Start of the device-specific config area; it moves when the MSI-X
    /// vector registers are present.
    pub fn config_offset(&self) -> u32 {
        if self.msix {
            pci_config::CONFIG_MSIX
        } else {
            pci_config::CONFIG
        }
    }

    /// Byte-wise read of the device-specific config area.
    pub fn config_read(&self, offset: u32, out: &mut [u8]) {
        let base = self.config_offset() + offset;
        for (index, byte) in out.iter_mut().enumerate() {
            *byte = self.bar1.read_u8(base + index as u32);
        }
    }

    pub fn config_write(&self, offset: u32, data: &[u8]) {
        let base = self.config_offset() + offset;
        for (index, byte) in data.iter().enumerate() {
            self.bar1.write_u8(base + index as u32, *byte);
        }
    }

    // Feature negotiation.

    pub fn device_features(&self) -> u32 {
        self.read_u32(pci_config::HOST_FEATURES)
    }

    /// Base feature mask every driver requests on top of its own bits.
    pub fn base_driver_features() -> u32 {
        ring_features::INDIRECT_DESC | ring_features::EVENT_IDX
    }

    /// Negotiate: intersect what the host offers with what the driver
    /// wants, publish the result to the device (exactly once, before
    /// `DRIVER_OK`) and cache it. Returns the negotiated mask.
    pub fn setup_features(&mut self, driver_features: u32) -> u32 {
        let device_features = self.device_features();
        let subset = device_features & driver_features;

        for bit in 0..32 {
            if subset & (1 << bit) != 0 {
                log::debug!(target: "virtio", "feature intersection bit {bit}");
            }
        }

        self.cap_indirect_buf = subset & ring_features::INDIRECT_DESC != 0;
        self.cap_event_idx = subset & ring_features::EVENT_IDX != 0;

        self.write_u32(pci_config::GUEST_FEATURES, subset);
        self.guest_features = subset;
        subset
    }

    pub fn guest_features(&self) -> u32 {
        self.guest_features
    }

    pub fn guest_feature_bit(&self, mask: u32) -> bool {
        self.guest_features & mask != 0
    }

    pub fn device_feature_bit(&self, bit: u32) -> bool {
        self.config_bit(pci_config::HOST_FEATURES, bit)
    }

    /// Single-bit read of a 32-bit register.
    pub fn config_bit(&self, offset: u32, bit: u32) -> bool {
        self.read_u32(offset) & (1 << bit) != 0
    }

    /// Single-bit read-modify-write of a 32-bit register.
    pub fn set_config_bit(&self, offset: u32, bit: u32, on: bool) {
        let value = self.read_u32(offset);
        let updated = (value & !(1 << bit)) | ((on as u32) << bit);
        self.write_u32(offset, updated);
    }

    pub fn cap_indirect_buf(&self) -> bool {
        self.cap_indirect_buf
    }

    pub fn cap_event_idx(&self) -> bool {
        self.cap_event_idx
    }

    // Device status machine.

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.read_u8(pci_config::STATUS))
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.write_u8(pci_config::STATUS, status.bits());
    }

    pub fn add_status(&self, status: DeviceStatus) {
        let current = self.status();
        if current.contains(DeviceStatus::FAILED) {
            // FAILED is terminal.
            return;
        }
        self.set_status(current | status);
    }

    pub fn del_status(&self, status: DeviceStatus) {
        self.set_status(self.status() - status);
    }

    /// Write status 0: full device reset.
    pub fn reset(&self) {
        self.set_status(DeviceStatus::empty());
    }

    pub fn fail(&self) {
        self.set_status(DeviceStatus::FAILED);
    }

    // Queue discovery and doorbells.

    /// Walk queue-select indices until the device reports size zero, the
    /// compile-time cap, or `limit` queues exist. Each discovered queue is
    /// bound to the matching MSI-X entry (when enabled) and its ring
    /// address is published to the device.
    pub fn probe_virt_queues(
        &mut self,
        factory: &mut dyn VirtqueueFactory<T>,
        limit: usize,
    ) -> Result<(), TransportError> {
        loop {
            if self.queues.len() >= MAX_VIRTQUEUES {
                return Ok(());
            }

            let index = self.queues.len() as u16;
            self.write_u16(pci_config::QUEUE_SEL, index);
            let size = self.read_u16(pci_config::QUEUE_NUM);
            if size == 0 {
                return Ok(());
            }

            let queue = factory.create(index, size)?;

            if self.msix {
                // queue_id:entry_id correlate 1:1.
                self.write_u16(pci_config::MSI_QUEUE_VECTOR, index);
                if self.read_u16(pci_config::MSI_QUEUE_VECTOR) != index {
                    log::error!(target: "virtio", "setting MSI-X entry for queue {index} failed");
                    return Err(TransportError::MsixBindingFailed(index));
                }
            }

            let pfn = (queue.physical_address() >> pci_config::QUEUE_ADDR_SHIFT) as u32;
            self.write_u32(pci_config::QUEUE_PFN, pfn);

            log::debug!(
                target: "virtio",
                "queue[{index}] -> size {size}, paddr {:#x}",
                queue.physical_address()
            );

            self.queues.push(queue);

            if self.queues.len() >= limit {
                return Ok(());
            }
        }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn get_virt_queue(&self, index: usize) -> Option<Arc<dyn Virtqueue<T>>> {
        self.queues.get(index).cloned()
    }

    /// Doorbell: tell the host the available ring for `queue` has news.
    pub fn kick(&self, queue: usize) {
        self.write_u16(pci_config::QUEUE_NOTIFY, queue as u16);
    }

    /// Read-to-clear interrupt status, legacy scheme only.
    pub fn read_isr(&self) -> u8 {
        self.read_u8(pci_config::ISR)
    }
}

impl<T> Drop for VirtioTransport<T> {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Block until `pred` holds for `queue`, arming the queue interrupt while
/// asleep.
///
/// The predicate is re-evaluated after enabling interrupts: a completion
/// that lands between the first check and the enable would otherwise be
/// missed, and its interrupt suppressed, leaving the waiter stuck.
pub fn wait_for_queue<T>(
    queue: &dyn Virtqueue<T>,
    wait: &WaitCell,
    pred: impl Fn(&dyn Virtqueue<T>) -> bool,
) {
    loop {
        let epoch = wait.epoch();

        if pred(queue) {
            return;
        }

        queue.enable_interrupts();
        if pred(queue) {
            queue.disable_interrupts();
            return;
        }

        wait.wait_since(epoch);
    }
}
