//! Ethernet interface object shared between a driver and the stack above
//! it.
//!
//! The driver creates the [`Interface`], publishes capabilities on it and
//! keeps a strong reference; the upper stack registers its input and
//! fast-path hooks after attach. Administrative state (flags) and the
//! driver-running bit are atomics so the control path never contends with
//! the data path.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use smoltcp::wire::EthernetAddress;

use crate::mbuf::{CsumFlags, Mbuf};
use crate::sched::lock;

pub const ETHER_HDR_LEN: usize = 14;
pub const ETHER_VLAN_HDR_LEN: usize = 18;
pub const ETHERMTU: usize = 1500;

bitflags! {
    /// Administrative interface flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IfFlags: u32 {
        const UP        = 1 << 0;
        const BROADCAST = 1 << 1;
    }
}

bitflags! {
    /// Driver-owned state flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DrvFlags: u32 {
        const RUNNING = 1 << 0;
    }
}

bitflags! {
    /// Offload capabilities the driver advertises.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const TXCSUM  = 1 << 0;
        const RXCSUM  = 1 << 1;
        const TSO4    = 1 << 2;
        const LRO     = 1 << 3;
        const HWSTATS = 1 << 4;
    }
}

/// Aggregate interface counters, the unit of the statistics query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterfaceData {
    pub ipackets: u64,
    pub ibytes: u64,
    pub iqdrops: u64,
    pub ierrors: u64,
    pub opackets: u64,
    pub obytes: u64,
    pub oerrors: u64,
}

type InputHook = Box<dyn Fn(Mbuf) + Send + Sync>;
type ClassifierHook = Box<dyn Fn(Mbuf) -> Option<Mbuf> + Send + Sync>;
type FlushHook = Box<dyn Fn() + Send + Sync>;

pub struct Interface {
    name: String,
    mac: EthernetAddress,
    mtu: AtomicUsize,
    flags: AtomicU32,
    drv_flags: AtomicU32,
    capabilities: Capabilities,
    capenable: Capabilities,
    hwassist: CsumFlags,
    snd_maxlen: AtomicUsize,
    input_drops: AtomicU64,
    input: Mutex<Option<InputHook>>,
    classifier: Mutex<Option<ClassifierHook>>,
    qflush: Mutex<Option<FlushHook>>,
}

impl Interface {
    pub fn new(name: String, mac: EthernetAddress, mtu: usize) -> Self {
        Self {
            name,
            mac,
            mtu: AtomicUsize::new(mtu),
            flags: AtomicU32::new(0),
            drv_flags: AtomicU32::new(0),
            capabilities: Capabilities::empty(),
            capenable: Capabilities::empty(),
            hwassist: CsumFlags::empty(),
            snd_maxlen: AtomicUsize::new(0),
            input_drops: AtomicU64::new(0),
            input: Mutex::new(None),
            classifier: Mutex::new(None),
            qflush: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> IfFlags {
        IfFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: IfFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn drv_flags(&self) -> DrvFlags {
        DrvFlags::from_bits_truncate(self.drv_flags.load(Ordering::Acquire))
    }

    pub fn add_drv_flags(&self, flags: DrvFlags) {
        self.drv_flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn del_drv_flags(&self, flags: DrvFlags) {
        self.drv_flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn capenable(&self) -> Capabilities {
        self.capenable
    }

    pub fn hwassist(&self) -> CsumFlags {
        self.hwassist
    }

    /// Publish the capability set. Driver-only, before the interface is
    /// shared.
    pub fn publish_capabilities(
        &mut self,
        capabilities: Capabilities,
        capenable: Capabilities,
        hwassist: CsumFlags,
    ) {
        self.capabilities = capabilities;
        self.capenable = capenable;
        self.hwassist = hwassist;
    }

    pub fn snd_maxlen(&self) -> usize {
        self.snd_maxlen.load(Ordering::Relaxed)
    }

    pub fn set_snd_maxlen(&self, maxlen: usize) {
        self.snd_maxlen.store(maxlen, Ordering::Relaxed);
    }

    pub fn set_input(&self, hook: InputHook) {
        *lock(&self.input) = Some(hook);
    }

    pub fn set_classifier(&self, hook: ClassifierHook) {
        *lock(&self.classifier) = Some(hook);
    }

    pub fn set_qflush(&self, hook: FlushHook) {
        *lock(&self.qflush) = Some(hook);
    }

    /// Offer the packet to the fast-path classifier. `None` means it was
    /// consumed; `Some` returns it for the slow path.
    pub fn post_classifier(&self, m: Mbuf) -> Option<Mbuf> {
        match &*lock(&self.classifier) {
            Some(hook) => hook(m),
            None => Some(m),
        }
    }

    /// Hand the packet to the registered input hook. Without a hook the
    /// packet is counted as an input drop and freed.
    pub fn input(&self, m: Mbuf) {
        match &*lock(&self.input) {
            Some(hook) => hook(m),
            None => {
                self.input_drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn input_drops(&self) -> u64 {
        self.input_drops.load(Ordering::Relaxed)
    }

    /// Flush the upper-layer send queue.
    pub fn qflush(&self) {
        if let Some(hook) = &*lock(&self.qflush) {
            hook();
        }
    }

    /// Fallback handler for control requests the driver does not care
    /// about.
    pub fn ether_ioctl(&self, command: u32) {
        log::debug!(target: "ether", "{}: generic ioctl {command:#x}", self.name);
    }
}
