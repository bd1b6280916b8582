//! virtio-net device driver.
//!
//! One RX/TX virtqueue pair per CPU (as far as the device allows), a
//! pinned polling agent per RX queue, and a single ring lock serialising
//! transmits. The receive and transmit pipelines live in [`rx`] and
//! [`tx`]; this module owns attach, negotiated state and the control
//! surface.

mod rx;
mod tx;

use bitflags::bitflags;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use smoltcp::wire::EthernetAddress;

use crate::bus::irq::{InterruptController, MsixBinding};
use crate::bus::pci::PciDevice;
use crate::iface::{Capabilities, DrvFlags, IfFlags, Interface, InterfaceData, ETHERMTU};
use crate::mbuf::{CsumFlags, Mbuf};
use crate::sched::{lock, CpuTopology, WaitCell};
use crate::virtio::queue::{QueueError, Virtqueue, VirtqueueFactory};
use crate::virtio::transport::{DeviceStatus, TransportError, VirtioTransport};
use crate::virtio::{device_id, next_instance, VIRTIO_VENDOR_ID};

pub use tx::TxRequest;

bitflags! {
    /// virtio-net feature bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NetFeatures: u32 {
        const CSUM       = 1 << 0;
        const GUEST_CSUM = 1 << 1;
        const MAC        = 1 << 5;
        const GUEST_TSO4 = 1 << 7;
        const GUEST_ECN  = 1 << 9;
        const GUEST_UFO  = 1 << 10;
        const HOST_TSO4  = 1 << 11;
        const HOST_ECN   = 1 << 13;
        const MRG_RXBUF  = 1 << 15;
        const STATUS     = 1 << 16;
        const MQ         = 1 << 22;
    }
}

bitflags! {
    /// Flags field of the on-wire net header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NetHdrFlags: u8 {
        const NEEDS_CSUM = 1;
    }
}

/// GSO type codes in the on-wire net header.
pub mod gso {
    pub const NONE: u8 = 0;
    pub const TCPV4: u8 = 1;
    pub const UDP: u8 = 3;
    pub const TCPV6: u8 = 4;
    pub const ECN: u8 = 0x80;
}

/// On-wire header prepended to every frame (guest byte order).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

/// Header layout used when MRG_RXBUF is negotiated.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetHdrMrg {
    pub hdr: NetHdr,
    pub num_buffers: u16,
}

pub const NET_HDR_SIZE: usize = core::mem::size_of::<NetHdr>();
pub const NET_HDR_MRG_SIZE: usize = core::mem::size_of::<NetHdrMrg>();

impl NetHdrMrg {
    /// Decode from the head of a received buffer. The caller guarantees at
    /// least the fixed header is present; `num_buffers` is only meaningful
    /// when the merged layout was negotiated.
    pub fn parse(bytes: &[u8]) -> Self {
        let le16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self {
            hdr: NetHdr {
                flags: bytes[0],
                gso_type: bytes[1],
                hdr_len: le16(2),
                gso_size: le16(4),
                csum_start: le16(6),
                csum_offset: le16(8),
            },
            num_buffers: if bytes.len() >= NET_HDR_MRG_SIZE {
                le16(10)
            } else {
                0
            },
        }
    }
}

/// Device-specific config area.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetConfig {
    pub mac: [u8; 6],
    pub status: u16,
    pub max_virtqueue_pairs: u16,
}

const NET_STATUS_LINK_UP: u16 = 1;

impl NetConfig {
    fn read<T>(transport: &VirtioTransport<T>) -> Self {
        let mut bytes = [0u8; 10];
        transport.config_read(0, &mut bytes);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        Self {
            mac,
            status: u16::from_le_bytes([bytes[6], bytes[7]]),
            max_virtqueue_pairs: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

/// Negotiated feature bits mirrored into booleans at attach.
#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureCache {
    pub mergeable_bufs: bool,
    pub status: bool,
    pub tso_ecn: bool,
    pub host_tso_ecn: bool,
    pub csum: bool,
    pub guest_csum: bool,
    pub guest_tso4: bool,
    pub host_tso4: bool,
    pub guest_ufo: bool,
    pub mq: bool,
}

impl FeatureCache {
    fn new(negotiated: NetFeatures) -> Self {
        Self {
            mergeable_bufs: negotiated.contains(NetFeatures::MRG_RXBUF),
            status: negotiated.contains(NetFeatures::STATUS),
            tso_ecn: negotiated.contains(NetFeatures::GUEST_ECN),
            host_tso_ecn: negotiated.contains(NetFeatures::HOST_ECN),
            csum: negotiated.contains(NetFeatures::CSUM),
            guest_csum: negotiated.contains(NetFeatures::GUEST_CSUM),
            guest_tso4: negotiated.contains(NetFeatures::GUEST_TSO4),
            host_tso4: negotiated.contains(NetFeatures::HOST_TSO4),
            guest_ufo: negotiated.contains(NetFeatures::GUEST_UFO),
            mq: negotiated.contains(NetFeatures::MQ),
        }
    }
}

/// Buffer records owned by the net rings.
pub enum NetToken {
    Rx(Mbuf),
    Tx(Box<TxRequest>),
}

#[derive(Debug)]
pub enum NetError {
    /// The available ring cannot take the packet right now.
    NoBufferSpace,
    /// The packet failed offload classification.
    InvalidPacket,
    InsufficientQueues(u16),
    QueueUnavailable(usize),
    Transport(TransportError),
    Queue(QueueError),
    Spawn(io::Error),
}

impl core::fmt::Display for NetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoBufferSpace => write!(f, "no descriptor space on the transmit ring"),
            Self::InvalidPacket => write!(f, "packet rejected by offload classification"),
            Self::InsufficientQueues(n) => write!(f, "device exposes too few queues ({n})"),
            Self::QueueUnavailable(idx) => write!(f, "virtqueue {idx} unavailable"),
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::Queue(err) => write!(f, "virtqueue: {err}"),
            Self::Spawn(err) => write!(f, "spawning poll agent: {err}"),
        }
    }
}

impl From<TransportError> for NetError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<QueueError> for NetError {
    fn from(value: QueueError) -> Self {
        Self::Queue(value)
    }
}

/// Control requests accepted by [`Net::ioctl`].
#[derive(Clone, Copy, Debug)]
pub enum IfRequest {
    SetMtu(usize),
    SetFlags(IfFlags),
    AddMulticast(EthernetAddress),
    DelMulticast(EthernetAddress),
    /// Anything else: handed to the generic Ethernet handler.
    Generic(u32),
}

#[derive(Default)]
pub struct RxStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_drops: AtomicU64,
    pub rx_csum: AtomicU64,
    pub rx_csum_err: AtomicU64,
}

#[derive(Default)]
pub struct TxStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_drops: AtomicU64,
    pub tx_err: AtomicU64,
    pub tx_csum: AtomicU64,
    pub tx_tso: AtomicU64,
}

pub(crate) struct Rxq {
    pub vq: Arc<dyn Virtqueue<NetToken>>,
    pub wait: Arc<WaitCell>,
    pub stats: RxStats,
}

pub(crate) struct Txq {
    pub vq: Arc<dyn Virtqueue<NetToken>>,
    pub stats: TxStats,
}

pub struct Net {
    transport: Arc<VirtioTransport<NetToken>>,
    ifn: Arc<Interface>,
    config: NetConfig,
    feats: FeatureCache,
    hdr_size: usize,
    rxqs: Vec<Arc<Rxq>>,
    txqs: Vec<Arc<Txq>>,
    tx_ring_lock: Mutex<()>,
    cpus: Arc<dyn CpuTopology>,
    stop: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    id: u32,
}

/// Feature mask this driver requests from the device.
fn driver_features() -> u32 {
    VirtioTransport::<NetToken>::base_driver_features()
        | (NetFeatures::MAC
            | NetFeatures::MRG_RXBUF
            | NetFeatures::STATUS
            | NetFeatures::CSUM
            | NetFeatures::GUEST_CSUM
            | NetFeatures::GUEST_TSO4
            | NetFeatures::HOST_ECN
            | NetFeatures::HOST_TSO4
            | NetFeatures::GUEST_ECN
            | NetFeatures::GUEST_UFO
            | NetFeatures::MQ)
            .bits()
}

impl Net {
    /// Driver-probe entry: bind when the transitional net device id
    /// matches, otherwise stay away.
    pub fn probe(
        dev: Arc<dyn PciDevice>,
        intc: &Arc<dyn InterruptController>,
        factory: &mut dyn VirtqueueFactory<NetToken>,
        cpus: Arc<dyn CpuTopology>,
    ) -> Option<Arc<Net>> {
        if dev.vendor_id() != VIRTIO_VENDOR_ID || dev.device_id() != device_id::NET {
            return None;
        }
        match Net::attach(dev, intc, factory, cpus) {
            Ok(net) => Some(net),
            Err(err) => {
                log::error!(target: "virtio-net", "attach failed: {err}");
                None
            }
        }
    }

    pub fn attach(
        dev: Arc<dyn PciDevice>,
        intc: &Arc<dyn InterruptController>,
        factory: &mut dyn VirtqueueFactory<NetToken>,
        cpus: Arc<dyn CpuTopology>,
    ) -> Result<Arc<Net>, NetError> {
        let mut transport = VirtioTransport::attach(dev)?;

        let negotiated =
            NetFeatures::from_bits_truncate(transport.setup_features(driver_features()));
        let feats = FeatureCache::new(negotiated);
        let config = NetConfig::read(&transport);

        if let Err(err) = transport.probe_virt_queues(factory, 2 * cpus.count()) {
            transport.fail();
            return Err(err.into());
        }
        let pairs = transport.num_queues() / 2;
        if pairs == 0 {
            transport.fail();
            return Err(NetError::InsufficientQueues(transport.num_queues() as u16));
        }

        let hdr_size = if feats.mergeable_bufs {
            NET_HDR_MRG_SIZE
        } else {
            NET_HDR_SIZE
        };

        let id = next_instance();
        let mac = EthernetAddress(config.mac);
        log::info!(
            target: "virtio-net",
            "eth{id}: mac {mac}, features {negotiated:?}, {pairs} queue pair(s)"
        );

        let mut rxqs = Vec::with_capacity(pairs);
        let mut txqs = Vec::with_capacity(pairs);
        for idx in 0..pairs {
            let rx_vq = transport
                .get_virt_queue(2 * idx)
                .ok_or(NetError::QueueUnavailable(2 * idx))?;
            let tx_vq = transport
                .get_virt_queue(2 * idx + 1)
                .ok_or(NetError::QueueUnavailable(2 * idx + 1))?;
            rxqs.push(Arc::new(Rxq {
                vq: rx_vq,
                wait: Arc::new(WaitCell::new()),
                stats: RxStats::default(),
            }));
            txqs.push(Arc::new(Txq {
                vq: tx_vq,
                stats: TxStats::default(),
            }));
        }

        let mut ifn = Interface::new(format!("eth{id}"), mac, ETHERMTU);
        ifn.set_flags(IfFlags::BROADCAST);

        let mut capabilities = Capabilities::empty();
        let mut hwassist = CsumFlags::empty();
        if feats.csum {
            capabilities |= Capabilities::TXCSUM;
            if feats.host_tso4 {
                capabilities |= Capabilities::TSO4;
                hwassist = CsumFlags::CSUM_TCP | CsumFlags::CSUM_UDP | CsumFlags::CSUM_TSO;
            }
        }
        if feats.guest_csum {
            capabilities |= Capabilities::RXCSUM;
            if feats.guest_tso4 {
                capabilities |= Capabilities::LRO;
            }
        }
        ifn.publish_capabilities(
            capabilities,
            capabilities | Capabilities::HWSTATS,
            hwassist,
        );
        ifn.set_snd_maxlen(txqs.iter().map(|t| t.vq.size() as usize).sum());

        let net = Arc::new(Net {
            transport: Arc::new(transport),
            ifn: Arc::new(ifn),
            config,
            feats,
            hdr_size,
            rxqs,
            txqs,
            tx_ring_lock: Mutex::new(()),
            cpus,
            stop: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            id,
        });

        // Polling agents start before the RX interrupts can fire.
        for idx in 0..pairs {
            let this = net.clone();
            match net.cpus.spawn_pinned(
                idx,
                &format!("virtio-net{id}-rx{idx}"),
                Box::new(move || this.receiver(idx)),
            ) {
                Ok(handle) => lock(&net.threads).push(handle),
                Err(err) => {
                    net.detach();
                    return Err(NetError::Spawn(err));
                }
            }
        }

        net.register_interrupts(intc);

        for idx in 0..pairs {
            net.fill_rx_ring(idx);
        }

        net.transport.add_status(DeviceStatus::DRIVER_OK);
        Ok(net)
    }

    fn register_interrupts(&self, intc: &Arc<dyn InterruptController>) {
        if self.transport.is_msix() {
            let mut bindings = Vec::new();
            for (idx, (rxq, txq)) in self.rxqs.iter().zip(self.txqs.iter()).enumerate() {
                let rx_vq = rxq.vq.clone();
                bindings.push(MsixBinding {
                    entry: (2 * idx) as u16,
                    ack: Some(Box::new(move || rx_vq.disable_interrupts())),
                    wake: Some(rxq.wait.clone()),
                });
                let tx_vq = txq.vq.clone();
                bindings.push(MsixBinding {
                    entry: (2 * idx + 1) as u16,
                    ack: Some(Box::new(move || tx_vq.disable_interrupts())),
                    wake: None,
                });
            }
            intc.register_msix(bindings);
        } else {
            // One shared line for the whole device: a nonzero ISR claims
            // the interrupt, masks every RX queue and wakes the agents.
            let transport = self.transport.clone();
            let rx_vqs: Vec<Arc<dyn Virtqueue<NetToken>>> =
                self.rxqs.iter().map(|q| q.vq.clone()).collect();
            let ack = Box::new(move || {
                let isr = transport.read_isr();
                if isr != 0 {
                    for vq in &rx_vqs {
                        vq.disable_interrupts();
                    }
                    true
                } else {
                    false
                }
            });
            let cells: Vec<Arc<WaitCell>> = self.rxqs.iter().map(|q| q.wait.clone()).collect();
            let handler = Box::new(move || {
                for cell in &cells {
                    cell.wake();
                }
            });
            let line = self.transport.pci_device().interrupt_line();
            intc.register_legacy(line, ack, handler);
        }
    }

    pub fn interface(&self) -> &Arc<Interface> {
        &self.ifn
    }

    pub fn mac(&self) -> EthernetAddress {
        EthernetAddress(self.config.mac)
    }

    pub fn max_virtqueue_pairs(&self) -> u16 {
        self.config.max_virtqueue_pairs
    }

    pub fn link_state(&self) -> LinkState {
        if !self.feats.status {
            return LinkState::Unknown;
        }
        if self.config.status & NET_STATUS_LINK_UP != 0 {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }

    pub(crate) fn queue_pairs(&self) -> usize {
        self.rxqs.len()
    }

    pub(crate) fn transport(&self) -> &VirtioTransport<NetToken> {
        &self.transport
    }

    pub(crate) fn feats(&self) -> &FeatureCache {
        &self.feats
    }

    pub(crate) fn hdr_size(&self) -> usize {
        self.hdr_size
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Interface control requests.
    pub fn ioctl(&self, request: IfRequest) {
        match request {
            IfRequest::SetMtu(mtu) => {
                // Accepted without effect.
                log::debug!(target: "virtio-net", "eth{}: set mtu {mtu}", self.id);
            }
            IfRequest::SetFlags(flags) => {
                self.ifn.set_flags(flags);
                if flags.contains(IfFlags::UP) {
                    self.ifn.add_drv_flags(DrvFlags::RUNNING);
                    log::debug!(target: "virtio-net", "eth{}: if_up", self.id);
                } else {
                    self.ifn.del_drv_flags(DrvFlags::RUNNING);
                    log::debug!(target: "virtio-net", "eth{}: if_down", self.id);
                }
            }
            IfRequest::AddMulticast(addr) | IfRequest::DelMulticast(addr) => {
                log::debug!(target: "virtio-net", "eth{}: multicast {addr}", self.id);
            }
            IfRequest::Generic(command) => self.ifn.ether_ioctl(command),
        }
    }

    /// Flush: nothing queues inside the driver, delegate upward.
    pub fn qflush(&self) {
        self.ifn.qflush();
    }

    /// Add this driver's per-queue totals to `out`.
    ///
    /// The caller passes a struct with untouched TX counters; anything
    /// else indicates double accounting.
    pub fn fill_stats(&self, out: &mut InterfaceData) {
        assert!(
            out.oerrors == 0 && out.obytes == 0 && out.opackets == 0,
            "stats query started with nonzero tx counters"
        );
        for rxq in &self.rxqs {
            out.ipackets += rxq.stats.rx_packets.load(Ordering::Relaxed);
            out.ibytes += rxq.stats.rx_bytes.load(Ordering::Relaxed);
            out.iqdrops += rxq.stats.rx_drops.load(Ordering::Relaxed);
            out.ierrors += rxq.stats.rx_csum_err.load(Ordering::Relaxed);
        }
        for txq in &self.txqs {
            out.opackets += txq.stats.tx_packets.load(Ordering::Relaxed);
            out.obytes += txq.stats.tx_bytes.load(Ordering::Relaxed);
            out.oerrors += txq.stats.tx_err.load(Ordering::Relaxed)
                + txq.stats.tx_drops.load(Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> InterfaceData {
        let mut data = InterfaceData::default();
        self.fill_stats(&mut data);
        data
    }

    /// Quiesce and tear down: mark the interface down, stop the polling
    /// agents, reclaim completed transmit records and reset the device.
    pub fn detach(&self) {
        self.ifn.del_drv_flags(DrvFlags::RUNNING);
        self.stop.store(true, Ordering::Release);
        for rxq in &self.rxqs {
            rxq.wait.wake();
        }
        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            let _ = handle.join();
        }

        let _guard = lock(&self.tx_ring_lock);
        for idx in 0..self.queue_pairs() {
            self.tx_gc(idx);
        }
        drop(_guard);

        self.transport.reset();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::virtio::mock::{FixedCpus, MockFactory, MockIntc, MockPci, MockPciBuilder};

    pub struct NetHarness {
        pub net: Arc<Net>,
        pub pci: Arc<MockPci>,
        pub intc: Arc<MockIntc>,
        pub factory: MockFactory<NetToken>,
        pub cpus: Arc<FixedCpus>,
    }

    pub fn default_config() -> Vec<u8> {
        let mut config = vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        config.extend_from_slice(&1u16.to_le_bytes()); // link up
        config.extend_from_slice(&1u16.to_le_bytes()); // one pair
        config
    }

    pub fn full_features() -> u32 {
        super::driver_features()
    }

    pub fn attach_with(builder: MockPciBuilder, cpu_count: usize) -> NetHarness {
        attach_with_factory(builder, cpu_count, MockFactory::default())
    }

    pub fn attach_with_factory(
        builder: MockPciBuilder,
        cpu_count: usize,
        mut factory: MockFactory<NetToken>,
    ) -> NetHarness {
        let pci = builder.build();
        let intc = MockIntc::new();
        let cpus = FixedCpus::new(cpu_count);
        let intc_dyn: Arc<dyn InterruptController> = intc.clone();
        let cpus_dyn: Arc<dyn CpuTopology> = cpus.clone();
        let net = Net::attach(pci.clone(), &intc_dyn, &mut factory, cpus_dyn).expect("net attach");
        NetHarness {
            net,
            pci,
            intc,
            factory,
            cpus,
        }
    }

    pub fn default_harness() -> NetHarness {
        attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        )
    }

    pub fn bring_up(harness: &NetHarness) {
        harness
            .net
            .ioctl(IfRequest::SetFlags(IfFlags::UP | IfFlags::BROADCAST));
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::virtio::mock::MockPci;
    use crate::virtio::pci_config;

    fn quiet_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn attach_reaches_driver_ok_and_fills_rx_ring() {
        quiet_logger();
        let h = default_harness();
        assert_eq!(
            h.pci.regs().status,
            (DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::DRIVER_OK).bits()
        );
        // The RX ring was filled and kicked once.
        let rx = h.factory.queue(0);
        assert_eq!(rx.free_descs(), 0);
        assert!(h.pci.regs().notifies.contains(&0));
        h.net.detach();
    }

    #[test]
    fn capabilities_follow_negotiated_features() {
        quiet_logger();
        // Everything offered.
        let h = default_harness();
        let ifn = h.net.interface();
        assert!(ifn.capabilities().contains(Capabilities::TXCSUM | Capabilities::TSO4));
        assert!(ifn.capabilities().contains(Capabilities::RXCSUM | Capabilities::LRO));
        assert!(ifn.capenable().contains(Capabilities::HWSTATS));
        assert_eq!(
            ifn.hwassist(),
            CsumFlags::CSUM_TCP | CsumFlags::CSUM_UDP | CsumFlags::CSUM_TSO
        );
        h.net.detach();

        // Host offers nothing: no offload capabilities at all.
        let h = attach_with(
            MockPci::builder()
                .host_features(NetFeatures::MAC.bits())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        );
        let ifn = h.net.interface();
        assert_eq!(ifn.capabilities(), Capabilities::empty());
        assert_eq!(ifn.capenable(), Capabilities::HWSTATS);
        assert_eq!(ifn.hwassist(), CsumFlags::empty());
        h.net.detach();

        // TXCSUM without TSO4.
        let h = attach_with(
            MockPci::builder()
                .host_features((NetFeatures::MAC | NetFeatures::CSUM).bits())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        );
        let ifn = h.net.interface();
        assert_eq!(ifn.capabilities(), Capabilities::TXCSUM);
        assert_eq!(ifn.hwassist(), CsumFlags::empty());
        h.net.detach();
    }

    #[test]
    fn negotiation_writes_intersection_once() {
        quiet_logger();
        let h = attach_with(
            MockPci::builder()
                .host_features((NetFeatures::MAC | NetFeatures::MRG_RXBUF | NetFeatures::STATUS).bits())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        );
        let regs = h.pci.regs();
        assert_eq!(
            regs.guest_features,
            (NetFeatures::MAC | NetFeatures::MRG_RXBUF | NetFeatures::STATUS).bits()
        );
        assert_eq!(regs.guest_feature_writes, 1);
        drop(regs);
        h.net.detach();
    }

    #[test]
    fn hdr_size_depends_on_mrg_rxbuf() {
        quiet_logger();
        let h = default_harness();
        assert_eq!(h.net.hdr_size(), NET_HDR_MRG_SIZE);
        h.net.detach();

        let h = attach_with(
            MockPci::builder()
                .host_features(NetFeatures::MAC.bits())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        );
        assert_eq!(h.net.hdr_size(), NET_HDR_SIZE);
        h.net.detach();
    }

    #[test]
    fn queue_discovery_is_capped_by_cpu_count() {
        quiet_logger();
        // Device offers 4 pairs, one CPU: only one pair is wired.
        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8; 8])
                .config(&default_config()),
            1,
        );
        assert_eq!(h.net.queue_pairs(), 1);
        h.net.detach();

        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8; 8])
                .config(&default_config()),
            2,
        );
        assert_eq!(h.net.queue_pairs(), 2);
        h.net.detach();
    }

    #[test]
    fn msix_attach_registers_vector_per_queue() {
        quiet_logger();
        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8, 8])
                .msix(true)
                .config(&default_config()),
            1,
        );
        assert_eq!(h.intc.msix_entries(), vec![0, 1]);
        assert!(!h.intc.has_legacy());
        // Queue vectors were programmed 1:1 during discovery.
        assert_eq!(h.pci.regs().msi_queue_vector, 1);
        h.net.detach();
    }

    #[test]
    fn legacy_attach_registers_shared_line() {
        quiet_logger();
        let h = default_harness();
        assert!(h.intc.has_legacy());
        assert!(h.intc.msix_entries().is_empty());
        h.net.detach();
    }

    #[test]
    fn ioctl_flags_map_to_drv_running() {
        quiet_logger();
        let h = default_harness();
        let ifn = h.net.interface().clone();
        assert!(!ifn.drv_flags().contains(DrvFlags::RUNNING));

        h.net.ioctl(IfRequest::SetFlags(IfFlags::UP));
        assert!(ifn.drv_flags().contains(DrvFlags::RUNNING));

        h.net.ioctl(IfRequest::SetFlags(IfFlags::empty()));
        assert!(!ifn.drv_flags().contains(DrvFlags::RUNNING));

        // Accepted silently.
        h.net.ioctl(IfRequest::SetMtu(9000));
        assert_eq!(ifn.mtu(), ETHERMTU);
        h.net.ioctl(IfRequest::AddMulticast(EthernetAddress([1, 0, 0, 0, 0, 1])));
        h.net.ioctl(IfRequest::Generic(0xdead));
        h.net.detach();
    }

    #[test]
    fn stats_aggregate_per_queue_counters() {
        quiet_logger();
        let h = default_harness();
        h.net.rxqs[0].stats.rx_packets.store(3, Ordering::Relaxed);
        h.net.rxqs[0].stats.rx_bytes.store(300, Ordering::Relaxed);
        h.net.rxqs[0].stats.rx_drops.store(1, Ordering::Relaxed);
        h.net.rxqs[0].stats.rx_csum_err.store(2, Ordering::Relaxed);
        h.net.txqs[0].stats.tx_packets.store(5, Ordering::Relaxed);
        h.net.txqs[0].stats.tx_bytes.store(500, Ordering::Relaxed);
        h.net.txqs[0].stats.tx_err.store(1, Ordering::Relaxed);
        h.net.txqs[0].stats.tx_drops.store(2, Ordering::Relaxed);

        let stats = h.net.stats();
        assert_eq!(stats.ipackets, 3);
        assert_eq!(stats.ibytes, 300);
        assert_eq!(stats.iqdrops, 1);
        assert_eq!(stats.ierrors, 2);
        assert_eq!(stats.opackets, 5);
        assert_eq!(stats.obytes, 500);
        assert_eq!(stats.oerrors, 3);
        h.net.detach();
    }

    #[test]
    #[should_panic(expected = "nonzero tx counters")]
    fn stats_precondition_is_asserted() {
        let h = default_harness();
        let mut data = InterfaceData {
            opackets: 1,
            ..InterfaceData::default()
        };
        h.net.fill_stats(&mut data);
    }

    #[test]
    fn detach_resets_device_and_joins_agents() {
        quiet_logger();
        let h = default_harness();
        h.net.detach();
        assert_eq!(h.pci.regs().status, 0);
        assert!(lock(&h.net.threads).is_empty());
    }

    #[test]
    fn probe_matches_by_device_id() {
        quiet_logger();
        use crate::virtio::mock::{FixedCpus, MockFactory, MockIntc};

        let pci = MockPci::builder().device_id(0x1001).build();
        let intc: Arc<dyn InterruptController> = MockIntc::new();
        let cpus: Arc<dyn CpuTopology> = FixedCpus::new(1);
        let mut factory = MockFactory::default();
        assert!(Net::probe(pci, &intc, &mut factory, cpus).is_none());
    }

    #[test]
    fn link_state_reads_config_status() {
        quiet_logger();
        let h = default_harness();
        assert_eq!(h.net.link_state(), LinkState::Up);
        h.net.detach();

        let mut config = default_config();
        config[6] = 0; // link down
        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8, 8])
                .config(&config),
            1,
        );
        assert_eq!(h.net.link_state(), LinkState::Down);
        h.net.detach();

        // Without the STATUS feature the state is unknowable.
        let h = attach_with(
            MockPci::builder()
                .host_features(NetFeatures::MAC.bits())
                .queue_sizes(&[8, 8])
                .config(&default_config()),
            1,
        );
        assert_eq!(h.net.link_state(), LinkState::Unknown);
        h.net.detach();
    }

    #[test]
    fn snd_maxlen_is_sum_of_tx_queue_sizes() {
        quiet_logger();
        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8, 16, 8, 32])
                .config(&default_config()),
            2,
        );
        assert_eq!(h.net.interface().snd_maxlen(), 16 + 32);
        h.net.detach();
    }

    #[test]
    fn config_area_respects_msix_offset() {
        quiet_logger();
        let h = attach_with(
            MockPci::builder()
                .host_features(full_features())
                .queue_sizes(&[8, 8])
                .msix(true)
                .config(&default_config()),
            1,
        );
        assert_eq!(h.net.transport().config_offset(), pci_config::CONFIG_MSIX);
        assert_eq!(h.net.mac(), EthernetAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        h.net.detach();
    }
}
