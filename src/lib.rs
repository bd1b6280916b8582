//! Guest-side virtio drivers over the legacy ("ABI version 0") PCI
//! transport.
//!
//! The crate is split the same way the hardware is: [`virtio::transport`]
//! owns the PCI-facing register window, feature negotiation and virtqueue
//! discovery, and the device drivers ([`virtio::net`], [`virtio::rng`])
//! build their pipelines on top of it. Everything the drivers cannot own —
//! PCI enumeration, interrupt routing, the virtqueue ring implementation,
//! the network stack above the interface — enters through the traits in
//! [`bus`], [`sched`] and [`virtio::queue`], so the core stays testable
//! without hardware.

pub mod bus;
pub mod iface;
pub mod mbuf;
pub mod sched;
pub mod virtio;

pub use iface::{Interface, InterfaceData};
pub use mbuf::Mbuf;
pub use virtio::net::Net;
pub use virtio::rng::Rng;
pub use virtio::transport::VirtioTransport;
