//! Seams towards the platform: PCI configuration, BAR register windows and
//! the interrupt controller. The transport consumes these; the embedding
//! kernel (or the test harness) provides them.

pub mod irq;
pub mod pci;

pub use irq::{InterruptController, MsixBinding};
pub use pci::{PciDevice, RegisterWindow};
