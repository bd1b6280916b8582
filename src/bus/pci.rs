//! PCI-facing contracts consumed by the virtio transport.
//!
//! Enumeration, BAR mapping and config-space mechanics live outside this
//! crate; the transport only needs the handful of operations below.

use std::sync::Arc;

/// A window of device registers behind a BAR.
///
/// Accessors take `&self`: register I/O is a hardware side effect, not a
/// Rust-visible mutation, and the interrupt path must be able to touch the
/// ISR register while another thread is mid-access elsewhere in the window.
pub trait RegisterWindow: Send + Sync {
    fn read_u8(&self, offset: u32) -> u8;
    fn read_u16(&self, offset: u32) -> u16;
    fn read_u32(&self, offset: u32) -> u32;
    fn write_u8(&self, offset: u32, value: u8);
    fn write_u16(&self, offset: u32, value: u16);
    fn write_u32(&self, offset: u32, value: u32);
}

/// A bound PCI function as seen by a driver.
pub trait PciDevice: Send + Sync {
    fn vendor_id(&self) -> u16;
    fn device_id(&self) -> u16;
    fn revision_id(&self) -> u8;

    /// Legacy interrupt line (GSI) routed to this function.
    fn interrupt_line(&self) -> u8;

    /// Register window for the given BAR, if the BAR is implemented.
    fn bar(&self, index: u8) -> Option<Arc<dyn RegisterWindow>>;

    fn set_bus_master(&self, enabled: bool);

    /// Enable MSI-X delivery. Returns `false` when the function has no
    /// MSI-X capability, in which case the caller falls back to the
    /// shared legacy line.
    fn msix_enable(&self) -> bool;

    fn is_msix(&self) -> bool;
}
