//! Interrupt-controller registration seam.
//!
//! The controller (MSI-X vector table plumbing or the legacy GSI router)
//! is owned by the platform. Drivers hand it ack closures and wake
//! targets; the platform invokes them from its interrupt context.

use std::sync::Arc;

use crate::sched::WaitCell;

/// One MSI-X table entry registration.
///
/// On delivery the platform runs `ack` first, then wakes `wake`. Either
/// half may be absent: a TX completion vector typically acks (to mask the
/// queue) without waking anyone.
pub struct MsixBinding {
    pub entry: u16,
    pub ack: Option<Box<dyn Fn() + Send + Sync>>,
    pub wake: Option<Arc<WaitCell>>,
}

pub trait InterruptController: Send + Sync {
    /// Register a batch of MSI-X entries for one device.
    fn register_msix(&self, bindings: Vec<MsixBinding>);

    /// Register on a shared legacy line.
    ///
    /// `ack` must decide whether the device actually interrupted (the line
    /// is shared): `true` claims the interrupt and the platform then runs
    /// `handler`; `false` means spurious and nothing further happens.
    fn register_legacy(
        &self,
        line: u8,
        ack: Box<dyn Fn() -> bool + Send + Sync>,
        handler: Box<dyn Fn() + Send + Sync>,
    );
}
