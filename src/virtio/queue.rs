//! Virtqueue handle contract.
//!
//! The ring implementation (descriptor table, available ring, used ring)
//! lives outside this crate; drivers only see the operations below. A
//! queue carries typed tokens: the driver hands ownership of a buffer
//! record to the ring with [`Virtqueue::add_buf`] and receives it back
//! with the completion.
//!
//! Operations are deliberately not synchronised internally. The caller
//! must exclude concurrent `add_buf`/`get_buf_elem` on the same queue;
//! only the interrupt enable/disable pair may race with ring operations,
//! which mirrors what the flag writes do on real shared memory.

use std::sync::Arc;

/// Direction of one scatter-gather segment, from the device's viewpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SgDir {
    /// Driver-filled, device-read.
    Out,
    /// Device-written.
    In,
}

#[derive(Clone, Copy, Debug)]
pub struct SgSeg {
    pub dir: SgDir,
    pub len: u32,
}

/// Scatter-gather build area, reused across submissions.
#[derive(Clone, Debug, Default)]
pub struct SgList {
    segs: Vec<SgSeg>,
}

impl SgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.segs.clear();
    }

    pub fn add_out(&mut self, len: usize) {
        self.segs.push(SgSeg {
            dir: SgDir::Out,
            len: len as u32,
        });
    }

    pub fn add_in(&mut self, len: usize) {
        self.segs.push(SgSeg {
            dir: SgDir::In,
            len: len as u32,
        });
    }

    /// Number of descriptors this submission will occupy.
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn segs(&self) -> &[SgSeg] {
        &self.segs
    }

    pub fn out_bytes(&self) -> usize {
        self.segs
            .iter()
            .filter(|s| s.dir == SgDir::Out)
            .map(|s| s.len as usize)
            .sum()
    }

    pub fn in_bytes(&self) -> usize {
        self.segs
            .iter()
            .filter(|s| s.dir == SgDir::In)
            .map(|s| s.len as usize)
            .sum()
    }
}

/// A reaped used-ring entry: the token goes back to the driver together
/// with the number of bytes the device wrote.
pub struct Completion<T> {
    pub token: T,
    pub len: u32,
}

/// `add_buf` refusal; the token comes back so the caller can retry or
/// free it.
pub struct Rejected<T> {
    pub token: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    InvalidSize(u16),
    CreationFailed,
}

impl core::fmt::Display for QueueError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidSize(size) => write!(f, "queue size {size} rejected"),
            Self::CreationFailed => write!(f, "virtqueue construction failed"),
        }
    }
}

pub trait Virtqueue<T>: Send + Sync {
    fn size(&self) -> u16;

    /// Guest-physical base of the ring, programmed into the PFN register.
    fn physical_address(&self) -> u64;

    /// Post one buffer described by `sg`; the ring owns `token` until the
    /// matching completion is finalized.
    fn add_buf(&self, sg: &SgList, token: T) -> Result<(), Rejected<T>>;

    /// Peek-and-take the next completion. Must be paired with
    /// [`Virtqueue::get_buf_finalize`] to release the descriptors.
    fn get_buf_elem(&self) -> Option<Completion<T>>;

    fn get_buf_finalize(&self);

    /// Bulk-release completed descriptors, dropping their tokens.
    fn get_buf_gc(&self);

    /// Can `descriptors` more be enqueued right now?
    fn avail_ring_has_room(&self, descriptors: usize) -> bool;

    /// At least one free descriptor slot.
    fn avail_ring_not_empty(&self) -> bool;

    /// The host has posted completions we have not reaped.
    fn used_ring_not_empty(&self) -> bool;

    /// Completions are reclaimable via [`Virtqueue::get_buf_gc`].
    fn used_ring_can_gc(&self) -> bool;

    /// Low-water refill hint for receive rings.
    fn refill_ring_cond(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);
}

/// Constructs ring implementations during queue discovery.
pub trait VirtqueueFactory<T> {
    fn create(&mut self, index: u16, size: u16) -> Result<Arc<dyn Virtqueue<T>>, QueueError>;
}
