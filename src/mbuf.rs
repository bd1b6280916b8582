//! Packet buffer model.
//!
//! A packet is an ordered chain of owned fragments plus per-packet header
//! metadata. Fragment zero is the "linear" region: header parsing only
//! ever looks there, and [`Mbuf::pullup`] is how callers guarantee enough
//! contiguous bytes before reading.

use bitflags::bitflags;
use std::sync::Arc;

use crate::iface::Interface;

/// Cluster size used for receive buffers.
pub const MCLBYTES: usize = 2048;

bitflags! {
    /// Checksum/offload requests and results carried in the packet header.
    ///
    /// `CSUM_TCP`/`CSUM_UDP`/`CSUM_TSO` travel down with transmitted
    /// packets; `CSUM_DATA_VALID`/`CSUM_PSEUDO_HDR` travel up with
    /// received ones.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CsumFlags: u32 {
        const CSUM_TCP        = 1 << 0;
        const CSUM_UDP        = 1 << 1;
        const CSUM_TSO        = 1 << 2;
        const CSUM_DATA_VALID = 1 << 3;
        const CSUM_PSEUDO_HDR = 1 << 4;
    }
}

impl CsumFlags {
    /// The transmit-side requests the device can take over.
    pub const OFFLOAD: CsumFlags = CsumFlags::CSUM_TCP.union(CsumFlags::CSUM_UDP);
}

/// Per-packet metadata, present on the head of a chain.
#[derive(Clone, Default)]
pub struct PktHdr {
    /// Total packet length across all fragments.
    pub len: usize,
    pub csum_flags: CsumFlags,
    /// Transmit: checksum offset within the L4 header. Receive: the
    /// validated checksum value (`0xFFFF` once `CSUM_DATA_VALID` is set).
    pub csum_data: u32,
    /// Segment size for TSO requests.
    pub tso_segsz: u16,
    /// Interface the packet arrived on.
    pub rcvif: Option<Arc<Interface>>,
}

struct Frag {
    data: Vec<u8>,
    off: usize,
    len: usize,
}

impl Frag {
    fn as_slice(&self) -> &[u8] {
        &self.data[self.off..self.off + self.len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbufError {
    /// `pullup` asked for more bytes than the whole chain holds.
    TooShort { wanted: usize, have: usize },
}

impl core::fmt::Display for MbufError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooShort { wanted, have } => {
                write!(f, "pullup of {wanted} bytes on a {have}-byte chain")
            }
        }
    }
}

pub struct Mbuf {
    pkthdr: PktHdr,
    frags: Vec<Frag>,
}

impl Mbuf {
    /// Allocate a single cluster-sized fragment, length preset to the full
    /// capacity (the shape posted to a receive ring).
    pub fn with_cluster(capacity: usize) -> Self {
        Self {
            pkthdr: PktHdr {
                len: capacity,
                ..PktHdr::default()
            },
            frags: vec![Frag {
                data: vec![0u8; capacity],
                off: 0,
                len: capacity,
            }],
        }
    }

    /// Single-fragment packet holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            pkthdr: PktHdr {
                len: bytes.len(),
                ..PktHdr::default()
            },
            frags: vec![Frag {
                data: bytes.to_vec(),
                off: 0,
                len: bytes.len(),
            }],
        }
    }

    pub fn pkthdr(&self) -> &PktHdr {
        &self.pkthdr
    }

    pub fn pkthdr_mut(&mut self) -> &mut PktHdr {
        &mut self.pkthdr
    }

    /// Total packet length as recorded in the header.
    pub fn len(&self) -> usize {
        self.pkthdr.len
    }

    pub fn is_empty(&self) -> bool {
        self.pkthdr.len == 0
    }

    /// Valid bytes in the linear (first) fragment.
    pub fn linear_len(&self) -> usize {
        self.frags.first().map_or(0, |f| f.len)
    }

    /// Backing capacity of the linear fragment.
    pub fn linear_capacity(&self) -> usize {
        self.frags.first().map_or(0, |f| f.data.len() - f.off)
    }

    pub fn linear(&self) -> &[u8] {
        self.frags.first().map_or(&[], Frag::as_slice)
    }

    pub fn linear_mut(&mut self) -> &mut [u8] {
        match self.frags.first_mut() {
            Some(f) => &mut f.data[f.off..f.off + f.len],
            None => &mut [],
        }
    }

    /// Set the valid length of the linear fragment, clamped to capacity.
    /// Does not touch `pkthdr.len`; receive-side code accounts totals
    /// explicitly.
    pub fn set_linear_len(&mut self, len: usize) {
        if let Some(f) = self.frags.first_mut() {
            f.len = len.min(f.data.len() - f.off);
        }
    }

    pub fn frag_count(&self) -> usize {
        self.frags.len()
    }

    /// Non-empty fragment payloads, in order.
    pub fn frags(&self) -> impl Iterator<Item = &[u8]> {
        self.frags.iter().map(Frag::as_slice).filter(|s| !s.is_empty())
    }

    /// Chain `tail` onto this packet. The tail's fragments join the chain
    /// and its bytes are added to the head's total; tail metadata is
    /// discarded.
    pub fn append(&mut self, tail: Mbuf) {
        for frag in tail.frags {
            self.pkthdr.len += frag.len;
            self.frags.push(frag);
        }
    }

    /// Trim `count` bytes off the front of the chain, dropping fragments
    /// that empty out.
    pub fn adj(&mut self, count: usize) {
        let mut remaining = count.min(self.pkthdr.len);
        self.pkthdr.len -= remaining;
        while remaining > 0 {
            let Some(f) = self.frags.first_mut() else {
                break;
            };
            let take = remaining.min(f.len);
            f.off += take;
            f.len -= take;
            remaining -= take;
            if f.len == 0 {
                self.frags.remove(0);
            }
        }
    }

    /// Make the first `count` bytes of the packet contiguous in the linear
    /// fragment, copying out of later fragments as needed.
    pub fn pullup(&mut self, count: usize) -> Result<(), MbufError> {
        if self.linear_len() >= count {
            return Ok(());
        }
        if count > self.pkthdr.len {
            return Err(MbufError::TooShort {
                wanted: count,
                have: self.pkthdr.len,
            });
        }

        let mut linear = Vec::with_capacity(count);
        for frag in &self.frags {
            let take = (count - linear.len()).min(frag.len);
            linear.extend_from_slice(&frag.as_slice()[..take]);
            if linear.len() == count {
                break;
            }
        }

        // Rebuild the chain with the pulled-up prefix as fragment zero.
        let mut skip = count;
        let mut rest = Vec::new();
        for mut frag in self.frags.drain(..) {
            if skip >= frag.len {
                skip -= frag.len;
                continue;
            }
            frag.off += skip;
            frag.len -= skip;
            skip = 0;
            rest.push(frag);
        }
        let linear_len = linear.len();
        self.frags.push(Frag {
            data: linear,
            off: 0,
            len: linear_len,
        });
        self.frags.append(&mut rest);
        Ok(())
    }

    /// Flatten the chain into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkthdr.len);
        for frag in self.frags() {
            out.extend_from_slice(frag);
        }
        out
    }
}
