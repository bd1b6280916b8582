//! Transmit pipeline: submission under the ring lock, the offload
//! classifier that fills in the virtio header, queue selection and lazy
//! reclaim of completed requests.

use std::sync::atomic::Ordering;

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol};

use crate::iface::{ETHER_HDR_LEN, ETHER_VLAN_HDR_LEN};
use crate::mbuf::{CsumFlags, Mbuf};
use crate::sched::lock;
use crate::virtio::net::{gso, Net, NetError, NetHdr, NetHdrFlags, NetHdrMrg, NetToken};
use crate::virtio::queue::SgList;

const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_HDR_MIN: usize = 20;
const TCP_HDR_MIN: usize = 20;

/// TCP data-offset / flags word, relative to the TCP header.
const TCP_OFF_FLAGS: usize = 12;
const TH_CWR: u8 = 0x80;

/// Record owning an in-flight transmit: the device reads the embedded
/// header and the packet chain until completion, at which point GC drops
/// the whole record.
pub struct TxRequest {
    pub hdr: NetHdrMrg,
    pub mbuf: Mbuf,
}

impl Net {
    /// Transmit one packet: pick a queue, submit under the ring lock and
    /// ring the doorbell on success.
    ///
    /// `flush` is accepted for send-queue interface compatibility and has
    /// no effect on submission.
    pub fn transmit(&self, m: Mbuf, flush: bool) -> Result<(), NetError> {
        let idx = self.pick_txq(&m);

        let guard = lock(&self.tx_ring_lock);
        let result = self.tx_locked(idx, m, flush);
        drop(guard);

        if result.is_ok() {
            self.transport().kick(2 * idx + 1);
        }
        result
    }

    /// Submission half, called with the TX ring lock held.
    ///
    /// Builds the scatter-gather (header first, then every non-empty
    /// fragment), reclaims completed slots when the ring is full, and
    /// accounts the outcome on the queue statistics. The `flush` hint is
    /// carried but unused.
    pub(crate) fn tx_locked(&self, idx: usize, m: Mbuf, _flush: bool) -> Result<(), NetError> {
        let txq = &self.txqs[idx];
        let vq = &*txq.vq;
        let stats = &txq.stats;

        let mut hdr = NetHdrMrg::default();

        let m = if !m.pkthdr().csum_flags.is_empty() {
            match self.tx_offload(m, &mut hdr.hdr) {
                Some(m) => m,
                None => {
                    // Not a well-formed offload candidate.
                    stats.tx_err.fetch_add(1, Ordering::Relaxed);
                    return Err(NetError::InvalidPacket);
                }
            }
        } else {
            m
        };

        let mut sg = SgList::new();
        sg.add_out(self.hdr_size());
        let mut tx_bytes = 0u64;
        for frag in m.frags() {
            hdr.num_buffers += 1;
            sg.add_out(frag.len());
            tx_bytes += frag.len() as u64;
        }

        if !vq.avail_ring_has_room(sg.len()) {
            if vq.used_ring_not_empty() {
                log::trace!(
                    target: "virtio-net",
                    "tx queue {idx} full, reclaiming completed requests"
                );
                self.tx_gc(idx);
            } else {
                log::debug!(target: "virtio-net", "tx queue {idx}: no room");
                stats.tx_drops.fetch_add(1, Ordering::Relaxed);
                return Err(NetError::NoBufferSpace);
            }
        }

        let needs_csum = NetHdrFlags::from_bits_truncate(hdr.hdr.flags)
            .contains(NetHdrFlags::NEEDS_CSUM);
        let is_gso = hdr.hdr.gso_type != gso::NONE;

        let request = Box::new(TxRequest { hdr, mbuf: m });
        if vq.add_buf(&sg, NetToken::Tx(request)).is_err() {
            log::trace!(target: "virtio-net", "tx queue {idx}: add_buf refused");
            stats.tx_drops.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::NoBufferSpace);
        }

        stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        stats.tx_bytes.fetch_add(tx_bytes, Ordering::Relaxed);
        if needs_csum {
            stats.tx_csum.fetch_add(1, Ordering::Relaxed);
        }
        if is_gso {
            stats.tx_tso.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Inspect L2/L3/L4 headers and populate the virtio header for the
    /// checksum and TSO requests carried by the packet.
    ///
    /// Returns the (possibly pulled-up) packet, or `None` when the packet
    /// cannot legally be offloaded and must be failed.
    pub(crate) fn tx_offload(&self, mut m: Mbuf, hdr: &mut NetHdr) -> Option<Mbuf> {
        let mut ip_offset = ETHER_HDR_LEN;
        if m.linear_len() < ip_offset {
            m.pullup(ip_offset).ok()?;
        }

        let mut eth_type = EthernetFrame::new_unchecked(m.linear()).ethertype();
        if eth_type == EthernetProtocol::Unknown(ETHERTYPE_VLAN) {
            ip_offset = ETHER_VLAN_HDR_LEN;
            if m.linear_len() < ip_offset {
                m.pullup(ip_offset).ok()?;
            }
            let linear = m.linear();
            eth_type = EthernetProtocol::from(u16::from_be_bytes([linear[16], linear[17]]));
        }

        let (csum_start, ip_proto, gso_type) = match eth_type {
            EthernetProtocol::Ipv4 => {
                if m.linear_len() < ip_offset + IP_HDR_MIN {
                    m.pullup(ip_offset + IP_HDR_MIN).ok()?;
                }
                let linear = m.linear();
                let ip_hl = ((linear[ip_offset] & 0x0f) as usize) * 4;
                let proto = IpProtocol::from(linear[ip_offset + 9]);
                (ip_offset + ip_hl, proto, gso::TCPV4)
            }
            // Anything else goes out as a plain frame; the device will
            // not touch it.
            _ => return Some(m),
        };

        let csum_flags = m.pkthdr().csum_flags;

        if csum_flags.intersects(CsumFlags::OFFLOAD) {
            hdr.flags |= NetHdrFlags::NEEDS_CSUM.bits();
            hdr.csum_start = csum_start as u16;
            hdr.csum_offset = m.pkthdr().csum_data as u16;
        }

        if csum_flags.contains(CsumFlags::CSUM_TSO) {
            if ip_proto != IpProtocol::Tcp {
                // The device only segments TCP.
                return Some(m);
            }

            if m.linear_len() < csum_start + TCP_HDR_MIN {
                m.pullup(csum_start + TCP_HDR_MIN).ok()?;
            }
            let linear = m.linear();
            let th_off = ((linear[csum_start + TCP_OFF_FLAGS] >> 4) as usize) * 4;

            hdr.gso_type = gso_type;
            hdr.hdr_len = (csum_start + th_off) as u16;
            hdr.gso_size = m.pkthdr().tso_segsz;

            if linear[csum_start + TCP_OFF_FLAGS + 1] & TH_CWR != 0 {
                if !self.feats().tso_ecn {
                    log::warn!(
                        target: "virtio-net",
                        "TSO with ECN not supported by host"
                    );
                    return None;
                }
                hdr.gso_type |= gso::ECN;
            }
        }

        Some(m)
    }

    /// Map the submitting context onto a queue pair. A pure function of
    /// the current CPU so callers sharing a CPU share a queue.
    pub(crate) fn pick_txq(&self, _m: &Mbuf) -> usize {
        self.cpus.current() % self.queue_pairs()
    }

    /// Reclaim every completed transmit: the request record, and with it
    /// the packet chain and header, is destroyed per completion.
    pub(crate) fn tx_gc(&self, idx: usize) {
        let vq = &self.txqs[idx].vq;
        while let Some(completion) = vq.get_buf_elem() {
            drop(completion.token);
            vq.get_buf_finalize();
        }
        vq.get_buf_gc();
    }
}
