//! Receive pipeline: per-queue polling agent, used-ring drain with
//! multi-buffer reassembly, checksum validation and ring refill.

use std::sync::atomic::Ordering;

use smoltcp::wire::{EthernetFrame, EthernetProtocol};

use crate::iface::{Capabilities, DrvFlags, ETHER_HDR_LEN};
use crate::mbuf::{CsumFlags, Mbuf, MCLBYTES};
use crate::virtio::net::{Net, NetHdr, NetHdrFlags, NetHdrMrg, NetToken};
use crate::virtio::queue::SgList;
use crate::virtio::transport::wait_for_queue;

const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_HDR_MIN: usize = 20;
const UDP_HDR_LEN: usize = 8;

/// Checksum field offsets within the L4 headers; the RX heuristic keys
/// off these because they are distinct for everything we care about.
const UDP_CSUM_FIELD: usize = 6;
const TCP_CSUM_FIELD: usize = 16;

impl Net {
    /// Body of one RX polling agent. Runs until teardown; parks on the
    /// queue whenever the used ring is dry.
    pub(crate) fn receiver(&self, idx: usize) {
        let rxq = self.rxqs[idx].clone();
        loop {
            wait_for_queue(&*rxq.vq, &rxq.wait, |q| {
                self.stopping() || q.used_ring_not_empty()
            });
            if self.stopping() {
                break;
            }
            log::trace!(target: "virtio-net", "rx wake on queue {idx}");
            self.rx_drain(idx);
        }
    }

    /// Drain every pending completion on RX queue `idx`, reassemble and
    /// deliver, then refill the ring when it runs low.
    pub(crate) fn rx_drain(&self, idx: usize) {
        let rxq = &self.rxqs[idx];
        let vq = &*rxq.vq;
        let hdr_size = self.hdr_size();

        let mut rx_drops = 0u64;
        let mut rx_packets = 0u64;
        let mut rx_bytes = 0u64;
        let mut csum_ok = 0u64;
        let mut csum_err = 0u64;

        let mut next = vq.get_buf_elem();
        while let Some(completion) = next {
            vq.get_buf_finalize();

            let NetToken::Rx(mut m) = completion.token else {
                next = vq.get_buf_elem();
                continue;
            };
            let len = completion.len as usize;

            // Too short to even carry the virtio header plus an Ethernet
            // header: drop and move on.
            if len < hdr_size + ETHER_HDR_LEN {
                rx_drops += 1;
                drop(m);
                next = vq.get_buf_elem();
                continue;
            }

            m.set_linear_len(len);
            let len = m.linear_len();

            // Copy the header out before the adjust below truncates it.
            let mhdr = NetHdrMrg::parse(m.linear());
            let nbufs = if !self.feats().mergeable_bufs {
                1
            } else {
                mhdr.num_buffers as usize
            };

            {
                let pkthdr = m.pkthdr_mut();
                pkthdr.len = len;
                pkthdr.csum_flags = CsumFlags::empty();
                pkthdr.rcvif = Some(self.interface().clone());
            }

            // Chain the remaining buffers of a merged packet.
            let mut incomplete = false;
            for _ in 1..nbufs {
                match vq.get_buf_elem() {
                    Some(frag) => {
                        vq.get_buf_finalize();
                        let NetToken::Rx(mut tail) = frag.token else {
                            continue;
                        };
                        tail.set_linear_len(frag.len as usize);
                        m.append(tail);
                    }
                    None => {
                        rx_drops += 1;
                        incomplete = true;
                        break;
                    }
                }
            }
            if incomplete {
                drop(m);
                next = vq.get_buf_elem();
                continue;
            }

            // The upper layers never see the virtio header.
            m.adj(hdr_size);

            if self.interface().capenable().contains(Capabilities::RXCSUM)
                && NetHdrFlags::from_bits_truncate(mhdr.hdr.flags)
                    .contains(NetHdrFlags::NEEDS_CSUM)
            {
                if bad_rx_csum(&mut m, &mhdr.hdr) {
                    csum_err += 1;
                } else {
                    csum_ok += 1;
                }
            }

            rx_packets += 1;
            rx_bytes += m.len() as u64;

            log::trace!(
                target: "virtio-net",
                "rx packet if={} len={}",
                self.interface().name(),
                m.len()
            );

            if let Some(m) = self.interface().post_classifier(m) {
                self.interface().input(m);
            }

            // The interface may have been stopped while the packet was on
            // its way up the stack.
            if !self.interface().drv_flags().contains(DrvFlags::RUNNING) {
                break;
            }

            next = vq.get_buf_elem();
        }

        if vq.refill_ring_cond() {
            self.fill_rx_ring(idx);
        }

        let stats = &rxq.stats;
        stats.rx_drops.fetch_add(rx_drops, Ordering::Relaxed);
        stats.rx_packets.fetch_add(rx_packets, Ordering::Relaxed);
        stats.rx_bytes.fetch_add(rx_bytes, Ordering::Relaxed);
        stats.rx_csum.fetch_add(csum_ok, Ordering::Relaxed);
        stats.rx_csum_err.fetch_add(csum_err, Ordering::Relaxed);
    }

    /// Post cluster buffers until the ring is full, then kick once.
    pub(crate) fn fill_rx_ring(&self, idx: usize) {
        let vq = &self.rxqs[idx].vq;
        let mut added = 0;
        let mut sg = SgList::new();

        while vq.avail_ring_not_empty() {
            let m = Mbuf::with_cluster(MCLBYTES);
            sg.reset();
            sg.add_in(MCLBYTES);
            if vq.add_buf(&sg, NetToken::Rx(m)).is_err() {
                break;
            }
            added += 1;
        }

        log::trace!(target: "virtio-net", "rx ring {idx} refilled with {added} buffers");

        if added > 0 {
            self.transport().kick(2 * idx);
        }
    }
}

/// Offsets-based receive checksum heuristic.
///
/// Rather than parsing the frame down to the IP payload, use
/// `csum_start + csum_offset` to decide what the device validated. Only
/// IPv4 is accepted, with one level of 802.1Q unwrapped.
///
/// Returns `true` when the checksum claim must be rejected.
pub(crate) fn bad_rx_csum(m: &mut Mbuf, hdr: &NetHdr) -> bool {
    let csum_start = hdr.csum_start as usize;
    let csum_len = csum_start + hdr.csum_offset as usize;

    if csum_len < ETHER_HDR_LEN + IP_HDR_MIN {
        return true;
    }
    if m.linear_len() < csum_len {
        return true;
    }

    let linear = m.linear();
    let mut eth_type = EthernetFrame::new_unchecked(linear).ethertype();
    if eth_type == EthernetProtocol::Unknown(ETHERTYPE_VLAN) {
        eth_type = EthernetProtocol::from(u16::from_be_bytes([linear[16], linear[17]]));
    }

    if eth_type != EthernetProtocol::Ipv4 {
        return true;
    }

    // The offset alone identifies the protocol the device checked.
    match hdr.csum_offset as usize {
        UDP_CSUM_FIELD => {
            if m.linear_len() < csum_start + UDP_HDR_LEN {
                return true;
            }
            let sum = u16::from_be_bytes([
                m.linear()[csum_start + UDP_CSUM_FIELD],
                m.linear()[csum_start + UDP_CSUM_FIELD + 1],
            ]);
            // A zero UDP checksum over IPv4 means "not computed": nothing
            // to validate.
            if sum == 0 {
                return false;
            }
            mark_csum_valid(m);
            false
        }
        TCP_CSUM_FIELD => {
            mark_csum_valid(m);
            false
        }
        _ => true,
    }
}

fn mark_csum_valid(m: &mut Mbuf) {
    let pkthdr = m.pkthdr_mut();
    pkthdr.csum_flags |= CsumFlags::CSUM_DATA_VALID | CsumFlags::CSUM_PSEUDO_HDR;
    pkthdr.csum_data = 0xffff;
}
