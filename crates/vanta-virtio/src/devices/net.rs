//! Network command streams: receive (queue 0) and transmit (queue 1).
//!
//! Transmit enforces strict in-order, exactly-once delivery: when the host
//! path reports backpressure the in-flight chain is held, not returned, and
//! nothing later is consumed until the path signals ready again. Receive is
//! driven by inbound frames from the host path rather than guest doorbells;
//! frames wait in a bounded queue until the guest posts receive buffers.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_NET, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{Chain, Descriptor, QueueError, VirtQueue};
use std::collections::VecDeque;
use tracing::{error, warn};

pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;

pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;

/// Cap on frames buffered while the guest posts no receive buffers. The
/// oldest frame is dropped past this point; real NICs do not buffer
/// indefinitely either.
const MAX_PENDING_RX_FRAMES: usize = 256;

/// Result of handing one frame to the host network path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Sent,
    /// The path cannot take the frame right now; the caller must hold the
    /// frame and retry it, unchanged, after a ready signal.
    NotReady,
}

/// Host network path boundary.
pub trait NetBackend {
    fn transmit(&mut self, frame: &[u8]) -> TxStatus;
}

/// Test/loopback path: records transmitted frames, with scriptable
/// backpressure.
#[derive(Debug)]
pub struct LoopbackNet {
    pub tx_frames: Vec<Vec<u8>>,
    pub ready: bool,
}

impl Default for LoopbackNet {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNet {
    pub fn new() -> Self {
        Self {
            tx_frames: Vec::new(),
            ready: true,
        }
    }
}

impl NetBackend for LoopbackNet {
    fn transmit(&mut self, frame: &[u8]) -> TxStatus {
        if self.ready {
            self.tx_frames.push(frame.to_vec());
            TxStatus::Sent
        } else {
            TxStatus::NotReady
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub mac: [u8; 6],
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
        }
    }
}

/// `virtio_net_hdr`: 10 bytes, plus `num_buffers` when MRG_RXBUF is
/// negotiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    pub const BASE_LEN: usize = 10;
    pub const MRG_LEN: usize = 12;

    fn to_bytes_le(self) -> [u8; Self::MRG_LEN] {
        let mut out = [0u8; Self::MRG_LEN];
        out[0] = self.flags;
        out[1] = self.gso_type;
        out[2..4].copy_from_slice(&self.hdr_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        out[6..8].copy_from_slice(&self.csum_start.to_le_bytes());
        out[8..10].copy_from_slice(&self.csum_offset.to_le_bytes());
        out[10..12].copy_from_slice(&self.num_buffers.to_le_bytes());
        out
    }
}

pub struct Net<B: NetBackend> {
    backend: B,
    config: NetConfig,
    features: u64,
    /// Frame serialized from the chain the host path rejected; held together
    /// so resume retransmits the exact bytes once.
    stalled_tx: Option<(Chain, Vec<u8>)>,
    tx_resumable: bool,
    rx_frames: VecDeque<Vec<u8>>,
}

impl<B: NetBackend> Net<B> {
    pub fn new(backend: B, config: NetConfig) -> Self {
        Self {
            backend,
            config,
            features: 0,
            stalled_tx: None,
            tx_resumable: false,
            rx_frames: VecDeque::new(),
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn mac(&self) -> [u8; 6] {
        self.config.mac
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_NET_F_MAC | VIRTIO_NET_F_MRG_RXBUF
    }

    /// Host path signal: transmit capacity is available again. The stalled
    /// chain (if any) resumes on the next poll.
    pub fn tx_ready(&mut self) {
        self.tx_resumable = true;
    }

    /// Inbound frame from the host path. Queued until the guest provides a
    /// receive buffer; bounded, dropping the oldest frame on overflow.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        if self.rx_frames.len() == MAX_PENDING_RX_FRAMES {
            warn!("receive backlog full, dropping oldest frame");
            self.rx_frames.pop_front();
        }
        self.rx_frames.push_back(frame);
    }

    fn hdr_len(&self) -> usize {
        if self.features & VIRTIO_NET_F_MRG_RXBUF != 0 {
            VirtioNetHdr::MRG_LEN
        } else {
            VirtioNetHdr::BASE_LEN
        }
    }

    fn drain_tx(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        // A stalled chain blocks the queue until the host path signals
        // ready; it is then retried first so nothing is reordered or sent
        // twice.
        if let Some((chain, frame)) = self.stalled_tx.take() {
            if !self.tx_resumable {
                self.stalled_tx = Some((chain, frame));
                return Ok(());
            }
            self.tx_resumable = false;
            match self.backend.transmit(&frame) {
                TxStatus::Sent => queue.return_chain(mem, chain)?,
                TxStatus::NotReady => {
                    self.stalled_tx = Some((chain, frame));
                    return Ok(());
                }
            }
        }

        while let Some(mut chain) = queue.next_chain(mem)? {
            // Exactly one read-only descriptor: header immediately followed
            // by the frame, never spanning descriptors.
            let desc = chain.next_descriptor(mem, false);
            let valid = match desc {
                Some(d) => {
                    !chain.has_more() && !chain.is_faulted() && (d.len as usize) > self.hdr_len()
                }
                None => false,
            };
            let Some(d) = desc.filter(|_| valid) else {
                while chain.next_descriptor_any(mem).is_some() {}
                warn!(head = chain.head_index(), "malformed transmit chain dropped");
                queue.return_chain(mem, chain)?;
                continue;
            };

            let frame = match mem.get_slice(d.addr, d.len as usize) {
                Ok(buf) => buf[self.hdr_len()..].to_vec(),
                Err(_) => {
                    warn!(head = chain.head_index(), "transmit buffer outside guest memory");
                    queue.return_chain(mem, chain)?;
                    continue;
                }
            };

            match self.backend.transmit(&frame) {
                TxStatus::Sent => queue.return_chain(mem, chain)?,
                TxStatus::NotReady => {
                    self.stalled_tx = Some((chain, frame));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn drain_rx(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        let hdr_len = self.hdr_len();
        let header = VirtioNetHdr {
            flags: 0,
            gso_type: VIRTIO_NET_HDR_GSO_NONE,
            num_buffers: if hdr_len == VirtioNetHdr::MRG_LEN { 1 } else { 0 },
            ..Default::default()
        }
        .to_bytes_le();

        while let Some(frame) = self.rx_frames.front() {
            let Some(mut chain) = queue.next_chain(mem)? else {
                // No guest buffer: frames keep waiting.
                return Ok(());
            };

            let mut bufs: Vec<Descriptor> = Vec::new();
            while let Some(d) = chain.next_descriptor(mem, true) {
                bufs.push(d);
            }
            if chain.is_faulted() {
                warn!(head = chain.head_index(), "malformed receive buffer chain");
                queue.return_chain(mem, chain)?;
                continue;
            }

            let capacity: u64 = bufs.iter().map(|d| u64::from(d.len)).sum();
            let need = (hdr_len + frame.len()) as u64;
            if need > capacity {
                // The frame cannot be delivered into this buffer. Drop the
                // frame; the buffer goes back unused.
                error!(
                    frame_len = frame.len(),
                    capacity, "receive buffer too small, dropping frame"
                );
                self.rx_frames.pop_front();
                queue.return_chain(mem, chain)?;
                continue;
            }
            let frame = self.rx_frames.pop_front().unwrap_or_default();

            // Rewritten header first (off sentinels for unnegotiated
            // features), then the frame, across however many descriptors.
            let mut src: Vec<u8> = Vec::with_capacity(need as usize);
            src.extend_from_slice(&header[..hdr_len]);
            src.extend_from_slice(&frame);
            let mut written = 0usize;
            for d in &bufs {
                if written == src.len() {
                    break;
                }
                let take = (src.len() - written).min(d.len as usize);
                match mem.get_slice_mut(d.addr, take) {
                    Ok(dst) => dst.copy_from_slice(&src[written..written + take]),
                    Err(_) => {
                        warn!(head = chain.head_index(), "receive buffer outside guest memory");
                        break;
                    }
                }
                written += take;
            }
            chain.add_used(written as u32);
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }
}

impl<B: NetBackend> VirtioDevice for Net<B> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_NET
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn ready(&mut self, features: u64) {
        self.features = features;
    }

    fn notify_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        match index {
            QUEUE_RX => self.drain_rx(queue, mem),
            QUEUE_TX => self.drain_tx(queue, mem),
            _ => Ok(()),
        }
    }

    fn poll_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        self.notify_queue(index, queue, mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{read_u16_le, read_u32_le, write_u16_le, write_u32_le, write_u64_le, GuestRam};
    use crate::queue::{VirtQueueConfig, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

    const DESC: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;

    fn write_desc(mem: &mut GuestRam, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let base = DESC + u64::from(index) * 16;
        write_u64_le(mem, base, addr).unwrap();
        write_u32_le(mem, base + 8, len).unwrap();
        write_u16_le(mem, base + 12, flags).unwrap();
        write_u16_le(mem, base + 14, next).unwrap();
    }

    fn post_avail(mem: &mut GuestRam, slot: u16, head: u16, idx: u16) {
        write_u16_le(mem, AVAIL + 4 + u64::from(slot) * 2, head).unwrap();
        write_u16_le(mem, AVAIL + 2, idx).unwrap();
    }

    fn ring() -> VirtQueue {
        VirtQueue::new(VirtQueueConfig {
            size: 8,
            desc_addr: DESC,
            avail_addr: AVAIL,
            used_addr: USED,
        })
        .unwrap()
    }

    fn put_tx_frame(mem: &mut GuestRam, index: u16, addr: u64, payload: &[u8]) {
        let total = VirtioNetHdr::BASE_LEN + payload.len();
        mem.write(addr, &[0u8; VirtioNetHdr::BASE_LEN]).unwrap();
        mem.write(addr + VirtioNetHdr::BASE_LEN as u64, payload)
            .unwrap();
        write_desc(mem, index, addr, total as u32, 0, 0);
    }

    #[test]
    fn tx_strips_header_and_forwards_payload() {
        let mut mem = GuestRam::new(0x10000);
        let mut queue = ring();
        let mut net = Net::new(LoopbackNet::new(), NetConfig::default());

        put_tx_frame(&mut mem, 0, 0x4000, b"frame-one");
        post_avail(&mut mem, 0, 0, 1);

        net.notify_queue(QUEUE_TX, &mut queue, &mut mem).unwrap();
        assert_eq!(net.backend_mut().tx_frames, vec![b"frame-one".to_vec()]);
        assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
    }

    #[test]
    fn tx_chain_spanning_descriptors_is_rejected() {
        let mut mem = GuestRam::new(0x10000);
        let mut queue = ring();
        let mut net = Net::new(LoopbackNet::new(), NetConfig::default());

        write_desc(&mut mem, 0, 0x4000, 10, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&mut mem, 1, 0x5000, 32, 0, 0);
        post_avail(&mut mem, 0, 0, 1);

        net.notify_queue(QUEUE_TX, &mut queue, &mut mem).unwrap();
        assert!(net.backend_mut().tx_frames.is_empty());
        // The malformed chain is still returned to the guest.
        assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
    }

    #[test]
    fn rx_buffer_too_small_drops_frame_and_returns_buffer() {
        let mut mem = GuestRam::new(0x10000);
        let mut queue = ring();
        let mut net = Net::new(LoopbackNet::new(), NetConfig::default());

        net.push_frame(vec![0xab; 64]);
        write_desc(&mut mem, 0, 0x4000, 16, VIRTQ_DESC_F_WRITE, 0);
        post_avail(&mut mem, 0, 0, 1);

        net.notify_queue(QUEUE_RX, &mut queue, &mut mem).unwrap();

        // Buffer returned with zero bytes used; frame gone.
        assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
        assert_eq!(read_u32_le(&mem, USED + 8).unwrap(), 0);

        net.push_frame(vec![0xcd; 4]);
        write_desc(&mut mem, 1, 0x5000, 64, VIRTQ_DESC_F_WRITE, 0);
        post_avail(&mut mem, 1, 1, 2);
        net.notify_queue(QUEUE_RX, &mut queue, &mut mem).unwrap();
        assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 2);
        // Second frame delivered: rewritten header, then payload.
        let delivered = mem.get_slice(0x5000, VirtioNetHdr::BASE_LEN + 4).unwrap();
        assert_eq!(&delivered[VirtioNetHdr::BASE_LEN..], &[0xcd; 4]);
    }

    #[test]
    fn rx_header_spans_descriptors() {
        let mut mem = GuestRam::new(0x10000);
        let mut queue = ring();
        let mut net = Net::new(LoopbackNet::new(), NetConfig::default());

        net.push_frame(vec![0x55; 8]);
        write_desc(&mut mem, 0, 0x4000, 6, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 1);
        write_desc(&mut mem, 1, 0x5000, 32, VIRTQ_DESC_F_WRITE, 0);
        post_avail(&mut mem, 0, 0, 1);

        net.notify_queue(QUEUE_RX, &mut queue, &mut mem).unwrap();
        assert_eq!(
            read_u32_le(&mem, USED + 8).unwrap(),
            (VirtioNetHdr::BASE_LEN + 8) as u32
        );
        // Payload lands after the header split across both descriptors.
        let tail = mem.get_slice(0x5000, VirtioNetHdr::BASE_LEN - 6 + 8).unwrap();
        assert_eq!(&tail[VirtioNetHdr::BASE_LEN - 6..], &[0x55; 8]);
    }
}
