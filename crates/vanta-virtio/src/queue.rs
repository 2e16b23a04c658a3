//! Split virtqueue ring engine.
//!
//! One [`VirtQueue`] owns the device-side cursors for a single virtual queue:
//! the shadow cursor into the guest-written available ring and the write
//! cursor into the device-written used ring. Guest requests come out as
//! [`Chain`]s, lazy one-shot walks over one request's scatter/gather list.
//!
//! Both rings are append-only from exactly one side, so no locking is
//! involved; the only ordering requirement is that a used-ring entry is
//! written before the guest-visible used index that covers it.

use crate::memory::{
    read_u16_le, write_u16_le, write_u32_le, GuestMemory, GuestMemoryError,
};
use std::num::Wrapping;
use thiserror::Error;

pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

const DESC_ENTRY_SIZE: u64 = 16;
const RING_HEADER_SIZE: u64 = 4; // flags (u16) + idx (u16)
const AVAIL_ELEM_SIZE: u64 = 2;
const USED_ELEM_SIZE: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Control-plane contract violation; not guest-recoverable.
    #[error("queue size {0} is zero or not a power of two")]
    InvalidSize(u16),
    /// Control-plane contract violation; not guest-recoverable.
    #[error("queue ring tables overlap or overflow guest address space")]
    InconsistentAddresses,
    /// The guest advanced the available index further than the ring holds.
    #[error("available index ran {0} entries ahead of the device cursor")]
    AvailIndexOutOfRange(u16),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

/// One scatter/gather entry, as read from the guest descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtQueueConfig {
    pub size: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

/// One guest request: a lazy walk over a linked descriptor list.
///
/// A chain is exclusively owned by whichever handler pulled it until it is
/// handed back through [`VirtQueue::return_chain`], which publishes exactly
/// one used-ring entry. Returning twice is impossible (the chain is consumed);
/// dropping an unreturned chain is a leak and is logged.
#[derive(Debug)]
pub struct Chain {
    head: u16,
    next: Option<u16>,
    ttl: u16,
    queue_size: u16,
    desc_addr: u64,
    used_bytes: u32,
    writable_seen: u32,
    faulted: bool,
    returned: bool,
}

impl Chain {
    fn new(head: u16, queue_size: u16, desc_addr: u64) -> Self {
        let valid = head < queue_size;
        Self {
            head,
            next: valid.then_some(head),
            ttl: queue_size,
            queue_size,
            desc_addr,
            used_bytes: 0,
            writable_seen: 0,
            faulted: !valid,
            returned: false,
        }
    }

    pub fn head_index(&self) -> u16 {
        self.head
    }

    /// Yields the next descriptor in the chain, or `None` once exhausted.
    ///
    /// A descriptor whose direction does not match `expected_writable` is
    /// still yielded, but the chain is marked faulted so the caller can keep
    /// draining to the status descriptor and fail the request as a whole.
    /// Link loops, out-of-range links, and indirect descriptors (never
    /// negotiated by this device model) also fault the chain.
    pub fn next_descriptor(
        &mut self,
        mem: &dyn GuestMemory,
        expected_writable: bool,
    ) -> Option<Descriptor> {
        let desc = self.next_descriptor_any(mem)?;
        if desc.is_write_only() != expected_writable {
            self.faulted = true;
        }
        Some(desc)
    }

    /// Like [`Chain::next_descriptor`] but with no direction expectation.
    ///
    /// Streams whose grammar decides descriptor direction per position after
    /// inspecting earlier content (block: data direction depends on the
    /// opcode, the trailing status byte is always writable) pull with this
    /// and apply their own checks.
    pub fn next_descriptor_any(&mut self, mem: &dyn GuestMemory) -> Option<Descriptor> {
        let index = self.next?;
        if self.ttl == 0 {
            // Link cycle; cut traversal.
            self.faulted = true;
            self.next = None;
            return None;
        }
        self.ttl -= 1;

        let base = self.desc_addr + u64::from(index) * DESC_ENTRY_SIZE;
        let mut raw = [0u8; DESC_ENTRY_SIZE as usize];
        if mem.read(base, &mut raw).is_err() {
            self.faulted = true;
            self.next = None;
            return None;
        }
        let desc = Descriptor {
            addr: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
        };

        self.next = if desc.has_next() {
            if desc.next < self.queue_size {
                Some(desc.next)
            } else {
                self.faulted = true;
                None
            }
        } else {
            None
        };

        if desc.is_indirect() {
            self.faulted = true;
        }
        if desc.is_write_only() {
            self.writable_seen = self.writable_seen.saturating_add(desc.len);
        }

        Some(desc)
    }

    /// Whether another descriptor follows the last one yielded.
    pub fn has_more(&self) -> bool {
        self.next.is_some()
    }

    /// Accounts `n` bytes written into the chain's writable descriptors.
    ///
    /// The accumulator never exceeds the writable capacity seen so far; the
    /// used-ring length reported to the guest must not claim bytes the device
    /// could not have written.
    pub fn add_used(&mut self, n: u32) {
        self.used_bytes = self.used_bytes.saturating_add(n).min(self.writable_seen);
    }

    pub fn used_bytes(&self) -> u32 {
        self.used_bytes
    }

    /// Marks the chain malformed at the device protocol level (e.g. missing
    /// status descriptor) without ending traversal.
    pub fn fault(&mut self) {
        self.faulted = true;
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        // A chain that dies without publishing a used entry leaks its
        // descriptors from the guest's point of view.
        if !self.returned && !std::thread::panicking() {
            tracing::error!(head = self.head, "descriptor chain dropped without being returned");
        }
    }
}

/// Device-side state for one virtual queue.
#[derive(Debug)]
pub struct VirtQueue {
    size: u16,
    desc_addr: u64,
    avail_addr: u64,
    used_addr: u64,
    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
    interrupt_pending: bool,
}

impl VirtQueue {
    /// Binds the three ring tables. Errors here are control-plane
    /// misconfiguration and are treated as fatal by the control surface.
    pub fn new(config: VirtQueueConfig) -> Result<Self, QueueError> {
        let size = config.size;
        if size == 0 || !size.is_power_of_two() {
            return Err(QueueError::InvalidSize(size));
        }

        let size64 = u64::from(size);
        let desc_len = DESC_ENTRY_SIZE * size64;
        let avail_len = RING_HEADER_SIZE + AVAIL_ELEM_SIZE * size64;
        let used_len = RING_HEADER_SIZE + USED_ELEM_SIZE * size64;
        let ranges = [
            (config.desc_addr, desc_len),
            (config.avail_addr, avail_len),
            (config.used_addr, used_len),
        ];
        for (start, len) in ranges {
            if start.checked_add(len).is_none() {
                return Err(QueueError::InconsistentAddresses);
            }
        }
        for (i, &(a_start, a_len)) in ranges.iter().enumerate() {
            for &(b_start, b_len) in &ranges[i + 1..] {
                if a_start < b_start + b_len && b_start < a_start + a_len {
                    return Err(QueueError::InconsistentAddresses);
                }
            }
        }

        Ok(Self {
            size,
            desc_addr: config.desc_addr,
            avail_addr: config.avail_addr,
            used_addr: config.used_addr,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            interrupt_pending: false,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Non-blocking: returns the next guest-posted chain, or `None` when the
    /// available ring holds nothing new.
    pub fn next_chain(&mut self, mem: &dyn GuestMemory) -> Result<Option<Chain>, QueueError> {
        let guest_idx = Wrapping(read_u16_le(mem, self.avail_addr + 2)?);
        if guest_idx == self.next_avail {
            return Ok(None);
        }
        let ready = (guest_idx - self.next_avail).0;
        if ready > self.size {
            return Err(QueueError::AvailIndexOutOfRange(ready));
        }

        let slot = u64::from(self.next_avail.0 % self.size);
        let head = read_u16_le(
            mem,
            self.avail_addr + RING_HEADER_SIZE + slot * AVAIL_ELEM_SIZE,
        )?;
        self.next_avail += 1;
        Ok(Some(Chain::new(head, self.size, self.desc_addr)))
    }

    /// Publishes the chain's used-byte count and consumes it.
    ///
    /// The ring entry is written before the guest-visible index so a polling
    /// guest never observes an index covering an unwritten entry.
    pub fn return_chain(
        &mut self,
        mem: &mut dyn GuestMemory,
        mut chain: Chain,
    ) -> Result<(), QueueError> {
        chain.returned = true;
        let (id, len) = (chain.head, chain.used_bytes);
        drop(chain);

        let slot = u64::from(self.next_used.0 % self.size);
        let entry = self.used_addr + RING_HEADER_SIZE + slot * USED_ELEM_SIZE;
        write_u32_le(mem, entry, u32::from(id))?;
        write_u32_le(mem, entry + 4, len)?;
        self.next_used += 1;
        write_u16_le(mem, self.used_addr + 2, self.next_used.0)?;
        self.interrupt_pending = true;
        Ok(())
    }

    /// Returns-and-clears the "used entries published since last check" flag.
    ///
    /// The control surface signals the interrupt sink once per drain when
    /// this reports true, batching one notification over any number of
    /// returned chains.
    pub fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.interrupt_pending)
    }
}
