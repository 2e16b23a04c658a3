//! Input command streams: events (queue 0) and status (queue 1).
//!
//! Host input events are buffered (bounded, oldest dropped) and written one
//! event per guest buffer. The status queue flows the other way: the guest
//! reports things like LED state, which are parsed and forwarded.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_INPUT, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{QueueError, VirtQueue};
use std::collections::VecDeque;
use tracing::warn;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_LED: u16 = 0x11;

pub const SYN_REPORT: u16 = 0x00;

const QUEUE_EVENTS: u16 = 0;
const QUEUE_STATUS: u16 = 1;

/// Cap on buffered events while the guest is not consuming the event queue.
/// Real input hardware does not buffer indefinitely; dropping the oldest
/// event beats unbounded growth.
const MAX_PENDING_EVENTS: usize = 4096;

/// One `virtio_input_event`: 8 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub type_: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub const WIRE_LEN: usize = 8;

    fn to_le_bytes(self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..2].copy_from_slice(&self.type_.to_le_bytes());
        out[2..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    fn from_le_bytes(raw: [u8; Self::WIRE_LEN]) -> Self {
        Self {
            type_: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            code: u16::from_le_bytes(raw[2..4].try_into().unwrap()),
            value: i32::from_le_bytes(raw[4..8].try_into().unwrap()),
        }
    }
}

/// Host side of the input device; receives guest status writes (LEDs).
pub trait InputBackend {
    fn status(&mut self, event: InputEvent);
}

/// Records status events; test double.
#[derive(Debug, Default)]
pub struct StatusLog {
    pub events: Vec<InputEvent>,
}

impl InputBackend for StatusLog {
    fn status(&mut self, event: InputEvent) {
        self.events.push(event);
    }
}

pub struct Input<B: InputBackend> {
    backend: B,
    pending: VecDeque<InputEvent>,
}

impl<B: InputBackend> Input<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            pending: VecDeque::new(),
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    /// Queues one event for the guest, bounded.
    pub fn push_event(&mut self, event: InputEvent) {
        if self.pending.len() == MAX_PENDING_EVENTS {
            warn!("input event backlog full, dropping oldest event");
            self.pending.pop_front();
        }
        self.pending.push_back(event);
    }

    fn drain_events(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while !self.pending.is_empty() {
            let Some(mut chain) = queue.next_chain(mem)? else {
                return Ok(());
            };
            let mut written = 0u32;
            if let Some(d) = chain.next_descriptor(mem, true) {
                if d.is_write_only() && (d.len as usize) >= InputEvent::WIRE_LEN {
                    if let Some(event) = self.pending.pop_front() {
                        match mem.write(d.addr, &event.to_le_bytes()) {
                            Ok(()) => written = InputEvent::WIRE_LEN as u32,
                            Err(_) => {
                                warn!(head = chain.head_index(), "event buffer outside guest memory")
                            }
                        }
                    }
                }
            }
            while chain.next_descriptor_any(mem).is_some() {}
            chain.add_used(written);
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }

    fn drain_status(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            while let Some(d) = chain.next_descriptor(mem, false) {
                if d.is_write_only() {
                    continue;
                }
                let mut off = 0u64;
                while off + InputEvent::WIRE_LEN as u64 <= u64::from(d.len) {
                    let mut raw = [0u8; InputEvent::WIRE_LEN];
                    if mem.read(d.addr + off, &mut raw).is_err() {
                        break;
                    }
                    self.backend.status(InputEvent::from_le_bytes(raw));
                    off += InputEvent::WIRE_LEN as u64;
                }
            }
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }
}

impl<B: InputBackend> VirtioDevice for Input<B> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_INPUT
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn ready(&mut self, _features: u64) {}

    fn notify_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        match index {
            QUEUE_EVENTS => self.drain_events(queue, mem),
            QUEUE_STATUS => self.drain_status(queue, mem),
            _ => Ok(()),
        }
    }

    fn poll_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        if index == QUEUE_EVENTS {
            self.drain_events(queue, mem)?;
        }
        Ok(())
    }
}
