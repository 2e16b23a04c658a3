//! Console command streams: receive (queue 0) and transmit (queue 1).
//!
//! Byte-oriented: transmit chains stream straight to the host sink, host
//! input is buffered and drained into guest receive buffers as they appear.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_CONSOLE, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{QueueError, VirtQueue};
use std::collections::VecDeque;
use tracing::warn;

const QUEUE_RX: u16 = 0;
const QUEUE_TX: u16 = 1;

/// Cap on buffered host input while the guest posts no receive buffers.
const MAX_PENDING_INPUT: usize = 64 * 1024;

/// Host side of the console.
pub trait ConsoleSink {
    fn write(&mut self, bytes: &[u8]);
}

/// Captures console output; test double for the host terminal.
#[derive(Debug, Default)]
pub struct ConsoleLog {
    pub output: Vec<u8>,
}

impl ConsoleSink for ConsoleLog {
    fn write(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }
}

pub struct Console<S: ConsoleSink> {
    sink: S,
    input: VecDeque<u8>,
}

impl<S: ConsoleSink> Console<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            input: VecDeque::new(),
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    /// Host input bytes for the guest. Buffered until receive buffers are
    /// available; bounded, dropping the oldest bytes on overflow.
    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
        if self.input.len() > MAX_PENDING_INPUT {
            let overflow = self.input.len() - MAX_PENDING_INPUT;
            warn!(overflow, "console input backlog full, dropping oldest bytes");
            self.input.drain(..overflow);
        }
    }

    fn drain_tx(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            while let Some(d) = chain.next_descriptor(mem, false) {
                if d.is_write_only() {
                    continue;
                }
                match mem.get_slice(d.addr, d.len as usize) {
                    Ok(bytes) => self.sink.write(bytes),
                    Err(_) => {
                        warn!(head = chain.head_index(), "console transmit buffer outside guest memory");
                        chain.fault();
                    }
                }
            }
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }

    fn drain_rx(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while !self.input.is_empty() {
            let Some(mut chain) = queue.next_chain(mem)? else {
                return Ok(());
            };
            let mut written = 0u32;
            while let Some(d) = chain.next_descriptor(mem, true) {
                if !d.is_write_only() || self.input.is_empty() {
                    continue;
                }
                let take = (d.len as usize).min(self.input.len());
                match mem.get_slice_mut(d.addr, take) {
                    Ok(dst) => {
                        for b in dst.iter_mut() {
                            *b = self.input.pop_front().unwrap_or(0);
                        }
                        written += take as u32;
                    }
                    Err(_) => {
                        warn!(head = chain.head_index(), "console receive buffer outside guest memory");
                    }
                }
            }
            chain.add_used(written);
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }
}

impl<S: ConsoleSink> VirtioDevice for Console<S> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_CONSOLE
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
        if index == QUEUE_RX {
            self.drain_rx(queue, mem)?;
        }
        Ok(())
    }
}
