//! Device control surface.
//!
//! The host control plane drives a device through four operations: `start`
//! (one-time binding of the interrupt sink), `configure_queue`, `ready`
//! (feature latch), and `notify_queue` (the guest doorbell). The transport
//! that carries those operations is out of scope; the hosting process calls
//! the methods here directly from its event loop.
//!
//! Misuse of this surface (an out-of-range queue index, a malformed queue
//! configuration) is a contract violation by the control plane, not a
//! guest-triggerable condition: errors here are fatal and the host is
//! expected to terminate the device.

use crate::memory::GuestMemory;
use crate::queue::{QueueError, VirtQueue, VirtQueueConfig};
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("queue index {index} out of range for device with {count} queues")]
    InvalidQueueIndex { index: u16, count: u16 },
    #[error("queue {index} notified before being configured")]
    QueueNotConfigured { index: u16 },
    #[error("queue {index} misconfigured: {source}")]
    QueueMisconfigured {
        index: u16,
        #[source]
        source: QueueError,
    },
    #[error("queue {index} processing failed: {source}")]
    QueueBroken {
        index: u16,
        #[source]
        source: QueueError,
    },
}

/// Device-to-guest notification line.
pub trait InterruptSink {
    fn signal(&self);
}

/// Device-specific acknowledgement returned from `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartInfo {
    /// Backing-store size in bytes, for devices that have one (block).
    pub backing_size: Option<u64>,
}

/// The capability set every device kind implements. The set is closed:
/// Block, Net, Gpu, Balloon, Console, Input, Wl.
pub trait VirtioDevice {
    fn device_type(&self) -> u32;

    fn num_queues(&self) -> u16;

    /// One-time setup acknowledgement (e.g. block reports its capacity).
    fn on_start(&mut self) -> StartInfo {
        StartInfo::default()
    }

    /// Latches the negotiated feature bitmask. Features that alter command
    /// semantics (read-only block, mergeable rx buffers) take effect here.
    fn ready(&mut self, features: u64);

    /// Guest doorbell for one queue. Must return promptly: anything that
    /// could block is issued to a collaborator and completed via
    /// [`VirtioDevice::poll_queue`].
    fn notify_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError>;

    /// Drives host-event work for one queue: collaborator completions,
    /// inbound frames, pending announcements. Default: nothing to do.
    fn poll_queue(
        &mut self,
        _index: u16,
        _queue: &mut VirtQueue,
        _mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Binds one device to its queues and interrupt line and exposes the
/// control-plane operations.
pub struct DeviceHost<D: VirtioDevice> {
    device: D,
    queues: Vec<Option<VirtQueue>>,
    interrupt: Box<dyn InterruptSink>,
    features: u64,
}

impl<D: VirtioDevice> DeviceHost<D> {
    pub fn start(mut device: D, interrupt: Box<dyn InterruptSink>) -> (Self, StartInfo) {
        let info = device.on_start();
        let queues = (0..device.num_queues()).map(|_| None).collect();
        (
            Self {
                device,
                queues,
                interrupt,
                features: 0,
            },
            info,
        )
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    /// Populates one queue. Index and configuration errors are fatal.
    pub fn configure_queue(
        &mut self,
        index: u16,
        size: u16,
        desc_addr: u64,
        avail_addr: u64,
        used_addr: u64,
    ) -> Result<(), ControlError> {
        let count = self.device.num_queues();
        let slot = self
            .queues
            .get_mut(usize::from(index))
            .ok_or(ControlError::InvalidQueueIndex { index, count })?;
        let queue = VirtQueue::new(VirtQueueConfig {
            size,
            desc_addr,
            avail_addr,
            used_addr,
        })
        .map_err(|source| ControlError::QueueMisconfigured { index, source })?;
        *slot = Some(queue);
        Ok(())
    }

    /// Latches negotiated features into the device.
    pub fn ready(&mut self, features: u64) {
        self.features = features;
        self.device.ready(features);
    }

    /// Guest doorbell. Drains the queue through the device, then signals the
    /// interrupt sink at most once for however many chains were returned.
    pub fn notify_queue(
        &mut self,
        index: u16,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), ControlError> {
        let count = self.device.num_queues();
        let queue = self
            .queues
            .get_mut(usize::from(index))
            .ok_or(ControlError::InvalidQueueIndex { index, count })?
            .as_mut()
            .ok_or(ControlError::QueueNotConfigured { index })?;

        self.device
            .notify_queue(index, queue, mem)
            .map_err(|source| ControlError::QueueBroken { index, source })?;

        if queue.take_interrupt() {
            self.interrupt.signal();
        }
        Ok(())
    }

    /// Drives host-event work (completions, inbound data) on every
    /// configured queue, signalling at most once per queue.
    pub fn poll(&mut self, mem: &mut dyn GuestMemory) -> Result<(), ControlError> {
        for (index, slot) in self.queues.iter_mut().enumerate() {
            let Some(queue) = slot.as_mut() else {
                continue;
            };
            let index = index as u16;
            self.device
                .poll_queue(index, queue, mem)
                .map_err(|source| ControlError::QueueBroken { index, source })?;
            if queue.take_interrupt() {
                self.interrupt.signal();
            }
        }
        Ok(())
    }
}

/// Interrupt sink that counts signals. Hosts use it for diagnostics; tests
/// use it to assert notification batching.
#[derive(Clone, Default)]
pub struct InterruptCounter(Rc<Cell<u32>>);

impl InterruptCounter {
    pub fn count(&self) -> u32 {
        self.0.get()
    }
}

impl InterruptSink for InterruptCounter {
    fn signal(&self) {
        self.0.set(self.0.get() + 1);
    }
}
