//! # vanta-virtio
//!
//! Paravirtualized device models for the Vanta device host: the split
//! virtqueue ring engine and the per-device command streams built on it.
//!
//! - [`queue`]: descriptor table / available ring / used ring engine and
//!   lazy descriptor-chain traversal.
//! - [`request`]: shared-completion bookkeeping for chains whose
//!   sub-operations finish asynchronously.
//! - [`control`]: the control surface a hosting process drives (start,
//!   configure queue, ready, notify) plus interrupt delivery.
//! - [`memory`]: the guest physical memory window the engine reads rings
//!   and buffers through.
//! - [`devices`]: block, net, gpu, balloon, console, input, and the vfd
//!   multiplexer.
//!
//! Everything runs on one cooperative event loop per device: doorbells,
//! collaborator completions, and host events are all delivered from the same
//! thread, so device state needs no locking.

pub mod control;
pub mod devices;
pub mod memory;
pub mod queue;
pub mod request;
