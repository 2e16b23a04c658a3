//! Block command stream.
//!
//! Single queue. Each chain is a fixed 16-byte header, a data descriptor
//! list, and a trailing writable status byte. Data descriptors are issued to
//! the backing store as independent sub-operations; the chain is held by a
//! [`Request`] until the last completion, then the worst-observed status is
//! written and the chain returned. Requests may complete out of order.

use crate::control::{StartInfo, VirtioDevice};
use crate::devices::{VIRTIO_DEVICE_TYPE_BLOCK, VIRTIO_F_VERSION_1};
use crate::memory::{write_u8, GuestMemory};
use crate::queue::{Chain, Descriptor, QueueError, VirtQueue};
use crate::request::{Completion, Request};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

pub const SECTOR_SIZE: u64 = 512;

pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Identification string capacity on the wire.
pub const BLOCK_ID_LEN: usize = 20;

const REQUEST_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockIoError {
    #[error("request outside backing store bounds")]
    OutOfBounds,
    #[error("backing store I/O error")]
    Io,
}

/// Token tying an in-flight backing-store operation to its sub-operation
/// bookkeeping.
pub type IoToken = u64;

/// One finished backing-store operation.
#[derive(Debug)]
pub struct IoCompletion {
    pub token: IoToken,
    /// Read completions carry the data; writes and flushes carry `None`.
    pub result: Result<Option<Vec<u8>>, BlockIoError>,
}

/// Backing-store boundary. Operations are submitted with a token and finish
/// through [`BlockBackend::poll_completion`]; a backend is free to complete
/// immediately (in-memory disks) or on a later poll (real I/O).
pub trait BlockBackend {
    fn capacity_bytes(&self) -> u64;
    fn submit_read(&mut self, token: IoToken, offset: u64, len: u32);
    fn submit_write(&mut self, token: IoToken, offset: u64, data: Vec<u8>);
    fn submit_flush(&mut self, token: IoToken);
    fn poll_completion(&mut self) -> Option<IoCompletion>;
}

/// In-memory disk that completes every operation on the next poll.
#[derive(Debug, Default)]
pub struct MemDisk {
    data: Vec<u8>,
    done: std::collections::VecDeque<IoCompletion>,
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            done: Default::default(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn range(&self, offset: u64, len: usize) -> Result<usize, BlockIoError> {
        let start = usize::try_from(offset).map_err(|_| BlockIoError::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(BlockIoError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(BlockIoError::OutOfBounds);
        }
        Ok(start)
    }
}

impl BlockBackend for MemDisk {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn submit_read(&mut self, token: IoToken, offset: u64, len: u32) {
        let result = self
            .range(offset, len as usize)
            .map(|start| Some(self.data[start..start + len as usize].to_vec()));
        self.done.push_back(IoCompletion { token, result });
    }

    fn submit_write(&mut self, token: IoToken, offset: u64, data: Vec<u8>) {
        let result = self.range(offset, data.len()).map(|start| {
            self.data[start..start + data.len()].copy_from_slice(&data);
            None
        });
        self.done.push_back(IoCompletion { token, result });
    }

    fn submit_flush(&mut self, token: IoToken) {
        self.done.push_back(IoCompletion {
            token,
            result: Ok(None),
        });
    }

    fn poll_completion(&mut self) -> Option<IoCompletion> {
        self.done.pop_front()
    }
}

#[derive(Debug, Clone)]
pub struct BlockConfig {
    pub read_only: bool,
    /// Identification string returned by GET_ID, truncated to wire capacity.
    pub id: String,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            id: "vanta-blk".to_string(),
        }
    }
}

/// In-flight sub-operation: which request it belongs to and, for reads, the
/// guest range the data lands in.
#[derive(Debug, Clone, Copy)]
struct PendingOp {
    request: u64,
    dest: Option<(u64, u32)>,
}

#[derive(Debug)]
struct PendingRequest {
    request: Request,
    status_addr: u64,
}

pub struct Block<B: BlockBackend> {
    backend: B,
    config: BlockConfig,
    features: u64,
    requests: HashMap<u64, PendingRequest>,
    ops: HashMap<IoToken, PendingOp>,
    next_id: u64,
}

impl<B: BlockBackend> Block<B> {
    pub fn new(backend: B, config: BlockConfig) -> Self {
        Self {
            backend,
            config,
            features: 0,
            requests: HashMap::new(),
            ops: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device_features(&self) -> u64 {
        let mut features = VIRTIO_F_VERSION_1 | VIRTIO_BLK_F_FLUSH;
        if self.config.read_only {
            features |= VIRTIO_BLK_F_RO;
        }
        features
    }

    fn read_only(&self) -> bool {
        self.config.read_only || (self.features & VIRTIO_BLK_F_RO) != 0
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn begin_request(
        &mut self,
        mut chain: Chain,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        // Header: fixed 16 bytes in the leading read-only descriptor(s).
        let mut header = [0u8; REQUEST_HEADER_LEN];
        let mut got = 0usize;
        while got < REQUEST_HEADER_LEN {
            let Some(d) = chain.next_descriptor(mem, false) else {
                break;
            };
            if d.is_write_only() || !chain.has_more() {
                // Ran into the status byte (or a malformed chain) before the
                // header was complete.
                chain.fault();
                break;
            }
            let take = (d.len as usize).min(REQUEST_HEADER_LEN - got);
            match mem.get_slice(d.addr, take) {
                Ok(src) => header[got..got + take].copy_from_slice(src),
                Err(_) => {
                    chain.fault();
                    break;
                }
            }
            got += take;
            if take < d.len as usize {
                // Header and first data buffer share a descriptor; the block
                // grammar keeps them separate, so treat this as malformed.
                chain.fault();
                break;
            }
        }

        // Remaining descriptors: data list plus the trailing status byte.
        let mut rest: Vec<Descriptor> = Vec::new();
        while let Some(d) = chain.next_descriptor_any(mem) {
            rest.push(d);
        }

        let Some(status_desc) = rest.pop() else {
            // No status descriptor at all: nothing can carry an error code,
            // but the chain must still go back to the guest.
            warn!(head = chain.head_index(), "block request without status descriptor");
            return queue.return_chain(mem, chain);
        };
        if !status_desc.is_write_only() || status_desc.len == 0 {
            warn!(head = chain.head_index(), "block request status descriptor not writable");
            return queue.return_chain(mem, chain);
        }
        let status_addr = status_desc.addr;

        let mut request = Request::new(chain, VIRTIO_BLK_S_OK);
        if got < REQUEST_HEADER_LEN || request.chain_mut().is_faulted() {
            request.fail(VIRTIO_BLK_S_IOERR);
            return self.finish_request(request, status_addr, queue, mem);
        }

        let typ = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let sector = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let request_id = self.alloc_id();

        match typ {
            VIRTIO_BLK_T_IN => {
                let mut offset = sector.wrapping_mul(SECTOR_SIZE);
                for d in &rest {
                    let valid = d.is_write_only()
                        && u64::from(d.len) % SECTOR_SIZE == 0
                        && d.len != 0
                        && in_bounds(offset, d.len, self.backend.capacity_bytes());
                    if valid {
                        let token = self.alloc_id();
                        self.ops.insert(
                            token,
                            PendingOp {
                                request: request_id,
                                dest: Some((d.addr, d.len)),
                            },
                        );
                        request.begin();
                        self.backend.submit_read(token, offset, d.len);
                    } else {
                        request.fail(VIRTIO_BLK_S_IOERR);
                    }
                    offset = offset.wrapping_add(u64::from(d.len));
                }
            }
            VIRTIO_BLK_T_OUT => {
                if self.read_only() {
                    request.fail(VIRTIO_BLK_S_IOERR);
                } else {
                    let mut offset = sector.wrapping_mul(SECTOR_SIZE);
                    for d in &rest {
                        let valid = !d.is_write_only()
                            && u64::from(d.len) % SECTOR_SIZE == 0
                            && d.len != 0
                            && in_bounds(offset, d.len, self.backend.capacity_bytes());
                        if valid {
                            match mem.get_slice(d.addr, d.len as usize) {
                                Ok(src) => {
                                    let token = self.alloc_id();
                                    self.ops.insert(
                                        token,
                                        PendingOp {
                                            request: request_id,
                                            dest: None,
                                        },
                                    );
                                    request.begin();
                                    self.backend.submit_write(token, offset, src.to_vec());
                                }
                                Err(_) => request.fail(VIRTIO_BLK_S_IOERR),
                            }
                        } else {
                            request.fail(VIRTIO_BLK_S_IOERR);
                        }
                        offset = offset.wrapping_add(u64::from(d.len));
                    }
                }
            }
            VIRTIO_BLK_T_FLUSH => {
                if sector != 0 {
                    request.fail(VIRTIO_BLK_S_IOERR);
                } else {
                    let token = self.alloc_id();
                    self.ops.insert(
                        token,
                        PendingOp {
                            request: request_id,
                            dest: None,
                        },
                    );
                    request.begin();
                    self.backend.submit_flush(token);
                }
            }
            VIRTIO_BLK_T_GET_ID => {
                let mut id = [0u8; BLOCK_ID_LEN];
                let src = self.config.id.as_bytes();
                let n = src.len().min(BLOCK_ID_LEN);
                id[..n].copy_from_slice(&src[..n]);

                let mut remaining: &[u8] = &id;
                for d in &rest {
                    if remaining.is_empty() {
                        break;
                    }
                    if !d.is_write_only() {
                        request.fail(VIRTIO_BLK_S_IOERR);
                        break;
                    }
                    let take = (d.len as usize).min(remaining.len());
                    match mem.get_slice_mut(d.addr, take) {
                        Ok(dst) => {
                            dst.copy_from_slice(&remaining[..take]);
                            remaining = &remaining[take..];
                            request.chain_mut().add_used(take as u32);
                        }
                        Err(_) => {
                            request.fail(VIRTIO_BLK_S_IOERR);
                            break;
                        }
                    }
                }
            }
            other => {
                debug!(opcode = other, "unsupported block opcode");
                request.fail(VIRTIO_BLK_S_UNSUPP);
            }
        }

        if request.seal() == Completion::Finished {
            self.finish_request(request, status_addr, queue, mem)
        } else {
            self.requests.insert(request_id, PendingRequest {
                request,
                status_addr,
            });
            Ok(())
        }
    }

    fn finish_request(
        &mut self,
        request: Request,
        status_addr: u64,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        let (mut chain, status) = request.finish();
        // Best effort: even if the status byte cannot be written, the chain
        // still goes back so the guest can reclaim its descriptors.
        if write_u8(mem, status_addr, status).is_ok() {
            chain.add_used(1);
        }
        queue.return_chain(mem, chain)
    }

    fn drain_completions(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(done) = self.backend.poll_completion() {
            let Some(op) = self.ops.remove(&done.token) else {
                warn!(token = done.token, "completion for unknown block token");
                continue;
            };
            let Some(pending) = self.requests.get_mut(&op.request) else {
                warn!(request = op.request, "completion for unknown block request");
                continue;
            };

            let status = match done.result {
                Ok(data) => {
                    if let (Some((addr, len)), Some(bytes)) = (op.dest, data.as_ref()) {
                        let take = bytes.len().min(len as usize);
                        match mem.get_slice_mut(addr, take) {
                            Ok(dst) => {
                                dst.copy_from_slice(&bytes[..take]);
                                pending.request.chain_mut().add_used(take as u32);
                                VIRTIO_BLK_S_OK
                            }
                            Err(_) => VIRTIO_BLK_S_IOERR,
                        }
                    } else {
                        VIRTIO_BLK_S_OK
                    }
                }
                Err(_) => VIRTIO_BLK_S_IOERR,
            };

            if pending.request.complete(status) == Completion::Finished {
                if let Some(pending) = self.requests.remove(&op.request) {
                    self.finish_request(pending.request, pending.status_addr, queue, mem)?;
                }
            }
        }
        Ok(())
    }
}

fn in_bounds(offset: u64, len: u32, capacity: u64) -> bool {
    offset
        .checked_add(u64::from(len))
        .is_some_and(|end| end <= capacity)
}

impl<B: BlockBackend> VirtioDevice for Block<B> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_BLOCK
    }

    fn num_queues(&self) -> u16 {
        1
    }

    fn on_start(&mut self) -> StartInfo {
        StartInfo {
            backing_size: Some(self.backend.capacity_bytes()),
        }
    }

    fn ready(&mut self, features: u64) {
        self.features = features;
    }

    fn notify_queue(
        &mut self,
        _index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(chain) = queue.next_chain(mem)? {
            self.begin_request(chain, queue, mem)?;
        }
        self.drain_completions(queue, mem)
    }

    fn poll_queue(
        &mut self,
        _index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        self.drain_completions(queue, mem)
    }
}
