//! Virtual file descriptor multiplexer: in (queue 0, host to guest) and out
//! (queue 1, guest to host).
//!
//! A vfd is an abstract handle (shared memory region, connection, pipe, or
//! dma buffer) multiplexed over one queue pair. Guest-allocated and
//! host-allocated ids live in disjoint halves of the id space (the host half
//! carries [`VFD_ID_HOST_BIT`]), so neither side can mint a colliding id.
//!
//! Inbound traffic is strictly ordered: a message arriving on a connection
//! with K attached handles expands to K NEW announcements followed by the
//! RECV that references them, each consuming exactly one guest receive
//! buffer. The pending-inbound queue holds everything that cannot be
//! delivered yet; nothing is dropped, reordered, or duplicated while the
//! guest is short on buffers.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_WL, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{Chain, Descriptor, QueueError, VirtQueue};
use bitflags::bitflags;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

pub const VIRTIO_WL_CMD_VFD_NEW: u32 = 256;
pub const VIRTIO_WL_CMD_VFD_CLOSE: u32 = 257;
pub const VIRTIO_WL_CMD_VFD_SEND: u32 = 258;
pub const VIRTIO_WL_CMD_VFD_RECV: u32 = 259;
pub const VIRTIO_WL_CMD_VFD_NEW_CTX: u32 = 260;
pub const VIRTIO_WL_CMD_VFD_NEW_PIPE: u32 = 261;
pub const VIRTIO_WL_CMD_VFD_HUP: u32 = 262;
pub const VIRTIO_WL_CMD_VFD_NEW_DMABUF: u32 = 263;
pub const VIRTIO_WL_CMD_VFD_DMABUF_SYNC: u32 = 264;

pub const VIRTIO_WL_RESP_OK: u32 = 4096;
pub const VIRTIO_WL_RESP_VFD_NEW: u32 = 4097;
pub const VIRTIO_WL_RESP_VFD_NEW_DMABUF: u32 = 4098;
pub const VIRTIO_WL_RESP_ERR: u32 = 4352;
pub const VIRTIO_WL_RESP_OUT_OF_MEMORY: u32 = 4353;
pub const VIRTIO_WL_RESP_INVALID_ID: u32 = 4354;
pub const VIRTIO_WL_RESP_INVALID_TYPE: u32 = 4355;
pub const VIRTIO_WL_RESP_INVALID_FLAGS: u32 = 4356;
pub const VIRTIO_WL_RESP_INVALID_CMD: u32 = 4357;

/// Ids with this bit set are host-allocated; the guest must never use them
/// for NEW requests.
pub const VFD_ID_HOST_BIT: u32 = 0x8000_0000;

const QUEUE_IN: u16 = 0;
const QUEUE_OUT: u16 = 1;

const CTRL_HEADER_LEN: usize = 8;
const CTRL_VFD_LEN: usize = CTRL_HEADER_LEN + 20;
const CTRL_VFD_RECV_FIXED_LEN: usize = CTRL_HEADER_LEN + 8;

/// Ceiling on one SEND's payload.
const MAX_SEND_BYTES: usize = 1 << 20;

bitflags! {
    /// Access/usage bits carried in vfd NEW requests and announcements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VfdFlags: u32 {
        const WRITE = 0x1;
        const READ = 0x2;
    }
}

/// Why an operation was refused; maps onto the wire response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WlError {
    InvalidId,
    InvalidType,
    InvalidFlags,
    OutOfMemory,
    Failure,
}

impl WlError {
    fn resp(self) -> u32 {
        match self {
            WlError::InvalidId => VIRTIO_WL_RESP_INVALID_ID,
            WlError::InvalidType => VIRTIO_WL_RESP_INVALID_TYPE,
            WlError::InvalidFlags => VIRTIO_WL_RESP_INVALID_FLAGS,
            WlError::OutOfMemory => VIRTIO_WL_RESP_OUT_OF_MEMORY,
            WlError::Failure => VIRTIO_WL_RESP_ERR,
        }
    }
}

/// Shared-memory placement reported back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShmInfo {
    pub pfn: u64,
    pub size: u32,
}

/// Dma-buffer placement and layout reported back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmabufInfo {
    pub pfn: u64,
    pub size: u32,
    pub stride0: u32,
}

/// Host transport boundary: allocation of backing objects and the outbound
/// half of every channel.
pub trait WlBackend {
    fn new_shared_memory(&mut self, id: u32, size: u32) -> Result<ShmInfo, WlError>;
    fn new_context(&mut self, id: u32) -> Result<(), WlError>;
    fn new_pipe(&mut self, id: u32, flags: VfdFlags) -> Result<(), WlError>;
    fn new_dmabuf(
        &mut self,
        id: u32,
        width: u32,
        height: u32,
        format: u32,
    ) -> Result<DmabufInfo, WlError>;
    fn dmabuf_sync(&mut self, id: u32, flags: u32) -> Result<(), WlError>;
    fn send(&mut self, id: u32, data: &[u8], vfds: &[u32]) -> Result<(), WlError>;
    fn close(&mut self, id: u32);
}

/// Records transport calls and hands out sequential placements; test double.
#[derive(Debug, Default)]
pub struct TransportLog {
    pub contexts: Vec<u32>,
    pub pipes: Vec<(u32, VfdFlags)>,
    pub sends: Vec<(u32, Vec<u8>, Vec<u32>)>,
    pub closed: Vec<u32>,
    next_pfn: u64,
}

impl WlBackend for TransportLog {
    fn new_shared_memory(&mut self, _id: u32, size: u32) -> Result<ShmInfo, WlError> {
        self.next_pfn += 16;
        Ok(ShmInfo {
            pfn: self.next_pfn,
            size,
        })
    }

    fn new_context(&mut self, id: u32) -> Result<(), WlError> {
        self.contexts.push(id);
        Ok(())
    }

    fn new_pipe(&mut self, id: u32, flags: VfdFlags) -> Result<(), WlError> {
        self.pipes.push((id, flags));
        Ok(())
    }

    fn new_dmabuf(
        &mut self,
        _id: u32,
        width: u32,
        _height: u32,
        _format: u32,
    ) -> Result<DmabufInfo, WlError> {
        self.next_pfn += 16;
        Ok(DmabufInfo {
            pfn: self.next_pfn,
            size: 0,
            stride0: width * 4,
        })
    }

    fn dmabuf_sync(&mut self, _id: u32, _flags: u32) -> Result<(), WlError> {
        Ok(())
    }

    fn send(&mut self, id: u32, data: &[u8], vfds: &[u32]) -> Result<(), WlError> {
        self.sends.push((id, data.to_vec(), vfds.to_vec()));
        Ok(())
    }

    fn close(&mut self, id: u32) {
        self.closed.push(id);
    }
}

/// Handle arriving from the host alongside a channel message; becomes a
/// host-allocated vfd announced to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingHandle {
    pub flags: VfdFlags,
    pub pfn: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VfdKind {
    SharedMemory,
    Context,
    Pipe,
    Dmabuf,
    /// Minted by the host for an incoming handle.
    Incoming,
}

#[derive(Debug, Clone, Copy)]
struct Vfd {
    kind: VfdKind,
    flags: VfdFlags,
}

/// One item of the strictly-ordered host-to-guest stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Inbound {
    NewVfd {
        id: u32,
        flags: VfdFlags,
        pfn: u64,
        size: u32,
    },
    Recv {
        vfd_id: u32,
        ids: Vec<u32>,
        data: Vec<u8>,
    },
    Hup {
        id: u32,
    },
}

impl Inbound {
    fn serialize(&self) -> Vec<u8> {
        match self {
            Inbound::NewVfd {
                id,
                flags,
                pfn,
                size,
            } => {
                let mut out = vec![0u8; CTRL_VFD_LEN];
                out[0..4].copy_from_slice(&VIRTIO_WL_CMD_VFD_NEW.to_le_bytes());
                out[8..12].copy_from_slice(&id.to_le_bytes());
                out[12..16].copy_from_slice(&flags.bits().to_le_bytes());
                out[16..24].copy_from_slice(&pfn.to_le_bytes());
                out[24..28].copy_from_slice(&size.to_le_bytes());
                out
            }
            Inbound::Recv { vfd_id, ids, data } => {
                let mut out =
                    Vec::with_capacity(CTRL_VFD_RECV_FIXED_LEN + ids.len() * 4 + data.len());
                out.extend_from_slice(&VIRTIO_WL_CMD_VFD_RECV.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&vfd_id.to_le_bytes());
                out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    out.extend_from_slice(&id.to_le_bytes());
                }
                out.extend_from_slice(data);
                out
            }
            Inbound::Hup { id } => {
                let mut out = vec![0u8; CTRL_HEADER_LEN + 4];
                out[0..4].copy_from_slice(&VIRTIO_WL_CMD_VFD_HUP.to_le_bytes());
                out[8..12].copy_from_slice(&id.to_le_bytes());
                out
            }
        }
    }
}

pub struct Wl<B: WlBackend> {
    backend: B,
    vfds: HashMap<u32, Vfd>,
    pending_in: VecDeque<Inbound>,
    next_host_id: u32,
}

impl<B: WlBackend> Wl<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            vfds: HashMap::new(),
            pending_in: VecDeque::new(),
            next_host_id: VFD_ID_HOST_BIT,
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn mint_host_id(&mut self) -> u32 {
        // The counter stays inside the host half of the id space.
        let id = self.next_host_id;
        self.next_host_id = VFD_ID_HOST_BIT | self.next_host_id.wrapping_add(1);
        id
    }

    /// Message arriving from the host on a connection vfd. Handles carried
    /// with the message are minted host ids and announced, in order, before
    /// the RECV that references them.
    pub fn push_recv(&mut self, vfd_id: u32, data: Vec<u8>, handles: Vec<IncomingHandle>) {
        let mut ids = Vec::with_capacity(handles.len());
        for handle in handles {
            let id = self.mint_host_id();
            self.vfds.insert(
                id,
                Vfd {
                    kind: VfdKind::Incoming,
                    flags: handle.flags,
                },
            );
            self.pending_in.push_back(Inbound::NewVfd {
                id,
                flags: handle.flags,
                pfn: handle.pfn,
                size: handle.size,
            });
            ids.push(id);
        }
        self.pending_in.push_back(Inbound::Recv { vfd_id, ids, data });
    }

    /// Host-side hang-up on a vfd.
    pub fn push_hup(&mut self, id: u32) {
        self.pending_in.push_back(Inbound::Hup { id });
    }

    fn drain_in(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(item) = self.pending_in.front() {
            let Some(mut chain) = queue.next_chain(mem)? else {
                // No receive buffer: the stream holds, nothing is dropped.
                return Ok(());
            };

            let mut bufs: Vec<Descriptor> = Vec::new();
            while let Some(d) = chain.next_descriptor(mem, true) {
                bufs.push(d);
            }
            let capacity: u64 = bufs.iter().map(|d| u64::from(d.len)).sum();
            let bytes = item.serialize();

            if chain.is_faulted() || capacity < bytes.len() as u64 {
                // This buffer cannot carry the item; give it back unused and
                // keep the item for the next buffer.
                warn!(
                    head = chain.head_index(),
                    need = bytes.len(),
                    capacity,
                    "receive buffer unusable for pending vfd message"
                );
                queue.return_chain(mem, chain)?;
                continue;
            }

            let mut written = 0usize;
            for d in &bufs {
                if written == bytes.len() {
                    break;
                }
                let take = (bytes.len() - written).min(d.len as usize);
                if mem.write(d.addr, &bytes[written..written + take]).is_err() {
                    break;
                }
                written += take;
            }
            chain.add_used(written as u32);
            self.pending_in.pop_front();
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }

    fn handle_out(&mut self, request: &[u8]) -> Vec<u8> {
        if request.len() < CTRL_HEADER_LEN {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let opcode = u32::from_le_bytes(request[0..4].try_into().unwrap());
        let payload = &request[CTRL_HEADER_LEN..];

        match opcode {
            VIRTIO_WL_CMD_VFD_NEW => self.cmd_new(payload),
            VIRTIO_WL_CMD_VFD_NEW_CTX => self.cmd_new_ctx(payload),
            VIRTIO_WL_CMD_VFD_NEW_PIPE => self.cmd_new_pipe(payload),
            VIRTIO_WL_CMD_VFD_NEW_DMABUF => self.cmd_new_dmabuf(payload),
            VIRTIO_WL_CMD_VFD_DMABUF_SYNC => self.cmd_dmabuf_sync(payload),
            VIRTIO_WL_CMD_VFD_SEND => self.cmd_send(payload),
            VIRTIO_WL_CMD_VFD_CLOSE => self.cmd_close(payload),
            other => {
                debug!(opcode = other, "unsupported vfd opcode");
                resp_header(VIRTIO_WL_RESP_INVALID_CMD)
            }
        }
    }

    fn guest_id(&self, payload: &[u8]) -> Result<u32, WlError> {
        if payload.len() < 4 {
            return Err(WlError::Failure);
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if id & VFD_ID_HOST_BIT != 0 {
            return Err(WlError::InvalidId);
        }
        Ok(id)
    }

    fn fresh_guest_id(&self, payload: &[u8]) -> Result<u32, WlError> {
        let id = self.guest_id(payload)?;
        if self.vfds.contains_key(&id) {
            return Err(WlError::InvalidId);
        }
        Ok(id)
    }

    fn cmd_new(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 20 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = match self.fresh_guest_id(payload) {
            Ok(id) => id,
            Err(e) => return resp_header(e.resp()),
        };
        let flags = VfdFlags::from_bits_truncate(u32::from_le_bytes(
            payload[4..8].try_into().unwrap(),
        ));
        let size = u32::from_le_bytes(payload[16..20].try_into().unwrap());

        match self.backend.new_shared_memory(id, size) {
            Ok(info) => {
                self.vfds.insert(
                    id,
                    Vfd {
                        kind: VfdKind::SharedMemory,
                        flags,
                    },
                );
                resp_vfd_new(VIRTIO_WL_RESP_VFD_NEW, id, flags, info.pfn, info.size)
            }
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_new_ctx(&mut self, payload: &[u8]) -> Vec<u8> {
        let id = match self.fresh_guest_id(payload) {
            Ok(id) => id,
            Err(e) => return resp_header(e.resp()),
        };
        match self.backend.new_context(id) {
            Ok(()) => {
                let flags = VfdFlags::WRITE | VfdFlags::READ;
                self.vfds.insert(
                    id,
                    Vfd {
                        kind: VfdKind::Context,
                        flags,
                    },
                );
                resp_vfd_new(VIRTIO_WL_RESP_VFD_NEW, id, flags, 0, 0)
            }
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_new_pipe(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 8 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = match self.fresh_guest_id(payload) {
            Ok(id) => id,
            Err(e) => return resp_header(e.resp()),
        };
        let flags = VfdFlags::from_bits_truncate(u32::from_le_bytes(
            payload[4..8].try_into().unwrap(),
        ));
        // A pipe is unidirectional.
        if flags.contains(VfdFlags::WRITE | VfdFlags::READ) || flags.is_empty() {
            return resp_header(VIRTIO_WL_RESP_INVALID_FLAGS);
        }
        match self.backend.new_pipe(id, flags) {
            Ok(()) => {
                self.vfds.insert(
                    id,
                    Vfd {
                        kind: VfdKind::Pipe,
                        flags,
                    },
                );
                resp_vfd_new(VIRTIO_WL_RESP_VFD_NEW, id, flags, 0, 0)
            }
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_new_dmabuf(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 32 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = match self.fresh_guest_id(payload) {
            Ok(id) => id,
            Err(e) => return resp_header(e.resp()),
        };
        let flags = VfdFlags::from_bits_truncate(u32::from_le_bytes(
            payload[4..8].try_into().unwrap(),
        ));
        let width = u32::from_le_bytes(payload[20..24].try_into().unwrap());
        let height = u32::from_le_bytes(payload[24..28].try_into().unwrap());
        let format = u32::from_le_bytes(payload[28..32].try_into().unwrap());

        match self.backend.new_dmabuf(id, width, height, format) {
            Ok(info) => {
                self.vfds.insert(
                    id,
                    Vfd {
                        kind: VfdKind::Dmabuf,
                        flags,
                    },
                );
                let mut out =
                    resp_vfd_new(VIRTIO_WL_RESP_VFD_NEW_DMABUF, id, flags, info.pfn, info.size);
                // width/height/format echo, then the allocated stride.
                out.extend_from_slice(&width.to_le_bytes());
                out.extend_from_slice(&height.to_le_bytes());
                out.extend_from_slice(&format.to_le_bytes());
                out.extend_from_slice(&info.stride0.to_le_bytes());
                out
            }
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_dmabuf_sync(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 8 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let flags = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        match self.vfds.get(&id) {
            Some(vfd) if vfd.kind == VfdKind::Dmabuf => {}
            Some(_) => return resp_header(VIRTIO_WL_RESP_INVALID_TYPE),
            None => return resp_header(VIRTIO_WL_RESP_INVALID_ID),
        }
        match self.backend.dmabuf_sync(id, flags) {
            Ok(()) => resp_header(VIRTIO_WL_RESP_OK),
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_send(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 8 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let vfd_count = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
        let rest = &payload[8..];
        if rest.len() < vfd_count * 4 || rest.len() > MAX_SEND_BYTES {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }

        match self.vfds.get(&id) {
            Some(vfd) if vfd.kind == VfdKind::Context => {}
            // A pipe only accepts guest data when it was opened writable.
            Some(vfd) if vfd.kind == VfdKind::Pipe && vfd.flags.contains(VfdFlags::WRITE) => {}
            Some(_) => return resp_header(VIRTIO_WL_RESP_INVALID_TYPE),
            None => return resp_header(VIRTIO_WL_RESP_INVALID_ID),
        }

        let mut vfds = Vec::with_capacity(vfd_count);
        for raw in rest[..vfd_count * 4].chunks_exact(4) {
            let attached = u32::from_le_bytes(raw.try_into().unwrap());
            if !self.vfds.contains_key(&attached) {
                return resp_header(VIRTIO_WL_RESP_INVALID_ID);
            }
            vfds.push(attached);
        }
        let data = &rest[vfd_count * 4..];

        match self.backend.send(id, data, &vfds) {
            Ok(()) => resp_header(VIRTIO_WL_RESP_OK),
            Err(e) => resp_header(e.resp()),
        }
    }

    fn cmd_close(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 4 {
            return resp_header(VIRTIO_WL_RESP_ERR);
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if self.vfds.remove(&id).is_none() {
            return resp_header(VIRTIO_WL_RESP_INVALID_ID);
        }
        self.backend.close(id);
        resp_header(VIRTIO_WL_RESP_OK)
    }

    fn drain_out(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            let (request, response) = split_request(&mut chain, mem);

            let resp = if chain.is_faulted() {
                resp_header(VIRTIO_WL_RESP_ERR)
            } else {
                self.handle_out(&request)
            };

            if let Some((addr, len)) = response {
                let take = resp.len().min(len as usize);
                match mem.write(addr, &resp[..take]) {
                    Ok(()) => chain.add_used(take as u32),
                    Err(_) => {
                        warn!(head = chain.head_index(), "vfd response buffer outside guest memory")
                    }
                }
            } else {
                warn!(head = chain.head_index(), "vfd command chain without response descriptor");
            }
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }
}

/// Splits an out-queue chain into request bytes and the response descriptor.
fn split_request(chain: &mut Chain, mem: &dyn GuestMemory) -> (Vec<u8>, Option<(u64, u32)>) {
    let mut request = Vec::new();
    let mut response = None;
    while let Some(d) = chain.next_descriptor_any(mem) {
        if d.is_write_only() {
            if response.is_none() {
                response = Some((d.addr, d.len));
            } else {
                chain.fault();
            }
        } else if response.is_none() {
            let room = MAX_SEND_BYTES.saturating_sub(request.len());
            let take = (d.len as usize).min(room);
            if let Ok(src) = mem.get_slice(d.addr, take) {
                request.extend_from_slice(src);
            } else {
                chain.fault();
            }
        } else {
            chain.fault();
        }
    }
    (request, response)
}

fn resp_header(resp_type: u32) -> Vec<u8> {
    let mut out = vec![0u8; CTRL_HEADER_LEN];
    out[0..4].copy_from_slice(&resp_type.to_le_bytes());
    out
}

fn resp_vfd_new(resp_type: u32, id: u32, flags: VfdFlags, pfn: u64, size: u32) -> Vec<u8> {
    let mut out = vec![0u8; CTRL_VFD_LEN];
    out[0..4].copy_from_slice(&resp_type.to_le_bytes());
    out[8..12].copy_from_slice(&id.to_le_bytes());
    out[12..16].copy_from_slice(&flags.bits().to_le_bytes());
    out[16..24].copy_from_slice(&pfn.to_le_bytes());
    out[24..28].copy_from_slice(&size.to_le_bytes());
    out
}

impl<B: WlBackend> VirtioDevice for Wl<B> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_WL
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
            QUEUE_IN => self.drain_in(queue, mem),
            QUEUE_OUT => self.drain_out(queue, mem),
            _ => Ok(()),
        }
    }

    fn poll_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        if index == QUEUE_IN {
            self.drain_in(queue, mem)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_ids_always_carry_the_partition_bit() {
        let mut wl = Wl::new(TransportLog::default());
        for _ in 0..4 {
            assert_ne!(wl.mint_host_id() & VFD_ID_HOST_BIT, 0);
        }
    }

    #[test]
    fn recv_with_handles_queues_announcements_first() {
        let mut wl = Wl::new(TransportLog::default());
        wl.push_recv(
            7,
            vec![1, 2, 3],
            vec![
                IncomingHandle {
                    flags: VfdFlags::READ,
                    pfn: 0x100,
                    size: 4096,
                },
                IncomingHandle {
                    flags: VfdFlags::WRITE,
                    pfn: 0x200,
                    size: 4096,
                },
            ],
        );

        assert_eq!(wl.pending_in.len(), 3);
        let announced: Vec<u32> = wl
            .pending_in
            .iter()
            .filter_map(|item| match item {
                Inbound::NewVfd { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(announced.len(), 2);
        match wl.pending_in.back().unwrap() {
            Inbound::Recv { vfd_id, ids, data } => {
                assert_eq!(*vfd_id, 7);
                assert_eq!(ids, &announced);
                assert_eq!(data, &vec![1, 2, 3]);
            }
            other => panic!("expected trailing RECV, got {other:?}"),
        }
    }

    #[test]
    fn guest_id_with_host_bit_is_rejected() {
        let mut wl = Wl::new(TransportLog::default());
        let mut payload = vec![0u8; 20];
        payload[0..4].copy_from_slice(&(VFD_ID_HOST_BIT | 3).to_le_bytes());
        let resp = wl.cmd_new(&payload);
        assert_eq!(
            u32::from_le_bytes(resp[0..4].try_into().unwrap()),
            VIRTIO_WL_RESP_INVALID_ID
        );
    }
}
