//! GPU command streams: control (queue 0) and cursor (queue 1).
//!
//! Control chains carry a fixed header plus an opcode-specific payload and
//! expect a writable response descriptor. A 2D resource pairs a host pixel
//! buffer with the guest backing ranges attached to it;
//! TRANSFER_TO_HOST_2D copies a rectangle from the backing into the host
//! buffer with per-row strides. Cursor commands are fire-and-forget: one
//! descriptor, no response payload.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_GPU, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{QueueError, VirtQueue};
use std::collections::HashMap;
use tracing::{debug, warn};

pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x0102;
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;
pub const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x0107;
pub const VIRTIO_GPU_CMD_UPDATE_CURSOR: u32 = 0x0300;
pub const VIRTIO_GPU_CMD_MOVE_CURSOR: u32 = 0x0301;

pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
pub const VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;

pub const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

const QUEUE_CONTROL: u16 = 0;
const QUEUE_CURSOR: u16 = 1;

const CTRL_HEADER_LEN: usize = 24;
const DISPLAY_ONE_LEN: usize = 24;

/// All supported 2D formats are 32-bit.
const BYTES_PER_PIXEL: u32 = 4;

/// Ceiling on one resource's pixel buffer; create requests past it fail
/// with OUT_OF_MEMORY rather than letting the guest size host allocations.
const MAX_RESOURCE_BYTES: u64 = 64 * 1024 * 1024;

/// Ceiling on one control request's payload (attach-backing entry tables).
const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    fn parse(raw: &[u8]) -> Self {
        Self {
            x: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            y: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            width: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            height: u32::from_le_bytes(raw[12..16].try_into().unwrap()),
        }
    }
}

/// Host compositor/scanout boundary.
pub trait DisplayBackend {
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, width: u32, height: u32);
    /// `pixels` is the resource's full buffer; `stride` its row pitch.
    fn flush(&mut self, resource_id: u32, rect: Rect, pixels: &[u8], stride: usize);
    fn update_cursor(&mut self, resource_id: u32, hot_x: u32, hot_y: u32);
    fn move_cursor(&mut self, scanout_id: u32, x: u32, y: u32);
}

/// Records display calls; test double for the compositor.
#[derive(Debug, Default)]
pub struct DisplayLog {
    pub scanouts: Vec<(u32, u32, u32, u32)>,
    pub flushes: Vec<(u32, Rect)>,
    /// Pixel buffer captured at the most recent flush.
    pub last_pixels: Vec<u8>,
    pub cursor_updates: Vec<(u32, u32, u32)>,
    pub cursor_moves: Vec<(u32, u32, u32)>,
}

impl DisplayBackend for DisplayLog {
    fn set_scanout(&mut self, scanout_id: u32, resource_id: u32, width: u32, height: u32) {
        self.scanouts.push((scanout_id, resource_id, width, height));
    }

    fn flush(&mut self, resource_id: u32, rect: Rect, pixels: &[u8], _stride: usize) {
        self.flushes.push((resource_id, rect));
        self.last_pixels = pixels.to_vec();
    }

    fn update_cursor(&mut self, resource_id: u32, hot_x: u32, hot_y: u32) {
        self.cursor_updates.push((resource_id, hot_x, hot_y));
    }

    fn move_cursor(&mut self, scanout_id: u32, x: u32, y: u32) {
        self.cursor_moves.push((scanout_id, x, y));
    }
}

#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// (width, height) per scanout, up to [`VIRTIO_GPU_MAX_SCANOUTS`].
    pub scanouts: Vec<(u32, u32)>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            scanouts: vec![(1024, 768)],
        }
    }
}

#[derive(Debug)]
struct Resource2D {
    width: u32,
    height: u32,
    #[allow(dead_code)]
    format: u32,
    pixels: Vec<u8>,
    backing: Vec<(u64, u32)>,
}

impl Resource2D {
    fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL as usize
    }
}

struct ParsedChain {
    request: Vec<u8>,
    response: Option<(u64, u32)>,
}

pub struct Gpu<D: DisplayBackend> {
    display: D,
    config: GpuConfig,
    resources: HashMap<u32, Resource2D>,
    scanout_resource: [u32; VIRTIO_GPU_MAX_SCANOUTS],
}

impl<D: DisplayBackend> Gpu<D> {
    pub fn new(display: D, config: GpuConfig) -> Self {
        Self {
            display,
            config,
            resources: HashMap::new(),
            scanout_resource: [0; VIRTIO_GPU_MAX_SCANOUTS],
        }
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    /// Resource currently scanned out on `scanout_id`, if any.
    pub fn scanout_resource(&self, scanout_id: u32) -> Option<u32> {
        let id = *self.scanout_resource.get(scanout_id as usize)?;
        (id != 0).then_some(id)
    }

    fn parse_chain(
        chain: &mut crate::queue::Chain,
        mem: &dyn GuestMemory,
    ) -> ParsedChain {
        let mut request = Vec::new();
        let mut response = None;
        while let Some(d) = chain.next_descriptor_any(mem) {
            if d.is_write_only() {
                if response.is_none() {
                    response = Some((d.addr, d.len));
                }
                // Anything after the response descriptor is drained and
                // ignored.
            } else if response.is_none() {
                let room = MAX_REQUEST_BYTES.saturating_sub(request.len());
                let take = (d.len as usize).min(room);
                if let Ok(src) = mem.get_slice(d.addr, take) {
                    request.extend_from_slice(src);
                } else {
                    chain.fault();
                }
            } else {
                // Read-only descriptor after the response: malformed.
                chain.fault();
            }
        }
        ParsedChain { request, response }
    }

    fn handle_control(&mut self, request: &[u8], mem: &dyn GuestMemory) -> (u32, Vec<u8>) {
        if request.len() < CTRL_HEADER_LEN {
            return (VIRTIO_GPU_RESP_ERR_UNSPEC, Vec::new());
        }
        let opcode = u32::from_le_bytes(request[0..4].try_into().unwrap());
        let payload = &request[CTRL_HEADER_LEN..];

        match opcode {
            VIRTIO_GPU_CMD_GET_DISPLAY_INFO => {
                (VIRTIO_GPU_RESP_OK_DISPLAY_INFO, self.display_info())
            }
            VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => (self.resource_create_2d(payload), Vec::new()),
            VIRTIO_GPU_CMD_RESOURCE_UNREF => (self.resource_unref(payload), Vec::new()),
            VIRTIO_GPU_CMD_SET_SCANOUT => (self.set_scanout(payload), Vec::new()),
            VIRTIO_GPU_CMD_RESOURCE_FLUSH => (self.resource_flush(payload), Vec::new()),
            VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => (self.transfer_to_host_2d(payload, mem), Vec::new()),
            VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => (self.attach_backing(payload), Vec::new()),
            VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING => (self.detach_backing(payload), Vec::new()),
            other => {
                debug!(opcode = other, "unsupported gpu control opcode");
                (VIRTIO_GPU_RESP_ERR_UNSPEC, Vec::new())
            }
        }
    }

    fn display_info(&self) -> Vec<u8> {
        let mut out = vec![0u8; VIRTIO_GPU_MAX_SCANOUTS * DISPLAY_ONE_LEN];
        for (i, &(width, height)) in self
            .config
            .scanouts
            .iter()
            .take(VIRTIO_GPU_MAX_SCANOUTS)
            .enumerate()
        {
            let entry = &mut out[i * DISPLAY_ONE_LEN..(i + 1) * DISPLAY_ONE_LEN];
            // rect {x, y, width, height}, then enabled, flags.
            entry[8..12].copy_from_slice(&width.to_le_bytes());
            entry[12..16].copy_from_slice(&height.to_le_bytes());
            entry[16..20].copy_from_slice(&1u32.to_le_bytes());
        }
        out
    }

    fn resource_create_2d(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 16 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let resource_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let format = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        let width = u32::from_le_bytes(payload[8..12].try_into().unwrap());
        let height = u32::from_le_bytes(payload[12..16].try_into().unwrap());

        if resource_id == 0 {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        }
        if width == 0 || height == 0 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let bytes = u64::from(width) * u64::from(height) * u64::from(BYTES_PER_PIXEL);
        if bytes > MAX_RESOURCE_BYTES {
            return VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY;
        }

        self.resources.insert(
            resource_id,
            Resource2D {
                width,
                height,
                format,
                pixels: vec![0; bytes as usize],
                backing: Vec::new(),
            },
        );
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn resource_unref(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 4 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let resource_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if self.resources.remove(&resource_id).is_none() {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        }
        for slot in self.scanout_resource.iter_mut() {
            if *slot == resource_id {
                *slot = 0;
            }
        }
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn set_scanout(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 24 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let rect = Rect::parse(&payload[0..16]);
        let scanout_id = u32::from_le_bytes(payload[16..20].try_into().unwrap());
        let resource_id = u32::from_le_bytes(payload[20..24].try_into().unwrap());

        if scanout_id as usize >= self.config.scanouts.len() {
            return VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID;
        }
        // resource_id 0 disables the scanout.
        if resource_id != 0 && !self.resources.contains_key(&resource_id) {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        }
        self.scanout_resource[scanout_id as usize] = resource_id;
        self.display
            .set_scanout(scanout_id, resource_id, rect.width, rect.height);
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn resource_flush(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 20 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let rect = Rect::parse(&payload[0..16]);
        let resource_id = u32::from_le_bytes(payload[16..20].try_into().unwrap());
        let Some(resource) = self.resources.get(&resource_id) else {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        };
        if !rect_within(rect, resource.width, resource.height) {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let stride = resource.stride();
        self.display.flush(resource_id, rect, &resource.pixels, stride);
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn transfer_to_host_2d(&mut self, payload: &[u8], mem: &dyn GuestMemory) -> u32 {
        if payload.len() < 28 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let rect = Rect::parse(&payload[0..16]);
        let offset = u64::from_le_bytes(payload[16..24].try_into().unwrap());
        let resource_id = u32::from_le_bytes(payload[24..28].try_into().unwrap());

        let Some(resource) = self.resources.get_mut(&resource_id) else {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        };
        if !rect_within(rect, resource.width, resource.height) {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }

        let stride = resource.stride() as u64;
        let row_bytes = u64::from(rect.width) * u64::from(BYTES_PER_PIXEL);
        let mut covered = true;

        // Row-by-row: when the rectangle is narrower than the resource the
        // destination skips the inter-row gap instead of writing through it.
        for row in 0..u64::from(rect.height) {
            let src_off = offset + row * stride;
            let dst_off = (u64::from(rect.y) + row) * stride
                + u64::from(rect.x) * u64::from(BYTES_PER_PIXEL);
            let dst = &mut resource.pixels
                [dst_off as usize..(dst_off + row_bytes) as usize];
            covered &= read_backing(mem, &resource.backing, src_off, dst);
        }

        if covered {
            VIRTIO_GPU_RESP_OK_NODATA
        } else {
            VIRTIO_GPU_RESP_ERR_UNSPEC
        }
    }

    fn attach_backing(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 8 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let resource_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let nr_entries = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
        let entries = &payload[8..];
        if entries.len() < nr_entries * 16 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let Some(resource) = self.resources.get_mut(&resource_id) else {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        };

        let mut backing = Vec::with_capacity(nr_entries);
        for entry in entries.chunks_exact(16).take(nr_entries) {
            let addr = u64::from_le_bytes(entry[0..8].try_into().unwrap());
            let length = u32::from_le_bytes(entry[8..12].try_into().unwrap());
            backing.push((addr, length));
        }
        resource.backing = backing;
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn detach_backing(&mut self, payload: &[u8]) -> u32 {
        if payload.len() < 4 {
            return VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER;
        }
        let resource_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let Some(resource) = self.resources.get_mut(&resource_id) else {
            return VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID;
        };
        resource.backing.clear();
        VIRTIO_GPU_RESP_OK_NODATA
    }

    fn drain_control(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            let parsed = Self::parse_chain(&mut chain, mem);

            let (resp_type, resp_payload) = if chain.is_faulted() {
                (VIRTIO_GPU_RESP_ERR_UNSPEC, Vec::new())
            } else {
                self.handle_control(&parsed.request, mem)
            };

            // Response header: echo the fence id after side effects when the
            // request asked for one.
            let (req_flags, req_fence) = if parsed.request.len() >= CTRL_HEADER_LEN {
                (
                    u32::from_le_bytes(parsed.request[4..8].try_into().unwrap()),
                    u64::from_le_bytes(parsed.request[8..16].try_into().unwrap()),
                )
            } else {
                (0, 0)
            };
            let mut resp = vec![0u8; CTRL_HEADER_LEN + resp_payload.len()];
            resp[0..4].copy_from_slice(&resp_type.to_le_bytes());
            if req_flags & VIRTIO_GPU_FLAG_FENCE != 0 {
                resp[4..8].copy_from_slice(&VIRTIO_GPU_FLAG_FENCE.to_le_bytes());
                resp[8..16].copy_from_slice(&req_fence.to_le_bytes());
            }
            resp[CTRL_HEADER_LEN..].copy_from_slice(&resp_payload);

            if let Some((addr, len)) = parsed.response {
                let take = resp.len().min(len as usize);
                match mem.write(addr, &resp[..take]) {
                    Ok(()) => chain.add_used(take as u32),
                    Err(_) => {
                        warn!(head = chain.head_index(), "gpu response buffer outside guest memory")
                    }
                }
            } else {
                warn!(head = chain.head_index(), "gpu control chain without response descriptor");
            }
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }

    fn drain_cursor(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            let mut raw = Vec::new();
            while let Some(d) = chain.next_descriptor(mem, false) {
                if d.is_write_only() {
                    continue;
                }
                let take = (d.len as usize).min(MAX_REQUEST_BYTES - raw.len());
                if let Ok(src) = mem.get_slice(d.addr, take) {
                    raw.extend_from_slice(src);
                }
            }

            // Header + cursor_pos {scanout_id, x, y, _pad} + resource_id +
            // hot_x + hot_y.
            if raw.len() >= CTRL_HEADER_LEN + 16 {
                let opcode = u32::from_le_bytes(raw[0..4].try_into().unwrap());
                let p = &raw[CTRL_HEADER_LEN..];
                let scanout_id = u32::from_le_bytes(p[0..4].try_into().unwrap());
                let x = u32::from_le_bytes(p[4..8].try_into().unwrap());
                let y = u32::from_le_bytes(p[8..12].try_into().unwrap());
                match opcode {
                    VIRTIO_GPU_CMD_UPDATE_CURSOR if raw.len() >= CTRL_HEADER_LEN + 28 => {
                        let resource_id = u32::from_le_bytes(p[16..20].try_into().unwrap());
                        let hot_x = u32::from_le_bytes(p[20..24].try_into().unwrap());
                        let hot_y = u32::from_le_bytes(p[24..28].try_into().unwrap());
                        self.display.update_cursor(resource_id, hot_x, hot_y);
                        self.display.move_cursor(scanout_id, x, y);
                    }
                    VIRTIO_GPU_CMD_MOVE_CURSOR => {
                        self.display.move_cursor(scanout_id, x, y);
                    }
                    other => debug!(opcode = other, "unsupported gpu cursor opcode"),
                }
            } else {
                warn!(head = chain.head_index(), "short gpu cursor command");
            }
            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }
}

fn rect_within(rect: Rect, width: u32, height: u32) -> bool {
    rect.width != 0
        && rect.height != 0
        && u64::from(rect.x) + u64::from(rect.width) <= u64::from(width)
        && u64::from(rect.y) + u64::from(rect.height) <= u64::from(height)
}

/// Reads `dst.len()` bytes at linear offset `offset` of the attached backing
/// range list. Bytes past the backing (or unreadable) are zero-filled;
/// returns whether the whole range was covered.
fn read_backing(
    mem: &dyn GuestMemory,
    backing: &[(u64, u32)],
    offset: u64,
    dst: &mut [u8],
) -> bool {
    dst.fill(0);
    let mut covered_all = true;
    let mut want = offset;
    let mut filled = 0usize;

    let mut range_start = 0u64;
    for &(addr, len) in backing {
        if filled == dst.len() {
            return covered_all;
        }
        let range_end = range_start + u64::from(len);
        if want < range_end {
            let skip = want - range_start;
            let avail = (range_end - want).min((dst.len() - filled) as u64) as usize;
            match mem.get_slice(addr + skip, avail) {
                Ok(src) => dst[filled..filled + avail].copy_from_slice(src),
                Err(_) => covered_all = false,
            }
            filled += avail;
            want += avail as u64;
        }
        range_start = range_end;
    }

    if filled < dst.len() {
        covered_all = false;
    }
    covered_all
}

impl<D: DisplayBackend> VirtioDevice for Gpu<D> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_GPU
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
            QUEUE_CONTROL => self.drain_control(queue, mem),
            QUEUE_CURSOR => self.drain_cursor(queue, mem),
            _ => Ok(()),
        }
    }
}
