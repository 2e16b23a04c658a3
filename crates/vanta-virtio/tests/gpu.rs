use vanta_virtio::control::{DeviceHost, InterruptCounter};
use vanta_virtio::devices::gpu::{
    DisplayLog, Gpu, GpuConfig, VIRTIO_GPU_CMD_MOVE_CURSOR, VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
    VIRTIO_GPU_CMD_RESOURCE_CREATE_2D, VIRTIO_GPU_CMD_RESOURCE_FLUSH,
    VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D, VIRTIO_GPU_FLAG_FENCE, VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID,
    VIRTIO_GPU_RESP_ERR_UNSPEC, VIRTIO_GPU_RESP_OK_NODATA,
};
use vanta_virtio::memory::{
    read_u16_le, write_u16_le, write_u32_le, write_u64_le, GuestMemory, GuestRam,
};
use vanta_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const CTRL_DESC: u64 = 0x1000;
const CTRL_AVAIL: u64 = 0x2000;
const CTRL_USED: u64 = 0x3000;

const CURSOR_DESC: u64 = 0x11000;
const CURSOR_AVAIL: u64 = 0x12000;
const CURSOR_USED: u64 = 0x13000;

const REQUEST: u64 = 0x4000;
const RESPONSE: u64 = 0x4800;
const BACKING: u64 = 0x20000;

const HDR: usize = 24;

fn write_desc(
    mem: &mut GuestRam,
    table: u64,
    index: u16,
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
) {
    let base = table + u64::from(index) * 16;
    write_u64_le(mem, base, addr).unwrap();
    write_u32_le(mem, base + 8, len).unwrap();
    write_u16_le(mem, base + 12, flags).unwrap();
    write_u16_le(mem, base + 14, next).unwrap();
}

fn start_gpu() -> (DeviceHost<Gpu<DisplayLog>>, InterruptCounter, GuestRam) {
    let irq = InterruptCounter::default();
    let (mut host, _info) = DeviceHost::start(
        Gpu::new(DisplayLog::default(), GpuConfig::default()),
        Box::new(irq.clone()),
    );
    host.configure_queue(0, 8, CTRL_DESC, CTRL_AVAIL, CTRL_USED)
        .unwrap();
    host.configure_queue(1, 8, CURSOR_DESC, CURSOR_AVAIL, CURSOR_USED)
        .unwrap();
    (host, irq, GuestRam::new(0x40000))
}

struct CtrlRing {
    avail_idx: u16,
}

impl CtrlRing {
    fn new() -> Self {
        Self { avail_idx: 0 }
    }

    /// Submits one control request and returns the response type.
    fn submit(
        &mut self,
        host: &mut DeviceHost<Gpu<DisplayLog>>,
        mem: &mut GuestRam,
        request: &[u8],
    ) -> u32 {
        mem.write(REQUEST, request).unwrap();
        mem.write(RESPONSE, &[0u8; 64]).unwrap();
        write_desc(
            mem,
            CTRL_DESC,
            0,
            REQUEST,
            request.len() as u32,
            VIRTQ_DESC_F_NEXT,
            1,
        );
        write_desc(mem, CTRL_DESC, 1, RESPONSE, 64, VIRTQ_DESC_F_WRITE, 0);
        let slot = self.avail_idx % 8;
        write_u16_le(mem, CTRL_AVAIL + 4 + u64::from(slot) * 2, 0).unwrap();
        self.avail_idx += 1;
        write_u16_le(mem, CTRL_AVAIL + 2, self.avail_idx).unwrap();
        host.notify_queue(0, mem).unwrap();
        let resp = mem.get_slice(RESPONSE, 4).unwrap();
        u32::from_le_bytes(resp.try_into().unwrap())
    }
}

fn ctrl_header(opcode: u32, flags: u32, fence_id: u64) -> Vec<u8> {
    let mut out = vec![0u8; HDR];
    out[0..4].copy_from_slice(&opcode.to_le_bytes());
    out[4..8].copy_from_slice(&flags.to_le_bytes());
    out[8..16].copy_from_slice(&fence_id.to_le_bytes());
    out
}

fn create_2d(resource_id: u32, width: u32, height: u32) -> Vec<u8> {
    let mut req = ctrl_header(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D, 0, 0);
    req.extend_from_slice(&resource_id.to_le_bytes());
    req.extend_from_slice(&67u32.to_le_bytes()); // format
    req.extend_from_slice(&width.to_le_bytes());
    req.extend_from_slice(&height.to_le_bytes());
    req
}

fn attach_backing(resource_id: u32, entries: &[(u64, u32)]) -> Vec<u8> {
    let mut req = ctrl_header(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING, 0, 0);
    req.extend_from_slice(&resource_id.to_le_bytes());
    req.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for &(addr, len) in entries {
        req.extend_from_slice(&addr.to_le_bytes());
        req.extend_from_slice(&len.to_le_bytes());
        req.extend_from_slice(&0u32.to_le_bytes());
    }
    req
}

fn transfer_to_host(resource_id: u32, rect: [u32; 4], offset: u64, flags: u32, fence: u64) -> Vec<u8> {
    let mut req = ctrl_header(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D, flags, fence);
    for v in rect {
        req.extend_from_slice(&v.to_le_bytes());
    }
    req.extend_from_slice(&offset.to_le_bytes());
    req.extend_from_slice(&resource_id.to_le_bytes());
    req.extend_from_slice(&0u32.to_le_bytes());
    req
}

fn flush(resource_id: u32, rect: [u32; 4]) -> Vec<u8> {
    let mut req = ctrl_header(VIRTIO_GPU_CMD_RESOURCE_FLUSH, 0, 0);
    for v in rect {
        req.extend_from_slice(&v.to_le_bytes());
    }
    req.extend_from_slice(&resource_id.to_le_bytes());
    req.extend_from_slice(&0u32.to_le_bytes());
    req
}

#[test]
fn strided_transfer_updates_only_the_rectangle() {
    let (mut host, _irq, mut mem) = start_gpu();
    let mut ring = CtrlRing::new();

    // 8x4 resource; backing holds the full 8*4*4 = 128-byte image.
    assert_eq!(
        ring.submit(&mut host, &mut mem, &create_2d(1, 8, 4)),
        VIRTIO_GPU_RESP_OK_NODATA
    );
    assert_eq!(
        ring.submit(&mut host, &mut mem, &attach_backing(1, &[(BACKING, 128)])),
        VIRTIO_GPU_RESP_OK_NODATA
    );

    // Paint the whole backing with 0xAB.
    mem.write(BACKING, &[0xab; 128]).unwrap();

    // Copy only a 2x2 rectangle at (2, 1). Offset = y*stride + x*4.
    let stride = 8 * 4usize;
    let offset = (stride + 2 * 4) as u64;
    assert_eq!(
        ring.submit(
            &mut host,
            &mut mem,
            &transfer_to_host(1, [2, 1, 2, 2], offset, 0, 0)
        ),
        VIRTIO_GPU_RESP_OK_NODATA
    );

    // Flush hands the full pixel buffer to the display.
    assert_eq!(
        ring.submit(&mut host, &mut mem, &flush(1, [0, 0, 8, 4])),
        VIRTIO_GPU_RESP_OK_NODATA
    );

    // The resource started zeroed: exactly rows 1-2, columns 2-3 carry the
    // copied bytes; everything outside the rectangle, including the gap
    // bytes inside the copied rows, stays zero.
    let mut expect = vec![0u8; 128];
    for row in 1..3usize {
        for col in 2..4usize {
            let at = row * stride + col * 4;
            expect[at..at + 4].copy_from_slice(&[0xab; 4]);
        }
    }
    assert_eq!(host.device_mut().display_mut().last_pixels, expect);
}

#[test]
fn transfer_with_uncovered_backing_zero_fills_and_reports_unspec() {
    let (mut host, _irq, mut mem) = start_gpu();
    let mut ring = CtrlRing::new();

    ring.submit(&mut host, &mut mem, &create_2d(1, 8, 4));
    // Backing covers only half the image.
    ring.submit(&mut host, &mut mem, &attach_backing(1, &[(BACKING, 64)]));
    mem.write(BACKING, &[0x5a; 64]).unwrap();

    let resp = ring.submit(
        &mut host,
        &mut mem,
        &transfer_to_host(1, [0, 0, 8, 4], 0, 0, 0),
    );
    assert_eq!(resp, VIRTIO_GPU_RESP_ERR_UNSPEC);
}

#[test]
fn fence_id_is_echoed_when_requested() {
    let (mut host, _irq, mut mem) = start_gpu();
    let mut ring = CtrlRing::new();

    ring.submit(&mut host, &mut mem, &create_2d(1, 4, 4));
    ring.submit(&mut host, &mut mem, &attach_backing(1, &[(BACKING, 64)]));

    let resp = ring.submit(
        &mut host,
        &mut mem,
        &transfer_to_host(1, [0, 0, 4, 4], 0, VIRTIO_GPU_FLAG_FENCE, 0x1122_3344_5566_7788),
    );
    assert_eq!(resp, VIRTIO_GPU_RESP_OK_NODATA);

    let hdr = mem.get_slice(RESPONSE, HDR).unwrap();
    assert_eq!(
        u32::from_le_bytes(hdr[4..8].try_into().unwrap()),
        VIRTIO_GPU_FLAG_FENCE
    );
    assert_eq!(
        u64::from_le_bytes(hdr[8..16].try_into().unwrap()),
        0x1122_3344_5566_7788
    );
}

#[test]
fn operations_on_unknown_resources_are_rejected() {
    let (mut host, _irq, mut mem) = start_gpu();
    let mut ring = CtrlRing::new();

    let resp = ring.submit(
        &mut host,
        &mut mem,
        &transfer_to_host(9, [0, 0, 4, 4], 0, 0, 0),
    );
    assert_eq!(resp, VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);

    let resp = ring.submit(&mut host, &mut mem, &flush(9, [0, 0, 4, 4]));
    assert_eq!(resp, VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID);
}

#[test]
fn set_scanout_tracks_the_displayed_resource() {
    let (mut host, _irq, mut mem) = start_gpu();
    let mut ring = CtrlRing::new();

    ring.submit(&mut host, &mut mem, &create_2d(3, 8, 4));

    let mut req = ctrl_header(vanta_virtio::devices::gpu::VIRTIO_GPU_CMD_SET_SCANOUT, 0, 0);
    for v in [0u32, 0, 8, 4] {
        req.extend_from_slice(&v.to_le_bytes());
    }
    req.extend_from_slice(&0u32.to_le_bytes()); // scanout_id
    req.extend_from_slice(&3u32.to_le_bytes()); // resource_id
    assert_eq!(
        ring.submit(&mut host, &mut mem, &req),
        VIRTIO_GPU_RESP_OK_NODATA
    );

    assert_eq!(host.device_mut().scanout_resource(0), Some(3));
    assert_eq!(
        host.device_mut().display_mut().scanouts,
        vec![(0, 3, 8, 4)]
    );
}

#[test]
fn display_info_reports_configured_scanouts() {
    let (mut host, _irq, mut mem) = start_gpu();

    let req = ctrl_header(
        vanta_virtio::devices::gpu::VIRTIO_GPU_CMD_GET_DISPLAY_INFO,
        0,
        0,
    );
    mem.write(REQUEST, &req).unwrap();
    write_desc(
        &mut mem,
        CTRL_DESC,
        0,
        REQUEST,
        req.len() as u32,
        VIRTQ_DESC_F_NEXT,
        1,
    );
    // Display info needs a response buffer big enough for 16 entries.
    write_desc(&mut mem, CTRL_DESC, 1, RESPONSE, 24 + 16 * 24, VIRTQ_DESC_F_WRITE, 0);
    write_u16_le(&mut mem, CTRL_AVAIL + 4, 0).unwrap();
    write_u16_le(&mut mem, CTRL_AVAIL + 2, 1).unwrap();
    host.notify_queue(0, &mut mem).unwrap();

    let resp = mem.get_slice(RESPONSE, 24 + 24).unwrap();
    assert_eq!(
        u32::from_le_bytes(resp[0..4].try_into().unwrap()),
        vanta_virtio::devices::gpu::VIRTIO_GPU_RESP_OK_DISPLAY_INFO
    );
    // First scanout: default 1024x768, enabled.
    assert_eq!(u32::from_le_bytes(resp[32..36].try_into().unwrap()), 1024);
    assert_eq!(u32::from_le_bytes(resp[36..40].try_into().unwrap()), 768);
    assert_eq!(u32::from_le_bytes(resp[40..44].try_into().unwrap()), 1);
}

#[test]
fn cursor_commands_are_fire_and_forget() {
    let (mut host, irq, mut mem) = start_gpu();

    let mut req = ctrl_header(VIRTIO_GPU_CMD_MOVE_CURSOR, 0, 0);
    // cursor_pos { scanout_id, x, y, pad }
    req.extend_from_slice(&0u32.to_le_bytes());
    req.extend_from_slice(&120u32.to_le_bytes());
    req.extend_from_slice(&45u32.to_le_bytes());
    req.extend_from_slice(&0u32.to_le_bytes());

    mem.write(REQUEST, &req).unwrap();
    write_desc(
        &mut mem,
        CURSOR_DESC,
        0,
        REQUEST,
        req.len() as u32,
        0,
        0,
    );
    write_u16_le(&mut mem, CURSOR_AVAIL + 4, 0).unwrap();
    write_u16_le(&mut mem, CURSOR_AVAIL + 2, 1).unwrap();
    host.notify_queue(1, &mut mem).unwrap();

    assert_eq!(
        host.device_mut().display_mut().cursor_moves,
        vec![(0, 120, 45)]
    );
    // The chain is returned with no response payload.
    assert_eq!(read_u16_le(&mem, CURSOR_USED + 2).unwrap(), 1);
    assert_eq!(irq.count(), 1);
}
