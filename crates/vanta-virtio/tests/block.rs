use std::collections::VecDeque;
use vanta_virtio::control::{DeviceHost, InterruptCounter};
use vanta_virtio::devices::block::{
    Block, BlockBackend, BlockConfig, IoCompletion, IoToken, MemDisk, BLOCK_ID_LEN, SECTOR_SIZE,
    VIRTIO_BLK_F_RO, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH,
    VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use vanta_virtio::memory::{
    read_u16_le, read_u32_le, write_u16_le, write_u32_le, write_u64_le, GuestMemory, GuestRam,
};
use vanta_virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

const DESC: u64 = 0x1000;
const AVAIL: u64 = 0x2000;
const USED: u64 = 0x3000;

const HEADER: u64 = 0x4000;
const DATA: u64 = 0x5000;
const STATUS: u64 = 0x6000;

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

fn write_header(mem: &mut GuestRam, typ: u32, sector: u64) {
    write_u32_le(mem, HEADER, typ).unwrap();
    write_u32_le(mem, HEADER + 4, 0).unwrap();
    write_u64_le(mem, HEADER + 8, sector).unwrap();
}

/// Lays out header -> data -> status starting at descriptor 0.
fn build_request(mem: &mut GuestRam, typ: u32, sector: u64, data_len: u32, data_writable: bool) {
    write_header(mem, typ, sector);
    let data_flags = if data_writable {
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE
    } else {
        VIRTQ_DESC_F_NEXT
    };
    write_desc(mem, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(mem, 1, DATA, data_len, data_flags, 2);
    write_desc(mem, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
}

fn status_byte(mem: &GuestRam) -> u8 {
    mem.get_slice(STATUS, 1).unwrap()[0]
}

fn start_disk(config: BlockConfig) -> (DeviceHost<Block<MemDisk>>, InterruptCounter, GuestRam) {
    let irq = InterruptCounter::default();
    let (mut host, info) = DeviceHost::start(
        Block::new(MemDisk::new(64 * 1024), config),
        Box::new(irq.clone()),
    );
    assert_eq!(info.backing_size, Some(64 * 1024));
    host.configure_queue(0, 8, DESC, AVAIL, USED).unwrap();
    (host, irq, GuestRam::new(0x10000))
}

#[test]
fn write_then_read_round_trips() {
    let (mut host, irq, mut mem) = start_disk(BlockConfig::default());

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    mem.write(DATA, &payload).unwrap();
    build_request(&mut mem, VIRTIO_BLK_T_OUT, 2, 1024, false);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
    assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
    assert_eq!(irq.count(), 1);
    assert_eq!(
        &host.device_mut().backend_mut().as_slice()[1024..2048],
        payload.as_slice()
    );

    // Read the same sectors back into a fresh buffer.
    mem.write(DATA, &vec![0u8; 1024]).unwrap();
    build_request(&mut mem, VIRTIO_BLK_T_IN, 2, 1024, true);
    post_avail(&mut mem, 1, 0, 2);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
    assert_eq!(mem.get_slice(DATA, 1024).unwrap(), payload.as_slice());
    // Data bytes plus the status byte are accounted in the used entry.
    let used_len = read_u32_le(&mem, USED + 8 + 8).unwrap();
    assert_eq!(used_len, 1025);
}

#[test]
fn unaligned_data_descriptor_fails_whole_request() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig::default());

    // 513 bytes: not a sector multiple.
    build_request(&mut mem, VIRTIO_BLK_T_IN, 0, 513, true);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_IOERR);
    assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
}

#[test]
fn unaligned_descriptor_poisons_chain_with_valid_siblings() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig::default());

    write_header(&mut mem, VIRTIO_BLK_T_IN, 0);
    write_desc(&mut mem, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(
        &mut mem,
        1,
        DATA,
        512,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        2,
    );
    write_desc(
        &mut mem,
        2,
        DATA + 0x400,
        100,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        3,
    );
    write_desc(&mut mem, 3, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_IOERR);
}

#[test]
fn read_only_device_rejects_writes_without_touching_backing() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig {
        read_only: true,
        ..BlockConfig::default()
    });
    host.ready(VIRTIO_BLK_F_RO);

    mem.write(DATA, &[0x5a; 512]).unwrap();
    build_request(&mut mem, VIRTIO_BLK_T_OUT, 0, 512, false);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_IOERR);
    assert!(host
        .device_mut()
        .backend_mut()
        .as_slice()
        .iter()
        .all(|&b| b == 0));

    // Round trip under read-only: a read of the same sector sees no
    // mutation.
    mem.write(DATA, &[0xff; 512]).unwrap();
    build_request(&mut mem, VIRTIO_BLK_T_IN, 0, 512, true);
    post_avail(&mut mem, 1, 0, 2);
    host.notify_queue(0, &mut mem).unwrap();
    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
    assert!(mem.get_slice(DATA, 512).unwrap().iter().all(|&b| b == 0));
}

#[test]
fn flush_requires_sector_zero() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig::default());

    write_header(&mut mem, VIRTIO_BLK_T_FLUSH, 7);
    write_desc(&mut mem, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(&mut mem, 1, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();
    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_IOERR);

    write_header(&mut mem, VIRTIO_BLK_T_FLUSH, 0);
    post_avail(&mut mem, 1, 0, 2);
    host.notify_queue(0, &mut mem).unwrap();
    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
}

#[test]
fn get_id_truncates_to_descriptor_capacity() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig {
        id: "vanta-integration-disk".to_string(),
        ..BlockConfig::default()
    });

    mem.write(DATA, &[0xcc; 32]).unwrap();
    build_request(&mut mem, VIRTIO_BLK_T_GET_ID, 0, 8, true);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();

    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_OK);
    assert_eq!(mem.get_slice(DATA, 8).unwrap(), b"vanta-in");
    // Bytes past the descriptor capacity are untouched.
    assert!(mem.get_slice(DATA + 8, 24).unwrap().iter().all(|&b| b == 0xcc));
    assert!(BLOCK_ID_LEN >= 8);
}

#[test]
fn unknown_opcode_reports_unsupported() {
    let (mut host, _irq, mut mem) = start_disk(BlockConfig::default());

    build_request(&mut mem, 0x55, 0, 512, false);
    post_avail(&mut mem, 0, 0, 1);
    host.notify_queue(0, &mut mem).unwrap();
    assert_eq!(status_byte(&mem), VIRTIO_BLK_S_UNSUPP);
}

/// Backend that holds every submission until the test releases it, so
/// completion order can be forced.
#[derive(Default)]
struct StallingDisk {
    data: Vec<u8>,
    held: Vec<(IoToken, u64, u32)>,
    ready: VecDeque<IoCompletion>,
}

impl StallingDisk {
    fn new(size: usize) -> Self {
        Self {
            data: (0..size).map(|i| (i % 241) as u8).collect(),
            held: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    fn release(&mut self, token: IoToken) {
        let pos = self
            .held
            .iter()
            .position(|(t, _, _)| *t == token)
            .expect("token not held");
        let (token, offset, len) = self.held.remove(pos);
        let start = offset as usize;
        let bytes = self.data[start..start + len as usize].to_vec();
        self.ready.push_back(IoCompletion {
            token,
            result: Ok(Some(bytes)),
        });
    }
}

impl BlockBackend for StallingDisk {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn submit_read(&mut self, token: IoToken, offset: u64, len: u32) {
        self.held.push((token, offset, len));
    }

    fn submit_write(&mut self, token: IoToken, _offset: u64, _data: Vec<u8>) {
        self.ready.push_back(IoCompletion {
            token,
            result: Ok(None),
        });
    }

    fn submit_flush(&mut self, token: IoToken) {
        self.ready.push_back(IoCompletion {
            token,
            result: Ok(None),
        });
    }

    fn poll_completion(&mut self) -> Option<IoCompletion> {
        self.ready.pop_front()
    }
}

#[test]
fn requests_complete_out_of_order_exactly_once() {
    let irq = InterruptCounter::default();
    let (mut host, _info) = DeviceHost::start(
        Block::new(
            StallingDisk::new(16 * 1024),
            BlockConfig::default(),
        ),
        Box::new(irq.clone()),
    );
    host.configure_queue(0, 8, DESC, AVAIL, USED).unwrap();
    let mut mem = GuestRam::new(0x10000);

    // Request A: descriptors 0..=2, read sector 0 into DATA.
    write_u32_le(&mut mem, HEADER, VIRTIO_BLK_T_IN).unwrap();
    write_u64_le(&mut mem, HEADER + 8, 0).unwrap();
    write_desc(&mut mem, 0, HEADER, 16, VIRTQ_DESC_F_NEXT, 1);
    write_desc(
        &mut mem,
        1,
        DATA,
        512,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        2,
    );
    write_desc(&mut mem, 2, STATUS, 1, VIRTQ_DESC_F_WRITE, 0);

    // Request B: descriptors 3..=5, read sector 4 into DATA + 0x400.
    let header_b = HEADER + 0x100;
    write_u32_le(&mut mem, header_b, VIRTIO_BLK_T_IN).unwrap();
    write_u64_le(&mut mem, header_b + 8, 4).unwrap();
    write_desc(&mut mem, 3, header_b, 16, VIRTQ_DESC_F_NEXT, 4);
    write_desc(
        &mut mem,
        4,
        DATA + 0x400,
        512,
        VIRTQ_DESC_F_NEXT | VIRTQ_DESC_F_WRITE,
        5,
    );
    write_desc(&mut mem, 5, STATUS + 1, 1, VIRTQ_DESC_F_WRITE, 0);

    post_avail(&mut mem, 0, 0, 1);
    post_avail(&mut mem, 1, 3, 2);
    host.notify_queue(0, &mut mem).unwrap();

    // Both in flight, nothing published, no interrupt yet.
    assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 0);
    assert_eq!(irq.count(), 0);

    let tokens: Vec<IoToken> = host
        .device_mut()
        .backend_mut()
        .held
        .iter()
        .map(|(t, _, _)| *t)
        .collect();
    assert_eq!(tokens.len(), 2);

    // Finish B first.
    host.device_mut().backend_mut().release(tokens[1]);
    host.poll(&mut mem).unwrap();
    assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 1);
    assert_eq!(read_u32_le(&mem, USED + 4).unwrap(), 3); // head of B
    assert_eq!(irq.count(), 1);
    let expected_b: Vec<u8> = (4 * SECTOR_SIZE as usize..4 * SECTOR_SIZE as usize + 512)
        .map(|i| (i % 241) as u8)
        .collect();
    assert_eq!(mem.get_slice(DATA + 0x400, 512).unwrap(), expected_b.as_slice());

    // Then A.
    host.device_mut().backend_mut().release(tokens[0]);
    host.poll(&mut mem).unwrap();
    assert_eq!(read_u16_le(&mem, USED + 2).unwrap(), 2);
    assert_eq!(read_u32_le(&mem, USED + 4 + 8).unwrap(), 0); // head of A
    assert_eq!(irq.count(), 2);
}
