//! Memory balloon command streams: inflate (queue 0), deflate (queue 1),
//! stats (queue 2).
//!
//! Inflate and deflate chains carry arrays of little-endian page frame
//! numbers; adjacent frames coalesce into maximal runs so the host mapping
//! facility sees one range call per run instead of one per page. The stats
//! queue is guest-paced: one chain is held open, released to solicit a fresh
//! report, and every pending host-side requester is answered at once when the
//! report lands.

use crate::control::VirtioDevice;
use crate::devices::{VIRTIO_DEVICE_TYPE_BALLOON, VIRTIO_F_VERSION_1};
use crate::memory::GuestMemory;
use crate::queue::{Chain, QueueError, VirtQueue};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::warn;

pub const VIRTIO_BALLOON_F_STATS_VQ: u64 = 1 << 1;

/// Balloon page frames are always 4 KiB regardless of guest page size.
pub const BALLOON_PAGE_SIZE: u64 = 4096;

const QUEUE_INFLATE: u16 = 0;
const QUEUE_DEFLATE: u16 = 1;
const QUEUE_STATS: u16 = 2;

/// Ceiling on one chain's frame-list payload. A chain past this is applied
/// truncated, with a log; it keeps a hostile guest from forcing unbounded
/// buffering.
const MAX_PFN_BYTES_PER_CHAIN: usize = 1 << 20;

const STAT_ENTRY_LEN: usize = 10;

/// Host facility that commits/decommits guest memory ranges. Ranges are in
/// balloon page frames.
pub trait BalloonBackend {
    /// Inflate: the guest gave up `[base_pfn, base_pfn + count)`.
    fn release_range(&mut self, base_pfn: u64, count: u64);
    /// Deflate: the guest reclaimed `[base_pfn, base_pfn + count)`.
    fn reclaim_range(&mut self, base_pfn: u64, count: u64);
}

/// Records range calls; test double for the mapping facility.
#[derive(Debug, Default)]
pub struct RangeLog {
    pub released: Vec<(u64, u64)>,
    pub reclaimed: Vec<(u64, u64)>,
}

impl BalloonBackend for RangeLog {
    fn release_range(&mut self, base_pfn: u64, count: u64) {
        self.released.push((base_pfn, count));
    }

    fn reclaim_range(&mut self, base_pfn: u64, count: u64) {
        self.reclaimed.push((base_pfn, count));
    }
}

/// One `virtio_balloon_stat` entry: 2-byte tag, 8-byte value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalloonStat {
    pub tag: u16,
    pub value: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatsError {
    /// The pending-requester table is full; ask again after an answer.
    #[error("too many concurrent stats requesters, try again")]
    TryAgain,
}

/// Handle a stats requester polls for its answer.
#[derive(Clone, Default, Debug)]
pub struct StatsRequest(Rc<RefCell<Option<Vec<BalloonStat>>>>);

impl StatsRequest {
    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn take(&self) -> Option<Vec<BalloonStat>> {
        self.0.borrow_mut().take()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BalloonConfig {
    /// Bound on concurrent stats requesters. Carried from the original
    /// implementation as a tunable rather than a semantic constant.
    pub max_pending_stats: usize,
}

impl Default for BalloonConfig {
    fn default() -> Self {
        Self {
            max_pending_stats: 16,
        }
    }
}

pub struct Balloon<B: BalloonBackend> {
    backend: B,
    config: BalloonConfig,
    features: u64,
    /// Stats chain held open between guest reports.
    held_stats: Option<Chain>,
    /// Release the held chain on the next poll to solicit a fresh report.
    solicit: bool,
    waiters: Vec<StatsRequest>,
}

impl<B: BalloonBackend> Balloon<B> {
    pub fn new(backend: B, config: BalloonConfig) -> Self {
        Self {
            backend,
            config,
            features: 0,
            held_stats: None,
            solicit: false,
            waiters: Vec::new(),
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_BALLOON_F_STATS_VQ
    }

    /// Registers a host-side stats requester. All requesters pending when the
    /// next guest report arrives are answered together.
    pub fn request_stats(&mut self) -> Result<StatsRequest, StatsError> {
        if self.waiters.len() >= self.config.max_pending_stats {
            return Err(StatsError::TryAgain);
        }
        let request = StatsRequest::default();
        self.waiters.push(request.clone());
        self.solicit = true;
        Ok(request)
    }

    fn apply_frame_list(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
        deflate: bool,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            let mut bytes: Vec<u8> = Vec::new();
            while let Some(d) = chain.next_descriptor(mem, false) {
                if d.is_write_only() {
                    continue;
                }
                let room = MAX_PFN_BYTES_PER_CHAIN.saturating_sub(bytes.len());
                let take = (d.len as usize).min(room);
                if take < d.len as usize {
                    warn!(head = chain.head_index(), "frame list truncated at size cap");
                }
                if let Ok(src) = mem.get_slice(d.addr, take) {
                    bytes.extend_from_slice(src);
                }
            }

            // Adjacent frames fold into one range call per run.
            let mut run: Option<(u64, u64)> = None;
            for pfn in bytes.chunks_exact(4).map(|c| {
                u64::from(u32::from_le_bytes(c.try_into().unwrap()))
            }) {
                run = match run {
                    Some((base, count)) if pfn == base + count => Some((base, count + 1)),
                    Some((base, count)) => {
                        self.apply_range(base, count, deflate);
                        Some((pfn, 1))
                    }
                    None => Some((pfn, 1)),
                };
            }
            if let Some((base, count)) = run {
                self.apply_range(base, count, deflate);
            }

            queue.return_chain(mem, chain)?;
        }
        Ok(())
    }

    fn apply_range(&mut self, base: u64, count: u64, deflate: bool) {
        if deflate {
            self.backend.reclaim_range(base, count);
        } else {
            self.backend.release_range(base, count);
        }
    }

    fn take_stats_report(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        while let Some(mut chain) = queue.next_chain(mem)? {
            let mut bytes: Vec<u8> = Vec::new();
            while let Some(d) = chain.next_descriptor(mem, false) {
                if d.is_write_only() {
                    continue;
                }
                let room = MAX_PFN_BYTES_PER_CHAIN.saturating_sub(bytes.len());
                let take = (d.len as usize).min(room);
                if let Ok(src) = mem.get_slice(d.addr, take) {
                    bytes.extend_from_slice(src);
                }
            }

            let stats: Vec<BalloonStat> = bytes
                .chunks_exact(STAT_ENTRY_LEN)
                .map(|entry| BalloonStat {
                    tag: u16::from_le_bytes(entry[0..2].try_into().unwrap()),
                    value: u64::from_le_bytes(entry[2..10].try_into().unwrap()),
                })
                .collect();

            // Everyone pending is answered from this one report.
            for waiter in self.waiters.drain(..) {
                *waiter.0.borrow_mut() = Some(stats.clone());
            }

            // A newer report supersedes whatever chain was still held.
            if let Some(stale) = self.held_stats.take() {
                queue.return_chain(mem, stale)?;
            }
            self.held_stats = Some(chain);
            self.solicit = false;
        }
        Ok(())
    }

    /// Releases the held stats chain when a requester is waiting, prompting
    /// the guest to submit a fresh report.
    fn solicit_stats(
        &mut self,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        if self.solicit {
            if let Some(chain) = self.held_stats.take() {
                self.solicit = false;
                queue.return_chain(mem, chain)?;
            }
        }
        Ok(())
    }
}

impl<B: BalloonBackend> VirtioDevice for Balloon<B> {
    fn device_type(&self) -> u32 {
        VIRTIO_DEVICE_TYPE_BALLOON
    }

    fn num_queues(&self) -> u16 {
        3
    }

    fn ready(&mut self, features: u64) {
        self.features = features;
    }

    fn notify_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        match index {
            QUEUE_INFLATE => self.apply_frame_list(queue, mem, false),
            QUEUE_DEFLATE => self.apply_frame_list(queue, mem, true),
            QUEUE_STATS => {
                self.take_stats_report(queue, mem)?;
                self.solicit_stats(queue, mem)
            }
            _ => Ok(()),
        }
    }

    fn poll_queue(
        &mut self,
        index: u16,
        queue: &mut VirtQueue,
        mem: &mut dyn GuestMemory,
    ) -> Result<(), QueueError> {
        if index == QUEUE_STATS {
            self.solicit_stats(queue, mem)?;
        }
        Ok(())
    }
}
