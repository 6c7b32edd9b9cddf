//! perf_event ring buffer plumbing
//!
//! Minimal `repr(C)` declarations of the `perf_event_open` ABI (attr, mmap
//! metadata page, record header) plus the record parsing. Only the subset
//! the sampler configures is declared: software task-clock sampling with
//! `IP | TID | TIME` sample payloads.

#![allow(unsafe_code)]

use std::sync::atomic::{fence, AtomicU64, Ordering};

// perf_event_attr.type
pub(crate) const PERF_TYPE_SOFTWARE: u32 = 1;

// perf_event_attr.config for PERF_TYPE_SOFTWARE
pub(crate) const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;

// perf_event_attr.sample_type bits
pub(crate) const PERF_SAMPLE_IP: u64 = 1 << 0;
pub(crate) const PERF_SAMPLE_TID: u64 = 1 << 1;
pub(crate) const PERF_SAMPLE_TIME: u64 = 1 << 2;

// perf_event_attr flag bits (bitfield word)
pub(crate) const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub(crate) const ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub(crate) const ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

// perf_event_open flags
pub(crate) const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// perf_event_header.type
pub(crate) const PERF_RECORD_SAMPLE: u32 = 9;

// ioctls
pub(crate) const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub(crate) const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

/// `struct perf_event_attr`, through the VER1 fields; the kernel accepts any
/// size ≥ VER0 with trailing zeros.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub bp_addr: u64,
    pub bp_len: u64,
}

/// Head of `struct perf_event_mmap_page`. The data-section cursors sit at a
/// fixed offset (1024) behind a large reserved block.
#[repr(C)]
pub(crate) struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub reserved: [u8; 116 * 8],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
}

/// `struct perf_event_header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}

pub(crate) const HEADER_SIZE: usize = 8;

/// Body of a `PERF_RECORD_SAMPLE` with `IP | TID | TIME`.
pub(crate) const SAMPLE_BODY_SIZE: usize = 24;

/// An instruction-pointer sample from the on-CPU stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSample {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
}

pub(crate) fn parse_header(bytes: &[u8]) -> Option<PerfEventHeader> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    Some(PerfEventHeader {
        type_: u32::from_ne_bytes(bytes[0..4].try_into().ok()?),
        misc: u16::from_ne_bytes(bytes[4..6].try_into().ok()?),
        size: u16::from_ne_bytes(bytes[6..8].try_into().ok()?),
    })
}

/// Parse the body of a `PERF_RECORD_SAMPLE`. Layout for our sample_type is
/// `ip: u64, pid: u32, tid: u32, time: u64`.
pub(crate) fn parse_sample_body(bytes: &[u8]) -> Option<IpSample> {
    if bytes.len() < SAMPLE_BODY_SIZE {
        return None;
    }
    Some(IpSample {
        ip: u64::from_ne_bytes(bytes[0..8].try_into().ok()?),
        pid: u32::from_ne_bytes(bytes[8..12].try_into().ok()?),
        tid: u32::from_ne_bytes(bytes[12..16].try_into().ok()?),
        time: u64::from_ne_bytes(bytes[16..24].try_into().ok()?),
    })
}

/// Reader over the mmap'd sample region. Single consumer: the owning thread
/// drains it from its processing tick.
pub(crate) struct SampleRing {
    base: *mut u8,
    /// Total mapping length (metadata page + data pages).
    map_len: usize,
}

// The ring is only touched by its owning thread; the raw pointers are to a
// mapping that lives as long as the sampler.
#[allow(unsafe_code)]
unsafe impl Send for SampleRing {}

impl SampleRing {
    /// # Safety
    /// `base` must point to a live `perf_event_open` mmap of `map_len` bytes.
    pub(crate) unsafe fn from_raw(base: *mut u8, map_len: usize) -> Self {
        Self { base, map_len }
    }

    fn page(&self) -> &PerfEventMmapPage {
        unsafe { &*self.base.cast::<PerfEventMmapPage>() }
    }

    fn head(&self) -> u64 {
        // data_head needs an acquire fence after the load (rmb)
        let head = unsafe {
            (*std::ptr::addr_of!(self.page().data_head).cast::<AtomicU64>())
                .load(Ordering::Relaxed)
        };
        fence(Ordering::Acquire);
        head
    }

    fn set_tail(&self, tail: u64) {
        // the kernel must not overwrite records we have not read yet (mb)
        fence(Ordering::Release);
        unsafe {
            (*std::ptr::addr_of!(self.page().data_tail).cast::<AtomicU64>())
                .store(tail, Ordering::Relaxed);
        }
    }

    /// Copy the wrapped byte range `[offset, offset + len)` of the data
    /// section into `out`.
    fn copy_out(&self, data_offset: u64, data_size: u64, offset: u64, out: &mut [u8]) {
        let len = out.len() as u64;
        debug_assert!(len <= data_size);
        let first = (data_size - offset).min(len);
        unsafe {
            let data = self.base.add(data_offset as usize);
            std::ptr::copy_nonoverlapping(
                data.add(offset as usize),
                out.as_mut_ptr(),
                first as usize,
            );
            if first < len {
                std::ptr::copy_nonoverlapping(
                    data,
                    out.as_mut_ptr().add(first as usize),
                    (len - first) as usize,
                );
            }
        }
    }

    /// Drain all complete records, appending samples to `out`. Non-sample
    /// records (throttle, lost, ...) are skipped by their declared size.
    pub(crate) fn drain_into(&mut self, out: &mut Vec<IpSample>) {
        let page = self.page();
        let data_offset = page.data_offset;
        let data_size = page.data_size;
        if data_size == 0 {
            return;
        }
        debug_assert!(data_offset as usize + data_size as usize <= self.map_len);

        let head = self.head();
        let mut tail = page.data_tail;

        let mut scratch = [0u8; HEADER_SIZE + SAMPLE_BODY_SIZE];
        while tail < head {
            let mut header_bytes = [0u8; HEADER_SIZE];
            self.copy_out(data_offset, data_size, tail % data_size, &mut header_bytes);
            let Some(header) = parse_header(&header_bytes) else { break };
            if (header.size as usize) < HEADER_SIZE {
                // corrupt header, drop the rest of the ring
                tail = head;
                break;
            }
            if header.type_ == PERF_RECORD_SAMPLE {
                let body_len = (header.size as usize - HEADER_SIZE).min(SAMPLE_BODY_SIZE);
                self.copy_out(
                    data_offset,
                    data_size,
                    (tail + HEADER_SIZE as u64) % data_size,
                    &mut scratch[..body_len],
                );
                if let Some(sample) = parse_sample_body(&scratch[..body_len]) {
                    out.push(sample);
                }
            }
            tail += u64::from(header.size);
        }

        self.set_tail(tail);
    }
}
