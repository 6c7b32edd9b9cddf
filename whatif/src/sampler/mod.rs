//! Per-thread on-CPU sampler
//!
//! A software task-clock `perf_event_open` sampler bound to one thread,
//! producing an instruction pointer and timestamp every `sample_period_ns`
//! wall nanoseconds of that thread's execution. Records are drained from the
//! mmap'd ring by the thread's sample ticker; nothing here blocks.

#![allow(unsafe_code)]

pub(crate) mod ring;

use std::io;
use std::os::fd::RawFd;

use log::debug;

use crate::domain::{ProfilerError, Tid};
pub use ring::IpSample;
use ring::{
    PerfEventAttr, SampleRing, ATTR_FLAG_DISABLED, ATTR_FLAG_EXCLUDE_HV,
    ATTR_FLAG_EXCLUDE_KERNEL, PERF_COUNT_SW_TASK_CLOCK, PERF_EVENT_IOC_DISABLE,
    PERF_EVENT_IOC_ENABLE, PERF_FLAG_FD_CLOEXEC, PERF_SAMPLE_IP, PERF_SAMPLE_TID,
    PERF_SAMPLE_TIME, PERF_TYPE_SOFTWARE,
};

/// Data pages in the sample ring; must be a power of two.
const RING_PAGES: usize = 8;

pub struct OnCpuSampler {
    fd: RawFd,
    ring: SampleRing,
    map_len: usize,
    base: *mut libc::c_void,
}

// Owned and drained by a single thread; the mapping is private to it.
unsafe impl Send for OnCpuSampler {}

impl OnCpuSampler {
    /// Open a sampler for `tid` with the given period in wall nanoseconds.
    ///
    /// # Errors
    /// Returns `ProfilerError::Sampler` when the perf event cannot be opened
    /// or its ring cannot be mapped (missing permissions, exhausted fds).
    pub fn open(tid: Tid, sample_period_ns: u64) -> Result<Self, ProfilerError> {
        let attr = PerfEventAttr {
            type_: PERF_TYPE_SOFTWARE,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config: PERF_COUNT_SW_TASK_CLOCK,
            sample_period: sample_period_ns,
            sample_type: PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME,
            flags: ATTR_FLAG_DISABLED | ATTR_FLAG_EXCLUDE_KERNEL | ATTR_FLAG_EXCLUDE_HV,
            ..PerfEventAttr::default()
        };

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                std::ptr::addr_of!(attr),
                tid.0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(ProfilerError::Sampler(io::Error::last_os_error()));
        }
        let fd = fd as RawFd;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as usize;
        let map_len = (1 + RING_PAGES) * page_size;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ProfilerError::Sampler(err));
        }

        debug!("opened on-CPU sampler for {tid}, period {sample_period_ns} ns");
        let ring = unsafe { SampleRing::from_raw(base.cast::<u8>(), map_len) };
        Ok(Self { fd, ring, map_len, base })
    }

    /// # Errors
    /// Returns the ioctl failure, if any.
    pub fn start(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_ENABLE)
    }

    /// # Errors
    /// Returns the ioctl failure, if any.
    pub fn stop(&self) -> io::Result<()> {
        self.ioctl(PERF_EVENT_IOC_DISABLE)
    }

    fn ioctl(&self, request: libc::c_ulong) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.fd, request as _, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Drain pending samples into `out`. Only the mmap'd ring cursors and
    /// `out` are touched; the kernel keeps filling concurrently.
    pub fn drain_into(&mut self, out: &mut Vec<IpSample>) {
        self.ring.drain_into(out);
    }
}

impl Drop for OnCpuSampler {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.map_len);
            libc::close(self.fd);
        }
    }
}
