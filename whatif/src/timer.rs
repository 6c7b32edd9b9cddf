//! Per-thread sample-processing ticker
//!
//! Each registered thread gets a dedicated ticker thread that fires the
//! sample-processing tick at the configured period. Processing therefore
//! runs in ordinary thread context — it may lock and allocate freely — and
//! never inside a signal handler. The only thing delivered by signal is the
//! delay *enactment* on the profiled thread ([`kick`]), whose handler in
//! `runtime` is restricted to async-signal-safe operations: the fence-
//! guarded in-use check, one atomic swap, and `nanosleep`.

#![allow(unsafe_code)] // tgkill/nanosleep require unsafe

use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::domain::Tid;

/// Signal carrying pending-delay enactment to a profiled thread.
pub(crate) const DELAY_SIGNAL: libc::c_int = libc::SIGPROF;

pub(crate) struct SampleTicker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl SampleTicker {
    /// Spawn the ticker for `tid`, invoking `tick` every `period_ns`
    /// nanoseconds until dropped.
    pub(crate) fn start(
        tid: Tid,
        period_ns: u64,
        mut tick: impl FnMut() + Send + 'static,
    ) -> io::Result<Self> {
        let (stop, ticks) = bounded(1);
        let period = Duration::from_nanos(period_ns);
        let handle = std::thread::Builder::new()
            .name(format!("whatif-tick-{}", tid.0))
            .spawn(move || {
                while matches!(ticks.recv_timeout(period), Err(RecvTimeoutError::Timeout)) {
                    tick();
                }
            })?;
        Ok(Self { stop, handle: Some(handle) })
    }
}

impl Drop for SampleTicker {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Deliver [`DELAY_SIGNAL`] to one thread of this process.
pub(crate) fn kick(tid: Tid) {
    unsafe {
        let _ = libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            tid.0 as libc::pid_t,
            DELAY_SIGNAL,
        );
    }
}

/// Sleep for `ns`, resuming across `EINTR`. Async-signal-safe.
pub(crate) fn nanosleep(ns: u64) {
    let mut req = ns_to_timespec(ns);
    let mut rem = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    while unsafe { libc::nanosleep(&req, &mut rem) } == -1 {
        if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
        req = rem;
    }
}

#[allow(clippy::cast_possible_wrap)]
fn ns_to_timespec(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as libc::c_long,
    }
}
