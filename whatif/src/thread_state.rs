//! Per-thread profiling state
//!
//! One [`ThreadState`] exists per registered OS thread, shared between the
//! thread's sample ticker (which runs the delay engine in ordinary thread
//! context), the thread's own delay-enactment signal handler, the off-CPU
//! fan-out, and the experiment controller. Every field is either an atomic
//! or immutable, so cross-thread reads need no locks; the hot-path counters
//! are ticker-written and use relaxed ordering.
//!
//! The `in_use` flag follows the signal-fence protocol: it is a plain
//! relaxed store bracketed by a sequentially-consistent compiler fence, the
//! equivalent of `std::atomic_signal_fence`. A handler that observes `false`
//! must return before touching anything else. A relaxed atomic without the
//! fence is not enough: the fence orders the flag against the surrounding
//! teardown writes for a handler interrupting this same thread.

use std::collections::HashMap;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::Tid;

/// Raw value of `last_line` before any on-CPU sample has been classified.
pub const NO_LINE: u64 = u64::MAX;

pub struct ThreadState {
    pub tid: Tid,
    in_use: AtomicBool,

    /// Visits to the currently selected line this epoch.
    pub local_delay: AtomicU64,
    /// All on-CPU visits this epoch (the baseline).
    pub based_local_delay: AtomicU64,
    /// Delay debt already settled this epoch, in sample periods.
    pub delayed_local_delay: AtomicU64,
    /// Nanoseconds of delay actually slept, flushed to the global
    /// accumulator on sync.
    pub applied_delay_ns: AtomicU64,

    /// Delay decided by the sample ticker, awaiting enactment by the
    /// owning thread's signal handler.
    pub pending_delay_ns: AtomicU64,

    /// Epoch of the experiment the counters above refer to.
    pub ex_epoch: AtomicU64,

    /// End timestamp of the most recent credited blocked interval. On-CPU
    /// samples at or before this time lie inside the span: their wall
    /// clock is already paid, so they settle no debt.
    pub pre_block_time: AtomicU64,
    /// Blocked nanoseconds not yet consumed as delay credit.
    pub pre_local_time: AtomicU64,

    /// Per-source stream clocks; the two timebases drift independently, so
    /// each stream advances its own cursor and they meet only at batch
    /// boundaries.
    pub last_perf_time: AtomicU64,
    pub last_ebpf_time: AtomicU64,

    /// Raw `LineId` of the most recent on-CPU sample, or [`NO_LINE`].
    /// Io/Lock blocked durations are attributed here.
    pub last_line: AtomicU64,

    /// True while a blocked record is being consumed; suppresses delay
    /// application (a blocked thread must not be slowed twice).
    in_wait: AtomicBool,

    /// Edge trigger: the controller requests that local counters be folded
    /// into the global accumulators at the next batch boundary.
    pub sync_local_with_global: AtomicBool,
}

impl ThreadState {
    #[must_use]
    pub fn new(tid: Tid) -> Self {
        Self {
            tid,
            in_use: AtomicBool::new(false),
            local_delay: AtomicU64::new(0),
            based_local_delay: AtomicU64::new(0),
            delayed_local_delay: AtomicU64::new(0),
            applied_delay_ns: AtomicU64::new(0),
            pending_delay_ns: AtomicU64::new(0),
            ex_epoch: AtomicU64::new(0),
            pre_block_time: AtomicU64::new(0),
            pre_local_time: AtomicU64::new(0),
            last_perf_time: AtomicU64::new(0),
            last_ebpf_time: AtomicU64::new(0),
            last_line: AtomicU64::new(NO_LINE),
            in_wait: AtomicBool::new(false),
            sync_local_with_global: AtomicBool::new(false),
        }
    }

    pub fn set_in_use(&self, value: bool) {
        self.in_use.store(value, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst); // signal fence
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        compiler_fence(Ordering::SeqCst); // signal fence
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn set_in_wait(&self, value: bool) {
        self.in_wait.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn in_wait(&self) -> bool {
        self.in_wait.load(Ordering::Relaxed)
    }

    /// Reset the delay counters for a new experiment epoch. Blocked credit
    /// carries over: it is wall time the thread has already paid.
    pub fn roll_epoch(&self, epoch: u64) {
        if self.ex_epoch.swap(epoch, Ordering::Relaxed) != epoch {
            self.local_delay.store(0, Ordering::Relaxed);
            self.based_local_delay.store(0, Ordering::Relaxed);
            self.delayed_local_delay.store(0, Ordering::Relaxed);
        }
    }

    /// Consume a pending sync request, if any.
    #[must_use]
    pub fn take_sync_request(&self) -> bool {
        self.sync_local_with_global.swap(false, Ordering::AcqRel)
    }
}

/// Registry of live threads, shared by the controller (sync requests,
/// active-thread gating) and the runtime (registration).
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<u32, Arc<ThreadState>>>,
}

impl ThreadRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: Arc<ThreadState>) {
        self.threads.lock().expect("thread registry poisoned").insert(state.tid.0, state);
    }

    pub fn remove(&self, tid: Tid) -> Option<Arc<ThreadState>> {
        self.threads.lock().expect("thread registry poisoned").remove(&tid.0)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.threads
            .lock()
            .expect("thread registry poisoned")
            .values()
            .filter(|t| t.in_use())
            .count()
    }

    /// Ask every live thread to fold its local counters into the global
    /// accumulators at its next batch boundary.
    pub fn request_sync(&self) {
        for state in self.threads.lock().expect("thread registry poisoned").values() {
            state.sync_local_with_global.store(true, Ordering::Release);
        }
    }
}
