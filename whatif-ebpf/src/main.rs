//! Kernel-side half of the off-CPU sampler.
//!
//! A single tracepoint program on `sched/sched_switch` stamps the moment each
//! tracked thread leaves the CPU and, when the thread is scheduled back in,
//! emits a [`BlockedEvent`] carrying the measured block duration and a
//! classification of why the thread was switched out (preemption, lock wait,
//! unknown). Userspace consumes the events from the per-CPU ring and feeds
//! them to the per-thread delay engine.
//!
//! Only threads whose TGID is present in `TARGET_PIDS` are tracked; userspace
//! inserts the profiled process at startup. Intervals shorter than 1 µs are
//! noise from the scheduler fast path and are dropped here rather than
//! shipped across the ring.

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{map, tracepoint},
    maps::{HashMap, PerfEventArray, StackTrace},
    programs::TracePointContext,
    EbpfContext,
};
use whatif_common::{classify_prev_state, BlockedEvent, SchedSwitchArgs, BLOCKED_UNKNOWN, MIN_BLOCK_NS};

/// TGIDs of processes being profiled. Value is presence only.
#[map(name = "target_pids")]
static TARGET_PIDS: HashMap<u32, u8> = HashMap::with_max_entries(1024, 0);

/// Sched-out timestamps by TID.
#[map(name = "block_start")]
static BLOCK_START: HashMap<u32, u64> = HashMap::with_max_entries(10240, 0);

/// Block classification by TID, recorded at sched-out.
#[map(name = "block_reason")]
static BLOCK_REASON: HashMap<u32, u8> = HashMap::with_max_entries(10240, 0);

/// User stack traces. Capture is currently disabled (`stack_id = -1` in
/// emitted events); walking the user stack on every context switch is a
/// measurable overhead source.
#[map(name = "stacks")]
static STACKS: StackTrace = StackTrace::with_max_entries(4096, 0);

/// Per-CPU ring carrying [`BlockedEvent`]s to userspace.
#[map(name = "events")]
static EVENTS: PerfEventArray<BlockedEvent> = PerfEventArray::new(0);

/// Tracepoint: sched/sched_switch
/// Fired on every context switch
#[tracepoint]
pub fn sched_switch(ctx: TracePointContext) -> u32 {
    match try_sched_switch(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_sched_switch(ctx: &TracePointContext) -> Result<(), i64> {
    // prev_pid/next_pid are TIDs
    let args: *const SchedSwitchArgs = ctx.as_ptr() as *const SchedSwitchArgs;
    let prev_tid = unsafe { (*args).prev_pid as u32 };
    let prev_state = unsafe { (*args).prev_state };
    let next_tid = unsafe { (*args).next_pid as u32 };

    // Upper 32 bits = TGID, used for filtering
    let tgid = (unsafe { bpf_get_current_pid_tgid() } >> 32) as u32;
    if unsafe { TARGET_PIDS.get(&tgid) }.is_none() {
        return Ok(());
    }

    let ts = unsafe { bpf_ktime_get_ns() };

    // sched out: stamp the block start and why the thread left
    if prev_tid != 0 {
        let reason = classify_prev_state(prev_state);
        unsafe {
            BLOCK_START.insert(&prev_tid, &ts, 0)?;
            BLOCK_REASON.insert(&prev_tid, &reason, 0)?;
        }
    }

    // sched in: close the interval and emit
    if next_tid != 0 {
        let Some(start) = (unsafe { BLOCK_START.get(&next_tid).copied() }) else {
            // No sched-out recorded for this thread
            return Ok(());
        };

        let duration = ts.wrapping_sub(start);
        if duration >= MIN_BLOCK_NS {
            let reason =
                unsafe { BLOCK_REASON.get(&next_tid).copied() }.unwrap_or(BLOCKED_UNKNOWN);

            let event = BlockedEvent {
                pid: next_tid, // FIXME: should be the TGID; keep until consumers are audited
                tid: next_tid,
                duration_ns: duration,
                blocked_type: reason,
                _padding: [0u8; 7],
                timestamp_ns: ts,
                stack_id: -1, // stack capture disabled, see STACKS
                comm: unsafe { bpf_get_current_comm() }.unwrap_or([0u8; 16]),
            };

            EVENTS.output(ctx, &event, 0);
        }

        unsafe {
            BLOCK_START.remove(&next_tid)?;
            // The reason entry may be missing when the start was stamped
            // before the thread's first classification; ignore.
            let _ = BLOCK_REASON.remove(&next_tid);
        }
    }

    Ok(())
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
