#![no_std]

// Shared data structures between the sched_switch probe and userspace

/// Block classification for an off-CPU interval.
///
/// Carried in [`BlockedEvent::blocked_type`]. The values are a wire contract;
/// both sides of the ring buffer are built from this crate.
pub const BLOCKED_UNKNOWN: u8 = 1;
pub const BLOCKED_IOWAIT: u8 = 2;
/// Preemption: the thread was runnable when it was switched out.
pub const BLOCKED_SCHED: u8 = 3;
/// futex/mutex wait (heuristic, see [`classify_prev_state`])
pub const BLOCKED_LOCKWAIT: u8 = 4;

/// Off-CPU intervals shorter than this are dropped in the probe.
pub const MIN_BLOCK_NS: u64 = 1_000;

/// Classify why a thread left the CPU from the `prev_state` word of the
/// `sched_switch` tracepoint.
///
/// - runnable (0): preempted, another task got the CPU
/// - `TASK_UNINTERRUPTIBLE` (2): usually a lock or I/O wait; reported as
///   `LOCKWAIT`. TODO: read `in_iowait` via CO-RE to split out true I/O waits.
/// - `TASK_INTERRUPTIBLE` (1): could be many things, reported as `UNKNOWN`
#[must_use]
pub const fn classify_prev_state(prev_state: i64) -> u8 {
    match prev_state {
        0 => BLOCKED_SCHED,
        2 => BLOCKED_LOCKWAIT,
        _ => BLOCKED_UNKNOWN,
    }
}

/// Event sent from the probe to userspace when a thread is scheduled back in.
///
/// Field order and widths are a compatibility contract; `comm` is NUL-padded.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BlockedEvent {
    pub pid: u32,
    pub tid: u32,
    /// Time spent blocked, in nanoseconds.
    pub duration_ns: u64,
    /// One of the `BLOCKED_*` constants.
    pub blocked_type: u8,
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7], // Padding for alignment
    /// When the thread was scheduled back in (`bpf_ktime_get_ns`).
    pub timestamp_ns: u64,
    /// Stack trace ID from the stack map, or -1 when capture is disabled.
    pub stack_id: i64,
    /// Thread name.
    pub comm: [u8; 16],
}

/// Tracepoint arguments for `sched_switch`
/// Layout from `/sys/kernel/debug/tracing/events/sched/sched_switch/format`
#[repr(C)]
pub struct SchedSwitchArgs {
    #[allow(clippy::pub_underscore_fields)]
    pub __unused__: u64,
    pub prev_comm: [u8; 16],
    pub prev_pid: i32,
    pub prev_prio: i32,
    pub prev_state: i64,
    pub next_comm: [u8; 16],
    pub next_pid: i32,
    pub next_prio: i32,
}

#[cfg(feature = "user")]
use aya::Pod;

// Required for eBPF <-> userspace communication: Pod asserts the type can be
// transmitted as plain bytes.
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for BlockedEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn blocked_event_layout_is_stable() {
        assert_eq!(size_of::<BlockedEvent>(), 56);
        assert_eq!(offset_of!(BlockedEvent, pid), 0);
        assert_eq!(offset_of!(BlockedEvent, tid), 4);
        assert_eq!(offset_of!(BlockedEvent, duration_ns), 8);
        assert_eq!(offset_of!(BlockedEvent, blocked_type), 16);
        assert_eq!(offset_of!(BlockedEvent, timestamp_ns), 24);
        assert_eq!(offset_of!(BlockedEvent, stack_id), 32);
        assert_eq!(offset_of!(BlockedEvent, comm), 40);
    }

    #[test]
    fn prev_state_classification() {
        assert_eq!(classify_prev_state(0), BLOCKED_SCHED);
        assert_eq!(classify_prev_state(1), BLOCKED_UNKNOWN);
        assert_eq!(classify_prev_state(2), BLOCKED_LOCKWAIT);
        assert_eq!(classify_prev_state(4), BLOCKED_UNKNOWN);
        assert_eq!(classify_prev_state(-1), BLOCKED_UNKNOWN);
    }
}
