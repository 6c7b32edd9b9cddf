//! Unified sample model
//!
//! On-CPU perf records and off-CPU [`BlockedEvent`]s are folded into one
//! tagged [`Sample`] shape so the delay engine can consume a single merged
//! stream. The two sources keep independent timebases; merging happens only
//! at batch boundaries, by non-decreasing timestamp, with blocked records
//! ordered before on-CPU records at equal timestamps so a closed block
//! interval is credited before the next on-CPU sample is charged.

use whatif_common::{
    BlockedEvent, BLOCKED_IOWAIT, BLOCKED_LOCKWAIT, BLOCKED_SCHED, BLOCKED_UNKNOWN,
};

/// Why a thread spent an interval off the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Unknown,
    IoWait,
    /// Preempted while runnable.
    Sched,
    LockWait,
}

impl BlockReason {
    #[must_use]
    pub fn from_wire(blocked_type: u8) -> Self {
        match blocked_type {
            BLOCKED_IOWAIT => Self::IoWait,
            BLOCKED_SCHED => Self::Sched,
            BLOCKED_LOCKWAIT => Self::LockWait,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Unknown => BLOCKED_UNKNOWN,
            Self::IoWait => BLOCKED_IOWAIT,
            Self::Sched => BLOCKED_SCHED,
            Self::LockWait => BLOCKED_LOCKWAIT,
        }
    }

    /// True for reasons whose blocked time is attributed to the thread's
    /// most recent line as block-source weight.
    #[must_use]
    pub fn attributes_to_line(self) -> bool {
        matches!(self, Self::IoWait | Self::LockWait)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    OnCpu,
    Blocked(BlockReason),
}

/// One record of the merged per-thread stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub tid: u32,
    /// Event timestamp in the source's timebase, nanoseconds.
    pub time_ns: u64,
    /// On-CPU: the sample period. Blocked: the measured block duration.
    pub weight_ns: u64,
    /// Instruction pointer; 0 for blocked records (no capture).
    pub ip: u64,
    pub kind: SampleKind,
}

impl Sample {
    #[must_use]
    pub fn on_cpu(tid: u32, time_ns: u64, period_ns: u64, ip: u64) -> Self {
        Self { tid, time_ns, weight_ns: period_ns, ip, kind: SampleKind::OnCpu }
    }

    #[must_use]
    pub fn from_blocked(evt: &BlockedEvent) -> Self {
        Self {
            tid: evt.tid,
            time_ns: evt.timestamp_ns,
            weight_ns: evt.duration_ns,
            ip: 0,
            kind: SampleKind::Blocked(BlockReason::from_wire(evt.blocked_type)),
        }
    }

    /// Adapter weight in microseconds, the unit downstream consumers use for
    /// blocked records.
    #[must_use]
    pub fn weight_us(&self) -> u64 {
        self.weight_ns / 1000
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(self.kind, SampleKind::Blocked(_))
    }
}

/// Order a batch by timestamp; blocked before on-CPU on ties.
pub fn sort_batch(batch: &mut [Sample]) {
    batch.sort_by_key(|s| (s.time_ns, u8::from(!s.is_blocked())));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(time_ns: u64, duration_ns: u64, blocked_type: u8) -> Sample {
        Sample::from_blocked(&BlockedEvent {
            pid: 1,
            tid: 1,
            duration_ns,
            blocked_type,
            _padding: [0; 7],
            timestamp_ns: time_ns,
            stack_id: -1,
            comm: [0; 16],
        })
    }

    #[test]
    fn wire_reason_round_trip() {
        for reason in
            [BlockReason::Unknown, BlockReason::IoWait, BlockReason::Sched, BlockReason::LockWait]
        {
            assert_eq!(BlockReason::from_wire(reason.as_wire()), reason);
        }
        // unrecognized values collapse to Unknown
        assert_eq!(BlockReason::from_wire(0), BlockReason::Unknown);
        assert_eq!(BlockReason::from_wire(99), BlockReason::Unknown);
    }

    #[test]
    fn blocked_adapter_reports_microsecond_weight() {
        let s = blocked(10, 500_000, BLOCKED_LOCKWAIT);
        assert_eq!(s.weight_us(), 500);
        assert_eq!(s.kind, SampleKind::Blocked(BlockReason::LockWait));
    }

    #[test]
    fn merge_orders_by_time_blocked_first() {
        let mut batch = vec![
            Sample::on_cpu(1, 30, 1000, 0xa),
            blocked(20, 5_000, BLOCKED_SCHED),
            Sample::on_cpu(1, 20, 1000, 0xb),
            blocked(10, 2_000, BLOCKED_UNKNOWN),
        ];
        sort_batch(&mut batch);

        assert_eq!(batch[0].time_ns, 10);
        assert!(batch[0].is_blocked());
        // tie at t=20 resolves blocked-before-on-cpu
        assert_eq!(batch[1].time_ns, 20);
        assert!(batch[1].is_blocked());
        assert_eq!(batch[2].time_ns, 20);
        assert!(!batch[2].is_blocked());
        assert_eq!(batch[3].time_ns, 30);
    }

    #[test]
    fn io_and_lock_attribute_to_line() {
        assert!(BlockReason::IoWait.attributes_to_line());
        assert!(BlockReason::LockWait.attributes_to_line());
        assert!(!BlockReason::Sched.attributes_to_line());
        assert!(!BlockReason::Unknown.attributes_to_line());
    }
}
