//! Per-thread delay engine
//!
//! Turns the merged sample stream into virtual speedup: every on-CPU sample
//! at a line other than the selected one accrues delay debt of one quantum
//! (`s × period`), and the engine decides how long the thread must sleep to
//! settle it. Blocked intervals are wall time the thread has already paid,
//! so they are converted into credit that debt is settled against instead of
//! sleeping — a blocked thread must never be slowed a second time.
//!
//! The engine only *decides*; the runtime posts the returned nanoseconds to
//! the thread's pending-delay word, and the thread itself enacts them with
//! `nanosleep`. That split keeps the arithmetic testable without clocks.

use std::sync::atomic::Ordering;

use crate::domain::LineId;
use crate::experiment::{ExperimentSlot, GlobalDelayTotals};
use crate::lines::LineIndex;
use crate::samples::{Sample, SampleKind};
use crate::thread_state::{ThreadState, NO_LINE};

/// Upper bound for one delay quantum. Bounds in-flight sleeps when an epoch
/// change was missed.
pub const MAX_QUANTUM_NS: u64 = 1_000_000;

pub struct DelayEngine {
    period_ns: u64,
}

impl DelayEngine {
    #[must_use]
    pub fn new(period_ns: u64) -> Self {
        Self { period_ns }
    }

    /// One delay quantum for speedup `s`, clamped to `[0, 1 ms]`.
    #[must_use]
    pub fn quantum_ns(&self, speedup: f64) -> u64 {
        let quantum = speedup * self.period_ns as f64;
        (quantum as u64).min(MAX_QUANTUM_NS)
    }

    /// Process a merged, time-ordered batch. Returns the nanoseconds the
    /// calling thread must sleep to enact the current experiment.
    ///
    /// The slot is re-read per record so a mid-batch experiment change
    /// reclassifies the remainder of the batch against the new selection,
    /// with counters reset to the new epoch's baseline.
    pub fn process_batch(
        &self,
        state: &ThreadState,
        lines: &LineIndex,
        slot: &ExperimentSlot,
        batch: &[Sample],
    ) -> u64 {
        let (mut epoch, mut experiment) = slot.read();
        state.roll_epoch(epoch);

        let mut sleep_ns = 0u64;
        for sample in batch {
            let (now_epoch, now_experiment) = slot.read();
            if now_epoch != epoch {
                epoch = now_epoch;
                experiment = now_experiment;
                state.roll_epoch(epoch);
            }

            match sample.kind {
                SampleKind::OnCpu => {
                    sleep_ns += self.on_cpu(state, lines, experiment, sample);
                }
                SampleKind::Blocked(reason) => {
                    self.blocked(state, lines, reason.attributes_to_line(), sample);
                }
            }
        }
        sleep_ns
    }

    fn on_cpu(
        &self,
        state: &ThreadState,
        lines: &LineIndex,
        experiment: Option<(LineId, f64)>,
        sample: &Sample,
    ) -> u64 {
        let line = lines.classify(sample.ip);
        if let Some(progress_line) = lines.get(line) {
            progress_line.add_visit();
        }
        state.last_line.store(line.0, Ordering::Relaxed);
        state.last_perf_time.store(sample.time_ns, Ordering::Relaxed);

        let Some((selected, speedup)) = experiment else {
            return 0;
        };

        state.based_local_delay.fetch_add(1, Ordering::Relaxed);
        if line == selected {
            // A visit to the selected line earns the right not to be slowed
            // for this sample.
            state.local_delay.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let quantum = self.quantum_ns(speedup);
        if quantum == 0 {
            return 0;
        }

        if state.in_wait() {
            // Already blocked; the debt stays on the books.
            return 0;
        }

        if sample.time_ns <= state.pre_block_time.load(Ordering::Relaxed) {
            // The sample lies inside the last credited blocked span (the
            // two stream clocks drift); that wall time is already paid, so
            // settle nothing here and let the credit cover it later.
            return 0;
        }

        let based = state.based_local_delay.load(Ordering::Relaxed);
        let local = state.local_delay.load(Ordering::Relaxed);
        let delayed = state.delayed_local_delay.load(Ordering::Relaxed);
        let debt = based.saturating_sub(local).saturating_sub(delayed);
        if debt == 0 {
            return 0;
        }

        let mut owed_ns = debt * quantum;

        // Settle against blocked credit first.
        let credit = state.pre_local_time.load(Ordering::Relaxed);
        let paid = owed_ns.min(credit);
        if paid > 0 {
            state.pre_local_time.fetch_sub(paid, Ordering::Relaxed);
            owed_ns -= paid;
        }

        state.delayed_local_delay.fetch_add(debt, Ordering::Relaxed);
        state.applied_delay_ns.fetch_add(owed_ns, Ordering::Relaxed);
        owed_ns
    }

    fn blocked(
        &self,
        state: &ThreadState,
        lines: &LineIndex,
        attribute_to_line: bool,
        sample: &Sample,
    ) {
        state.set_in_wait(true);

        // The blocked span is wall time already paid: future on-CPU debt is
        // settled against it instead of sleeping.
        state.pre_block_time.store(sample.time_ns, Ordering::Relaxed);
        state.pre_local_time.fetch_add(sample.weight_ns, Ordering::Relaxed);
        state.last_ebpf_time.store(sample.time_ns, Ordering::Relaxed);

        if attribute_to_line {
            let last = state.last_line.load(Ordering::Relaxed);
            if last != NO_LINE {
                if let Some(line) = lines.get(LineId(last)) {
                    line.add_blocked_ns(sample.weight_ns);
                }
            }
        }

        state.set_in_wait(false);
    }

    /// Fold the thread's local counters into the global accumulators and
    /// reset them, when the controller has requested a sync.
    pub fn sync_if_requested(state: &ThreadState, totals: &GlobalDelayTotals) {
        if !state.take_sync_request() {
            return;
        }
        totals
            .local_delay
            .fetch_add(state.local_delay.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        totals.delayed_local_delay.fetch_add(
            state.delayed_local_delay.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
        totals.applied_delay_ns.fetch_add(
            state.applied_delay_ns.swap(0, Ordering::Relaxed),
            Ordering::Relaxed,
        );
        // Baseline resets with the others so the debt arithmetic stays
        // consistent within the epoch.
        state.based_local_delay.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tid;
    use crate::lines::RangeResolver;
    use whatif_common::BlockedEvent;

    const PERIOD: u64 = 1_000_000;

    fn fixture() -> (DelayEngine, ThreadState, LineIndex, ExperimentSlot) {
        let mut resolver = RangeResolver::new();
        resolver.add(0x1000, 0x2000, "hot");
        resolver.add(0x2000, 0x3000, "cold");
        let lines = LineIndex::new(Box::new(resolver), Vec::new());
        (DelayEngine::new(PERIOD), ThreadState::new(Tid(1)), lines, ExperimentSlot::new())
    }

    fn on_cpu(time_ns: u64, ip: u64) -> Sample {
        Sample::on_cpu(1, time_ns, PERIOD, ip)
    }

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

    fn counters(state: &ThreadState) -> (u64, u64, u64) {
        (
            state.local_delay.load(Ordering::Relaxed),
            state.based_local_delay.load(Ordering::Relaxed),
            state.delayed_local_delay.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn quantum_scales_and_clamps() {
        let engine = DelayEngine::new(PERIOD);
        assert_eq!(engine.quantum_ns(0.0), 0);
        assert_eq!(engine.quantum_ns(0.5), 500_000);
        assert_eq!(engine.quantum_ns(1.0), 1_000_000);

        // 4 ms period at s=1 would exceed the clamp
        let slow = DelayEngine::new(4_000_000);
        assert_eq!(slow.quantum_ns(1.0), MAX_QUANTUM_NS);
    }

    #[test]
    fn no_experiment_means_no_delay() {
        let (engine, state, lines, slot) = fixture();
        let sleep =
            engine.process_batch(&state, &lines, &slot, &[on_cpu(1, 0x1000), on_cpu(2, 0x2000)]);
        assert_eq!(sleep, 0);
        assert_eq!(counters(&state), (0, 0, 0));
        // visits still count
        let hot = lines.classify(0x1000);
        assert_eq!(lines.get(hot).unwrap().visits(), 1);
    }

    #[test]
    fn zero_speedup_never_delays() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 0.0);

        let batch: Vec<Sample> = (0..100).map(|i| on_cpu(i, 0x2000 + (i % 0x800))).collect();
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, 0);
        let (local, based, delayed) = counters(&state);
        assert_eq!(based, 100);
        assert_eq!(local, 0);
        assert_eq!(delayed, 0);
    }

    #[test]
    fn selected_line_visits_are_never_charged() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        let batch: Vec<Sample> = (0..10).map(|i| on_cpu(i, 0x1000)).collect();
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, 0);
        let (local, based, delayed) = counters(&state);
        assert_eq!((local, based, delayed), (10, 10, 0));
    }

    #[test]
    fn full_speedup_charges_one_period_per_foreign_sample() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        let batch: Vec<Sample> = (0..5).map(|i| on_cpu(i, 0x2000)).collect();
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, 5 * PERIOD);
        assert_eq!(state.applied_delay_ns.load(Ordering::Relaxed), 5 * PERIOD);
        let (local, based, delayed) = counters(&state);
        assert_eq!((local, based, delayed), (0, 5, 5));
    }

    #[test]
    fn counter_invariants_hold_under_mixed_stream() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 0.5);

        let mut batch = Vec::new();
        for i in 0..200u64 {
            let ip = if i % 3 == 0 { 0x1000 } else { 0x2000 };
            batch.push(on_cpu(i * PERIOD, ip));
            if i % 17 == 0 {
                batch.push(blocked(i * PERIOD, 30_000, whatif_common::BLOCKED_LOCKWAIT));
            }
        }
        crate::samples::sort_batch(&mut batch);
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);

        let (local, based, delayed) = counters(&state);
        assert!(local <= based);
        assert!(delayed <= based);
        // applied delay never exceeds quantum × foreign visits
        let quantum = engine.quantum_ns(0.5);
        assert!(sleep <= (based - local) * quantum);
    }

    #[test]
    fn blocked_credit_settles_debt_without_sleeping() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        // 500 µs block followed by one foreign sample: half the period is
        // paid by credit, half is slept.
        let batch = vec![
            blocked(10, 500_000, whatif_common::BLOCKED_LOCKWAIT),
            on_cpu(20, 0x2000),
        ];
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, PERIOD - 500_000);
        assert_eq!(state.pre_local_time.load(Ordering::Relaxed), 0);
        // the debt itself is fully settled
        assert_eq!(state.delayed_local_delay.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn oversized_block_credit_carries_forward() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        let batch = vec![
            blocked(10, 3 * PERIOD, whatif_common::BLOCKED_UNKNOWN),
            on_cpu(20, 0x2000),
            on_cpu(30, 0x2000),
        ];
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, 0);
        // 3 periods of credit minus 2 settled
        assert_eq!(state.pre_local_time.load(Ordering::Relaxed), PERIOD);
    }

    #[test]
    fn samples_inside_credited_block_settle_nothing() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        // tie at t=50: the blocked record sorts first and stamps the span
        // end, so the on-CPU sample falls inside the paid interval
        let mut batch = vec![
            on_cpu(50, 0x2000),
            blocked(50, 10_000, whatif_common::BLOCKED_UNKNOWN),
        ];
        crate::samples::sort_batch(&mut batch);
        let sleep = engine.process_batch(&state, &lines, &slot, &batch);
        assert_eq!(sleep, 0);
        let (_, based, delayed) = counters(&state);
        assert_eq!(based, 1);
        assert_eq!(delayed, 0, "debt inside the span stays on the books");

        // a later sample settles the whole debt against the credit
        let sleep = engine.process_batch(&state, &lines, &slot, &[on_cpu(60, 0x2000)]);
        assert_eq!(state.delayed_local_delay.load(Ordering::Relaxed), 2);
        assert_eq!(sleep, 2 * PERIOD - 10_000);
    }

    #[test]
    fn in_wait_suppresses_sleep() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        state.set_in_wait(true);
        let sleep = engine.process_batch(&state, &lines, &slot, &[on_cpu(1, 0x2000)]);
        assert_eq!(sleep, 0);
        // debt is not settled while waiting
        assert_eq!(state.delayed_local_delay.load(Ordering::Relaxed), 0);
        assert_eq!(state.based_local_delay.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn lock_wait_attributes_to_last_sampled_line() {
        let (engine, state, lines, slot) = fixture();
        let _ = slot;

        let batch = vec![
            on_cpu(10, 0x1000),
            blocked(20, 250_000, whatif_common::BLOCKED_LOCKWAIT),
            blocked(30, 100_000, whatif_common::BLOCKED_SCHED),
        ];
        engine.process_batch(&state, &lines, &slot, &batch);

        let hot = lines.classify(0x1000);
        // only the lock wait is attributed; preemption is not
        assert_eq!(lines.get(hot).unwrap().blocked_ns(), 250_000);
    }

    #[test]
    fn epoch_change_mid_batch_resets_baseline() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        engine.process_batch(&state, &lines, &slot, &[on_cpu(1, 0x2000)]);
        assert_eq!(state.based_local_delay.load(Ordering::Relaxed), 1);

        // new experiment: counters restart from the new epoch's baseline
        let cold = lines.classify(0x2000);
        slot.publish(cold, 0.5);
        let sleep = engine.process_batch(&state, &lines, &slot, &[on_cpu(2, 0x2000)]);
        assert_eq!(sleep, 0);
        let (local, based, delayed) = counters(&state);
        assert_eq!((local, based, delayed), (1, 1, 0));
    }

    #[test]
    fn sync_flushes_and_resets_locals() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        engine.process_batch(
            &state,
            &lines,
            &slot,
            &[on_cpu(1, 0x1000), on_cpu(2, 0x2000), on_cpu(3, 0x2000)],
        );

        let totals = GlobalDelayTotals::new();
        // no request: nothing moves
        DelayEngine::sync_if_requested(&state, &totals);
        assert_eq!(totals.applied_ns(), 0);

        state.sync_local_with_global.store(true, Ordering::Release);
        DelayEngine::sync_if_requested(&state, &totals);
        assert_eq!(totals.local_delay.load(Ordering::Relaxed), 1);
        assert_eq!(totals.delayed_local_delay.load(Ordering::Relaxed), 2);
        assert_eq!(totals.applied_ns(), 2 * PERIOD);
        assert_eq!(counters(&state), (0, 0, 0));
    }

    #[test]
    fn unknown_ips_count_as_unattributed() {
        let (engine, state, lines, slot) = fixture();
        let hot = lines.classify(0x1000);
        slot.publish(hot, 1.0);

        engine.process_batch(&state, &lines, &slot, &[on_cpu(1, 0xdead_beef)]);
        assert_eq!(lines.attribution_misses(), 1);
        // unattributed samples still accrue debt like any foreign line
        assert_eq!(state.delayed_local_delay.load(Ordering::Relaxed), 1);
    }
}
