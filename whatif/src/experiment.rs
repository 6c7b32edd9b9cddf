//! Experiment controller
//!
//! A single coordinator thread drives an unbounded sequence of virtual
//! speedup experiments: pick a recently active line, publish `(line, s)` to
//! every worker through the atomic experiment slot, sleep for the experiment
//! window, then snapshot progress counters and record the delta together
//! with the delay that was actually applied.
//!
//! Publication protocol: the line and speedup are stored relaxed, then the
//! epoch is bumped with release ordering. Readers load the epoch first
//! (acquire), read the tuple, and re-check the epoch to detect a concurrent
//! update. Workers use the epoch to notice mid-batch reconfiguration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use rand::Rng;

use crate::config::Config;
use crate::domain::LineId;
use crate::lines::LineIndex;
use crate::output::ProfileWriter;
use crate::progress::{snapshot_delta, ProgressRegistry};
use crate::thread_state::ThreadRegistry;

/// Slot value meaning "no experiment running".
pub const NO_EXPERIMENT: u64 = u64::MAX;

/// An experiment ends early once any progress point advances this far.
const SATURATION_DELTA: u64 = 1 << 20;

/// Experiments only start while at least this many threads are live.
const MIN_ACTIVE_THREADS: usize = 1;

/// Process-wide experiment publication slot.
pub struct ExperimentSlot {
    epoch: AtomicU64,
    line: AtomicU64,
    speedup_bits: AtomicU64,
}

impl Default for ExperimentSlot {
    fn default() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            line: AtomicU64::new(NO_EXPERIMENT),
            speedup_bits: AtomicU64::new(0),
        }
    }
}

impl ExperimentSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `(line, s)`. The epoch store is last, with release ordering.
    pub fn publish(&self, line: LineId, speedup: f64) {
        self.line.store(line.0, Ordering::Relaxed);
        self.speedup_bits.store(speedup.to_bits(), Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// Write the "no experiment" sentinel.
    pub fn clear(&self) {
        self.line.store(NO_EXPERIMENT, Ordering::Relaxed);
        self.speedup_bits.store(0, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// Read `(epoch, current experiment)`, retrying across concurrent
    /// updates so the tuple is always consistent with the returned epoch.
    #[must_use]
    pub fn read(&self) -> (u64, Option<(LineId, f64)>) {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let line = self.line.load(Ordering::Relaxed);
            let speedup = f64::from_bits(self.speedup_bits.load(Ordering::Relaxed));
            if self.epoch.load(Ordering::Acquire) == epoch {
                let experiment =
                    (line != NO_EXPERIMENT).then_some((LineId(line), speedup));
                return (epoch, experiment);
            }
        }
    }
}

/// Process-wide accumulators fed by per-thread counter flushes.
#[derive(Default)]
pub struct GlobalDelayTotals {
    pub applied_delay_ns: AtomicU64,
    pub local_delay: AtomicU64,
    pub delayed_local_delay: AtomicU64,
}

impl GlobalDelayTotals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn applied_ns(&self) -> u64 {
        self.applied_delay_ns.load(Ordering::Relaxed)
    }
}

/// One completed experiment, as persisted to the profile log.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub line: LineId,
    pub speedup: f64,
    pub duration_ns: u64,
    /// Per-point progress deltas, in name order.
    pub delta_points: Vec<(String, u64)>,
    pub applied_delay_ns: u64,
}

/// The coordinator. Owns the profile writer for its whole life; final
/// progress-point lines are written on shutdown.
pub struct Controller {
    pub config: Config,
    pub lines: Arc<LineIndex>,
    pub registry: Arc<ProgressRegistry>,
    pub threads: Arc<ThreadRegistry>,
    pub slot: Arc<ExperimentSlot>,
    pub totals: Arc<GlobalDelayTotals>,
    pub shutdown: Receiver<()>,
    pub writer: ProfileWriter,
}

impl Controller {
    /// Run experiments until shutdown. Consumes the controller; the profile
    /// log is finalized before returning.
    pub fn run(mut self) {
        let mut speedup_idx = 0usize;
        // (visits, blocked_ns) per line at the end of the previous window
        let mut last_activity: HashMap<LineId, (u64, u64)> = HashMap::new();
        let mut rng = rand::thread_rng();

        if self.wait(Duration::from_nanos(self.config.warmup_ns)) {
            return self.finish();
        }

        loop {
            // Wait until there is something to measure.
            while self.registry.is_empty() || self.threads.active_count() < MIN_ACTIVE_THREADS {
                if self.wait(Duration::from_millis(10)) {
                    return self.finish();
                }
            }

            let Some((line_id, line)) = self.pick_line(&mut last_activity, &mut rng) else {
                if self.wait(Duration::from_millis(50)) {
                    return self.finish();
                }
                continue;
            };

            let speedup = self.config.speedups[speedup_idx % self.config.speedups.len()];
            speedup_idx += 1;

            let progress_before = self.registry.snapshot();
            let applied_before = self.totals.applied_ns();
            let visits_before = line.visits();

            debug!("experiment: {} at speedup {speedup}", line.name());
            self.slot.publish(line_id, speedup);
            let started = Instant::now();

            let (shutdown, elapsed) = self.experiment_window(started, &progress_before);
            self.slot.clear();

            // Workers flush their local counters on their next timer tick;
            // give them two sample periods before reading the totals.
            self.threads.request_sync();
            let grace = Duration::from_nanos(2 * self.config.sample_period_ns);
            let shutdown = self.wait(grace) || shutdown;

            let visits_delta = line.visits().saturating_sub(visits_before);
            line.add_global_delays(elapsed.as_nanos() as u64 / self.config.sample_period_ns);

            if visits_delta == 0 {
                // The selected line went quiet; nothing was learned.
                debug!("selected line {} had no visits, discarding window", line.name());
            } else {
                let record = ExperimentRecord {
                    line: line_id,
                    speedup,
                    duration_ns: elapsed.as_nanos() as u64,
                    delta_points: snapshot_delta(&progress_before, &self.registry.snapshot()),
                    applied_delay_ns: self.totals.applied_ns() - applied_before,
                };
                if let Err(e) = self.writer.experiment(&record) {
                    log::warn!("failed to write experiment record: {e}");
                }
            }

            if shutdown {
                return self.finish();
            }
        }
    }

    /// Pick a line uniformly at random among those active since the last
    /// window (on-CPU visits or attributed blocked time).
    fn pick_line(
        &self,
        last_activity: &mut HashMap<LineId, (u64, u64)>,
        rng: &mut impl Rng,
    ) -> Option<(LineId, Arc<crate::lines::ProgressLine>)> {
        let mut candidates = Vec::new();
        for (id, line) in self.lines.all_lines() {
            let now = (line.visits(), line.blocked_ns());
            let then = last_activity.insert(id, now).unwrap_or((0, 0));
            let active = now.0 > then.0 || now.1 > then.1;
            if active && self.lines.is_selectable(id, &line) {
                candidates.push((id, line));
            }
        }
        if candidates.is_empty() {
            return None;
        }
        let pick = rng.gen_range(0..candidates.len());
        Some(candidates.swap_remove(pick))
    }

    /// Sleep through the experiment window in slices, checking for shutdown
    /// and progress saturation. Returns (shutdown requested, elapsed).
    fn experiment_window(
        &self,
        started: Instant,
        before: &std::collections::BTreeMap<String, u64>,
    ) -> (bool, Duration) {
        let target = Duration::from_nanos(self.config.experiment_ns);
        loop {
            let elapsed = started.elapsed();
            if elapsed >= target {
                return (false, elapsed);
            }
            let slice = (target - elapsed).min(Duration::from_millis(50));
            if self.wait(slice) {
                return (true, started.elapsed());
            }
            let saturated = self
                .registry
                .snapshot()
                .iter()
                .any(|(name, count)| {
                    count.saturating_sub(before.get(name).copied().unwrap_or(0))
                        >= SATURATION_DELTA
                });
            if saturated {
                debug!("progress saturation, ending experiment early");
                return (false, started.elapsed());
            }
        }
    }

    /// Block for `timeout`; true when shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.shutdown.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    fn finish(mut self) {
        for (name, count) in self.registry.snapshot() {
            if let Err(e) = self.writer.progress_point(&name, count) {
                log::warn!("failed to write progress point {name}: {e}");
            }
        }
        if let Err(e) = self.writer.flush() {
            log::warn!("failed to flush profile log: {e}");
        }
        info!("profile log finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_starts_empty() {
        let slot = ExperimentSlot::new();
        let (epoch, experiment) = slot.read();
        assert_eq!(epoch, 0);
        assert!(experiment.is_none());
    }

    #[test]
    fn publish_and_clear_bump_epoch() {
        let slot = ExperimentSlot::new();

        slot.publish(LineId(7), 0.25);
        let (epoch, experiment) = slot.read();
        assert_eq!(epoch, 1);
        assert_eq!(experiment, Some((LineId(7), 0.25)));

        slot.clear();
        let (epoch, experiment) = slot.read();
        assert_eq!(epoch, 2);
        assert!(experiment.is_none());
    }

    #[test]
    fn concurrent_readers_never_see_torn_tuples() {
        use std::sync::atomic::AtomicBool;

        let slot = Arc::new(ExperimentSlot::new());
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let (_, experiment) = slot.read();
                        if let Some((line, speedup)) = experiment {
                            // writers only ever publish matched pairs
                            assert_eq!(line.0, (speedup * 100.0) as u64);
                        }
                    }
                })
            })
            .collect();

        for i in 0..10_000u64 {
            let s = f64::from(u32::try_from(i % 101).unwrap()) / 100.0;
            slot.publish(LineId((s * 100.0) as u64), s);
            if i % 7 == 0 {
                slot.clear();
            }
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn totals_accumulate() {
        let totals = GlobalDelayTotals::new();
        totals.applied_delay_ns.fetch_add(1_000, Ordering::Relaxed);
        totals.applied_delay_ns.fetch_add(500, Ordering::Relaxed);
        assert_eq!(totals.applied_ns(), 1_500);
    }
}
