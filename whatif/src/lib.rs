//! # whatif — a causal profiler with off-CPU awareness
//!
//! Answers "how much would end-to-end performance improve if this line ran
//! K% faster?" by running virtual speedup experiments: the controller picks
//! a progress line, and for the length of the experiment every thread
//! observed executing *other* lines is delayed proportionally. Progress
//! point counters measured around the experiment reveal how sensitive the
//! program is to the selected line.
//!
//! Two sample streams feed the per-thread delay engine:
//!
//! - an on-CPU stream from a per-thread `perf_event_open` task-clock
//!   sampler, and
//! - an off-CPU stream from an eBPF `sched_switch` probe that measures how
//!   long each thread stayed blocked and why (preemption, lock wait,
//!   unknown).
//!
//! Blocked time is credited, never charged: a thread that was already off
//! the CPU is not slowed a second time, and I/O or lock waits are
//! attributed to the line the thread last executed, so block *sources* are
//! candidates for experiments too.
//!
//! ## Usage
//!
//! ```no_run
//! use whatif::{Config, RangeResolver};
//!
//! let mut resolver = RangeResolver::new();
//! resolver.add(0x1000, 0x2000, "src/worker.rs:42");
//!
//! whatif::begin_profile(Config::default(), Box::new(resolver))?;
//! whatif::register_thread()?;
//! whatif::progress_point("loop_iter");
//! loop {
//!     // ... work ...
//!     whatif::progress("loop_iter");
//!     # break;
//! }
//! whatif::unregister_thread();
//! whatif::end_profile()?;
//! # Ok::<(), whatif::ProfilerError>(())
//! ```

pub mod collector;
pub mod config;
pub mod delay;
pub mod domain;
pub mod experiment;
pub mod lines;
pub mod output;
pub mod progress;
pub mod runtime;
pub mod sampler;
pub mod samples;
pub mod thread_state;
mod timer;

pub use config::Config;
pub use domain::{LineId, ProfilerError};
pub use lines::{LineIndex, LineResolver, RangeResolver};
pub use runtime::{
    begin_profile, end_profile, is_active, progress, progress_point, register_thread,
    unregister_thread,
};
