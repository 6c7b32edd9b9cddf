//! Profiler runtime
//!
//! Process-wide lifecycle and the per-thread wiring. `begin_profile` builds
//! the global state (experiment slot, line index, progress registry,
//! collector, controller thread) exactly once; concurrent profiles are
//! refused. `register_thread` binds the calling thread: it opens the
//! thread's on-CPU sampler, its off-CPU queue, and its sample ticker — a
//! dedicated thread that drains both streams through the delay engine every
//! period, in ordinary thread context.
//!
//! The only code on a signal path is delay enactment: when the ticker
//! decides a sleep, it posts the amount to the thread's `pending_delay_ns`
//! and kicks the thread with [`timer::kick`]. The handler is restricted to
//! async-signal-safe work — the fence-guarded in-use check, one atomic
//! swap, `nanosleep` — and teardown clears the handler's state pointer and
//! the in-use flag before anything else is torn down, so a late signal
//! falls through harmlessly.

#![allow(unsafe_code)] // signal handler installation requires unsafe

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Once, RwLock};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::collector::{EventRouter, OffCpuCollector};
use crate::config::Config;
use crate::delay::DelayEngine;
use crate::domain::{Pid, ProfilerError, Tid};
use crate::experiment::{Controller, ExperimentSlot, GlobalDelayTotals};
use crate::lines::{LineIndex, LineResolver};
use crate::output::ProfileWriter;
use crate::progress::ProgressRegistry;
use crate::sampler::OnCpuSampler;
use crate::samples::{sort_batch, Sample};
use crate::thread_state::{ThreadRegistry, ThreadState};
use crate::timer::{kick, nanosleep, SampleTicker, DELAY_SIGNAL};

/// Everything shared by the controller, the collector, and worker threads.
pub(crate) struct GlobalState {
    pub config: Config,
    pub slot: Arc<ExperimentSlot>,
    pub lines: Arc<LineIndex>,
    pub registry: Arc<ProgressRegistry>,
    pub threads: Arc<ThreadRegistry>,
    pub totals: Arc<GlobalDelayTotals>,
    pub router: Arc<EventRouter>,
    collector: Mutex<Option<OffCpuCollector>>,
    controller: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Sender<()>,
}

static ACTIVE: RwLock<Option<Arc<GlobalState>>> = RwLock::new(None);

fn current() -> Option<Arc<GlobalState>> {
    ACTIVE.read().expect("profiler state poisoned").clone()
}

/// Whether a profile is currently active.
#[must_use]
pub fn is_active() -> bool {
    current().is_some()
}

/// Start a profile. Loads and attaches the off-CPU collector (fatal on
/// failure unless `off_cpu=off`), opens the profile log, and launches the
/// experiment controller.
///
/// # Errors
/// - `ProfilerError::AlreadyActive` when a profile is running
/// - `ProfilerError::Config` for invalid options
/// - `ProfilerError::BpfLoad` when the probe cannot be loaded or attached
/// - I/O errors from creating the profile log
pub fn begin_profile(
    config: Config,
    resolver: Box<dyn LineResolver>,
) -> Result<(), ProfilerError> {
    config.validate()?;
    let _ = env_logger::Builder::from_default_env().try_init();

    let mut active = ACTIVE.write().expect("profiler state poisoned");
    if active.is_some() {
        return Err(ProfilerError::AlreadyActive);
    }

    let router = Arc::new(EventRouter::new());

    let collector = if config.off_cpu {
        let mut collector = OffCpuCollector::load(&config.probe_path, Arc::clone(&router))?;
        collector.start()?;
        // Non-fatal per pid: the probe simply sees no events for it.
        if let Err(e) = collector.add_pid(Pid(std::process::id())) {
            warn!("could not register own pid with the probe: {e}");
        }
        Some(collector)
    } else {
        info!("off-CPU collection disabled, running on-CPU only");
        None
    };

    let writer = ProfileWriter::create(&config.output)?;
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

    let slot = Arc::new(ExperimentSlot::new());
    let lines = Arc::new(LineIndex::new(resolver, config.target_lines.clone()));
    let registry = Arc::new(ProgressRegistry::new());
    let threads = Arc::new(ThreadRegistry::new());
    let totals = Arc::new(GlobalDelayTotals::new());

    let controller = Controller {
        config: config.clone(),
        lines: Arc::clone(&lines),
        registry: Arc::clone(&registry),
        threads: Arc::clone(&threads),
        slot: Arc::clone(&slot),
        totals: Arc::clone(&totals),
        shutdown: shutdown_rx,
        writer,
    };
    let handle = std::thread::Builder::new()
        .name("whatif-controller".into())
        .spawn(move || controller.run())?;

    info!("profile started, log at {}", config.output.display());
    *active = Some(Arc::new(GlobalState {
        config,
        slot,
        lines,
        registry,
        threads,
        totals,
        router,
        collector: Mutex::new(collector),
        controller: Mutex::new(Some(handle)),
        shutdown_tx,
    }));
    Ok(())
}

/// End the active profile: cancel the current experiment, finalize the log,
/// and stop the collector. Threads that stay registered keep running
/// undisturbed; with the slot cleared they accrue no delay.
///
/// # Errors
/// `ProfilerError::NotActive` when no profile is running.
pub fn end_profile() -> Result<(), ProfilerError> {
    let state = ACTIVE
        .write()
        .expect("profiler state poisoned")
        .take()
        .ok_or(ProfilerError::NotActive)?;

    state.slot.clear();
    let _ = state.shutdown_tx.send(());
    if let Some(handle) = state.controller.lock().expect("controller handle poisoned").take() {
        let _ = handle.join();
    }
    if let Some(mut collector) = state.collector.lock().expect("collector poisoned").take() {
        collector.stop();
    }
    info!("profile ended");
    Ok(())
}

/// Declare a named progress counter. No-op without an active profile.
pub fn progress_point(name: &str) {
    if let Some(globals) = current() {
        globals.registry.declare(name);
    }
}

/// Bump a progress counter. Hot path: one registry read plus one relaxed
/// increment. No-op without an active profile.
pub fn progress(name: &str) {
    if let Some(globals) = current() {
        globals.registry.bump(name);
    }
}

/// The sample-processing context, owned and driven by the thread's ticker.
struct WorkerCtx {
    sampler: OnCpuSampler,
    queue: crossbeam_channel::Receiver<whatif_common::BlockedEvent>,
    engine: DelayEngine,
    state: Arc<ThreadState>,
    globals: Arc<GlobalState>,
    // scratch buffers reused across ticks so steady-state processing does
    // not allocate
    ip_scratch: Vec<crate::sampler::IpSample>,
    batch_scratch: Vec<Sample>,
}

impl WorkerCtx {
    /// One sample-processing tick: drain both streams, merge by timestamp,
    /// run the delay engine, and hand the decided sleep to the profiled
    /// thread for enactment.
    fn process_tick(&mut self) {
        if !self.state.in_use() {
            return;
        }

        self.ip_scratch.clear();
        self.batch_scratch.clear();

        self.sampler.drain_into(&mut self.ip_scratch);
        let period = self.globals.config.sample_period_ns;
        for record in &self.ip_scratch {
            self.batch_scratch.push(Sample::on_cpu(record.tid, record.time, period, record.ip));
        }
        while let Ok(event) = self.queue.try_recv() {
            self.batch_scratch.push(Sample::from_blocked(&event));
        }
        sort_batch(&mut self.batch_scratch);

        let sleep_ns = self.engine.process_batch(
            &self.state,
            &self.globals.lines,
            &self.globals.slot,
            &self.batch_scratch,
        );
        DelayEngine::sync_if_requested(&self.state, &self.globals.totals);

        if sleep_ns > 0 {
            self.state.pending_delay_ns.fetch_add(sleep_ns, Ordering::Relaxed);
            kick(self.state.tid);
        }
    }
}

/// Per-thread registration record, kept in the worker's TLS.
struct Registration {
    state: Arc<ThreadState>,
    globals: Arc<GlobalState>,
    ticker: Option<SampleTicker>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // A signal in flight must not find this thread's state: clear the
        // handler pointer and the in-use flag before anything else tears
        // down. try_with tolerates thread-exit teardown ordering.
        let _ = DELAY_STATE.try_with(|cell| cell.set(ptr::null()));
        self.state.set_in_use(false);
    }
}

thread_local! {
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
    static DELAY_STATE: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
}

/// Delay enactment, the one signal-handler-critical region. Everything here
/// is async-signal-safe: a TLS cell read, the fence-guarded in-use check,
/// one atomic swap, and `nanosleep`.
extern "C" fn on_delay_signal(_signal: libc::c_int) {
    let state_ptr = DELAY_STATE.with(Cell::get);
    if state_ptr.is_null() {
        return;
    }
    // SAFETY: the pointer targets this thread's Arc'd ThreadState, cleared
    // from DELAY_STATE before the registration drops; the handler runs on
    // the owning thread.
    let state = unsafe { &*state_ptr };
    if !state.in_use() {
        return;
    }
    let pending = state.pending_delay_ns.swap(0, Ordering::Relaxed);
    if pending > 0 {
        nanosleep(pending);
    }
}

fn install_delay_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: standard sigaction installation of an async-signal-safe
        // handler.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_delay_signal as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(DELAY_SIGNAL, &action, ptr::null_mut()) != 0 {
                warn!("failed to install delay handler: {}", std::io::Error::last_os_error());
            }
        }
    });
}

/// Bind the calling thread to the active profile: open its on-CPU sampler,
/// register its off-CPU queue, and start its sample ticker. Idempotent for
/// an already-registered thread.
///
/// # Errors
/// - `ProfilerError::NotActive` without an active profile
/// - `ProfilerError::Sampler` when the perf event cannot be opened
/// - I/O errors from spawning the ticker
pub fn register_thread() -> Result<(), ProfilerError> {
    let Some(globals) = current() else {
        return Err(ProfilerError::NotActive);
    };
    if REGISTRATION.with(|registration| registration.borrow().is_some()) {
        return Ok(());
    }

    let tid = Tid(unsafe { libc::gettid() } as u32);
    let state = Arc::new(ThreadState::new(tid));

    let sampler = OnCpuSampler::open(tid, globals.config.sample_period_ns)?;
    sampler.start().map_err(ProfilerError::Sampler)?;
    let queue = globals.router.register(tid);

    install_delay_handler();

    let mut ctx = WorkerCtx {
        sampler,
        queue,
        engine: DelayEngine::new(globals.config.sample_period_ns),
        state: Arc::clone(&state),
        globals: Arc::clone(&globals),
        ip_scratch: Vec::with_capacity(256),
        batch_scratch: Vec::with_capacity(512),
    };
    let ticker =
        SampleTicker::start(tid, globals.config.sample_period_ns, move || ctx.process_tick())?;

    DELAY_STATE.with(|cell| cell.set(Arc::as_ptr(&state)));
    REGISTRATION.with(|registration| {
        *registration.borrow_mut() = Some(Registration {
            state: Arc::clone(&state),
            globals: Arc::clone(&globals),
            ticker: Some(ticker),
        });
    });

    globals.threads.insert(Arc::clone(&state));
    state.set_in_use(true);
    debug!("registered {tid}");
    Ok(())
}

/// Unbind the calling thread. Stops its ticker, then flushes its local
/// delay counters into the global accumulators; a thread that never saw an
/// experiment contributes zeros, leaving global state untouched. No-op when
/// not registered.
pub fn unregister_thread() {
    let Some(mut registration) = REGISTRATION.with(|r| r.borrow_mut().take()) else {
        return;
    };

    // quiesce the handler, then join the ticker so no tick is in flight
    DELAY_STATE.with(|cell| cell.set(ptr::null()));
    registration.state.set_in_use(false);
    drop(registration.ticker.take());

    registration.globals.router.unregister(registration.state.tid);
    registration.globals.threads.remove(registration.state.tid);

    // fold whatever the thread accumulated into the global totals
    registration.state.sync_local_with_global.store(true, Ordering::Release);
    DelayEngine::sync_if_requested(&registration.state, &registration.globals.totals);

    debug!("unregistered {}", registration.state.tid);
    drop(registration);
}
