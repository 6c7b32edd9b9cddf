//! Off-CPU collector
//!
//! Userspace side of the sched_switch probe. Owns the loaded eBPF object,
//! the target-PID filter, and a poll thread that drains the per-CPU ring
//! buffers and fans events out to the owning threads' queues.
//!
//! Load/attach failures are fatal to the caller (no off-CPU data can be
//! produced); lost ring-buffer records are logged per CPU and counted but
//! never fatal — a missed block event only risks under-crediting a thread.

pub mod cpu_utils;
pub mod router;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::MapData;
use aya::programs::TracePoint;
use aya::Ebpf;
use bytes::BytesMut;
use log::{debug, info, warn};

use crate::domain::{Pid, ProfilerError};
pub use cpu_utils::online_cpus;
pub use router::EventRouter;
use whatif_common::BlockedEvent;

/// Ring pages per CPU.
const RING_PAGES: usize = 8;

/// Poll timeout; bounds shutdown latency of the poll thread.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct OffCpuCollector {
    bpf: Ebpf,
    router: Arc<EventRouter>,
    lost_events: Arc<AtomicU64>,
    stopping: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl OffCpuCollector {
    /// Open, load, and verify the probe bytecode.
    ///
    /// # Errors
    /// `ProfilerError::BpfLoad` when the bytecode is missing or rejected by
    /// the verifier.
    pub fn load(probe_path: &Path, router: Arc<EventRouter>) -> Result<Self, ProfilerError> {
        let bytecode = std::fs::read(probe_path).map_err(|e| {
            ProfilerError::BpfLoad(format!("read {}: {e}", probe_path.display()))
        })?;
        let bpf = Ebpf::load(&bytecode)
            .map_err(|e| ProfilerError::BpfLoad(format!("load probe: {e}")))?;

        info!("off-CPU probe loaded from {}", probe_path.display());
        Ok(Self {
            bpf,
            router,
            lost_events: Arc::new(AtomicU64::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            poller: None,
        })
    }

    /// Attach the sched_switch program and start the poll thread.
    ///
    /// # Errors
    /// `ProfilerError::BpfLoad` when attachment or ring setup fails.
    pub fn start(&mut self) -> Result<(), ProfilerError> {
        if let Err(e) = aya_log::EbpfLogger::init(&mut self.bpf) {
            // the probe carries no log statements unless rebuilt with them
            debug!("eBPF logger unavailable: {e}");
        }

        let program: &mut TracePoint = self
            .bpf
            .program_mut("sched_switch")
            .ok_or_else(|| ProfilerError::BpfLoad("sched_switch program not found".into()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| ProfilerError::BpfLoad(e.to_string()))?;
        program
            .load()
            .map_err(|e| ProfilerError::BpfLoad(format!("load sched_switch: {e}")))?;
        program
            .attach("sched", "sched_switch")
            .map_err(|e| ProfilerError::BpfLoad(format!("attach sched_switch: {e}")))?;
        info!("attached tracepoint sched/sched_switch");

        let events = AsyncPerfEventArray::try_from(
            self.bpf
                .take_map("events")
                .ok_or_else(|| ProfilerError::BpfLoad("events map not found".into()))?,
        )
        .map_err(|e| ProfilerError::BpfLoad(format!("events ring: {e}")))?;

        let cpus =
            online_cpus().map_err(|e| ProfilerError::BpfLoad(format!("online cpus: {e}")))?;

        let router = Arc::clone(&self.router);
        let lost = Arc::clone(&self.lost_events);
        let stopping = Arc::clone(&self.stopping);

        self.poller = Some(std::thread::spawn(move || {
            if let Err(e) = poll_loop(events, cpus, &router, &lost, &stopping) {
                warn!("off-CPU poll loop exited: {e}");
            }
        }));

        Ok(())
    }

    /// Insert a process into the target-PID filter.
    ///
    /// # Errors
    /// `ProfilerError::BpfMap` on map update failure; non-fatal per pid, the
    /// caller decides whether to log or abort.
    pub fn add_pid(&mut self, pid: Pid) -> Result<(), ProfilerError> {
        let mut map: aya::maps::HashMap<_, u32, u8> = aya::maps::HashMap::try_from(
            self.bpf
                .map_mut("target_pids")
                .ok_or(ProfilerError::BpfMap { map: "target_pids", error: "not found".into() })?,
        )
        .map_err(|e| ProfilerError::BpfMap { map: "target_pids", error: e.to_string() })?;

        map.insert(pid.0, 1, 0)
            .map_err(|e| ProfilerError::BpfMap { map: "target_pids", error: e.to_string() })?;
        info!("tracking {pid}");
        Ok(())
    }

    /// Stop the poll thread. Programs detach when the collector drops.
    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
            info!("off-CPU collector stopped, {} events lost", self.lost_count());
        }
    }

    #[must_use]
    pub fn lost_count(&self) -> u64 {
        self.lost_events.load(Ordering::Relaxed)
    }
}

impl Drop for OffCpuCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drive one async reader per CPU under a current-thread runtime. Each
/// reader drains its ring with a bounded timeout so the stop flag is
/// observed promptly; interruptions surface as timeouts and are ignored.
fn poll_loop(
    mut events: AsyncPerfEventArray<MapData>,
    cpus: Vec<u32>,
    router: &Arc<EventRouter>,
    lost: &Arc<AtomicU64>,
    stopping: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build collector runtime")?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let mut readers = Vec::new();
        for cpu in cpus {
            let buf = events
                .open(cpu, Some(RING_PAGES))
                .with_context(|| format!("open ring for cpu {cpu}"))?;
            readers.push(tokio::task::spawn_local(drain_cpu(
                cpu,
                buf,
                Arc::clone(router),
                Arc::clone(lost),
                Arc::clone(stopping),
            )));
        }
        for reader in readers {
            let _ = reader.await;
        }
        Ok(())
    })
}

async fn drain_cpu(
    cpu: u32,
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    router: Arc<EventRouter>,
    lost: Arc<AtomicU64>,
    stopping: Arc<AtomicBool>,
) {
    let event_size = std::mem::size_of::<BlockedEvent>();
    let mut buffers: Vec<BytesMut> = (0..16).map(|_| BytesMut::with_capacity(1024)).collect();

    while !stopping.load(Ordering::Relaxed) {
        let read = match tokio::time::timeout(POLL_TIMEOUT, buf.read_events(&mut buffers)).await {
            Err(_) => continue, // timeout, re-check the stop flag
            Ok(Err(e)) => {
                warn!("cpu {cpu}: ring read failed: {e}");
                break;
            }
            Ok(Ok(events)) => events,
        };

        if read.lost > 0 {
            lost.fetch_add(read.lost as u64, Ordering::Relaxed);
            warn!("cpu {cpu}: lost {} off-CPU events", read.lost);
        }

        for bytes in buffers.iter().take(read.read) {
            if bytes.len() < event_size {
                warn!("cpu {cpu}: truncated off-CPU event ({} bytes)", bytes.len());
                continue;
            }
            // SAFETY: length checked above; the probe writes valid BlockedEvent data
            #[allow(unsafe_code)]
            let event =
                unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<BlockedEvent>()) };
            router.route(&event);
        }
    }
}
