//! Event fan-out
//!
//! Routes [`BlockedEvent`]s from the collector's poll thread to the owning
//! thread's bounded queue. Single producer (the poll thread), single
//! consumer (the owning worker) per queue. Overflow drops the oldest queued
//! event: the producer holds a receiver clone and evicts before retrying,
//! so memory stays bounded while the freshest block intervals survive.
//!
//! Events for unregistered TIDs are discarded and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;

use crate::domain::Tid;
use whatif_common::BlockedEvent;

/// Capacity of each per-thread off-CPU queue.
pub const QUEUE_CAPACITY: usize = 1024;

struct Route {
    tx: Sender<BlockedEvent>,
    /// Receiver clone used to evict the oldest event on overflow.
    evict: Receiver<BlockedEvent>,
}

#[derive(Default)]
pub struct EventRouter {
    routes: Mutex<HashMap<u32, Route>>,
    unknown_tid: AtomicU64,
    overflow_dropped: AtomicU64,
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread, returning the consuming end of its queue.
    pub fn register(&self, tid: Tid) -> Receiver<BlockedEvent> {
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let route = Route { tx, evict: rx.clone() };
        self.routes.lock().expect("router poisoned").insert(tid.0, route);
        rx
    }

    pub fn unregister(&self, tid: Tid) {
        self.routes.lock().expect("router poisoned").remove(&tid.0);
    }

    /// Deliver one event to its thread's queue.
    pub fn route(&self, event: &BlockedEvent) {
        let routes = self.routes.lock().expect("router poisoned");
        let Some(route) = routes.get(&event.tid) else {
            self.unknown_tid.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Err(TrySendError::Full(event)) = route.tx.try_send(*event) {
            // drop-oldest: evict one, then retry once
            let tid = event.tid;
            let _ = route.evict.try_recv();
            self.overflow_dropped.fetch_add(1, Ordering::Relaxed);
            if route.tx.try_send(event).is_err() {
                debug!("off-CPU queue for tid {tid} still full");
            }
        }
    }

    /// Events discarded because no thread owned the TID.
    #[must_use]
    pub fn unknown_tid_count(&self) -> u64 {
        self.unknown_tid.load(Ordering::Relaxed)
    }

    /// Events evicted from full queues.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_dropped.load(Ordering::Relaxed)
    }
}
