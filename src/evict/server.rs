//! Background eviction threads.
//!
//! One coordinator wakes periodically, checks the cache against its
//! targets and queues candidate pages; workers pop pages and evict them.
//! The coordinator evicts history store leaves itself.

use super::{candidates, evict_history, evict_page, pressure, Level};
use crate::engine::EngineState;
use crate::error::LapisError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const COORDINATOR_TICK: Duration = Duration::from_millis(10);
const WORKER_WAIT: Duration = Duration::from_millis(50);
/// Pages queued per coordinator pass, per worker
const PASS_PER_WORKER: usize = 4;

pub struct EvictServer {
    shutdown: Arc<AtomicBool>,
    /// Wakes the coordinator early
    tick: Arc<(Mutex<()>, Condvar)>,
    handles: Vec<JoinHandle<()>>,
}

impl EvictServer {
    /// Start the coordinator and `engine.config.eviction_threads` workers.
    pub fn start(engine: Arc<EngineState>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let tick = Arc::new((Mutex::new(()), Condvar::new()));
        let workers = engine.config.eviction_threads;
        let mut handles = Vec::with_capacity(workers + 1);

        for n in 0..workers {
            let engine = Arc::clone(&engine);
            let shutdown = Arc::clone(&shutdown);
            let spawned = thread::Builder::new()
                .name(format!("lapis-evict-{}", n))
                .spawn(move || worker_loop(&engine, &shutdown));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => warn!(target: "lapis::evict", error = %e, "could not start eviction worker"),
            }
        }

        if !handles.is_empty() {
            let engine = Arc::clone(&engine);
            let shutdown = Arc::clone(&shutdown);
            let tick = Arc::clone(&tick);
            let spawned = thread::Builder::new()
                .name("lapis-evict-server".into())
                .spawn(move || coordinator_loop(&engine, &shutdown, &tick, workers));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => warn!(target: "lapis::evict", error = %e, "could not start eviction server"),
            }
        }
        debug!(target: "lapis::evict", workers, "eviction server started");

        Self {
            shutdown,
            tick,
            handles,
        }
    }

    /// Stop and join every thread.
    pub fn stop(&mut self, engine: &EngineState) {
        self.shutdown.store(true, Ordering::Release);
        self.tick.1.notify_all();
        engine.evict.work.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        engine.evict.queue.lock().clear();
    }
}

fn coordinator_loop(engine: &EngineState, shutdown: &AtomicBool, tick: &(Mutex<()>, Condvar), workers: usize) {
    loop {
        {
            let mut guard = tick.0.lock();
            let _ = tick.1.wait_for(&mut guard, COORDINATOR_TICK);
        }
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if engine.check_panic().is_err() {
            continue;
        }
        let p = pressure(engine, Level::Target);
        if !p.any() || !engine.evict.is_empty() {
            continue;
        }
        for (table, page) in candidates(engine, p, workers * PASS_PER_WORKER) {
            engine.evict.push(table, page);
        }
        if p.total {
            evict_history(engine, workers * PASS_PER_WORKER);
        }
    }
}

fn worker_loop(engine: &EngineState, shutdown: &AtomicBool) {
    loop {
        let next = {
            let mut queue = engine.evict.queue.lock();
            if queue.is_empty() && !shutdown.load(Ordering::Acquire) {
                let _ = engine.evict.work.wait_for(&mut queue, WORKER_WAIT);
            }
            queue.pop_front()
        };
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some((table, page)) = next else {
            continue;
        };
        match evict_page(engine, &table, &page) {
            Ok(_) | Err(LapisError::EvictionBusy) => {}
            Err(e) => {
                warn!(target: "lapis::evict", table = table.id, page = page.id(), error = %e, "eviction failed");
            }
        }
    }
}
