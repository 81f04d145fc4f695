//! A software stand-in for an audio driver.
//!
//! [`HostThread`] drives a root [`RtEngine`] from its own thread at a fixed
//! period, the way an audio callback would. It exists for headless use and
//! tests; a real host calls [`RtEngine::process`] from its own callback.

use crate::engine::RtEngine;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Counters shared with the driving thread.
#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    failures: AtomicU64,
}

/// A thread calling [`RtEngine::process`] every period.
pub struct HostThread {
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<RtEngine>>,
}

impl HostThread {
    /// Marks `engine` live and starts cycling it.
    ///
    /// A zero `period` runs cycles back to back.
    pub fn spawn(engine: RtEngine, frames: usize, period: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());
        engine.set_live(true);

        let r = Arc::clone(&running);
        let c = Arc::clone(&counters);
        let handle = thread::spawn(move || {
            let mut engine = engine;
            let mut next = Instant::now();
            while r.load(Ordering::Acquire) {
                if let Err(_e) = engine.process(frames) {
                    c.failures.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "cycle failed");
                }
                c.cycles.fetch_add(1, Ordering::Release);
                next += period;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    next = now;
                    thread::yield_now();
                }
            }
            engine.set_live(false);
            engine
        });

        #[cfg(feature = "tracing")]
        tracing::info!(frames, period_us = period.as_micros() as u64, "host thread started");
        Self {
            running,
            counters,
            handle: Some(handle),
        }
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.counters.cycles.load(Ordering::Acquire)
    }

    /// Cycles that ended with a failing client.
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    /// Blocks until at least `count` more cycles have run.
    pub fn wait_cycles(&self, count: u64) {
        let target = self.cycles() + count;
        while self.cycles() < target && self.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stops the thread and returns the engine, no longer live.
    ///
    /// Returns `None` if the thread panicked.
    pub fn stop(mut self) -> Option<RtEngine> {
        self.running.store(false, Ordering::Release);
        let engine = self.handle.take()?.join().ok();
        #[cfg(feature = "tracing")]
        tracing::info!(cycles = self.cycles(), "host thread stopped");
        engine
    }
}

impl Drop for HostThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
