use crate::link::transport::TickClock;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;

/// Periodic tick source.
///
/// The thread does nothing but advance the shared [`TickClock`]; no link or
/// engine state is reachable from it.
pub struct TickThread {
    clock: TickClock,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickThread {
    /// Starts ticking `clock` by `tick_ms` every `tick_ms` of wall time.
    pub fn start(clock: TickClock, tick_ms: u32) -> Self {
        let tick_ms = tick_ms.max(1);
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let clock = clock.clone();
            let running = Arc::clone(&running);
            spawn(move || {
                while running.load(Ordering::Acquire) {
                    sleep(Duration::from_millis(u64::from(tick_ms)));
                    clock.advance(tick_ms);
                }
                debug!("Tick thread stopped");
            })
        };
        Self {
            clock,
            running,
            handle: Some(handle),
        }
    }

    pub fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Stops the thread and waits for it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Tick thread panicked");
            }
        }
    }
}

impl Drop for TickThread {
    fn drop(&mut self) {
        self.stop();
    }
}
