//! Periodic background workers.

use crate::error::Result;
use crate::signal::StopSignal;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A set of named threads that tick on a fixed period until stopped.
///
/// A tick that returns an error or panics is logged; the loop carries on
/// with the next tick. `stop()` lets the current tick finish.
pub struct WorkerGroup {
    stop: Arc<StopSignal>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(StopSignal::new()),
            handles: Vec::new(),
        }
    }

    /// Spawn a thread running `tick` every `interval`.
    pub fn spawn_periodic<F>(&mut self, name: &str, interval: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let stop = self.stop.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                info!(worker = %thread_name, interval_ms = interval.as_millis() as u64, "worker started");
                while !stop.is_stopped() {
                    let start = Instant::now();
                    match panic::catch_unwind(AssertUnwindSafe(&mut tick)) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(worker = %thread_name, error = %e, "worker tick failed"),
                        Err(_) => error!(worker = %thread_name, "worker tick panicked"),
                    }
                    debug!(
                        worker = %thread_name,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "worker tick finished"
                    );
                    if stop.wait_timeout(interval) {
                        break;
                    }
                }
                info!(worker = %thread_name, "worker stopped");
            })?;
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    /// Signal every worker and wait for them to exit.
    pub fn stop(&mut self) {
        self.stop.stop();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!(worker = %name, "worker thread panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for WorkerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
        }
    }
}
