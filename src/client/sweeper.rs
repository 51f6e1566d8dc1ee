//! Periodic timeout sweep.
//!
//! The registry never times requests out on its own; something has to call
//! [`RequestRegistry::sweep_timeouts`] at a steady cadence. The connection
//! starts one [`TimeoutSweeper`] per registry.

use super::{lock_ignore_poison, RequestRegistry};
use crate::{log_debug, log_error};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Background thread calling `sweep_timeouts` every `interval`.
///
/// The thread holds the registry weakly and exits on its own once the
/// registry is dropped, or promptly when [`stop`](Self::stop) is called.
pub struct TimeoutSweeper {
    // ---
    flag: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSweeper {
    /// Start sweeping `registry` every `interval`.
    pub fn spawn(registry: Weak<RequestRegistry>, interval: Duration) -> Self {
        // ---
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });

        let thread_flag = flag.clone();
        let handle = thread::Builder::new()
            .name("mom-queue-sweeper".into())
            .spawn(move || sweep_loop(registry, interval, thread_flag));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                log_error!("failed to start timeout sweeper: {err}");
                None
            }
        };

        Self { flag, handle }
    }

    /// Stop the thread and wait for it to exit. Idempotent.
    pub fn stop(&mut self) {
        // ---
        *lock_ignore_poison(&self.flag.stopped) = true;
        self.flag.cv.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TimeoutSweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_loop(registry: Weak<RequestRegistry>, interval: Duration, flag: Arc<StopFlag>) {
    // ---
    log_debug!("timeout sweeper started, interval {interval:?}");

    let mut stopped = lock_ignore_poison(&flag.stopped);
    loop {
        let deadline = Instant::now() + interval;
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = match flag.cv.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        if *stopped {
            break;
        }

        let Some(live) = registry.upgrade() else {
            break;
        };

        // Sweep without holding the stop flag so `stop` never waits on it.
        drop(stopped);
        live.sweep_timeouts(Instant::now());
        drop(live);
        stopped = lock_ignore_poison(&flag.stopped);
    }

    log_debug!("timeout sweeper stopped");
}
