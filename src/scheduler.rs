//! Checkpoint and termination timing
//!
//! [`Scheduler`] is a pure state machine over monotonic instants; the timer
//! thread started by [`spawn`] only feeds it the current time. Checkpoints
//! are measured from the moment the previous one was actually observed, so a
//! stalled timer thread delays later checkpoints instead of bunching them up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default timer granularity
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(1);

/// What fell due at a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Due {
    pub checkpoint: bool,
    pub terminate: bool,
}

/// Timing state of a run
#[derive(Debug, Clone)]
pub struct Scheduler {
    start: Instant,
    last_checkpoint: Instant,
    interval: Duration,
    duration: Option<Duration>,
    terminate_sent: bool,
}

impl Scheduler {
    pub fn new(start: Instant, interval: Duration, duration: Option<Duration>) -> Self {
        Self {
            start,
            last_checkpoint: start,
            interval,
            duration,
            terminate_sent: false,
        }
    }

    /// Advance to `now`
    ///
    /// Termination is reported once; checkpoints keep falling due afterwards
    /// until the caller stops ticking.
    pub fn tick(&mut self, now: Instant) -> Due {
        let mut due = Due::default();

        if now.saturating_duration_since(self.last_checkpoint) >= self.interval {
            self.last_checkpoint = now;
            due.checkpoint = true;
        }

        if let Some(duration) = self.duration {
            if !self.terminate_sent && now.saturating_duration_since(self.start) >= duration {
                self.terminate_sent = true;
                due.terminate = true;
            }
        }

        due
    }

    /// Earliest instant at which something may fall due
    pub fn next_deadline(&self) -> Instant {
        let checkpoint = self.last_checkpoint + self.interval;
        match self.duration {
            Some(duration) if !self.terminate_sent => checkpoint.min(self.start + duration),
            _ => checkpoint,
        }
    }
}

/// Running timer thread; stops and joins on drop
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start the timer thread
///
/// The thread sleeps in steps of at most `resolution`, so it notices a stop
/// request within one step. A due checkpoint runs before a due termination.
pub fn spawn<C, T>(
    mut scheduler: Scheduler,
    resolution: Duration,
    mut on_checkpoint: C,
    mut on_terminate: T,
) -> std::io::Result<SchedulerHandle>
where
    C: FnMut() + Send + 'static,
    T: FnMut() + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = thread::Builder::new()
        .name("callbench-timer".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                let now = Instant::now();
                let wait = scheduler
                    .next_deadline()
                    .saturating_duration_since(now)
                    .min(resolution);
                if !wait.is_zero() {
                    thread::sleep(wait);
                }
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }

                let due = scheduler.tick(Instant::now());
                if due.checkpoint {
                    tracing::trace!("checkpoint due");
                    on_checkpoint();
                }
                if due.terminate {
                    tracing::debug!("duration elapsed");
                    on_terminate();
                }
            }
        })?;

    Ok(SchedulerHandle {
        stop,
        thread: Some(thread),
    })
}
