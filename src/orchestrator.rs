//! Run lifecycle: attach, checkpoint, drain
//!
//! The controlling thread (the caller of [`Orchestrator::run`]) acquires the
//! target, installs instrumentation and then blocks on the event channel.
//! Periodic checkpoints are written from the timer thread; the final drain is
//! written from the controlling thread. Both go through one mutex around the
//! report writer, and the drain is claimed through a single atomic flag so it
//! runs at most once.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use nix::sys::signal::Signal;

use crate::aggregate::{self, ResultAggregator, Totals};
use crate::config::{Accumulation, RunConfig, Target};
use crate::counters::CounterSource;
use crate::error::{BenchError, Result};
use crate::launcher::{ProcessLauncher, TargetExit, TargetHandle};
use crate::privilege::{Credentials, Identity, ProcessCredentials};
use crate::report::{ReportWriter, Snapshot};
use crate::scheduler::{self, Scheduler, DEFAULT_RESOLUTION};
use crate::syscalls::{NameResolver, SyscallTable};

/// How often the controlling thread checks the target without a notification
const REAP_POLL: Duration = Duration::from_millis(250);
/// Minimum spacing of target checks triggered by child notifications
const REAP_MIN_GAP: Duration = Duration::from_millis(50);

/// Lifecycle states of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Init = 0,
    Attaching = 1,
    Running = 2,
    Checkpointing = 3,
    Draining = 4,
    Terminated = 5,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Init,
            1 => RunState::Attaching,
            2 => RunState::Running,
            3 => RunState::Checkpointing,
            4 => RunState::Draining,
            _ => RunState::Terminated,
        }
    }
}

/// Atomic lifecycle state shared by every thread of a run
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    draining: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Init as u8),
            draining: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, state: RunState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: RunState, to: RunState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the final drain; returns true for exactly one caller
    pub fn begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// Why a run stopped measuring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Signal(Signal),
    TargetExited(TargetExit),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::DurationElapsed => write!(f, "duration elapsed"),
            StopReason::Signal(sig) => write!(f, "received {}", sig),
            StopReason::TargetExited(TargetExit::Exited(code)) => {
                write!(f, "target exited with status {}", code)
            }
            StopReason::TargetExited(TargetExit::Signaled(sig)) => {
                write!(f, "target killed by {}", sig)
            }
            StopReason::TargetExited(TargetExit::Vanished) => write!(f, "target exited"),
        }
    }
}

/// Notifications delivered to the controlling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Begin the final drain
    Terminate(StopReason),
    /// Some child changed state; check whether the target is gone
    ChildStateChanged,
}

/// Snapshot bookkeeping of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Snapshots produced, written or not
    pub produced: u64,
    pub written: u64,
    /// Writes skipped because no unprivileged identity was known
    pub skipped: u64,
    pub failed: u64,
}

/// Result of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub reason: StopReason,
    pub stats: WriteStats,
    pub final_written: bool,
}

impl RunOutcome {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        if self.final_written {
            0
        } else {
            1
        }
    }
}

/// Produces and writes snapshots; only ever used under the session mutex
struct Reporter {
    source: Arc<dyn CounterSource>,
    aggregator: ResultAggregator,
    writer: ReportWriter,
    accumulation: Accumulation,
    baseline: Totals,
    next_index: u64,
    start_time: DateTime<Local>,
    stats: WriteStats,
}

impl Reporter {
    /// Read, reduce and write one snapshot; true if it reached its destination
    fn checkpoint(&mut self) -> bool {
        let raw = self.source.snapshot();
        let records = match self.accumulation {
            Accumulation::Cumulative => self.aggregator.reduce(&raw),
            Accumulation::Interval => {
                let records = self.aggregator.reduce_since(&raw, &self.baseline);
                self.baseline = aggregate::totals(&raw);
                records
            }
        };

        let snapshot = Snapshot {
            index: self.next_index,
            start_time: Some(self.start_time),
            current_time: Local::now(),
            records,
        };
        self.next_index += 1;
        self.stats.produced += 1;

        match self.writer.write(&snapshot) {
            Ok(()) => {
                self.stats.written += 1;
                true
            }
            Err(e) => {
                if matches!(e, BenchError::Privilege { .. }) {
                    self.stats.skipped += 1;
                } else {
                    self.stats.failed += 1;
                }
                tracing::warn!("{}", e);
                false
            }
        }
    }
}

/// State shared between the timer thread and the controlling thread
struct Session {
    lifecycle: Arc<Lifecycle>,
    reporter: Mutex<Reporter>,
}

impl Session {
    /// Periodic checkpoint; skipped once the drain has been claimed
    fn periodic(&self) {
        if self.lifecycle.is_draining() {
            return;
        }
        let mut reporter = self.reporter.lock().unwrap_or_else(PoisonError::into_inner);
        if !self
            .lifecycle
            .transition(RunState::Running, RunState::Checkpointing)
        {
            return;
        }
        reporter.checkpoint();
        self.lifecycle
            .transition(RunState::Checkpointing, RunState::Running);
    }

    /// Final checkpoint; `None` if another caller already drained
    fn drain(&self) -> Option<bool> {
        if !self.lifecycle.begin_drain() {
            return None;
        }
        let mut reporter = self.reporter.lock().unwrap_or_else(PoisonError::into_inner);
        self.lifecycle.set(RunState::Draining);
        let written = reporter.checkpoint();
        self.lifecycle.set(RunState::Terminated);
        if written {
            eprintln!(
                "[callbench: Final snapshot {} written]",
                reporter.next_index - 1
            );
        }
        Some(written)
    }

    fn stats(&self) -> WriteStats {
        self.reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats
    }
}

type Streams = (Box<dyn Write + Send>, Box<dyn Write + Send>);

/// Wires launcher, counter source, scheduler and report writer into one run
pub struct Orchestrator {
    config: RunConfig,
    source: Arc<dyn CounterSource>,
    resolver: Arc<dyn NameResolver>,
    creds: Arc<dyn Credentials>,
    identity: Option<Identity>,
    launcher: ProcessLauncher,
    resolution: Duration,
    streams: Option<Streams>,
    lifecycle: Arc<Lifecycle>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl Orchestrator {
    pub fn new(config: RunConfig, source: Arc<dyn CounterSource>) -> Self {
        let creds: Arc<dyn Credentials> = Arc::new(ProcessCredentials);
        let identity = Identity::resolve(config.identity, creds.effective());
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            source,
            resolver: Arc::new(SyscallTable),
            creds,
            identity,
            launcher: ProcessLauncher::new(),
            resolution: DEFAULT_RESOLUTION,
            streams: None,
            lifecycle: Arc::new(Lifecycle::new()),
            events_tx,
            events_rx,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Credential backend and the identity file writes run as
    pub fn with_credentials(
        mut self,
        creds: Arc<dyn Credentials>,
        identity: Option<Identity>,
    ) -> Self {
        self.creds = creds;
        self.identity = identity;
        self
    }

    /// Timer granularity
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    /// Replace the stdout and tee streams of the report writer
    pub fn with_streams(
        mut self,
        stdout: impl Write + Send + 'static,
        tee: impl Write + Send + 'static,
    ) -> Self {
        self.streams = Some((Box::new(stdout), Box::new(tee)));
        self
    }

    /// Sender for termination and child notifications
    pub fn event_sender(&self) -> Sender<Event> {
        self.events_tx.clone()
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Run to completion
    ///
    /// Setup errors are returned as `Err`; once measuring has started the run
    /// always ends in a drain and returns its outcome.
    pub fn run(mut self) -> Result<RunOutcome> {
        let result = self.run_inner();
        self.lifecycle.set(RunState::Terminated);
        result
    }

    fn run_inner(&mut self) -> Result<RunOutcome> {
        self.config.validate()?;

        self.lifecycle.set(RunState::Attaching);
        // A parked child is killed and reaped when `target` drops on error
        let mut target = self.acquire_target()?;
        self.source
            .install(&target.scope(self.config.follow_children))?;
        self.launcher.release(&mut target)?;
        if let TargetHandle::Spawned(child) = &target {
            eprintln!("[callbench: Released process {}]", child.pid());
        }

        let session = Arc::new(self.session());
        self.lifecycle.set(RunState::Running);

        let timer = {
            let periodic = Arc::clone(&session);
            let events = self.events_tx.clone();
            scheduler::spawn(
                Scheduler::new(Instant::now(), self.config.checkpoint, self.config.duration),
                self.resolution,
                move || periodic.periodic(),
                move || {
                    let _ = events.send(Event::Terminate(StopReason::DurationElapsed));
                },
            )
            .map_err(|source| BenchError::Thread {
                name: "timer",
                source,
            })?
        };

        let reason = self.wait_for_termination(&mut target);
        eprintln!("[callbench: Stopping: {}]", reason);

        let final_written = session.drain().unwrap_or(false);
        timer.stop();
        drop(target);

        Ok(RunOutcome {
            reason,
            stats: session.stats(),
            final_written,
        })
    }

    fn acquire_target(&self) -> Result<TargetHandle> {
        match &self.config.target {
            Target::System => {
                eprintln!("[callbench: Measuring system-wide]");
                Ok(TargetHandle::System)
            }
            Target::Pid(pid) => {
                let handle = self.launcher.attach(*pid)?;
                eprintln!("[callbench: Attached to process {}]", pid);
                Ok(handle)
            }
            Target::Spawn { program, args } => {
                let handle = self.launcher.spawn(program, args)?;
                if let Some(pid) = handle.pid() {
                    eprintln!("[callbench: Spawned {} as process {}]", program, pid);
                }
                Ok(handle)
            }
        }
    }

    fn session(&mut self) -> Session {
        let mut writer = ReportWriter::new(&self.config, self.identity, Arc::clone(&self.creds));
        if let Some((stdout, tee)) = self.streams.take() {
            writer = writer.with_streams(stdout, tee);
        }
        Session {
            lifecycle: Arc::clone(&self.lifecycle),
            reporter: Mutex::new(Reporter {
                source: Arc::clone(&self.source),
                aggregator: ResultAggregator::new(
                    Arc::clone(&self.resolver),
                    self.config.show_average,
                    self.config.sort,
                ),
                writer,
                accumulation: self.config.accumulation,
                baseline: Totals::new(),
                next_index: 0,
                start_time: Local::now(),
                stats: WriteStats::default(),
            }),
        }
    }

    /// Block until a terminate condition is observed
    fn wait_for_termination(&self, target: &mut TargetHandle) -> StopReason {
        let mut last_reap: Option<Instant> = None;
        loop {
            let check = match self.events_rx.recv_timeout(REAP_POLL) {
                Ok(Event::Terminate(reason)) => return reason,
                Ok(Event::ChildStateChanged) => {
                    // A traced target raises SIGCHLD at every ptrace stop
                    if let Some(reason) = coalesce(&self.events_rx) {
                        return reason;
                    }
                    last_reap.is_none_or(|at| at.elapsed() >= REAP_MIN_GAP)
                }
                Err(RecvTimeoutError::Timeout) => true,
                // We hold a sender, so the channel cannot disconnect
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(REAP_POLL);
                    true
                }
            };
            if check {
                last_reap = Some(Instant::now());
                if let Some(exit) = self.launcher.reap(target) {
                    return StopReason::TargetExited(exit);
                }
            }
        }
    }
}

/// Consume queued events up to the first termination request
fn coalesce(events: &Receiver<Event>) -> Option<StopReason> {
    events.try_iter().find_map(|event| match event {
        Event::Terminate(reason) => Some(reason),
        Event::ChildStateChanged => None,
    })
}
