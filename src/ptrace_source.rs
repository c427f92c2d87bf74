//! User-space counter source built on ptrace
//!
//! Every traced task is one counter slot. A dedicated tracer thread seizes
//! the target (ptrace requests must come from the thread that attached),
//! times each call from its entry stop to its exit stop and records the
//! elapsed nanoseconds into shared counters that `snapshot` reads.
//!
//! x86_64 only: the call number is read from `orig_rax` and entry stops are
//! recognized by the kernel's `-ENOSYS` placeholder in `rax`.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::counters::{CallId, CounterSource, RawSnapshot, Scope, SharedCounters};
use crate::error::{BenchError, Result};
use crate::syscalls::RESTART_SYSCALL;

/// Upper bound on waiting for the tracer to report that tracing is live
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts calls of a process (and optionally its descendants) with ptrace
#[derive(Debug, Clone)]
pub struct PtraceCounterSource {
    counters: SharedCounters,
    handshake_timeout: Duration,
}

impl Default for PtraceCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PtraceCounterSource {
    pub fn new() -> Self {
        Self {
            counters: SharedCounters::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl CounterSource for PtraceCounterSource {
    fn install(&self, scope: &Scope) -> Result<()> {
        let (pid, follow_children, spawned) = match *scope {
            Scope::System => {
                return Err(BenchError::Attach(
                    "system-wide measurement needs kernel instrumentation; pass --pid or a command"
                        .to_string(),
                ))
            }
            Scope::Process {
                pid,
                follow_children,
                spawned,
            } => (pid, follow_children, spawned),
        };

        let (ready_tx, ready_rx) = bounded(1);
        let counters = self.counters.clone();
        thread::Builder::new()
            .name("callbench-tracer".to_string())
            .spawn(move || trace(pid, follow_children, spawned, counters, ready_tx))
            .map_err(|source| BenchError::Thread {
                name: "tracer",
                source,
            })?;

        match ready_rx.recv_timeout(self.handshake_timeout) {
            Ok(Ok(tasks)) => {
                tracing::info!("tracing {} task(s) of process {}", tasks, pid);
                Ok(())
            }
            Ok(Err(reason)) => Err(BenchError::Attach(reason)),
            Err(RecvTimeoutError::Timeout) => Err(BenchError::Attach(format!(
                "tracer did not report ready within {:?}",
                self.handshake_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BenchError::Attach("tracer exited during setup".to_string()))
            }
        }
    }

    fn snapshot(&self) -> RawSnapshot {
        self.counters.snapshot()
    }
}

/// Tracer thread body
fn trace(
    pid: Pid,
    follow_children: bool,
    spawned: bool,
    counters: SharedCounters,
    ready: Sender<std::result::Result<usize, String>>,
) {
    let tasks = match seize(pid, follow_children, spawned) {
        Ok(tasks) => tasks,
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };
    let _ = ready.send(Ok(tasks.len()));

    // A spawned child is still parked in our launcher; its calls only count
    // once it has exec'd the target image.
    let mut tracer = Tracer {
        counters,
        tasks: tasks.into_iter().collect(),
        pending: HashMap::new(),
        counting: !spawned,
    };
    if let Err(e) = tracer.run() {
        tracing::warn!("tracer for process {} stopped: {}", pid, e);
    }
}

fn seize(
    pid: Pid,
    follow_children: bool,
    spawned: bool,
) -> std::result::Result<Vec<Pid>, String> {
    let mut options = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXEC;
    if spawned {
        options |= Options::PTRACE_O_EXITKILL;
    }
    if follow_children {
        options |= Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACECLONE;
    }

    let tids = if spawned { vec![pid] } else { task_ids(pid)? };
    let mut seized = Vec::with_capacity(tids.len());
    for tid in tids {
        match ptrace::seize(tid, options).and_then(|()| ptrace::interrupt(tid)) {
            Ok(()) => seized.push(tid),
            // Thread exited between listing and seizing
            Err(Errno::ESRCH) if !seized.is_empty() => {}
            Err(Errno::EPERM) => {
                return Err(format!(
                    "not permitted to trace process {} (run as root or check kernel.yama.ptrace_scope)",
                    tid
                ))
            }
            Err(e) => return Err(format!("cannot trace task {}: {}", tid, e)),
        }
    }
    Ok(seized)
}

/// All threads of `pid`
fn task_ids(pid: Pid) -> std::result::Result<Vec<Pid>, String> {
    let entries = std::fs::read_dir(format!("/proc/{}/task", pid))
        .map_err(|e| format!("cannot list threads of process {}: {}", pid, e))?;
    let mut tids: Vec<Pid> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .map(Pid::from_raw)
        .collect();
    tids.sort_by_key(|tid| tid.as_raw());
    // Leader first so a permission problem is reported against the pid given
    if let Some(pos) = tids.iter().position(|tid| *tid == pid) {
        tids.swap(0, pos);
    }
    Ok(tids)
}

/// A call whose entry stop has been seen
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    nr: u64,
    entered: Instant,
}

/// Meaning of a syscall stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyscallStop {
    Entry,
    /// Exit of the call recorded as pending
    Exit,
    /// Exit whose entry happened before we were tracing
    Orphan,
}

fn classify(pending: Option<u64>, nr: u64, rax: u64) -> SyscallStop {
    match pending {
        Some(entered) if entered == nr => SyscallStop::Exit,
        _ if rax as i64 == -(libc::ENOSYS as i64) => SyscallStop::Entry,
        _ => SyscallStop::Orphan,
    }
}

struct Tracer {
    counters: SharedCounters,
    tasks: HashSet<Pid>,
    pending: HashMap<Pid, PendingCall>,
    counting: bool,
}

impl Tracer {
    fn run(&mut self) -> nix::Result<()> {
        while !self.tasks.is_empty() {
            let status = match waitpid(None::<Pid>, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e),
            };

            match status {
                WaitStatus::PtraceSyscall(tid) => {
                    self.tasks.insert(tid);
                    if let Err(e) = self.on_syscall_stop(tid) {
                        tracing::trace!("lost syscall stop of {}: {}", tid, e);
                    }
                    resume(tid, None);
                }
                WaitStatus::PtraceEvent(tid, signal, event) => {
                    self.tasks.insert(tid);
                    if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 && !self.counting {
                        tracing::debug!("process {} started its image", tid);
                        self.counting = true;
                    }
                    if is_group_stop(event, signal) {
                        // Stay stopped until SIGCONT, still reporting events
                        listen(tid);
                    } else {
                        resume(tid, None);
                    }
                }
                WaitStatus::Stopped(tid, signal) => {
                    self.tasks.insert(tid);
                    resume(tid, Some(signal));
                }
                WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                    self.on_exit(tid);
                }
                _ => {}
            }
        }
        tracing::debug!("no traced tasks left");
        Ok(())
    }

    /// Forget an exited task; its counts move to the retired slot
    fn on_exit(&mut self, tid: Pid) {
        self.tasks.remove(&tid);
        self.pending.remove(&tid);
        self.counters.retire(tid.as_raw() as usize);
    }

    fn on_syscall_stop(&mut self, tid: Pid) -> nix::Result<()> {
        let regs = ptrace::getregs(tid)?;
        let nr = regs.orig_rax;
        let pending = self.pending.remove(&tid);

        match classify(pending.map(|call| call.nr), nr, regs.rax) {
            SyscallStop::Entry => {
                self.pending.insert(
                    tid,
                    PendingCall {
                        nr,
                        entered: Instant::now(),
                    },
                );
            }
            SyscallStop::Exit => {
                if let Some(call) = pending {
                    self.finish(tid, call);
                }
            }
            SyscallStop::Orphan => {}
        }
        Ok(())
    }

    fn finish(&self, tid: Pid, call: PendingCall) {
        if !self.counting || call.nr == u64::from(RESTART_SYSCALL) {
            return;
        }
        let Ok(id) = u32::try_from(call.nr) else {
            return;
        };
        let elapsed = u64::try_from(call.entered.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.counters
            .record(tid.as_raw() as usize, CallId(id), elapsed);
    }
}

/// Whether a seized task stopped because its thread group was stopped
///
/// Stops caused by PTRACE_INTERRUPT and by auto-attach report SIGTRAP instead.
fn is_group_stop(event: i32, signal: Signal) -> bool {
    event == libc::PTRACE_EVENT_STOP
        && matches!(
            signal,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        )
}

fn listen(tid: Pid) {
    // SAFETY: PTRACE_LISTEN takes no address or data argument
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    match Errno::result(ret) {
        Ok(_) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!("failed to listen on {}: {}", tid, e),
    }
}

fn resume(tid: Pid, signal: Option<Signal>) {
    match ptrace::syscall(tid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!("failed to resume {}: {}", tid, e),
    }
}
