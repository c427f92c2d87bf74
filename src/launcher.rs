//! Target process creation and attachment
//!
//! A spawned target is forked immediately but parked on a pipe before it
//! executes any target code. Instrumentation is installed against the parked
//! pid, and only then does [`ProcessLauncher::release`] write the wake-up
//! byte. If the parent disappears first the pipe closes, the child sees EOF
//! and exits without ever running the target image.

use std::ffi::{CString, OsStr};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{access, fork, pipe2, AccessFlags, ForkResult, Pid};

use crate::counters::Scope;
use crate::error::{BenchError, Result};

/// Exit code of a parked child whose parent went away before release
const ABANDONED_EXIT: i32 = 126;
/// Exit code when exec of the resolved image fails
const EXEC_FAILED_EXIT: i32 = 127;

/// How a target process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetExit {
    Exited(i32),
    Signaled(Signal),
    /// Gone, but its status was collected elsewhere (e.g. by the tracer)
    Vanished,
}

/// A child created by [`ProcessLauncher::spawn`]
///
/// Dropping it kills and reaps the process unless it has already been reaped,
/// so a spawned target never outlives the benchmark. Once an exit has been
/// observed the pid is never signalled again: the tracer may have collected
/// the zombie already and the pid can belong to someone else by then.
#[derive(Debug)]
pub struct SpawnedChild {
    pid: Pid,
    wake: Option<OwnedFd>,
    exited: bool,
    reaped: bool,
}

impl SpawnedChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_released(&self) -> bool {
        self.wake.is_none()
    }

    /// Whether an exit of this child has been observed
    pub fn has_exited(&self) -> bool {
        self.exited || self.reaped
    }
}

impl Drop for SpawnedChild {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if self.exited {
            // Collect the zombie if the tracer has not; never block or kill
            let _ = waitpid(self.pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG));
            self.reaped = true;
            return;
        }
        if !self.is_released() {
            tracing::debug!("killing unreleased child {}", self.pid);
        }
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("failed to kill target {}: {}", self.pid, e),
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                // Already collected by the tracer
                Err(_) => break,
            }
        }
        self.reaped = true;
    }
}

/// What is being measured
#[derive(Debug)]
pub enum TargetHandle {
    System,
    Attached(Pid),
    Spawned(SpawnedChild),
}

impl TargetHandle {
    pub fn pid(&self) -> Option<Pid> {
        match self {
            TargetHandle::System => None,
            TargetHandle::Attached(pid) => Some(*pid),
            TargetHandle::Spawned(child) => Some(child.pid),
        }
    }

    /// Instrumentation scope for this target
    pub fn scope(&self, follow_children: bool) -> Scope {
        match self {
            TargetHandle::System => Scope::System,
            TargetHandle::Attached(pid) => Scope::Process {
                pid: *pid,
                follow_children,
                spawned: false,
            },
            TargetHandle::Spawned(child) => Scope::Process {
                pid: child.pid,
                follow_children,
                spawned: true,
            },
        }
    }
}

/// Creates, binds and reaps target processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    /// Fork a parked child that will exec `program` once released
    pub fn spawn(&self, program: &str, args: &[String]) -> Result<TargetHandle> {
        let path = resolve_program(program, std::env::var_os("PATH").as_deref())?;
        let exec = ExecImage::new(&path, program, args)?;

        let (wait_end, wake_end) = pipe2(OFlag::O_CLOEXEC).map_err(BenchError::Fork)?;

        // SAFETY: the child only calls async-signal-safe functions (close,
        // sigprocmask, read, execv, _exit) on data prepared before the fork.
        match unsafe { fork() }.map_err(BenchError::Fork)? {
            ForkResult::Parent { child } => {
                drop(wait_end);
                tracing::debug!("spawned parked child {} for {}", child, path.display());
                Ok(TargetHandle::Spawned(SpawnedChild {
                    pid: child,
                    wake: Some(wake_end),
                    exited: false,
                    reaped: false,
                }))
            }
            ForkResult::Child => {
                drop(wake_end);
                let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
                let mut byte = [0u8; 1];
                let released = loop {
                    match nix::unistd::read(wait_end.as_fd(), &mut byte) {
                        Ok(1) => break true,
                        Err(Errno::EINTR) => continue,
                        _ => break false,
                    }
                };
                if !released {
                    // SAFETY: terminating the forked child without running atexit handlers
                    unsafe { libc::_exit(ABANDONED_EXIT) };
                }
                exec.exec();
                // SAFETY: as above
                unsafe { libc::_exit(EXEC_FAILED_EXIT) }
            }
        }
    }

    /// Bind to an already running process
    ///
    /// Activity before instrumentation is installed is not measured.
    pub fn attach(&self, pid: Pid) -> Result<TargetHandle> {
        if pid.as_raw() <= 0 {
            return Err(BenchError::Resolution {
                target: pid.to_string(),
                reason: "not a valid process id".to_string(),
            });
        }
        match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) if !is_gone(pid) => Ok(TargetHandle::Attached(pid)),
            _ => Err(BenchError::Resolution {
                target: pid.to_string(),
                reason: "no such process".to_string(),
            }),
        }
    }

    /// Let a spawned target proceed into its image
    ///
    /// Must only be called once instrumentation is live; no-op otherwise.
    pub fn release(&self, handle: &mut TargetHandle) -> Result<()> {
        if let TargetHandle::Spawned(child) = handle {
            if let Some(wake) = child.wake.take() {
                nix::unistd::write(&wake, &[1u8]).map_err(BenchError::Fork)?;
                tracing::debug!("released child {}", child.pid);
            }
        }
        Ok(())
    }

    /// Non-blocking exit check
    ///
    /// The exit status of a spawned child is peeked, not consumed, so a tracer
    /// waiting on the same process is never starved of it.
    pub fn reap(&self, handle: &mut TargetHandle) -> Option<TargetExit> {
        match handle {
            TargetHandle::System => None,
            TargetHandle::Attached(pid) => is_gone(*pid).then_some(TargetExit::Vanished),
            TargetHandle::Spawned(child) => {
                if child.reaped {
                    return Some(TargetExit::Vanished);
                }
                let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
                match waitid(Id::Pid(child.pid), flags) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        child.exited = true;
                        Some(TargetExit::Exited(code))
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        child.exited = true;
                        Some(TargetExit::Signaled(sig))
                    }
                    Ok(_) => None,
                    Err(Errno::EINTR) => None,
                    Err(_) => {
                        child.reaped = true;
                        Some(TargetExit::Vanished)
                    }
                }
            }
        }
    }
}

/// Locate `program` the way execvp would
pub fn resolve_program(program: &str, path_var: Option<&OsStr>) -> Result<PathBuf> {
    let not_found = |reason: &str| BenchError::Resolution {
        target: program.to_string(),
        reason: reason.to_string(),
    };
    if program.is_empty() {
        return Err(not_found("empty program name"));
    }

    if program.contains('/') {
        let path = PathBuf::from(program);
        return if is_executable(&path) {
            Ok(path)
        } else {
            Err(not_found("not an executable file"))
        };
    }

    let path_var = path_var.unwrap_or_else(|| OsStr::new("/usr/local/bin:/usr/bin:/bin"));
    std::env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| not_found("command not found in PATH"))
}

fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Whether `pid` no longer runs (missing, or a zombie awaiting its parent)
fn is_gone(pid: Pid) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X'),
        Err(_) => true,
    }
}

/// Everything `execv` needs, built before fork so the child does not allocate
struct ExecImage {
    path: CString,
    _args: Vec<CString>,
    argv: Vec<*const libc::c_char>,
}

impl ExecImage {
    fn new(path: &Path, program: &str, args: &[String]) -> Result<Self> {
        let nul = |what: &str| BenchError::Resolution {
            target: program.to_string(),
            reason: format!("{} contains a NUL byte", what),
        };
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| nul("path"))?;
        let args = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(|arg| CString::new(arg).map_err(|_| nul("argument")))
            .collect::<Result<Vec<_>>>()?;
        let argv = args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Ok(Self {
            path,
            _args: args,
            argv,
        })
    }

    /// Replace the current image; returns only on failure
    fn exec(&self) {
        // SAFETY: `argv` is a NULL-terminated array of pointers into `_args`,
        // which outlives this call.
        unsafe {
            libc::execv(self.path.as_ptr(), self.argv.as_ptr());
        }
    }
}
