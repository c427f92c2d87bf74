//! Termination and child notifications as channel events
//!
//! SIGINT, SIGTERM and SIGCHLD are blocked in every thread and consumed
//! synchronously by one listener thread, so no code ever runs in signal
//! handler context. Blocking must happen before any other thread is started,
//! because new threads inherit the mask of their creator.

use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};

use crate::error::{BenchError, Result};
use crate::orchestrator::{Event, StopReason};

/// Signals routed through the listener
pub fn handled_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGCHLD);
    set
}

/// Block the handled signals in the calling thread
pub fn block() -> Result<SigSet> {
    let set = handled_signals();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None).map_err(BenchError::Signal)?;
    Ok(set)
}

/// Translate a delivered signal into an orchestrator event
pub fn event_for(signal: Signal) -> Option<Event> {
    match signal {
        Signal::SIGINT | Signal::SIGTERM => Some(Event::Terminate(StopReason::Signal(signal))),
        Signal::SIGCHLD => Some(Event::ChildStateChanged),
        _ => None,
    }
}

/// Start the listener thread
///
/// The thread lives until the process exits or the receiving side of
/// `events` is dropped.
pub fn spawn_listener(set: SigSet, events: Sender<Event>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("callbench-signals".to_string())
        .spawn(move || loop {
            let signal = match set.wait() {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!("sigwait failed: {}", e);
                    return;
                }
            };
            tracing::debug!("received {}", signal);
            if let Some(event) = event_for(signal) {
                if events.send(event).is_err() {
                    return;
                }
            }
        })
        .map_err(|source| BenchError::Thread {
            name: "signal listener",
            source,
        })
}
