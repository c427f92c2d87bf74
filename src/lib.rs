//! Callbench - kernel call benchmarking with periodic snapshots
//!
//! This library provides the orchestration core: launching or attaching to a
//! target, driving checkpoints from a timer thread, reducing per-slot counters
//! into ranked records, and writing snapshots with privileges lowered.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod counters;
pub mod error;
pub mod launcher;
pub mod orchestrator;
pub mod privilege;
pub mod ptrace_source;
pub mod report;
pub mod scheduler;
pub mod signals;
pub mod syscalls;

pub use counters::{CallId, CounterSample, CounterSource, RawSnapshot, Scope, SharedCounters};
pub use error::{BenchError, ConfigError};
pub use orchestrator::{Orchestrator, RunOutcome, StopReason};
