//! Counter source interface
//!
//! A counter source exposes, per call identifier, one `CounterSample` per
//! isolated slot (a CPU for kernel instrumentation, a traced task for the
//! ptrace source). The core never interprets slots: it only sums them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use nix::unistd::Pid;

use crate::error::{BenchError, Result};

/// Numeric key for a kind of kernel call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(pub u32);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counter state of one slot for one call identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub count: u64,
    pub overhead_ns: u64,
}

impl CounterSample {
    pub fn new(count: u64, overhead_ns: u64) -> Self {
        Self { count, overhead_ns }
    }
}

/// Point-in-time read of a counter source, ordered by call identifier
pub type RawSnapshot = BTreeMap<CallId, Vec<CounterSample>>;

/// What the instrumentation is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every process on the machine
    System,
    /// One process, optionally with its descendants
    Process {
        pid: Pid,
        follow_children: bool,
        /// The process was created by us and is still held suspended
        spawned: bool,
    },
}

/// Instrumentation that counts calls and their elapsed time
///
/// `snapshot` is read-only: repeated reads observe monotonically growing
/// totals, counters are never reset by reading.
pub trait CounterSource: Send + Sync {
    /// Install instrumentation for `scope`, returning once counting is live
    fn install(&self, scope: &Scope) -> Result<()>;

    /// Read the current per-slot counters
    fn snapshot(&self) -> RawSnapshot;
}

type SlotMap = BTreeMap<CallId, BTreeMap<usize, CounterSample>>;

/// Slot holding the folded counters of every retired slot
pub const RETIRED_SLOT: usize = usize::MAX;

/// In-memory counter source fed by the embedder
///
/// Cloning shares the underlying counters, so one handle can be given to the
/// orchestrator while another keeps recording.
#[derive(Debug, Clone, Default)]
pub struct SharedCounters {
    slots: Arc<Mutex<SlotMap>>,
    scope: Arc<Mutex<Option<Scope>>>,
    install_error: Arc<Mutex<Option<String>>>,
}

impl SharedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call of `id` on `slot` that took `overhead_ns`
    pub fn record(&self, slot: usize, id: CallId, overhead_ns: u64) {
        self.add(slot, id, CounterSample::new(1, overhead_ns));
    }

    /// Accumulate `sample` into the counters of `slot`
    pub fn add(&self, slot: usize, id: CallId, sample: CounterSample) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = slots.entry(id).or_default().entry(slot).or_default();
        entry.count = entry.count.saturating_add(sample.count);
        entry.overhead_ns = entry.overhead_ns.saturating_add(sample.overhead_ns);
    }

    /// Overwrite the counters of `slot` (registers an identifier with zero calls)
    pub fn set(&self, slot: usize, id: CallId, sample: CounterSample) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(id).or_default().insert(slot, sample);
    }

    /// Fold the counters of `slot` into [`RETIRED_SLOT`]
    ///
    /// Totals are unchanged; a source whose slots come and go (tasks of a
    /// forking workload) keeps a bounded slot count this way.
    pub fn retire(&self, slot: usize) {
        if slot == RETIRED_SLOT {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for per_slot in slots.values_mut() {
            if let Some(sample) = per_slot.remove(&slot) {
                let retired = per_slot.entry(RETIRED_SLOT).or_default();
                retired.count = retired.count.saturating_add(sample.count);
                retired.overhead_ns = retired.overhead_ns.saturating_add(sample.overhead_ns);
            }
        }
    }

    /// Make the next `install` fail with `reason`
    pub fn fail_install(&self, reason: impl Into<String>) {
        *self
            .install_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Scope passed to the last successful `install`
    pub fn installed_scope(&self) -> Option<Scope> {
        *self.scope.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CounterSource for SharedCounters {
    fn install(&self, scope: &Scope) -> Result<()> {
        if let Some(reason) = self
            .install_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(BenchError::Attach(reason));
        }
        *self.scope.lock().unwrap_or_else(PoisonError::into_inner) = Some(*scope);
        Ok(())
    }

    fn snapshot(&self) -> RawSnapshot {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .map(|(id, per_slot)| (*id, per_slot.values().copied().collect()))
            .collect()
    }
}
