//! Reduction of per-slot counters into ranked result records
//!
//! Each slot of a counter source keeps isolated counters, so samples for one
//! call identifier are always summed, never overwritten. The reduction is
//! pure: it holds no state between calls and performs no I/O.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SortKey;
use crate::counters::{CallId, CounterSample, RawSnapshot};
use crate::syscalls::NameResolver;

/// Summed counters per call identifier, in ascending identifier order
pub type Totals = BTreeMap<CallId, CounterSample>;

/// One row of a snapshot table
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub id: CallId,
    pub name: String,
    pub count: u64,
    pub overhead_us: f64,
    pub avg_overhead_us: Option<f64>,
}

impl ResultRecord {
    /// Average overhead per call; `count` is never zero for an emitted record
    pub fn average_us(&self) -> f64 {
        self.avg_overhead_us
            .unwrap_or(self.overhead_us / self.count as f64)
    }
}

/// Sum every slot of every call identifier
pub fn totals(raw: &RawSnapshot) -> Totals {
    raw.iter()
        .map(|(id, samples)| {
            let sum = samples
                .iter()
                .fold(CounterSample::default(), |acc, sample| CounterSample {
                    count: acc.count.saturating_add(sample.count),
                    overhead_ns: acc.overhead_ns.saturating_add(sample.overhead_ns),
                });
            (*id, sum)
        })
        .collect()
}

/// Activity in `current` that happened after `baseline` was taken
pub fn delta(current: &Totals, baseline: &Totals) -> Totals {
    current
        .iter()
        .map(|(id, now)| {
            let before = baseline.get(id).copied().unwrap_or_default();
            (
                *id,
                CounterSample {
                    count: now.count.saturating_sub(before.count),
                    overhead_ns: now.overhead_ns.saturating_sub(before.overhead_ns),
                },
            )
        })
        .collect()
}

/// Sort records in place; numeric keys descend, names ascend, ties keep order
pub fn sort_records(records: &mut [ResultRecord], key: SortKey) {
    let compare: fn(&ResultRecord, &ResultRecord) -> Ordering = match key {
        SortKey::Name => |a, b| a.name.cmp(&b.name),
        SortKey::Id => |a, b| b.id.cmp(&a.id),
        SortKey::Count => |a, b| b.count.cmp(&a.count),
        SortKey::Overhead => |a, b| b.overhead_us.total_cmp(&a.overhead_us),
        SortKey::AvgOverhead => |a, b| b.average_us().total_cmp(&a.average_us()),
    };
    // slice::sort_by is stable
    records.sort_by(compare);
}

/// Turns counter source reads into sorted, named records
#[derive(Clone)]
pub struct ResultAggregator {
    resolver: Arc<dyn NameResolver>,
    show_average: bool,
    sort: SortKey,
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("show_average", &self.show_average)
            .field("sort", &self.sort)
            .finish_non_exhaustive()
    }
}

impl ResultAggregator {
    pub fn new(resolver: Arc<dyn NameResolver>, show_average: bool, sort: SortKey) -> Self {
        Self {
            resolver,
            show_average,
            sort,
        }
    }

    /// Convert totals into records, dropping identifiers with no calls
    pub fn records(&self, totals: &Totals) -> Vec<ResultRecord> {
        totals
            .iter()
            .filter(|(_, sum)| sum.count > 0)
            .map(|(id, sum)| {
                let overhead_us = sum.overhead_ns as f64 / 1e3;
                ResultRecord {
                    id: *id,
                    name: self.resolver.name(*id),
                    count: sum.count,
                    overhead_us,
                    avg_overhead_us: self
                        .show_average
                        .then(|| overhead_us / sum.count as f64),
                }
            })
            .collect()
    }

    /// Reduce a raw read into sorted records
    pub fn reduce(&self, raw: &RawSnapshot) -> Vec<ResultRecord> {
        self.finish(self.records(&totals(raw)))
    }

    /// Reduce only the activity since `baseline`
    pub fn reduce_since(&self, raw: &RawSnapshot, baseline: &Totals) -> Vec<ResultRecord> {
        self.finish(self.records(&delta(&totals(raw), baseline)))
    }

    fn finish(&self, mut records: Vec<ResultRecord>) -> Vec<ResultRecord> {
        sort_records(&mut records, self.sort);
        records
    }
}
