//! Property-based tests for reduction, ordering, scheduling and time parsing

use std::sync::Arc;
use std::time::{Duration, Instant};

use callbench::aggregate::{sort_records, ResultAggregator};
use callbench::config::{parse_duration, SortKey};
use callbench::counters::{CallId, CounterSample, RawSnapshot};
use callbench::scheduler::Scheduler;
use callbench::syscalls::SyscallTable;
use proptest::prelude::*;

fn raw_snapshot() -> impl Strategy<Value = RawSnapshot> {
    prop::collection::btree_map(
        (0u32..500).prop_map(CallId),
        prop::collection::vec(
            (0u64..1_000, 0u64..10_000_000).prop_map(|(c, ns)| CounterSample::new(c, ns)),
            1..8,
        ),
        0..40,
    )
}

fn sort_key() -> impl Strategy<Value = SortKey> {
    prop_oneof![
        Just(SortKey::Name),
        Just(SortKey::Id),
        Just(SortKey::Count),
        Just(SortKey::Overhead),
        Just(SortKey::AvgOverhead),
    ]
}

proptest! {
    #[test]
    fn prop_reduce_is_idempotent(raw in raw_snapshot(), key in sort_key()) {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), true, key);
        prop_assert_eq!(agg.reduce(&raw), agg.reduce(&raw));
    }

    #[test]
    fn prop_no_zero_count_records(raw in raw_snapshot(), key in sort_key()) {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), true, key);
        for record in agg.reduce(&raw) {
            prop_assert!(record.count > 0);
            prop_assert!(record.avg_overhead_us.is_some_and(f64::is_finite));
        }
    }

    #[test]
    fn prop_counts_are_summed(raw in raw_snapshot()) {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), false, SortKey::Id);
        let records = agg.reduce(&raw);
        for record in &records {
            let expected: u64 = raw[&record.id].iter().map(|s| s.count).sum();
            prop_assert_eq!(record.count, expected);
        }
        let nonzero = raw
            .values()
            .filter(|samples| samples.iter().any(|s| s.count > 0))
            .count();
        prop_assert_eq!(records.len(), nonzero);
    }

    #[test]
    fn prop_count_sort_is_stable_and_descending(raw in raw_snapshot()) {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), true, SortKey::Count);
        let records = agg.reduce(&raw);
        for pair in records.windows(2) {
            prop_assert!(pair[0].count >= pair[1].count);
            if pair[0].count == pair[1].count {
                // Reduction order is ascending identifier
                prop_assert!(pair[0].id < pair[1].id);
            }
        }
    }

    #[test]
    fn prop_resorting_is_noop(raw in raw_snapshot(), key in sort_key()) {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), true, key);
        let records = agg.reduce(&raw);
        let mut again = records.clone();
        sort_records(&mut again, key);
        prop_assert_eq!(records, again);
    }

    #[test]
    fn prop_periodic_checkpoints_before_drain(interval in 1u64..=10, extra in 0u64..=50) {
        let duration = interval + extra;
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(
            t0,
            Duration::from_secs(interval),
            Some(Duration::from_secs(duration)),
        );

        let mut periodic = 0;
        for second in 1..=duration + 5 {
            let due = scheduler.tick(t0 + Duration::from_secs(second));
            if due.checkpoint {
                periodic += 1;
            }
            if due.terminate {
                prop_assert_eq!(second, duration);
                break;
            }
        }
        prop_assert_eq!(periodic, duration / interval);
    }

    #[test]
    fn prop_duration_parts_add_up(h in 0u64..48, m in 0u64..120, s in 0u64..120) {
        let spec = format!("{}h{}m{}s", h, m, s);
        let parsed = parse_duration(&spec).unwrap();
        prop_assert_eq!(parsed, Duration::from_secs(h * 3600 + m * 60 + s));
    }

    #[test]
    fn prop_duration_parser_never_panics(spec in "\\PC{0,16}") {
        let _ = parse_duration(&spec);
    }
}
