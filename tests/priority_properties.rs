// tests/priority_properties.rs

use proptest::prelude::*;
use serde_json::json;

use workforce::task::factory::{priority_for, MAX_NICENESS, MIN_NICENESS};
use workforce::task::{QueueEntry, Task, TaskFactory};
use workforce_test_utils::TaskBuilder;

fn new_task(factory: &mut TaskFactory, niceness: i64, series: &str) -> Task {
    factory
        .new_task("f", json!([]), json!({}), niceness, Some(series.to_string()), None)
        .unwrap()
}

proptest! {
    #[test]
    fn higher_niceness_never_sorts_earlier(
        serial in 1u64..10_000,
        a in MIN_NICENESS..=MAX_NICENESS,
        b in MIN_NICENESS..=MAX_NICENESS,
    ) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(priority_for(serial, low) <= priority_for(serial, high));
        prop_assert!(priority_for(serial, high) >= serial as f64);
    }

    #[test]
    fn equal_niceness_is_strict_fifo_within_a_series(
        niceness in MIN_NICENESS..=MAX_NICENESS,
        count in 2usize..50,
    ) {
        let mut factory = TaskFactory::new();
        let priorities: Vec<f64> = (0..count)
            .map(|_| new_task(&mut factory, niceness, "s").priority())
            .collect();
        prop_assert!(priorities.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn new_series_starts_above_every_issued_serial(
        submissions in proptest::collection::vec((0usize..4, MIN_NICENESS..=MAX_NICENESS), 1..60),
    ) {
        let names = ["a", "b", "c", "d"];
        let mut factory = TaskFactory::new();
        for (series, niceness) in &submissions {
            new_task(&mut factory, *niceness, names[*series]);
        }

        let highest = names
            .iter()
            .filter_map(|name| factory.last_serial(&Some(name.to_string())))
            .max()
            .unwrap_or(0);
        let fresh = factory.serial(&Some("fresh".to_string()));
        prop_assert!(fresh > highest);
    }

    #[test]
    fn out_of_range_niceness_is_rejected(
        niceness in prop_oneof![i64::MIN..MIN_NICENESS, (MAX_NICENESS + 1)..i64::MAX],
    ) {
        let mut factory = TaskFactory::new();
        let result = factory.new_task("f", json!([]), json!({}), niceness, None, None);
        prop_assert!(result.is_err());
        prop_assert_eq!(factory.last_serial(&None), None);
    }

    #[test]
    fn shutdown_marker_is_dominated_by_every_task(priority in proptest::num::f64::ANY) {
        let task = QueueEntry::Task(TaskBuilder::new("t").priority(priority).build());
        prop_assert!(task < QueueEntry::Shutdown);
        prop_assert!(!(QueueEntry::Shutdown < task));
        prop_assert!(QueueEntry::Shutdown != task);
    }
}
