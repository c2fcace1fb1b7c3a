//! Property tests for limit clamping and filter pass-through in the executor.

use proptest::prelude::*;
use serde_json::json;
use tabula_data::{
    Column, DEFAULT_LIMIT, Dataset, Filter, FilterOp, MAX_LIMIT, QuerySpec, Value, clamp_limit,
    execute,
};

fn numbers(values: &[i64]) -> Dataset {
    let cells = values.iter().map(|v| Value::Int(*v)).collect();
    Dataset::new(vec![Column::new("n", cells)]).unwrap()
}

proptest! {
    #[test]
    fn limit_bounds_row_count(values in prop::collection::vec(-1000i64..1000, 0..60), limit in 1usize..80) {
        let spec = QuerySpec { limit, ..Default::default() };
        let out = execute(&numbers(&values), &spec, &[]);
        prop_assert_eq!(out.table.row_count(), values.len().min(limit));
        prop_assert!(out.warnings.is_empty());
    }

    #[test]
    fn filter_on_missing_column_keeps_rows(values in prop::collection::vec(-1000i64..1000, 0..60), needle in "[a-z]{1,8}") {
        let spec = QuerySpec {
            filters: vec![Filter::new("nonexistent", FilterOp::Eq, json!(needle))],
            limit: MAX_LIMIT,
            ..Default::default()
        };
        let out = execute(&numbers(&values), &spec, &[]);
        prop_assert_eq!(out.table.row_count(), values.len());
    }

    #[test]
    fn clamp_limit_stays_in_range(raw in any::<i64>()) {
        let limit = clamp_limit(Some(&json!(raw)));
        prop_assert!((1..=MAX_LIMIT).contains(&limit));
    }

    #[test]
    fn gt_filter_keeps_only_larger(values in prop::collection::vec(-100i64..100, 0..40), pivot in -100i64..100) {
        let spec = QuerySpec {
            filters: vec![Filter::new("n", FilterOp::Gt, json!(pivot))],
            limit: MAX_LIMIT,
            ..Default::default()
        };
        let out = execute(&numbers(&values), &spec, &[]);
        let expected = values.iter().filter(|v| **v > pivot).count();
        prop_assert_eq!(out.table.row_count(), expected);
    }
}

#[test]
fn test_limit_clamping_edges() {
    assert_eq!(clamp_limit(Some(&json!(10_000))), MAX_LIMIT);
    assert_eq!(clamp_limit(Some(&json!(0))), 100);
    assert_eq!(clamp_limit(Some(&json!("abc"))), 100);
    assert_eq!(clamp_limit(Some(&json!("25"))), 25);
    assert_eq!(clamp_limit(None), 100);
}

#[test]
fn test_limit_clamping_through_execute() {
    let values: Vec<i64> = (0..650).collect();
    let ds = numbers(&values);
    let rows = |limit: serde_json::Value| {
        execute(&ds, &QuerySpec::from_json(&json!({ "limit": limit })), &[])
            .table
            .row_count()
    };
    assert_eq!(rows(json!(10_000)), MAX_LIMIT);
    assert_eq!(rows(json!(10_000)), 500);
    assert_eq!(rows(json!(0)), DEFAULT_LIMIT);
    assert_eq!(rows(json!(-3)), DEFAULT_LIMIT);
    assert_eq!(rows(json!("abc")), DEFAULT_LIMIT);
    assert_eq!(rows(json!("600")), 500);
    assert_eq!(rows(json!(250)), 250);
    assert_eq!(DEFAULT_LIMIT, 100);
}
