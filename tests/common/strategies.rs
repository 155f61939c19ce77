//! Proptest strategies for scheduler inputs

use proptest::prelude::*;

use conductor_core::state_machine::TaskStatus;

/// Task ids unique within a generated batch
pub fn task_ids(max: usize) -> impl Strategy<Value = Vec<String>> {
    (1..=max).prop_map(|count| (0..count).map(|i| format!("task-{i}")).collect())
}

/// `(priority, created_at ms)` pairs; small ranges force ties
pub fn priority_entries(max: usize) -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..5, 0i64..20), 1..=max)
}

pub fn queueable_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![Just(TaskStatus::Ready), Just(TaskStatus::Validated)]
}

/// Random directed edges between `nodes` task indices, self-loops included
pub fn edge_list(nodes: usize, max_edges: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..nodes, 0..nodes), 0..=max_edges)
}
