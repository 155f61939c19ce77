//! Scheduling behaviour of the task queue driven through its public API

mod common;

use common::*;
use conductor_core::constants::{events, metrics};
use conductor_core::models::TaskPriority;
use conductor_core::orchestration::{QueueEffect, TaskOutcome, TaskQueue};
use conductor_core::state_machine::TaskStatus;
use conductor_core::ConductorError;

fn assignments(queue: &mut TaskQueue) -> Vec<(String, String)> {
    queue
        .drain_effects()
        .into_iter()
        .filter_map(|effect| match effect {
            QueueEffect::Assign(assignment) => Some((assignment.worker_id, assignment.task.id)),
            _ => None,
        })
        .collect()
}

fn topics(effects: &[QueueEffect]) -> Vec<&'static str> {
    effects
        .iter()
        .filter_map(|effect| match effect {
            QueueEffect::Event { topic, .. } => Some(*topic),
            _ => None,
        })
        .collect()
}

#[test]
fn test_higher_priority_assigned_first() {
    let mut queue = task_queue();
    queue.submit(prioritized("low", TaskPriority::Low)).unwrap();
    queue.submit(prioritized("critical", TaskPriority::Critical)).unwrap();
    queue.submit(prioritized("medium", TaskPriority::Medium)).unwrap();
    queue.submit(prioritized("high", TaskPriority::High)).unwrap();
    queue.drain_effects();

    let mut order = Vec::new();
    for worker in ["w1", "w2", "w3", "w4"] {
        queue.worker_available(worker, Vec::<String>::new());
        order.extend(assignments(&mut queue).into_iter().map(|(_, task)| task));
    }

    assert_eq!(order, vec!["critical", "high", "medium", "low"]);
}

#[test]
fn test_equal_priority_is_fifo() {
    let mut queue = task_queue();
    for id in ["first", "second", "third"] {
        queue.submit(named(id)).unwrap();
    }

    let mut order = Vec::new();
    for worker in ["w1", "w2", "w3"] {
        queue.worker_available(worker, Vec::<String>::new());
        order.extend(assignments(&mut queue).into_iter().map(|(_, task)| task));
    }

    assert_eq!(order, vec!["first", "second", "third"]);
}

#[test]
fn test_numeric_priority_overrides_tier() {
    let mut queue = task_queue();
    queue
        .submit(prioritized("tier", TaskPriority::Critical))
        .unwrap();
    queue
        .submit(named("numeric").with_numeric_priority(100))
        .unwrap();

    queue.worker_available("w1", Vec::<String>::new());
    assert_eq!(
        assignments(&mut queue),
        vec![("w1".to_string(), "numeric".to_string())]
    );
}

#[test]
fn test_dependent_waits_for_dependency() {
    let mut queue = task_queue();
    queue.submit(named("build")).unwrap();
    queue.submit(named("deploy").depends_on("build")).unwrap();
    assert_eq!(queue.get_task("deploy").unwrap().status, TaskStatus::Validated);

    queue.worker_available("w1", Vec::<String>::new());
    queue.worker_available("w2", Vec::<String>::new());
    assert_eq!(
        assignments(&mut queue),
        vec![("w1".to_string(), "build".to_string())]
    );
    assert_eq!(queue.idle_workers(), vec!["w2".to_string()]);

    let unblocked = queue.complete_task("build", "w1", None).unwrap();
    assert_eq!(unblocked, vec!["deploy".to_string()]);

    let assigned = assignments(&mut queue);
    assert_eq!(assigned, vec![("w2".to_string(), "deploy".to_string())]);
}

#[test]
fn test_unknown_dependency_rejected() {
    let mut queue = task_queue();
    let error = queue
        .submit(named("orphan").depends_on("missing"))
        .unwrap_err();

    assert!(matches!(error, ConductorError::Validation { .. }));
    assert_eq!(error.field(), Some("dependsOn"));
    assert!(queue.get_task("orphan").is_none());
}

#[test]
fn test_duplicate_task_id_rejected() {
    let mut queue = task_queue();
    queue.submit(named("same")).unwrap();
    let error = queue.submit(named("same")).unwrap_err();
    assert_eq!(error.field(), Some("id"));
}

#[test]
fn test_dependency_on_cancelled_task_never_ready() {
    let mut queue = task_queue();
    queue.submit(named("upstream")).unwrap();
    queue.cancel_task("upstream").unwrap();
    queue.submit(named("downstream").depends_on("upstream")).unwrap();

    queue.worker_available("w1", Vec::<String>::new());
    assert!(assignments(&mut queue).is_empty());
    assert_eq!(
        queue.get_task("downstream").unwrap().status,
        TaskStatus::Validated
    );
}

#[test]
fn test_retryable_failure_reassigns_until_retries_exhausted() {
    let mut queue = task_queue();
    queue.submit(named("flaky")).unwrap();
    let handle = queue.watch_completion("flaky").unwrap();

    queue.worker_available("w1", Vec::<String>::new());
    for attempt in 1..=3 {
        assert_eq!(queue.get_task("flaky").unwrap().attempts, attempt);
        queue.fail_task("flaky", "w1", "boom", true).unwrap();
        assert_eq!(queue.get_task("flaky").unwrap().status, TaskStatus::InProgress);
    }

    // Initial attempt plus three retries
    assert_eq!(queue.get_task("flaky").unwrap().attempts, 4);
    let status = queue.fail_task("flaky", "w1", "boom", true).unwrap();
    assert_eq!(status, TaskStatus::Failed);

    let outcome = tokio_test::block_on(handle.outcome()).unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Failed {
            error: "boom".to_string()
        }
    );
}

#[test]
fn test_non_retryable_failure_is_terminal() {
    let mut queue = task_queue();
    queue.submit(named("fatal")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());

    let status = queue.fail_task("fatal", "w1", "bad input", false).unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(queue.idle_workers(), vec!["w1".to_string()]);

    let retried = queue.retry_task("fatal").unwrap();
    assert_eq!(retried, TaskStatus::InProgress);
    assert_eq!(queue.assigned_task("w1").map(String::as_str), Some("fatal"));
}

#[test]
fn test_required_capabilities_gate_assignment() {
    let mut queue = task_queue();
    queue.submit(named("render").requires("gpu")).unwrap();

    queue.worker_available("cpu-only", vec!["shell"]);
    assert!(assignments(&mut queue).is_empty());

    queue.worker_available("gpu-box", vec!["gpu", "shell"]);
    assert_eq!(
        assignments(&mut queue),
        vec![("gpu-box".to_string(), "render".to_string())]
    );
    assert_eq!(queue.idle_workers(), vec!["cpu-only".to_string()]);
}

#[test]
fn test_capability_mismatch_does_not_block_lower_priority_work() {
    let mut queue = task_queue();
    queue
        .submit(prioritized("gpu-job", TaskPriority::Critical).requires("gpu"))
        .unwrap();
    queue.submit(prioritized("plain", TaskPriority::Low)).unwrap();

    queue.worker_available("w1", Vec::<String>::new());
    assert_eq!(
        assignments(&mut queue),
        vec![("w1".to_string(), "plain".to_string())]
    );
    assert_eq!(queue.queued(), 1);
}

#[test]
fn test_cancel_running_task_emits_cancel_effect() {
    let mut queue = task_queue();
    queue.submit(named("long")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());
    queue.drain_effects();

    queue.cancel_task("long").unwrap();
    let effects = queue.drain_effects();

    assert!(effects.iter().any(|effect| matches!(
        effect,
        QueueEffect::Cancel { task_id, worker_id } if task_id == "long" && worker_id == "w1"
    )));
    assert!(topics(&effects).contains(&events::TASK_CANCELLED));
    assert_eq!(queue.get_task("long").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(queue.idle_workers(), vec!["w1".to_string()]);
}

#[test]
fn test_cancel_queued_task_removes_it() {
    let mut queue = task_queue();
    queue.submit(named("queued")).unwrap();
    queue.drain_effects();

    queue.cancel_task("queued").unwrap();
    assert_eq!(queue.queued(), 0);
    assert!(!queue
        .drain_effects()
        .iter()
        .any(|effect| matches!(effect, QueueEffect::Cancel { .. })));

    let error = queue.cancel_task("queued").unwrap_err();
    assert!(matches!(error, ConductorError::IllegalTransition(_)));
}

#[test]
fn test_lost_worker_task_moves_to_idle_worker() {
    let mut queue = task_queue();
    queue.submit(named("job")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());
    queue.worker_available("w2", Vec::<String>::new());
    assert_eq!(
        assignments(&mut queue),
        vec![("w1".to_string(), "job".to_string())]
    );

    assert_eq!(queue.worker_lost("w1"), Some("job".to_string()));
    assert_eq!(
        assignments(&mut queue),
        vec![("w2".to_string(), "job".to_string())]
    );
    assert_eq!(queue.get_task("job").unwrap().attempts, 2);
}

#[test]
fn test_complete_from_wrong_worker_rejected() {
    let mut queue = task_queue();
    queue.submit(named("mine")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());

    let error = queue.complete_task("mine", "w2", None).unwrap_err();
    assert!(matches!(error, ConductorError::Validation { .. }));
    assert_eq!(queue.get_task("mine").unwrap().status, TaskStatus::InProgress);
}

#[test]
fn test_soft_dependency_completion_boosts_priority() {
    let mut queue = task_queue();
    queue.submit(named("warmup")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());
    queue.drain_effects();

    queue
        .submit(prioritized("preferring", TaskPriority::Medium).prefers("warmup"))
        .unwrap();
    queue.submit(prioritized("rival", TaskPriority::Medium)).unwrap();

    // Completing warmup makes w1 idle again; the boosted task wins the tie
    queue.complete_task("warmup", "w1", None).unwrap();
    assert_eq!(
        assignments(&mut queue),
        vec![("w1".to_string(), "preferring".to_string())]
    );
}

#[test]
fn test_metrics_track_lifecycle() {
    let (mut queue, sink) = task_queue_with_metrics();
    queue.submit(named("a")).unwrap();
    queue.submit(named("b")).unwrap();
    queue.worker_available("w1", Vec::<String>::new());
    queue.complete_task("a", "w1", None).unwrap();
    queue.cancel_task("b").unwrap();

    assert_eq!(sink.get(metrics::TASKS_CREATED), 2);
    assert_eq!(sink.get(metrics::TASKS_ASSIGNED), 2);
    assert_eq!(sink.get(metrics::TASKS_COMPLETED), 1);
    assert_eq!(sink.get(metrics::TASKS_CANCELLED), 1);
}

#[test]
fn test_disposed_queue_refuses_work() {
    let mut queue = task_queue();
    queue.dispose();
    queue.dispose();

    assert!(queue.is_disposed());
    assert!(queue.submit(named("late")).is_err());
    assert_eq!(queue.worker_available("w1", Vec::<String>::new()), 0);
}
