use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use conductor_core::config::SchedulerConfig;
use conductor_core::messaging::parse_message;
use conductor_core::metrics::Metrics;
use conductor_core::models::{NewTask, Task};
use conductor_core::orchestration::{PriorityTaskQueue, TaskQueue};
use conductor_core::state_machine::TaskStatus;

fn ready_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| {
            let mut task = Task::new(format!("task-{i}"), "bench");
            task.numeric_priority = Some((i % 7) as i64);
            task.status = TaskStatus::Ready;
            task
        })
        .collect()
}

fn benchmark_heap_enqueue_dequeue(c: &mut Criterion) {
    let tasks = ready_tasks(1_000);
    c.bench_function("heap_enqueue_dequeue_1000", |b| {
        b.iter(|| {
            let mut queue = PriorityTaskQueue::new();
            for task in &tasks {
                queue.enqueue(task);
            }
            while let Some(task_id) = queue.dequeue_ready() {
                black_box(task_id);
            }
        })
    });
}

fn benchmark_submit_and_dispatch(c: &mut Criterion) {
    c.bench_function("submit_and_dispatch_500", |b| {
        b.iter_batched(
            || TaskQueue::new(SchedulerConfig::default(), Metrics::noop()),
            |mut queue| {
                for i in 0..500 {
                    let _ = queue.submit(NewTask::new("bench").with_id(format!("task-{i}")));
                }
                for i in 0..500 {
                    queue.worker_available(&format!("worker-{i}"), Vec::<String>::new());
                }
                black_box(queue.drain_effects().len())
            },
            BatchSize::SmallInput,
        )
    });
}

fn benchmark_message_validation(c: &mut Criterion) {
    let frame = r#"{"id":"m-1","type":"TASK_PROGRESS","from":"agent-1","to":"conductor","timestamp":1700000000000,"payload":{"taskId":"task-1","progress":42.5}}"#;
    c.bench_function("parse_task_progress", |b| {
        b.iter(|| parse_message(black_box(frame)))
    });
}

criterion_group!(
    benches,
    benchmark_heap_enqueue_dequeue,
    benchmark_submit_and_dispatch,
    benchmark_message_validation
);
criterion_main!(benches);
