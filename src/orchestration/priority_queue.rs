//! # Priority Task Queue
//!
//! Dual max-heap scheduler. Tasks in `ready` status live in the ready heap,
//! tasks in `validated` status (waiting on hard dependencies) live in the
//! validated heap. Each heap is an arena: a contiguous `Vec` of entries plus
//! a map from task id to its current position, kept consistent on every
//! swap so that arbitrary removal and priority updates stay O(log n).
//!
//! Ordering: higher priority first; on equal priority the task created
//! earlier wins; on equal timestamps the task enqueued first wins.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::models::{Task, TaskId};
use crate::state_machine::TaskStatus;

/// Bonus applied when every preferred task has completed
pub const SOFT_DEPENDENCY_BONUS: i64 = 5;

/// Which heap a queued task occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Ready,
    Validated,
}

impl HeapKind {
    fn for_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Ready => Some(Self::Ready),
            TaskStatus::Validated => Some(Self::Validated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct HeapEntry {
    task_id: TaskId,
    priority: i64,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl HeapEntry {
    /// Max-heap comparator; an older timestamp compares as greater
    fn outranks(&self, other: &HeapEntry) -> bool {
        if self.priority != other.priority {
            return self.priority > other.priority;
        }
        if self.created_at != other.created_at {
            return self.created_at < other.created_at;
        }
        self.seq < other.seq
    }
}

#[derive(Debug, Default)]
struct IndexedHeap {
    entries: Vec<HeapEntry>,
    positions: HashMap<TaskId, usize>,
}

impl IndexedHeap {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn contains(&self, task_id: &str) -> bool {
        self.positions.contains_key(task_id)
    }

    fn peek(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    fn push(&mut self, entry: HeapEntry) {
        let index = self.entries.len();
        self.positions.insert(entry.task_id.clone(), index);
        self.entries.push(entry);
        self.sift_up(index);
    }

    fn pop(&mut self) -> Option<HeapEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.remove_at(0)
    }

    fn remove(&mut self, task_id: &str) -> Option<HeapEntry> {
        let index = *self.positions.get(task_id)?;
        self.remove_at(index)
    }

    fn priority_of(&self, task_id: &str) -> Option<i64> {
        self.positions
            .get(task_id)
            .map(|&index| self.entries[index].priority)
    }

    /// Swap with last, pop, then restore order around the hole
    fn remove_at(&mut self, index: usize) -> Option<HeapEntry> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap(index, last);
        let removed = self.entries.pop()?;
        self.positions.remove(&removed.task_id);

        if index < self.entries.len() {
            let settled = self.sift_up(index);
            if settled == index {
                self.sift_down(index);
            }
        }
        Some(removed)
    }

    fn update_priority(&mut self, task_id: &str, priority: i64) -> bool {
        let Some(&index) = self.positions.get(task_id) else {
            return false;
        };
        let previous = self.entries[index].priority;
        self.entries[index].priority = priority;
        if priority > previous {
            self.sift_up(index);
        } else if priority < previous {
            self.sift_down(index);
        }
        true
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.entries[index].outranks(&self.entries[parent]) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut best = index;

            if left < len && self.entries[left].outranks(&self.entries[best]) {
                best = left;
            }
            if right < len && self.entries[right].outranks(&self.entries[best]) {
                best = right;
            }
            if best == index {
                return index;
            }
            self.swap(index, best);
            index = best;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].task_id.clone(), a);
        self.positions.insert(self.entries[b].task_id.clone(), b);
    }

    fn drain(&mut self) -> Vec<HeapEntry> {
        self.positions.clear();
        std::mem::take(&mut self.entries)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let positions_match = self.positions.len() == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(index, entry)| self.positions.get(&entry.task_id) == Some(&index));
        let ordered = (1..self.entries.len())
            .all(|index| !self.entries[index].outranks(&self.entries[(index - 1) / 2]));
        positions_match && ordered
    }
}

/// Scheduler over the ready and validated heaps
#[derive(Debug, Default)]
pub struct PriorityTaskQueue {
    ready: IndexedHeap,
    validated: IndexedHeap,
    next_seq: u64,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the task's base priority
    pub fn enqueue(&mut self, task: &Task) -> bool {
        self.enqueue_with_priority(task, task.base_priority())
    }

    /// Enqueue into the heap matching the task's status
    ///
    /// A task already queued is moved, so it never occupies both heaps.
    /// Tasks outside `ready`/`validated` are rejected without side effects.
    pub fn enqueue_with_priority(&mut self, task: &Task, priority: i64) -> bool {
        let Some(kind) = HeapKind::for_status(task.status) else {
            warn!(
                task_id = %task.id,
                status = %task.status,
                "⚠️ Refusing to enqueue task outside ready/validated status"
            );
            return false;
        };

        let seq = match self.take_entry(&task.id) {
            Some(existing) => existing.seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };

        self.heap_mut(kind).push(HeapEntry {
            task_id: task.id.clone(),
            priority,
            created_at: task.created_at,
            seq,
        });

        debug!(task_id = %task.id, priority, heap = ?kind, "📥 Task enqueued");
        true
    }

    /// Highest-priority task, preferring the ready heap
    pub fn dequeue(&mut self) -> Option<TaskId> {
        if !self.ready.is_empty() {
            return self.dequeue_ready();
        }
        self.validated.pop().map(|entry| entry.task_id)
    }

    /// Highest-priority task from the ready heap only
    pub fn dequeue_ready(&mut self) -> Option<TaskId> {
        self.ready.pop().map(|entry| entry.task_id)
    }

    /// Highest-priority ready task accepted by `accept`
    ///
    /// Skipped entries are pushed back with their original ordering keys.
    pub fn dequeue_ready_where<F>(&mut self, mut accept: F) -> Option<TaskId>
    where
        F: FnMut(&str) -> bool,
    {
        let mut skipped = Vec::new();
        let mut found = None;

        while let Some(entry) = self.ready.pop() {
            if accept(&entry.task_id) {
                found = Some(entry.task_id);
                break;
            }
            skipped.push(entry);
        }

        for entry in skipped {
            self.ready.push(entry);
        }
        found
    }

    pub fn peek(&self) -> Option<&TaskId> {
        self.ready
            .peek()
            .or_else(|| self.validated.peek())
            .map(|entry| &entry.task_id)
    }

    pub fn peek_ready(&self) -> Option<&TaskId> {
        self.ready.peek().map(|entry| &entry.task_id)
    }

    /// Remove a task from whichever heap holds it
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.take_entry(task_id).is_some()
    }

    pub fn update_priority(&mut self, task_id: &str, priority: i64) -> bool {
        self.ready.update_priority(task_id, priority)
            || self.validated.update_priority(task_id, priority)
    }

    pub fn priority_of(&self, task_id: &str) -> Option<i64> {
        self.ready
            .priority_of(task_id)
            .or_else(|| self.validated.priority_of(task_id))
    }

    /// Base priority adjusted by the state of the task's soft dependencies
    pub fn compute_effective_priority(task: &Task, all_tasks: &HashMap<TaskId, Task>) -> i64 {
        let base = task.base_priority();
        if task.prefers.is_empty() {
            return base;
        }

        let completed = task
            .prefers
            .iter()
            .filter(|id| {
                all_tasks
                    .get(id.as_str())
                    .is_some_and(|preferred| preferred.status == TaskStatus::Completed)
            })
            .count();

        if completed == task.prefers.len() {
            base + SOFT_DEPENDENCY_BONUS
        } else if completed > 0 {
            base - SOFT_DEPENDENCY_BONUS
        } else {
            base
        }
    }

    /// Refresh one task's effective priority in place
    pub fn recompute_priority(&mut self, task_id: &str, all_tasks: &HashMap<TaskId, Task>) -> bool {
        match all_tasks.get(task_id) {
            Some(task) if self.contains(task_id) => {
                let priority = Self::compute_effective_priority(task, all_tasks);
                self.update_priority(task_id, priority)
            }
            _ => false,
        }
    }

    /// Rebuild both heaps from scratch with recomputed priorities
    ///
    /// Entries whose task vanished or left `ready`/`validated` are dropped;
    /// entries whose status changed move to the matching heap.
    pub fn reorder(&mut self, all_tasks: &HashMap<TaskId, Task>) {
        let mut entries = self.ready.drain();
        entries.extend(self.validated.drain());

        for mut entry in entries {
            let Some(task) = all_tasks.get(&entry.task_id) else {
                continue;
            };
            let Some(kind) = HeapKind::for_status(task.status) else {
                continue;
            };
            entry.priority = Self::compute_effective_priority(task, all_tasks);
            self.heap_mut(kind).push(entry);
        }

        debug!(
            ready = self.ready.len(),
            validated = self.validated.len(),
            "🔃 Priority queue reordered"
        );
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.ready.contains(task_id) || self.validated.contains(task_id)
    }

    pub fn heap_of(&self, task_id: &str) -> Option<HeapKind> {
        if self.ready.contains(task_id) {
            Some(HeapKind::Ready)
        } else if self.validated.contains(task_id) {
            Some(HeapKind::Validated)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.validated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn validated_len(&self) -> usize {
        self.validated.len()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.validated.clear();
    }

    pub fn dispose(&mut self) {
        self.clear();
        self.next_seq = 0;
    }

    fn take_entry(&mut self, task_id: &str) -> Option<HeapEntry> {
        self.ready
            .remove(task_id)
            .or_else(|| self.validated.remove(task_id))
    }

    fn heap_mut(&mut self, kind: HeapKind) -> &mut IndexedHeap {
        match kind {
            HeapKind::Ready => &mut self.ready,
            HeapKind::Validated => &mut self.validated,
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.ready.is_consistent() && self.validated.is_consistent()
    }
}
