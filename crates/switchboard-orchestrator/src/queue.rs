//! Priority task queue.
//!
//! This module provides the pending-task queue the dispatch loop pops from.
//! Dequeue order is priority-then-FIFO: higher priority first, and within
//! equal priority, submission order.

use crate::task::{Priority, Role, TaskId};
use std::collections::{BinaryHeap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

/// A queued reference to a pending task.
///
/// The full task record lives in the orchestrator's task store; the queue
/// only carries what dispatch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// The task id.
    pub id: TaskId,
    /// The role that will execute the task.
    pub role: Role,
    /// Dispatch priority.
    pub priority: Priority,
}

/// Heap wrapper ordering entries by (priority desc, sequence asc).
#[derive(Debug, Clone, PartialEq, Eq)]
struct SequencedEntry {
    entry: QueueEntry,
    /// Monotonic submission sequence; lower = submitted earlier.
    seq: u64,
}

impl PartialOrd for SequencedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequencedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher priority wins, and for equal
        // priorities the lower sequence number (earlier submission) wins.
        self.entry
            .priority
            .cmp(&other.entry.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<SequencedEntry>,
    /// Ids currently in the heap (for O(1) cancel checks).
    pending_ids: HashSet<TaskId>,
    /// Ids cancelled while pending; skipped lazily at pop.
    cancelled: HashSet<TaskId>,
    next_seq: u64,
}

/// Priority-then-FIFO queue of pending tasks.
///
/// Only the dispatch loop pops; `push` may be called from any task via the
/// orchestrator's `submit`.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    /// Creates a new empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a pending task.
    ///
    /// # Arguments
    /// * `entry` - The task reference to enqueue
    pub async fn push(&self, entry: QueueEntry) {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(task_id = %entry.id, priority = %entry.priority, seq, "Enqueueing task");
        inner.pending_ids.insert(entry.id);
        inner.heap.push(SequencedEntry { entry, seq });
    }

    /// Pops the next task: highest priority first, FIFO within a priority.
    ///
    /// Entries cancelled while pending are skipped.
    ///
    /// # Returns
    /// Returns `Some(QueueEntry)` if a live entry is available, `None` if
    /// the queue is empty.
    pub async fn pop(&self) -> Option<QueueEntry> {
        let mut inner = self.inner.lock().await;
        while let Some(SequencedEntry { entry, seq }) = inner.heap.pop() {
            if inner.cancelled.remove(&entry.id) {
                debug!(task_id = %entry.id, "Skipping cancelled entry");
                continue;
            }
            inner.pending_ids.remove(&entry.id);
            debug!(task_id = %entry.id, priority = %entry.priority, seq, "Dequeued task");
            return Some(entry);
        }
        None
    }

    /// Cancels a pending task.
    ///
    /// # Arguments
    /// * `id` - The task id to cancel
    ///
    /// # Returns
    /// Returns `true` if the task was pending and is now cancelled, `false`
    /// if it was not in the queue (already dispatched, finished, or never
    /// submitted).
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.pending_ids.remove(&id) {
            inner.cancelled.insert(id);
            debug!(task_id = %id, "Cancelled pending task");
            true
        } else {
            false
        }
    }

    /// Returns the number of live pending tasks.
    pub async fn depth(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.pending_ids.len()
    }
}
