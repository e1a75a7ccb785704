//! Priority lanes and the shared job queue
//!
//! The four lanes (Control, High, Normal, Low) are kept in one binary heap
//! ordered by priority first and insertion sequence second. A worker always
//! receives the highest-priority entry that is queued at the moment it
//! dequeues, and entries of equal priority leave in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::job::Task;

/// Job priority levels
///
/// Higher variants are dequeued first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Background work, runs when nothing else is queued
    Low = 0,

    /// Default for every submission
    #[default]
    Normal = 1,

    /// Interactive work such as rendering the visible page
    High = 2,

    /// Dispatcher commands. Stop sentinels travel on this lane.
    Control = 3,
}

impl Priority {
    /// All lanes, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Control,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Control => "control",
        };
        f.write_str(name)
    }
}

/// What a worker pulls off the queue.
#[derive(Debug)]
pub(crate) enum Entry {
    Run(Task),
    /// Tells exactly one worker to leave its pump loop.
    Stop,
}

struct QueuedEntry {
    priority: Priority,
    sequence: u64,
    entry: Entry,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.cmp(&other.priority) {
            // BinaryHeap is a max heap: the smaller sequence must compare greater
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    next_sequence: u64,
    open: bool,
}

impl QueueState {
    fn insert(&mut self, priority: Priority, entry: Entry) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedEntry {
            priority,
            sequence,
            entry,
        });
    }
}

/// Unbounded multi-producer/multi-consumer priority queue.
///
/// Open for adding from creation until [`JobQueue::close`]. Stop sentinels
/// bypass the closed check so a shutdown can always reach every worker.
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                open: true,
            }),
            available: Condvar::new(),
        }
    }

    /// Appends a task to its priority lane. Never blocks on capacity.
    ///
    /// Hands the task back when the queue is closed.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(task);
        }
        let priority = task.priority();
        state.insert(priority, Entry::Run(task));
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Queues `count` stop sentinels on the Control lane.
    pub(crate) fn push_stop(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.insert(Priority::Control, Entry::Stop);
        }
        drop(state);

        self.available.notify_all();
    }

    /// Stops accepting tasks and wakes every waiting worker.
    pub(crate) fn close(&self) {
        self.state.lock().open = false;
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Blocks until an entry is available.
    ///
    /// Returns `None` once `shutdown` is cancelled and nothing is left to
    /// dequeue, so no worker can sleep forever on an empty queue after a stop.
    pub(crate) fn pop(&self, shutdown: &CancellationToken) -> Option<Entry> {
        let mut state = self.state.lock();
        loop {
            if let Some(queued) = state.heap.pop() {
                return Some(queued.entry);
            }
            if shutdown.is_cancelled() {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Non-blocking variant of [`JobQueue::pop`].
    #[cfg(test)]
    pub(crate) fn try_pop(&self) -> Option<Entry> {
        self.state.lock().heap.pop().map(|queued| queued.entry)
    }

    /// Removes every queued task in dequeue order, discarding stop sentinels.
    pub(crate) fn drain_tasks(&self) -> Vec<Task> {
        let mut state = self.state.lock();
        let mut tasks = Vec::with_capacity(state.heap.len());
        while let Some(queued) = state.heap.pop() {
            if let Entry::Run(task) = queued.entry {
                tasks.push(task);
            }
        }
        tasks
    }

    /// Number of queued entries, sentinels included.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }
}
