//! In-memory FIFO task queue.
//!
//! Many producers (HTTP handlers) push; exactly one consumer (the executor)
//! pops. Every mutation goes through one mutex, and a [`Notify`] permit wakes
//! the consumer so a push racing with `pop` starting to wait is never lost.
//!
//! A popped task stays claimed until the executor releases it, so lookups
//! still find it before its running marker exists.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::task::Task;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid task: task id is empty")]
    EmptyTaskId,

    #[error("task {0} not found in queue")]
    NotFound(String),

    #[error("queue consumer cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Task>,
    claimed: Option<Task>,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the state half-mutated.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a task at the tail and wake the consumer.
    pub fn push(&self, task: Task) -> Result<(), QueueError> {
        if task.id.is_empty() {
            return Err(QueueError::EmptyTaskId);
        }
        let task_id = task.id.clone();
        self.lock().pending.push_back(task);
        self.not_empty.notify_one();
        tracing::debug!(task_id = %task_id, "Task pushed to queue");
        Ok(())
    }

    /// Remove and return the oldest task, waiting until one exists.
    ///
    /// The task is claimed until [`release`](Self::release) is called with
    /// its id. Returns [`QueueError::Cancelled`] as soon as `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<Task, QueueError> {
        loop {
            {
                let mut state = self.lock();
                if let Some(task) = state.pending.pop_front() {
                    state.claimed = Some(task.clone());
                    tracing::debug!(task_id = %task.id, "Task popped from queue");
                    return Ok(task);
                }
            }

            tokio::select! {
                _ = self.not_empty.notified() => continue,
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Drop the claim on a popped task once the store tracks it.
    pub fn release(&self, task_id: &str) {
        let mut state = self.lock();
        if state.claimed.as_ref().is_some_and(|t| t.id == task_id) {
            state.claimed = None;
        }
    }

    /// Snapshot of every pending task, oldest first. Claimed tasks are not listed.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().pending.iter().cloned().collect()
    }

    /// The pending or claimed task with `task_id`.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        let state = self.lock();
        state
            .pending
            .iter()
            .chain(state.claimed.as_ref())
            .find(|t| t.id == task_id)
            .cloned()
    }

    /// Remove the first pending task with `task_id`.
    pub fn remove(&self, task_id: &str) -> Result<Task, QueueError> {
        if task_id.is_empty() {
            return Err(QueueError::EmptyTaskId);
        }
        let mut state = self.lock();
        let removed = state
            .pending
            .iter()
            .position(|t| t.id == task_id)
            .and_then(|idx| state.pending.remove(idx));
        match removed {
            Some(task) => {
                tracing::info!(task_id, "Task removed from queue");
                Ok(task)
            }
            None => {
                tracing::warn!(task_id, "Task not found in queue");
                Err(QueueError::NotFound(task_id.to_string()))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}
