//! Claim store contract and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use reckon_core::TaskId;

use super::types::TaskRecord;
use crate::error::StoreError;

/// Durable task queue with exclusive claims.
pub trait ClaimStore: Send + Sync {
    /// Atomically claim the oldest eligible task, making it invisible to other
    /// claimants until the claim completes or is released.
    fn claim(&self) -> Result<Option<ClaimedTask>, StoreError>;

    /// Permanently remove a task. Deleting a missing task is not an error.
    fn delete(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Insert or update a task.
    fn save(&self, task: TaskRecord) -> Result<TaskId, StoreError>;
}

impl<T: ClaimStore + ?Sized> ClaimStore for Arc<T> {
    fn claim(&self) -> Result<Option<ClaimedTask>, StoreError> {
        (**self).claim()
    }

    fn delete(&self, task_id: TaskId) -> Result<(), StoreError> {
        (**self).delete(task_id)
    }

    fn save(&self, task: TaskRecord) -> Result<TaskId, StoreError> {
        (**self).save(task)
    }
}

/// Store-side transaction backing one claim.
pub trait ClaimTransaction: Send {
    /// Delete the claimed task and commit.
    fn delete_and_commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Abort the claim, making the task claimable again.
    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// A task held exclusively by one worker.
///
/// Dropping it without `complete` or `release` rolls the claim back, so a worker
/// that dies mid-task leaves the task for the next invocation.
pub struct ClaimedTask {
    task: TaskRecord,
    tx: Option<Box<dyn ClaimTransaction>>,
}

impl ClaimedTask {
    pub fn new(task: TaskRecord, tx: Box<dyn ClaimTransaction>) -> Self {
        Self { task, tx: Some(tx) }
    }

    pub fn task(&self) -> &TaskRecord {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// Delete the task and end the claim.
    pub fn complete(mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.delete_and_commit(),
            None => Ok(()),
        }
    }

    /// End the claim, leaving the task in the store.
    pub fn release(mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback(),
            None => Ok(()),
        }
    }
}

impl core::fmt::Debug for ClaimedTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClaimedTask")
            .field("task", &self.task)
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl Drop for ClaimedTask {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback() {
                warn!(task_id = %self.task.id, error = %e, "failed to roll back abandoned claim");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    claimed: HashSet<TaskId>,
}

/// In-memory claim store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClaimStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored tasks, claimed or not.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .get(&task_id)
            .cloned()
    }

    /// All stored tasks, oldest first.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut tasks: Vec<_> = inner.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created, t.id));
        tasks
    }

    pub fn claimed_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .claimed
            .len()
    }
}

impl ClaimStore for InMemoryClaimStore {
    fn claim(&self) -> Result<Option<ClaimedTask>, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let next = inner
            .tasks
            .values()
            .filter(|t| !inner.claimed.contains(&t.id))
            .min_by_key(|t| (t.created, t.id))
            .cloned();

        Ok(next.map(|task| {
            inner.claimed.insert(task.id);
            let tx = InMemoryClaim {
                inner: Arc::clone(&self.inner),
                task_id: task.id,
            };
            ClaimedTask::new(task, Box::new(tx))
        }))
    }

    fn delete(&self, task_id: TaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.tasks.remove(&task_id);
        Ok(())
    }

    fn save(&self, task: TaskRecord) -> Result<TaskId, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = task.id;
        inner.tasks.insert(id, task);
        Ok(id)
    }
}

struct InMemoryClaim {
    inner: Arc<RwLock<Inner>>,
    task_id: TaskId,
}

impl ClaimTransaction for InMemoryClaim {
    fn delete_and_commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.tasks.remove(&self.task_id);
        inner.claimed.remove(&self.task_id);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.claimed.remove(&self.task_id);
        Ok(())
    }
}
