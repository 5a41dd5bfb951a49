//! Optimistic mutations and their resolution.
//!
//! Every user mutation follows the same lifecycle:
//!
//! 1. capture the task's last confirmed state,
//! 2. show the target state immediately and record a [`PendingOperation`],
//! 3. issue the REST call through the gateway,
//! 4. on success commit and store the server's record; on failure roll back
//!    and report the error.
//!
//! Mutations on the same task are serialized: the second waits until the
//! first has resolved, so a task never has more than one pending operation.
//! Realtime events skip that queue and are applied to the store directly.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use taskman_proto::realtime::RealtimeEvent;
use taskman_proto::task::{NewTask, Task, TaskId, TaskPatch, TaskStatus, validate_title};
use tokio::sync::OwnedMutexGuard;

use super::store::{PendingOperation, RealtimeOutcome, TaskFilter, TaskStore, TaskSummary};
use super::{StoreError, SyncError};
use crate::api::RemoteApi;
use crate::gateway::ApiError;
use crate::transport::HttpTransport;

/// What a drag carries: the task and the column it was picked up from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DragPayload {
    /// Dragged task.
    pub id: TaskId,
    /// Status of the source column at drag start.
    pub status: TaskStatus,
}

/// Result of dropping a task on a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropOutcome {
    /// Dropped on its own column; nothing happened.
    Unchanged,
    /// The task moved; carries the server's record.
    Moved(Task),
}

type TaskLocks = Mutex<HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>>;

/// Drives optimistic task mutations for one session.
pub struct Reconciler<T> {
    api: Arc<RemoteApi<T>>,
    store: Arc<Mutex<TaskStore>>,
    task_locks: TaskLocks,
}

/// Exclusive access to one task's mutation queue.
///
/// Dropping it releases the queue and forgets the lock once nobody else
/// holds or waits for it.
struct TaskGuard<'a> {
    locks: &'a TaskLocks,
    id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

impl<T: HttpTransport> Reconciler<T> {
    /// A reconciler with an empty store.
    pub fn new(api: Arc<RemoteApi<T>>) -> Self {
        Self {
            api,
            store: Arc::new(Mutex::new(TaskStore::new())),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The remote API this reconciler calls.
    #[must_use]
    pub const fn api(&self) -> &Arc<RemoteApi<T>> {
        &self.api
    }

    /// The shared task store.
    #[must_use]
    pub const fn store(&self) -> &Arc<Mutex<TaskStore>> {
        &self.store
    }

    /// A copy of the current task list.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.store.lock().list().to_vec()
    }

    /// A copy of one task.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.store.lock().get(id).cloned()
    }

    /// Tasks matching `filter`.
    #[must_use]
    pub fn filter(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.lock().filter(filter)
    }

    /// Dashboard counters relative to `today`.
    #[must_use]
    pub fn summary(&self, today: NaiveDate) -> TaskSummary {
        self.store.lock().summary(today)
    }

    /// Fetch the full list and reconcile it into the store.
    ///
    /// Returns the number of tasks the server listed.
    ///
    /// # Errors
    ///
    /// [`SyncError::Api`] if the list could not be fetched; the store is left
    /// untouched.
    pub async fn reload(&self) -> Result<usize, SyncError> {
        let tasks = self.api.list_tasks().await?;
        let count = tasks.len();
        self.store.lock().replace_all(tasks);
        tracing::info!(count, "task list reloaded");
        Ok(count)
    }

    /// Apply a realtime event; a refresh request reloads the full list.
    ///
    /// # Errors
    ///
    /// [`SyncError::Api`] if a requested reload failed.
    pub async fn apply_event(&self, event: RealtimeEvent) -> Result<RealtimeOutcome, SyncError> {
        let outcome = self.store.lock().apply_realtime(event);
        if outcome == RealtimeOutcome::ReloadRequired {
            self.reload().await?;
        }
        Ok(outcome)
    }

    /// Change a task's status optimistically.
    ///
    /// # Errors
    ///
    /// [`StoreError::TaskNotFound`] for an unknown task, or the API error
    /// after the change has been rolled back.
    pub async fn change_status(&self, id: &TaskId, status: TaskStatus) -> Result<Task, SyncError> {
        let _guard = self.lock_task(id).await;
        let current = self.current(id)?;
        if current.status == status {
            return Ok(current);
        }

        self.store
            .lock()
            .apply_optimistic(PendingOperation::status_change(&current, status))?;
        let result = self.api.update_task(id, &TaskPatch::status(status)).await;
        self.resolve(id, result)
    }

    /// Drop a dragged task on the column for `target`.
    ///
    /// Dropping onto the column it came from is a no-op: no pending operation
    /// and no request.
    ///
    /// # Errors
    ///
    /// As [`Reconciler::change_status`].
    pub async fn drop_on_column(
        &self,
        payload: &DragPayload,
        target: TaskStatus,
    ) -> Result<DropOutcome, SyncError> {
        if payload.status == target {
            tracing::debug!(task = %payload.id, status = %target, "dropped on source column");
            return Ok(DropOutcome::Unchanged);
        }
        self.change_status(&payload.id, target)
            .await
            .map(DropOutcome::Moved)
    }

    /// Apply a partial update optimistically.
    ///
    /// # Errors
    ///
    /// [`SyncError::EmptyUpdate`] or [`SyncError::InvalidField`] before
    /// anything is changed, otherwise as [`Reconciler::change_status`].
    pub async fn update(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task, SyncError> {
        if patch.is_empty() {
            return Err(SyncError::EmptyUpdate);
        }
        if let Some(title) = &patch.title {
            validate_title(title)?;
        }

        let _guard = self.lock_task(id).await;
        let current = self.current(id)?;
        let target = current.patched(patch);
        let op = if patch.is_status_only() {
            PendingOperation::status_change(&current, target.status)
        } else {
            PendingOperation::update(&current, target)
        };

        self.store.lock().apply_optimistic(op)?;
        let result = self.api.update_task(id, patch).await;
        self.resolve(id, result)
    }

    /// Delete a task optimistically.
    ///
    /// # Errors
    ///
    /// As [`Reconciler::change_status`]; on failure the task reappears.
    pub async fn delete(&self, id: &TaskId) -> Result<(), SyncError> {
        let _guard = self.lock_task(id).await;
        let current = self.current(id)?;
        self.store
            .lock()
            .apply_optimistic(PendingOperation::delete(&current))?;

        let result = self.api.delete_task(id).await;
        let mut store = self.store.lock();
        match result {
            Ok(()) => {
                if store.commit(id).is_none() {
                    tracing::debug!(task = %id, "delete confirmed after server-side removal");
                }
                Ok(())
            }
            Err(e) => {
                if store.rollback(id).is_some() {
                    tracing::warn!(task = %id, err = %e, "delete failed, task restored");
                }
                Err(e.into())
            }
        }
    }

    /// Create a task optimistically under a provisional id.
    ///
    /// On success the provisional entry is replaced by the server's record.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidField`] for a bad title, otherwise the API error
    /// after the provisional entry has been removed.
    pub async fn create(&self, new_task: &NewTask) -> Result<Task, SyncError> {
        validate_title(&new_task.title)?;
        let provisional = new_task.to_task(TaskId::provisional());
        let provisional_id = provisional.id.clone();
        self.store
            .lock()
            .apply_optimistic(PendingOperation::create(provisional))?;

        let result = self.api.create_task(new_task).await;
        let mut store = self.store.lock();
        match result {
            Ok(task) => {
                store.commit(&provisional_id);
                if store.replace_provisional(&provisional_id, task.clone()) {
                    tracing::debug!(provisional = %provisional_id, task = %task.id, "create confirmed");
                }
                Ok(task)
            }
            Err(e) => {
                store.rollback(&provisional_id);
                tracing::warn!(err = %e, "create failed, provisional task removed");
                Err(e.into())
            }
        }
    }

    /// Commit or roll back the pending operation for `id`.
    ///
    /// If the operation was invalidated meanwhile (the task was deleted on
    /// the server), the store is left alone whatever the outcome.
    fn resolve(&self, id: &TaskId, result: Result<Task, ApiError>) -> Result<Task, SyncError> {
        let mut store = self.store.lock();
        match result {
            Ok(task) => {
                if store.commit(id).is_some() {
                    store.upsert(task.clone());
                } else {
                    tracing::debug!(task = %id, "change confirmed for a task removed meanwhile");
                }
                Ok(task)
            }
            Err(e) => {
                if store.rollback(id).is_some() {
                    tracing::warn!(task = %id, err = %e, "change rejected, rolled back");
                }
                Err(e.into())
            }
        }
    }

    fn current(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.store
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))
    }

    async fn lock_task(&self, id: &TaskId) -> TaskGuard<'_> {
        let lock = Arc::clone(self.task_locks.lock().entry(id.clone()).or_default());
        let mut guard = TaskGuard {
            locks: &self.task_locks,
            id: id.clone(),
            guard: None,
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }

    #[cfg(test)]
    fn held_task_locks(&self) -> usize {
        self.task_locks.lock().len()
    }
}
