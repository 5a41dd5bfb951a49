//! In-memory task store with pending-operation tracking.
//!
//! The store holds the session's view of the task list (newest first, like
//! the server) together with the optimistic operations that have not been
//! confirmed yet. It is a plain data structure; the reconciler shares it
//! behind a lock.

use std::collections::{HashMap, HashSet};

use chrono::{Days, NaiveDate};
use taskman_proto::realtime::RealtimeEvent;
use taskman_proto::task::{Task, TaskId, TaskPriority, TaskStatus};

use super::StoreError;

/// Kind of an unconfirmed local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Only the status changes.
    StatusChange,
    /// Any other field update.
    Update,
    /// The task is being deleted.
    Delete,
    /// The task is being created under a provisional id.
    Create,
}

/// An optimistic mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// The task the operation applies to.
    pub task_id: TaskId,
    /// What the operation does.
    pub kind: PendingKind,
    /// Last server-confirmed state of the task; `None` for a create.
    pub previous_snapshot: Option<Task>,
    /// The optimistic state shown until confirmation; `None` for a delete.
    pub target: Option<Task>,
}

impl PendingOperation {
    /// Change `current`'s status.
    #[must_use]
    pub fn status_change(current: &Task, status: TaskStatus) -> Self {
        let mut target = current.clone();
        target.status = status;
        Self {
            task_id: current.id.clone(),
            kind: PendingKind::StatusChange,
            previous_snapshot: Some(current.clone()),
            target: Some(target),
        }
    }

    /// Replace `current` with `target` (same id).
    #[must_use]
    pub fn update(current: &Task, target: Task) -> Self {
        Self {
            task_id: current.id.clone(),
            kind: PendingKind::Update,
            previous_snapshot: Some(current.clone()),
            target: Some(target),
        }
    }

    /// Delete `current`.
    #[must_use]
    pub fn delete(current: &Task) -> Self {
        Self {
            task_id: current.id.clone(),
            kind: PendingKind::Delete,
            previous_snapshot: Some(current.clone()),
            target: None,
        }
    }

    /// Show `task` before the server has assigned it an id.
    #[must_use]
    pub fn create(task: Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: PendingKind::Create,
            previous_snapshot: None,
            target: Some(task),
        }
    }
}

/// What applying a realtime event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeOutcome {
    /// The task was inserted or replaced.
    Upserted,
    /// The task was inserted or replaced and the server state became the
    /// new rollback point of its pending operation.
    SnapshotReplaced,
    /// The task was removed; `invalidated` if a pending operation for it was
    /// dropped.
    Removed {
        /// Whether a pending operation was dropped.
        invalidated: bool,
    },
    /// The full list has to be reloaded.
    ReloadRequired,
}

/// Criteria for [`TaskStore::filter`]. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
    /// Exact status.
    pub status: Option<TaskStatus>,
    /// Exact priority.
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    /// Whether `task` satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
            && self
                .search
                .as_deref()
                .is_none_or(|q| q.trim().is_empty() || task.matches_search(q.trim()))
    }
}

/// Dashboard counters over the task list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSummary {
    /// Number of tasks.
    pub total: usize,
    /// Tasks per status, in [`TaskStatus::ALL`] order.
    pub by_status: [usize; 3],
    /// Tasks per priority, in [`TaskPriority::ALL`] order.
    pub by_priority: [usize; 3],
    /// Tasks due today.
    pub due_today: usize,
    /// Tasks due between today and seven days from now, inclusive.
    pub due_this_week: usize,
    /// Tasks past their due date and not completed.
    pub overdue: usize,
}

impl TaskSummary {
    /// Count for one status.
    #[must_use]
    pub fn status_count(&self, status: TaskStatus) -> usize {
        TaskStatus::ALL
            .iter()
            .position(|s| *s == status)
            .map_or(0, |i| self.by_status[i])
    }

    /// Count for one priority.
    #[must_use]
    pub fn priority_count(&self, priority: TaskPriority) -> usize {
        TaskPriority::ALL
            .iter()
            .position(|p| *p == priority)
            .map_or(0, |i| self.by_priority[i])
    }
}

/// The session's task list and its unconfirmed operations.
///
/// Never holds two tasks with the same id, and at most one pending
/// operation per task.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Vec<Task>,
    pending: HashMap<TaskId, PendingOperation>,
    /// Ids deleted by the server while a create was unconfirmed. A create
    /// confirmation carrying one of them must not bring the task back.
    deleted_during_create: HashSet<TaskId>,
}

impl TaskStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task, newest first.
    #[must_use]
    pub fn list(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a task.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the store holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert `task`, or replace the task with its id in place. New tasks go
    /// to the front.
    pub fn upsert(&mut self, task: Task) {
        match self.position(&task.id) {
            Some(index) => self.tasks[index] = task,
            None => self.tasks.insert(0, task),
        }
    }

    /// Remove a task. Returns it if it was present.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.position(id).map(|index| self.tasks.remove(index))
    }

    /// The pending operation for `id`, if any.
    #[must_use]
    pub fn pending(&self, id: &TaskId) -> Option<&PendingOperation> {
        self.pending.get(id)
    }

    /// Number of pending operations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Apply an optimistic mutation and record it as pending.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyPending`] if the task already has a pending
    ///   operation.
    /// - [`StoreError::TaskNotFound`] if a non-create operation targets a task
    ///   the store does not hold.
    pub fn apply_optimistic(&mut self, op: PendingOperation) -> Result<(), StoreError> {
        if self.pending.contains_key(&op.task_id) {
            return Err(StoreError::AlreadyPending(op.task_id));
        }
        if op.kind != PendingKind::Create && self.position(&op.task_id).is_none() {
            return Err(StoreError::TaskNotFound(op.task_id));
        }

        match &op.target {
            Some(target) => self.upsert(target.clone()),
            None => {
                self.remove(&op.task_id);
            }
        }
        tracing::debug!(task = %op.task_id, kind = ?op.kind, "optimistic change applied");
        self.pending.insert(op.task_id.clone(), op);
        Ok(())
    }

    /// Confirm the pending operation for `id` and discard it.
    ///
    /// Returns `None` when the operation no longer exists (it was invalidated
    /// by a server-side delete); the caller must then leave the store alone.
    pub fn commit(&mut self, id: &TaskId) -> Option<PendingOperation> {
        let op = self.pending.remove(id)?;
        if op.kind == PendingKind::Delete {
            self.remove(id);
        }
        tracing::debug!(task = %id, kind = ?op.kind, "pending change committed");
        Some(op)
    }

    /// Revert the pending operation for `id` to its last confirmed state.
    ///
    /// Returns `None` when the operation no longer exists.
    pub fn rollback(&mut self, id: &TaskId) -> Option<PendingOperation> {
        let op = self.pending.remove(id)?;
        match &op.previous_snapshot {
            Some(snapshot) => self.upsert(snapshot.clone()),
            None => {
                self.remove(id);
            }
        }
        tracing::debug!(task = %id, kind = ?op.kind, "pending change rolled back");
        self.forget_deletes_if_idle();
        Some(op)
    }

    /// Put the confirmed version of a created task in place of its
    /// provisional entry.
    ///
    /// If the confirmed task already arrived by other means (a realtime
    /// push), the provisional entry is simply dropped. If the server deleted
    /// it before the confirmation came back, only the provisional entry is
    /// removed. Returns whether the confirmed task is in the store.
    pub fn replace_provisional(&mut self, provisional: &TaskId, confirmed: Task) -> bool {
        let kept = if self.deleted_during_create.remove(&confirmed.id) {
            tracing::debug!(task = %confirmed.id, "created task was deleted before confirmation");
            self.remove(provisional);
            false
        } else if self.position(&confirmed.id).is_some() {
            self.remove(provisional);
            self.upsert(confirmed);
            true
        } else {
            match self.position(provisional) {
                Some(index) => self.tasks[index] = confirmed,
                None => self.upsert(confirmed),
            }
            true
        };
        self.forget_deletes_if_idle();
        kept
    }

    /// Apply a server push.
    ///
    /// Created/updated tasks replace the local state; if the task has a
    /// pending operation the pushed state becomes its rollback point while
    /// the operation stays outstanding. A delete removes the task and drops
    /// any pending operation for it.
    pub fn apply_realtime(&mut self, event: RealtimeEvent) -> RealtimeOutcome {
        match event {
            RealtimeEvent::TaskCreated(task) | RealtimeEvent::TaskUpdated(task) => {
                self.apply_server_state(task)
            }
            RealtimeEvent::TaskDeleted(id) => {
                self.remove(&id);
                if self.has_pending_create() {
                    self.deleted_during_create.insert(id.clone());
                }
                let invalidated = self.pending.remove(&id).is_some();
                if invalidated {
                    tracing::debug!(task = %id, "pending change invalidated by server delete");
                }
                RealtimeOutcome::Removed { invalidated }
            }
            RealtimeEvent::RefreshRequested => RealtimeOutcome::ReloadRequired,
        }
    }

    /// Reconcile a full server listing, as if every task had been pushed.
    ///
    /// Tasks missing from the listing are removed and their pending
    /// operations dropped, except optimistic creates that the server has not
    /// confirmed yet.
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        let listed: std::collections::HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        let gone: Vec<TaskId> = self
            .pending
            .values()
            .filter(|op| op.kind != PendingKind::Create && !listed.contains(&op.task_id))
            .map(|op| op.task_id.clone())
            .collect();
        drop(listed);
        for id in gone {
            self.pending.remove(&id);
        }

        let provisional: Vec<Task> = self
            .tasks
            .drain(..)
            .filter(|t| {
                self.pending
                    .get(&t.id)
                    .is_some_and(|op| op.kind == PendingKind::Create)
            })
            .collect();

        self.tasks = provisional;
        for task in tasks {
            if let Some(op) = self.pending.get_mut(&task.id) {
                op.previous_snapshot = Some(task.clone());
            }
            // A listing that repeats an id keeps one entry; the later one wins.
            match self.position(&task.id) {
                Some(index) => self.tasks[index] = task,
                None => self.tasks.push(task),
            }
        }
    }

    /// Tasks matching `filter`, in list order.
    #[must_use]
    pub fn filter(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    /// Dashboard counters relative to `today`.
    #[must_use]
    pub fn summary(&self, today: NaiveDate) -> TaskSummary {
        let week_end = today.checked_add_days(Days::new(7)).unwrap_or(NaiveDate::MAX);
        let mut summary = TaskSummary {
            total: self.tasks.len(),
            ..TaskSummary::default()
        };
        for task in &self.tasks {
            if let Some(i) = TaskStatus::ALL.iter().position(|s| *s == task.status) {
                summary.by_status[i] += 1;
            }
            if let Some(i) = TaskPriority::ALL.iter().position(|p| *p == task.priority) {
                summary.by_priority[i] += 1;
            }
            if let Some(due) = task.due_date {
                if due == today {
                    summary.due_today += 1;
                }
                if due >= today && due <= week_end {
                    summary.due_this_week += 1;
                }
            }
            if task.is_overdue(today) {
                summary.overdue += 1;
            }
        }
        summary
    }

    fn apply_server_state(&mut self, task: Task) -> RealtimeOutcome {
        let outcome = match self.pending.get_mut(&task.id) {
            Some(op) => {
                op.previous_snapshot = Some(task.clone());
                RealtimeOutcome::SnapshotReplaced
            }
            None => RealtimeOutcome::Upserted,
        };
        self.upsert(task);
        outcome
    }

    fn has_pending_create(&self) -> bool {
        self.pending.values().any(|op| op.kind == PendingKind::Create)
    }

    fn forget_deletes_if_idle(&mut self) {
        if !self.has_pending_create() {
            self.deleted_during_create.clear();
        }
    }

    fn position(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| &t.id == id)
    }
}
