//! Task list synchronization.
//!
//! [`TaskStore`] holds the session's task list and its unconfirmed
//! optimistic changes; [`Reconciler`] drives user mutations through the
//! store and the remote API, and applies realtime events.

pub mod reconcile;
pub mod store;

pub use reconcile::{DragPayload, DropOutcome, Reconciler};
pub use store::{
    PendingKind, PendingOperation, RealtimeOutcome, TaskFilter, TaskStore, TaskSummary,
};

use taskman_proto::task::{TaskFieldError, TaskId};
use thiserror::Error;

use crate::gateway::ApiError;

/// Errors from [`TaskStore`] bookkeeping.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The task already has an unconfirmed change.
    #[error("task {0} already has a pending change")]
    AlreadyPending(TaskId),
    /// The task is not in the store.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Errors surfaced by [`Reconciler`] operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The remote call failed; any optimistic change has been rolled back.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The local store refused the change.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A field value was rejected before anything was sent.
    #[error(transparent)]
    InvalidField(#[from] TaskFieldError),
    /// The update does not change any field.
    #[error("update changes nothing")]
    EmptyUpdate,
}

impl SyncError {
    /// Whether the session ended and the user has to sign in again.
    #[must_use]
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Api(ApiError::Authentication(_)))
    }
}
