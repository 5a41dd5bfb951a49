//! In-memory accounts, tokens and per-user task lists.
//!
//! Everything is lost on restart. Tokens are opaque random strings mapped to
//! the owning user; revoking them simply forgets the mapping.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Deserialize;
use taskman_proto::auth::{LoginRequest, RegisterRequest, TokenPair};
use taskman_proto::task::{
    self, NewTask, Task, TaskId, TaskPatch, TaskPriority, TaskStatus,
};
use uuid::Uuid;

/// Identifier of a registered account.
pub type UserId = u64;

/// Errors returned by [`TaskDb`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The username is already registered.
    #[error("a user with that username already exists")]
    UsernameTaken,
    /// A field failed validation.
    #[error("{field}: {message}")]
    InvalidField {
        /// Field name as it appears in the request body.
        field: &'static str,
        /// Human-readable reason.
        message: String,
    },
    /// Unknown username or wrong password.
    #[error("no active account found with the given credentials")]
    InvalidCredentials,
    /// The token is unknown or was revoked.
    #[error("token is invalid or expired")]
    InvalidToken,
    /// No such task for this user.
    #[error("not found")]
    NotFound,
}

/// Optional filters of `GET /tasks/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    /// Only tasks with this status.
    pub status: Option<TaskStatus>,
    /// Only tasks with this priority.
    pub priority: Option<TaskPriority>,
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
}

impl ListQuery {
    fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.priority.is_none_or(|p| task.priority == p)
            && self
                .search
                .as_deref()
                .is_none_or(|q| q.is_empty() || task.matches_search(q))
    }
}

struct Account {
    id: UserId,
    password: String,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    access: HashMap<String, UserId>,
    refresh: HashMap<String, UserId>,
    /// Newest first.
    tasks: HashMap<UserId, Vec<Task>>,
    next_user: UserId,
    next_task: u64,
}

/// Thread-safe in-memory database.
#[derive(Default)]
pub struct TaskDb {
    inner: Mutex<Inner>,
}

impl TaskDb {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account.
    ///
    /// # Errors
    ///
    /// [`StoreError::UsernameTaken`] for a duplicate, or
    /// [`StoreError::InvalidField`] for a blank username or password.
    pub fn register(&self, request: &RegisterRequest) -> Result<UserId, StoreError> {
        if request.username.trim().is_empty() {
            return Err(blank("username"));
        }
        if request.password.is_empty() {
            return Err(blank("password"));
        }
        let mut inner = self.inner.lock();
        if inner.accounts.contains_key(&request.username) {
            return Err(StoreError::UsernameTaken);
        }
        inner.next_user += 1;
        let id = inner.next_user;
        inner.accounts.insert(
            request.username.clone(),
            Account {
                id,
                password: request.password.clone(),
            },
        );
        Ok(id)
    }

    /// Check credentials and issue a fresh token pair.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidCredentials`] on a mismatch.
    pub fn login(&self, request: &LoginRequest) -> Result<TokenPair, StoreError> {
        let mut inner = self.inner.lock();
        let user = inner
            .accounts
            .get(&request.username)
            .filter(|account| account.password == request.password)
            .map(|account| account.id)
            .ok_or(StoreError::InvalidCredentials)?;
        let access = mint_token();
        let refresh = mint_token();
        inner.access.insert(access.clone(), user);
        inner.refresh.insert(refresh.clone(), user);
        Ok(TokenPair { access, refresh })
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidToken`] if the refresh token is unknown.
    pub fn refresh(&self, refresh_token: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        let user = *inner
            .refresh
            .get(refresh_token)
            .ok_or(StoreError::InvalidToken)?;
        let access = mint_token();
        inner.access.insert(access.clone(), user);
        Ok(access)
    }

    /// The user an access token belongs to.
    #[must_use]
    pub fn authenticate(&self, access_token: &str) -> Option<UserId> {
        self.inner.lock().access.get(access_token).copied()
    }

    /// The id of a registered username.
    #[must_use]
    pub fn user_id(&self, username: &str) -> Option<UserId> {
        self.inner.lock().accounts.get(username).map(|a| a.id)
    }

    /// Forget every access token, as if they all expired.
    pub fn revoke_access_tokens(&self) {
        self.inner.lock().access.clear();
    }

    /// Forget every refresh token.
    pub fn revoke_refresh_tokens(&self) {
        self.inner.lock().refresh.clear();
    }

    /// The user's tasks matching `query`, newest first.
    #[must_use]
    pub fn list(&self, user: UserId, query: &ListQuery) -> Vec<Task> {
        self.inner
            .lock()
            .tasks
            .get(&user)
            .map(|tasks| tasks.iter().filter(|t| query.matches(t)).cloned().collect())
            .unwrap_or_default()
    }

    /// One of the user's tasks.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the user has no such task.
    pub fn get(&self, user: UserId, id: &TaskId) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .tasks
            .get(&user)
            .and_then(|tasks| tasks.iter().find(|t| t.id == *id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    /// Create a task with the next numeric id.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidField`] if the title is rejected.
    pub fn create(&self, user: UserId, new_task: &NewTask) -> Result<Task, StoreError> {
        check_title(&new_task.title)?;
        let mut inner = self.inner.lock();
        inner.next_task += 1;
        let task = new_task.to_task(TaskId::from(inner.next_task));
        inner
            .tasks
            .entry(user)
            .or_default()
            .insert(0, task.clone());
        Ok(task)
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidField`] for a rejected title, or
    /// [`StoreError::NotFound`].
    pub fn update(&self, user: UserId, id: &TaskId, patch: &TaskPatch) -> Result<Task, StoreError> {
        if let Some(title) = &patch.title {
            check_title(title)?;
        }
        let mut inner = self.inner.lock();
        let task = inner
            .tasks
            .get_mut(&user)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == *id))
            .ok_or(StoreError::NotFound)?;
        *task = task.patched(patch);
        Ok(task.clone())
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the user has no such task.
    pub fn delete(&self, user: UserId, id: &TaskId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let tasks = inner.tasks.get_mut(&user).ok_or(StoreError::NotFound)?;
        let index = tasks
            .iter()
            .position(|t| t.id == *id)
            .ok_or(StoreError::NotFound)?;
        tasks.remove(index);
        Ok(())
    }
}

fn mint_token() -> String {
    Uuid::now_v7().simple().to_string()
}

fn blank(field: &'static str) -> StoreError {
    StoreError::InvalidField {
        field,
        message: "This field may not be blank.".to_string(),
    }
}

fn check_title(title: &str) -> Result<(), StoreError> {
    task::validate_title(title).map_err(|e| StoreError::InvalidField {
        field: "title",
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_up(db: &TaskDb, name: &str) -> (UserId, TokenPair) {
        let id = db
            .register(&RegisterRequest {
                username: name.to_string(),
                email: name.to_string(),
                password: "pw".to_string(),
            })
            .unwrap();
        let pair = db
            .login(&LoginRequest {
                username: name.to_string(),
                password: "pw".to_string(),
            })
            .unwrap();
        (id, pair)
    }

    #[test]
    fn duplicate_username_rejected() {
        let db = TaskDb::new();
        signed_up(&db, "ann@example.com");
        let again = db.register(&RegisterRequest {
            username: "ann@example.com".to_string(),
            email: "ann@example.com".to_string(),
            password: "other".to_string(),
        });
        assert_eq!(again, Err(StoreError::UsernameTaken));
    }

    #[test]
    fn wrong_password_rejected() {
        let db = TaskDb::new();
        signed_up(&db, "ann@example.com");
        let result = db.login(&LoginRequest {
            username: "ann@example.com".to_string(),
            password: "nope".to_string(),
        });
        assert_eq!(result, Err(StoreError::InvalidCredentials));
    }

    #[test]
    fn refresh_issues_new_access_token() {
        let db = TaskDb::new();
        let (user, pair) = signed_up(&db, "ann@example.com");

        db.revoke_access_tokens();
        assert_eq!(db.authenticate(&pair.access), None);

        let access = db.refresh(&pair.refresh).unwrap();
        assert_ne!(access, pair.access);
        assert_eq!(db.authenticate(&access), Some(user));

        db.revoke_refresh_tokens();
        assert_eq!(db.refresh(&pair.refresh), Err(StoreError::InvalidToken));
    }

    #[test]
    fn tasks_are_scoped_per_user_and_newest_first() {
        let db = TaskDb::new();
        let (ann, _) = signed_up(&db, "ann@example.com");
        let (bob, _) = signed_up(&db, "bob@example.com");

        let first = db.create(ann, &NewTask::titled("first")).unwrap();
        let second = db.create(ann, &NewTask::titled("second")).unwrap();
        db.create(bob, &NewTask::titled("bob's")).unwrap();

        let titles: Vec<_> = db
            .list(ann, &ListQuery::default())
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, ["second", "first"]);
        assert_eq!(db.get(bob, &first.id), Err(StoreError::NotFound));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn list_filters() {
        let db = TaskDb::new();
        let (ann, _) = signed_up(&db, "ann@example.com");
        db.create(
            ann,
            &NewTask {
                status: TaskStatus::Completed,
                ..NewTask::titled("Write report")
            },
        )
        .unwrap();
        db.create(ann, &NewTask::titled("Buy milk")).unwrap();

        let done = db.list(
            ann,
            &ListQuery {
                status: Some(TaskStatus::Completed),
                ..ListQuery::default()
            },
        );
        assert_eq!(done.len(), 1);

        let search = db.list(
            ann,
            &ListQuery {
                search: Some("MILK".to_string()),
                ..ListQuery::default()
            },
        );
        assert_eq!(search[0].title, "Buy milk");
    }

    #[test]
    fn blank_title_rejected() {
        let db = TaskDb::new();
        let (ann, _) = signed_up(&db, "ann@example.com");
        let created = db.create(ann, &NewTask::titled("  "));
        assert!(matches!(
            created,
            Err(StoreError::InvalidField { field: "title", .. })
        ));

        let task = db.create(ann, &NewTask::titled("ok")).unwrap();
        let patch = TaskPatch {
            title: Some(String::new()),
            ..TaskPatch::default()
        };
        assert!(db.update(ann, &task.id, &patch).is_err());
        assert_eq!(db.get(ann, &task.id).unwrap().title, "ok");
    }

    #[test]
    fn update_and_delete() {
        let db = TaskDb::new();
        let (ann, _) = signed_up(&db, "ann@example.com");
        let task = db.create(ann, &NewTask::titled("t")).unwrap();

        let updated = db
            .update(ann, &task.id, &TaskPatch::status(TaskStatus::InProgress))
            .unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);

        db.delete(ann, &task.id).unwrap();
        assert_eq!(db.delete(ann, &task.id), Err(StoreError::NotFound));
    }
}
