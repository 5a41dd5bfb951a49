//! Realtime channel frames.
//!
//! The server pushes JSON text frames of the shape
//! `{"type": "task.created" | "task.updated" | "task.deleted" | "tasks.refresh", "task"?: Task, "id"?: id}`.
//! [`decode`] is strict and reports why a frame was not understood;
//! [`classify`] never fails and maps anything it cannot understand to
//! [`RealtimeEvent::RefreshRequested`], so a consumer resynchronizes instead
//! of drifting.

use serde::Serialize;
use serde_json::Value;

use crate::task::{Task, TaskId};

/// Frame type announcing a new task.
pub const TASK_CREATED: &str = "task.created";
/// Frame type announcing a changed task.
pub const TASK_UPDATED: &str = "task.updated";
/// Frame type announcing a deleted task.
pub const TASK_DELETED: &str = "task.deleted";
/// Frame type asking clients to reload everything.
pub const TASKS_REFRESH: &str = "tasks.refresh";

/// A decoded realtime message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A task was created on the server.
    TaskCreated(Task),
    /// A task changed on the server.
    TaskUpdated(Task),
    /// A task was deleted on the server.
    TaskDeleted(TaskId),
    /// The client should reload the full task list.
    RefreshRequested,
}

impl RealtimeEvent {
    /// The frame type this event is carried as.
    #[must_use]
    pub const fn frame_type(&self) -> &'static str {
        match self {
            Self::TaskCreated(_) => TASK_CREATED,
            Self::TaskUpdated(_) => TASK_UPDATED,
            Self::TaskDeleted(_) => TASK_DELETED,
            Self::RefreshRequested => TASKS_REFRESH,
        }
    }
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The payload is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    /// The payload is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The object has no string `type` field.
    #[error("frame has no type")]
    MissingType,
    /// The `type` is not one this client understands.
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    /// A created/updated frame without a decodable `task`.
    #[error("{kind} frame carries no valid task: {reason}")]
    InvalidTask {
        /// Frame type.
        kind: &'static str,
        /// Decoder message.
        reason: String,
    },
    /// A deleted frame with neither `id` nor `task.id`.
    #[error("task.deleted frame carries no id")]
    MissingId,
}

/// Outgoing frame layout, used by servers and tests to produce frames.
#[derive(Debug, Serialize)]
struct Frame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a TaskId>,
}

/// Encode an event as a JSON text frame.
///
/// # Errors
///
/// Returns [`FrameError::Json`] if serialization fails.
pub fn encode(event: &RealtimeEvent) -> Result<String, FrameError> {
    let frame = match event {
        RealtimeEvent::TaskCreated(task) | RealtimeEvent::TaskUpdated(task) => Frame {
            kind: event.frame_type(),
            task: Some(task),
            id: None,
        },
        RealtimeEvent::TaskDeleted(id) => Frame {
            kind: event.frame_type(),
            task: None,
            id: Some(id),
        },
        RealtimeEvent::RefreshRequested => Frame {
            kind: event.frame_type(),
            task: None,
            id: None,
        },
    };
    serde_json::to_string(&frame).map_err(|e| FrameError::Json(e.to_string()))
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns a [`FrameError`] describing the first problem found.
pub fn decode(text: &str) -> Result<RealtimeEvent, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(FrameError::NotAnObject);
    };
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;

    match kind {
        TASK_CREATED => decode_task(TASK_CREATED, object.get("task")).map(RealtimeEvent::TaskCreated),
        TASK_UPDATED => decode_task(TASK_UPDATED, object.get("task")).map(RealtimeEvent::TaskUpdated),
        TASK_DELETED => {
            let id = object
                .get("id")
                .filter(|v| !v.is_null())
                .or_else(|| object.get("task").and_then(|t| t.get("id")))
                .ok_or(FrameError::MissingId)?;
            serde_json::from_value::<TaskId>(id.clone())
                .map(RealtimeEvent::TaskDeleted)
                .map_err(|_| FrameError::MissingId)
        }
        TASKS_REFRESH => Ok(RealtimeEvent::RefreshRequested),
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

/// Decode a frame, mapping every failure to [`RealtimeEvent::RefreshRequested`].
///
/// Returns the event together with the decode error, if there was one, so the
/// caller can log it.
#[must_use]
pub fn classify(text: &str) -> (RealtimeEvent, Option<FrameError>) {
    match decode(text) {
        Ok(event) => (event, None),
        Err(e) => (RealtimeEvent::RefreshRequested, Some(e)),
    }
}

fn decode_task(kind: &'static str, task: Option<&Value>) -> Result<Task, FrameError> {
    let task = task.ok_or_else(|| FrameError::InvalidTask {
        kind,
        reason: "missing".to_string(),
    })?;
    serde_json::from_value(task.clone()).map_err(|e| FrameError::InvalidTask {
        kind,
        reason: e.to_string(),
    })
}
