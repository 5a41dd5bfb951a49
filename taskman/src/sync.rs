//! Sync coordinator: wires a session to its realtime stream and runs user
//! commands in the background.
//!
//! # Architecture
//!
//! ```text
//! front end  ←── SyncEvent ───  background tasks  ←── realtime stream
//!            ─── SyncCommand →        │
//!                                     └──→ Reconciler ──→ REST
//! ```
//!
//! Realtime events are applied one at a time in arrival order. Commands are
//! each run on their own task, so several REST calls can be in flight at
//! once; mutations on the same task still queue inside the reconciler.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use taskman_proto::realtime::RealtimeEvent;
use taskman_proto::task::{NewTask, Task, TaskId, TaskPatch, TaskStatus};

use crate::realtime::{ConnectionState, RealtimeClient, RealtimeConfig, RealtimeEvents};
use crate::session::Session;
use crate::tasks::{DragPayload, DropOutcome, Reconciler, SyncError};
use crate::transport::HttpTransport;

/// Commands accepted by the coordinator.
#[derive(Debug)]
pub enum SyncCommand {
    /// Set a task's status.
    ChangeStatus {
        /// Target task.
        id: TaskId,
        /// New status.
        status: TaskStatus,
    },
    /// Drop a dragged task on a column.
    Drop {
        /// What was dragged.
        payload: DragPayload,
        /// Status of the column it was dropped on.
        target: TaskStatus,
    },
    /// Apply a partial update.
    Update {
        /// Target task.
        id: TaskId,
        /// Fields to change.
        patch: TaskPatch,
    },
    /// Delete a task.
    Delete {
        /// Target task.
        id: TaskId,
    },
    /// Create a task.
    Create {
        /// The new task.
        task: NewTask,
    },
    /// Reload the full list.
    Reload,
    /// Stop the realtime stream and the command loop.
    Shutdown,
}

impl SyncCommand {
    const fn name(&self) -> &'static str {
        match self {
            Self::ChangeStatus { .. } => "change-status",
            Self::Drop { .. } => "drop",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Create { .. } => "create",
            Self::Reload => "reload",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The realtime connection changed state.
    Connection(ConnectionState),
    /// A task was created or changed (by a command or a push).
    TaskUpserted(Task),
    /// A task was deleted.
    TaskRemoved(TaskId),
    /// The full list was reloaded.
    Reloaded {
        /// Tasks now in the store.
        count: usize,
    },
    /// A command failed; any optimistic change was rolled back.
    CommandFailed {
        /// Which command.
        command: &'static str,
        /// Why.
        error: SyncError,
    },
    /// The credentials were rejected for good; sign in again.
    SessionEnded,
}

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Realtime stream settings.
    pub realtime: RealtimeConfig,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

/// Default channel capacity for commands and events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

impl SyncConfig {
    /// Settings for `realtime` with the default channel capacity.
    #[must_use]
    pub const fn new(realtime: RealtimeConfig) -> Self {
        Self {
            realtime,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Load the task list, open the realtime stream and spawn the background
/// tasks.
///
/// # Errors
///
/// Returns the reload error if the initial task list cannot be fetched; no
/// background task is started in that case.
pub async fn spawn_sync<T: HttpTransport + 'static>(
    session: &Session<T>,
    config: SyncConfig,
) -> Result<(mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncEvent>), SyncError> {
    let reconciler = Arc::clone(session.reconciler());
    let count = reconciler.reload().await?;

    let capacity = config.channel_capacity.max(1);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (evt_tx, evt_rx) = mpsc::channel(capacity);
    let _ = evt_tx.send(SyncEvent::Reloaded { count }).await;

    let (client, events) = session.connect_realtime(config.realtime);
    let client = Arc::new(client);
    let state = client.watch_state();

    tokio::spawn(realtime_pump(
        Arc::clone(&reconciler),
        Arc::clone(&client),
        events,
        state,
        evt_tx.clone(),
    ));
    tokio::spawn(command_handler(reconciler, client, cmd_rx, evt_tx));

    Ok((cmd_tx, evt_rx))
}

/// Background task: apply realtime events in order and report them.
///
/// Ends once the realtime client has stopped, always reporting
/// [`ConnectionState::Stopped`] last.
async fn realtime_pump<T: HttpTransport>(
    reconciler: Arc<Reconciler<T>>,
    client: Arc<RealtimeClient>,
    mut events: RealtimeEvents,
    mut state: watch::Receiver<ConnectionState>,
    evt_tx: mpsc::Sender<SyncEvent>,
) {
    let mut stop_reported = false;
    loop {
        let sync_event = tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                apply_realtime(&reconciler, event).await
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                stop_reported = current == ConnectionState::Stopped;
                SyncEvent::Connection(current)
            }
        };
        let ended = sync_event == SyncEvent::SessionEnded;
        if evt_tx.send(sync_event).await.is_err() {
            break;
        }
        if ended {
            end_session(&client, "realtime");
        }
    }
    // The event stream only ends once the supervisor has stopped.
    if !stop_reported {
        let _ = evt_tx
            .send(SyncEvent::Connection(ConnectionState::Stopped))
            .await;
    }
    tracing::debug!("realtime pump exiting");
}

/// Credentials are gone for good: stop reconnecting with them.
fn end_session(client: &RealtimeClient, source: &'static str) {
    tracing::warn!(source, "session ended, closing realtime stream");
    client.teardown();
}

async fn apply_realtime<T: HttpTransport>(
    reconciler: &Reconciler<T>,
    event: RealtimeEvent,
) -> SyncEvent {
    let reported = match &event {
        RealtimeEvent::TaskCreated(task) | RealtimeEvent::TaskUpdated(task) => {
            Some(SyncEvent::TaskUpserted(task.clone()))
        }
        RealtimeEvent::TaskDeleted(id) => Some(SyncEvent::TaskRemoved(id.clone())),
        RealtimeEvent::RefreshRequested => None,
    };
    match reconciler.apply_event(event).await {
        Ok(_) => reported.unwrap_or_else(|| SyncEvent::Reloaded {
            count: reconciler.tasks().len(),
        }),
        Err(error) => failure("reload", error),
    }
}

/// Background task: run commands until shutdown, then tear the stream down.
async fn command_handler<T: HttpTransport + 'static>(
    reconciler: Arc<Reconciler<T>>,
    client: Arc<RealtimeClient>,
    mut cmd_rx: mpsc::Receiver<SyncCommand>,
    evt_tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, SyncCommand::Shutdown) {
            break;
        }
        let reconciler = Arc::clone(&reconciler);
        let client = Arc::clone(&client);
        let evt_tx = evt_tx.clone();
        tokio::spawn(async move {
            let name = cmd.name();
            let event = match execute(&reconciler, cmd).await {
                Ok(event) => event,
                Err(error) => failure(name, error),
            };
            let ended = event == SyncEvent::SessionEnded;
            let _ = evt_tx.send(event).await;
            if ended {
                end_session(&client, name);
            }
        });
    }
    client.teardown();
    tracing::info!("sync command handler shutting down");
}

async fn execute<T: HttpTransport>(
    reconciler: &Reconciler<T>,
    cmd: SyncCommand,
) -> Result<SyncEvent, SyncError> {
    match cmd {
        SyncCommand::ChangeStatus { id, status } => reconciler
            .change_status(&id, status)
            .await
            .map(SyncEvent::TaskUpserted),
        SyncCommand::Drop { payload, target } => {
            match reconciler.drop_on_column(&payload, target).await? {
                DropOutcome::Moved(task) => Ok(SyncEvent::TaskUpserted(task)),
                DropOutcome::Unchanged => Ok(reconciler.task(&payload.id).map_or(
                    SyncEvent::TaskRemoved(payload.id),
                    SyncEvent::TaskUpserted,
                )),
            }
        }
        SyncCommand::Update { id, patch } => reconciler
            .update(&id, &patch)
            .await
            .map(SyncEvent::TaskUpserted),
        SyncCommand::Delete { id } => reconciler
            .delete(&id)
            .await
            .map(|()| SyncEvent::TaskRemoved(id)),
        SyncCommand::Create { task } => reconciler
            .create(&task)
            .await
            .map(SyncEvent::TaskUpserted),
        SyncCommand::Reload => reconciler
            .reload()
            .await
            .map(|count| SyncEvent::Reloaded { count }),
        SyncCommand::Shutdown => Ok(SyncEvent::Connection(ConnectionState::Stopped)),
    }
}

fn failure(command: &'static str, error: SyncError) -> SyncEvent {
    if error.is_authentication() {
        SyncEvent::SessionEnded
    } else {
        tracing::warn!(command, err = %error, "sync command failed");
        SyncEvent::CommandFailed { command, error }
    }
}
