// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for live task sync: the realtime stream, the sync
//! coordinator and optimistic reconciliation against the development server.
//!
//! These tests validate:
//! - Changes made by another session arrive over the stream and land in the store
//! - An unrecognized frame makes the client reload the full list
//! - A change the server refuses is rolled back
//! - The stream reconnects after the server drops it
//! - Revoked credentials end the session and close the stream

use std::sync::Arc;
use std::time::Duration;

use taskman::credentials::CredentialStore;
use taskman::gateway::ApiError;
use taskman::realtime::{ConnectionState, RealtimeConfig};
use taskman::session::Session;
use taskman::sync::{self, SyncCommand, SyncConfig, SyncEvent};
use taskman::tasks::{DragPayload, SyncError};
use taskman::transport::http::ReqwestTransport;
use taskman_devserver::server::{self, ServerState};
use taskman_proto::task::{NewTask, TaskStatus};
use tokio::sync::mpsc;

const EMAIL: &str = "ann@example.com";
const PASSWORD: &str = "pw";

struct Harness {
    api_base: String,
    ws_url: String,
    state: Arc<ServerState>,
}

impl Harness {
    async fn start() -> Self {
        let (addr, _handle, state) = server::start_server("127.0.0.1:0").await.unwrap();
        Self {
            api_base: format!("http://{addr}/api"),
            ws_url: format!("ws://{addr}/ws/tasks/"),
            state,
        }
    }

    async fn session(&self) -> Session<ReqwestTransport> {
        let session = Session::new(
            ReqwestTransport::new(&self.api_base).unwrap(),
            Arc::new(CredentialStore::in_memory()),
        );
        if self.state.db.user_id(EMAIL).is_some() {
            session.api().login(EMAIL, PASSWORD).await.unwrap();
        } else {
            session.api().register(EMAIL, PASSWORD, None).await.unwrap();
        }
        session
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig::new(RealtimeConfig {
            reconnect_delay: Duration::from_millis(100),
            ..RealtimeConfig::new(&self.ws_url)
        })
    }
}

/// Receive events until one satisfies `pred`, failing after five seconds.
async fn wait_for(
    rx: &mut mpsc::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for sync event")
}

fn is_open(event: &SyncEvent) -> bool {
    *event == SyncEvent::Connection(ConnectionState::Open)
}

#[tokio::test]
async fn remote_changes_reach_the_store() {
    let harness = Harness::start().await;
    let watcher = harness.session().await;
    let editor = harness.session().await;

    let (cmd_tx, mut evt_rx) = sync::spawn_sync(&watcher, harness.sync_config())
        .await
        .unwrap();
    assert_eq!(
        wait_for(&mut evt_rx, |_| true).await,
        SyncEvent::Reloaded { count: 0 }
    );
    wait_for(&mut evt_rx, is_open).await;

    let created = editor
        .api()
        .create_task(&NewTask::titled("from elsewhere"))
        .await
        .unwrap();
    let event = wait_for(&mut evt_rx, |e| matches!(e, SyncEvent::TaskUpserted(_))).await;
    assert_eq!(event, SyncEvent::TaskUpserted(created.clone()));
    assert_eq!(watcher.reconciler().task(&created.id), Some(created.clone()));

    editor.api().delete_task(&created.id).await.unwrap();
    let event = wait_for(&mut evt_rx, |e| matches!(e, SyncEvent::TaskRemoved(_))).await;
    assert_eq!(event, SyncEvent::TaskRemoved(created.id.clone()));
    assert!(watcher.reconciler().tasks().is_empty());

    // After shutdown the background tasks finish and the event stream ends.
    cmd_tx.send(SyncCommand::Shutdown).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while evt_rx.recv().await.is_some() {}
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unknown_frame_triggers_reload() {
    let harness = Harness::start().await;
    let session = harness.session().await;

    let (_cmd_tx, mut evt_rx) = sync::spawn_sync(&session, harness.sync_config())
        .await
        .unwrap();
    wait_for(&mut evt_rx, is_open).await;

    // Created behind the stream's back: only a reload can reveal it.
    let user = harness.state.db.user_id(EMAIL).unwrap();
    harness
        .state
        .db
        .create(user, &NewTask::titled("hidden"))
        .unwrap();
    assert!(session.reconciler().tasks().is_empty());

    assert_eq!(
        harness
            .state
            .broadcast_raw(EMAIL, r#"{"type": "board.reshuffled"}"#),
        1
    );
    let event = wait_for(&mut evt_rx, |e| matches!(e, SyncEvent::Reloaded { .. })).await;
    assert_eq!(event, SyncEvent::Reloaded { count: 1 });
    assert_eq!(session.reconciler().tasks()[0].title, "hidden");
}

#[tokio::test]
async fn refused_change_is_rolled_back() {
    let harness = Harness::start().await;
    let session = harness.session().await;
    let task = session
        .api()
        .create_task(&NewTask::titled("doomed"))
        .await
        .unwrap();
    let board = session.reconciler();
    board.reload().await.unwrap();

    // Removed on the server without a push: the client still shows it.
    let user = harness.state.db.user_id(EMAIL).unwrap();
    harness.state.db.delete(user, &task.id).unwrap();

    let payload = DragPayload {
        id: task.id.clone(),
        status: TaskStatus::Pending,
    };
    let result = board.drop_on_column(&payload, TaskStatus::Completed).await;
    assert!(matches!(
        result,
        Err(SyncError::Api(ApiError::Rejected { status: 404, .. }))
    ));
    assert_eq!(board.task(&task.id).unwrap().status, TaskStatus::Pending);
    assert!(board.store().lock().pending(&task.id).is_none());
}

#[tokio::test]
async fn stream_reconnects_after_server_drop() {
    let harness = Harness::start().await;
    let watcher = harness.session().await;
    let editor = harness.session().await;

    let (_cmd_tx, mut evt_rx) = sync::spawn_sync(&watcher, harness.sync_config())
        .await
        .unwrap();
    wait_for(&mut evt_rx, is_open).await;

    harness.state.close_all_connections();
    wait_for(&mut evt_rx, |e| {
        *e == SyncEvent::Connection(ConnectionState::ClosedRetrying)
    })
    .await;
    wait_for(&mut evt_rx, is_open).await;

    let created = editor
        .api()
        .create_task(&NewTask::titled("after reconnect"))
        .await
        .unwrap();
    let event = wait_for(&mut evt_rx, |e| matches!(e, SyncEvent::TaskUpserted(_))).await;
    assert_eq!(event, SyncEvent::TaskUpserted(created));
}

#[tokio::test]
async fn revoked_credentials_end_the_session() {
    let harness = Harness::start().await;
    let session = harness.session().await;

    let (cmd_tx, mut evt_rx) = sync::spawn_sync(&session, harness.sync_config())
        .await
        .unwrap();
    wait_for(&mut evt_rx, is_open).await;

    harness.state.revoke_access_tokens();
    harness.state.revoke_refresh_tokens();

    cmd_tx.send(SyncCommand::Reload).await.unwrap();
    wait_for(&mut evt_rx, |e| *e == SyncEvent::SessionEnded).await;
    assert!(!session.is_authenticated());
    assert_eq!(harness.state.refresh_calls(), 1);

    // The stream is closed instead of retrying without credentials.
    wait_for(&mut evt_rx, |e| {
        *e == SyncEvent::Connection(ConnectionState::Stopped)
    })
    .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.state.subscriber_count(EMAIL) > 0 {
        assert!(tokio::time::Instant::now() < deadline, "socket left open");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
