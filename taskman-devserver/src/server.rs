//! HTTP and WebSocket front of the development server.
//!
//! REST routes live under `/api` with trailing-slash paths; the realtime
//! channel is `/ws/tasks/`. Every task mutation made through the REST API is
//! pushed to all open sockets of the owning user as a JSON text frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::json;
use taskman_proto::auth::{LoginRequest, RefreshRequest, RegisterRequest};
use taskman_proto::realtime::{self, RealtimeEvent};
use taskman_proto::task::{NewTask, TaskId, TaskPatch};
use tokio::sync::mpsc;

use crate::store::{ListQuery, StoreError, TaskDb, UserId};

/// Shared server state: the database and the open realtime sockets.
#[derive(Default)]
pub struct ServerState {
    /// Accounts, tokens and tasks.
    pub db: TaskDb,
    subscribers: Mutex<HashMap<UserId, Vec<mpsc::UnboundedSender<Message>>>>,
    refresh_calls: AtomicU64,
}

impl ServerState {
    /// Creates a server state with an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `POST /auth/refresh/` calls received so far.
    #[must_use]
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Invalidate every issued access token.
    pub fn revoke_access_tokens(&self) {
        tracing::info!("revoking all access tokens");
        self.db.revoke_access_tokens();
    }

    /// Invalidate every issued refresh token.
    pub fn revoke_refresh_tokens(&self) {
        tracing::info!("revoking all refresh tokens");
        self.db.revoke_refresh_tokens();
    }

    /// Number of open realtime sockets of `username`.
    #[must_use]
    pub fn subscriber_count(&self, username: &str) -> usize {
        let Some(user) = self.db.user_id(username) else {
            return 0;
        };
        self.subscribers
            .lock()
            .get(&user)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Push an arbitrary text frame to every socket of `username`.
    ///
    /// Returns how many sockets it was handed to.
    pub fn broadcast_raw(&self, username: &str, text: &str) -> usize {
        let Some(user) = self.db.user_id(username) else {
            return 0;
        };
        self.push(user, &Message::Text(text.to_string().into()))
    }

    /// Send a close frame to every open socket.
    pub fn close_all_connections(&self) {
        let subscribers = self.subscribers.lock();
        for (user, senders) in subscribers.iter() {
            tracing::info!(user, sockets = senders.len(), "closing realtime sockets");
            for tx in senders {
                let _ = tx.send(Message::Close(None));
            }
        }
    }

    fn subscribe(&self, user: UserId, tx: mpsc::UnboundedSender<Message>) {
        self.subscribers.lock().entry(user).or_default().push(tx);
    }

    fn broadcast(&self, user: UserId, event: &RealtimeEvent) {
        match realtime::encode(event) {
            Ok(text) => {
                let reached = self.push(user, &Message::Text(text.into()));
                tracing::debug!(user, kind = event.frame_type(), reached, "broadcast");
            }
            Err(e) => tracing::error!(error = %e, "failed to encode realtime frame"),
        }
    }

    /// Hand `msg` to every live socket of `user`, dropping dead ones.
    fn push(&self, user: UserId, msg: &Message) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(&user) else {
            return 0;
        };
        senders.retain(|tx| tx.send(msg.clone()).is_ok());
        senders.len()
    }
}

/// Starts the server on `addr` with a fresh state.
///
/// Returns the bound address, the server task handle and the state so tests
/// can reach the hooks.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (
        std::net::SocketAddr,
        tokio::task::JoinHandle<()>,
        Arc<ServerState>,
    ),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let state = Arc::new(ServerState::new());
    let (bound, handle) = start_server_with_state(addr, Arc::clone(&state)).await?;
    Ok((bound, handle, state))
}

/// Starts the server with a pre-built [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "dev server error");
        }
    });

    Ok((bound_addr, handle))
}

fn router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route("/api/auth/login/", post(login))
        .route("/api/auth/register/", post(register))
        .route("/api/auth/refresh/", post(refresh))
        .route("/api/tasks/", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}/",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/ws/tasks/", get(ws_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn login(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request: LoginRequest = match decode_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.db.login(&request) {
        Ok(pair) => {
            tracing::info!(username = %request.username, "login");
            (StatusCode::OK, Json(pair)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn register(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request: RegisterRequest = match decode_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.db.register(&request) {
        Ok(id) => {
            tracing::info!(username = %request.username, id, "account registered");
            let body = json!({"id": id, "username": request.username, "email": request.email});
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn refresh(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let request: RefreshRequest = match decode_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.db.refresh(&request.refresh) {
        Ok(access) => (StatusCode::OK, Json(json!({"access": access}))).into_response(),
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn list_tasks(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    (StatusCode::OK, Json(state.db.list(user, &query))).into_response()
}

async fn get_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    match state.db.get(user, &TaskId::new(id)) {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let new_task: NewTask = match decode_body(&body) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.db.create(user, &new_task) {
        Ok(task) => {
            state.broadcast(user, &RealtimeEvent::TaskCreated(task.clone()));
            (StatusCode::CREATED, Json(task)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn update_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let patch: TaskPatch = match decode_body(&body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match state.db.update(user, &TaskId::new(id), &patch) {
        Ok(task) => {
            state.broadcast(user, &RealtimeEvent::TaskUpdated(task.clone()));
            (StatusCode::OK, Json(task)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn delete_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(resp) => return resp,
    };
    let id = TaskId::new(id);
    match state.db.delete(user, &id) {
        Ok(()) => {
            state.broadcast(user, &RealtimeEvent::TaskDeleted(id));
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

/// Upgrade to a realtime socket, authenticated by the `token` query
/// parameter or a bearer header. Unauthenticated upgrades are refused.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let user = params
        .get("token")
        .map(String::as_str)
        .or_else(|| bearer_token(&headers))
        .and_then(|token| state.db.authenticate(token));
    let Some(user) = user else {
        tracing::warn!("realtime connection refused: missing or invalid token");
        return StatusCode::FORBIDDEN.into_response();
    };

    // Subscribe before the handshake completes so no frame sent after the
    // client sees the upgrade can be missed.
    let (tx, rx) = mpsc::unbounded_channel();
    state.subscribe(user, tx);
    ws.on_upgrade(move |socket| handle_socket(socket, user, rx))
}

async fn handle_socket(
    socket: WebSocket,
    user: UserId,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    tracing::info!(user, "realtime socket open");
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Clients never send anything meaningful; read only to notice closure.
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }
    tracing::info!(user, "realtime socket closed");
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[allow(clippy::result_large_err)]
fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<UserId, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(unauthorized(
            "Authentication credentials were not provided.",
        ));
    };
    state
        .db
        .authenticate(token)
        .ok_or_else(|| unauthorized("Given token not valid for any token type"))
}

#[allow(clippy::result_large_err)]
fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": format!("invalid request body: {e}")})),
        )
            .into_response()
    })
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": detail, "code": "token_not_valid"})),
    )
        .into_response()
}

fn error_response(err: &StoreError) -> Response {
    match err {
        StoreError::UsernameTaken => (
            StatusCode::BAD_REQUEST,
            Json(json!({"username": [err.to_string()]})),
        )
            .into_response(),
        StoreError::InvalidField { field, message } => {
            let mut body = serde_json::Map::new();
            body.insert((*field).to_string(), json!([message]));
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
        StoreError::InvalidCredentials => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": err.to_string()})),
        )
            .into_response(),
        StoreError::InvalidToken => unauthorized("Token is invalid or expired"),
        StoreError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Not found."})),
        )
            .into_response(),
    }
}
