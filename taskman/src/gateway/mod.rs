//! Auth gateway: every authenticated call to the task API goes through here.
//!
//! The gateway attaches the session's access credential, and when the server
//! answers 401 it renews the credential through a single-flight refresh
//! shared by every concurrently failing request, then retries the original
//! request exactly once. A retried request that is still unauthorized ends
//! the session instead of refreshing again.

mod refresh;

use std::sync::Arc;

use taskman_proto::auth::{RefreshRequest, RefreshResponse};

use crate::api::paths;
use crate::credentials::CredentialStore;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, TransportError};

use refresh::{FlightRole, RefreshFlight};

/// Errors surfaced by the gateway and the API built on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The server could not be reached. Nothing was changed.
    #[error("network error: {0}")]
    Network(String),

    /// The session is no longer valid; the user has to sign in again.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server refused the request (validation, not found, server error).
    /// Status and body are passed through unchanged.
    #[error("request rejected with status {status}: {detail}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        detail: String,
    },

    /// A success response whose body could not be understood.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        Self::Network(err.to_string())
    }
}

/// Which send of a request is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// Authenticated request pipeline for one session.
///
/// Owns the session's refresh slot; the credential store is shared with the
/// rest of the session.
pub struct AuthGateway<T> {
    transport: T,
    credentials: Arc<CredentialStore>,
    flight: RefreshFlight,
}

impl<T: HttpTransport> AuthGateway<T> {
    /// Create a gateway sending through `transport` on behalf of the session
    /// whose tokens live in `credentials`.
    pub fn new(transport: T, credentials: Arc<CredentialStore>) -> Self {
        Self {
            transport,
            credentials,
            flight: RefreshFlight::default(),
        }
    }

    /// The session's credential store.
    #[must_use]
    pub const fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Number of refresh flights this gateway has started.
    #[must_use]
    pub fn refresh_flights(&self) -> u64 {
        self.flight.flights_started()
    }

    /// Send an authenticated request.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Network`] on transport failure (no refresh attempted).
    /// - [`ApiError::Authentication`] if the credential could not be renewed,
    ///   or the retried request was still unauthorized. The credential store
    ///   has been cleared in both cases.
    /// - [`ApiError::Rejected`] for any other non-2xx status.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut bearer = self.credentials.access_token();
        let mut attempt = Attempt::First;

        loop {
            let response = self.transport.send(request, bearer.as_deref()).await?;
            if !response.is_unauthorized() {
                return check_status(response);
            }

            match attempt {
                Attempt::First => {
                    tracing::debug!(method = %request.method, path = %request.path, "unauthorized, renewing credential");
                    bearer = Some(self.renew(bearer.as_deref()).await?);
                    attempt = Attempt::Retry;
                }
                Attempt::Retry => {
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path,
                        "still unauthorized after renewing credential, ending session"
                    );
                    self.credentials.clear();
                    return Err(ApiError::Authentication(
                        "request still unauthorized after credential refresh".to_string(),
                    ));
                }
            }
        }
    }

    /// Send a request without credentials and without refresh handling.
    ///
    /// Used for login, registration and the refresh call itself.
    ///
    /// # Errors
    ///
    /// [`ApiError::Network`] on transport failure, [`ApiError::Authentication`]
    /// on 401 (the credential store is left untouched), [`ApiError::Rejected`]
    /// for other non-2xx statuses.
    pub async fn execute_anonymous(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.transport.send(request, None).await?;
        if response.is_unauthorized() {
            return Err(ApiError::Authentication(response.text()));
        }
        check_status(response)
    }

    /// Obtain a renewed access token, joining or leading the session's
    /// refresh flight.
    async fn renew(&self, rejected: Option<&str>) -> Result<String, ApiError> {
        let outcome = match self.flight.join(rejected, &self.credentials) {
            FlightRole::AlreadyRenewed(token) => Ok(token),
            FlightRole::Follower(rx) => refresh::follow(rx).await,
            FlightRole::Leader(leader) => {
                let outcome = self.refresh_credential().await;
                leader.land(outcome.clone());
                outcome
            }
        };
        outcome.map_err(ApiError::Authentication)
    }

    /// Call the refresh endpoint once and update the credential store.
    ///
    /// On any failure the store is cleared, which signs the session out.
    async fn refresh_credential(&self) -> Result<String, String> {
        let outcome = match self.credentials.refresh_token() {
            Some(refresh) => self.request_refresh(refresh).await,
            None => Err("no refresh credential".to_string()),
        };

        match outcome {
            Ok(renewed) => {
                tracing::info!(rotated = renewed.refresh.is_some(), "access credential renewed");
                self.credentials.renew(renewed.access.clone(), renewed.refresh);
                Ok(renewed.access)
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "credential refresh failed, ending session");
                self.credentials.clear();
                Err(reason)
            }
        }
    }

    async fn request_refresh(&self, refresh: String) -> Result<RefreshResponse, String> {
        let request = ApiRequest::post(paths::REFRESH, &RefreshRequest { refresh })
            .map_err(|e| format!("could not encode refresh request: {e}"))?;
        let response = self
            .transport
            .send(&request, None)
            .await
            .map_err(|e| format!("refresh request failed: {e}"))?;
        if !response.is_success() {
            return Err(format!("refresh rejected with status {}", response.status));
        }
        response
            .decode()
            .map_err(|e| format!("undecodable refresh response: {e}"))
    }
}

fn check_status(response: ApiResponse) -> Result<ApiResponse, ApiError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ApiError::Rejected {
            status: response.status,
            detail: response.text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::credentials::Credential;
    use crate::transport::Method;
    use crate::transport::scripted::ScriptedTransport;

    fn signed_in(access: &str, refresh: &str) -> Arc<CredentialStore> {
        let store = Arc::new(CredentialStore::in_memory());
        store.set(Credential {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
        });
        store
    }

    /// A server that accepts only `valid` and renews `refresh` into `valid`.
    fn server(valid: &'static str) -> ScriptedTransport {
        ScriptedTransport::new(move |req, bearer| {
            if req.path == paths::REFRESH {
                let body = req.body.clone().unwrap_or_default();
                return Ok(if body["refresh"] == "r" {
                    ApiResponse::json(200, &serde_json::json!({"access": valid}))
                } else {
                    ApiResponse::json(401, &serde_json::json!({"detail": "bad refresh"}))
                });
            }
            Ok(if bearer == Some(valid) {
                ApiResponse::json(200, &serde_json::json!([]))
            } else {
                ApiResponse::json(401, &serde_json::json!({"detail": "expired"}))
            })
        })
    }

    #[tokio::test]
    async fn attaches_current_access_token() {
        let transport = server("a1");
        let log = transport.call_log();
        let gateway = AuthGateway::new(transport, signed_in("a1", "r"));

        let resp = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(log.calls()[0].bearer.as_deref(), Some("a1"));
        assert_eq!(gateway.refresh_flights(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_request_retried_once() {
        let transport = server("new");
        let log = transport.call_log();
        let credentials = signed_in("old", "r");
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));

        let resp = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap();
        assert_eq!(resp.status, 200);

        let calls = log.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].bearer.as_deref(), Some("old"));
        assert_eq!(calls[1].path, paths::REFRESH);
        assert_eq!(calls[1].bearer, None);
        assert_eq!(calls[2].bearer.as_deref(), Some("new"));
        assert_eq!(credentials.access_token().as_deref(), Some("new"));
        assert_eq!(credentials.refresh_token().as_deref(), Some("r"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_share_one_refresh() {
        let transport = server("new").with_latency(Method::Post, paths::REFRESH, Duration::from_millis(50));
        let log = transport.call_log();
        let gateway = Arc::new(AuthGateway::new(transport, signed_in("old", "r")));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway.execute(&ApiRequest::get(paths::TASKS)).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, 200);
        }

        assert_eq!(log.count(Method::Post, paths::REFRESH), 1);
        assert_eq!(gateway.refresh_flights(), 1);
        let retries: Vec<_> = log
            .calls()
            .into_iter()
            .filter(|c| c.path == paths::TASKS && c.bearer.as_deref() == Some("new"))
            .collect();
        assert_eq!(retries.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn late_rejection_after_refresh_reuses_new_token() {
        let transport = server("new")
            .with_latency(Method::Get, "/tasks/slow", Duration::from_millis(100))
            .with_latency(Method::Post, paths::REFRESH, Duration::from_millis(10));
        let log = transport.call_log();
        let gateway = Arc::new(AuthGateway::new(transport, signed_in("old", "r")));

        let slow = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.execute(&ApiRequest::get("/tasks/slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap();

        assert_eq!(slow.await.unwrap().unwrap().status, 200);
        assert_eq!(log.count(Method::Post, paths::REFRESH), 1);
    }

    #[tokio::test]
    async fn second_unauthorized_clears_session_without_another_refresh() {
        // Refresh succeeds but the renewed token is never accepted.
        let transport = ScriptedTransport::new(|req, _| {
            Ok(if req.path == paths::REFRESH {
                ApiResponse::json(200, &serde_json::json!({"access": "useless"}))
            } else {
                ApiResponse::empty(401)
            })
        });
        let log = transport.call_log();
        let credentials = signed_in("old", "r");
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));

        let err = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
        assert_eq!(log.count(Method::Post, paths::REFRESH), 1);
        assert_eq!(log.count(Method::Get, paths::TASKS), 2);
        assert!(credentials.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_clears_session_and_fails_every_waiter() {
        let transport = server("new").with_latency(Method::Post, paths::REFRESH, Duration::from_millis(50));
        let log = transport.call_log();
        let credentials = signed_in("old", "wrong");
        credentials.set_profile(crate::credentials::Profile::from_email("a@b.c", None));
        let gateway = Arc::new(AuthGateway::new(transport, Arc::clone(&credentials)));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway.execute(&ApiRequest::get(paths::TASKS)).await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(ApiError::Authentication(_))
            ));
        }

        assert_eq!(log.count(Method::Post, paths::REFRESH), 1);
        assert_eq!(log.count(Method::Get, paths::TASKS), 5, "no request is retried");
        assert!(credentials.get().is_none());
        assert!(credentials.profile().is_none());
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_calling_server() {
        let transport = server("new");
        let log = transport.call_log();
        let gateway = AuthGateway::new(transport, Arc::new(CredentialStore::in_memory()));

        let err = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
        assert_eq!(log.count(Method::Post, paths::REFRESH), 0);
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_stored() {
        let transport = ScriptedTransport::new(|req, bearer| {
            Ok(if req.path == paths::REFRESH {
                ApiResponse::json(200, &serde_json::json!({"access": "a2", "refresh": "r2"}))
            } else if bearer == Some("a2") {
                ApiResponse::empty(204)
            } else {
                ApiResponse::empty(401)
            })
        });
        let credentials = signed_in("a1", "r1");
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));

        gateway.execute(&ApiRequest::delete("/tasks/1/")).await.unwrap();
        assert_eq!(credentials.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn network_errors_do_not_refresh() {
        let transport =
            ScriptedTransport::new(|_, _| Err(TransportError::Connect("refused".to_string())));
        let log = transport.call_log();
        let credentials = signed_in("a1", "r");
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));

        let err = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
        assert_eq!(log.calls().len(), 1);
        assert!(credentials.get().is_some());
    }

    #[tokio::test]
    async fn other_failures_pass_through_unchanged() {
        let transport = ScriptedTransport::new(|_, _| {
            Ok(ApiResponse::json(400, &serde_json::json!({"title": ["This field is required."]})))
        });
        let gateway = AuthGateway::new(transport, signed_in("a1", "r"));

        let err = gateway.execute(&ApiRequest::get(paths::TASKS)).await.unwrap_err();
        assert_eq!(
            err,
            ApiError::Rejected {
                status: 400,
                detail: r#"{"title":["This field is required."]}"#.to_string(),
            }
        );
    }

    #[tokio::test]
    async fn anonymous_unauthorized_leaves_store_alone() {
        let transport = ScriptedTransport::new(|_, _| Ok(ApiResponse::empty(401)));
        let log = transport.call_log();
        let credentials = signed_in("a1", "r");
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));

        let login = ApiRequest::post(paths::LOGIN, &serde_json::json!({})).unwrap();
        let err = gateway.execute_anonymous(&login).await.unwrap_err();
        assert!(matches!(err, ApiError::Authentication(_)));
        assert_eq!(log.calls()[0].bearer, None);
        assert_eq!(log.calls().len(), 1);
        assert!(credentials.get().is_some());
    }
}
