//! Typed task API on top of the auth gateway.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use taskman_proto::auth::{LoginRequest, RegisterRequest, TokenPair};
use taskman_proto::task::{NewTask, Task, TaskId, TaskPatch};

use crate::credentials::{Credential, CredentialStore, Profile};
use crate::gateway::{ApiError, AuthGateway};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport};

/// Endpoint paths, relative to the API base.
pub mod paths {
    use taskman_proto::task::TaskId;

    /// `POST` credentials, receive a token pair.
    pub const LOGIN: &str = "/auth/login/";
    /// `POST` a new account.
    pub const REGISTER: &str = "/auth/register/";
    /// `POST` a refresh token, receive a new access token.
    pub const REFRESH: &str = "/auth/refresh/";
    /// Task collection.
    pub const TASKS: &str = "/tasks/";

    /// Path of a single task.
    #[must_use]
    pub fn task(id: &TaskId) -> String {
        format!("{TASKS}{id}/")
    }
}

/// The task API of one session.
pub struct RemoteApi<T> {
    gateway: AuthGateway<T>,
}

impl<T: HttpTransport> RemoteApi<T> {
    /// Wrap a gateway.
    pub const fn new(gateway: AuthGateway<T>) -> Self {
        Self { gateway }
    }

    /// The underlying gateway.
    #[must_use]
    pub const fn gateway(&self) -> &AuthGateway<T> {
        &self.gateway
    }

    /// The session's credential store.
    #[must_use]
    pub const fn credentials(&self) -> &Arc<CredentialStore> {
        self.gateway.credentials()
    }

    /// Sign in with an email address and password, storing the issued
    /// credential pair and a profile derived from the email.
    ///
    /// # Errors
    ///
    /// [`ApiError::Authentication`] for wrong credentials, otherwise as
    /// [`AuthGateway::execute_anonymous`].
    pub async fn login(&self, email: &str, password: &str) -> Result<Profile, ApiError> {
        self.sign_in(email, password, None).await
    }

    /// Create an account, then sign in with it.
    ///
    /// The email doubles as the account's username. `name` becomes the
    /// profile's display name when given.
    ///
    /// # Errors
    ///
    /// [`ApiError::Rejected`] if the server refuses the registration (e.g.
    /// the account exists), otherwise as [`RemoteApi::login`].
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<Profile, ApiError> {
        let body = RegisterRequest {
            username: email.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        self.gateway
            .execute_anonymous(&encode(ApiRequest::post(paths::REGISTER, &body))?)
            .await?;
        tracing::info!(email, "account registered");
        self.sign_in(email, password, name).await
    }

    /// Forget the session's credentials and profile.
    pub fn logout(&self) {
        self.credentials().clear();
        tracing::info!("signed out");
    }

    /// Fetch every task visible to the session.
    ///
    /// # Errors
    ///
    /// As [`AuthGateway::execute`], or [`ApiError::Protocol`] if the body is
    /// not a task list.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
        let response = self.gateway.execute(&ApiRequest::get(paths::TASKS)).await?;
        decode_body(&response)
    }

    /// Create a task and return the server's record of it.
    ///
    /// # Errors
    ///
    /// As [`RemoteApi::list_tasks`].
    pub async fn create_task(&self, task: &NewTask) -> Result<Task, ApiError> {
        let request = encode(ApiRequest::post(paths::TASKS, task))?;
        let response = self.gateway.execute(&request).await?;
        decode_body(&response)
    }

    /// Apply a partial update and return the server's record.
    ///
    /// # Errors
    ///
    /// As [`RemoteApi::list_tasks`].
    pub async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task, ApiError> {
        let request = encode(ApiRequest::patch(paths::task(id), patch))?;
        let response = self.gateway.execute(&request).await?;
        decode_body(&response)
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// As [`AuthGateway::execute`].
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError> {
        self.gateway
            .execute(&ApiRequest::delete(paths::task(id)))
            .await?;
        Ok(())
    }

    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<Profile, ApiError> {
        let body = LoginRequest {
            username: email.to_string(),
            password: password.to_string(),
        };
        let response = self
            .gateway
            .execute_anonymous(&encode(ApiRequest::post(paths::LOGIN, &body))?)
            .await?;
        let pair: TokenPair = decode_body(&response)?;

        let credentials = self.credentials();
        credentials.set(Credential {
            access_token: pair.access,
            refresh_token: pair.refresh,
        });
        let profile = Profile::from_email(email, name);
        credentials.set_profile(profile.clone());
        tracing::info!(email, "signed in");
        Ok(profile)
    }
}

fn encode(request: Result<ApiRequest, serde_json::Error>) -> Result<ApiRequest, ApiError> {
    request.map_err(|e| ApiError::Protocol(format!("could not encode request: {e}")))
}

fn decode_body<R: DeserializeOwned>(response: &ApiResponse) -> Result<R, ApiError> {
    response
        .decode()
        .map_err(|e| ApiError::Protocol(format!("undecodable response body: {e}")))
}
