//! Request and response bodies of the `/auth/*` endpoints.

use serde::{Deserialize, Serialize};

/// Body of `POST /auth/login/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Account name (the client uses the email address).
    pub username: String,
    /// Plain-text password, sent over the API transport.
    pub password: String,
}

/// Body of `POST /auth/register/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Account name.
    pub username: String,
    /// Contact address.
    pub email: String,
    /// Plain-text password.
    pub password: String,
}

/// Response of `POST /auth/login/`: a fresh credential pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived access token, sent as a bearer credential.
    pub access: String,
    /// Long-lived refresh token, exchanged for new access tokens.
    pub refresh: String,
}

/// Body of `POST /auth/refresh/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// The stored refresh token.
    pub refresh: String,
}

/// Response of `POST /auth/refresh/`.
///
/// Servers that rotate refresh tokens return a new one alongside the access
/// token; others omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// The renewed access token.
    pub access: String,
    /// Replacement refresh token, when the server rotates them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}
