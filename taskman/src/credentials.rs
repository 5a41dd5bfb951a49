//! Credential store: the session's access/refresh tokens and cached profile.
//!
//! Three named slots (`taskman_auth`, `taskman_refresh`, `taskman_user`) are
//! kept in memory and, for durable stores, mirrored synchronously to a JSON
//! file so a session survives process restarts. Tokens are opaque strings and
//! are never inspected.
//!
//! Persistence failures are logged and otherwise ignored: the in-memory state
//! stays authoritative for the running process.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token attached to authenticated requests.
    pub access_token: String,
    /// Token exchanged for a new access token when the current one expires.
    pub refresh_token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Cached description of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Email address used to sign in.
    pub email: String,
    /// Display name.
    pub name: String,
}

impl Profile {
    /// Build a profile, defaulting the display name to the email's local part.
    #[must_use]
    pub fn from_email(email: &str, name: Option<&str>) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .map_or_else(
                || email.split('@').next().unwrap_or(email).to_string(),
                str::to_string,
            );
        Self {
            email: email.to_string(),
            name,
        }
    }
}

/// On-disk layout: one JSON object with the three named slots.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Slots {
    #[serde(rename = "taskman_auth", default, skip_serializing_if = "Option::is_none")]
    access: Option<String>,
    #[serde(
        rename = "taskman_refresh",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    refresh: Option<String>,
    #[serde(rename = "taskman_user", default, skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
}

/// Session credential store.
///
/// Every accessor is synchronous. Shared between the gateway, the realtime
/// client and the session via `Arc`.
pub struct CredentialStore {
    slots: Mutex<Slots>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl CredentialStore {
    /// A store that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            path: None,
        }
    }

    /// Open (or start) a durable store backed by the file at `path`.
    ///
    /// A missing file starts an empty session. An unreadable or corrupt file
    /// is logged and also treated as an empty session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let slots = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), err = %e, "corrupt session file, starting signed out");
                Slots::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Slots::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "unreadable session file, starting signed out");
                Slots::default()
            }
        };
        Self {
            slots: Mutex::new(slots),
            path: Some(path),
        }
    }

    /// The backing file, if this store is durable.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The current credential pair, if both tokens are present.
    #[must_use]
    pub fn get(&self) -> Option<Credential> {
        let slots = self.slots.lock();
        Some(Credential {
            access_token: slots.access.clone()?,
            refresh_token: slots.refresh.clone()?,
        })
    }

    /// Replace the credential pair wholesale.
    pub fn set(&self, credential: Credential) {
        let mut slots = self.slots.lock();
        slots.access = Some(credential.access_token);
        slots.refresh = Some(credential.refresh_token);
        self.persist(&slots);
    }

    /// The current access token.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.slots.lock().access.clone()
    }

    /// The current refresh token.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.slots.lock().refresh.clone()
    }

    /// Store a renewed access token, and the rotated refresh token if the
    /// server issued one.
    pub fn renew(&self, access_token: String, rotated_refresh: Option<String>) {
        let mut slots = self.slots.lock();
        slots.access = Some(access_token);
        if let Some(refresh) = rotated_refresh {
            slots.refresh = Some(refresh);
        }
        self.persist(&slots);
    }

    /// Drop both tokens and the cached profile.
    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        *slots = Slots::default();
        self.persist(&slots);
    }

    /// Whether an access token is held.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.slots.lock().access.is_some()
    }

    /// The cached profile of the signed-in user.
    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.slots.lock().profile.clone()
    }

    /// Cache the signed-in user's profile.
    pub fn set_profile(&self, profile: Profile) {
        let mut slots = self.slots.lock();
        slots.profile = Some(profile);
        self.persist(&slots);
    }

    /// Write `slots` to disk. Called with the lock held so writes land in
    /// mutation order.
    fn persist(&self, slots: &Slots) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomically(path, slots) {
            tracing::warn!(path = %path.display(), err = %e, "failed to persist session");
        }
    }
}

/// Default location of the durable session file.
///
/// Returns `None` when the platform has no data directory.
#[must_use]
pub fn default_session_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("taskman").join("session.json"))
}

fn write_atomically(path: &Path, slots: &Slots) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(slots).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(access: &str, refresh: &str) -> Credential {
        Credential {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
        }
    }

    #[test]
    fn empty_store_has_no_credential() {
        let store = CredentialStore::in_memory();
        assert!(store.get().is_none());
        assert!(!store.is_authenticated());
        assert!(store.profile().is_none());
    }

    #[test]
    fn set_then_get() {
        let store = CredentialStore::in_memory();
        store.set(pair("a1", "r1"));
        assert_eq!(store.get(), Some(pair("a1", "r1")));
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[test]
    fn renew_keeps_refresh_unless_rotated() {
        let store = CredentialStore::in_memory();
        store.set(pair("a1", "r1"));

        store.renew("a2".to_string(), None);
        assert_eq!(store.get(), Some(pair("a2", "r1")));

        store.renew("a3".to_string(), Some("r2".to_string()));
        assert_eq!(store.get(), Some(pair("a3", "r2")));
    }

    #[test]
    fn clear_drops_profile_too() {
        let store = CredentialStore::in_memory();
        store.set(pair("a1", "r1"));
        store.set_profile(Profile::from_email("ann@example.com", None));

        store.clear();
        assert!(store.get().is_none());
        assert!(store.profile().is_none());
    }

    #[test]
    fn profile_name_defaults_to_local_part() {
        let profile = Profile::from_email("ann@example.com", None);
        assert_eq!(profile.name, "ann");

        let profile = Profile::from_email("ann@example.com", Some("Ann B"));
        assert_eq!(profile.name, "Ann B");

        let profile = Profile::from_email("ann@example.com", Some("  "));
        assert_eq!(profile.name, "ann");
    }

    #[test]
    fn durable_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = CredentialStore::open(&path);
        store.set(pair("a1", "r1"));
        store.set_profile(Profile::from_email("ann@example.com", None));
        drop(store);

        let reopened = CredentialStore::open(&path);
        assert_eq!(reopened.get(), Some(pair("a1", "r1")));
        assert_eq!(reopened.profile().unwrap().name, "ann");
    }

    #[test]
    fn file_uses_named_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::open(&path);
        store.set(pair("a1", "r1"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["taskman_auth"], "a1");
        assert_eq!(raw["taskman_refresh"], "r1");
        assert!(raw.get("taskman_user").is_none());
    }

    #[test]
    fn cleared_store_stays_cleared_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = CredentialStore::open(&path);
        store.set(pair("a1", "r1"));
        store.clear();

        assert!(CredentialStore::open(&path).get().is_none());
    }

    #[test]
    fn corrupt_file_starts_signed_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = CredentialStore::open(&path);
        assert!(store.get().is_none());

        store.set(pair("a1", "r1"));
        assert_eq!(CredentialStore::open(&path).get(), Some(pair("a1", "r1")));
    }

    #[test]
    fn debug_redacts_tokens() {
        let debug = format!("{:?}", pair("secret-a", "secret-r"));
        assert!(!debug.contains("secret"));
    }
}
