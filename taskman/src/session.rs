//! Per-user session context.
//!
//! A [`Session`] owns everything that is scoped to one signed-in user: the
//! credential store, the gateway with its refresh slot, and the reconciler
//! with its task store. Several sessions can coexist in one process; they
//! share nothing.

use std::sync::Arc;

use crate::api::RemoteApi;
use crate::credentials::CredentialStore;
use crate::gateway::AuthGateway;
use crate::realtime::{RealtimeClient, RealtimeConfig, RealtimeEvents};
use crate::tasks::Reconciler;
use crate::transport::HttpTransport;

/// One user's sync context.
pub struct Session<T> {
    credentials: Arc<CredentialStore>,
    reconciler: Arc<Reconciler<T>>,
}

impl<T: HttpTransport> Session<T> {
    /// Build a session sending through `transport` with tokens from
    /// `credentials`.
    pub fn new(transport: T, credentials: Arc<CredentialStore>) -> Self {
        let gateway = AuthGateway::new(transport, Arc::clone(&credentials));
        let api = Arc::new(RemoteApi::new(gateway));
        Self {
            credentials,
            reconciler: Arc::new(Reconciler::new(api)),
        }
    }

    /// The session's credential store.
    #[must_use]
    pub const fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// The remote API.
    #[must_use]
    pub fn api(&self) -> &Arc<RemoteApi<T>> {
        self.reconciler.api()
    }

    /// The reconciler and its task store.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<Reconciler<T>> {
        &self.reconciler
    }

    /// Whether the session holds an access credential.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_authenticated()
    }

    /// Open the realtime stream for this session. Each connection attempt
    /// uses the session's current access token.
    pub fn connect_realtime(&self, config: RealtimeConfig) -> (RealtimeClient, RealtimeEvents) {
        RealtimeClient::connect(config, Arc::clone(&self.credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::transport::ApiResponse;
    use crate::transport::scripted::ScriptedTransport;

    #[tokio::test]
    async fn sessions_do_not_share_credentials() {
        let make = || {
            Session::new(
                ScriptedTransport::new(|_, _| Ok(ApiResponse::empty(200))),
                Arc::new(CredentialStore::in_memory()),
            )
        };
        let ann = make();
        let bob = make();

        ann.credentials().set(Credential {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
        });
        assert!(ann.is_authenticated());
        assert!(!bob.is_authenticated());
        assert!(Arc::ptr_eq(ann.api().credentials(), ann.credentials()));
    }
}
