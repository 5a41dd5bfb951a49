//! Single-flight coordination of credential refreshes.
//!
//! At most one refresh is outstanding per session. The first caller to need a
//! refresh becomes the flight's leader and performs it; everyone arriving
//! while it is airborne follows it and receives the same outcome.
//!
//! # Invariant
//!
//! The leader stores the renewed credential *before* the flight is landed
//! (slot cleared), and the slot is inspected under the same lock as the
//! credential comparison. A caller whose 401 arrives after a flight already
//! landed therefore sees a fresh credential and reuses it instead of starting
//! a second flight.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::credentials::CredentialStore;

/// Result of a refresh: the renewed access token, or why it failed.
pub(crate) type FlightOutcome = Result<String, String>;

type OutcomeReceiver = watch::Receiver<Option<FlightOutcome>>;

/// What a caller that needs a renewed credential should do.
pub(crate) enum FlightRole<'a> {
    /// The stored credential already differs from the rejected one.
    AlreadyRenewed(String),
    /// A refresh is in the air; wait for its outcome.
    Follower(OutcomeReceiver),
    /// No refresh is in the air; perform it and land the flight.
    Leader(FlightLeader<'a>),
}

/// The session's refresh slot.
#[derive(Default)]
pub(crate) struct RefreshFlight {
    slot: Mutex<Option<OutcomeReceiver>>,
    started: AtomicU64,
}

impl RefreshFlight {
    /// Join the current flight, start a new one, or skip it entirely.
    ///
    /// `rejected` is the access token the failing request was sent with.
    pub(crate) fn join(&self, rejected: Option<&str>, credentials: &CredentialStore) -> FlightRole<'_> {
        let mut slot = self.slot.lock();
        if let Some(rx) = slot.as_ref() {
            return FlightRole::Follower(rx.clone());
        }
        if let Some(current) = credentials.access_token()
            && Some(current.as_str()) != rejected
        {
            return FlightRole::AlreadyRenewed(current);
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx);
        self.started.fetch_add(1, Ordering::Relaxed);
        FlightRole::Leader(FlightLeader {
            flight: self,
            tx: Some(tx),
        })
    }

    /// Number of flights started since this session began.
    pub(crate) fn flights_started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Whether a refresh is currently outstanding.
    pub(crate) fn in_flight(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn clear(&self) {
        self.slot.lock().take();
    }
}

/// Exclusive right to perform the current refresh.
///
/// Dropping a leader without landing it (its future was cancelled) clears the
/// slot; followers then observe the closed channel and fail.
pub(crate) struct FlightLeader<'a> {
    flight: &'a RefreshFlight,
    tx: Option<watch::Sender<Option<FlightOutcome>>>,
}

impl FlightLeader<'_> {
    /// Publish the outcome to every follower and free the slot.
    pub(crate) fn land(mut self, outcome: FlightOutcome) {
        self.flight.clear();
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for FlightLeader<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!("refresh flight abandoned before landing");
            self.flight.clear();
        }
    }
}

/// Wait for the flight `rx` belongs to and return its outcome.
pub(crate) async fn follow(mut rx: OutcomeReceiver) -> FlightOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome
            .clone()
            .unwrap_or_else(|| Err("refresh produced no outcome".to_string())),
        Err(_) => Err("credential refresh abandoned".to_string()),
    }
}
