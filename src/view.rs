//! Per-device view state for UI rendering.
//!
//! [`SessionView`] is a projection, not a source of truth: the host keeps
//! its guest roster and phase here, a guest keeps the last snapshot it
//! received. UI code reads it with [`SessionView::state`] or watches it with
//! [`SessionView::subscribe`].

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::event::ConnectionStatus;
use crate::lock;
use crate::protocol::{PeerId, PersonId, SessionPhase, SyncPayload};
use crate::store::Store;
use crate::transport::Role;

pub const CONNECTING_MESSAGE: &str = "Connecting…";
pub const RECONNECTING_MESSAGE: &str = "Reconnecting…";
/// (guest) The room is gone for good.
pub const ROOM_GONE_MESSAGE: &str = "This session has ended.";
/// (guest) Every setup attempt failed; the user may retry.
pub const RETRIES_EXHAUSTED_MESSAGE: &str = "Could not reach the host. Check your connection and retry.";
/// (host) Automatic re-registration failed; the user may retry.
pub const HOST_LOST_MESSAGE: &str =
    "Lost the connection. Guests cannot reach this session until you retry.";

/// One guest connection as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guest {
    pub peer_id: PeerId,
    /// `None` until the guest identifies.
    pub person_id: Option<PersonId>,
    pub display_name: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionViewState {
    pub is_live: bool,
    pub role: Option<Role>,
    pub room_code: Option<String>,
    pub phase: SessionPhase,
    pub connection_status: ConnectionStatus,
    /// Human-readable line for the connection banner.
    pub status_message: Option<String>,
    /// (host) Every guest connection this session has seen.
    pub guests: Vec<Guest>,
    /// (guest) The last snapshot received from the host.
    pub synced_state: Option<SyncPayload>,
    /// (guest) The participant this device identified as.
    pub my_person_id: Option<PersonId>,
}

impl SessionViewState {
    /// Participants bound to a currently connected guest, sorted and deduplicated.
    pub fn claimed_participant_ids(&self) -> Vec<PersonId> {
        let mut ids: Vec<PersonId> = self
            .guests
            .iter()
            .filter(|guest| guest.connected)
            .filter_map(|guest| guest.person_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn guest(&self, peer_id: &str) -> Option<&Guest> {
        self.guests.iter().find(|guest| guest.peer_id == peer_id)
    }
}

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Shared handle to one device's view state.
#[derive(Clone, Default)]
pub struct SessionView {
    state: Store<SessionViewState>,
    teardown: Arc<Mutex<Option<Teardown>>>,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionViewState {
        self.state.get_state()
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionViewState) -> R) -> R {
        self.state.read(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionViewState> {
        self.state.subscribe()
    }

    /// Mark the session live for `role`.
    pub fn go_live(&self, role: Role, room_code: Option<String>) {
        self.state.update(|s| {
            s.is_live = true;
            s.role = Some(role);
            s.room_code = room_code;
        });
    }

    pub fn set_room_code(&self, room_code: Option<String>) {
        self.state.update_if(|s| {
            let changed = s.room_code != room_code;
            s.room_code = room_code;
            changed
        });
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        self.state.update_if(|s| {
            let changed = s.phase != phase;
            s.phase = phase;
            changed
        });
    }

    /// Apply a status change. Returns `false` if the transition is not allowed.
    pub fn set_connection_status(&self, status: ConnectionStatus) -> bool {
        let mut allowed = true;
        self.state.update_if(|s| {
            if s.connection_status == status {
                return false;
            }
            allowed = s.connection_status.can_transition_to(status);
            if allowed {
                s.connection_status = status;
            }
            allowed
        });
        allowed
    }

    pub fn set_status_message(&self, message: Option<String>) {
        self.state.update_if(|s| {
            let changed = s.status_message != message;
            s.status_message = message;
            changed
        });
    }

    /// (host) Add a roster entry for a freshly connected guest.
    pub fn add_guest(&self, peer_id: &str) {
        self.state.update(|s| match s.guests.iter_mut().find(|g| g.peer_id == peer_id) {
            Some(guest) => guest.connected = true,
            None => s.guests.push(Guest {
                peer_id: peer_id.to_string(),
                person_id: None,
                display_name: None,
                connected: true,
            }),
        });
    }

    /// (host) Bind `peer_id` to `person_id`.
    ///
    /// Any *other* disconnected entry for the same person is removed, so a
    /// reconnect never leaves a ghost behind. Other entries that are still
    /// connected are kept.
    pub fn identify_guest(&self, peer_id: &str, person_id: &str, display_name: Option<String>) {
        self.state.update(|s| {
            let before = s.guests.len();
            s.guests.retain(|g| {
                g.peer_id == peer_id || g.connected || g.person_id.as_deref() != Some(person_id)
            });
            let removed = before - s.guests.len();
            if removed > 0 {
                debug!(person_id = %person_id, removed, "dropped stale roster entries");
            }

            match s.guests.iter_mut().find(|g| g.peer_id == peer_id) {
                Some(guest) => {
                    guest.person_id = Some(person_id.to_string());
                    guest.display_name = display_name;
                }
                None => s.guests.push(Guest {
                    peer_id: peer_id.to_string(),
                    person_id: Some(person_id.to_string()),
                    display_name,
                    connected: true,
                }),
            }
        });
    }

    /// (host) Flip a guest's `connected` flag off. The entry itself stays.
    pub fn mark_guest_disconnected(&self, peer_id: &str) -> bool {
        self.state.update_if(|s| {
            match s.guests.iter_mut().find(|g| g.peer_id == peer_id && g.connected) {
                Some(guest) => {
                    guest.connected = false;
                    true
                }
                None => false,
            }
        })
    }

    /// (guest) Replace the cached snapshot wholesale.
    pub fn apply_snapshot(&self, payload: SyncPayload) {
        self.state.update(|s| {
            s.phase = payload.phase;
            s.synced_state = Some(payload);
        });
    }

    pub fn set_my_person_id(&self, person_id: Option<PersonId>) {
        self.state.update(|s| s.my_person_id = person_id);
    }

    /// Store the callback [`end_session`](Self::end_session) runs before resetting.
    pub fn set_teardown<F>(&self, teardown: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        *lock(&self.teardown) = Some(Box::new(teardown));
    }

    /// Run the teardown callback, then reset every field. Idempotent.
    pub async fn end_session(&self) {
        let teardown = lock(&self.teardown).take();
        if let Some(teardown) = teardown {
            teardown().await;
        }
        self.state.update_if(|s| {
            if *s == SessionViewState::default() {
                return false;
            }
            *s = SessionViewState::default();
            true
        });
    }
}

impl std::fmt::Debug for SessionView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionView")
            .field("state", &self.state())
            .field("has_teardown", &lock(&self.teardown).is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reconnect_replaces_the_disconnected_entry() {
        let view = SessionView::new();
        view.add_guest("peer-1");
        view.identify_guest("peer-1", "ana", Some("Ana".into()));
        view.mark_guest_disconnected("peer-1");

        view.add_guest("peer-2");
        view.identify_guest("peer-2", "ana", Some("Ana".into()));

        let guests = view.state().guests;
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].peer_id, "peer-2");
        assert!(guests[0].connected);
    }

    #[test]
    fn connected_duplicates_are_kept() {
        let view = SessionView::new();
        view.add_guest("peer-1");
        view.identify_guest("peer-1", "ana", None);
        view.add_guest("peer-2");
        view.identify_guest("peer-2", "ana", None);

        let state = view.state();
        assert_eq!(state.guests.len(), 2);
        assert_eq!(state.claimed_participant_ids(), vec!["ana".to_string()]);
    }

    #[test]
    fn disconnect_keeps_the_entry_but_unclaims_the_person() {
        let view = SessionView::new();
        view.add_guest("peer-1");
        view.identify_guest("peer-1", "ben", None);
        assert!(view.mark_guest_disconnected("peer-1"));
        assert!(!view.mark_guest_disconnected("peer-1"));

        let state = view.state();
        assert_eq!(state.guests.len(), 1);
        assert!(state.claimed_participant_ids().is_empty());
    }

    #[test]
    fn reconnecting_requires_a_prior_connection() {
        let view = SessionView::new();
        assert!(!view.set_connection_status(ConnectionStatus::Reconnecting));
        assert!(view.set_connection_status(ConnectionStatus::Connecting));
        assert!(view.set_connection_status(ConnectionStatus::Connected));
        assert!(view.set_connection_status(ConnectionStatus::Reconnecting));
        assert_eq!(view.state().connection_status, ConnectionStatus::Reconnecting);
    }

    #[test]
    fn snapshot_replaces_cache_and_phase() {
        let view = SessionView::new();
        view.apply_snapshot(SyncPayload {
            phase: SessionPhase::Tips,
            ..SyncPayload::default()
        });
        let state = view.state();
        assert_eq!(state.phase, SessionPhase::Tips);
        assert!(state.synced_state.is_some());
    }

    #[tokio::test]
    async fn end_session_runs_teardown_once_and_resets() {
        let view = SessionView::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        view.set_teardown(move || {
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        view.go_live(Role::Host, Some("ABC123".into()));
        view.add_guest("peer-1");
        view.set_phase(SessionPhase::Claiming);

        view.end_session().await;
        view.end_session().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(view.state(), SessionViewState::default());
    }

    #[tokio::test]
    async fn end_session_on_fresh_view_is_a_noop() {
        let view = SessionView::new();
        let mut rx = view.subscribe();
        view.end_session().await;
        assert!(!rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
    }
}
