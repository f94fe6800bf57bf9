//! The facade UI code talks to.
//!
//! A [`Session`] wires a [`Transport`], a [`SessionView`] and either a
//! [`HostOrchestrator`] or a [`GuestClient`] together, and exposes one
//! surface for both roles: status accessors for rendering, intent senders,
//! and [`end_session`](Session::end_session).
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), tabsync::SyncError> {
//! use tabsync::transports::{MemoryConnector, MemoryTransport};
//! use tabsync::{Session, SessionConfig, TipMode};
//!
//! let transport = MemoryTransport::new(MemoryConnector::new(), SessionConfig::default());
//! let guest = Session::join(transport, "K7QX2M").await?;
//! guest.identify("ana", Some("Ana".into()))?;
//! guest.send_tip("ana", TipMode::Percentage, 18.0)?;
//!
//! let mut changes = guest.subscribe();
//! while changes.changed().await.is_ok() {
//!     let state = changes.borrow_and_update().clone();
//!     println!("{:?}: {:?}", state.connection_status, state.status_message);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::info;

use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::event::ConnectionStatus;
use crate::guest::GuestClient;
use crate::host::HostOrchestrator;
use crate::protocol::{GuestMessage, PersonId, Portions, SessionPhase, SyncPayload, TipMode};
use crate::store::SessionContext;
use crate::transport::{Role, Transport};
use crate::view::{Guest, SessionView, SessionViewState};

/// One live session on this device, as host or as guest.
pub struct Session {
    role: SessionRole,
    view: SessionView,
    transport: Arc<dyn Transport>,
}

enum SessionRole {
    Host(Arc<HostOrchestrator>),
    Guest(Arc<GuestClient>),
}

impl Session {
    /// Register a room and start serving `context` to guests.
    ///
    /// The orchestrator is listening before the room exists, so no guest
    /// connection can slip past it.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::start_host`] fails with. The transport is
    /// destroyed before returning.
    pub async fn host<T: Transport>(
        transport: T,
        context: SessionContext,
        config: SessionConfig,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let view = SessionView::new();
        let orchestrator = Arc::new(HostOrchestrator::new(
            Arc::clone(&transport),
            context.clone(),
            view.clone(),
            &config,
        ));
        orchestrator.start();

        let room_code = match transport.start_host().await {
            Ok(room_code) => room_code,
            Err(e) => {
                orchestrator.destroy();
                transport.destroy().await;
                return Err(e);
            }
        };
        info!(room_code = %room_code, "hosting session");
        view.go_live(Role::Host, Some(room_code));

        let weak = Arc::downgrade(&orchestrator);
        let teardown_transport = Arc::clone(&transport);
        view.set_teardown(move || {
            async move {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.destroy();
                }
                teardown_transport.destroy().await;
                context.teardown();
            }
            .boxed()
        });

        Ok(Self {
            role: SessionRole::Host(orchestrator),
            view,
            transport,
        })
    }

    /// Join the session behind `room_code`.
    ///
    /// # Errors
    ///
    /// [`SyncError::RoomNotFound`] if there is no such room,
    /// [`SyncError::ConnectionTimeout`] once every attempt has failed. The
    /// transport is destroyed before returning.
    pub async fn join<T: Transport>(transport: T, room_code: &str) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let view = SessionView::new();
        let client = Arc::new(GuestClient::new(Arc::clone(&transport), view.clone()));
        client.start();

        if let Err(e) = client.join(room_code).await {
            client.destroy();
            transport.destroy().await;
            return Err(e);
        }
        view.go_live(Role::Guest, Some(room_code.to_string()));

        let weak = Arc::downgrade(&client);
        let teardown_transport = Arc::clone(&transport);
        view.set_teardown(move || {
            async move {
                if let Some(client) = weak.upgrade() {
                    client.destroy();
                }
                teardown_transport.destroy().await;
            }
            .boxed()
        });

        Ok(Self {
            role: SessionRole::Guest(client),
            view,
            transport,
        })
    }

    // ── Rendering ───────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        match self.role {
            SessionRole::Host(_) => Role::Host,
            SessionRole::Guest(_) => Role::Guest,
        }
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn state(&self) -> SessionViewState {
        self.view.state()
    }

    /// Watch the view state; wakes on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionViewState> {
        self.view.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_live(&self) -> bool {
        self.view.read(|s| s.is_live)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.view.read(|s| s.connection_status)
    }

    pub fn status_message(&self) -> Option<String> {
        self.view.read(|s| s.status_message.clone())
    }

    /// (guest) The last snapshot received from the host.
    pub fn synced_state(&self) -> Option<SyncPayload> {
        self.view.read(|s| s.synced_state.clone())
    }

    /// (host) The roster.
    pub fn guests(&self) -> Vec<Guest> {
        self.view.read(|s| s.guests.clone())
    }

    pub fn phase(&self) -> SessionPhase {
        self.view.read(|s| s.phase)
    }

    pub fn room_code(&self) -> Option<String> {
        self.view.read(|s| s.room_code.clone())
    }

    pub fn my_person_id(&self) -> Option<PersonId> {
        self.view.read(|s| s.my_person_id.clone())
    }

    /// (host) The payload a broadcast would send right now.
    pub fn build_snapshot(&self) -> Option<SyncPayload> {
        match &self.role {
            SessionRole::Host(orchestrator) => Some(orchestrator.build_snapshot()),
            SessionRole::Guest(_) => None,
        }
    }

    // ── Intents ─────────────────────────────────────────────────────

    /// (guest) Bind this device to a participant.
    ///
    /// # Errors
    ///
    /// [`SyncError::WrongRole`] on the host.
    pub fn identify(&self, person_id: &str, display_name: Option<String>) -> Result<()> {
        match &self.role {
            SessionRole::Host(_) => Err(SyncError::WrongRole("host")),
            SessionRole::Guest(client) => client.identify(person_id, display_name),
        }
    }

    pub fn send_claim(&self, item_id: &str, person_id: &str) -> Result<()> {
        self.send(GuestMessage::ClaimItem {
            item_id: item_id.to_string(),
            person_id: person_id.to_string(),
        })
    }

    pub fn send_unclaim(&self, item_id: &str, person_id: &str) -> Result<()> {
        self.send(GuestMessage::UnclaimItem {
            item_id: item_id.to_string(),
            person_id: person_id.to_string(),
        })
    }

    pub fn send_set_assignees(
        &self,
        item_id: &str,
        person_ids: Vec<PersonId>,
        portions: Option<Portions>,
    ) -> Result<()> {
        self.send(GuestMessage::SetAssignees {
            item_id: item_id.to_string(),
            person_ids,
            portions,
        })
    }

    pub fn send_tip(&self, person_id: &str, mode: TipMode, value: f64) -> Result<()> {
        self.send(GuestMessage::SetTip {
            person_id: person_id.to_string(),
            mode,
            value,
        })
    }

    /// On a guest, queue `intent` for the host. On the host, apply it directly.
    pub fn send(&self, intent: GuestMessage) -> Result<()> {
        match &self.role {
            SessionRole::Host(orchestrator) => {
                orchestrator.apply_local(intent);
                Ok(())
            }
            SessionRole::Guest(client) => client.send(intent),
        }
    }

    /// (host) Move every device to `phase`.
    ///
    /// # Errors
    ///
    /// [`SyncError::WrongRole`] on a guest, [`SyncError::InvalidPhaseTransition`]
    /// if `phase` is not after the current one.
    pub fn advance_phase(&self, phase: SessionPhase) -> Result<()> {
        match &self.role {
            SessionRole::Host(orchestrator) => orchestrator.advance_phase(phase),
            SessionRole::Guest(_) => Err(SyncError::WrongRole("guest")),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Manual retry for the terminal error state.
    ///
    /// The host re-registers its room; a guest rejoins. Returns `Ok(false)`
    /// if a guest's attempts all failed again.
    pub async fn retry(&self) -> Result<bool> {
        match &self.role {
            SessionRole::Host(orchestrator) => orchestrator.retry().await.map(|_| true),
            SessionRole::Guest(client) => client.retry().await,
        }
    }

    /// Tear down the orchestrator or client and the transport, then reset
    /// the view. Idempotent.
    pub async fn end_session(&self) {
        self.view.end_session().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Session");
        s.field("role", &self.role());
        match &self.role {
            SessionRole::Host(orchestrator) => s.field("orchestrator", orchestrator),
            SessionRole::Guest(client) => s.field("client", client),
        };
        s.field("view", &self.view).finish()
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
    use crate::protocol::{BillItem, Participant};
    use crate::transports::{MemoryConnector, MemoryTransport};

    async fn pair() -> (MemoryConnector, Session, Session) {
        let connector = MemoryConnector::new();
        let config = SessionConfig::default();
        let context = SessionContext::new();
        context.init(
            vec![BillItem::new("soup", "Soup", 7.5)],
            vec![Participant::new("ana", "Ana")],
        );
        let host = Session::host(
            MemoryTransport::new(connector.clone(), config.clone()),
            context,
            config.clone(),
        )
        .await
        .unwrap();
        let room_code = host.room_code().unwrap();
        let guest = Session::join(MemoryTransport::new(connector.clone(), config), &room_code)
            .await
            .unwrap();
        (connector, host, guest)
    }

    #[tokio::test(start_paused = true)]
    async fn role_specific_operations_are_rejected_on_the_other_side() {
        let (_connector, host, guest) = pair().await;

        assert!(matches!(
            host.identify("ana", None),
            Err(SyncError::WrongRole("host"))
        ));
        assert!(matches!(
            guest.advance_phase(SessionPhase::Claiming),
            Err(SyncError::WrongRole("guest"))
        ));
        assert!(guest.build_snapshot().is_none());
        assert_eq!(host.role(), Role::Host);
        assert_eq!(guest.role(), Role::Guest);
    }

    #[tokio::test(start_paused = true)]
    async fn host_intents_apply_locally() {
        let (_connector, host, _guest) = pair().await;
        host.send_claim("soup", "ana").unwrap();
        let snapshot = host.build_snapshot().unwrap();
        assert_eq!(snapshot.assignments["soup"], vec!["ana"]);
    }

    #[tokio::test(start_paused = true)]
    async fn end_session_releases_the_room_and_resets_the_view() {
        let (connector, host, guest) = pair().await;
        let room_code = host.room_code().unwrap();

        host.end_session().await;
        host.end_session().await;
        // Aborted tasks drop their registration on the next scheduler pass.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(!host.is_live());
        assert_eq!(host.state(), SessionViewState::default());
        assert!(!connector.has_room(&room_code));
        assert!(host.build_snapshot().unwrap().items.is_empty());
        guest.end_session().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_destroys_the_transport() {
        let connector = MemoryConnector::new();
        let transport = MemoryTransport::new(connector, SessionConfig::default());
        let handle = transport.clone();

        let err = Session::join(transport, "ZZZZZZ").await.unwrap_err();
        assert!(matches!(err, SyncError::RoomNotFound { .. }));
        assert!(handle.is_destroyed());
    }
}
