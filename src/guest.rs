//! The guest client: sends intents, renders whatever the host says.
//!
//! A guest never mutates shared state locally. Every `send_*` method only
//! queues an intent for the host; the visible effect arrives with the next
//! `SYNC_STATE`, which replaces the cached snapshot in the [`SessionView`]
//! wholesale.
//!
//! When the host link drops, the client reconnects on its own and sends
//! `IDENTIFY` again with the cached participant, so the host can replace the
//! stale roster entry instead of adding a second one.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::event::{ConnectionStatus, SubscriptionId, TransportEvent};
use crate::lock;
use crate::protocol::{GuestMessage, HostMessage, ItemId, PersonId, Portions, TipMode};
use crate::transport::Transport;
use crate::view::{
    SessionView, CONNECTING_MESSAGE, RECONNECTING_MESSAGE, RETRIES_EXHAUSTED_MESSAGE,
    ROOM_GONE_MESSAGE,
};

pub struct GuestClient {
    inner: Arc<GuestInner>,
    running: Mutex<Option<(SubscriptionId, JoinHandle<()>)>>,
}

struct GuestInner {
    transport: Arc<dyn Transport>,
    view: SessionView,
    room_code: Mutex<Option<String>>,
    /// Sent again after every reconnect.
    identity: Mutex<Option<Identity>>,
    /// Automatic reconnect in flight, if any.
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone)]
struct Identity {
    person_id: PersonId,
    display_name: Option<String>,
}

impl Identity {
    fn message(&self) -> GuestMessage {
        GuestMessage::Identify {
            person_id: self.person_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

impl GuestClient {
    pub fn new(transport: Arc<dyn Transport>, view: SessionView) -> Self {
        Self {
            inner: Arc::new(GuestInner {
                transport,
                view,
                room_code: Mutex::new(None),
                identity: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start following transport events. Calling it again does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let subscription = self.inner.transport.on();
        let task = tokio::spawn(run_events(Arc::clone(&self.inner), subscription.events));
        *running = Some((subscription.id, task));
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Join the room behind `room_code`.
    ///
    /// # Errors
    ///
    /// [`SyncError::RoomNotFound`] if there is no such room,
    /// [`SyncError::ConnectionTimeout`] once every attempt has failed.
    pub async fn join(&self, room_code: &str) -> Result<()> {
        *lock(&self.inner.room_code) = Some(room_code.to_string());
        self.inner
            .view
            .set_status_message(Some(CONNECTING_MESSAGE.to_string()));
        match self.inner.transport.join_as_guest(room_code).await {
            Ok(()) => {
                info!(room_code = %room_code, "joined session");
                self.inner.view.set_status_message(None);
                Ok(())
            }
            Err(e) => {
                self.inner.report_setup_failure(&e);
                Err(e)
            }
        }
    }

    /// Bind this device to `person_id`. The choice survives reconnects.
    pub fn identify(&self, person_id: &str, display_name: Option<String>) -> Result<()> {
        let identity = Identity {
            person_id: person_id.to_string(),
            display_name,
        };
        let message = identity.message();
        *lock(&self.inner.identity) = Some(identity);
        self.inner.view.set_my_person_id(Some(person_id.to_string()));
        self.inner.transport.send_to_host(&message)
    }

    pub fn person_id(&self) -> Option<PersonId> {
        lock(&self.inner.identity)
            .as_ref()
            .map(|identity| identity.person_id.clone())
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
            item_id: ItemId::from(item_id),
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

    /// Queue any intent for the host.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotConnected`] while there is no host link.
    pub fn send(&self, intent: GuestMessage) -> Result<()> {
        self.inner.transport.send_to_host(&intent)
    }

    /// Reconnect by hand, e.g. after automatic reconnection gave up.
    ///
    /// Returns `Ok(false)` if every attempt failed again.
    pub async fn retry(&self) -> Result<bool> {
        self.inner.reconnect().await
    }

    /// Detach from the transport. Safe to call more than once.
    pub fn destroy(&self) {
        self.inner.abort_reconnect();
        if let Some((subscription, task)) = lock(&self.running).take() {
            self.inner.transport.off(subscription);
            task.abort();
            debug!("guest client destroyed");
        }
    }
}

impl Drop for GuestClient {
    fn drop(&mut self) {
        self.inner.abort_reconnect();
        if let Some((_, task)) = lock(&self.running).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for GuestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestClient")
            .field("running", &self.is_running())
            .field("room_code", &*lock(&self.inner.room_code))
            .field("person_id", &self.person_id())
            .finish()
    }
}

impl GuestInner {
    fn report_setup_failure(&self, error: &SyncError) {
        let message = match error {
            SyncError::Destroyed => return,
            SyncError::RoomNotFound { .. } => ROOM_GONE_MESSAGE,
            _ => RETRIES_EXHAUSTED_MESSAGE,
        };
        warn!(error = %error, "could not reach the host");
        self.view.set_status_message(Some(message.to_string()));
    }

    async fn reconnect(&self) -> Result<bool> {
        let Some(room_code) = lock(&self.room_code).clone() else {
            return Err(SyncError::NotConnected);
        };
        self.view
            .set_status_message(Some(RECONNECTING_MESSAGE.to_string()));
        match self.transport.reconnect_to_host(&room_code).await {
            Ok(true) => {
                info!(room_code = %room_code, "reconnected to host");
                self.view.set_status_message(None);
                self.reidentify();
                Ok(true)
            }
            Ok(false) => {
                self.view
                    .set_status_message(Some(RETRIES_EXHAUSTED_MESSAGE.to_string()));
                Ok(false)
            }
            Err(e) => {
                self.report_setup_failure(&e);
                Err(e)
            }
        }
    }

    /// Start reconnecting in the background so the event loop keeps
    /// applying status and retry events meanwhile. Does nothing while a
    /// previous automatic reconnect is still running.
    fn spawn_reconnect(self: &Arc<Self>) {
        let mut task = lock(&self.reconnect_task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("reconnect already in flight");
            return;
        }
        self.view.set_connection_status(ConnectionStatus::Reconnecting);
        self.view
            .set_status_message(Some(RECONNECTING_MESSAGE.to_string()));
        let inner = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let _ = inner.reconnect().await;
        }));
    }

    fn abort_reconnect(&self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
    }

    fn reidentify(&self) {
        let Some(identity) = lock(&self.identity).clone() else {
            return;
        };
        debug!(person_id = %identity.person_id, "re-identifying after reconnect");
        if let Err(e) = self.transport.send_to_host(&identity.message()) {
            warn!(error = %e, "could not re-identify");
        }
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::HostMessage(HostMessage::SyncState { payload }) => {
                self.view.apply_snapshot(payload);
            }
            TransportEvent::HostMessage(HostMessage::PhaseChange { phase }) => {
                debug!(%phase, "host changed phase");
                self.view.set_phase(phase);
            }
            TransportEvent::StatusChange(status) => {
                self.view.set_connection_status(status);
            }
            TransportEvent::HostStale => warn!("host stopped responding"),
            TransportEvent::ConnectionError { kind, message } => {
                // Only a link lost while connected is ours to recover; setup
                // failures go back to whoever started the setup.
                if self.view.read(|s| s.connection_status) != ConnectionStatus::Connected {
                    debug!(%kind, message = %message, "connection error during setup");
                    return;
                }
                warn!(%kind, message = %message, "lost the host; reconnecting");
                self.spawn_reconnect();
            }
            TransportEvent::Retry {
                attempt,
                max_attempts,
                delay,
            } => debug!(attempt, max_attempts, ?delay, "retrying connection to host"),
            TransportEvent::Open { .. }
            | TransportEvent::GuestConnected { .. }
            | TransportEvent::GuestDisconnected { .. }
            | TransportEvent::GuestMessage { .. }
            | TransportEvent::GuestStale { .. } => {}
        }
    }
}

async fn run_events(inner: Arc<GuestInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event);
    }
    debug!("guest event stream ended");
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
    use crate::config::SessionConfig;
    use crate::link::{Connector, IncomingGuest, Link};
    use crate::protocol::{decode_frame, encode, Frame, SessionPhase, SyncPayload};
    use crate::link::HostRegistration;
    use crate::transport::Channel;
    use crate::transports::{MemoryConnector, MemoryTransport};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Dials wait until the gate is open.
    #[derive(Clone)]
    struct GatedConnector {
        inner: MemoryConnector,
        open: Arc<watch::Sender<bool>>,
    }

    impl GatedConnector {
        fn new(inner: MemoryConnector) -> Self {
            Self {
                inner,
                open: Arc::new(watch::channel(true).0),
            }
        }

        fn set_open(&self, open: bool) {
            self.open.send_replace(open);
        }
    }

    #[async_trait]
    impl Connector for GatedConnector {
        async fn host(&self, room_code: Option<&str>) -> Result<HostRegistration> {
            self.inner.host(room_code).await
        }

        async fn dial(&self, room_code: &str) -> Result<Box<dyn Link>> {
            let mut open = self.open.subscribe();
            let _ = open.wait_for(|open| *open).await;
            self.inner.dial(room_code).await
        }
    }

    /// A bare registration with no orchestrator, so tests see exactly what the guest sends.
    async fn raw_host(connector: &MemoryConnector) -> (String, mpsc::UnboundedReceiver<IncomingGuest>) {
        let registration = connector.host(None).await.unwrap();
        (registration.room_code, registration.incoming)
    }

    async fn next_intent(link: &mut Box<dyn Link>) -> GuestMessage {
        loop {
            let text = link.recv().await.unwrap().unwrap();
            if let Frame::Message(message) = decode_frame::<GuestMessage>(&text).unwrap() {
                return message;
            }
        }
    }

    fn client(connector: &MemoryConnector) -> (GuestClient, SessionView) {
        let config = SessionConfig::default()
            .with_max_attempts(2)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(10));
        let view = SessionView::new();
        let transport = Arc::new(MemoryTransport::new(connector.clone(), config));
        let client = GuestClient::new(transport, view.clone());
        client.start();
        (client, view)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_and_phase_changes_reach_the_view() {
        let connector = MemoryConnector::new();
        let (room_code, mut incoming) = raw_host(&connector).await;
        let (client, view) = client(&connector);

        client.join(&room_code).await.unwrap();
        let mut host_side = incoming.recv().await.unwrap().link;

        let payload = SyncPayload {
            phase: SessionPhase::Claiming,
            claimed_participant_ids: vec!["ana".into()],
            ..SyncPayload::default()
        };
        host_side
            .send(encode(&HostMessage::SyncState { payload: payload.clone() }).unwrap())
            .await
            .unwrap();
        host_side
            .send(encode(&HostMessage::PhaseChange { phase: SessionPhase::Tips }).unwrap())
            .await
            .unwrap();
        settle().await;

        let state = view.state();
        assert_eq!(state.synced_state, Some(payload));
        assert_eq!(state.phase, SessionPhase::Tips);
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.status_message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn intents_are_sent_not_applied() {
        let connector = MemoryConnector::new();
        let (room_code, mut incoming) = raw_host(&connector).await;
        let (client, view) = client(&connector);
        client.join(&room_code).await.unwrap();
        let mut host_side = incoming.recv().await.unwrap().link;

        client.identify("ben", Some("Ben".into())).unwrap();
        client.send_claim("soup", "ben").unwrap();
        client.send_tip("ben", TipMode::Fixed, 3.0).unwrap();

        assert!(matches!(next_intent(&mut host_side).await, GuestMessage::Identify { .. }));
        assert_eq!(
            next_intent(&mut host_side).await,
            GuestMessage::ClaimItem {
                item_id: "soup".into(),
                person_id: "ben".into()
            }
        );
        assert!(matches!(next_intent(&mut host_side).await, GuestMessage::SetTip { .. }));

        let state = view.state();
        assert_eq!(state.my_person_id.as_deref(), Some("ben"));
        assert!(state.synced_state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_and_identifies_again_after_a_dropped_link() {
        let connector = MemoryConnector::new();
        let (room_code, mut incoming) = raw_host(&connector).await;
        let (client, view) = client(&connector);
        client.join(&room_code).await.unwrap();
        let first = incoming.recv().await.unwrap();
        client.identify("ana", None).unwrap();

        connector.sever(&first.peer_id);
        drop(first);

        let mut second = incoming.recv().await.unwrap().link;
        assert_eq!(
            next_intent(&mut second).await,
            GuestMessage::Identify {
                person_id: "ana".into(),
                display_name: None
            }
        );
        settle().await;
        let state = view.state();
        assert_eq!(state.connection_status, ConnectionStatus::Connected);
        assert_eq!(state.status_message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn view_shows_reconnecting_while_the_dial_is_pending() {
        let connector = MemoryConnector::new();
        let (room_code, mut incoming) = raw_host(&connector).await;
        let gated = GatedConnector::new(connector.clone());
        let view = SessionView::new();
        let transport = Arc::new(Channel::new(gated.clone(), SessionConfig::default()));
        let client = GuestClient::new(transport, view.clone());
        client.start();
        client.join(&room_code).await.unwrap();
        let IncomingGuest { peer_id, link: _first } = incoming.recv().await.unwrap();
        let mut states = view.subscribe();
        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Connected)
            .await
            .unwrap();

        gated.set_open(false);
        assert!(connector.sever(&peer_id));
        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Reconnecting)
            .await
            .unwrap();

        // Well inside one attempt's timeout, the dial is still parked.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let state = view.state();
        assert_eq!(state.connection_status, ConnectionStatus::Reconnecting);
        assert_eq!(state.status_message.as_deref(), Some(RECONNECTING_MESSAGE));
        assert!(incoming.try_recv().is_err());

        gated.set_open(true);
        let _second = incoming.recv().await.unwrap();
        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Connected && s.status_message.is_none())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_room_ends_in_a_terminal_message() {
        let connector = MemoryConnector::new();
        let (room_code, mut incoming) = raw_host(&connector).await;
        let (client, view) = client(&connector);
        client.join(&room_code).await.unwrap();
        let _link = incoming.recv().await.unwrap();

        connector.close_room(&room_code);
        drop(incoming);
        settle().await;

        let state = view.state();
        assert_eq!(state.connection_status, ConnectionStatus::Error);
        assert_eq!(state.status_message.as_deref(), Some(ROOM_GONE_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn joining_a_missing_room_fails_fast() {
        let connector = MemoryConnector::new();
        let (client, view) = client(&connector);

        let err = client.join("NOPE42").await.unwrap_err();
        assert!(matches!(err, SyncError::RoomNotFound { .. }));
        assert_eq!(view.state().status_message.as_deref(), Some(ROOM_GONE_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn sending_before_joining_is_an_error() {
        let connector = MemoryConnector::new();
        let (client, _view) = client(&connector);
        assert!(matches!(
            client.send_claim("soup", "ana"),
            Err(SyncError::NotConnected)
        ));
        assert!(matches!(client.retry().await, Err(SyncError::NotConnected)));
        client.destroy();
        client.destroy();
        assert!(!client.is_running());
    }
}
