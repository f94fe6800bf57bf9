//! The host orchestrator: where guest intents become authoritative state,
//! and authoritative state becomes outbound snapshots.
//!
//! [`HostOrchestrator::start`] subscribes to the transport's events and to
//! every store in the [`SessionContext`]. From then on:
//!
//! - a guest connecting gets a roster entry and an immediate snapshot
//! - a guest identifying gets bound to a participant, an immediate snapshot,
//!   and everyone else a debounced one
//! - any store change (from a guest intent or from the host's own UI)
//!   triggers a debounced broadcast
//! - [`advance_phase`](HostOrchestrator::advance_phase) bypasses the debounce
//!   and sends `PHASE_CHANGE` followed by `SYNC_STATE` right away
//! - losing the room re-registers it under the same code in the background;
//!   if that fails, [`retry`](HostOrchestrator::retry) tries again by hand

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::debounce::Debouncer;
use crate::error::{Result, SyncError};
use crate::event::{ConnectionStatus, SubscriptionId, TransportEvent};
use crate::lock;
use crate::protocol::{GuestMessage, HostMessage, SessionPhase, SyncPayload, TipChoice};
use crate::snapshot::build_snapshot;
use crate::store::SessionContext;
use crate::transport::Transport;
use crate::view::{SessionView, HOST_LOST_MESSAGE, RECONNECTING_MESSAGE};

pub struct HostOrchestrator {
    inner: Arc<HostInner>,
    running: Mutex<Option<Running>>,
}

struct HostInner {
    transport: Arc<dyn Transport>,
    context: SessionContext,
    view: SessionView,
    broadcaster: Debouncer,
    marks: Arc<ChangeMarks>,
    /// Set when automatic re-registration failed.
    gave_up: AtomicBool,
    /// Automatic re-registration in flight, if any.
    reregister_task: Mutex<Option<JoinHandle<()>>>,
}

/// Everything `start()` acquires and `destroy()` releases.
struct Running {
    subscription: SubscriptionId,
    events: JoinHandle<()>,
    watchers: Vec<JoinHandle<()>>,
}

impl HostOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        context: SessionContext,
        view: SessionView,
        config: &SessionConfig,
    ) -> Self {
        let marks = Arc::new(ChangeMarks::new(&context));
        let broadcaster = {
            let (transport, context, view, marks) = (
                Arc::clone(&transport),
                context.clone(),
                view.clone(),
                Arc::clone(&marks),
            );
            Debouncer::new(config.broadcast_debounce, move || {
                marks.take();
                broadcast_snapshot(transport.as_ref(), &context, &view);
            })
        };
        Self {
            inner: Arc::new(HostInner {
                transport,
                context,
                view,
                broadcaster,
                marks,
                gave_up: AtomicBool::new(false),
                reregister_task: Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start listening to transport events and store changes. Calling it
    /// again while running does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let subscription = self.inner.transport.on();
        let context = &self.inner.context;
        let watchers = vec![
            watch_store(context.items.subscribe(), Arc::clone(&self.inner)),
            watch_store(context.participants.subscribe(), Arc::clone(&self.inner)),
            watch_store(context.assignments.subscribe(), Arc::clone(&self.inner)),
            watch_store(context.tips.subscribe(), Arc::clone(&self.inner)),
        ];
        let events = tokio::spawn(run_events(Arc::clone(&self.inner), subscription.events));
        *running = Some(Running {
            subscription: subscription.id,
            events,
            watchers,
        });
        debug!("host orchestrator started");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// The payload a broadcast would send right now.
    pub fn build_snapshot(&self) -> SyncPayload {
        self.inner.snapshot()
    }

    /// Schedule a debounced broadcast of the current snapshot.
    pub fn broadcast_state(&self) {
        self.inner.broadcaster.trigger();
    }

    /// Send a pending debounced broadcast now. Returns `true` if one was pending.
    pub fn flush(&self) -> bool {
        self.inner.broadcaster.flush()
    }

    /// Apply an intent from the host's own UI.
    ///
    /// Goes through the same path as guest intents; `IDENTIFY` has no
    /// meaning for the host and is ignored.
    pub fn apply_local(&self, intent: GuestMessage) {
        self.inner.apply_intent(None, intent);
    }

    /// Move the workflow forward to `phase`.
    ///
    /// Guests receive `PHASE_CHANGE` and then a full `SYNC_STATE` immediately,
    /// bypassing the debounce.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidPhaseTransition`] if `phase` is not after the current one.
    pub fn advance_phase(&self, phase: SessionPhase) -> Result<()> {
        let current = self.inner.view.read(|s| s.phase);
        if phase <= current {
            return Err(SyncError::InvalidPhaseTransition {
                from: current,
                to: phase,
            });
        }
        self.inner.view.set_phase(phase);
        // The snapshot below supersedes anything pending.
        self.inner.broadcaster.cancel();
        self.inner.marks.take();

        self.inner
            .transport
            .broadcast_to_all(&HostMessage::PhaseChange { phase })?;
        let guests = self.inner.transport.broadcast_to_all(&HostMessage::SyncState {
            payload: self.inner.snapshot(),
        })?;
        info!(%phase, guests, "advanced phase");
        Ok(())
    }

    /// Re-register the room by hand, e.g. after automatic re-registration gave up.
    pub async fn retry(&self) -> Result<String> {
        self.inner.reregister().await
    }

    /// Detach from the transport and the stores, then send the last state.
    ///
    /// A pending debounced broadcast is flushed. A store change the watchers
    /// have not picked up yet is broadcast as well. Safe to call without
    /// `start()` and more than once.
    pub fn destroy(&self) {
        self.inner.abort_reregister();
        let running = lock(&self.running).take();
        if let Some(running) = &running {
            self.inner.transport.off(running.subscription);
            for watcher in &running.watchers {
                watcher.abort();
            }
            running.events.abort();
        }
        let flushed = self.inner.broadcaster.flush();
        if !flushed && self.inner.marks.take() {
            debug!("broadcasting a store change made right before teardown");
            broadcast_snapshot(
                self.inner.transport.as_ref(),
                &self.inner.context,
                &self.inner.view,
            );
        }
        if running.is_some() {
            debug!("host orchestrator destroyed");
        }
    }
}

impl Drop for HostOrchestrator {
    fn drop(&mut self) {
        self.inner.abort_reregister();
        if let Some(running) = lock(&self.running).take() {
            for watcher in running.watchers {
                watcher.abort();
            }
            running.events.abort();
        }
    }
}

impl std::fmt::Debug for HostOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostOrchestrator")
            .field("running", &self.is_running())
            .field("broadcaster", &self.inner.broadcaster)
            .finish_non_exhaustive()
    }
}

impl HostInner {
    fn snapshot(&self) -> SyncPayload {
        self.view.read(|view| build_snapshot(&self.context, view))
    }

    fn send_snapshot_to(&self, peer_id: &str) {
        let message = HostMessage::SyncState {
            payload: self.snapshot(),
        };
        if let Err(e) = self.transport.send_to_guest(peer_id, &message) {
            debug!(peer_id = %peer_id, error = %e, "could not unicast snapshot");
        }
    }

    /// Turn one intent into a state change. `peer_id` is `None` for the host's own intents.
    fn apply_intent(&self, peer_id: Option<&str>, intent: GuestMessage) {
        match intent {
            GuestMessage::Identify {
                person_id,
                display_name,
            } => {
                let Some(peer_id) = peer_id else {
                    debug!("ignoring IDENTIFY from the host itself");
                    return;
                };
                info!(peer_id = %peer_id, person_id = %person_id, "guest identified");
                self.view.identify_guest(peer_id, &person_id, display_name);
                self.send_snapshot_to(peer_id);
                self.broadcaster.trigger();
            }
            GuestMessage::ClaimItem { item_id, person_id } => {
                if !self.context.has_item(&item_id) {
                    debug!(item_id = %item_id, "ignoring claim for unknown item");
                    return;
                }
                self.context
                    .assignments
                    .update_if(|a| a.claim(&item_id, &person_id));
            }
            GuestMessage::UnclaimItem { item_id, person_id } => {
                self.context
                    .assignments
                    .update_if(|a| a.unclaim(&item_id, &person_id));
            }
            GuestMessage::SetAssignees {
                item_id,
                person_ids,
                portions,
            } => {
                if !self.context.has_item(&item_id) {
                    debug!(item_id = %item_id, "ignoring assignees for unknown item");
                    return;
                }
                self.context
                    .assignments
                    .update(|a| a.set_assignees(&item_id, &person_ids, portions));
            }
            GuestMessage::SetTip {
                person_id,
                mode,
                value,
            } => {
                self.context
                    .set_tip(&person_id, TipChoice::new(mode, value));
            }
        }
    }

    /// Re-register the room. After a failure, further connection errors are
    /// ignored until [`HostOrchestrator::retry`].
    async fn reregister(&self) -> Result<String> {
        self.gave_up.store(false, Ordering::SeqCst);
        self.view
            .set_status_message(Some(RECONNECTING_MESSAGE.to_string()));
        match self.transport.reconnect_as_host().await {
            Ok(room_code) => {
                info!(room_code = %room_code, "re-registered");
                self.view.set_room_code(Some(room_code.clone()));
                self.view.set_status_message(None);
                Ok(room_code)
            }
            Err(e) => {
                if !matches!(e, SyncError::Destroyed) {
                    warn!(error = %e, "could not re-register");
                    self.gave_up.store(true, Ordering::SeqCst);
                    self.view
                        .set_status_message(Some(HOST_LOST_MESSAGE.to_string()));
                }
                Err(e)
            }
        }
    }

    /// Re-register in the background so the event loop keeps applying
    /// status changes meanwhile. Does nothing while one is in flight.
    fn spawn_reregister(self: &Arc<Self>) {
        let mut task = lock(&self.reregister_task);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("re-registration already in flight");
            return;
        }
        let inner = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let _ = inner.reregister().await;
        }));
    }

    fn abort_reregister(&self) {
        if let Some(task) = lock(&self.reregister_task).take() {
            task.abort();
        }
    }

    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open { room_code } => self.view.set_room_code(Some(room_code)),
            TransportEvent::GuestConnected { peer_id } => {
                self.view.add_guest(&peer_id);
                self.send_snapshot_to(&peer_id);
            }
            TransportEvent::GuestDisconnected { peer_id } => {
                if self.view.mark_guest_disconnected(&peer_id) {
                    self.broadcaster.trigger();
                }
            }
            TransportEvent::GuestMessage { peer_id, message } => {
                self.apply_intent(Some(&peer_id), message);
            }
            TransportEvent::GuestStale { peer_id } => {
                warn!(peer_id = %peer_id, "guest went stale");
            }
            TransportEvent::StatusChange(status) => {
                self.view.set_connection_status(status);
                if status == ConnectionStatus::Connected {
                    self.view.set_status_message(None);
                }
            }
            TransportEvent::ConnectionError { kind, message } => {
                if self.view.read(|s| s.room_code.is_none()) {
                    // Initial registration failed; the caller of start_host handles it.
                    debug!(%kind, message = %message, "host registration failed");
                    return;
                }
                if self.gave_up.load(Ordering::SeqCst) {
                    return;
                }
                warn!(%kind, message = %message, "host connection lost; re-registering");
                self.spawn_reregister();
            }
            TransportEvent::Retry {
                attempt,
                max_attempts,
                delay,
            } => debug!(attempt, max_attempts, ?delay, "retrying host registration"),
            TransportEvent::HostMessage(_) | TransportEvent::HostStale => {}
        }
    }
}

async fn run_events(inner: Arc<HostInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event);
    }
    debug!("host event stream ended");
}

fn watch_store<T>(mut changes: watch::Receiver<T>, inner: Arc<HostInner>) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            inner.broadcaster.trigger();
        }
    })
}

/// Tracks which stores changed since the last full broadcast.
struct ChangeMarks {
    receivers: Mutex<Vec<Box<dyn ChangeMark>>>,
}

impl ChangeMarks {
    fn new(context: &SessionContext) -> Self {
        Self {
            receivers: Mutex::new(vec![
                Box::new(context.items.subscribe()) as Box<dyn ChangeMark>,
                Box::new(context.participants.subscribe()),
                Box::new(context.assignments.subscribe()),
                Box::new(context.tips.subscribe()),
            ]),
        }
    }

    /// Reset every mark. Returns `true` if any store changed since the last reset.
    fn take(&self) -> bool {
        lock(&self.receivers)
            .iter_mut()
            .fold(false, |changed, mark| mark.take_change() | changed)
    }
}

trait ChangeMark: Send {
    fn take_change(&mut self) -> bool;
}

impl<T: Send + Sync> ChangeMark for watch::Receiver<T> {
    fn take_change(&mut self) -> bool {
        let changed = self.has_changed().unwrap_or(false);
        if changed {
            self.mark_unchanged();
        }
        changed
    }
}

fn broadcast_snapshot(transport: &dyn Transport, context: &SessionContext, view: &SessionView) {
    let payload = view.read(|v| build_snapshot(context, v));
    match transport.broadcast_to_all(&HostMessage::SyncState { payload }) {
        Ok(guests) => debug!(guests, "broadcast snapshot"),
        Err(e) => warn!(error = %e, "snapshot broadcast failed"),
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
    use crate::link::{Connector, Link};
    use crate::protocol::{decode_frame, BillItem, Frame, Participant};
    use crate::transports::{MemoryConnector, MemoryTransport};
    use std::time::Duration;

    struct Fixture {
        connector: MemoryConnector,
        transport: Arc<MemoryTransport>,
        orchestrator: HostOrchestrator,
        context: SessionContext,
        view: SessionView,
        room_code: String,
    }

    async fn fixture() -> Fixture {
        let connector = MemoryConnector::new();
        let config = SessionConfig::default();
        let transport = Arc::new(MemoryTransport::new(connector.clone(), config.clone()));
        let context = SessionContext::new();
        context.init(
            vec![BillItem::new("soup", "Soup", 7.5), BillItem::new("wine", "Wine", 30.0)],
            vec![Participant::new("ana", "Ana"), Participant::new("ben", "Ben")],
        );
        let view = SessionView::new();
        let orchestrator = HostOrchestrator::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            context.clone(),
            view.clone(),
            &config,
        );
        orchestrator.start();
        let room_code = transport.start_host().await.unwrap();
        Fixture {
            connector,
            transport,
            orchestrator,
            context,
            view,
            room_code,
        }
    }

    /// Next application message on a raw guest link, skipping heartbeats.
    async fn next_message(link: &mut Box<dyn Link>) -> HostMessage {
        loop {
            let text = link.recv().await.unwrap().unwrap();
            if let Frame::Message(message) = decode_frame::<HostMessage>(&text).unwrap() {
                return message;
            }
        }
    }

    async fn next_snapshot(link: &mut Box<dyn Link>) -> SyncPayload {
        match next_message(link).await {
            HostMessage::SyncState { payload } => payload,
            other => panic!("expected SYNC_STATE, got {other:?}"),
        }
    }

    async fn send(link: &mut Box<dyn Link>, intent: &GuestMessage) {
        link.send(serde_json::to_string(intent).unwrap()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_guest_gets_a_snapshot_right_away() {
        let f = fixture().await;
        let mut guest = f.connector.dial(&f.room_code).await.unwrap();

        let snapshot = next_snapshot(&mut guest).await;
        assert_eq!(snapshot.items.len(), 2);
        assert!(snapshot.claimed_participant_ids.is_empty());
        assert_eq!(f.view.state().guests.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identify_unicasts_then_broadcasts() {
        let f = fixture().await;
        let mut ana = f.connector.dial(&f.room_code).await.unwrap();
        let mut ben = f.connector.dial(&f.room_code).await.unwrap();
        next_snapshot(&mut ana).await;
        next_snapshot(&mut ben).await;

        send(&mut ana, &GuestMessage::Identify {
            person_id: "ana".into(),
            display_name: Some("Ana".into()),
        })
        .await;

        let unicast = next_snapshot(&mut ana).await;
        assert_eq!(unicast.claimed_participant_ids, vec!["ana"]);
        let broadcast = next_snapshot(&mut ben).await;
        assert_eq!(broadcast.claimed_participant_ids, vec!["ana"]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_claims_collapses_into_one_broadcast() {
        let f = fixture().await;
        let mut guest = f.connector.dial(&f.room_code).await.unwrap();
        next_snapshot(&mut guest).await;

        for (item, person) in [("soup", "ana"), ("wine", "ana"), ("wine", "ben")] {
            send(&mut guest, &GuestMessage::ClaimItem {
                item_id: item.into(),
                person_id: person.into(),
            })
            .await;
        }

        let snapshot = next_snapshot(&mut guest).await;
        assert_eq!(snapshot.assignments["soup"], vec!["ana"]);
        assert_eq!(snapshot.assignments["wine"], vec!["ana", "ben"]);

        let silence = tokio::time::timeout(Duration::from_millis(200), next_message(&mut guest)).await;
        assert!(silence.is_err(), "expected a single coalesced broadcast");
    }

    #[tokio::test(start_paused = true)]
    async fn claims_for_unknown_items_are_ignored() {
        let f = fixture().await;
        f.orchestrator.apply_local(GuestMessage::ClaimItem {
            item_id: "caviar".into(),
            person_id: "ana".into(),
        });
        assert!(f.context.assignments.get_state().assignments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn advance_phase_sends_phase_change_then_snapshot() {
        let f = fixture().await;
        let mut guest = f.connector.dial(&f.room_code).await.unwrap();
        next_snapshot(&mut guest).await;

        f.orchestrator.advance_phase(SessionPhase::Tips).unwrap();

        assert_eq!(
            next_message(&mut guest).await,
            HostMessage::PhaseChange {
                phase: SessionPhase::Tips
            }
        );
        assert_eq!(next_snapshot(&mut guest).await.phase, SessionPhase::Tips);
    }

    #[tokio::test(start_paused = true)]
    async fn phases_only_move_forward() {
        let f = fixture().await;
        f.orchestrator.advance_phase(SessionPhase::Claiming).unwrap();
        let err = f.orchestrator.advance_phase(SessionPhase::Lobby).unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidPhaseTransition {
                from: SessionPhase::Claiming,
                to: SessionPhase::Lobby
            }
        ));
        assert!(f.orchestrator.advance_phase(SessionPhase::Claiming).is_err());
        assert!(f.orchestrator.advance_phase(SessionPhase::Summary).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_flushes_pending_broadcast() {
        let f = fixture().await;
        let mut guest = f.connector.dial(&f.room_code).await.unwrap();
        next_snapshot(&mut guest).await;

        f.context.set_tip("ben", TipChoice::new(crate::protocol::TipMode::Percentage, 15.0));
        // Let the store watcher arm the debounce, but not fire it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.orchestrator.destroy();
        f.orchestrator.destroy();

        let snapshot = next_snapshot(&mut guest).await;
        assert!(snapshot.tips.contains_key("ben"));
        assert!(!f.orchestrator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_broadcasts_a_change_the_watchers_have_not_seen() {
        let f = fixture().await;
        let mut guest = f.connector.dial(&f.room_code).await.unwrap();
        next_snapshot(&mut guest).await;

        f.orchestrator.apply_local(GuestMessage::ClaimItem {
            item_id: "wine".into(),
            person_id: "ben".into(),
        });
        f.orchestrator.destroy();

        let snapshot = next_snapshot(&mut guest).await;
        assert_eq!(snapshot.assignments["wine"], vec!["ben"]);
    }

    #[tokio::test(start_paused = true)]
    async fn re_registers_the_same_code_after_losing_the_room() {
        let f = fixture().await;
        let mut events = f.transport.on().events;
        let mut states = f.view.subscribe();

        assert!(f.connector.drop_host(&f.room_code));
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Open { room_code } => {
                    assert_eq!(room_code, f.room_code);
                    break;
                }
                other => debug!(?other, "waiting for the room to reopen"),
            }
        }
        assert!(f.connector.has_room(&f.room_code));
        states
            .wait_for(|s| {
                s.connection_status == ConnectionStatus::Connected
                    && s.status_message.is_none()
                    && s.room_code.as_deref() == Some(f.room_code.as_str())
            })
            .await
            .unwrap();

        let mut guest = f.connector.dial(&f.room_code).await.unwrap();
        assert_eq!(next_snapshot(&mut guest).await.items.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_re_registers_after_automatic_attempts_give_up() {
        let f = fixture().await;
        let mut states = f.view.subscribe();

        assert!(f.connector.drop_host(&f.room_code));
        // Someone else grabs the code before the orchestrator can reclaim it.
        let squatter = f.connector.host(Some(&f.room_code)).await.unwrap();
        states
            .wait_for(|s| s.status_message.as_deref() == Some(HOST_LOST_MESSAGE))
            .await
            .unwrap();
        assert!(f.orchestrator.inner.gave_up.load(Ordering::SeqCst));

        drop(squatter);
        let room_code = f.orchestrator.retry().await.unwrap();
        assert_eq!(room_code, f.room_code);
        assert!(!f.orchestrator.inner.gave_up.load(Ordering::SeqCst));
        states
            .wait_for(|s| s.connection_status == ConnectionStatus::Connected && s.status_message.is_none())
            .await
            .unwrap();

        let mut guest = f.connector.dial(&room_code).await.unwrap();
        next_snapshot(&mut guest).await;
    }

    #[test]
    fn destroy_without_start_is_safe() {
        let orchestrator = HostOrchestrator::new(
            Arc::new(MemoryTransport::new(MemoryConnector::new(), SessionConfig::default())),
            SessionContext::new(),
            SessionView::new(),
            &SessionConfig::default(),
        );
        orchestrator.destroy();
        orchestrator.destroy();
    }
}
