//! The transport contract and its shared implementation.
//!
//! [`Transport`] is the uniform, event-driven interface the rest of the crate
//! depends on. [`Channel`] implements it once, generically over a
//! [`Connector`], and owns everything that does not depend on the underlying
//! mechanism:
//!
//! - bounded, retried connection setup with exponential backoff
//! - one background task per link, multiplexing outbound frames, inbound
//!   frames and heartbeat ticks via `tokio::select!`
//! - inbound validation (invalid frames are logged and dropped, never raised)
//! - lifecycle events on an [`EventBus`]
//!
//! A channel is a cheap, cloneable handle. Its event bus outlives any single
//! link, so subscribers stay attached across reconnects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SyncError};
use crate::error_kind::ErrorKind;
use crate::event::{ConnectionStatus, EventBus, Subscription, SubscriptionId, TransportEvent};
use crate::heartbeat::HeartbeatMonitor;
use crate::link::{Connector, IncomingGuest, Link};
use crate::lock;
use crate::protocol::{
    decode_frame, encode, Frame, GuestMessage, HostMessage, PeerId, WireMessage, PING_FRAME,
    PONG_FRAME,
};

/// Which side of a session this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

/// Event-driven connection between one host and many guests.
///
/// Host-side methods: [`start_host`](Transport::start_host),
/// [`reconnect_as_host`](Transport::reconnect_as_host),
/// [`broadcast_to_all`](Transport::broadcast_to_all),
/// [`send_to_guest`](Transport::send_to_guest).
/// Guest-side methods: [`join_as_guest`](Transport::join_as_guest),
/// [`reconnect_to_host`](Transport::reconnect_to_host),
/// [`send_to_host`](Transport::send_to_host).
///
/// Send methods only queue the frame and return immediately.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Register a new room and return its code.
    async fn start_host(&self) -> Result<String>;

    /// Connect to the host of `room_code`.
    ///
    /// # Errors
    ///
    /// [`SyncError::RoomNotFound`] if the room does not exist (never retried),
    /// [`SyncError::ConnectionTimeout`] once every attempt has failed.
    async fn join_as_guest(&self, room_code: &str) -> Result<()>;

    /// Re-register the current room after a connectivity failure.
    async fn reconnect_as_host(&self) -> Result<String>;

    /// Drop the current host link (if any) and join `room_code` again.
    ///
    /// Returns `Ok(false)` when every attempt failed for a retriable reason
    /// or the channel was destroyed meanwhile.
    ///
    /// # Errors
    ///
    /// [`SyncError::RoomNotFound`] if the room is gone for good.
    async fn reconnect_to_host(&self, room_code: &str) -> Result<bool>;

    /// Queue a message for every connected guest. Returns how many guests it was queued for.
    fn broadcast_to_all(&self, message: &HostMessage) -> Result<usize>;

    /// Queue a message for one guest.
    fn send_to_guest(&self, peer_id: &str, message: &HostMessage) -> Result<()>;

    /// Queue a message for the host.
    fn send_to_host(&self, message: &GuestMessage) -> Result<()>;

    /// Peer ids of every currently connected guest, sorted.
    fn connected_peer_ids(&self) -> Vec<PeerId>;

    fn is_connected(&self) -> bool;

    fn status(&self) -> ConnectionStatus;

    fn room_code(&self) -> Option<String>;

    /// Tear everything down. Idempotent.
    async fn destroy(&self);

    /// Subscribe to [`TransportEvent`]s.
    fn on(&self) -> Subscription;

    /// Unsubscribe. Returns `false` if `id` was not subscribed.
    fn off(&self, id: SubscriptionId) -> bool;
}

// ── Channel ─────────────────────────────────────────────────────────

/// The [`Transport`] implementation shared by every connector.
pub struct Channel<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C> {
    connector: C,
    shared: Arc<Shared>,
    destroyed: watch::Sender<bool>,
}

/// State reachable from link tasks.
struct Shared {
    config: SessionConfig,
    events: EventBus,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    role: Option<Role>,
    room_code: Option<String>,
    status: ConnectionStatus,
    peers: HashMap<PeerId, LinkHandle>,
    host_link: Option<LinkHandle>,
    accept_task: Option<JoinHandle<()>>,
    /// Bumped whenever the guest-side link is replaced.
    link_epoch: u64,
}

struct LinkHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: Option<JoinHandle<()>>,
    epoch: u64,
}

enum Outbound {
    Frame(String),
    Close,
}

/// Why a link task stopped.
#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    /// The remote side closed cleanly.
    Closed,
    /// Sending or receiving failed.
    Failed(String),
    /// The heartbeat timed out.
    Stale,
    /// We closed it.
    Local,
}

impl<C: Connector> Channel<C> {
    pub fn new(connector: C, config: SessionConfig) -> Self {
        let (destroyed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                shared: Arc::new(Shared {
                    config,
                    events: EventBus::new(),
                    state: Mutex::new(ChannelState::default()),
                }),
                destroyed,
            }),
        }
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.shared.config
    }

    pub fn role(&self) -> Option<Role> {
        lock(&self.inner.shared.state).role
    }

    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.borrow()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_destroyed() {
            Err(SyncError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Run `attempt` under the per-attempt `timeout`, retrying with backoff.
    ///
    /// Aborts as soon as the channel is destroyed.
    async fn establish<T, F, Fut>(&self, timeout: Duration, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let config = &self.inner.shared.config;
        let max_attempts = config.max_attempts.max(1);
        let mut destroyed = self.inner.destroyed.subscribe();

        for n in 1..=max_attempts {
            if *destroyed.borrow() {
                return Err(SyncError::Destroyed);
            }
            let outcome = tokio::select! {
                biased;
                _ = destroyed.wait_for(|d| *d) => return Err(SyncError::Destroyed),
                outcome = tokio::time::timeout(timeout, attempt()) => outcome,
            };
            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retriable() => return Err(e),
                Ok(Err(e)) => warn!(attempt = n, error = %e, "connection attempt failed"),
                Err(_) => warn!(attempt = n, ?timeout, "connection attempt timed out"),
            }

            if n < max_attempts {
                let delay = config.backoff_delay(n);
                self.inner.shared.events.emit(TransportEvent::Retry {
                    attempt: n,
                    max_attempts,
                    delay,
                });
                tokio::select! {
                    biased;
                    _ = destroyed.wait_for(|d| *d) => return Err(SyncError::Destroyed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(SyncError::ConnectionTimeout {
            attempts: max_attempts,
        })
    }

    /// Surface a setup failure as status + event. Cancellation is silent.
    fn report_failure(&self, error: &SyncError) {
        if matches!(error, SyncError::Destroyed) {
            return;
        }
        self.inner.shared.set_status(ConnectionStatus::Error);
        self.inner
            .shared
            .events
            .emit(TransportEvent::ConnectionError {
                kind: error.kind(),
                message: error.to_string(),
            });
    }

    async fn register_host(&self, room_code: Option<String>) -> Result<String> {
        self.ensure_live()?;
        self.inner.shared.set_status(ConnectionStatus::Connecting);

        let connector = &self.inner.connector;
        let requested = room_code.as_deref();
        let registration = match self
            .establish(self.inner.shared.config.host_timeout, move || {
                connector.host(requested)
            })
            .await
        {
            Ok(registration) => registration,
            Err(e) => {
                self.report_failure(&e);
                return Err(e);
            }
        };

        // Setup settled after a destroy: drop the registration, releasing the room.
        self.ensure_live()?;

        let room_code = registration.room_code.clone();
        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.inner.shared),
            registration.incoming,
        ));
        {
            let mut state = lock(&self.inner.shared.state);
            state.role = Some(Role::Host);
            state.room_code = Some(room_code.clone());
            if let Some(previous) = state.accept_task.replace(accept) {
                previous.abort();
            }
        }

        info!(room_code = %room_code, "hosting room");
        self.inner.shared.set_status(ConnectionStatus::Connected);
        self.inner.shared.events.emit(TransportEvent::Open {
            room_code: room_code.clone(),
        });
        Ok(room_code)
    }

    async fn connect_guest(&self, room_code: &str) -> Result<()> {
        let connector = &self.inner.connector;
        let mut link = self
            .establish(self.inner.shared.config.guest_timeout, move || {
                connector.dial(room_code)
            })
            .await?;

        if self.is_destroyed() {
            let _ = link.close().await;
            return Err(SyncError::Destroyed);
        }

        spawn_host_link(&self.inner.shared, room_code, link);
        info!(room_code = %room_code, "joined room");
        self.inner.shared.set_status(ConnectionStatus::Connected);
        self.inner.shared.events.emit(TransportEvent::Open {
            room_code: room_code.to_string(),
        });
        Ok(())
    }

    /// Close the guest-side link without reporting its end as a failure.
    fn drop_host_link(&self) {
        let mut state = lock(&self.inner.shared.state);
        state.link_epoch = state.link_epoch.wrapping_add(1);
        if let Some(handle) = state.host_link.take() {
            let _ = handle.outbound.send(Outbound::Close);
        }
    }

    /// Close every guest link and stop accepting new ones.
    fn drop_guest_links(&self) {
        let mut state = lock(&self.inner.shared.state);
        if let Some(accept) = state.accept_task.take() {
            accept.abort();
        }
        for handle in state.peers.values() {
            let _ = handle.outbound.send(Outbound::Close);
        }
    }
}

#[async_trait]
impl<C: Connector> Transport for Channel<C> {
    async fn start_host(&self) -> Result<String> {
        self.register_host(None).await
    }

    async fn join_as_guest(&self, room_code: &str) -> Result<()> {
        self.ensure_live()?;
        {
            let mut state = lock(&self.inner.shared.state);
            state.role = Some(Role::Guest);
            state.room_code = Some(room_code.to_string());
        }
        self.inner.shared.set_status(ConnectionStatus::Connecting);
        let result = self.connect_guest(room_code).await;
        if let Err(e) = &result {
            self.report_failure(e);
        }
        result
    }

    async fn reconnect_as_host(&self) -> Result<String> {
        self.ensure_live()?;
        let room_code = lock(&self.inner.shared.state).room_code.clone();
        info!(room_code = ?room_code, "re-registering as host");
        self.drop_guest_links();
        self.register_host(room_code).await
    }

    async fn reconnect_to_host(&self, room_code: &str) -> Result<bool> {
        self.ensure_live()?;
        self.drop_host_link();

        let next = if self.status().can_transition_to(ConnectionStatus::Reconnecting) {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        };
        self.inner.shared.set_status(next);
        {
            let mut state = lock(&self.inner.shared.state);
            state.role = Some(Role::Guest);
            state.room_code = Some(room_code.to_string());
        }

        match self.connect_guest(room_code).await {
            Ok(()) => Ok(true),
            Err(SyncError::Destroyed) => Ok(false),
            Err(e) if e.kind().is_terminal() => {
                self.report_failure(&e);
                Err(e)
            }
            Err(e) => {
                self.report_failure(&e);
                Ok(false)
            }
        }
    }

    fn broadcast_to_all(&self, message: &HostMessage) -> Result<usize> {
        let frame = encode(message)?;
        let state = lock(&self.inner.shared.state);
        let mut queued = 0;
        for handle in state.peers.values() {
            if handle.outbound.send(Outbound::Frame(frame.clone())).is_ok() {
                queued += 1;
            }
        }
        Ok(queued)
    }

    fn send_to_guest(&self, peer_id: &str, message: &HostMessage) -> Result<()> {
        let frame = encode(message)?;
        let state = lock(&self.inner.shared.state);
        let handle = state.peers.get(peer_id).ok_or(SyncError::NotConnected)?;
        handle
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SyncError::NotConnected)
    }

    fn send_to_host(&self, message: &GuestMessage) -> Result<()> {
        let frame = encode(message)?;
        let state = lock(&self.inner.shared.state);
        let handle = state.host_link.as_ref().ok_or(SyncError::NotConnected)?;
        handle
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| SyncError::NotConnected)
    }

    fn connected_peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = lock(&self.inner.shared.state)
            .peers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn status(&self) -> ConnectionStatus {
        lock(&self.inner.shared.state).status
    }

    fn room_code(&self) -> Option<String> {
        lock(&self.inner.shared.state).room_code.clone()
    }

    async fn destroy(&self) {
        if self.inner.destroyed.send_replace(true) {
            return;
        }
        debug!("destroying transport");

        let (accept, handles) = {
            let mut state = lock(&self.inner.shared.state);
            let host_link = state.host_link.take();
            let mut handles: Vec<LinkHandle> =
                state.peers.drain().map(|(_, handle)| handle).collect();
            handles.extend(host_link);
            (state.accept_task.take(), handles)
        };
        if let Some(accept) = accept {
            accept.abort();
        }

        // Close gracefully so frames queued before the close (such as a
        // flushed final snapshot) still go out.
        for handle in &handles {
            let _ = handle.outbound.send(Outbound::Close);
        }
        let deadline = tokio::time::Instant::now() + self.inner.shared.config.shutdown_timeout;
        for handle in handles {
            if let Some(mut task) = handle.task {
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    warn!("link task did not exit within shutdown timeout; aborting");
                    task.abort();
                }
            }
        }

        self.inner.shared.set_status(ConnectionStatus::Disconnected);
        {
            let mut state = lock(&self.inner.shared.state);
            state.role = None;
            state.room_code = None;
        }
        self.inner.shared.events.clear();
    }

    fn on(&self) -> Subscription {
        self.inner.shared.events.on()
    }

    fn off(&self, id: SubscriptionId) -> bool {
        self.inner.shared.events.off(id)
    }
}

impl<C: Connector> std::fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("role", &self.role())
            .field("status", &self.status())
            .field("room_code", &self.room_code())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        // Link tasks only hold `Shared`, so they would otherwise outlive the
        // last handle. `Drop` cannot await a graceful close; abort instead.
        let mut state = lock(&self.shared.state);
        if let Some(accept) = state.accept_task.take() {
            accept.abort();
        }
        for (_, handle) in state.peers.drain() {
            if let Some(task) = handle.task {
                task.abort();
            }
        }
        if let Some(task) = state.host_link.take().and_then(|h| h.task) {
            task.abort();
        }
    }
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut state = lock(&self.state);
            if state.status == status {
                return;
            }
            state.status = status;
        }
        debug!(?status, "connection status changed");
        self.events.emit(TransportEvent::StatusChange(status));
    }
}

// ── Link tasks ──────────────────────────────────────────────────────

/// Host side: turn each incoming guest into a link task.
async fn accept_loop(shared: Arc<Shared>, mut incoming: mpsc::UnboundedReceiver<IncomingGuest>) {
    while let Some(IncomingGuest { peer_id, link }) = incoming.recv().await {
        spawn_guest_link(&shared, peer_id, link);
    }
    // Deliberate shutdowns abort this task, so reaching here means the
    // connector lost the registration.
    warn!("host registration lost");
    shared.set_status(ConnectionStatus::Error);
    shared.events.emit(TransportEvent::ConnectionError {
        kind: ErrorKind::TransportError,
        message: "host registration lost".into(),
    });
}

fn spawn_guest_link(shared: &Arc<Shared>, peer_id: PeerId, link: Box<dyn Link>) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    lock(&shared.state).peers.insert(
        peer_id.clone(),
        LinkHandle {
            outbound,
            task: None,
            epoch: 0,
        },
    );
    info!(peer_id = %peer_id, "guest connected");
    shared.events.emit(TransportEvent::GuestConnected {
        peer_id: peer_id.clone(),
    });

    let task_shared = Arc::clone(shared);
    let task_peer = peer_id.clone();
    let task = tokio::spawn(async move {
        let events = &task_shared.events;
        let end = drive_link::<GuestMessage, _>(
            link,
            outbound_rx,
            &task_shared.config,
            |message| {
                events.emit(TransportEvent::GuestMessage {
                    peer_id: task_peer.clone(),
                    message,
                })
            },
        )
        .await;

        lock(&task_shared.state).peers.remove(&task_peer);
        match &end {
            LinkEnd::Stale => {
                warn!(peer_id = %task_peer, "guest stopped answering heartbeats; closing");
                events.emit(TransportEvent::GuestStale {
                    peer_id: task_peer.clone(),
                });
            }
            LinkEnd::Failed(reason) => {
                debug!(peer_id = %task_peer, reason = %reason, "guest link failed")
            }
            LinkEnd::Closed | LinkEnd::Local => {}
        }
        info!(peer_id = %task_peer, "guest disconnected");
        events.emit(TransportEvent::GuestDisconnected { peer_id: task_peer });
    });

    let mut state = lock(&shared.state);
    match state.peers.get_mut(&peer_id) {
        Some(handle) => handle.task = Some(task),
        // Already finished and removed itself.
        None => drop(task),
    }
}

fn spawn_host_link(shared: &Arc<Shared>, room_code: &str, link: Box<dyn Link>) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let epoch = {
        let mut state = lock(&shared.state);
        state.link_epoch = state.link_epoch.wrapping_add(1);
        let epoch = state.link_epoch;
        state.role = Some(Role::Guest);
        state.room_code = Some(room_code.to_string());
        if let Some(previous) = state.host_link.replace(LinkHandle {
            outbound,
            task: None,
            epoch,
        }) {
            let _ = previous.outbound.send(Outbound::Close);
        }
        epoch
    };

    let task_shared = Arc::clone(shared);
    let task = tokio::spawn(async move {
        let events = &task_shared.events;
        let end = drive_link::<HostMessage, _>(
            link,
            outbound_rx,
            &task_shared.config,
            |message| events.emit(TransportEvent::HostMessage(message)),
        )
        .await;

        let current = {
            let mut state = lock(&task_shared.state);
            if state.link_epoch == epoch {
                state.host_link = None;
                true
            } else {
                false
            }
        };
        if !current {
            return;
        }
        match end {
            LinkEnd::Local => {}
            LinkEnd::Stale => {
                warn!("host stopped answering heartbeats");
                events.emit(TransportEvent::HostStale);
                events.emit(TransportEvent::ConnectionError {
                    kind: ErrorKind::StaleConnection,
                    message: "host stopped responding".into(),
                });
            }
            LinkEnd::Failed(reason) => {
                warn!(reason = %reason, "host link failed");
                events.emit(TransportEvent::ConnectionError {
                    kind: ErrorKind::TransportError,
                    message: reason,
                });
            }
            LinkEnd::Closed => {
                info!("host closed the connection");
                events.emit(TransportEvent::ConnectionError {
                    kind: ErrorKind::TransportError,
                    message: "host closed the connection".into(),
                });
            }
        }
    });

    let mut state = lock(&shared.state);
    match state.host_link.as_mut() {
        Some(handle) if handle.epoch == epoch => handle.task = Some(task),
        _ => drop(task),
    }
}

/// Pump one link until it ends.
///
/// Multiplexes queued outbound frames, inbound frames and heartbeat ticks.
/// Heartbeat frames are answered here and never reach `deliver`; frames that
/// fail validation are logged and dropped.
async fn drive_link<M, F>(
    mut link: Box<dyn Link>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    config: &SessionConfig,
    mut deliver: F,
) -> LinkEnd
where
    M: WireMessage,
    F: FnMut(M) + Send,
{
    let mut monitor = HeartbeatMonitor::from_config(config);
    let mut ticker = monitor.ticker();

    let end = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = link.send(text).await {
                        break LinkEnd::Failed(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => break LinkEnd::Local,
            },

            incoming = link.recv() => match incoming {
                Some(Ok(text)) => {
                    monitor.record_activity();
                    match decode_frame::<M>(&text) {
                        Ok(Frame::Message(message)) => deliver(message),
                        Ok(Frame::Ping) => {
                            if let Err(e) = link.send(PONG_FRAME.to_string()).await {
                                break LinkEnd::Failed(e.to_string());
                            }
                        }
                        Ok(Frame::Pong) => {}
                        Err(e) => warn!(error = %e, "dropping invalid frame"),
                    }
                }
                Some(Err(e)) => break LinkEnd::Failed(e.to_string()),
                None => break LinkEnd::Closed,
            },

            _ = ticker.tick() => {
                if monitor.is_stale() {
                    break LinkEnd::Stale;
                }
                if let Err(e) = link.send(PING_FRAME.to_string()).await {
                    break LinkEnd::Failed(e.to_string());
                }
            }
        }
    };

    if let Err(e) = link.close().await {
        debug!(error = %e, "error while closing link");
    }
    end
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
    use crate::protocol::{SessionPhase, SyncPayload};
    use crate::transports::memory::MemoryConnector;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> SessionConfig {
        SessionConfig::default()
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
    }

    async fn next_matching(
        sub: &mut Subscription,
        mut pred: impl FnMut(&TransportEvent) -> bool,
    ) -> TransportEvent {
        loop {
            let event = sub.events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    /// A connector whose `dial` never completes and counts attempts.
    struct HangingConnector {
        dials: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for HangingConnector {
        async fn host(&self, _room_code: Option<&str>) -> Result<crate::link::HostRegistration> {
            std::future::pending().await
        }

        async fn dial(&self, _room_code: &str) -> Result<Box<dyn Link>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn join_times_out_after_all_attempts_with_retry_events() {
        let dials = Arc::new(AtomicU32::new(0));
        let channel = Channel::new(
            HangingConnector {
                dials: Arc::clone(&dials),
            },
            config().with_max_attempts(3),
        );
        let mut sub = channel.on();

        let err = channel.join_as_guest("ROOM42").await.unwrap_err();
        assert!(matches!(err, SyncError::ConnectionTimeout { attempts: 3 }));
        assert_eq!(dials.load(Ordering::SeqCst), 3);
        assert_eq!(channel.status(), ConnectionStatus::Error);

        let mut retries = Vec::new();
        while let Ok(event) = sub.events.try_recv() {
            if let TransportEvent::Retry { attempt, delay, .. } = event {
                retries.push((attempt, delay));
            }
        }
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn host_timeout_is_shorter_than_guest_timeout() {
        let channel = Channel::new(
            HangingConnector {
                dials: Arc::new(AtomicU32::new(0)),
            },
            config()
                .with_max_attempts(1)
                .with_host_timeout(Duration::from_secs(2))
                .with_guest_timeout(Duration::from_secs(5)),
        );
        let start = tokio::time::Instant::now();
        let _ = channel.start_host().await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        let _ = channel.join_as_guest("X").await.unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_aborts_in_flight_setup() {
        let channel = Channel::new(
            HangingConnector {
                dials: Arc::new(AtomicU32::new(0)),
            },
            config(),
        );
        let joining = channel.clone();
        let attempt = tokio::spawn(async move { joining.join_as_guest("ROOM42").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.destroy().await;

        let result = attempt.await.unwrap();
        assert!(matches!(result, Err(SyncError::Destroyed)));
        assert!(matches!(
            channel.join_as_guest("ROOM42").await,
            Err(SyncError::Destroyed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_room_fails_immediately_without_retry() {
        let channel = Channel::new(MemoryConnector::new(), config().with_max_attempts(5));
        let mut sub = channel.on();

        let err = channel.join_as_guest("NOPE99").await.unwrap_err();
        assert!(matches!(err, SyncError::RoomNotFound { .. }));

        let event = next_matching(&mut sub, |e| {
            matches!(e, TransportEvent::ConnectionError { .. } | TransportEvent::Retry { .. })
        })
        .await;
        assert_eq!(
            event,
            TransportEvent::ConnectionError {
                kind: ErrorKind::RoomNotFound,
                message: "room NOPE99 not found".into(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn host_and_guest_exchange_messages() {
        let connector = MemoryConnector::new();
        let host = Channel::new(connector.clone(), config());
        let guest = Channel::new(connector, config());
        let mut host_events = host.on();
        let mut guest_events = guest.on();

        let room = host.start_host().await.unwrap();
        guest.join_as_guest(&room).await.unwrap();
        assert!(guest.is_connected());

        let TransportEvent::GuestConnected { peer_id } = next_matching(&mut host_events, |e| {
            matches!(e, TransportEvent::GuestConnected { .. })
        })
        .await
        else {
            unreachable!()
        };
        assert_eq!(host.connected_peer_ids(), vec![peer_id.clone()]);

        let intent = GuestMessage::Identify {
            person_id: "p1".into(),
            display_name: Some("Ana".into()),
        };
        guest.send_to_host(&intent).unwrap();
        let event = next_matching(&mut host_events, |e| {
            matches!(e, TransportEvent::GuestMessage { .. })
        })
        .await;
        assert_eq!(
            event,
            TransportEvent::GuestMessage {
                peer_id: peer_id.clone(),
                message: intent,
            }
        );

        let update = HostMessage::PhaseChange {
            phase: SessionPhase::Claiming,
        };
        host.send_to_guest(&peer_id, &update).unwrap();
        let event =
            next_matching(&mut guest_events, |e| matches!(e, TransportEvent::HostMessage(_))).await;
        assert_eq!(event, TransportEvent::HostMessage(update));

        assert_eq!(
            host.broadcast_to_all(&HostMessage::SyncState {
                payload: SyncPayload::default()
            })
            .unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_frames_are_dropped_without_disconnecting() {
        let connector = MemoryConnector::new();
        let host = Channel::new(connector.clone(), config());
        let mut host_events = host.on();
        let room = host.start_host().await.unwrap();

        let mut raw = connector.dial(&room).await.unwrap();
        raw.send("{not json".into()).await.unwrap();
        raw.send(r#"{"type":"LAUNCH_ROCKETS"}"#.into()).await.unwrap();
        raw.send(r#"{"type":"CLAIM_ITEM","itemId":"i1","personId":"p1"}"#.into())
            .await
            .unwrap();

        let event = next_matching(&mut host_events, |e| {
            matches!(
                e,
                TransportEvent::GuestMessage { .. } | TransportEvent::GuestDisconnected { .. }
            )
        })
        .await;
        assert!(matches!(
            event,
            TransportEvent::GuestMessage {
                message: GuestMessage::ClaimItem { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_to_host_requires_a_link() {
        let channel = Channel::new(MemoryConnector::new(), config());
        let err = channel
            .send_to_host(&GuestMessage::Identify {
                person_id: "p1".into(),
                display_name: None,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConnected));
        assert!(matches!(
            channel.send_to_guest("nobody", &HostMessage::PhaseChange {
                phase: SessionPhase::Tips
            }),
            Err(SyncError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent_and_disconnects() {
        let connector = MemoryConnector::new();
        let host = Channel::new(connector.clone(), config());
        let guest = Channel::new(connector, config());
        let room = host.start_host().await.unwrap();
        guest.join_as_guest(&room).await.unwrap();

        host.destroy().await;
        host.destroy().await;
        assert_eq!(host.status(), ConnectionStatus::Disconnected);
        assert!(host.connected_peer_ids().is_empty());
        assert!(host.room_code().is_none());
    }
}
