#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared helpers for tabsync integration tests.
//!
//! Sessions are wired over a [`MemoryConnector`] so tests can inject faults
//! (severed links, half-open links, vanished rooms) on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tabsync::store::SessionContext;
use tabsync::transports::{MemoryConnector, MemoryTransport};
use tabsync::view::SessionViewState;
use tabsync::{BillItem, ConnectionStatus, Participant, Session, SessionConfig, TransportEvent};
use tokio::sync::mpsc;

/// Upper bound for any single wait. Tests run on paused time, so this is
/// virtual and costs nothing when the condition holds early.
pub const WAIT: Duration = Duration::from_secs(120);

/// Install a `tracing` subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config() -> SessionConfig {
    SessionConfig::default()
}

/// Three items, three diners.
pub fn bill() -> SessionContext {
    let context = SessionContext::new();
    context.init(
        vec![
            BillItem::new("item1", "Ramen", 14.0),
            BillItem::new("item2", "Gyoza", 6.5),
            BillItem::new("item3", "Sake", 22.0),
        ],
        vec![
            Participant::new("p1", "Ana"),
            Participant::new("p2", "Ben"),
            Participant::new("p3", "Cy"),
        ],
    );
    context
}

pub async fn host(connector: &MemoryConnector) -> Session {
    init_tracing();
    Session::host(
        MemoryTransport::new(connector.clone(), config()),
        bill(),
        config(),
    )
    .await
    .expect("host session")
}

pub async fn join(connector: &MemoryConnector, host: &Session) -> Session {
    let room_code = host.room_code().expect("room code");
    Session::join(MemoryTransport::new(connector.clone(), config()), &room_code)
        .await
        .expect("guest session")
}

/// Join and identify, then wait until the host has bound the guest.
pub async fn join_as(connector: &MemoryConnector, host: &Session, person_id: &str) -> Session {
    let guest = join(connector, host).await;
    guest.identify(person_id, None).expect("identify");
    wait_for(host, |s| {
        s.guests
            .iter()
            .any(|g| g.connected && g.person_id.as_deref() == Some(person_id))
    })
    .await;
    guest
}

/// Wait until `session`'s view satisfies `predicate`, and return that state.
pub async fn wait_for(
    session: &Session,
    predicate: impl FnMut(&SessionViewState) -> bool,
) -> SessionViewState {
    let mut rx = session.subscribe();
    let result = tokio::time::timeout(WAIT, rx.wait_for(predicate)).await;
    match result {
        Ok(Ok(state)) => state.clone(),
        Ok(Err(_)) => panic!("view dropped while waiting"),
        Err(_) => panic!("timed out waiting; last state: {:#?}", session.state()),
    }
}

/// Record each connection status `session`'s view moves through from now on,
/// starting with the current one.
pub fn record_statuses(session: &Session) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(vec![session.connection_status()]));
    let sink = Arc::clone(&seen);
    let mut rx = session.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().connection_status;
            let mut seen = sink.lock().unwrap();
            if seen.last() != Some(&status) {
                seen.push(status);
            }
        }
    });
    seen
}

/// Next transport event matching `predicate`.
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    mut predicate: impl FnMut(&TransportEvent) -> bool,
) -> TransportEvent {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream closed"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// Drain every event that arrives within `window`.
pub async fn collect_events(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    window: Duration,
) -> Vec<TransportEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        seen.push(event);
    }
    seen
}

/// The peer id the host currently associates with `person_id`.
pub fn peer_of(host: &Session, person_id: &str) -> String {
    host.guests()
        .into_iter()
        .find(|g| g.connected && g.person_id.as_deref() == Some(person_id))
        .map(|g| g.peer_id)
        .expect("no connected guest for person")
}
