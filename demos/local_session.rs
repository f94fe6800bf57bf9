//! # Local Session Example
//!
//! Runs a host and two guests in one process over the in-memory connector:
//!
//! 1. The host loads a bill and opens a room
//! 2. Two guests join with the room code and pick who they are
//! 3. Guests claim items and set tips; the host moves through the phases
//! 4. One guest's link is cut mid-session and recovers on its own
//! 5. Everyone ends the session
//!
//! ## Running
//!
//! ```sh
//! cargo run --example local_session
//!
//! # See the protocol chatter:
//! RUST_LOG=tabsync=debug cargo run --example local_session
//! ```

use std::time::Duration;

use tabsync::store::SessionContext;
use tabsync::transports::{MemoryConnector, MemoryTransport};
use tabsync::{BillItem, Participant, Session, SessionConfig, SessionPhase, TipMode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let connector = MemoryConnector::new();
    let config = SessionConfig::default().with_heartbeat_interval(Duration::from_secs(1));

    // ── Host ────────────────────────────────────────────────────────
    let context = SessionContext::new();
    context.init(
        vec![
            BillItem::new("ramen", "Tonkotsu ramen", 16.0),
            BillItem::new("gyoza", "Gyoza (6)", 7.5),
            BillItem::new("sake", "Sake carafe", 24.0),
        ],
        vec![
            Participant::new("ana", "Ana"),
            Participant::new("ben", "Ben"),
            Participant::new("cy", "Cy"),
        ],
    );
    let host = Session::host(
        MemoryTransport::new(connector.clone(), config.clone()),
        context,
        config.clone(),
    )
    .await?;
    let room_code = host.room_code().unwrap_or_default();
    tracing::info!("Room open, share code {room_code}");

    // ── Guests ──────────────────────────────────────────────────────
    let ana = Session::join(MemoryTransport::new(connector.clone(), config.clone()), &room_code).await?;
    let ben = Session::join(MemoryTransport::new(connector.clone(), config.clone()), &room_code).await?;
    ana.identify("ana", Some("Ana".into()))?;
    ben.identify("ben", Some("Ben".into()))?;

    // Print what Ben's screen would show whenever it changes.
    let mut ben_view = ben.subscribe();
    let printer = tokio::spawn(async move {
        while ben_view.changed().await.is_ok() {
            let state = ben_view.borrow_and_update().clone();
            let claims = state
                .synced_state
                .as_ref()
                .map(|p| p.assignments.len())
                .unwrap_or_default();
            tracing::info!(
                "[ben] {:?} phase={} claimed_items={claims} {}",
                state.connection_status,
                state.phase,
                state.status_message.unwrap_or_default()
            );
        }
    });
    settle().await;

    // ── Claiming ────────────────────────────────────────────────────
    host.advance_phase(SessionPhase::Claiming)?;
    ana.send_claim("ramen", "ana")?;
    ben.send_claim("gyoza", "ben")?;
    ana.send_set_assignees(
        "sake",
        vec!["ana".into(), "ben".into()],
        Some([("ana".to_string(), 2.0), ("ben".to_string(), 1.0)].into()),
    )?;
    // The host is a diner too.
    host.send_claim("gyoza", "cy")?;
    settle().await;

    // ── A dropped link ──────────────────────────────────────────────
    if let Some(peer) = host
        .guests()
        .into_iter()
        .find(|g| g.connected && g.person_id.as_deref() == Some("ana"))
    {
        tracing::info!("Cutting Ana's link ({})", peer.peer_id);
        connector.sever(&peer.peer_id);
    }
    settle().await;
    for guest in host.guests() {
        tracing::info!(
            "[host] roster: {} as {:?} connected={}",
            guest.peer_id,
            guest.person_id,
            guest.connected
        );
    }

    // ── Tips and summary ────────────────────────────────────────────
    host.advance_phase(SessionPhase::Tips)?;
    ana.send_tip("ana", TipMode::Percentage, 18.0)?;
    ben.send_tip("ben", TipMode::Fixed, 5.0)?;
    settle().await;
    host.advance_phase(SessionPhase::Summary)?;
    settle().await;

    if let Some(payload) = ben.synced_state() {
        tracing::info!(
            "Final snapshot: {} item(s), {} claim(s), {} tip(s), phase {}",
            payload.items.len(),
            payload.assignments.len(),
            payload.tips.len(),
            payload.phase
        );
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    ana.end_session().await;
    ben.end_session().await;
    host.end_session().await;
    printer.abort();
    tracing::info!("Session ended. Goodbye!");
    Ok(())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
