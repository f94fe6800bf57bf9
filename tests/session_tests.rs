#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end session scenarios over the in-process connector.
//!
//! Every test runs on paused Tokio time: debounce windows, heartbeat
//! intervals and backoff delays elapse instantly but in order.

mod common;

use std::time::Duration;

use tabsync::transports::MemoryConnector;
use tabsync::view::{ROOM_GONE_MESSAGE, SessionViewState};
use tabsync::{ConnectionStatus, SessionPhase, TipChoice, TipMode, TransportEvent};

use common::{
    collect_events, host, join, join_as, next_event, peer_of, record_statuses, wait_for,
};

#[tokio::test(start_paused = true)]
async fn claim_and_tip_reach_every_guest() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest1 = join_as(&connector, &host, "p1").await;
    let guest2 = join_as(&connector, &host, "p2").await;
    host.advance_phase(SessionPhase::Claiming).unwrap();

    guest1.send_claim("item1", "p1").unwrap();
    let state = wait_for(&guest2, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| p.assignments.get("item1").is_some_and(|a| a == &["p1"]))
    })
    .await;
    let payload = state.synced_state.unwrap();
    assert_eq!(payload.phase, SessionPhase::Claiming);
    assert_eq!(payload.claimed_participant_ids, vec!["p1", "p2"]);

    guest2.send_tip("p2", TipMode::Percentage, 20.0).unwrap();
    let state = wait_for(&guest1, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| p.tips.contains_key("p2"))
    })
    .await;
    let tip = state.synced_state.unwrap().tips["p2"];
    assert_eq!(tip, TipChoice::Percentage { percentage: 20.0 });
    assert_eq!(
        serde_json::to_value(tip).unwrap(),
        serde_json::json!({"mode": "percentage", "percentage": 20.0})
    );
    // The first claim is still there: every snapshot is complete.
    assert!(host.build_snapshot().unwrap().assignments.contains_key("item1"));
}

#[tokio::test(start_paused = true)]
async fn toggling_a_claim_twice_restores_the_assignments() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join_as(&connector, &host, "p1").await;
    let before = host.build_snapshot().unwrap().assignments;

    guest.send_claim("item2", "p1").unwrap();
    guest.send_claim("item2", "p3").unwrap();
    guest.send_unclaim("item2", "p1").unwrap();
    guest.send_unclaim("item2", "p3").unwrap();

    wait_for(&guest, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| !p.assignments.contains_key("item2"))
    })
    .await;
    assert_eq!(host.build_snapshot().unwrap().assignments, before);
}

#[tokio::test(start_paused = true)]
async fn uneven_split_replaces_assignees_and_portions() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join_as(&connector, &host, "p1").await;

    let portions = [("p1".to_string(), 2.0), ("p2".to_string(), 1.0)].into();
    guest
        .send_set_assignees("item3", vec!["p1".into(), "p2".into()], Some(portions))
        .unwrap();

    let state = wait_for(&guest, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| p.portions.contains_key("item3"))
    })
    .await;
    let payload = state.synced_state.unwrap();
    assert_eq!(payload.assignments["item3"], vec!["p1", "p2"]);
    assert_eq!(payload.portions["item3"]["p1"], 2.0);
}

#[tokio::test(start_paused = true)]
async fn dropped_guest_reconnects_without_a_duplicate_roster_entry() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join_as(&connector, &host, "p1").await;
    let old_peer = peer_of(&host, "p1");
    let mut guest_events = guest.transport().on().events;
    let statuses = record_statuses(&guest);

    assert!(connector.sever(&old_peer));

    next_event(&mut guest_events, |e| {
        *e == TransportEvent::StatusChange(ConnectionStatus::Reconnecting)
    })
    .await;
    next_event(&mut guest_events, |e| {
        *e == TransportEvent::StatusChange(ConnectionStatus::Connected)
    })
    .await;

    let state = wait_for(&host, |s| {
        s.guests.len() == 1
            && s.guests[0].connected
            && s.guests[0].person_id.as_deref() == Some("p1")
            && s.guests[0].peer_id != old_peer
    })
    .await;
    assert_eq!(state.claimed_participant_ids(), vec!["p1"]);
    assert_eq!(guest.my_person_id().as_deref(), Some("p1"));
    wait_for(&guest, |s| {
        s.connection_status == ConnectionStatus::Connected && s.status_message.is_none()
    })
    .await;
    assert_eq!(
        *statuses.lock().unwrap(),
        [
            ConnectionStatus::Connected,
            ConnectionStatus::Reconnecting,
            ConnectionStatus::Connected
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn host_that_drops_off_gets_its_guests_back() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let room_code = host.room_code().unwrap();
    let guest = join_as(&connector, &host, "p1").await;
    guest.send_claim("item1", "p1").unwrap();
    wait_for(&guest, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| p.assignments.contains_key("item1"))
    })
    .await;
    let old_peer = peer_of(&host, "p1");
    let statuses = record_statuses(&guest);

    assert!(connector.drop_host(&room_code));

    let state = wait_for(&host, |s| {
        s.connection_status == ConnectionStatus::Connected
            && s.guests
                .iter()
                .any(|g| g.connected && g.person_id.as_deref() == Some("p1") && g.peer_id != old_peer)
    })
    .await;
    assert_eq!(state.room_code.as_deref(), Some(room_code.as_str()));
    assert_eq!(state.status_message, None);
    assert_eq!(state.claimed_participant_ids(), vec!["p1"]);

    // The bill survived the outage.
    guest.send_tip("p1", TipMode::Fixed, 2.0).unwrap();
    let state = wait_for(&guest, |s| {
        s.connection_status == ConnectionStatus::Connected
            && s.synced_state
                .as_ref()
                .is_some_and(|p| p.tips.contains_key("p1"))
    })
    .await;
    assert!(state.synced_state.unwrap().assignments.contains_key("item1"));
    let statuses = statuses.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&ConnectionStatus::Connected));
    assert_eq!(statuses.get(1), Some(&ConnectionStatus::Reconnecting));
    assert_eq!(statuses.last(), Some(&ConnectionStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn host_teardown_still_delivers_its_last_change() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join_as(&connector, &host, "p1").await;

    host.send_claim("item2", "p1").unwrap();
    host.end_session().await;

    let state = wait_for(&guest, |s| s.connection_status == ConnectionStatus::Error).await;
    let payload = state.synced_state.unwrap();
    assert_eq!(payload.assignments["item2"], vec!["p1"]);
}

#[tokio::test(start_paused = true)]
async fn stale_guest_is_closed_once_without_affecting_others() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let _stalled = join_as(&connector, &host, "p1").await;
    let healthy = join_as(&connector, &host, "p2").await;
    let stalled_peer = peer_of(&host, "p1");
    let healthy_peer = peer_of(&host, "p2");
    let mut host_events = host.transport().on().events;

    assert!(connector.stall(&stalled_peer));

    next_event(&mut host_events, |e| {
        matches!(e, TransportEvent::GuestStale { peer_id } if *peer_id == stalled_peer)
    })
    .await;
    let later = collect_events(&mut host_events, Duration::from_secs(60)).await;

    let stale_again = later.iter().any(|e| {
        matches!(e, TransportEvent::GuestStale { peer_id } if *peer_id == stalled_peer)
    });
    assert!(!stale_again, "guest-stale must fire once per link");
    assert!(later.iter().any(
        |e| matches!(e, TransportEvent::GuestDisconnected { peer_id } if *peer_id == stalled_peer)
    ));
    assert!(!later.iter().any(|e| matches!(
        e,
        TransportEvent::GuestStale { peer_id } | TransportEvent::GuestDisconnected { peer_id }
            if *peer_id == healthy_peer
    )));

    let peers = host.transport().connected_peer_ids();
    assert!(!peers.contains(&stalled_peer));
    assert!(peers.contains(&healthy_peer));
    assert_eq!(healthy.connection_status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn advancing_the_phase_moves_every_guest() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guests = [
        join_as(&connector, &host, "p1").await,
        join_as(&connector, &host, "p2").await,
    ];

    host.advance_phase(SessionPhase::Tips).unwrap();

    for guest in &guests {
        // PHASE_CHANGE lands first, the snapshot right behind it.
        wait_for(guest, |s| {
            s.phase == SessionPhase::Tips
                && s.synced_state
                    .as_ref()
                    .is_some_and(|p| p.phase == SessionPhase::Tips)
        })
        .await;
    }
    assert!(host.advance_phase(SessionPhase::Claiming).is_err());
    assert_eq!(host.phase(), SessionPhase::Tips);
}

#[tokio::test(start_paused = true)]
async fn ending_the_host_session_is_terminal_for_guests() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join_as(&connector, &host, "p1").await;

    host.end_session().await;

    let state = wait_for(&guest, |s| s.connection_status == ConnectionStatus::Error).await;
    assert_eq!(state.status_message.as_deref(), Some(ROOM_GONE_MESSAGE));
    // The last snapshot keeps rendering.
    assert!(state.synced_state.is_some());
    assert!(guest.retry().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn end_session_is_idempotent_on_both_sides() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let guest = join(&connector, &host).await;

    guest.end_session().await;
    guest.end_session().await;
    host.end_session().await;
    host.end_session().await;

    assert_eq!(guest.state(), SessionViewState::default());
    assert_eq!(host.state(), SessionViewState::default());
    assert!(guest.send_claim("item1", "p1").is_err());
}

#[tokio::test(start_paused = true)]
async fn guest_leaving_unclaims_its_participant() {
    let connector = MemoryConnector::new();
    let host = host(&connector).await;
    let leaving = join_as(&connector, &host, "p1").await;
    let staying = join_as(&connector, &host, "p2").await;

    leaving.end_session().await;

    let state = wait_for(&staying, |s| {
        s.synced_state
            .as_ref()
            .is_some_and(|p| p.claimed_participant_ids == ["p2"])
    })
    .await;
    assert!(state.synced_state.is_some());
    let roster = host.guests();
    assert_eq!(roster.len(), 2);
    assert_eq!(roster.iter().filter(|g| g.connected).count(), 1);
}

#[cfg(feature = "transport-websocket")]
mod websocket {
    use super::*;
    use common::{bill, config, init_tracing};
    use tabsync::transports::relay::serve;
    use tabsync::transports::{DirectConnector, DirectTransport, RelayConnector, RelayTransport};
    use tabsync::Session;
    use tokio::net::TcpListener;

    async fn claim_round_trip(host: Session, guest: Session) {
        guest.identify("p1", Some("Ana".into())).unwrap();
        wait_for(&host, |s| s.claimed_participant_ids() == ["p1"]).await;

        guest.send_claim("item1", "p1").unwrap();
        wait_for(&guest, |s| {
            s.synced_state
                .as_ref()
                .is_some_and(|p| p.assignments.contains_key("item1"))
        })
        .await;

        guest.end_session().await;
        host.end_session().await;
    }

    #[tokio::test]
    async fn session_over_direct_links() {
        init_tracing();
        let connector = DirectConnector::new().with_bind_addr("127.0.0.1:0".parse().unwrap());
        let host = Session::host(DirectTransport::new(connector.clone(), config()), bill(), config())
            .await
            .unwrap();
        let room_code = host.room_code().unwrap();
        assert!(room_code.starts_with("127.0.0.1:"));

        let guest = Session::join(DirectTransport::new(connector, config()), &room_code)
            .await
            .unwrap();
        claim_round_trip(host, guest).await;
    }

    #[tokio::test]
    async fn session_over_a_relay() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener));

        let host = Session::host(
            RelayTransport::new(RelayConnector::new(url.clone()), config()),
            bill(),
            config(),
        )
        .await
        .unwrap();
        let room_code = host.room_code().unwrap();

        let guest = Session::join(RelayTransport::new(RelayConnector::new(url), config()), &room_code)
            .await
            .unwrap();
        claim_round_trip(host, guest).await;
    }
}
