#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire-format tests for the tabsync protocol.
//!
//! Fixtures are the literal JSON a peer puts on the wire, so a change to a
//! serde attribute that would break interoperability fails here.

use serde_json::{json, Value};
use tabsync::error_kind::ErrorKind;
use tabsync::protocol::{decode_frame, encode, Frame, InvalidFrame};
use tabsync::{
    BillItem, GuestMessage, HostMessage, Participant, SessionPhase, SyncPayload, TipChoice,
    TipMode,
};

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

fn guest(text: &str) -> GuestMessage {
    match decode_frame::<GuestMessage>(text) {
        Ok(Frame::Message(message)) => message,
        other => panic!("expected a guest message, got {other:?}"),
    }
}

fn host(text: &str) -> HostMessage {
    match decode_frame::<HostMessage>(text) {
        Ok(Frame::Message(message)) => message,
        other => panic!("expected a host message, got {other:?}"),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::from_str(&encode(value).unwrap()).unwrap()
}

// ════════════════════════════════════════════════════════════════════
// Guest → host fixtures
// ════════════════════════════════════════════════════════════════════

#[test]
fn identify_fixture() {
    let message = guest(r#"{"type":"IDENTIFY","personId":"p1","displayName":"Ana"}"#);
    assert_eq!(
        message,
        GuestMessage::Identify {
            person_id: "p1".into(),
            display_name: Some("Ana".into()),
        }
    );
}

#[test]
fn claim_and_unclaim_fixtures() {
    assert_eq!(
        guest(r#"{"type":"CLAIM_ITEM","itemId":"item1","personId":"p1"}"#),
        GuestMessage::ClaimItem {
            item_id: "item1".into(),
            person_id: "p1".into(),
        }
    );
    assert_eq!(
        guest(r#"{"type":"UNCLAIM_ITEM","itemId":"item1","personId":"p1"}"#),
        GuestMessage::UnclaimItem {
            item_id: "item1".into(),
            person_id: "p1".into(),
        }
    );
}

#[test]
fn set_assignees_fixture_with_and_without_portions() {
    let with = guest(
        r#"{"type":"SET_ASSIGNEES","itemId":"item3","personIds":["p1","p2"],"portions":{"p1":2,"p2":1}}"#,
    );
    let GuestMessage::SetAssignees {
        person_ids,
        portions: Some(portions),
        ..
    } = with
    else {
        panic!("expected SET_ASSIGNEES with portions");
    };
    assert_eq!(person_ids, vec!["p1", "p2"]);
    assert_eq!(portions["p1"], 2.0);

    let without = guest(r#"{"type":"SET_ASSIGNEES","itemId":"item3","personIds":[]}"#);
    assert!(matches!(
        without,
        GuestMessage::SetAssignees { portions: None, .. }
    ));
}

#[test]
fn set_tip_fixture() {
    assert_eq!(
        guest(r#"{"type":"SET_TIP","personId":"p2","mode":"percentage","value":20}"#),
        GuestMessage::SetTip {
            person_id: "p2".into(),
            mode: TipMode::Percentage,
            value: 20.0,
        }
    );
}

#[test]
fn guest_messages_encode_to_the_fixture_shape() {
    let message = GuestMessage::SetTip {
        person_id: "p2".into(),
        mode: TipMode::Fixed,
        value: 5.0,
    };
    assert_eq!(
        to_value(&message),
        json!({"type": "SET_TIP", "personId": "p2", "mode": "fixed", "value": 5.0})
    );
}

// ════════════════════════════════════════════════════════════════════
// Host → guest fixtures
// ════════════════════════════════════════════════════════════════════

fn sample_payload() -> SyncPayload {
    SyncPayload {
        items: vec![BillItem::new("item1", "Ramen", 14.0)],
        participants: vec![Participant::new("p1", "Ana"), Participant::new("p2", "Ben")],
        assignments: [("item1".to_string(), vec!["p1".to_string()])].into(),
        portions: Default::default(),
        tips: [("p2".to_string(), TipChoice::new(TipMode::Percentage, 20.0))].into(),
        phase: SessionPhase::Claiming,
        claimed_participant_ids: vec!["p1".into(), "p2".into()],
    }
}

#[test]
fn sync_state_encodes_camel_case_payload() {
    let value = to_value(&HostMessage::SyncState {
        payload: sample_payload(),
    });
    assert_eq!(value["type"], "SYNC_STATE");
    let payload = &value["payload"];
    assert_eq!(payload["phase"], "claiming");
    assert_eq!(payload["assignments"]["item1"], json!(["p1"]));
    assert_eq!(
        payload["tips"]["p2"],
        json!({"mode": "percentage", "percentage": 20.0})
    );
    assert_eq!(payload["claimedParticipantIds"], json!(["p1", "p2"]));
    assert_eq!(
        payload["items"][0],
        json!({"id": "item1", "name": "Ramen", "price": 14.0, "quantity": 1})
    );
}

#[test]
fn sync_state_decodes_what_it_encodes() {
    let text = encode(&HostMessage::SyncState {
        payload: sample_payload(),
    })
    .unwrap();
    assert_eq!(
        host(&text),
        HostMessage::SyncState {
            payload: sample_payload()
        }
    );
}

#[test]
fn phase_change_fixture() {
    assert_eq!(
        host(r#"{"type":"PHASE_CHANGE","phase":"summary"}"#),
        HostMessage::PhaseChange {
            phase: SessionPhase::Summary
        }
    );
    assert!(decode_frame::<HostMessage>(r#"{"type":"PHASE_CHANGE","phase":"dessert"}"#).is_err());
}

#[test]
fn fixed_tip_fixture() {
    let choice: TipChoice = serde_json::from_str(r#"{"mode":"fixed","amount":5.0}"#).unwrap();
    assert_eq!(choice, TipChoice::Fixed { amount: 5.0 });
    assert_eq!(choice.mode(), TipMode::Fixed);
}

// ════════════════════════════════════════════════════════════════════
// Liveness and validation
// ════════════════════════════════════════════════════════════════════

#[test]
fn heartbeats_never_decode_as_messages() {
    for text in [r#"{"type":"__PING"}"#, r#"{"type":"__PONG"}"#] {
        assert!(matches!(
            decode_frame::<GuestMessage>(text).unwrap(),
            Frame::Ping | Frame::Pong
        ));
        assert!(matches!(
            decode_frame::<HostMessage>(text).unwrap(),
            Frame::Ping | Frame::Pong
        ));
    }
}

#[test]
fn invalid_frames_are_classified_not_fatal() {
    let cases = [
        "",
        "null",
        "42",
        r#"{"type":7}"#,
        r#"{"type":"CLAIM_ITEM"}"#,
        r#"{"type":"SET_TIP","personId":"p1","mode":"tip-jar","value":1}"#,
        r#"{"type":"IDENTIFY","personId":""}"#,
        r#"{"type":"SYNC_STATE","payload":{}}"#,
    ];
    for text in cases {
        let err = decode_frame::<GuestMessage>(text).unwrap_err();
        assert!(matches!(err, InvalidFrame::Malformed(_) | InvalidFrame::Invalid(_)));
    }
}

#[test]
fn error_kinds_use_screaming_snake_case() {
    assert_eq!(
        serde_json::to_value(ErrorKind::RoomNotFound).unwrap(),
        json!("ROOM_NOT_FOUND")
    );
    assert_eq!(
        serde_json::to_value(ErrorKind::MessageValidationFailure).unwrap(),
        json!("MESSAGE_VALIDATION_FAILURE")
    );
}
