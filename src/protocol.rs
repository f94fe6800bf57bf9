//! Wire protocol types for host/guest session sync.
//!
//! Every frame is a JSON object tagged by a `"type"` field. The two
//! application directions are disjoint:
//!
//! - [`GuestMessage`]: intents a guest sends to the host (`IDENTIFY`, `CLAIM_ITEM`, ...)
//! - [`HostMessage`]: authoritative state the host pushes out (`SYNC_STATE`, `PHASE_CHANGE`)
//!
//! A third, internal liveness sub-protocol (`__PING` / `__PONG`) shares the
//! same framing and is filtered out by [`decode_frame`] before application
//! code ever sees it.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Identifiers ─────────────────────────────────────────────────────

/// Transport-level connection identity. Reissued on every reconnect.
pub type PeerId = String;

/// Domain-level participant identity, stable across reconnects.
pub type PersonId = String;

/// Identifier of one line item on the bill.
pub type ItemId = String;

/// Weighted share of an item per participant, for uneven splits.
pub type Portions = BTreeMap<PersonId, f64>;

// ── Domain values ───────────────────────────────────────────────────

/// One stage of the shared workflow.
///
/// Phases are ordered; the host only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Lobby,
    Claiming,
    Tips,
    Summary,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lobby => "lobby",
            Self::Claiming => "claiming",
            Self::Tips => "tips",
            Self::Summary => "summary",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A line item on the bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillItem {
    pub id: ItemId,
    pub name: String,
    /// Total price of the line (all units).
    pub price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl BillItem {
    pub fn new(id: impl Into<ItemId>, name: impl Into<String>, price: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            quantity: 1,
        }
    }
}

/// A person splitting the bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: PersonId,
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<PersonId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// How a tip value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipMode {
    Percentage,
    Fixed,
}

/// One participant's tip choice, as carried in snapshots.
///
/// Serializes as `{"mode":"percentage","percentage":20.0}` or
/// `{"mode":"fixed","amount":5.0}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TipChoice {
    Percentage { percentage: f64 },
    Fixed { amount: f64 },
}

impl TipChoice {
    pub fn new(mode: TipMode, value: f64) -> Self {
        match mode {
            TipMode::Percentage => Self::Percentage { percentage: value },
            TipMode::Fixed => Self::Fixed { amount: value },
        }
    }

    pub fn mode(&self) -> TipMode {
        match self {
            Self::Percentage { .. } => TipMode::Percentage,
            Self::Fixed { .. } => TipMode::Fixed,
        }
    }
}

/// A full, self-sufficient copy of shared session state.
///
/// Always a wholesale replacement, never a diff: applying the latest payload
/// is correct no matter how many earlier ones were skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub items: Vec<BillItem>,
    pub participants: Vec<Participant>,
    /// Item id → participants sharing that item.
    pub assignments: BTreeMap<ItemId, Vec<PersonId>>,
    /// Item id → custom weights, present only for unevenly split items.
    #[serde(default)]
    pub portions: BTreeMap<ItemId, Portions>,
    #[serde(default)]
    pub tips: BTreeMap<PersonId, TipChoice>,
    pub phase: SessionPhase,
    /// Participants currently bound to a connected guest device.
    #[serde(default)]
    pub claimed_participant_ids: Vec<PersonId>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Intents sent from a guest to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestMessage {
    /// Bind this connection to a participant.
    #[serde(rename_all = "camelCase")]
    Identify {
        person_id: PersonId,
        #[serde(default)]
        display_name: Option<String>,
    },
    /// Add a participant to an item's assignees.
    #[serde(rename_all = "camelCase")]
    ClaimItem { item_id: ItemId, person_id: PersonId },
    /// Remove a participant from an item's assignees.
    #[serde(rename_all = "camelCase")]
    UnclaimItem { item_id: ItemId, person_id: PersonId },
    /// Replace an item's assignees and, optionally, its custom portions.
    #[serde(rename_all = "camelCase")]
    SetAssignees {
        item_id: ItemId,
        person_ids: Vec<PersonId>,
        #[serde(default)]
        portions: Option<Portions>,
    },
    /// Set one participant's tip.
    #[serde(rename_all = "camelCase")]
    SetTip {
        person_id: PersonId,
        mode: TipMode,
        value: f64,
    },
}

/// State pushed from the host to guests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    /// Full snapshot replacement.
    SyncState { payload: SyncPayload },
    /// The host advanced the workflow.
    PhaseChange { phase: SessionPhase },
}

/// Liveness frames. Never surfaced to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Heartbeat {
    #[serde(rename = "__PING")]
    Ping,
    #[serde(rename = "__PONG")]
    Pong,
}

const PING_TAG: &str = "__PING";
const PONG_TAG: &str = "__PONG";

/// Pre-encoded ping frame.
pub(crate) const PING_FRAME: &str = r#"{"type":"__PING"}"#;
/// Pre-encoded pong frame.
pub(crate) const PONG_FRAME: &str = r#"{"type":"__PONG"}"#;

// ── Validation ──────────────────────────────────────────────────────

/// Why an inbound frame was rejected.
#[derive(Debug, Error)]
pub enum InvalidFrame {
    /// Not JSON, or JSON that does not match any message shape for this direction.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Well-formed JSON whose contents break a protocol rule.
    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

/// A message type that can travel over a link in one direction.
pub trait WireMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Check rules that the JSON shape alone cannot express.
    fn validate(&self) -> Result<(), &'static str>;
}

impl WireMessage for GuestMessage {
    fn validate(&self) -> Result<(), &'static str> {
        match self {
            Self::Identify { person_id, .. } => non_empty(person_id, "empty personId"),
            Self::ClaimItem { item_id, person_id } | Self::UnclaimItem { item_id, person_id } => {
                non_empty(item_id, "empty itemId")?;
                non_empty(person_id, "empty personId")
            }
            Self::SetAssignees {
                item_id,
                person_ids,
                portions,
            } => {
                non_empty(item_id, "empty itemId")?;
                if person_ids.iter().any(String::is_empty) {
                    return Err("empty personId in assignees");
                }
                let weights_ok = portions
                    .iter()
                    .flat_map(|p| p.values())
                    .all(|w| w.is_finite() && *w >= 0.0);
                if weights_ok {
                    Ok(())
                } else {
                    Err("portion weights must be finite and non-negative")
                }
            }
            Self::SetTip {
                person_id, value, ..
            } => {
                non_empty(person_id, "empty personId")?;
                if value.is_finite() && *value >= 0.0 {
                    Ok(())
                } else {
                    Err("tip value must be finite and non-negative")
                }
            }
        }
    }
}

impl WireMessage for HostMessage {
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }
}

fn non_empty(value: &str, reason: &'static str) -> Result<(), &'static str> {
    if value.is_empty() {
        Err(reason)
    } else {
        Ok(())
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<M> {
    Ping,
    Pong,
    Message(M),
}

/// Decode one inbound text frame for the direction `M`.
///
/// Heartbeat frames are recognised first; everything else must match `M`
/// and pass [`WireMessage::validate`].
pub fn decode_frame<M: WireMessage>(text: &str) -> Result<Frame<M>, InvalidFrame> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value.get("type").and_then(serde_json::Value::as_str) {
        Some(PING_TAG) => return Ok(Frame::Ping),
        Some(PONG_TAG) => return Ok(Frame::Pong),
        Some(_) => {}
        None => return Err(InvalidFrame::Invalid("missing type tag")),
    }
    let message: M = serde_json::from_value(value)?;
    message.validate().map_err(InvalidFrame::Invalid)?;
    Ok(Frame::Message(message))
}

/// Encode an outbound message as a text frame.
pub fn encode<M: Serialize>(message: &M) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
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
    use serde_json::json;

    #[test]
    fn guest_messages_use_screaming_tags_and_camel_fields() {
        let msg = GuestMessage::ClaimItem {
            item_id: "item1".into(),
            person_id: "p1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "CLAIM_ITEM", "itemId": "item1", "personId": "p1"})
        );
    }

    #[test]
    fn tip_choice_wire_shape() {
        let value = serde_json::to_value(TipChoice::new(TipMode::Percentage, 20.0)).unwrap();
        assert_eq!(value, json!({"mode": "percentage", "percentage": 20.0}));
        let value = serde_json::to_value(TipChoice::new(TipMode::Fixed, 5.5)).unwrap();
        assert_eq!(value, json!({"mode": "fixed", "amount": 5.5}));
    }

    #[test]
    fn phase_change_wire_shape() {
        let text = encode(&HostMessage::PhaseChange {
            phase: SessionPhase::Tips,
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"PHASE_CHANGE","phase":"tips"}"#);
    }

    #[test]
    fn heartbeat_frames_are_filtered() {
        assert_eq!(
            decode_frame::<GuestMessage>(PING_FRAME).unwrap(),
            Frame::Ping
        );
        assert_eq!(decode_frame::<HostMessage>(PONG_FRAME).unwrap(), Frame::Pong);
        assert_eq!(
            encode(&Heartbeat::Ping).unwrap(),
            PING_FRAME,
            "pre-encoded ping must match the serde form"
        );
    }

    #[test]
    fn identify_without_display_name_decodes() {
        let frame =
            decode_frame::<GuestMessage>(r#"{"type":"IDENTIFY","personId":"p1"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Message(GuestMessage::Identify {
                person_id: "p1".into(),
                display_name: None,
            })
        );
    }

    #[test]
    fn rejects_unknown_tags_and_wrong_direction() {
        assert!(decode_frame::<GuestMessage>(r#"{"type":"SELF_DESTRUCT"}"#).is_err());
        // A host message arriving at the host is not a valid guest intent.
        assert!(decode_frame::<GuestMessage>(r#"{"type":"PHASE_CHANGE","phase":"tips"}"#).is_err());
        assert!(decode_frame::<HostMessage>(r#"{"type":"CLAIM_ITEM","itemId":"a","personId":"b"}"#).is_err());
    }

    #[test]
    fn rejects_malformed_json_and_missing_tag() {
        assert!(matches!(
            decode_frame::<GuestMessage>("not json"),
            Err(InvalidFrame::Malformed(_))
        ));
        assert!(matches!(
            decode_frame::<GuestMessage>(r#"{"personId":"p1"}"#),
            Err(InvalidFrame::Invalid(_))
        ));
        assert!(decode_frame::<GuestMessage>("[1,2,3]").is_err());
    }

    #[test]
    fn rejects_semantically_invalid_intents() {
        let negative_tip = r#"{"type":"SET_TIP","personId":"p1","mode":"fixed","value":-3}"#;
        assert!(matches!(
            decode_frame::<GuestMessage>(negative_tip),
            Err(InvalidFrame::Invalid(_))
        ));
        let empty_item = r#"{"type":"CLAIM_ITEM","itemId":"","personId":"p1"}"#;
        assert!(decode_frame::<GuestMessage>(empty_item).is_err());
        let bad_weight = r#"{"type":"SET_ASSIGNEES","itemId":"i","personIds":["a"],"portions":{"a":-1}}"#;
        assert!(decode_frame::<GuestMessage>(bad_weight).is_err());
    }

    #[test]
    fn sync_state_decodes_with_defaults() {
        let text = r#"{"type":"SYNC_STATE","payload":{"items":[{"id":"i1","name":"Soup","price":7.5}],"participants":[],"assignments":{},"phase":"claiming"}}"#;
        let Frame::Message(HostMessage::SyncState { payload }) =
            decode_frame::<HostMessage>(text).unwrap()
        else {
            panic!("expected SYNC_STATE");
        };
        assert_eq!(payload.phase, SessionPhase::Claiming);
        assert_eq!(payload.items[0].quantity, 1);
        assert!(payload.tips.is_empty());
    }

    #[test]
    fn phases_are_ordered() {
        assert!(SessionPhase::Lobby < SessionPhase::Claiming);
        assert!(SessionPhase::Claiming < SessionPhase::Tips);
        assert!(SessionPhase::Tips < SessionPhase::Summary);
    }
}
