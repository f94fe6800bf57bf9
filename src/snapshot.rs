//! Building the full-state payload the host broadcasts.

use crate::protocol::SyncPayload;
use crate::store::SessionContext;
use crate::view::SessionViewState;

/// Read every domain store plus the host's view into one [`SyncPayload`].
///
/// Pure: two calls without an intervening mutation return equal payloads.
pub fn build_snapshot(context: &SessionContext, view: &SessionViewState) -> SyncPayload {
    let assignments = context.assignments.get_state();
    SyncPayload {
        items: context.items.get_state(),
        participants: context.participants.get_state(),
        assignments: assignments.assignments,
        portions: assignments.portions,
        tips: context.tips.get_state(),
        phase: view.phase,
        claimed_participant_ids: view.claimed_participant_ids(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BillItem, Participant, SessionPhase, TipChoice, TipMode};
    use crate::view::SessionView;

    fn context() -> SessionContext {
        let context = SessionContext::new();
        context.init(
            vec![
                BillItem::new("soup", "Soup", 7.5),
                BillItem::new("wine", "Wine", 30.0),
            ],
            vec![Participant::new("ana", "Ana"), Participant::new("ben", "Ben")],
        );
        context
    }

    #[test]
    fn repeated_calls_are_equal() {
        let context = context();
        let view = SessionView::new();
        view.add_guest("peer-1");
        view.identify_guest("peer-1", "ben", None);

        let first = build_snapshot(&context, &view.state());
        let second = build_snapshot(&context, &view.state());
        assert_eq!(first, second);
    }

    #[test]
    fn reflects_every_store_and_the_roster() {
        let context = context();
        context.assignments.update(|a| {
            a.claim("soup", "ana");
        });
        context.set_tip("ben", TipChoice::new(TipMode::Fixed, 4.0));

        let view = SessionView::new();
        view.set_phase(SessionPhase::Tips);
        view.add_guest("peer-2");
        view.identify_guest("peer-2", "ben", None);
        view.add_guest("peer-1");
        view.identify_guest("peer-1", "ana", None);
        view.add_guest("peer-3");

        let snapshot = build_snapshot(&context, &view.state());
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.participants.len(), 2);
        assert_eq!(snapshot.assignments.get("soup"), Some(&vec!["ana".to_string()]));
        assert_eq!(
            snapshot.tips.get("ben"),
            Some(&TipChoice::Fixed { amount: 4.0 })
        );
        assert_eq!(snapshot.phase, SessionPhase::Tips);
        assert_eq!(snapshot.claimed_participant_ids, vec!["ana", "ben"]);
    }
}
