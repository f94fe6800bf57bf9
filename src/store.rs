//! Domain state stores and the session context that bundles them.
//!
//! A [`Store`] is an observable value: read it with
//! [`get_state`](Store::get_state), mutate it with [`update`](Store::update),
//! and watch it with [`subscribe`](Store::subscribe). The host orchestrator
//! subscribes to every store in a [`SessionContext`] and rebroadcasts a
//! snapshot whenever one changes, no matter who changed it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::protocol::{BillItem, ItemId, Participant, PersonId, Portions, TipChoice};

/// An observable, cheaply cloneable value cell.
///
/// Clones share the same value.
#[derive(Debug)]
pub struct Store<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Store<T> {
    pub fn new(initial: T) -> Self {
        Self {
            tx: Arc::new(watch::channel(initial).0),
        }
    }

    /// Borrow the current value for the duration of `f`.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Mutate in place and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Mutate in place; subscribers are notified only if `f` returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Swap in a new value, returning the old one.
    pub fn replace(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    /// A receiver that wakes on every notifying change after this call.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone> Store<T> {
    pub fn get_state(&self) -> T {
        self.tx.borrow().clone()
    }
}

/// Who shares which item, and in what proportions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    /// Item id → assignees, in claim order, without duplicates.
    pub assignments: BTreeMap<ItemId, Vec<PersonId>>,
    /// Item id → custom weights, only for unevenly split items.
    pub portions: BTreeMap<ItemId, Portions>,
}

impl Assignments {
    /// Add `person_id` to the item. Returns `false` if already assigned.
    ///
    /// Custom portions for the item are dropped: they described the old
    /// assignee set.
    pub fn claim(&mut self, item_id: &str, person_id: &str) -> bool {
        let assignees = self.assignments.entry(item_id.to_string()).or_default();
        if assignees.iter().any(|p| p == person_id) {
            return false;
        }
        assignees.push(person_id.to_string());
        self.portions.remove(item_id);
        true
    }

    /// Remove `person_id` from the item. Returns `false` if not assigned.
    pub fn unclaim(&mut self, item_id: &str, person_id: &str) -> bool {
        let Some(assignees) = self.assignments.get_mut(item_id) else {
            return false;
        };
        let before = assignees.len();
        assignees.retain(|p| p != person_id);
        if assignees.len() == before {
            return false;
        }
        if assignees.is_empty() {
            self.assignments.remove(item_id);
        }
        self.portions.remove(item_id);
        true
    }

    /// Replace the item's assignees and custom portions in one step.
    ///
    /// An empty assignee list clears the item entirely.
    pub fn set_assignees(
        &mut self,
        item_id: &str,
        person_ids: &[PersonId],
        portions: Option<Portions>,
    ) {
        let mut assignees: Vec<PersonId> = Vec::with_capacity(person_ids.len());
        for person_id in person_ids {
            if !assignees.contains(person_id) {
                assignees.push(person_id.clone());
            }
        }
        if assignees.is_empty() {
            self.assignments.remove(item_id);
            self.portions.remove(item_id);
            return;
        }
        match portions {
            Some(portions) => {
                let portions: Portions = portions
                    .into_iter()
                    .filter(|(person_id, _)| assignees.contains(person_id))
                    .collect();
                self.portions.insert(item_id.to_string(), portions);
            }
            None => {
                self.portions.remove(item_id);
            }
        }
        self.assignments.insert(item_id.to_string(), assignees);
    }

    pub fn assignees(&self, item_id: &str) -> &[PersonId] {
        self.assignments
            .get(item_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Every domain store a session works with, passed explicitly to the
/// orchestrator and the UI layer.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub items: Store<Vec<BillItem>>,
    pub participants: Store<Vec<Participant>>,
    pub assignments: Store<Assignments>,
    pub tips: Store<BTreeMap<PersonId, TipChoice>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a bill. Claims and tips from any previous bill are cleared.
    pub fn init(&self, items: Vec<BillItem>, participants: Vec<Participant>) {
        self.items.replace(items);
        self.participants.replace(participants);
        self.assignments.replace(Assignments::default());
        self.tips.replace(BTreeMap::new());
    }

    /// Clear every store.
    pub fn teardown(&self) {
        self.init(Vec::new(), Vec::new());
    }

    pub fn has_item(&self, item_id: &str) -> bool {
        self.items.read(|items| items.iter().any(|item| item.id == item_id))
    }

    pub fn set_tip(&self, person_id: &str, choice: TipChoice) -> bool {
        self.tips.update_if(|tips| {
            let previous = tips.insert(person_id.to_string(), choice);
            previous != Some(choice)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::protocol::TipMode;

    #[test]
    fn claim_is_idempotent_and_keeps_order() {
        let mut a = Assignments::default();
        assert!(a.claim("soup", "ana"));
        assert!(a.claim("soup", "ben"));
        assert!(!a.claim("soup", "ana"));
        assert_eq!(a.assignees("soup"), ["ana", "ben"]);
    }

    #[test]
    fn unclaiming_last_assignee_removes_the_item() {
        let mut a = Assignments::default();
        a.claim("soup", "ana");
        assert!(!a.unclaim("soup", "ben"));
        assert!(a.unclaim("soup", "ana"));
        assert!(a.assignments.is_empty());
        assert!(!a.unclaim("bread", "ana"));
    }

    #[test]
    fn claim_and_unclaim_drop_custom_portions() {
        let mut a = Assignments::default();
        let portions = Portions::from([("ana".into(), 2.0), ("ben".into(), 1.0)]);
        a.set_assignees("wine", &["ana".into(), "ben".into()], Some(portions));
        assert!(a.portions.contains_key("wine"));

        a.claim("wine", "cy");
        assert!(!a.portions.contains_key("wine"));

        a.set_assignees(
            "wine",
            &["ana".into(), "ben".into()],
            Some(Portions::from([("ana".into(), 3.0)])),
        );
        a.unclaim("wine", "ben");
        assert!(!a.portions.contains_key("wine"));
    }

    #[test]
    fn set_assignees_dedupes_and_drops_foreign_weights() {
        let mut a = Assignments::default();
        a.set_assignees(
            "pizza",
            &["ana".into(), "ana".into(), "ben".into()],
            Some(Portions::from([("ana".into(), 2.0), ("zed".into(), 9.0)])),
        );
        assert_eq!(a.assignees("pizza"), ["ana", "ben"]);
        assert_eq!(a.portions["pizza"], Portions::from([("ana".into(), 2.0)]));

        a.set_assignees("pizza", &[], None);
        assert!(a.assignments.is_empty() && a.portions.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = Store::new(0u32);
        let mut rx = store.subscribe();
        store.update(|v| *v += 1);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(store.get_state(), 1);
    }

    #[test]
    fn unchanged_tip_does_not_notify() {
        let context = SessionContext::new();
        let rx = context.tips.subscribe();
        let tip = TipChoice::new(TipMode::Percentage, 18.0);
        assert!(context.set_tip("ana", tip));
        assert!(rx.has_changed().unwrap());

        let rx = context.tips.subscribe();
        assert!(!context.set_tip("ana", tip));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn init_and_teardown_reset_claims_and_tips() {
        let context = SessionContext::new();
        context.init(
            vec![BillItem::new("soup", "Soup", 7.5)],
            vec![Participant::new("ana", "Ana")],
        );
        context.assignments.update(|a| {
            a.claim("soup", "ana");
        });
        context.set_tip("ana", TipChoice::new(TipMode::Fixed, 2.0));
        assert!(context.has_item("soup"));

        context.teardown();
        assert!(context.items.get_state().is_empty());
        assert_eq!(context.assignments.get_state(), Assignments::default());
        assert!(context.tips.get_state().is_empty());
    }
}
