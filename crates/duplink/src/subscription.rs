//! Listener registrations for incoming events.
//!
//! Two indexes are kept in step: a per-event list of subscription ids in
//! registration order (fan-out order), and the id → listener table. An
//! event is *active* exactly while it has at least one registered
//! listener; activation edges are what trigger `evt_sub` / `evt_unsub`
//! traffic to the peer.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use duplink_common::SubId;

use crate::link::Command;
use crate::schema::EventListener;

/// Result of removing one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoveOutcome {
    /// The id was not registered (already cancelled).
    NotFound,
    /// Removed; `last_for_name` is set when the event just became
    /// inactive and an unsubscribe should go out.
    Removed {
        last_for_name: bool,
    },
}

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_name: BTreeMap<String, Vec<SubId>>,
    by_id: HashMap<SubId, EventListener>,
}

impl SubscriptionTable {
    /// Registers a listener. Returns `true` when this is the first
    /// listener for the event (the event just became active).
    pub(crate) fn insert(&mut self, name: &str, id: SubId, listener: EventListener) -> bool {
        self.by_id.insert(id, listener);
        let ids = self.by_name.entry(name.to_owned()).or_default();
        ids.push(id);
        ids.len() == 1
    }

    /// Removes a listener registration. Idempotent.
    pub(crate) fn remove(&mut self, name: &str, id: SubId) -> RemoveOutcome {
        if self.by_id.remove(&id).is_none() {
            return RemoveOutcome::NotFound;
        }
        let mut last_for_name = false;
        if let Some(ids) = self.by_name.get_mut(name) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                self.by_name.remove(name);
                last_for_name = true;
            }
        }
        RemoveOutcome::Removed { last_for_name }
    }

    /// Whether the event currently has listeners (is active).
    pub(crate) fn is_active(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Snapshot of the subscription ids for one event, in registration
    /// order. Taken before fan-out so listener side effects cannot
    /// disturb the iteration.
    pub(crate) fn ids_for(&self, name: &str) -> Vec<SubId> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    pub(crate) fn listener(&self, id: SubId) -> Option<&EventListener> {
        self.by_id.get(&id)
    }

    /// All currently active event names.
    pub(crate) fn active_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

/// User-held token for one event listener registration.
///
/// Dropping the handle cancels the listener; [`cancel`](Self::cancel) does
/// so early. Cancellation happens at most once, and becomes a no-op when
/// the link is already gone.
#[derive(Debug)]
pub struct EventSubscription {
    name: &'static str,
    sub_id: SubId,
    commands: mpsc::UnboundedSender<Command>,
    cancelled: bool,
}

impl EventSubscription {
    pub(crate) fn new(
        name: &'static str,
        sub_id: SubId,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            name,
            sub_id,
            commands,
            cancelled: false,
        }
    }

    /// Wire name of the subscribed event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        self.name
    }

    /// Cancels the listener now instead of at drop time. Idempotent.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        // A closed channel means the link is gone and the registration
        // died with it.
        let _ = self.commands.send(Command::CancelSubscription {
            name: self.name,
            sub_id: self.sub_id,
        });
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventListener {
        Box::new(|_| {})
    }

    #[test]
    fn activity_tracks_listener_presence() {
        let mut table = SubscriptionTable::default();
        assert!(!table.is_active("Temp"));

        assert!(table.insert("Temp", 1, noop()));
        assert!(table.is_active("Temp"));

        // Second listener: still active, not a fresh activation.
        assert!(!table.insert("Temp", 2, noop()));

        assert_eq!(
            table.remove("Temp", 1),
            RemoveOutcome::Removed {
                last_for_name: false
            }
        );
        assert!(table.is_active("Temp"));

        assert_eq!(
            table.remove("Temp", 2),
            RemoveOutcome::Removed {
                last_for_name: true
            }
        );
        assert!(!table.is_active("Temp"));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = SubscriptionTable::default();
        table.insert("Temp", 1, noop());
        assert!(matches!(
            table.remove("Temp", 1),
            RemoveOutcome::Removed { .. }
        ));
        assert_eq!(table.remove("Temp", 1), RemoveOutcome::NotFound);
        assert_eq!(table.remove("Other", 9), RemoveOutcome::NotFound);
    }

    #[test]
    fn ids_keep_registration_order() {
        let mut table = SubscriptionTable::default();
        table.insert("Temp", 3, noop());
        table.insert("Temp", 1, noop());
        table.insert("Temp", 7, noop());
        assert_eq!(table.ids_for("Temp"), vec![3, 1, 7]);

        table.remove("Temp", 1);
        assert_eq!(table.ids_for("Temp"), vec![3, 7]);
        assert_eq!(table.ids_for("Unknown"), Vec::<SubId>::new());
    }

    #[test]
    fn handle_cancel_sends_exactly_one_command() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = EventSubscription::new("Temp", 4, tx);
        handle.cancel();
        handle.cancel();
        drop(handle);

        match rx.try_recv() {
            Ok(Command::CancelSubscription { name, sub_id }) => {
                assert_eq!(name, "Temp");
                assert_eq!(sub_id, 4);
            }
            other => panic!("expected cancel command, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropping_the_handle_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(EventSubscription::new("Temp", 9, tx));
        assert!(matches!(
            rx.try_recv(),
            Ok(Command::CancelSubscription { sub_id: 9, .. })
        ));
    }

    #[test]
    fn handle_outliving_the_link_is_inert() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut handle = EventSubscription::new("Temp", 2, tx);
        handle.cancel();
    }
}
