//! Batched change notification.
//!
//! Mutations only OR bits into a [`ChangeSet`]; delivery happens in one drain
//! per flush. Observers get the store by shared reference, so nothing they do
//! can mutate it while the drain is running.

use std::collections::HashSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::store::InventoryStore;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChangeMask(u32);

impl ChangeMask {
    pub const NONE: ChangeMask = ChangeMask(0);
    /// Name changed.
    pub const LABEL: ChangeMask = ChangeMask(1);
    /// Bookkeeping changed (version, counts, metadata) without moving anything.
    pub const INTERNAL: ChangeMask = ChangeMask(1 << 1);
    pub const ADD: ChangeMask = ChangeMask(1 << 2);
    pub const REMOVE: ChangeMask = ChangeMask(1 << 3);
    /// Parent/child relationships changed.
    pub const STRUCTURE: ChangeMask = ChangeMask(1 << 4);
    /// Too much changed to describe; consumers should rebuild their views.
    pub const REBUILD: ChangeMask = ChangeMask(1 << 5);
    /// Object created by a local user action.
    pub const CREATE: ChangeMask = ChangeMask(1 << 6);
    pub const ALL: ChangeMask = ChangeMask(0x7f);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ChangeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ChangeMask {
    type Output = ChangeMask;

    fn bitor(self, rhs: ChangeMask) -> ChangeMask {
        ChangeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeMask {
    fn bitor_assign(&mut self, rhs: ChangeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ChangeMask, &str); 7] = [
            (ChangeMask::LABEL, "LABEL"),
            (ChangeMask::INTERNAL, "INTERNAL"),
            (ChangeMask::ADD, "ADD"),
            (ChangeMask::REMOVE, "REMOVE"),
            (ChangeMask::STRUCTURE, "STRUCTURE"),
            (ChangeMask::REBUILD, "REBUILD"),
            (ChangeMask::CREATE, "CREATE"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "ChangeMask(NONE)")
        } else {
            write!(f, "ChangeMask({})", names.join(" | "))
        }
    }
}

/// Accumulated, not yet delivered changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub mask: ChangeMask,
    pub ids: HashSet<Uuid>,
}

impl ChangeSet {
    pub fn record(&mut self, mask: ChangeMask, id: Uuid) {
        self.mask |= mask;
        self.ids.insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty() && self.ids.is_empty()
    }
}

/// Something the user should be told about, independent of tree changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Alert {
    /// The server sent data for an object the user acted on that could not be understood.
    ParseFailure {
        object_id: Option<Uuid>,
        message: String,
    },
    /// A fetch was given up on.
    FetchExhausted { id: Uuid, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub mask: ChangeMask,
    pub changed_ids: HashSet<Uuid>,
    pub alerts: Vec<Alert>,
}

pub trait InventoryObserver: Send {
    fn changed(&mut self, store: &InventoryStore, notification: &Notification);
}

impl<F> InventoryObserver for F
where
    F: FnMut(&InventoryStore, &Notification) + Send,
{
    fn changed(&mut self, store: &InventoryStore, notification: &Notification) {
        self(store, notification)
    }
}

/// Forwards notifications to an async consumer.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl InventoryObserver for ChannelObserver {
    fn changed(&mut self, _store: &InventoryStore, notification: &Notification) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(notification.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverBus {
    observers: Vec<(ObserverId, Box<dyn InventoryObserver>)>,
    next_id: u64,
}

impl ObserverBus {
    pub fn subscribe(&mut self, observer: Box<dyn InventoryObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers one aggregated notification to every observer. Returns false
    /// when there was nothing to say.
    pub fn deliver(&mut self, store: &InventoryStore, changes: ChangeSet, alerts: Vec<Alert>) -> bool {
        if changes.is_empty() && alerts.is_empty() {
            return false;
        }
        let notification = Notification {
            mask: changes.mask,
            changed_ids: changes.ids,
            alerts,
        };
        for (_, observer) in &mut self.observers {
            observer.changed(store, &notification);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn mask_debug_lists_set_bits() {
        let mask = ChangeMask::ADD | ChangeMask::STRUCTURE;
        assert_eq!(format!("{mask:?}"), "ChangeMask(ADD | STRUCTURE)");
        assert!(mask.contains(ChangeMask::ADD));
        assert!(!mask.contains(ChangeMask::REMOVE));
        assert!(ChangeMask::ALL.contains(mask));
    }

    #[test]
    fn each_observer_gets_one_aggregated_notification() {
        let store = InventoryStore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = ObserverBus::default();
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            bus.subscribe(Box::new(move |_: &InventoryStore, n: &Notification| {
                seen.lock().unwrap().push(n.mask);
            }));
        }

        let mut changes = ChangeSet::default();
        changes.record(ChangeMask::ADD, Uuid::new_v4());
        changes.record(ChangeMask::LABEL, Uuid::new_v4());
        assert!(bus.deliver(&store, changes, Vec::new()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|m| *m == ChangeMask::ADD | ChangeMask::LABEL));
    }

    #[test]
    fn empty_flush_delivers_nothing() {
        let store = InventoryStore::default();
        let mut bus = ObserverBus::default();
        let (observer, mut rx) = ChannelObserver::new();
        bus.subscribe(Box::new(observer));

        assert!(!bus.deliver(&store, ChangeSet::default(), Vec::new()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribed_observer_stops_receiving() {
        let store = InventoryStore::default();
        let mut bus = ObserverBus::default();
        let (observer, mut rx) = ChannelObserver::new();
        let id = bus.subscribe(Box::new(observer));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        let mut changes = ChangeSet::default();
        changes.record(ChangeMask::REMOVE, Uuid::new_v4());
        bus.deliver(&store, changes, Vec::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn alerts_alone_trigger_delivery() {
        let store = InventoryStore::default();
        let mut bus = ObserverBus::default();
        let (observer, mut rx) = ChannelObserver::new();
        bus.subscribe(Box::new(observer));

        let alert = Alert::FetchExhausted {
            id: Uuid::new_v4(),
            reason: "gave up".into(),
        };
        assert!(bus.deliver(&store, ChangeSet::default(), vec![alert.clone()]));
        let notification = rx.try_recv().unwrap();
        assert!(notification.mask.is_empty());
        assert_eq!(notification.alerts, vec![alert]);
    }
}
