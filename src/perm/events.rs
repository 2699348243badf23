/// Explicit event bus for permission state changes.
///
/// Listeners subscribe per event kind with a closure. Events are raised after
/// a state change has been fully applied, and never during an import (the
/// import reports its outcome through `ImportReport` instead).
use std::collections::BTreeMap;

use crate::perm::ids::{DefIndex, GroupId, PlayerId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PermissionEvent {
    GroupDuplicated {
        group: GroupId,
        source: GroupId,
        /// Participant that submitted the op, so its own replica can react.
        initiator: PlayerId,
    },
    GroupDeleted {
        group: GroupId,
        replacement: GroupId,
        initiator: PlayerId,
    },
    GroupRenamed {
        group: GroupId,
        previous_name: String,
        initiator: PlayerId,
    },
    PlayerGroupChanged {
        player: PlayerId,
        previous: Option<GroupId>,
        current: Option<GroupId>,
    },
    PermissionValueChanged {
        group: GroupId,
        definition: DefIndex,
        value: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    GroupDuplicated,
    GroupDeleted,
    GroupRenamed,
    PlayerGroupChanged,
    PermissionValueChanged,
}

impl PermissionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PermissionEvent::GroupDuplicated { .. } => EventKind::GroupDuplicated,
            PermissionEvent::GroupDeleted { .. } => EventKind::GroupDeleted,
            PermissionEvent::GroupRenamed { .. } => EventKind::GroupRenamed,
            PermissionEvent::PlayerGroupChanged { .. } => EventKind::PlayerGroupChanged,
            PermissionEvent::PermissionValueChanged { .. } => EventKind::PermissionValueChanged,
        }
    }
}

/// Subscription token returned by `EventBus::subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&PermissionEvent)>;

#[derive(Default)]
pub struct EventBus {
    listeners: BTreeMap<EventKind, Vec<(SubscriptionId, Listener)>>,
    next_id: u64,
    suppressed: u32,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Call `listener` for every event of `kind`, in subscription order.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        listener: impl FnMut(&PermissionEvent) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for list in self.listeners.values_mut() {
            if let Some(pos) = list.iter().position(|(sub, _)| *sub == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Stop delivering events until the matching `resume`. Nests.
    pub(crate) fn suppress(&mut self) {
        self.suppressed += 1;
    }

    pub(crate) fn resume(&mut self) {
        self.suppressed = self.suppressed.saturating_sub(1);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed > 0
    }

    pub(crate) fn emit(&mut self, event: PermissionEvent) {
        if self.is_suppressed() {
            return;
        }
        if let Some(list) = self.listeners.get_mut(&event.kind()) {
            for (_, listener) in list.iter_mut() {
                listener(&event);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&EventKind, usize> =
            self.listeners.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}
