/// Participant → group assignment.
///
/// Every active participant is in exactly one live group. Each group keeps two
/// dense lists (`members`, `online_members`) and every participant remembers
/// its own position in both, so moving a participant is O(1): swap the last
/// entry into the vacated slot and fix that entry's stored index.
use std::collections::BTreeMap;
use thiserror::Error;

use crate::perm::groups::GroupStore;
use crate::perm::ids::{DefIndex, GroupId, PlayerId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("Participant {0} not found")]
    PlayerNotFound(PlayerId),

    #[error("Participant {0} already joined")]
    AlreadyJoined(PlayerId),

    #[error("Group {0} not found")]
    GroupNotFound(GroupId),
}

// ---------------------------------------------------------------------------
// PlayerAssignment
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerAssignment {
    group: Option<GroupId>,
    online: bool,
    index_in_members: Option<usize>,
    index_in_online: Option<usize>,
}

impl PlayerAssignment {
    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn index_in_members(&self) -> Option<usize> {
        self.index_in_members
    }

    pub fn index_in_online(&self) -> Option<usize> {
        self.index_in_online
    }
}

/// Result of a group change that actually moved a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupSwitch {
    pub player: PlayerId,
    pub previous: Option<GroupId>,
    pub current: Option<GroupId>,
}

// ---------------------------------------------------------------------------
// PlayerAssignmentTracker
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerAssignmentTracker {
    players: BTreeMap<PlayerId, PlayerAssignment>,
}

impl PlayerAssignmentTracker {
    pub fn new() -> Self {
        PlayerAssignmentTracker {
            players: BTreeMap::new(),
        }
    }

    pub fn get(&self, player: PlayerId) -> Option<&PlayerAssignment> {
        self.players.get(&player)
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.players.contains_key(&player)
    }

    pub fn group_of(&self, player: PlayerId) -> Option<GroupId> {
        self.players.get(&player).and_then(|a| a.group)
    }

    /// Participants in id order.
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, &PlayerAssignment)> + '_ {
        self.players.iter().map(|(p, a)| (*p, a))
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Register a new participant in the default group.
    pub fn join(
        &mut self,
        groups: &mut GroupStore,
        player: PlayerId,
        online: bool,
    ) -> Result<GroupSwitch, AssignmentError> {
        if self.players.contains_key(&player) {
            return Err(AssignmentError::AlreadyJoined(player));
        }
        self.players.insert(
            player,
            PlayerAssignment {
                group: None,
                online,
                index_in_members: None,
                index_in_online: None,
            },
        );
        let default = groups.default_group_id();
        self.attach(groups, player, default);
        Ok(GroupSwitch {
            player,
            previous: None,
            current: Some(default),
        })
    }

    /// Move `player` to `group`. `None` clears membership without placing the
    /// participant anywhere. `Ok(None)` when the participant is already there.
    pub fn set_group(
        &mut self,
        groups: &mut GroupStore,
        player: PlayerId,
        group: Option<GroupId>,
    ) -> Result<Option<GroupSwitch>, AssignmentError> {
        let previous = self
            .players
            .get(&player)
            .ok_or(AssignmentError::PlayerNotFound(player))?
            .group;
        if let Some(g) = group {
            if !groups.contains(g) {
                return Err(AssignmentError::GroupNotFound(g));
            }
        }
        if previous == group {
            return Ok(None);
        }

        self.detach(groups, player);
        if let Some(g) = group {
            self.attach(groups, player, g);
        }
        Ok(Some(GroupSwitch {
            player,
            previous,
            current: group,
        }))
    }

    /// Toggle online state without changing group. `Ok(false)` if unchanged.
    pub fn set_online(
        &mut self,
        groups: &mut GroupStore,
        player: PlayerId,
        online: bool,
    ) -> Result<bool, AssignmentError> {
        let entry = *self
            .players
            .get(&player)
            .ok_or(AssignmentError::PlayerNotFound(player))?;
        if entry.online == online {
            return Ok(false);
        }

        let mut index_in_online = entry.index_in_online;
        if let Some(group) = entry.group.and_then(|g| groups.get_mut(g)) {
            if online {
                index_in_online = Some(group.online_members.len());
                group.online_members.push(player);
            } else if let Some(i) = entry.index_in_online {
                if let Some(moved) = swap_remove(&mut group.online_members, i) {
                    if let Some(a) = self.players.get_mut(&moved) {
                        a.index_in_online = Some(i);
                    }
                }
                index_in_online = None;
            }
        }

        if let Some(a) = self.players.get_mut(&player) {
            a.online = online;
            a.index_in_online = index_in_online;
        }
        Ok(true)
    }

    /// Permanent departure: clear membership and forget the participant.
    pub fn leave(&mut self, groups: &mut GroupStore, player: PlayerId) -> Result<GroupSwitch, AssignmentError> {
        let previous = self
            .players
            .get(&player)
            .ok_or(AssignmentError::PlayerNotFound(player))?
            .group;
        self.detach(groups, player);
        self.players.remove(&player);
        Ok(GroupSwitch {
            player,
            previous,
            current: None,
        })
    }

    /// Whether the host should keep this participant's record while it is
    /// offline: only participants outside the default group carry state.
    pub fn persist_while_offline(&self, groups: &GroupStore, player: PlayerId) -> bool {
        match self.group_of(player) {
            Some(g) => g != groups.default_group_id(),
            None => false,
        }
    }

    /// Flag value of `def` in the participant's current group.
    pub fn has_permission(&self, groups: &GroupStore, player: PlayerId, def: DefIndex) -> bool {
        self.group_of(player)
            .and_then(|g| groups.get(g))
            .map(|g| g.flag(def))
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // List bookkeeping
    // -----------------------------------------------------------------------

    /// Remove `player` from its current group's lists. Skipped for tombstoned
    /// groups: their lists are dropped wholesale when they are unlinked.
    fn detach(&mut self, groups: &mut GroupStore, player: PlayerId) {
        let Some(entry) = self.players.get(&player).copied() else {
            return;
        };
        if let Some(group) = entry.group.and_then(|g| groups.get_mut(g)) {
            if let Some(i) = entry.index_in_members {
                if let Some(moved) = swap_remove(&mut group.members, i) {
                    if let Some(a) = self.players.get_mut(&moved) {
                        a.index_in_members = Some(i);
                    }
                }
            }
            if let Some(i) = entry.index_in_online {
                if let Some(moved) = swap_remove(&mut group.online_members, i) {
                    if let Some(a) = self.players.get_mut(&moved) {
                        a.index_in_online = Some(i);
                    }
                }
            }
        }
        if let Some(a) = self.players.get_mut(&player) {
            a.group = None;
            a.index_in_members = None;
            a.index_in_online = None;
        }
    }

    fn attach(&mut self, groups: &mut GroupStore, player: PlayerId, group_id: GroupId) {
        let Some(a) = self.players.get_mut(&player) else {
            return;
        };
        let Some(group) = groups.get_mut(group_id) else {
            return;
        };
        a.group = Some(group_id);
        a.index_in_members = Some(group.members.len());
        group.members.push(player);
        if a.online {
            a.index_in_online = Some(group.online_members.len());
            group.online_members.push(player);
        } else {
            a.index_in_online = None;
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot support
    // -----------------------------------------------------------------------

    /// Rebuild from `(player, online)` records and the member lists already
    /// restored into `groups`. Returns `None` if the lists and records
    /// disagree.
    pub(crate) fn restore(groups: &GroupStore, records: &[(PlayerId, bool)]) -> Option<Self> {
        let mut players: BTreeMap<PlayerId, PlayerAssignment> = BTreeMap::new();
        for (player, online) in records {
            let fresh = PlayerAssignment {
                group: None,
                online: *online,
                index_in_members: None,
                index_in_online: None,
            };
            if players.insert(*player, fresh).is_some() {
                return None;
            }
        }
        for group in groups.iter() {
            for (i, p) in group.members.iter().enumerate() {
                let a = players.get_mut(p)?;
                if a.group.is_some() {
                    return None;
                }
                a.group = Some(group.id());
                a.index_in_members = Some(i);
            }
            for (i, p) in group.online_members.iter().enumerate() {
                let a = players.get_mut(p)?;
                if a.group != Some(group.id()) || !a.online || a.index_in_online.is_some() {
                    return None;
                }
                a.index_in_online = Some(i);
            }
        }
        for a in players.values() {
            if a.group.is_none() || a.online != a.index_in_online.is_some() {
                return None;
            }
        }
        Some(PlayerAssignmentTracker { players })
    }

    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.players.len() as u64).to_le_bytes());
        for (player, a) in &self.players {
            hasher.update(&player.0.to_le_bytes());
            hasher.update(&a.group.map(|g| g.0).unwrap_or(0).to_le_bytes());
            hasher.update(&[a.online as u8]);
        }
    }
}

/// `Vec::swap_remove` that tolerates a stale index and reports which entry
/// (if any) now sits at `index`.
fn swap_remove(list: &mut Vec<PlayerId>, index: usize) -> Option<PlayerId> {
    if index >= list.len() {
        return None;
    }
    list.swap_remove(index);
    list.get(index).copied()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::definitions::{DefinitionRegistry, DefinitionSpec};

    fn setup() -> (GroupStore, PlayerAssignmentTracker) {
        let reg = DefinitionRegistry::new(vec![
            DefinitionSpec::new("build", "Build", true),
            DefinitionSpec::new("fly", "Fly", false),
        ])
        .unwrap();
        (GroupStore::new(&reg), PlayerAssignmentTracker::new())
    }

    /// Every stored index points back at its owner.
    fn assert_consistent(groups: &GroupStore, players: &PlayerAssignmentTracker) {
        for group in groups.iter() {
            for (i, p) in group.members().iter().enumerate() {
                let a = players.get(*p).unwrap();
                assert_eq!(a.group(), Some(group.id()));
                assert_eq!(a.index_in_members(), Some(i));
            }
            for (i, p) in group.online_members().iter().enumerate() {
                let a = players.get(*p).unwrap();
                assert!(a.is_online());
                assert_eq!(a.index_in_online(), Some(i));
            }
        }
    }

    #[test]
    fn test_join_places_in_default() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        p.join(&mut g, PlayerId(2), false).unwrap();
        let d = g.default_group();
        assert_eq!(d.members(), &[PlayerId(1), PlayerId(2)]);
        assert_eq!(d.online_members(), &[PlayerId(1)]);
        assert_consistent(&g, &p);
    }

    #[test]
    fn test_join_twice_rejected() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        assert_eq!(
            p.join(&mut g, PlayerId(1), true).unwrap_err(),
            AssignmentError::AlreadyJoined(PlayerId(1))
        );
    }

    #[test]
    fn test_set_group_swap_removes() {
        let (mut g, mut p) = setup();
        let mods = g.duplicate("Mods", g.default_group_id()).unwrap();
        for i in 1..=4 {
            p.join(&mut g, PlayerId(i), i % 2 == 1).unwrap();
        }
        let switch = p.set_group(&mut g, PlayerId(1), Some(mods)).unwrap().unwrap();
        assert_eq!(switch.previous, Some(g.default_group_id()));
        assert_eq!(switch.current, Some(mods));

        // p4 (last) was swapped into p1's slot
        assert_eq!(
            g.default_group().members(),
            &[PlayerId(4), PlayerId(2), PlayerId(3)]
        );
        assert_eq!(g.default_group().online_members(), &[PlayerId(3)]);
        assert_eq!(g.get(mods).unwrap().members(), &[PlayerId(1)]);
        assert_eq!(g.get(mods).unwrap().online_members(), &[PlayerId(1)]);
        assert_consistent(&g, &p);
    }

    #[test]
    fn test_set_group_same_is_noop() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        let d = g.default_group_id();
        assert_eq!(p.set_group(&mut g, PlayerId(1), Some(d)).unwrap(), None);
    }

    #[test]
    fn test_set_group_unknown_targets() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        assert_eq!(
            p.set_group(&mut g, PlayerId(9), None).unwrap_err(),
            AssignmentError::PlayerNotFound(PlayerId(9))
        );
        assert_eq!(
            p.set_group(&mut g, PlayerId(1), Some(GroupId(77))).unwrap_err(),
            AssignmentError::GroupNotFound(GroupId(77))
        );
    }

    #[test]
    fn test_set_group_none_clears_membership() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        p.set_group(&mut g, PlayerId(1), None).unwrap();
        assert!(g.default_group().members().is_empty());
        assert!(g.default_group().online_members().is_empty());
        assert_eq!(p.group_of(PlayerId(1)), None);
        assert!(p.contains(PlayerId(1)));
    }

    #[test]
    fn test_set_online_moves_between_lists() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        p.join(&mut g, PlayerId(2), true).unwrap();
        assert!(p.set_online(&mut g, PlayerId(1), false).unwrap());
        assert!(!p.set_online(&mut g, PlayerId(1), false).unwrap());
        assert_eq!(g.default_group().online_members(), &[PlayerId(2)]);
        assert_eq!(g.default_group().members().len(), 2);
        assert_consistent(&g, &p);

        assert!(p.set_online(&mut g, PlayerId(1), true).unwrap());
        assert_eq!(g.default_group().online_members(), &[PlayerId(2), PlayerId(1)]);
        assert_consistent(&g, &p);
    }

    #[test]
    fn test_leave_forgets_participant() {
        let (mut g, mut p) = setup();
        p.join(&mut g, PlayerId(1), true).unwrap();
        p.join(&mut g, PlayerId(2), true).unwrap();
        p.leave(&mut g, PlayerId(1)).unwrap();
        assert!(!p.contains(PlayerId(1)));
        assert_eq!(g.default_group().members(), &[PlayerId(2)]);
        assert_consistent(&g, &p);
    }

    #[test]
    fn test_persist_while_offline() {
        let (mut g, mut p) = setup();
        let mods = g.duplicate("Mods", g.default_group_id()).unwrap();
        p.join(&mut g, PlayerId(1), true).unwrap();
        assert!(!p.persist_while_offline(&g, PlayerId(1)));
        p.set_group(&mut g, PlayerId(1), Some(mods)).unwrap();
        assert!(p.persist_while_offline(&g, PlayerId(1)));
        assert!(!p.persist_while_offline(&g, PlayerId(5)));
    }

    #[test]
    fn test_has_permission_follows_group() {
        let (mut g, mut p) = setup();
        let mods = g.duplicate("Mods", g.default_group_id()).unwrap();
        g.set_flag(mods, DefIndex(1), true).unwrap();
        p.join(&mut g, PlayerId(1), true).unwrap();
        assert!(!p.has_permission(&g, PlayerId(1), DefIndex(1)));
        p.set_group(&mut g, PlayerId(1), Some(mods)).unwrap();
        assert!(p.has_permission(&g, PlayerId(1), DefIndex(1)));
        assert!(!p.has_permission(&g, PlayerId(2), DefIndex(0)));
    }

    #[test]
    fn test_move_out_of_tombstoned_group_skips_removal() {
        let (mut g, mut p) = setup();
        let d = g.default_group_id();
        let mods = g.duplicate("Mods", d).unwrap();
        p.join(&mut g, PlayerId(1), true).unwrap();
        p.join(&mut g, PlayerId(2), true).unwrap();
        p.set_group(&mut g, PlayerId(1), Some(mods)).unwrap();
        p.set_group(&mut g, PlayerId(2), Some(mods)).unwrap();

        g.mark_deleted(mods);
        let members: Vec<PlayerId> = g.get_including_deleted(mods).unwrap().members().to_vec();
        for player in members.into_iter().rev() {
            p.set_group(&mut g, player, Some(d)).unwrap();
        }
        g.unlink_deleted(mods);

        assert_eq!(g.default_group().members(), &[PlayerId(2), PlayerId(1)]);
        assert!(g.get_including_deleted(mods).unwrap().members().is_empty());
        assert_consistent(&g, &p);
    }

    #[test]
    fn test_restore_rebuilds_indices() {
        let (mut g, mut p) = setup();
        let mods = g.duplicate("Mods", g.default_group_id()).unwrap();
        for i in 1..=5 {
            p.join(&mut g, PlayerId(i), i != 3).unwrap();
        }
        p.set_group(&mut g, PlayerId(2), Some(mods)).unwrap();
        p.set_group(&mut g, PlayerId(3), Some(mods)).unwrap();

        let records: Vec<(PlayerId, bool)> = p.iter().map(|(id, a)| (id, a.is_online())).collect();
        let restored = PlayerAssignmentTracker::restore(&g, &records).unwrap();
        assert_eq!(restored, p);

        // A record for a participant no list mentions is inconsistent.
        let mut extra = records.clone();
        extra.push((PlayerId(99), false));
        assert!(PlayerAssignmentTracker::restore(&g, &extra).is_none());
    }
}
