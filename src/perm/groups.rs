/// Permission group store.
///
/// Owns every group, its flag vector, and its membership lists. Groups live in
/// an arena in allocation order; deleting a group tombstones its slot so the
/// id is never handed out again, and unlinks it from the id/name indices and
/// the enumeration order.
///
/// Only ordered containers are used here: everything in this module is
/// replicated state and must iterate identically on every replica.
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::perm::definitions::DefinitionRegistry;
use crate::perm::ids::{DefIndex, GroupId, PlayerId};
use crate::perm::limits::{
    can_create_group, check_group_name, NameStatus, MAX_GROUPS, MAX_GROUP_NAME_BYTES,
};

/// Name of the bootstrap group every participant starts in.
pub const DEFAULT_GROUP_NAME: &str = "Default";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("Group {0} not found")]
    GroupNotFound(GroupId),

    #[error("Group name must not be empty")]
    EmptyName,

    #[error("Group name too long ({len} > {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("Group name {0:?} already in use")]
    NameTaken(String),

    #[error("The default group cannot be renamed or deleted")]
    DefaultGroupImmutable,

    #[error("Group {0} is already deleted")]
    AlreadyDeleted(GroupId),

    #[error("Replacement group must differ from the deleted group")]
    SameReplacement,

    #[error("Replacement group {0} is deleted")]
    ReplacementDeleted(GroupId),

    #[error("Permission definition {0} not found")]
    DefinitionNotFound(DefIndex),

    #[error("Group limit reached ({max})")]
    TooManyGroups { max: usize },

    #[error("Group ids exhausted for this session")]
    IdsExhausted,
}

impl GroupError {
    /// True for dangling references (stale or foreign ids), as opposed to
    /// invariant violations.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            GroupError::GroupNotFound(_) | GroupError::DefinitionNotFound(_)
        )
    }
}

// ---------------------------------------------------------------------------
// PermissionGroup
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionGroup {
    id: GroupId,
    name: String,
    flags: Vec<bool>,
    is_default: bool,
    is_deleted: bool,
    /// All participants in this group. Each participant stores its own index.
    pub(crate) members: Vec<PlayerId>,
    /// Members currently online. Each participant stores its own index.
    pub(crate) online_members: Vec<PlayerId>,
}

impl PermissionGroup {
    fn new(id: GroupId, name: String, flags: Vec<bool>, is_default: bool) -> Self {
        PermissionGroup {
            id,
            name,
            flags,
            is_default,
            is_deleted: false,
            members: Vec::new(),
            online_members: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    /// Flag value for one definition; out-of-range reads as `false`.
    pub fn flag(&self, def: DefIndex) -> bool {
        self.flags.get(def.as_usize()).copied().unwrap_or(false)
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn members(&self) -> &[PlayerId] {
        &self.members
    }

    pub fn online_members(&self) -> &[PlayerId] {
        &self.online_members
    }
}

/// Owned form of one group, as carried by a catch-up snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub flags: Vec<bool>,
    pub is_default: bool,
    pub members: Vec<PlayerId>,
    pub online_members: Vec<PlayerId>,
}

impl GroupRecord {
    pub fn from_group(group: &PermissionGroup) -> Self {
        GroupRecord {
            id: group.id,
            name: group.name.clone(),
            flags: group.flags.clone(),
            is_default: group.is_default,
            members: group.members.clone(),
            online_members: group.online_members.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// GroupStore
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStore {
    /// Arena of every group allocated this session, tombstones included.
    slots: Vec<PermissionGroup>,
    /// Every id ever allocated → arena slot.
    slot_of: BTreeMap<GroupId, usize>,
    /// Live groups only.
    by_name: BTreeMap<String, GroupId>,
    /// Live groups in enumeration order.
    order: Vec<GroupId>,
    next_id: GroupId,
    default_id: GroupId,
    def_count: usize,
}

impl GroupStore {
    /// Create the store together with its default group (every flag at its
    /// definition default). The default group exists for the store's whole
    /// lifetime.
    pub fn new(registry: &DefinitionRegistry) -> Self {
        let mut store = GroupStore {
            slots: Vec::new(),
            slot_of: BTreeMap::new(),
            by_name: BTreeMap::new(),
            order: Vec::new(),
            next_id: GroupId(GroupId::FIRST.0 + 1),
            default_id: GroupId::FIRST,
            def_count: registry.len(),
        };
        store.create_default(registry.defaults());
        store
    }

    fn create_default(&mut self, flags: Vec<bool>) {
        self.register(PermissionGroup::new(
            self.default_id,
            DEFAULT_GROUP_NAME.to_string(),
            flags,
            true,
        ));
    }

    /// Hand out `next_id`. The last id of the space is never handed out, so
    /// `next_id` always names an unused id.
    fn allocate_id(&mut self) -> Result<GroupId, GroupError> {
        let id = self.next_id;
        self.next_id = id.next().ok_or(GroupError::IdsExhausted)?;
        Ok(id)
    }

    fn register(&mut self, group: PermissionGroup) {
        let id = group.id;
        self.by_name.insert(group.name.clone(), id);
        self.order.push(id);
        self.slot_of.insert(id, self.slots.len());
        self.slots.push(group);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn default_group_id(&self) -> GroupId {
        self.default_id
    }

    pub fn default_group(&self) -> &PermissionGroup {
        // The default group is registered in the constructor and never unlinked.
        &self.slots[self.slot_of[&self.default_id]]
    }

    /// Live group by id. Tombstoned groups are not found.
    pub fn get(&self, id: GroupId) -> Option<&PermissionGroup> {
        self.get_including_deleted(id).filter(|g| !g.is_deleted)
    }

    /// Group by id, tombstones included.
    pub fn get_including_deleted(&self, id: GroupId) -> Option<&PermissionGroup> {
        self.slot_of.get(&id).map(|&slot| &self.slots[slot])
    }

    pub(crate) fn get_mut(&mut self, id: GroupId) -> Option<&mut PermissionGroup> {
        match self.slot_of.get(&id) {
            Some(&slot) if !self.slots[slot].is_deleted => Some(&mut self.slots[slot]),
            _ => None,
        }
    }

    /// Tombstone-inclusive mutable access, for list bookkeeping during delete.
    pub(crate) fn get_mut_including_deleted(&mut self, id: GroupId) -> Option<&mut PermissionGroup> {
        match self.slot_of.get(&id) {
            Some(&slot) => Some(&mut self.slots[slot]),
            None => None,
        }
    }

    /// Live group by exact name.
    pub fn get_by_name(&self, name: &str) -> Option<&PermissionGroup> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.get(id).is_some()
    }

    /// Live groups in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &PermissionGroup> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.get(*id))
    }

    /// Live group ids in enumeration order.
    pub fn ids(&self) -> &[GroupId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The id the next created group will receive.
    pub fn next_id(&self) -> GroupId {
        self.next_id
    }

    pub fn definition_count(&self) -> usize {
        self.def_count
    }

    pub fn flags(&self, id: GroupId) -> Option<&[bool]> {
        self.get(id).map(|g| g.flags())
    }

    /// `desired` if no live group uses it, otherwise the first free
    /// `"<base> N"` where `<base>` is `desired` without a trailing
    /// whitespace-and-digits suffix.
    pub fn first_unused_name(&self, desired: &str) -> String {
        if !self.by_name.contains_key(desired) {
            return desired.to_string();
        }
        let base = strip_numeric_suffix(desired);
        let mut postfix: u64 = 1;
        loop {
            let candidate = format!("{} {}", base, postfix);
            if !self.by_name.contains_key(&candidate) {
                return candidate;
            }
            postfix += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Validation (shared by the send side and the apply side)
    // -----------------------------------------------------------------------

    fn validate_new_name(&self, name: &str) -> Result<String, GroupError> {
        let trimmed = name.trim();
        match check_group_name(trimmed) {
            NameStatus::Ok => Ok(trimmed.to_string()),
            NameStatus::Empty => Err(GroupError::EmptyName),
            NameStatus::TooLong => Err(GroupError::NameTooLong {
                len: trimmed.len(),
                max: MAX_GROUP_NAME_BYTES,
            }),
        }
    }

    /// Check a duplicate request; returns the trimmed name to use.
    pub fn validate_duplicate(&self, name: &str, source: GroupId) -> Result<String, GroupError> {
        let trimmed = self.validate_new_name(name)?;
        if self.by_name.contains_key(&trimmed) {
            return Err(GroupError::NameTaken(trimmed));
        }
        if !self.contains(source) {
            return Err(GroupError::GroupNotFound(source));
        }
        if !can_create_group(self.len()) {
            return Err(GroupError::TooManyGroups { max: MAX_GROUPS });
        }
        if self.next_id.next().is_none() {
            return Err(GroupError::IdsExhausted);
        }
        Ok(trimmed)
    }

    /// Check a rename request; returns the trimmed name to use. Renaming a
    /// group to the name it already has is valid.
    pub fn validate_rename(&self, id: GroupId, name: &str) -> Result<String, GroupError> {
        let group = self.get(id).ok_or(GroupError::GroupNotFound(id))?;
        if group.is_default {
            return Err(GroupError::DefaultGroupImmutable);
        }
        let trimmed = self.validate_new_name(name)?;
        if group.name != trimmed && self.by_name.contains_key(&trimmed) {
            return Err(GroupError::NameTaken(trimmed));
        }
        Ok(trimmed)
    }

    pub fn validate_delete(&self, id: GroupId, replacement: GroupId) -> Result<(), GroupError> {
        let group = self
            .get_including_deleted(id)
            .ok_or(GroupError::GroupNotFound(id))?;
        if group.is_default {
            return Err(GroupError::DefaultGroupImmutable);
        }
        if group.is_deleted {
            return Err(GroupError::AlreadyDeleted(id));
        }
        if id == replacement {
            return Err(GroupError::SameReplacement);
        }
        match self.get_including_deleted(replacement) {
            None => Err(GroupError::GroupNotFound(replacement)),
            Some(r) if r.is_deleted => Err(GroupError::ReplacementDeleted(replacement)),
            Some(_) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Mutators: reached only from the apply path and import
    // -----------------------------------------------------------------------

    /// Create a new group named `name` with a copy of `source`'s flags.
    pub fn duplicate(&mut self, name: &str, source: GroupId) -> Result<GroupId, GroupError> {
        let trimmed = self.validate_duplicate(name, source)?;
        let flags = self
            .flags(source)
            .ok_or(GroupError::GroupNotFound(source))?
            .to_vec();
        let id = self.allocate_id()?;
        self.register(PermissionGroup::new(id, trimmed, flags, false));
        Ok(id)
    }

    /// Rename a group. `Ok(Some(previous_name))` when the name changed,
    /// `Ok(None)` when it already had that name.
    pub fn rename(&mut self, id: GroupId, name: &str) -> Result<Option<String>, GroupError> {
        let trimmed = self.validate_rename(id, name)?;
        let group = self.get_mut(id).ok_or(GroupError::GroupNotFound(id))?;
        if group.name == trimmed {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut group.name, trimmed.clone());
        self.by_name.remove(&previous);
        self.by_name.insert(trimmed, id);
        Ok(Some(previous))
    }

    /// First delete stage: set the tombstone. The group is still linked in
    /// the indices so members can be migrated out of it.
    pub(crate) fn mark_deleted(&mut self, id: GroupId) {
        if let Some(group) = self.get_mut(id) {
            group.is_deleted = true;
        }
    }

    /// Final delete stage: remove a tombstoned group from the name index and
    /// the enumeration order, and drop its (now stale) member lists.
    pub(crate) fn unlink_deleted(&mut self, id: GroupId) {
        let Some(group) = self.get_mut_including_deleted(id) else {
            return;
        };
        if !group.is_deleted {
            return;
        }
        group.members.clear();
        group.online_members.clear();
        let name = group.name.clone();
        if self.by_name.get(&name) == Some(&id) {
            self.by_name.remove(&name);
        }
        self.order.retain(|g| *g != id);
    }

    /// Set one flag. `Ok(false)` when the value was already set.
    pub fn set_flag(&mut self, id: GroupId, def: DefIndex, value: bool) -> Result<bool, GroupError> {
        let group = self.get_mut(id).ok_or(GroupError::GroupNotFound(id))?;
        let slot = group
            .flags
            .get_mut(def.as_usize())
            .ok_or(GroupError::DefinitionNotFound(def))?;
        if *slot == value {
            return Ok(false);
        }
        *slot = value;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Snapshot support
    // -----------------------------------------------------------------------

    /// Overwrite `id`'s flags from an imported flag vector. `remap[local]`
    /// holds the foreign index for each local definition, or `None` to keep
    /// the current value.
    pub(crate) fn overwrite_flags(&mut self, id: GroupId, remap: &[Option<usize>], imported: &[bool]) {
        let Some(group) = self.get_mut(id) else {
            return;
        };
        for (local, foreign) in remap.iter().enumerate() {
            if let (Some(foreign), Some(flag)) = (foreign, group.flags.get_mut(local)) {
                if let Some(value) = imported.get(*foreign) {
                    *flag = *value;
                }
            }
        }
    }

    /// Put `first` at the front of the enumeration order (in that order),
    /// followed by the remaining live groups in their current order.
    pub(crate) fn reorder(&mut self, first: &[GroupId]) {
        let mut placed: BTreeSet<GroupId> = BTreeSet::new();
        let mut order: Vec<GroupId> = Vec::with_capacity(self.order.len());
        for id in first {
            if self.contains(*id) && placed.insert(*id) {
                order.push(*id);
            }
        }
        for id in &self.order {
            if placed.insert(*id) {
                order.push(*id);
            }
        }
        self.order = order;
    }

    /// Rebuild the store from catch-up records, replacing all state. Records
    /// are in enumeration order. Returns `None` for inconsistent records.
    pub(crate) fn restore(
        def_count: usize,
        next_id: GroupId,
        records: Vec<GroupRecord>,
    ) -> Option<Self> {
        let mut store = GroupStore {
            slots: Vec::with_capacity(records.len()),
            slot_of: BTreeMap::new(),
            by_name: BTreeMap::new(),
            order: Vec::with_capacity(records.len()),
            next_id,
            default_id: GroupId::FIRST,
            def_count,
        };
        let mut default_id = None;
        for record in records {
            let GroupRecord {
                id,
                name,
                mut flags,
                is_default,
                members,
                online_members,
            } = record;
            if id >= next_id || store.slot_of.contains_key(&id) || store.by_name.contains_key(&name) {
                return None;
            }
            if is_default {
                if default_id.is_some() {
                    return None;
                }
                default_id = Some(id);
            }
            flags.resize(def_count, false);
            let mut group = PermissionGroup::new(id, name, flags, is_default);
            group.members = members;
            group.online_members = online_members;
            store.register(group);
        }
        store.default_id = default_id?;
        Some(store)
    }

    /// Feed canonical bytes of every live group into `hasher`.
    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&self.next_id.0.to_le_bytes());
        hasher.update(&self.default_id.0.to_le_bytes());
        hasher.update(&(self.order.len() as u64).to_le_bytes());
        for group in self.iter() {
            hasher.update(&group.id.0.to_le_bytes());
            hasher.update(&(group.name.len() as u64).to_le_bytes());
            hasher.update(group.name.as_bytes());
            for flag in &group.flags {
                hasher.update(&[*flag as u8]);
            }
            hasher.update(&(group.members.len() as u64).to_le_bytes());
            for p in &group.members {
                hasher.update(&p.0.to_le_bytes());
            }
            hasher.update(&(group.online_members.len() as u64).to_le_bytes());
            for p in &group.online_members {
                hasher.update(&p.0.to_le_bytes());
            }
        }
    }
}

/// `"Mods 2"` → `"Mods"`; names without a whitespace-separated numeric
/// suffix are returned unchanged.
fn strip_numeric_suffix(name: &str) -> &str {
    let without_digits = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if without_digits.len() == name.len() {
        return name;
    }
    let without_ws = without_digits.trim_end_matches(char::is_whitespace);
    if without_ws.len() == without_digits.len() {
        return name;
    }
    without_ws
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
