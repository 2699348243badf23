/// Snapshot codec — export/import with schema remapping, and catch-up.
///
/// Two formats share the bincode `DefaultOptions` codec used for ops:
///
/// - **Export** (saved sessions, sharing between installations): options,
///   definition keys, groups as `(id, name, packed flags)` in enumeration
///   order, and optionally participant assignments. Importing into an
///   instance with a different definition set or group set remaps both by
///   key/name, so a stale or foreign file cannot break referential integrity.
/// - **Catch-up** (a replica joining a running session): the exact replicated
///   state, including the id counter and member list order, so the joiner is
///   bit-identical to the replicas that sent it.
///
/// Both formats are decoded fully and validated before any state changes.
use bincode::Options;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::perm::definitions::DefinitionRegistry;
use crate::perm::groups::{GroupRecord, GroupStore};
use crate::perm::ids::{DefIndex, GroupId, PlayerId};
use crate::perm::limits::{
    check_group_name, NameStatus, MAX_DEFINITIONS, MAX_GROUPS, MAX_SNAPSHOT_BYTES,
    MAX_SNAPSHOT_PLAYERS,
};
use crate::perm::players::PlayerAssignmentTracker;
use crate::perm::system::{PermissionSystem, SystemConfig};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Snapshot encoding failed: {0}")]
    Encode(String),

    #[error("Snapshot decoding failed: {0}")]
    Decode(String),

    #[error("Snapshot holds too many {what} ({count} > {max})")]
    TooMany {
        what: &'static str,
        count: usize,
        max: usize,
    },

    #[error("Snapshot lists group {0} twice")]
    DuplicateGroupId(GroupId),

    #[error("Flag bitset of group {id} has {len} bytes, expected {expected}")]
    FlagLength { id: GroupId, len: usize, expected: usize },

    #[error("Catch-up snapshot was taken with a different definition set")]
    SchemaMismatch,

    #[error("Catch-up snapshot is inconsistent: {0}")]
    Inconsistent(&'static str),
}

fn snapshot_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_SNAPSHOT_BYTES as u64)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SnapshotError> {
    snapshot_options().serialize(value).map_err(|e| match *e {
        bincode::ErrorKind::SizeLimit => SnapshotError::TooLarge {
            size: MAX_SNAPSHOT_BYTES + 1,
            max: MAX_SNAPSHOT_BYTES,
        },
        other => SnapshotError::Encode(other.to_string()),
    })
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SnapshotError> {
    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::TooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }
    snapshot_options()
        .deserialize(bytes)
        .map_err(|e| SnapshotError::Decode(e.to_string()))
}

fn check_count(what: &'static str, count: usize, max: usize) -> Result<(), SnapshotError> {
    if count > max {
        return Err(SnapshotError::TooMany { what, count, max });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Which sections an export carries / an import applies.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportExportOptions {
    /// Group names, definition keys and flags.
    pub include_groups: bool,
    /// Participant → group assignments.
    pub include_player_groups: bool,
}

impl Default for ImportExportOptions {
    fn default() -> Self {
        ImportExportOptions {
            include_groups: true,
            include_player_groups: true,
        }
    }
}

impl ImportExportOptions {
    /// A section applies only if it was both exported and requested.
    pub fn and(self, other: ImportExportOptions) -> ImportExportOptions {
        ImportExportOptions {
            include_groups: self.include_groups && other.include_groups,
            include_player_groups: self.include_player_groups && other.include_player_groups,
        }
    }
}

/// What happens to local groups the imported snapshot does not mention.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportMode {
    /// Delete them; their members move to the default group.
    Replace,
    /// Keep them, after the imported groups in enumeration order.
    Merge,
}

// ---------------------------------------------------------------------------
// FlagBits
// ---------------------------------------------------------------------------

/// Flag vector packed LSB-first in definition-index order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagBits(pub Vec<u8>);

impl FlagBits {
    pub fn byte_len(flag_count: usize) -> usize {
        flag_count.div_ceil(8)
    }

    pub fn pack(flags: &[bool]) -> Self {
        let mut bytes = vec![0u8; Self::byte_len(flags.len())];
        for (i, flag) in flags.iter().enumerate() {
            if *flag {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        FlagBits(bytes)
    }

    /// Bit `index`; `false` past the end.
    pub fn get(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .map(|b| (b >> (index % 8)) & 1 == 1)
            .unwrap_or(false)
    }

    pub fn unpack(&self, flag_count: usize) -> Vec<bool> {
        (0..flag_count).map(|i| self.get(i)).collect()
    }
}

// ---------------------------------------------------------------------------
// Export format
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExportedGroup {
    pub id: GroupId,
    pub name: String,
    /// Empty when the export excludes groups.
    pub flags: FlagBits,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportedAssignment {
    pub player: PlayerId,
    pub group: GroupId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExportSnapshot {
    pub options: ImportExportOptions,
    /// Definition keys in the exporter's index order. Empty when the export
    /// excludes groups.
    pub definitions: Vec<String>,
    /// Always present: ids and names let group references be remapped even
    /// when flags are not imported.
    pub groups: Vec<ExportedGroup>,
    pub players: Vec<ExportedAssignment>,
}

impl ExportSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        encode(self)
    }

    /// Decode and validate. Nothing is applied.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: ExportSnapshot = decode(bytes)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        check_count("definitions", self.definitions.len(), MAX_DEFINITIONS)?;
        check_count("groups", self.groups.len(), MAX_GROUPS)?;
        check_count("participants", self.players.len(), MAX_SNAPSHOT_PLAYERS)?;

        let expected = if self.options.include_groups {
            FlagBits::byte_len(self.definitions.len())
        } else {
            0
        };
        let mut seen = BTreeMap::new();
        for g in &self.groups {
            if seen.insert(g.id, ()).is_some() {
                return Err(SnapshotError::DuplicateGroupId(g.id));
            }
            if g.flags.0.len() != expected {
                return Err(SnapshotError::FlagLength {
                    id: g.id,
                    len: g.flags.0.len(),
                    expected,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catch-up format
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
struct CatchUpGroup {
    id: GroupId,
    name: String,
    flags: FlagBits,
    is_default: bool,
    members: Vec<PlayerId>,
    online_members: Vec<PlayerId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
struct CatchUpSnapshot {
    definitions: Vec<String>,
    next_id: GroupId,
    groups: Vec<CatchUpGroup>,
    players: Vec<(PlayerId, bool)>,
}

// ---------------------------------------------------------------------------
// Import bookkeeping
// ---------------------------------------------------------------------------

/// Outcome of an import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportStatus {
    /// Every definition matched and every group name was usable.
    Complete,
    /// Applied, but the schemas drifted; see the report lists.
    Partial,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportReport {
    pub status: ImportStatus,
    /// Sections actually applied (export options ∧ import options).
    pub options: ImportExportOptions,
    /// Local definitions the snapshot does not know; their flags were kept.
    pub missing_definitions: Vec<String>,
    /// Snapshot definitions with no local counterpart; ignored.
    pub unknown_definitions: Vec<String>,
    /// Local groups matched by name.
    pub matched_groups: Vec<GroupId>,
    /// Groups created for names with no local match.
    pub created_groups: Vec<GroupId>,
    /// Local groups removed in `Replace` mode.
    pub deleted_groups: Vec<GroupId>,
    /// Snapshot names that could not be used; mapped to the default group.
    pub invalid_group_names: Vec<String>,
    pub players_assigned: usize,
}

impl ImportReport {
    fn new(options: ImportExportOptions) -> Self {
        ImportReport {
            status: ImportStatus::Complete,
            options,
            missing_definitions: Vec::new(),
            unknown_definitions: Vec::new(),
            matched_groups: Vec::new(),
            created_groups: Vec::new(),
            deleted_groups: Vec::new(),
            invalid_group_names: Vec::new(),
            players_assigned: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ImportStatus::Complete
    }
}

/// Remap tables kept alive between `import` and `finish_import`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImportState {
    pub groups_by_foreign: BTreeMap<GroupId, GroupId>,
    /// `remap[local index]` = foreign index.
    pub definition_remap: Vec<Option<usize>>,
}

/// `local index → foreign index` by key, recording drift in `report`.
fn definition_remap(
    registry: &DefinitionRegistry,
    foreign: &[String],
    report: &mut ImportReport,
) -> Vec<Option<usize>> {
    let foreign_index: BTreeMap<&str, usize> = foreign
        .iter()
        .enumerate()
        .map(|(i, k)| (k.as_str(), i))
        .collect();
    let remap: Vec<Option<usize>> = registry
        .iter()
        .map(|d| {
            let found = foreign_index.get(d.key()).copied();
            if found.is_none() {
                report.missing_definitions.push(d.key().to_string());
            }
            found
        })
        .collect();
    for key in foreign {
        if registry.get_by_key(key).is_none() {
            report.unknown_definitions.push(key.clone());
        }
    }
    remap
}

// ---------------------------------------------------------------------------
// PermissionSystem: export / import / catch-up
// ---------------------------------------------------------------------------

impl PermissionSystem {
    /// Export the sections selected by `options`. Participants are exported
    /// only when they carry state (outside the default group).
    pub fn export(&self, options: ImportExportOptions) -> Result<Vec<u8>, SnapshotError> {
        let definitions = if options.include_groups {
            self.registry.keys().map(str::to_string).collect()
        } else {
            Vec::new()
        };
        let groups = self
            .groups
            .iter()
            .map(|g| ExportedGroup {
                id: g.id(),
                name: g.name().to_string(),
                flags: if options.include_groups {
                    FlagBits::pack(g.flags())
                } else {
                    FlagBits::default()
                },
            })
            .collect();
        let players = if options.include_player_groups {
            self.players
                .iter()
                .filter(|(p, _)| self.persist_while_offline(*p))
                .filter_map(|(player, a)| a.group().map(|group| ExportedAssignment { player, group }))
                .collect()
        } else {
            Vec::new()
        };
        ExportSnapshot {
            options,
            definitions,
            groups,
            players,
        }
        .to_bytes()
    }

    /// Merge a foreign snapshot into live state.
    ///
    /// Runs identically on every replica that imports the same bytes. Events
    /// are suppressed for the duration; the returned report describes what
    /// happened. The foreign → local group map stays queryable through
    /// `imported_group` / `resolve_group_ref` until `finish_import`.
    pub fn import(
        &mut self,
        bytes: &[u8],
        options: ImportExportOptions,
        mode: ImportMode,
    ) -> Result<ImportReport, SnapshotError> {
        let snapshot = ExportSnapshot::from_bytes(bytes).map_err(|e| {
            warn!("Rejected snapshot import: {}", e);
            e
        })?;
        let effective = snapshot.options.and(options);
        let mut report = ImportReport::new(effective);
        let default = self.groups.default_group_id();

        let definition_remap = if effective.include_groups {
            definition_remap(&self.registry, &snapshot.definitions, &mut report)
        } else {
            vec![None; self.registry.len()]
        };

        self.events.suppress();
        let mut by_foreign: BTreeMap<GroupId, GroupId> = BTreeMap::new();

        if effective.include_groups {
            let mut imported_order: Vec<GroupId> = Vec::with_capacity(snapshot.groups.len());
            let mut imported: BTreeSet<GroupId> = BTreeSet::new();
            let mut flag_targets: Vec<(GroupId, &FlagBits)> = Vec::new();

            for g in &snapshot.groups {
                let trimmed = g.name.trim();
                let local = if check_group_name(trimmed) != NameStatus::Ok {
                    report.invalid_group_names.push(g.name.clone());
                    default
                } else if let Some(existing) = self.groups.get_by_name(trimmed) {
                    let id = existing.id();
                    report.matched_groups.push(id);
                    flag_targets.push((id, &g.flags));
                    id
                } else {
                    match self.groups.duplicate(trimmed, default) {
                        Ok(id) => {
                            report.created_groups.push(id);
                            flag_targets.push((id, &g.flags));
                            id
                        }
                        Err(e) => {
                            debug!("Import could not create {:?}: {}", trimmed, e);
                            report.invalid_group_names.push(g.name.clone());
                            default
                        }
                    }
                };
                by_foreign.insert(g.id, local);
                if imported.insert(local) {
                    imported_order.push(local);
                }
            }

            if mode == ImportMode::Replace {
                let doomed: Vec<GroupId> = self
                    .groups
                    .ids()
                    .iter()
                    .copied()
                    .filter(|id| *id != default && !imported.contains(id))
                    .collect();
                for id in doomed {
                    self.delete_group(id, default, self.config.local_player);
                    report.deleted_groups.push(id);
                }
            }

            let foreign_count = snapshot.definitions.len();
            for (id, bits) in flag_targets {
                self.groups
                    .overwrite_flags(id, &definition_remap, &bits.unpack(foreign_count));
            }
            self.groups.reorder(&imported_order);
        } else {
            for g in &snapshot.groups {
                let local = self
                    .groups
                    .get_by_name(g.name.trim())
                    .map(|x| x.id())
                    .unwrap_or(default);
                by_foreign.insert(g.id, local);
            }
        }

        if effective.include_player_groups {
            for a in &snapshot.players {
                let group = by_foreign.get(&a.group).copied().unwrap_or(default);
                if !self.players.contains(a.player) {
                    if let Err(e) = self.join_player(a.player, false) {
                        debug!("Import could not add {}: {}", a.player, e);
                        continue;
                    }
                }
                match self.move_player(a.player, Some(group)) {
                    Ok(_) => report.players_assigned += 1,
                    Err(e) => debug!("Import could not assign {}: {}", a.player, e),
                }
            }
        }

        self.events.resume();
        if !report.missing_definitions.is_empty()
            || !report.unknown_definitions.is_empty()
            || !report.invalid_group_names.is_empty()
        {
            report.status = ImportStatus::Partial;
        }
        self.import = Some(ImportState {
            groups_by_foreign: by_foreign,
            definition_remap,
        });
        // Flags may have changed under the viewed group without notifications.
        self.reset_view();

        info!(
            "Imported snapshot: {} matched, {} created, {} deleted, {} participants ({:?})",
            report.matched_groups.len(),
            report.created_groups.len(),
            report.deleted_groups.len(),
            report.players_assigned,
            report.status
        );
        Ok(report)
    }

    pub fn is_importing(&self) -> bool {
        self.import.is_some()
    }

    /// Local group a foreign id from the last import maps to.
    pub fn imported_group(&self, foreign: GroupId) -> Option<GroupId> {
        self.import
            .as_ref()
            .and_then(|s| s.groups_by_foreign.get(&foreign).copied())
    }

    /// Foreign definition index the local `def` was read from.
    pub fn imported_definition(&self, def: DefIndex) -> Option<usize> {
        self.import
            .as_ref()
            .and_then(|s| s.definition_remap.get(def.as_usize()).copied().flatten())
    }

    /// Resolve a stored group reference. While an import is open, `raw` is a
    /// foreign id; otherwise a local one. Unknown references fall back to the
    /// default group.
    pub fn resolve_group_ref(&self, raw: GroupId) -> GroupId {
        let default = self.groups.default_group_id();
        match &self.import {
            Some(state) => state.groups_by_foreign.get(&raw).copied().unwrap_or(default),
            None if self.groups.contains(raw) => raw,
            None => default,
        }
    }

    /// Drop the import remap tables. `false` if no import was open.
    pub fn finish_import(&mut self) -> bool {
        self.import.take().is_some()
    }

    // -----------------------------------------------------------------------
    // Catch-up
    // -----------------------------------------------------------------------

    /// Exact replicated state for a joining replica.
    pub fn catch_up_snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let snapshot = CatchUpSnapshot {
            definitions: self.registry.keys().map(str::to_string).collect(),
            next_id: self.groups.next_id(),
            groups: self
                .groups
                .iter()
                .map(GroupRecord::from_group)
                .map(|r| CatchUpGroup {
                    flags: FlagBits::pack(&r.flags),
                    id: r.id,
                    name: r.name,
                    is_default: r.is_default,
                    members: r.members,
                    online_members: r.online_members,
                })
                .collect(),
            players: self
                .players
                .iter()
                .map(|(p, a)| (p, a.is_online()))
                .collect(),
        };
        encode(&snapshot)
    }

    /// Build a replica from a catch-up snapshot. The registry must hold the
    /// same definitions, in the same order, as the sender's.
    pub fn from_catch_up(
        registry: DefinitionRegistry,
        config: SystemConfig,
        bytes: &[u8],
    ) -> Result<Self, SnapshotError> {
        let snapshot: CatchUpSnapshot = decode(bytes)?;
        check_count("groups", snapshot.groups.len(), MAX_GROUPS)?;
        check_count("participants", snapshot.players.len(), MAX_SNAPSHOT_PLAYERS)?;
        if !snapshot.definitions.iter().map(String::as_str).eq(registry.keys()) {
            return Err(SnapshotError::SchemaMismatch);
        }

        let expected = FlagBits::byte_len(registry.len());
        let mut records = Vec::with_capacity(snapshot.groups.len());
        for g in snapshot.groups {
            if g.flags.0.len() != expected {
                return Err(SnapshotError::FlagLength {
                    id: g.id,
                    len: g.flags.0.len(),
                    expected,
                });
            }
            records.push(GroupRecord {
                id: g.id,
                name: g.name,
                flags: g.flags.unpack(registry.len()),
                is_default: g.is_default,
                members: g.members,
                online_members: g.online_members,
            });
        }
        let groups = GroupStore::restore(registry.len(), snapshot.next_id, records)
            .ok_or(SnapshotError::Inconsistent("group records"))?;
        let players = PlayerAssignmentTracker::restore(&groups, &snapshot.players)
            .ok_or(SnapshotError::Inconsistent("participant records"))?;

        info!(
            "Loaded catch-up snapshot: {} groups, {} participants",
            groups.len(),
            players.len()
        );
        Ok(PermissionSystem::with_state(registry, config, groups, players))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perm::definitions::DefinitionSpec;
    use crate::perm::events::EventKind;
    use crate::perm::ops::{OpLog, VecOpLog};
    use hex_literal::hex;
    use std::cell::RefCell;
    use std::rc::Rc;

    const BUILD: DefIndex = DefIndex(0);
    const FLY: DefIndex = DefIndex(1);
    const ME: PlayerId = PlayerId(1);

    fn registry_of(keys: &[(&str, bool)]) -> DefinitionRegistry {
        DefinitionRegistry::new(
            keys.iter()
                .map(|(k, d)| DefinitionSpec::new(*k, *k, *d))
                .collect(),
        )
        .unwrap()
    }

    fn registry() -> DefinitionRegistry {
        registry_of(&[("build", true), ("fly", false)])
    }

    fn system() -> PermissionSystem {
        PermissionSystem::new(registry(), SystemConfig::for_player(ME))
    }

    fn run(s: &mut PermissionSystem, log: &mut VecOpLog) {
        for bytes in log.drain() {
            s.receive(&bytes).unwrap();
        }
    }

    fn group(s: &PermissionSystem, name: &str) -> GroupId {
        s.groups().get_by_name(name).unwrap().id()
    }

    /// Default + Mods (fly) + VIP; p5 in Mods.
    fn populated() -> PermissionSystem {
        let mut s = system();
        let mut log = VecOpLog::new();
        s.join_player(ME, true).unwrap();
        s.join_player(PlayerId(5), true).unwrap();
        let default = s.groups().default_group_id();
        s.send_duplicate_group(&mut log, "Mods", default).unwrap();
        s.send_duplicate_group(&mut log, "VIP", default).unwrap();
        run(&mut s, &mut log);
        let mods = group(&s, "Mods");
        s.send_set_flag(&mut log, mods, FLY, true).unwrap();
        s.send_set_player_group(&mut log, PlayerId(5), mods).unwrap();
        run(&mut s, &mut log);
        s
    }

    #[test]
    fn test_flag_bits_lsb_first() {
        let bits = FlagBits::pack(&[true, false, true, true, false, false, false, false, true]);
        assert_eq!(bits.0, vec![0b0000_1101, 0b0000_0001]);
        assert!(bits.get(8));
        assert!(!bits.get(9));
        assert!(!bits.get(100));
        assert_eq!(bits.unpack(3), vec![true, false, true]);
        assert_eq!(FlagBits::byte_len(0), 0);
        assert_eq!(FlagBits::byte_len(8), 1);
    }

    #[test]
    fn test_options_and() {
        let all = ImportExportOptions::default();
        let none = ImportExportOptions {
            include_groups: false,
            include_player_groups: false,
        };
        assert_eq!(all.and(none), none);
        assert_eq!(all.and(all), all);
    }

    #[test]
    fn test_export_wire_bytes() {
        let bytes = system().export(ImportExportOptions::default()).unwrap();
        assert_eq!(
            bytes,
            hex!(
                "01 01"
                "02 05 6275696c64 03 666c79"
                "01 01 07 44656661756c74 01 01"
                "00"
            )
            .to_vec()
        );
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = populated();
        let bytes = source.export(ImportExportOptions::default()).unwrap();

        let mut target = system();
        let report = target
            .import(&bytes, ImportExportOptions::default(), ImportMode::Replace)
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.created_groups.len(), 2);
        assert_eq!(report.players_assigned, 1);

        let names: Vec<&str> = target.groups().iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["Default", "Mods", "VIP"]);
        for g in source.groups().iter() {
            assert_eq!(target.groups().get_by_name(g.name()).unwrap().flags(), g.flags());
        }
        assert_eq!(target.players().group_of(PlayerId(5)), Some(group(&target, "Mods")));
        assert!(!target.players().get(PlayerId(5)).unwrap().is_online());
    }

    #[test]
    fn test_import_remaps_definitions_by_key() {
        // Exporter knows fly (index 0) and swim; not build.
        let mut source = PermissionSystem::new(
            registry_of(&[("fly", true), ("swim", true)]),
            SystemConfig::default(),
        );
        let mut log = VecOpLog::new();
        source
            .send_duplicate_group(&mut log, "Mods", source.groups().default_group_id())
            .unwrap();
        run(&mut source, &mut log);
        let bytes = source.export(ImportExportOptions::default()).unwrap();

        let mut target = system();
        let mods = {
            let mut log = VecOpLog::new();
            let d = target.groups().default_group_id();
            target.send_duplicate_group(&mut log, "Mods", d).unwrap();
            run(&mut target, &mut log);
            group(&target, "Mods")
        };
        let mut log = VecOpLog::new();
        target.send_set_flag(&mut log, mods, BUILD, false).unwrap();
        run(&mut target, &mut log);

        let report = target
            .import(&bytes, ImportExportOptions::default(), ImportMode::Merge)
            .unwrap();
        assert_eq!(report.status, ImportStatus::Partial);
        assert_eq!(report.missing_definitions, vec!["build".to_string()]);
        assert_eq!(report.unknown_definitions, vec!["swim".to_string()]);
        assert_eq!(report.matched_groups, vec![target.groups().default_group_id(), mods]);

        // fly taken from the snapshot, build kept.
        assert_eq!(target.groups().get(mods).unwrap().flags(), &[false, true]);
        assert_eq!(target.imported_definition(FLY), Some(0));
        assert_eq!(target.imported_definition(BUILD), None);
    }

    #[test]
    fn test_import_replace_deletes_unlisted_groups_silently() {
        let source = system();
        let bytes = source.export(ImportExportOptions::default()).unwrap();

        let mut target = populated();
        let events = Rc::new(RefCell::new(0));
        for kind in [
            EventKind::GroupDeleted,
            EventKind::PlayerGroupChanged,
            EventKind::GroupDuplicated,
        ] {
            let sink = events.clone();
            target.subscribe(kind, move |_| *sink.borrow_mut() += 1);
        }
        let mods = group(&target, "Mods");
        let vip = group(&target, "VIP");

        let report = target
            .import(&bytes, ImportExportOptions::default(), ImportMode::Replace)
            .unwrap();
        assert_eq!(report.deleted_groups, vec![mods, vip]);
        assert_eq!(target.groups().len(), 1);
        assert_eq!(
            target.players().group_of(PlayerId(5)),
            Some(target.groups().default_group_id())
        );
        assert_eq!(*events.borrow(), 0);
    }

    #[test]
    fn test_import_replace_with_repeated_names_keeps_each_group_once() {
        let exported = |id: u32, name: &str, flags: &[bool]| ExportedGroup {
            id: GroupId(id),
            name: name.into(),
            flags: FlagBits::pack(flags),
        };
        let snapshot = ExportSnapshot {
            options: ImportExportOptions::default(),
            definitions: vec!["build".into(), "fly".into()],
            groups: vec![
                exported(7, "VIP", &[false, true]),
                exported(8, " VIP ", &[false, true]),
                exported(1, "Default", &[true, false]),
            ],
            players: vec![],
        };
        let mut target = populated();
        let mods = group(&target, "Mods");
        let vip = group(&target, "VIP");
        let default = target.groups().default_group_id();

        let report = target
            .import(
                &snapshot.to_bytes().unwrap(),
                ImportExportOptions::default(),
                ImportMode::Replace,
            )
            .unwrap();
        assert_eq!(report.deleted_groups, vec![mods]);
        assert_eq!(target.groups().ids(), &[vip, default]);
        assert_eq!(target.imported_group(GroupId(7)), Some(vip));
        assert_eq!(target.imported_group(GroupId(8)), Some(vip));
        assert_eq!(target.groups().get(vip).unwrap().flags(), &[false, true]);
        assert_eq!(target.players().group_of(PlayerId(5)), Some(default));
    }

    #[test]
    fn test_import_merge_keeps_local_groups_after_imported() {
        let mut source = system();
        let mut log = VecOpLog::new();
        let d = source.groups().default_group_id();
        source.send_duplicate_group(&mut log, "Zeta", d).unwrap();
        run(&mut source, &mut log);
        let bytes = source.export(ImportExportOptions::default()).unwrap();

        let mut target = populated();
        target
            .import(&bytes, ImportExportOptions::default(), ImportMode::Merge)
            .unwrap();
        let names: Vec<&str> = target.groups().iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["Default", "Zeta", "Mods", "VIP"]);
    }

    #[test]
    fn test_import_invalid_name_maps_to_default() {
        let snapshot = ExportSnapshot {
            options: ImportExportOptions::default(),
            definitions: vec!["build".into(), "fly".into()],
            groups: vec![ExportedGroup {
                id: GroupId(9),
                name: "   ".into(),
                flags: FlagBits::pack(&[false, true]),
            }],
            players: vec![],
        };
        let mut target = system();
        let before = target.groups().default_group().flags().to_vec();
        let report = target
            .import(
                &snapshot.to_bytes().unwrap(),
                ImportExportOptions::default(),
                ImportMode::Merge,
            )
            .unwrap();
        assert_eq!(report.status, ImportStatus::Partial);
        assert_eq!(report.invalid_group_names, vec!["   ".to_string()]);
        assert_eq!(target.imported_group(GroupId(9)), Some(target.groups().default_group_id()));
        assert_eq!(target.groups().default_group().flags(), before.as_slice());
    }

    #[test]
    fn test_import_malformed_changes_nothing() {
        let mut target = populated();
        let before = target.state_hash();
        assert!(target
            .import(&[0x01, 0x01, 0xff], ImportExportOptions::default(), ImportMode::Replace)
            .is_err());

        // Structurally valid but inconsistent: flag bitset of the wrong size.
        let bad = ExportSnapshot {
            options: ImportExportOptions::default(),
            definitions: vec!["build".into()],
            groups: vec![ExportedGroup {
                id: GroupId(1),
                name: "Default".into(),
                flags: FlagBits(vec![0, 0]),
            }],
            players: vec![],
        };
        assert!(matches!(
            target.import(&bad.to_bytes().unwrap(), ImportExportOptions::default(), ImportMode::Replace),
            Err(SnapshotError::FlagLength { .. })
        ));
        assert_eq!(target.state_hash(), before);
        assert!(!target.is_importing());
    }

    #[test]
    fn test_import_without_groups_only_maps_ids() {
        let source = populated();
        let bytes = source.export(ImportExportOptions::default()).unwrap();
        let mut target = system();
        target.join_player(PlayerId(5), true).unwrap();

        let report = target
            .import(
                &bytes,
                ImportExportOptions {
                    include_groups: false,
                    include_player_groups: true,
                },
                ImportMode::Replace,
            )
            .unwrap();
        assert!(!report.options.include_groups);
        assert!(report.created_groups.is_empty());
        assert_eq!(target.groups().len(), 1);
        // Mods is unknown here, so p5 lands in the default group.
        assert_eq!(
            target.players().group_of(PlayerId(5)),
            Some(target.groups().default_group_id())
        );
    }

    #[test]
    fn test_group_refs_resolve_until_finish() {
        let source = populated();
        let foreign_mods = group(&source, "Mods");
        let bytes = source.export(ImportExportOptions::default()).unwrap();

        let mut target = system();
        let mut log = VecOpLog::new();
        let d = target.groups().default_group_id();
        target.send_duplicate_group(&mut log, "Padding", d).unwrap();
        target.send_duplicate_group(&mut log, "Padding 2", d).unwrap();
        run(&mut target, &mut log);
        target
            .import(&bytes, ImportExportOptions::default(), ImportMode::Replace)
            .unwrap();
        let local_mods = group(&target, "Mods");
        assert_ne!(local_mods, foreign_mods);

        assert!(target.is_importing());
        assert_eq!(target.imported_group(foreign_mods), Some(local_mods));
        assert_eq!(target.resolve_group_ref(foreign_mods), local_mods);
        assert_eq!(target.resolve_group_ref(GroupId(99)), d);

        assert!(target.finish_import());
        assert!(!target.finish_import());
        assert_eq!(target.imported_group(foreign_mods), None);
        assert_eq!(target.resolve_group_ref(local_mods), local_mods);
        assert_eq!(target.resolve_group_ref(GroupId(99)), d);
    }

    #[test]
    fn test_catch_up_is_bit_identical() {
        let mut host = populated();
        let mut log = VecOpLog::new();
        let vip = group(&host, "VIP");
        host.send_delete_group(&mut log, vip, host.groups().default_group_id())
            .unwrap();
        run(&mut host, &mut log);
        host.set_player_online(PlayerId(5), false).unwrap();

        let bytes = host.catch_up_snapshot().unwrap();
        let mut joiner =
            PermissionSystem::from_catch_up(registry(), SystemConfig::for_player(PlayerId(5)), &bytes)
                .unwrap();
        assert_eq!(joiner.state_hash(), host.state_hash());
        assert_eq!(joiner.groups().next_id(), host.groups().next_id());
        assert_eq!(joiner.viewed_group(), group(&joiner, "Mods"));
        assert!(joiner.local_has_permission(FLY));

        // Both keep converging, including on ops that reference the tombstone.
        let mods = group(&host, "Mods");
        host.send_set_flag(&mut log, mods, BUILD, false).unwrap();
        host.send_duplicate_group(&mut log, "New", mods).unwrap();
        log.submit(
            crate::perm::ops::Op::SetFlag(crate::perm::ops::SetFlagPayload {
                group: vip,
                definition: FLY,
                value: true,
            })
            .seal(ME)
            .unwrap()
            .to_bytes()
            .unwrap(),
        );
        for bytes in log.drain() {
            host.receive(&bytes).unwrap();
            joiner.receive(&bytes).unwrap();
        }
        assert_eq!(joiner.state_hash(), host.state_hash());
        assert_eq!(group(&joiner, "New"), group(&host, "New"));
    }

    #[test]
    fn test_catch_up_schema_mismatch() {
        let bytes = populated().catch_up_snapshot().unwrap();
        let err = PermissionSystem::from_catch_up(
            registry_of(&[("fly", false), ("build", true)]),
            SystemConfig::default(),
            &bytes,
        )
        .unwrap_err();
        assert_eq!(err, SnapshotError::SchemaMismatch);
    }

    #[test]
    fn test_catch_up_garbage_rejected() {
        assert!(PermissionSystem::from_catch_up(registry(), SystemConfig::default(), &[0xff; 4]).is_err());
    }
}
