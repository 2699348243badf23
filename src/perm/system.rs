/// Unified apply engine — the single entry point for replicated changes.
///
/// `PermissionSystem` owns the definition registry, the group store, the
/// participant assignments, the local viewer cache, the resolver registry and
/// the event bus. Every replicated op flows through `apply_op`, which decodes,
/// validates, dispatches and then notifies.
///
/// **Determinism guarantee:** replicas that apply the same op sequence to the
/// same starting state end with the same `state_hash`. Rejections happen
/// before any mutation, so a rejected op leaves no trace.
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::perm::conditions::ConditionList;
use crate::perm::definitions::{DefinitionError, DefinitionRegistry};
use crate::perm::events::{EventBus, EventKind, PermissionEvent, SubscriptionId};
use crate::perm::groups::{GroupError, GroupStore};
use crate::perm::ids::{DefIndex, GroupId, PlayerId, ResolverHandle};
use crate::perm::ops::{
    DeleteGroupPayload, DuplicateGroupPayload, Op, OpEnvelope, OpError, OpLog, RenameGroupPayload,
    SetFlagPayload, SetPlayerGroupPayload,
};
use crate::perm::players::{AssignmentError, PlayerAssignmentTracker};
use crate::perm::resolvers::{ResolverError, ResolverRegistry, SharedResolver};
use crate::perm::snapshot::{ImportState, SnapshotError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Op error: {0}")]
    Op(#[from] OpError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Why a well-formed op was dropped on the apply path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error(transparent)]
    Group(#[from] GroupError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),
}

impl Rejection {
    /// Dangling reference (the op raced a delete, or came from a stale view)
    /// rather than an invariant violation.
    pub fn is_not_found(&self) -> bool {
        match self {
            Rejection::Group(e) => e.is_not_found(),
            Rejection::Assignment(e) => matches!(
                e,
                AssignmentError::PlayerNotFound(_) | AssignmentError::GroupNotFound(_)
            ),
        }
    }
}

/// Result of applying one well-formed op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutcome {
    /// State changed; events and notifications were raised.
    Applied,
    /// Valid op with nothing to change (same name, same value, same group).
    Unchanged,
    /// Dropped without touching state.
    Rejected(Rejection),
}

impl OpOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OpOutcome::Applied)
    }
}

impl<E: Into<Rejection>> From<Result<bool, E>> for OpOutcome {
    fn from(result: Result<bool, E>) -> Self {
        match result {
            Ok(true) => OpOutcome::Applied,
            Ok(false) => OpOutcome::Unchanged,
            Err(e) => OpOutcome::Rejected(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Replica-local configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemConfig {
    /// Participant this replica renders for. Drives the local viewer cache
    /// and therefore resolver notifications.
    pub local_player: PlayerId,
}

impl SystemConfig {
    pub fn for_player(local_player: PlayerId) -> Self {
        SystemConfig { local_player }
    }
}

/// Local viewer cache: the group this replica views the world as, and that
/// group's flag values. Resolvers read these values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LocalView {
    pub group: GroupId,
    pub values: Vec<bool>,
}

// ---------------------------------------------------------------------------
// PermissionSystem
// ---------------------------------------------------------------------------

pub struct PermissionSystem {
    pub(crate) config: SystemConfig,
    pub(crate) registry: DefinitionRegistry,
    pub(crate) groups: GroupStore,
    pub(crate) players: PlayerAssignmentTracker,
    pub(crate) resolvers: ResolverRegistry,
    pub(crate) events: EventBus,
    pub(crate) view: LocalView,
    /// Foreign → local group ids of the last import, until `finish_import`.
    pub(crate) import: Option<ImportState>,
}

impl PermissionSystem {
    /// Create a fresh system holding only the default group.
    pub fn new(registry: DefinitionRegistry, config: SystemConfig) -> Self {
        let groups = GroupStore::new(&registry);
        Self::with_state(registry, config, groups, PlayerAssignmentTracker::new())
    }

    pub(crate) fn with_state(
        registry: DefinitionRegistry,
        config: SystemConfig,
        groups: GroupStore,
        players: PlayerAssignmentTracker,
    ) -> Self {
        let view_group = players
            .group_of(config.local_player)
            .unwrap_or_else(|| groups.default_group_id());
        let values = groups
            .flags(view_group)
            .map(<[bool]>::to_vec)
            .unwrap_or_else(|| registry.defaults());
        PermissionSystem {
            resolvers: ResolverRegistry::new(registry.len()),
            events: EventBus::new(),
            view: LocalView {
                group: view_group,
                values,
            },
            import: None,
            config,
            registry,
            groups,
            players,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn local_player(&self) -> PlayerId {
        self.config.local_player
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn players(&self) -> &PlayerAssignmentTracker {
        &self.players
    }

    pub fn resolvers(&self) -> &ResolverRegistry {
        &self.resolvers
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn subscribe(
        &mut self,
        kind: EventKind,
        listener: impl FnMut(&PermissionEvent) + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(kind, listener)
    }

    /// The group this replica currently views the world as.
    pub fn viewed_group(&self) -> GroupId {
        self.view.group
    }

    /// Flag values of the viewed group, indexed by `DefIndex`.
    pub fn local_values(&self) -> &[bool] {
        &self.view.values
    }

    pub fn local_has_permission(&self, def: DefIndex) -> bool {
        self.view.values.get(def.as_usize()).copied().unwrap_or(false)
    }

    pub fn has_permission(&self, player: PlayerId, def: DefIndex) -> bool {
        self.players.has_permission(&self.groups, player, def)
    }

    pub fn has_permission_by_key(&self, player: PlayerId, key: &str) -> Result<bool, DefinitionError> {
        let def = self.registry.index_of(key)?;
        Ok(self.has_permission(player, def))
    }

    pub fn first_unused_name(&self, desired: &str) -> String {
        self.groups.first_unused_name(desired)
    }

    // -----------------------------------------------------------------------
    // Send side: validate locally, encode, submit. Never mutates.
    // -----------------------------------------------------------------------

    fn submit(&self, log: &mut dyn OpLog, op: Op) -> Result<(), ApplyError> {
        let bytes = op.seal(self.config.local_player)?.to_bytes()?;
        perm_trace!("submit {} ({} bytes)", op.op_type().as_str(), bytes.len());
        log.submit(bytes);
        Ok(())
    }

    pub fn send_duplicate_group(
        &self,
        log: &mut dyn OpLog,
        name: &str,
        source: GroupId,
    ) -> Result<(), ApplyError> {
        let name = self.groups.validate_duplicate(name, source)?;
        self.submit(log, Op::DuplicateGroup(DuplicateGroupPayload { name, source }))
    }

    pub fn send_delete_group(
        &self,
        log: &mut dyn OpLog,
        group: GroupId,
        replacement: GroupId,
    ) -> Result<(), ApplyError> {
        self.groups.validate_delete(group, replacement)?;
        self.submit(log, Op::DeleteGroup(DeleteGroupPayload { group, replacement }))
    }

    /// Does not short-circuit when `name` equals the current name; the op is
    /// sent and applies as `Unchanged`.
    pub fn send_rename_group(
        &self,
        log: &mut dyn OpLog,
        group: GroupId,
        name: &str,
    ) -> Result<(), ApplyError> {
        let name = self.groups.validate_rename(group, name)?;
        self.submit(log, Op::RenameGroup(RenameGroupPayload { group, name }))
    }

    pub fn send_set_player_group(
        &self,
        log: &mut dyn OpLog,
        player: PlayerId,
        group: GroupId,
    ) -> Result<(), ApplyError> {
        if !self.players.contains(player) {
            return Err(AssignmentError::PlayerNotFound(player).into());
        }
        if !self.groups.contains(group) {
            return Err(GroupError::GroupNotFound(group).into());
        }
        self.submit(log, Op::SetPlayerGroup(SetPlayerGroupPayload { player, group }))
    }

    pub fn send_set_flag(
        &self,
        log: &mut dyn OpLog,
        group: GroupId,
        definition: DefIndex,
        value: bool,
    ) -> Result<(), ApplyError> {
        if !self.groups.contains(group) {
            return Err(GroupError::GroupNotFound(group).into());
        }
        self.registry.check_index(definition)?;
        self.submit(
            log,
            Op::SetFlag(SetFlagPayload {
                group,
                definition,
                value,
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Apply path
    // -----------------------------------------------------------------------

    /// Apply one op as delivered by the log. `Err` means the bytes are
    /// corrupt; a well-formed but invalid op is `Ok(OpOutcome::Rejected)`.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<OpOutcome, ApplyError> {
        let envelope = OpEnvelope::from_bytes(bytes).map_err(|e| {
            warn!("Dropping undecodable op ({} bytes): {}", bytes.len(), e);
            e
        })?;
        self.apply_op(&envelope)
    }

    pub fn apply_op(&mut self, envelope: &OpEnvelope) -> Result<OpOutcome, ApplyError> {
        let op = envelope.decode_op().map_err(|e| {
            warn!("Dropping {} with bad payload: {}", envelope.op_type.as_str(), e);
            e
        })?;
        let sender = envelope.sender;

        let outcome = match op {
            Op::DuplicateGroup(p) => self.apply_duplicate(sender, p),
            Op::DeleteGroup(p) => self.apply_delete(sender, p),
            Op::RenameGroup(p) => self.apply_rename(sender, p),
            Op::SetPlayerGroup(p) => self.move_player(p.player, Some(p.group)).into(),
            Op::SetFlag(p) => self.apply_set_flag(p).into(),
        };

        match &outcome {
            OpOutcome::Applied => {
                perm_trace!("applied {} from {}", envelope.op_type.as_str(), sender)
            }
            OpOutcome::Unchanged => {
                debug!("{} from {} changed nothing", envelope.op_type.as_str(), sender)
            }
            OpOutcome::Rejected(reason) => {
                debug!("Rejected {} from {}: {}", envelope.op_type.as_str(), sender, reason)
            }
        }
        Ok(outcome)
    }

    fn apply_duplicate(&mut self, sender: PlayerId, p: DuplicateGroupPayload) -> OpOutcome {
        match self.groups.duplicate(&p.name, p.source) {
            Ok(group) => {
                self.events.emit(PermissionEvent::GroupDuplicated {
                    group,
                    source: p.source,
                    initiator: sender,
                });
                OpOutcome::Applied
            }
            Err(e) => OpOutcome::Rejected(e.into()),
        }
    }

    fn apply_delete(&mut self, sender: PlayerId, p: DeleteGroupPayload) -> OpOutcome {
        if let Err(e) = self.groups.validate_delete(p.group, p.replacement) {
            return OpOutcome::Rejected(e.into());
        }
        self.delete_group(p.group, p.replacement, sender);
        OpOutcome::Applied
    }

    fn apply_rename(&mut self, sender: PlayerId, p: RenameGroupPayload) -> OpOutcome {
        match self.groups.rename(p.group, &p.name) {
            Ok(Some(previous_name)) => {
                self.events.emit(PermissionEvent::GroupRenamed {
                    group: p.group,
                    previous_name,
                    initiator: sender,
                });
                OpOutcome::Applied
            }
            Ok(None) => OpOutcome::Unchanged,
            Err(e) => OpOutcome::Rejected(e.into()),
        }
    }

    fn apply_set_flag(&mut self, p: SetFlagPayload) -> Result<bool, GroupError> {
        if !self.groups.set_flag(p.group, p.definition, p.value)? {
            return Ok(false);
        }
        if p.group == self.view.group {
            if let Some(slot) = self.view.values.get_mut(p.definition.as_usize()) {
                *slot = p.value;
            }
            self.resolvers.notify_definition(p.definition, &self.view.values);
        }
        self.events.emit(PermissionEvent::PermissionValueChanged {
            group: p.group,
            definition: p.definition,
            value: p.value,
        });
        Ok(true)
    }

    /// Delete a validated group: migrate members (last first) while the
    /// group is still live, tombstone, unlink, then raise `GroupDeleted`.
    pub(crate) fn delete_group(&mut self, group: GroupId, replacement: GroupId, initiator: PlayerId) {
        let members: Vec<PlayerId> = self
            .groups
            .get(group)
            .map(|g| g.members().to_vec())
            .unwrap_or_default();
        for player in members.into_iter().rev() {
            if let Err(e) = self.move_player(player, Some(replacement)) {
                debug!("Could not migrate {} out of {}: {}", player, group, e);
            }
        }
        self.groups.mark_deleted(group);
        self.groups.unlink_deleted(group);
        if self.view.group == group {
            self.reset_view();
        }
        perm_trace!("deleted {} (members → {})", group, replacement);
        self.events.emit(PermissionEvent::GroupDeleted {
            group,
            replacement,
            initiator,
        });
    }

    /// Move a participant and raise `PlayerGroupChanged`. For the local
    /// participant the viewer cache follows and every resolver re-runs.
    pub(crate) fn move_player(
        &mut self,
        player: PlayerId,
        group: Option<GroupId>,
    ) -> Result<bool, AssignmentError> {
        let Some(switch) = self.players.set_group(&mut self.groups, player, group)? else {
            return Ok(false);
        };
        if player == self.config.local_player {
            self.reset_view();
        }
        self.events.emit(PermissionEvent::PlayerGroupChanged {
            player,
            previous: switch.previous,
            current: switch.current,
        });
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Participants (host session events, applied in the same order everywhere)
    // -----------------------------------------------------------------------

    pub fn join_player(&mut self, player: PlayerId, online: bool) -> Result<(), AssignmentError> {
        let switch = self.players.join(&mut self.groups, player, online)?;
        if player == self.config.local_player {
            self.reset_view();
        }
        self.events.emit(PermissionEvent::PlayerGroupChanged {
            player,
            previous: switch.previous,
            current: switch.current,
        });
        Ok(())
    }

    pub fn leave_player(&mut self, player: PlayerId) -> Result<(), AssignmentError> {
        let switch = self.players.leave(&mut self.groups, player)?;
        if player == self.config.local_player {
            self.reset_view();
        }
        self.events.emit(PermissionEvent::PlayerGroupChanged {
            player,
            previous: switch.previous,
            current: None,
        });
        Ok(())
    }

    pub fn set_player_online(&mut self, player: PlayerId, online: bool) -> Result<bool, AssignmentError> {
        self.players.set_online(&mut self.groups, player, online)
    }

    pub fn persist_while_offline(&self, player: PlayerId) -> bool {
        self.players.persist_while_offline(&self.groups, player)
    }

    // -----------------------------------------------------------------------
    // Local viewer
    // -----------------------------------------------------------------------

    /// View the world as `group` (local preview; not replicated). Updates
    /// the viewer cache and re-runs every resolver.
    pub fn view_as(&mut self, group: GroupId) -> Result<(), GroupError> {
        if !self.groups.contains(group) {
            return Err(GroupError::GroupNotFound(group));
        }
        self.set_view(group);
        Ok(())
    }

    /// Go back to viewing as the local participant's own group.
    pub fn reset_view(&mut self) {
        let group = self
            .players
            .group_of(self.config.local_player)
            .filter(|g| self.groups.contains(*g))
            .unwrap_or_else(|| self.groups.default_group_id());
        self.set_view(group);
    }

    pub(crate) fn set_view(&mut self, group: GroupId) {
        let Some(flags) = self.groups.flags(group) else {
            return;
        };
        self.view.group = group;
        self.view.values.clear();
        self.view.values.extend_from_slice(flags);
        self.resolvers.notify_all(&self.view.values);
    }

    // -----------------------------------------------------------------------
    // Resolvers
    // -----------------------------------------------------------------------

    /// Register against `defs` and resolve once with the current values.
    pub fn register_resolver(
        &mut self,
        resolver: &SharedResolver,
        defs: &[DefIndex],
    ) -> Result<ResolverHandle, ResolverError> {
        let handle = self.resolvers.register(resolver, defs)?;
        self.resolvers.resolve_one(handle, &self.view.values);
        Ok(handle)
    }

    /// Register against every definition `conditions` reads.
    pub fn register_condition_resolver(
        &mut self,
        resolver: &SharedResolver,
        conditions: &ConditionList,
    ) -> Result<ResolverHandle, ResolverError> {
        self.register_resolver(resolver, &conditions.definitions())
    }

    pub fn register_global_resolver(&mut self, resolver: &SharedResolver) -> ResolverHandle {
        let handle = self.resolvers.register_global(resolver);
        self.resolvers.resolve_one(handle, &self.view.values);
        handle
    }

    pub fn deregister_resolver(&mut self, handle: ResolverHandle) -> bool {
        self.resolvers.deregister(handle)
    }

    pub fn is_resolver_registered(&self, handle: ResolverHandle) -> bool {
        self.resolvers.is_registered(handle)
    }

    /// End of bootstrap; see `ResolverRegistry::begin_session`.
    pub fn begin_session(&mut self) {
        self.resolvers.begin_session();
    }

    pub fn is_preexisting(&self, handle: ResolverHandle) -> bool {
        self.resolvers.is_preexisting(handle)
    }

    // -----------------------------------------------------------------------
    // Convergence & tooling
    // -----------------------------------------------------------------------

    /// Deterministic hash of all replicated state (groups, flags, member
    /// lists, assignments). Replica-local state (viewer cache, resolvers,
    /// listeners) is excluded.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();

        hasher.update(b"D");
        hasher.update(&(self.registry.len() as u64).to_le_bytes());
        for key in self.registry.keys() {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
        }

        hasher.update(b"G");
        self.groups.hash_into(&mut hasher);

        hasher.update(b"P");
        self.players.hash_into(&mut hasher);

        *hasher.finalize().as_bytes()
    }

    pub fn state_hash_hex(&self) -> String {
        hex::encode(self.state_hash())
    }

    /// JSON view of the replicated state for tooling and logs.
    pub fn summary_json(&self) -> serde_json::Value {
        let groups: Vec<serde_json::Value> = self
            .groups
            .iter()
            .map(|g| {
                let flags: serde_json::Map<String, serde_json::Value> = self
                    .registry
                    .iter()
                    .map(|d| (d.key().to_string(), serde_json::Value::Bool(g.flag(d.index()))))
                    .collect();
                serde_json::json!({
                    "id": g.id().get(),
                    "name": g.name(),
                    "default": g.is_default(),
                    "flags": flags,
                    "members": g.members().iter().map(|p| p.0).collect::<Vec<_>>(),
                    "online": g.online_members().iter().map(|p| p.0).collect::<Vec<_>>(),
                })
            })
            .collect();
        serde_json::json!({
            "next_group_id": self.groups.next_id().get(),
            "groups": groups,
            "participants": self.players.len(),
            "viewed_group": self.view.group.get(),
            "state_hash": self.state_hash_hex(),
        })
    }
}

impl std::fmt::Debug for PermissionSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionSystem")
            .field("local_player", &self.config.local_player)
            .field("groups", &self.groups.len())
            .field("players", &self.players.len())
            .field("resolvers", &self.resolvers.len())
            .field("viewed_group", &self.view.group)
            .field("importing", &self.import.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
