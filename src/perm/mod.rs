//! Replicated permission groups — lockstep op replay over flat boolean flags.
//!
//! Permissions are boolean capabilities granted to groups of participants.
//! Every replica holds the same groups and assignments; state only changes
//! through ops that an external ordered log delivers to every replica in the
//! same order. Local observers ("resolvers") are notified when the values the
//! local participant sees change.
//!
//! # Module structure
//! - `ids` — GroupId, DefIndex, PlayerId, ResolverHandle identity types
//! - `limits` — Guardrail constants and name checks
//! - `definitions` — Immutable definition registry and manifest loading
//! - `conditions` — AND/OR/invert condition lists and visibility rules
//! - `groups` — Group store with tombstones, flags and member lists
//! - `players` — Participant → group assignment with O(1) swap-remove lists
//! - `resolvers` — Weakly held observer graph with O(1) deregistration
//! - `events` — Per-kind event listeners
//! - `ops` — OpEnvelope, OpType, payload types, the OpLog seam
//! - `snapshot` — Export/import with remapping, catch-up transfer
//! - `system` — Unified apply engine (PermissionSystem, state_hash)
pub mod conditions;
pub mod definitions;
pub mod events;
pub mod groups;
pub mod ids;
pub mod limits;
pub mod ops;
pub mod players;
pub mod resolvers;
pub mod snapshot;
pub mod system;

// Re-export core types for convenience
pub use conditions::{evaluate, Condition, ConditionList, VisibilityRule, WhenConditionsMet};
pub use definitions::{DefinitionError, DefinitionRegistry, DefinitionSpec, PermissionDefinition};
pub use events::{EventBus, EventKind, PermissionEvent, SubscriptionId};
pub use groups::{GroupError, GroupStore, PermissionGroup, DEFAULT_GROUP_NAME};
pub use ids::{DefIndex, GroupId, PlayerId, ResolverHandle};
pub use limits::{check_group_name, NameStatus};
pub use ops::{
    DeleteGroupPayload, DuplicateGroupPayload, Op, OpEnvelope, OpError, OpLog, OpType,
    RenameGroupPayload, SetFlagPayload, SetPlayerGroupPayload, VecOpLog,
};
pub use players::{AssignmentError, GroupSwitch, PlayerAssignment, PlayerAssignmentTracker};
pub use resolvers::{
    PermissionResolver, ResolveContext, ResolverError, ResolverRegistry, ResolverScope,
    SharedResolver, VisibilityResolver,
};
pub use snapshot::{
    ExportSnapshot, ExportedAssignment, ExportedGroup, FlagBits, ImportExportOptions, ImportMode,
    ImportReport, ImportStatus, SnapshotError,
};
pub use system::{ApplyError, OpOutcome, PermissionSystem, Rejection, SystemConfig};
