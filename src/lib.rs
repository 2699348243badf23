//! # Permission Lockstep
//!
//! **Deterministic, replicated permission groups for lockstep simulations.**
//!
//! Every replica of a shared simulation holds the same permission state. State
//! only changes through small operations that an external ordered op log
//! delivers to every replica in the same order, so replaying the same prefix
//! yields bit-identical groups and assignments everywhere.
//!
//! ## Quick Start
//!
//! ```rust
//! use permission_lockstep::perm::{
//!     DefinitionRegistry, DefinitionSpec, PermissionSystem, SystemConfig, VecOpLog,
//! };
//!
//! let registry = DefinitionRegistry::new(vec![
//!     DefinitionSpec::new("build", "Build", true),
//!     DefinitionSpec::new("fly", "Fly", false),
//! ])
//! .unwrap();
//! let mut system = PermissionSystem::new(registry, SystemConfig::default());
//! let mut log = VecOpLog::default();
//!
//! let default = system.groups().default_group_id();
//! system.send_duplicate_group(&mut log, "Mods", default).unwrap();
//! for bytes in log.drain() {
//!     system.receive(&bytes).unwrap();
//! }
//! assert!(system.groups().get_by_name("Mods").is_some());
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`perm::ids`] | Group, definition, participant and resolver identifiers |
//! | [`perm::limits`] | Guardrails for anything decoded from the wire |
//! | [`perm::definitions`] | Immutable permission definition catalog |
//! | [`perm::conditions`] | Pure AND/OR/invert condition list evaluation |
//! | [`perm::groups`] | Group store: create, duplicate, rename, delete, flags |
//! | [`perm::players`] | Participant → group assignment with O(1) member lists |
//! | [`perm::resolvers`] | Observer graph notified on local permission changes |
//! | [`perm::events`] | Per-kind listeners for applied changes |
//! | [`perm::ops`] | Replicated operation envelope and payloads |
//! | [`perm::snapshot`] | Catch-up transfer and export/import with remapping |
//! | [`perm::system`] | The context object and the single apply path |
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `std` | Yes | Standard library support |
//! | `debug-logs` | No | Trace every state mutation through `log::trace!` |

// Stylistic lints only.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity,
    clippy::new_without_default
)]

// ── Internal macros ─────────────────────────────────────────────────────────

/// Per-mutation trace line, compiled in only with the `debug-logs` feature.
#[cfg(feature = "debug-logs")]
macro_rules! perm_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

#[cfg(not(feature = "debug-logs"))]
macro_rules! perm_trace {
    ($($arg:tt)*) => {{
        if false {
            let _ = format_args!($($arg)*);
        }
    }};
}

// ── Public modules ──────────────────────────────────────────────────────────

/// Replicated permission groups — definitions, groups, assignments, resolvers,
/// ops, and snapshots.
pub mod perm;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use perm::{
    ApplyError, DefIndex, DefinitionRegistry, GroupId, OpOutcome, PermissionSystem, PlayerId,
    ResolverHandle,
};

// ── Library metadata ────────────────────────────────────────────────────────

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().contains('.'));
    }
}
