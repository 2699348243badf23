/// Permission system guardrails.
///
/// These constants bound the size of anything decoded from the op log or a
/// foreign snapshot, so a corrupt or hostile payload is rejected before it can
/// allocate unbounded memory on any replica.

/// Max permission definitions in one registry.
pub const MAX_DEFINITIONS: usize = 4_096;

/// Max live permission groups.
pub const MAX_GROUPS: usize = 16_384;

/// Max bytes of a (trimmed) group name.
pub const MAX_GROUP_NAME_BYTES: usize = 256;

/// Max bytes of a definition key.
pub const MAX_DEFINITION_KEY_BYTES: usize = 256;

/// Max payload size per op.
pub const MAX_OP_PAYLOAD_BYTES: usize = 1024;

/// Max serialized envelope size (payload + header overhead).
pub const MAX_OP_BYTES: usize = MAX_OP_PAYLOAD_BYTES + 32;

/// Max size of an export or catch-up snapshot.
pub const MAX_SNAPSHOT_BYTES: usize = 16 * 1024 * 1024; // 16 MB

/// Max participants carried by one snapshot.
pub const MAX_SNAPSHOT_PLAYERS: usize = 65_536;

/// Name validation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStatus {
    Ok,
    /// Empty after trimming.
    Empty,
    /// Longer than `MAX_GROUP_NAME_BYTES`.
    TooLong,
}

/// Check an already-trimmed group name against the guardrails.
pub fn check_group_name(trimmed: &str) -> NameStatus {
    if trimmed.is_empty() {
        NameStatus::Empty
    } else if trimmed.len() > MAX_GROUP_NAME_BYTES {
        NameStatus::TooLong
    } else {
        NameStatus::Ok
    }
}

/// Whether another group may be created.
pub fn can_create_group(live_groups: usize) -> bool {
    live_groups < MAX_GROUPS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_ok() {
        assert_eq!(check_group_name("Mods"), NameStatus::Ok);
        assert_eq!(check_group_name(&"a".repeat(MAX_GROUP_NAME_BYTES)), NameStatus::Ok);
    }

    #[test]
    fn test_group_name_empty() {
        assert_eq!(check_group_name(""), NameStatus::Empty);
    }

    #[test]
    fn test_group_name_too_long() {
        assert_eq!(
            check_group_name(&"a".repeat(MAX_GROUP_NAME_BYTES + 1)),
            NameStatus::TooLong
        );
    }

    #[test]
    fn test_group_cap() {
        assert!(can_create_group(0));
        assert!(can_create_group(MAX_GROUPS - 1));
        assert!(!can_create_group(MAX_GROUPS));
    }
}
