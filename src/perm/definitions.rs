/// Permission definition catalog.
///
/// Built once from an ordered list of definitions (or an authored JSON
/// manifest) and immutable afterwards. Every definition gets a dense index in
/// construction order; group flag vectors are indexed by it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::perm::ids::DefIndex;
use crate::perm::limits::{MAX_DEFINITIONS, MAX_DEFINITION_KEY_BYTES};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("No permission definition with key {0:?}")]
    NotFound(String),

    #[error("Permission definition index {0} out of range")]
    IndexOutOfRange(u32),

    #[error("Permission definition key must not be empty")]
    EmptyKey,

    #[error("Permission definition key too long ({len} > {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Duplicate permission definition key {0:?}")]
    DuplicateKey(String),

    #[error("Too many permission definitions ({count} > {max})")]
    TooMany { count: usize, max: usize },

    #[error("Manifest parse failed: {0}")]
    Manifest(String),
}

// ---------------------------------------------------------------------------
// DefinitionSpec (input) / PermissionDefinition (registered)
// ---------------------------------------------------------------------------

/// One authored definition, as supplied by the host or a manifest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DefinitionSpec {
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "default")]
    pub default_value: bool,
    /// Sort key used by manifests; ignored by `DefinitionRegistry::new`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

impl DefinitionSpec {
    pub fn new(key: impl Into<String>, label: impl Into<String>, default_value: bool) -> Self {
        DefinitionSpec {
            key: key.into(),
            label: label.into(),
            default_value,
            order: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionDefinition {
    key: String,
    label: String,
    default_value: bool,
    index: DefIndex,
}

impl PermissionDefinition {
    /// Stable, author-assigned key (used for cross-schema matching).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn default_value(&self) -> bool {
        self.default_value
    }

    pub fn index(&self) -> DefIndex {
        self.index
    }
}

#[derive(Deserialize)]
struct Manifest {
    definitions: Vec<DefinitionSpec>,
}

// ---------------------------------------------------------------------------
// DefinitionRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct DefinitionRegistry {
    defs: Vec<PermissionDefinition>,
    by_key: BTreeMap<String, DefIndex>,
}

impl DefinitionRegistry {
    /// Build the registry. Indices follow the order of `specs`.
    pub fn new(specs: Vec<DefinitionSpec>) -> Result<Self, DefinitionError> {
        if specs.len() > MAX_DEFINITIONS {
            return Err(DefinitionError::TooMany {
                count: specs.len(),
                max: MAX_DEFINITIONS,
            });
        }

        let mut defs = Vec::with_capacity(specs.len());
        let mut by_key = BTreeMap::new();

        for (i, spec) in specs.into_iter().enumerate() {
            if spec.key.is_empty() {
                return Err(DefinitionError::EmptyKey);
            }
            if spec.key.len() > MAX_DEFINITION_KEY_BYTES {
                return Err(DefinitionError::KeyTooLong {
                    len: spec.key.len(),
                    max: MAX_DEFINITION_KEY_BYTES,
                });
            }
            let index = DefIndex::from_usize(i);
            if by_key.insert(spec.key.clone(), index).is_some() {
                return Err(DefinitionError::DuplicateKey(spec.key));
            }
            defs.push(PermissionDefinition {
                key: spec.key,
                label: spec.label,
                default_value: spec.default_value,
                index,
            });
        }

        Ok(DefinitionRegistry { defs, by_key })
    }

    /// Build the registry from an authored JSON manifest:
    ///
    /// ```json
    /// { "definitions": [ { "key": "build", "label": "Build", "default": true, "order": "a" } ] }
    /// ```
    ///
    /// Entries are sorted by `order` (entries without one go last), then by
    /// key, so every installation assigns the same indices for the same file.
    pub fn from_manifest_json(json: &str) -> Result<Self, DefinitionError> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| DefinitionError::Manifest(e.to_string()))?;
        let mut specs = manifest.definitions;
        specs.sort_by(|a, b| match (&a.order, &b.order) {
            (Some(x), Some(y)) => x.cmp(y).then_with(|| a.key.cmp(&b.key)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.key.cmp(&b.key),
        });
        Self::new(specs)
    }

    /// Look up a definition index by key.
    ///
    /// `NotFound` means "no such capability here", never a fatal condition.
    pub fn index_of(&self, key: &str) -> Result<DefIndex, DefinitionError> {
        self.by_key
            .get(key)
            .copied()
            .ok_or_else(|| DefinitionError::NotFound(key.to_string()))
    }

    pub fn get(&self, index: DefIndex) -> Option<&PermissionDefinition> {
        self.defs.get(index.as_usize())
    }

    pub fn get_by_key(&self, key: &str) -> Option<&PermissionDefinition> {
        self.by_key.get(key).and_then(|i| self.get(*i))
    }

    /// Validate an index received from the wire.
    pub fn check_index(&self, index: DefIndex) -> Result<DefIndex, DefinitionError> {
        if index.as_usize() < self.defs.len() {
            Ok(index)
        } else {
            Err(DefinitionError::IndexOutOfRange(index.0))
        }
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Definitions in index order.
    pub fn iter(&self) -> impl Iterator<Item = &PermissionDefinition> + '_ {
        self.defs.iter()
    }

    /// Keys in index order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.defs.iter().map(|d| d.key.as_str())
    }

    /// A fresh flag vector holding every definition's default.
    pub fn defaults(&self) -> Vec<bool> {
        self.defs.iter().map(|d| d.default_value).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
