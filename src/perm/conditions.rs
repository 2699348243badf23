/// Condition lists — ordered `(definition, logical_and, invert)` triples.
///
/// Evaluation walks the list left to right with no precedence: an AND after a
/// failed term is skipped, and an OR after a satisfied term stops evaluation.
/// The first term's `logical_and` has nothing to combine with and is ignored,
/// but it is kept so editors round-trip lists unchanged.
use serde::{Deserialize, Serialize};

use crate::perm::definitions::{DefinitionError, DefinitionRegistry};
use crate::perm::ids::DefIndex;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Condition {
    pub definition: DefIndex,
    pub logical_and: bool,
    pub invert: bool,
}

impl Condition {
    pub fn new(definition: DefIndex, logical_and: bool, invert: bool) -> Self {
        Condition {
            definition,
            logical_and,
            invert,
        }
    }
}

/// Evaluate `conditions` against `values` (indexed by `DefIndex`).
///
/// Returns `true` for an empty list. Indices outside `values` read as `false`.
pub fn evaluate(conditions: &[Condition], values: &[bool]) -> bool {
    let mut matching = true;
    for (i, cond) in conditions.iter().enumerate() {
        if !matching && cond.logical_and {
            continue;
        }
        if !cond.logical_and && matching && i != 0 {
            break;
        }
        let value = values
            .get(cond.definition.as_usize())
            .copied()
            .unwrap_or(false);
        matching = value != cond.invert;
    }
    matching
}

// ---------------------------------------------------------------------------
// ConditionList
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionList(pub Vec<Condition>);

impl ConditionList {
    /// Build a list from `(key, logical_and, invert)` triples.
    pub fn from_keys(
        registry: &DefinitionRegistry,
        terms: &[(&str, bool, bool)],
    ) -> Result<Self, DefinitionError> {
        terms
            .iter()
            .map(|(key, and, invert)| Ok(Condition::new(registry.index_of(key)?, *and, *invert)))
            .collect::<Result<Vec<_>, _>>()
            .map(ConditionList)
    }

    pub fn evaluate(&self, values: &[bool]) -> bool {
        evaluate(&self.0, values)
    }

    /// Distinct definitions referenced, in first-use order. This is the set
    /// a resolver built on this list registers against.
    pub fn definitions(&self) -> Vec<DefIndex> {
        let mut out: Vec<DefIndex> = Vec::with_capacity(self.0.len());
        for cond in &self.0 {
            if !out.contains(&cond.definition) {
                out.push(cond.definition);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

// ---------------------------------------------------------------------------
// VisibilityRule
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhenConditionsMet {
    Show,
    Hide,
}

/// Show/hide decision for an object gated by a condition list.
///
/// Computes the boolean only; applying it (toggling visibility) is the
/// caller's side effect.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VisibilityRule {
    pub conditions: ConditionList,
    pub when_met: WhenConditionsMet,
}

impl VisibilityRule {
    pub fn should_show(&self, values: &[bool]) -> bool {
        let met = self.conditions.evaluate(values);
        match self.when_met {
            WhenConditionsMet::Show => met,
            WhenConditionsMet::Hide => !met,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
