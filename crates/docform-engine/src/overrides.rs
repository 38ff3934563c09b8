//! Overrides: values a user typed into a generated document that differ from what the system
//! computed.
//!
//! An override starts out `PENDING` and only takes part in effective-value resolution once it has
//! been accepted.

use docform_model::{FieldId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideState {
    Pending,
    Accepted,
    Invalid,
    /// Written back into a generated document; eligible for post-generation cleanup.
    Synced,
    /// Written back for a formula field. Terminal, never cleaned up.
    SyncedFormula,
}

impl OverrideState {
    pub fn as_str(self) -> &'static str {
        match self {
            OverrideState::Pending => "PENDING",
            OverrideState::Accepted => "ACCEPTED",
            OverrideState::Invalid => "INVALID",
            OverrideState::Synced => "SYNCED",
            OverrideState::SyncedFormula => "SYNCED_FORMULA",
        }
    }

    /// States in which the override value wins over formula and raw values.
    pub fn is_applied(self) -> bool {
        matches!(
            self,
            OverrideState::Accepted | OverrideState::Synced | OverrideState::SyncedFormula
        )
    }

    /// Legal edges of the state machine. Deletion is handled separately.
    pub fn can_transition_to(self, next: OverrideState, is_formula_field: bool) -> bool {
        use OverrideState::*;
        match (self, next) {
            (Pending, Accepted) | (Pending, Invalid) | (Invalid, Pending) => true,
            (Accepted, Synced) => !is_formula_field,
            (Accepted, SyncedFormula) => is_formula_field,
            _ => false,
        }
    }
}

impl fmt::Display for OverrideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OverrideError {
    #[error("override on `{field_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        field_id: FieldId,
        from: OverrideState,
        to: OverrideState,
    },
    #[error("override on `{field_id}` failed validation: {message}")]
    ValidationFailed { field_id: FieldId, message: String },
    #[error("override on `{field_id}` has {} conflicting values", .values.len())]
    Conflict { field_id: FieldId, values: Vec<Value> },
    #[error("no override on `{0}`")]
    NotFound(FieldId),
    #[error("override on `{field_id}` in state {state} cannot be deleted")]
    NotDeletable {
        field_id: FieldId,
        state: OverrideState,
    },
}

/// More than one distinct value was reported for the same field.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Distinct values in the order they were first reported.
    pub values: Vec<Value>,
}

/// Returns a conflict iff `values` holds more than one distinct value.
pub fn detect_conflict(values: &[Value]) -> Option<Conflict> {
    let mut distinct: Vec<Value> = Vec::new();
    for value in values {
        if !distinct.contains(value) {
            distinct.push(value.clone());
        }
    }
    (distinct.len() > 1).then_some(Conflict { values: distinct })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub field_id: FieldId,
    /// What the system would have produced for the field when the override was last refreshed.
    pub system_value: Value,
    pub report_values: Vec<Value>,
    pub state: OverrideState,
    pub is_formula_field: bool,
    #[serde(default = "docform_model::serde_defaults::default_true")]
    pub use_in_generation: bool,
}

impl Override {
    pub fn new(
        field_id: impl Into<FieldId>,
        system_value: Value,
        observed: Value,
        is_formula_field: bool,
    ) -> Self {
        Self {
            field_id: field_id.into(),
            system_value,
            report_values: vec![observed],
            state: OverrideState::Pending,
            is_formula_field,
            use_in_generation: true,
        }
    }

    pub fn conflict(&self) -> Option<Conflict> {
        detect_conflict(&self.report_values)
    }

    /// The single reported value, or `None` while a conflict is unresolved.
    pub fn value(&self) -> Option<&Value> {
        if self.conflict().is_some() {
            return None;
        }
        self.report_values.first()
    }

    /// The value this override contributes to effective-value resolution, if any.
    pub fn effective_value(&self) -> Option<&Value> {
        if self.state.is_applied() && self.use_in_generation {
            self.value()
        } else {
            None
        }
    }

    /// Moves to `next` if the state machine allows it; returns the previous state.
    pub fn transition(&mut self, next: OverrideState) -> Result<OverrideState, OverrideError> {
        if !self.state.can_transition_to(next, self.is_formula_field) {
            return Err(OverrideError::InvalidTransition {
                field_id: self.field_id.clone(),
                from: self.state,
                to: next,
            });
        }
        if next == OverrideState::Accepted {
            if let Some(conflict) = self.conflict() {
                return Err(OverrideError::Conflict {
                    field_id: self.field_id.clone(),
                    values: conflict.values,
                });
            }
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// The state written back after generation: `SYNCED_FORMULA` for formula fields.
    pub fn synced_state(&self) -> OverrideState {
        if self.is_formula_field {
            OverrideState::SyncedFormula
        } else {
            OverrideState::Synced
        }
    }
}

/// Effective value of one field: an applied override, else the formula result, else the raw value.
///
/// `computed` is `Some` exactly when the field has a formula.
pub fn resolve_effective(
    override_entry: Option<&Override>,
    computed: Option<&Value>,
    raw: &Value,
) -> Value {
    if let Some(value) = override_entry.and_then(Override::effective_value) {
        return value.clone();
    }
    computed.unwrap_or(raw).clone()
}

/// All overrides of the working set, keyed by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideBook {
    entries: BTreeMap<FieldId, Override>,
}

impl OverrideBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Override> {
        self.entries.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Override> {
        self.entries.get_mut(field)
    }

    pub fn require(&self, field: &str) -> Result<&Override, OverrideError> {
        self.entries
            .get(field)
            .ok_or_else(|| OverrideError::NotFound(FieldId::from(field)))
    }

    pub fn require_mut(&mut self, field: &str) -> Result<&mut Override, OverrideError> {
        self.entries
            .get_mut(field)
            .ok_or_else(|| OverrideError::NotFound(FieldId::from(field)))
    }

    /// Replaces (or removes, for `None`) the override on `field`.
    pub fn put(&mut self, field: &FieldId, entry: Option<Override>) {
        match entry {
            Some(entry) => {
                self.entries.insert(field.clone(), entry);
            }
            None => {
                self.entries.remove(field);
            }
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<Override> {
        self.entries.remove(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Override> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Override> {
        self.entries.values_mut()
    }

    /// Fields whose override is in `state`, sorted.
    pub fn fields_in_state(&self, state: OverrideState) -> Vec<FieldId> {
        self.entries
            .values()
            .filter(|o| o.state == state)
            .map(|o| o.field_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<Override> for OverrideBook {
    fn from_iter<T: IntoIterator<Item = Override>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|o| (o.field_id.clone(), o))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn legal_transitions() {
        use OverrideState::*;
        assert!(Pending.can_transition_to(Accepted, false));
        assert!(Pending.can_transition_to(Invalid, false));
        assert!(Invalid.can_transition_to(Pending, false));
        assert!(Accepted.can_transition_to(Synced, false));
        assert!(!Accepted.can_transition_to(Synced, true));
        assert!(Accepted.can_transition_to(SyncedFormula, true));
        assert!(!Accepted.can_transition_to(Pending, false));
        assert!(!Invalid.can_transition_to(Accepted, false));
        for next in [Pending, Accepted, Invalid, Synced, SyncedFormula] {
            assert!(!SyncedFormula.can_transition_to(next, true));
            assert!(!Synced.can_transition_to(next, false));
        }
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        let mut entry = Override::new("f", Value::Null, "x".into(), false);
        let err = entry.transition(OverrideState::Synced).unwrap_err();
        assert_eq!(
            err,
            OverrideError::InvalidTransition {
                field_id: "f".into(),
                from: OverrideState::Pending,
                to: OverrideState::Synced,
            }
        );
        assert_eq!(entry.state, OverrideState::Pending);
    }

    #[test]
    fn conflicts_need_more_than_one_distinct_value() {
        assert_eq!(detect_conflict(&[]), None);
        assert_eq!(detect_conflict(&["a".into(), "a".into()]), None);
        assert_eq!(
            detect_conflict(&["a".into(), "b".into(), "a".into()]),
            Some(Conflict {
                values: vec!["a".into(), "b".into()]
            })
        );
    }

    #[test]
    fn conflicts_block_acceptance() {
        let mut entry = Override::new("f", Value::Null, "A".into(), false);
        entry.report_values.push("B".into());
        let err = entry.transition(OverrideState::Accepted).unwrap_err();
        assert!(matches!(err, OverrideError::Conflict { ref values, .. } if values.len() == 2));
        assert_eq!(entry.state, OverrideState::Pending);
    }

    #[test]
    fn effective_value_priority() {
        let raw = Value::Number(100.0);
        let computed = Value::Number(120.0);
        let mut entry = Override::new("f", computed.clone(), Value::Number(150.0), true);

        assert_eq!(resolve_effective(Some(&entry), Some(&computed), &raw), computed);
        entry.transition(OverrideState::Accepted).unwrap();
        assert_eq!(
            resolve_effective(Some(&entry), Some(&computed), &raw),
            Value::Number(150.0)
        );

        entry.use_in_generation = false;
        assert_eq!(resolve_effective(Some(&entry), Some(&computed), &raw), computed);
        assert_eq!(resolve_effective(None, None, &raw), raw);
    }

    #[test]
    fn missing_generation_flag_defaults_to_usable() {
        let mut entry = Override::new("f", Value::Null, Value::Number(1.0), false);
        entry.use_in_generation = false;
        let mut json = serde_json::to_value(&entry).unwrap();
        json.as_object_mut().unwrap().remove("use_in_generation");

        let loaded: Override = serde_json::from_value(json).unwrap();
        assert!(loaded.use_in_generation);
        assert_eq!(loaded.report_values, entry.report_values);
    }
}
