use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::Value;

/// Opaque, schema-unique field identifier.
///
/// Ordering is lexical; the engine relies on it to break ties deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for FieldId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FieldId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FieldId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FieldId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&FieldId> for FieldId {
    fn from(value: &FieldId) -> Self {
        value.clone()
    }
}

/// Input kind of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Date,
    /// Single selection out of [`FieldDefinition::options`].
    Choice,
    /// Any subset of [`FieldDefinition::options`], stored as [`Value::List`].
    MultiChoice,
}

impl FieldType {
    /// Whether `value` has the shape this field type stores.
    ///
    /// `Null` is accepted by every type; requiredness is checked separately.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Text, Value::Text(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Date, Value::Date(_)) => true,
            (FieldType::Choice, Value::Text(_)) => true,
            (FieldType::MultiChoice, Value::List(items)) => {
                items.iter().all(|item| matches!(item, Value::Text(_)))
            }
            _ => false,
        }
    }
}

/// Schema entry for one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: FieldId,
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default, skip_serializing_if = "crate::serde_defaults::is_false")]
    pub required: bool,
    /// Choice options, in display order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Formula text; a field with a formula is derived rather than edited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Initial visibility before any control rule fires.
    #[serde(default = "crate::serde_defaults::default_true")]
    pub visible: bool,
    /// Initial enabled state before any control rule fires.
    #[serde(default = "crate::serde_defaults::default_true")]
    pub enabled: bool,
}

impl FieldDefinition {
    pub fn new(id: impl Into<FieldId>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            field_type,
            label: String::new(),
            required: false,
            options: Vec::new(),
            formula: None,
            visible: true,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    #[must_use]
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_accepts_matching_shapes_and_null() {
        assert!(FieldType::Number.accepts(&Value::Number(1.0)));
        assert!(FieldType::Number.accepts(&Value::Null));
        assert!(!FieldType::Number.accepts(&Value::from("1")));
        assert!(FieldType::MultiChoice.accepts(&Value::List(vec!["a".into()])));
        assert!(!FieldType::MultiChoice.accepts(&Value::List(vec![1.0.into()])));
    }

    #[test]
    fn field_ids_borrow_as_str() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(FieldId::from("total"), 1);
        assert_eq!(map.get("total"), Some(&1));
    }
}
