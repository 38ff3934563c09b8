use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{FieldDefinition, FieldId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("duplicate field: {0}")]
    DuplicateField(FieldId),
    #[error("field ids must not be empty")]
    EmptyFieldId,
}

/// The set of fields of one working set, in registration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldDefinition>", into = "Vec<FieldDefinition>")]
pub struct Schema {
    fields: Vec<FieldDefinition>,
    index: HashMap<FieldId, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(
        fields: impl IntoIterator<Item = FieldDefinition>,
    ) -> Result<Self, SchemaError> {
        let mut schema = Self::new();
        for field in fields {
            schema.add_field(field)?;
        }
        Ok(schema)
    }

    pub fn add_field(&mut self, field: FieldDefinition) -> Result<(), SchemaError> {
        if field.id.as_str().trim().is_empty() {
            return Err(SchemaError::EmptyFieldId);
        }
        if self.index.contains_key(&field.id) {
            return Err(SchemaError::DuplicateField(field.id));
        }
        self.index.insert(field.id.clone(), self.fields.len());
        self.fields.push(field);
        Ok(())
    }

    pub fn field(&self, id: &str) -> Option<&FieldDefinition> {
        let idx = *self.index.get(id)?;
        self.fields.get(idx)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &FieldId> {
        self.fields.iter().map(|f| &f.id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl TryFrom<Vec<FieldDefinition>> for Schema {
    type Error = SchemaError;

    fn try_from(fields: Vec<FieldDefinition>) -> Result<Self, Self::Error> {
        Self::from_fields(fields)
    }
}

impl From<Schema> for Vec<FieldDefinition> {
    fn from(schema: Schema) -> Self {
        schema.fields
    }
}
