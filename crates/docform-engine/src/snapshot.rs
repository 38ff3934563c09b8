use docform_model::{FieldId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::overrides::Override;

/// The persistable part of a working set: user-entered values and override records.
///
/// Formula results, control effects and effective values are derived and therefore not part of
/// the snapshot; importing one recomputes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub values: BTreeMap<FieldId, Value>,
    #[serde(default)]
    pub overrides: Vec<Override>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::OverrideState;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_layout_is_stable() {
        let mut snapshot = Snapshot::default();
        snapshot.values.insert("qty".into(), Value::Number(2.0));
        snapshot
            .overrides
            .push(Override::new("total", Value::Number(20.0), Value::Number(25.0), true));

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["values"]["qty"]["value"], 2.0);
        assert_eq!(json["overrides"][0]["state"], "PENDING");
        assert_eq!(json["overrides"][0]["use_in_generation"], true);

        let back = Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(back, snapshot);
        assert_eq!(back.overrides[0].state, OverrideState::Pending);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        assert_eq!(Snapshot::from_json("{}").unwrap(), Snapshot::default());
    }
}
