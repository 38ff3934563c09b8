use serde::{Deserialize, Serialize};

use crate::control::MAX_CHAIN_DEPTH;
use crate::undo::{DEFAULT_MERGE_WINDOW_MS, DEFAULT_UNDO_CAPACITY};

/// Engine-wide limits.
///
/// Missing keys in JSON fall back to the defaults, so hosts only need to spell out what they
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of control-rule waves one write may trigger.
    pub max_chain_depth: usize,
    /// Number of commands kept for undo; older ones are evicted.
    pub undo_capacity: usize,
    /// Consecutive writes to one field closer together than this merge into one undo step.
    /// `0` disables merging.
    pub merge_window_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_chain_depth: MAX_CHAIN_DEPTH,
            undo_capacity: DEFAULT_UNDO_CAPACITY,
            merge_window_ms: DEFAULT_MERGE_WINDOW_MS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

impl EngineSettings {
    /// Parses and validates settings from JSON.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: EngineSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_chain_depth == 0 {
            return Err(SettingsError::Zero("max_chain_depth"));
        }
        if self.undo_capacity == 0 {
            return Err(SettingsError::Zero("undo_capacity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = EngineSettings::from_json(r#"{"undo_capacity": 20}"#).unwrap();
        assert_eq!(
            settings,
            EngineSettings {
                undo_capacity: 20,
                ..EngineSettings::default()
            }
        );
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let err = EngineSettings::from_json(r#"{"max_chain_depth": 0}"#).unwrap_err();
        assert!(matches!(err, SettingsError::Zero("max_chain_depth")));
        assert!(EngineSettings::from_json(r#"{"merge_window_ms": 0}"#).is_ok());
        assert!(matches!(
            EngineSettings::from_json("{"),
            Err(SettingsError::Json(_))
        ));
    }
}
