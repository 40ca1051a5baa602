use serde::{Deserialize, Serialize};

use crate::{SatelliteKind, TreeError};

/// Deepest plausible category hierarchy. An ancestor walk longer than this is treated as a
/// parent-pointer cycle.
pub const DEFAULT_MAX_DEPTH: usize = 64;

const MAX_DEPTH_CEILING: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_depth: usize,
    pub satellite_kinds: Vec<SatelliteKind>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, satellite_kinds: SatelliteKind::ALL.to_vec() }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`TreeError::Validation`] when the depth bound is outside `1..=1024` or no
    /// satellite collection is configured.
    pub fn validate(&self) -> Result<(), TreeError> {
        if !(1..=MAX_DEPTH_CEILING).contains(&self.max_depth) {
            return Err(TreeError::Validation(format!(
                "max_depth MUST be in [1, {MAX_DEPTH_CEILING}], got {}",
                self.max_depth
            )));
        }
        if self.satellite_kinds.is_empty() {
            return Err(TreeError::Validation(
                "satellite_kinds MUST name at least one collection".to_string(),
            ));
        }
        Ok(())
    }
}
