//! Hierarchical configuration inheritance for the entity/category tree.
//!
//! A hierarchy is one ordered tree of [`Placement`]s per [`HierarchyKey`]. Every placement points
//! at a [`ContentRecord`] that caches its ancestor chain and the configuration contributed by each
//! ancestor. The [`MutationCoordinator`] keeps those caches, and the [`SatelliteRecord`]s tied to
//! them, consistent whenever the tree is mutated.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod audit;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod placement;
pub mod resolver;
pub mod satellite;
pub mod store;
pub mod verify;

pub use audit::{AuditEntry, AuditSink, MutationKind, TracingAuditSink};
pub use config::{EngineConfig, DEFAULT_MAX_DEPTH};
pub use content::{ancestor_chain, inherited_config, ContentRecord, InheritedConfig};
pub use coordinator::{
    CreateNode, MoveNode, MutationCoordinator, MutationOutcome, MutationPhase, MutationStatus,
    NodeFailure, RemoveNode, RemoveTarget, UpdateConfig,
};
pub use placement::{Descendants, Hierarchy, Placement};
pub use resolver::{
    resolve_ancestor_chain, resolve_inherited_config_snapshot, ChainResolution, ResolutionAnomaly,
};
pub use satellite::{propagate_satellites, PropagationReport, SatelliteKind, SatelliteRecord};
pub use store::{ContentStore, MemoryStore, SatelliteStore, TreeStore};
pub use verify::{verify_hierarchy, ConsistencyReport, ConsistencyViolation};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TreeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("dangling reference from {content_id} to missing record {missing}")]
    DanglingReference { content_id: ContentId, missing: ContentId },
    #[error("cycle detected resolving {content_id}: ancestor walk exceeded {max_depth} steps")]
    CycleDetected { content_id: ContentId, max_depth: usize },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(String),
}

impl TreeError {
    /// `NotFound` turns the affected operation into a no-op instead of a failure.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Identity of one hierarchy document: every placement, content record, and satellite record
/// lives inside exactly one (owner, branch) scope.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HierarchyKey {
    pub owner_id: String,
    pub branch: String,
}

impl HierarchyKey {
    #[must_use]
    pub fn new(owner_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self { owner_id: owner_id.into(), branch: branch.into() }
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when owner or branch is blank.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.owner_id.trim().is_empty() {
            return Err(TreeError::Validation("owner_id MUST be provided".to_string()));
        }
        if self.branch.trim().is_empty() {
            return Err(TreeError::Validation("branch MUST be provided".to_string()));
        }
        Ok(())
    }
}

impl Display for HierarchyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.branch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContentId(pub String);

impl ContentId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] for blank identifiers.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.0.trim().is_empty() {
            return Err(TreeError::Validation("content_id MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PlacementId(pub Ulid);

impl PlacementId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PlacementId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PlacementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlacementId {
    type Err = TreeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| TreeError::Validation(format!("invalid placement id {raw}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_id_parses_its_display_form() {
        let id = PlacementId::new();
        let parsed = match id.to_string().parse::<PlacementId>() {
            Ok(parsed) => parsed,
            Err(err) => panic!("placement id should parse: {err}"),
        };
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_placement_id_is_a_validation_error() {
        let err = match "not-a-ulid".parse::<PlacementId>() {
            Ok(id) => panic!("expected parse failure, got {id}"),
            Err(err) => err,
        };
        assert!(matches!(err, TreeError::Validation(_)));
    }

    #[test]
    fn blank_scope_fields_are_rejected() {
        assert!(HierarchyKey::new(" ", "main").validate().is_err());
        assert!(HierarchyKey::new("acme", "").validate().is_err());
        assert!(HierarchyKey::new("acme", "main").validate().is_ok());
    }

    #[test]
    fn only_not_found_is_benign() {
        assert!(TreeError::NotFound("placement".to_string()).is_benign());
        assert!(!TreeError::Validation("bad".to_string()).is_benign());
        assert!(!TreeError::CycleDetected { content_id: "a".into(), max_depth: 64 }.is_benign());
    }
}
