use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ContentId, HierarchyKey};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Move,
    Remove,
    UpdateConfig,
    Refresh,
    AddSatellite,
    RemoveSatellite,
}

impl MutationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Move => "move",
            Self::Remove => "remove",
            Self::UpdateConfig => "update_config",
            Self::Refresh => "refresh",
            Self::AddSatellite => "add_satellite",
            Self::RemoveSatellite => "remove_satellite",
        }
    }
}

/// One audit line per applied mutation. Refreshes only rebuild caches and are not audited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub operator: String,
    pub mutation: MutationKind,
    pub key: HierarchyKey,
    pub content_id: ContentId,
}

/// Fire-and-forget audit trail. A failing sink is logged by the caller and never fails the
/// mutation it describes.
pub trait AuditSink {
    /// # Errors
    /// Returns a description of why the entry could not be recorded.
    fn record(&self, entry: &AuditEntry) -> Result<(), String>;
}

/// Emits audit entries as `tracing` events on the `category_tree::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), String> {
        tracing::info!(
            target: "category_tree::audit",
            operator = %entry.operator,
            mutation = entry.mutation.as_str(),
            owner_id = %entry.key.owner_id,
            branch = %entry.key.branch,
            content_id = %entry.content_id,
            "hierarchy mutated"
        );
        Ok(())
    }
}
