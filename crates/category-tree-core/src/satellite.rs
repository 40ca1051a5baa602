use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentId, HierarchyKey, SatelliteStore, TreeError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SatelliteKind {
    Localization,
    FunctionLink,
}

impl SatelliteKind {
    pub const ALL: [Self; 2] = [Self::Localization, Self::FunctionLink];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Localization => "localization",
            Self::FunctionLink => "function_link",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "localization" => Some(Self::Localization),
            "function_link" => Some(Self::FunctionLink),
            _ => None,
        }
    }
}

/// Auxiliary record tied to a content record's inheritance chain.
///
/// `source_ancestor_id = None` marks an originating record authored on `owner_content_id`;
/// `Some(ancestor)` marks a copy that exists only while `ancestor` is in the owner's chain.
/// `record_key` distinguishes several records of one kind on the same owner (a translation key,
/// a linked function name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SatelliteRecord {
    pub key: HierarchyKey,
    pub kind: SatelliteKind,
    pub owner_content_id: ContentId,
    pub record_key: String,
    pub source_ancestor_id: Option<ContentId>,
    pub payload: Value,
}

impl SatelliteRecord {
    #[must_use]
    pub fn originating(
        key: HierarchyKey,
        kind: SatelliteKind,
        owner_content_id: ContentId,
        record_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            key,
            kind,
            owner_content_id,
            record_key: record_key.into(),
            source_ancestor_id: None,
            payload,
        }
    }

    #[must_use]
    pub fn is_originating(&self) -> bool {
        self.source_ancestor_id.is_none()
    }

    /// Inherited copy of this originating record for `owner`.
    #[must_use]
    pub fn copy_for(&self, owner: &ContentId) -> Self {
        Self {
            key: self.key.clone(),
            kind: self.kind,
            owner_content_id: owner.clone(),
            record_key: self.record_key.clone(),
            source_ancestor_id: Some(self.owner_content_id.clone()),
            payload: self.payload.clone(),
        }
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when identity fields are blank or a copy names its own
    /// owner as source.
    pub fn validate(&self) -> Result<(), TreeError> {
        self.key.validate()?;
        self.owner_content_id.validate()?;
        if self.record_key.trim().is_empty() {
            return Err(TreeError::Validation("record_key MUST be non-empty".to_string()));
        }
        if self.source_ancestor_id.as_ref() == Some(&self.owner_content_id) {
            return Err(TreeError::Validation(format!(
                "satellite copy on {} MUST NOT inherit from itself",
                self.owner_content_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PropagationReport {
    pub created: usize,
    pub deleted: usize,
}

impl PropagationReport {
    #[must_use]
    pub fn writes(&self) -> usize {
        self.created + self.deleted
    }

    pub fn absorb(&mut self, other: Self) {
        self.created += other.created;
        self.deleted += other.deleted;
    }
}

/// Reconcile the inherited satellite copies owned by `content_id` with `ancestor_chain`.
///
/// Exit: every copy whose source left the chain is deleted. Join: every originating record of
/// every chain ancestor that the owner lacks a copy of is materialized. Running this twice
/// against the same chain performs no writes the second time.
///
/// # Errors
/// Returns the first satellite store failure; earlier writes of this pass stay applied.
pub fn propagate_satellites<S: SatelliteStore + ?Sized>(
    store: &mut S,
    key: &HierarchyKey,
    kinds: &[SatelliteKind],
    content_id: &ContentId,
    ancestor_chain: &[ContentId],
) -> Result<PropagationReport, TreeError> {
    let chain: BTreeSet<&ContentId> = ancestor_chain.iter().collect();
    let mut report = PropagationReport::default();

    for &kind in kinds {
        let inherited = store.find_inherited(key, kind, content_id)?;

        let exited: BTreeSet<ContentId> = inherited
            .iter()
            .filter_map(|record| record.source_ancestor_id.clone())
            .filter(|source| !chain.contains(source))
            .collect();
        for source in &exited {
            let deleted = store.delete_by_owner_and_source(key, kind, content_id, source)?;
            tracing::debug!(
                owner_id = %key.owner_id,
                branch = %key.branch,
                content_id = %content_id,
                source = %source,
                kind = kind.as_str(),
                deleted,
                "satellite copies exited"
            );
            report.deleted += deleted;
        }

        let present: BTreeSet<(ContentId, String)> = inherited
            .into_iter()
            .filter_map(|record| {
                let source = record.source_ancestor_id?;
                (!exited.contains(&source)).then_some((source, record.record_key))
            })
            .collect();

        for ancestor in ancestor_chain {
            for origin in store.find_originating(key, kind, ancestor)? {
                if present.contains(&(ancestor.clone(), origin.record_key.clone())) {
                    continue;
                }
                store.create_copy(&origin.copy_for(content_id))?;
                tracing::debug!(
                    owner_id = %key.owner_id,
                    branch = %key.branch,
                    content_id = %content_id,
                    source = %ancestor,
                    kind = kind.as_str(),
                    record_key = %origin.record_key,
                    "satellite copy joined"
                );
                report.created += 1;
            }
        }
    }

    Ok(report)
}
