use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{ContentId, ContentStore, HierarchyKey, InheritedConfig, TreeError};

/// Something the resolver tolerated instead of failing on.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionAnomaly {
    /// `content_id` points at a parent that is missing or soft-removed; the chain stops there.
    DanglingParent { content_id: ContentId, missing: ContentId },
    /// A chain entry vanished between the walk and the snapshot read; it contributes nothing.
    DanglingAncestor { content_id: ContentId, missing: ContentId },
}

impl ResolutionAnomaly {
    #[must_use]
    pub fn as_error(&self) -> TreeError {
        match self {
            Self::DanglingParent { content_id, missing }
            | Self::DanglingAncestor { content_id, missing } => TreeError::DanglingReference {
                content_id: content_id.clone(),
                missing: missing.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainResolution {
    /// Root-most ancestor first, immediate parent last.
    pub chain: Vec<ContentId>,
    pub anomalies: Vec<ResolutionAnomaly>,
}

/// Walk `parent_category_id` links from `content_id` up to the root.
///
/// Missing or removed parents end the chain and are reported as anomalies. A walk that revisits
/// a record or takes more than `max_depth` steps is a parent-pointer loop.
///
/// # Errors
/// Returns [`TreeError::NotFound`] when `content_id` itself has no record,
/// [`TreeError::CycleDetected`] for loops, and store errors unchanged.
pub fn resolve_ancestor_chain<S: ContentStore + ?Sized>(
    store: &S,
    key: &HierarchyKey,
    content_id: &ContentId,
    max_depth: usize,
) -> Result<ChainResolution, TreeError> {
    let record = store
        .get_content(key, content_id)?
        .ok_or_else(|| TreeError::NotFound(format!("content {content_id} in hierarchy {key}")))?;

    let mut resolution = ChainResolution::default();
    let mut visited = BTreeSet::from([content_id.clone()]);
    let mut child = content_id.clone();
    let mut next = record.parent_category_id;

    while let Some(parent_id) = next.take() {
        if resolution.chain.len() >= max_depth || !visited.insert(parent_id.clone()) {
            tracing::error!(
                owner_id = %key.owner_id,
                branch = %key.branch,
                content_id = %content_id,
                max_depth,
                "ancestor walk did not terminate"
            );
            return Err(TreeError::CycleDetected { content_id: content_id.clone(), max_depth });
        }

        match store.get_content(key, &parent_id)? {
            Some(parent) if !parent.removed => {
                next = parent.parent_category_id;
                resolution.chain.push(parent_id.clone());
                child = parent_id;
            }
            _ => {
                tracing::warn!(
                    owner_id = %key.owner_id,
                    branch = %key.branch,
                    content_id = %child,
                    missing = %parent_id,
                    "dangling parent reference; chain truncated"
                );
                resolution.anomalies.push(ResolutionAnomaly::DanglingParent {
                    content_id: child.clone(),
                    missing: parent_id,
                });
            }
        }
    }

    resolution.chain.reverse();
    Ok(resolution)
}

/// Read every chain ancestor's current contributed configuration. Always a full rebuild: the
/// result replaces whatever snapshot the record held before.
///
/// # Errors
/// Returns store errors unchanged.
pub fn resolve_inherited_config_snapshot<S: ContentStore + ?Sized>(
    store: &S,
    key: &HierarchyKey,
    content_id: &ContentId,
    ancestor_chain: &[ContentId],
) -> Result<(Vec<InheritedConfig>, Vec<ResolutionAnomaly>), TreeError> {
    let mut snapshot = Vec::with_capacity(ancestor_chain.len());
    let mut anomalies = Vec::new();

    for ancestor_id in ancestor_chain {
        match store.get_content(key, ancestor_id)? {
            Some(ancestor) if !ancestor.removed => snapshot.push(InheritedConfig {
                source_id: ancestor_id.clone(),
                config: ancestor.contributed_config().clone(),
            }),
            _ => {
                tracing::warn!(
                    owner_id = %key.owner_id,
                    branch = %key.branch,
                    content_id = %content_id,
                    missing = %ancestor_id,
                    "ancestor vanished before its configuration was read"
                );
                anomalies.push(ResolutionAnomaly::DanglingAncestor {
                    content_id: content_id.clone(),
                    missing: ancestor_id.clone(),
                });
            }
        }
    }

    Ok((snapshot, anomalies))
}
