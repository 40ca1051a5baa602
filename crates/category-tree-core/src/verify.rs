use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    resolve_ancestor_chain, resolve_inherited_config_snapshot, ContentId, ContentRecord,
    ContentStore, EngineConfig, HierarchyKey, InheritedConfig, Placement, SatelliteKind,
    SatelliteStore, TreeError, TreeStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyViolation {
    ChainMismatch { content_id: ContentId, cached: Vec<ContentId>, expected: Vec<ContentId> },
    Unresolvable { content_id: ContentId, error: TreeError },
    SnapshotMismatch {
        content_id: ContentId,
        cached: Vec<InheritedConfig>,
        expected: Vec<InheritedConfig>,
    },
    /// An inherited satellite copy whose source is not in the owner's chain.
    StrayCopy {
        content_id: ContentId,
        satellite_kind: SatelliteKind,
        source: ContentId,
        record_key: String,
    },
    MissingCopy {
        content_id: ContentId,
        satellite_kind: SatelliteKind,
        source: ContentId,
        record_key: String,
    },
    /// A removed record still carries chain or snapshot entries.
    RetainedInheritance { content_id: ContentId },
    ParentMismatch {
        content_id: ContentId,
        placement_parent: Option<ContentId>,
        record_parent: Option<ContentId>,
    },
    UnbackedPlacement { content_id: ContentId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyReport {
    pub key: HierarchyKey,
    pub checked: usize,
    pub violations: Vec<ConsistencyViolation>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Recompute every cache in `key` from scratch and list where stored state disagrees.
///
/// Read-only. Live records are checked against a fresh ancestor walk, a fresh snapshot, and the
/// satellite copies their chain implies; removed records must hold no inheritance at all; every
/// non-root placement must be backed by a live record whose parent pointer matches the tree.
///
/// # Errors
/// Returns store errors unchanged.
pub fn verify_hierarchy<S>(
    store: &S,
    key: &HierarchyKey,
    config: &EngineConfig,
) -> Result<ConsistencyReport, TreeError>
where
    S: TreeStore + ContentStore + SatelliteStore + ?Sized,
{
    key.validate()?;
    let records = store.list_content(key)?;
    let mut report =
        ConsistencyReport { key: key.clone(), checked: records.len(), violations: Vec::new() };

    for record in &records {
        if record.removed {
            check_removed(store, key, &config.satellite_kinds, record, &mut report.violations)?;
        } else {
            check_live(store, key, config, record, &mut report.violations)?;
        }
    }

    if let Some(hierarchy) = store.load_hierarchy(key)? {
        let live: BTreeMap<&ContentId, &ContentRecord> = records
            .iter()
            .filter(|record| !record.removed)
            .map(|record| (&record.content_id, record))
            .collect();
        let mut stack: Vec<(&Placement, Option<&ContentId>)> =
            hierarchy.root.children.iter().rev().map(|child| (child, None)).collect();
        while let Some((placement, parent)) = stack.pop() {
            check_placement(&live, placement, parent, &mut report.violations);
            stack.extend(
                placement.children.iter().rev().map(|child| (child, Some(&placement.content_id))),
            );
        }
    }

    if !report.is_consistent() {
        tracing::warn!(
            owner_id = %key.owner_id,
            branch = %key.branch,
            violations = report.violations.len(),
            "hierarchy caches are inconsistent"
        );
    }
    Ok(report)
}

fn check_live<S>(
    store: &S,
    key: &HierarchyKey,
    config: &EngineConfig,
    record: &ContentRecord,
    violations: &mut Vec<ConsistencyViolation>,
) -> Result<(), TreeError>
where
    S: ContentStore + SatelliteStore + ?Sized,
{
    let content_id = &record.content_id;
    let expected = match resolve_ancestor_chain(store, key, content_id, config.max_depth) {
        Ok(resolution) => resolution.chain,
        Err(TreeError::Store(detail)) => return Err(TreeError::Store(detail)),
        Err(error) => {
            violations
                .push(ConsistencyViolation::Unresolvable { content_id: content_id.clone(), error });
            return Ok(());
        }
    };
    if record.ancestor_chain != expected {
        violations.push(ConsistencyViolation::ChainMismatch {
            content_id: content_id.clone(),
            cached: record.ancestor_chain.clone(),
            expected: expected.clone(),
        });
    }

    let (snapshot, _) = resolve_inherited_config_snapshot(store, key, content_id, &expected)?;
    if record.inherited_config != snapshot {
        violations.push(ConsistencyViolation::SnapshotMismatch {
            content_id: content_id.clone(),
            cached: record.inherited_config.clone(),
            expected: snapshot,
        });
    }

    let chain: BTreeSet<&ContentId> = expected.iter().collect();
    for &kind in &config.satellite_kinds {
        let mut present = BTreeSet::new();
        for copy in store.find_inherited(key, kind, content_id)? {
            let Some(source) = copy.source_ancestor_id else {
                continue;
            };
            if chain.contains(&source) {
                present.insert((source, copy.record_key));
            } else {
                violations.push(ConsistencyViolation::StrayCopy {
                    content_id: content_id.clone(),
                    satellite_kind: kind,
                    source,
                    record_key: copy.record_key,
                });
            }
        }
        for ancestor in &expected {
            for origin in store.find_originating(key, kind, ancestor)? {
                if !present.contains(&(ancestor.clone(), origin.record_key.clone())) {
                    violations.push(ConsistencyViolation::MissingCopy {
                        content_id: content_id.clone(),
                        satellite_kind: kind,
                        source: ancestor.clone(),
                        record_key: origin.record_key,
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_removed<S>(
    store: &S,
    key: &HierarchyKey,
    kinds: &[SatelliteKind],
    record: &ContentRecord,
    violations: &mut Vec<ConsistencyViolation>,
) -> Result<(), TreeError>
where
    S: SatelliteStore + ?Sized,
{
    if !record.ancestor_chain.is_empty() || !record.inherited_config.is_empty() {
        violations
            .push(ConsistencyViolation::RetainedInheritance {
                content_id: record.content_id.clone(),
            });
    }
    for &kind in kinds {
        for copy in store.find_inherited(key, kind, &record.content_id)? {
            let Some(source) = copy.source_ancestor_id else {
                continue;
            };
            violations.push(ConsistencyViolation::StrayCopy {
                content_id: record.content_id.clone(),
                satellite_kind: kind,
                source,
                record_key: copy.record_key,
            });
        }
    }
    Ok(())
}

fn check_placement(
    live: &BTreeMap<&ContentId, &ContentRecord>,
    placement: &Placement,
    parent: Option<&ContentId>,
    violations: &mut Vec<ConsistencyViolation>,
) {
    let Some(record) = live.get(&placement.content_id) else {
        violations
            .push(ConsistencyViolation::UnbackedPlacement {
                content_id: placement.content_id.clone(),
            });
        return;
    };
    if record.parent_category_id.as_ref() != parent {
        violations.push(ConsistencyViolation::ParentMismatch {
            content_id: placement.content_id.clone(),
            placement_parent: parent.cloned(),
            record_parent: record.parent_category_id.clone(),
        });
    }
}
