//! Storage seams. The engine only ever talks to these traits; [`MemoryStore`] backs tests and
//! embedded use, the SQLite crate backs persistent deployments.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    ContentId, ContentRecord, Hierarchy, HierarchyKey, SatelliteKind, SatelliteRecord, TreeError,
};

pub trait TreeStore {
    /// # Errors
    /// Returns [`TreeError::Store`] when the document cannot be read or decoded.
    fn load_hierarchy(&self, key: &HierarchyKey) -> Result<Option<Hierarchy>, TreeError>;

    /// Persist `hierarchy` if the stored revision still equals `hierarchy.revision`, then bump
    /// the revision on both sides. Revision `0` means "create".
    ///
    /// # Errors
    /// Returns [`TreeError::Conflict`] when another writer saved the document first.
    fn save_hierarchy(&mut self, hierarchy: &mut Hierarchy) -> Result<(), TreeError>;
}

pub trait ContentStore {
    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn get_content(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Option<ContentRecord>, TreeError>;

    /// Insert or replace one record.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on write failures.
    fn put_content(&mut self, record: &ContentRecord) -> Result<(), TreeError>;

    /// # Errors
    /// Returns [`TreeError::Store`] on write failures.
    fn purge_content(&mut self, key: &HierarchyKey, content_id: &ContentId)
        -> Result<bool, TreeError>;

    /// Live (not removed) records whose `parent_category_id` is `parent`, ordered by id.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn list_children(
        &self,
        key: &HierarchyKey,
        parent: &ContentId,
    ) -> Result<Vec<ContentId>, TreeError>;

    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn list_content(&self, key: &HierarchyKey) -> Result<Vec<ContentRecord>, TreeError>;
}

/// Localization and function-link collections, addressed by [`SatelliteKind`].
pub trait SatelliteStore {
    /// Inherited copies materialized from `ancestor`.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn find_by_source_ancestor(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        ancestor: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError>;

    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn find_originating(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        content_id: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError>;

    /// Inherited (non-originating) records owned by `owner`.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on read failures.
    fn find_inherited(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError>;

    /// # Errors
    /// Returns [`TreeError::Validation`] for originating records or duplicates.
    fn create_copy(&mut self, record: &SatelliteRecord) -> Result<(), TreeError>;

    /// # Errors
    /// Returns [`TreeError::Validation`] for inherited records or duplicates.
    fn insert_originating(&mut self, record: &SatelliteRecord) -> Result<(), TreeError>;

    /// # Errors
    /// Returns [`TreeError::Store`] on write failures.
    fn delete_by_owner_and_source(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        source: &ContentId,
    ) -> Result<usize, TreeError>;

    /// Delete one record by its full identity.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on write failures.
    fn delete_record(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        record_key: &str,
        source: Option<&ContentId>,
    ) -> Result<bool, TreeError>;

    /// Every record of every kind owned by `owner`, originating ones included.
    ///
    /// # Errors
    /// Returns [`TreeError::Store`] on write failures.
    fn delete_owned(&mut self, key: &HierarchyKey, owner: &ContentId) -> Result<usize, TreeError>;
}

type SatelliteIdentity = (HierarchyKey, SatelliteKind, ContentId, String, Option<ContentId>);

fn identity(record: &SatelliteRecord) -> SatelliteIdentity {
    (
        record.key.clone(),
        record.kind,
        record.owner_content_id.clone(),
        record.record_key.clone(),
        record.source_ancestor_id.clone(),
    )
}

/// In-process arena of hierarchies, content records, and satellites keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    hierarchies: BTreeMap<HierarchyKey, Hierarchy>,
    content: BTreeMap<(HierarchyKey, ContentId), ContentRecord>,
    satellites: BTreeMap<SatelliteIdentity, SatelliteRecord>,
    failing_content: BTreeSet<ContentId>,
}

impl MemoryStore {
    /// Every satellite record in the store, in identity order.
    #[must_use]
    pub fn satellites(&self) -> Vec<&SatelliteRecord> {
        self.satellites.values().collect()
    }

    #[cfg(test)]
    pub(crate) fn fail_content_writes_for(&mut self, content_id: &ContentId) {
        self.failing_content.insert(content_id.clone());
    }

    #[cfg(test)]
    pub(crate) fn clear_injected_failures(&mut self) {
        self.failing_content.clear();
    }

    fn matching(
        &self,
        predicate: impl Fn(&SatelliteRecord) -> bool,
    ) -> Vec<SatelliteRecord> {
        self.satellites.values().filter(|record| predicate(record)).cloned().collect()
    }
}

impl TreeStore for MemoryStore {
    fn load_hierarchy(&self, key: &HierarchyKey) -> Result<Option<Hierarchy>, TreeError> {
        Ok(self.hierarchies.get(key).cloned())
    }

    fn save_hierarchy(&mut self, hierarchy: &mut Hierarchy) -> Result<(), TreeError> {
        let stored = self.hierarchies.get(&hierarchy.key).map_or(0, |current| current.revision);
        if stored != hierarchy.revision {
            return Err(TreeError::Conflict(format!(
                "hierarchy {} is at revision {stored}, write was based on {}",
                hierarchy.key, hierarchy.revision
            )));
        }
        hierarchy.revision += 1;
        self.hierarchies.insert(hierarchy.key.clone(), hierarchy.clone());
        Ok(())
    }
}

impl ContentStore for MemoryStore {
    fn get_content(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Option<ContentRecord>, TreeError> {
        Ok(self.content.get(&(key.clone(), content_id.clone())).cloned())
    }

    fn put_content(&mut self, record: &ContentRecord) -> Result<(), TreeError> {
        if self.failing_content.contains(&record.content_id) {
            return Err(TreeError::Store(format!(
                "injected write failure for {}",
                record.content_id
            )));
        }
        self.content.insert((record.key.clone(), record.content_id.clone()), record.clone());
        Ok(())
    }

    fn purge_content(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<bool, TreeError> {
        Ok(self.content.remove(&(key.clone(), content_id.clone())).is_some())
    }

    fn list_children(
        &self,
        key: &HierarchyKey,
        parent: &ContentId,
    ) -> Result<Vec<ContentId>, TreeError> {
        Ok(self
            .content
            .values()
            .filter(|record| {
                &record.key == key
                    && !record.removed
                    && record.parent_category_id.as_ref() == Some(parent)
            })
            .map(|record| record.content_id.clone())
            .collect())
    }

    fn list_content(&self, key: &HierarchyKey) -> Result<Vec<ContentRecord>, TreeError> {
        Ok(self.content.values().filter(|record| &record.key == key).cloned().collect())
    }
}

impl SatelliteStore for MemoryStore {
    fn find_by_source_ancestor(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        ancestor: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        Ok(self.matching(|record| {
            &record.key == key
                && record.kind == kind
                && record.source_ancestor_id.as_ref() == Some(ancestor)
        }))
    }

    fn find_originating(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        content_id: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        Ok(self.matching(|record| {
            &record.key == key
                && record.kind == kind
                && &record.owner_content_id == content_id
                && record.is_originating()
        }))
    }

    fn find_inherited(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        Ok(self.matching(|record| {
            &record.key == key
                && record.kind == kind
                && &record.owner_content_id == owner
                && !record.is_originating()
        }))
    }

    fn create_copy(&mut self, record: &SatelliteRecord) -> Result<(), TreeError> {
        record.validate()?;
        if record.is_originating() {
            return Err(TreeError::Validation(
                "create_copy requires a source_ancestor_id".to_string(),
            ));
        }
        insert_unique(&mut self.satellites, record)
    }

    fn insert_originating(&mut self, record: &SatelliteRecord) -> Result<(), TreeError> {
        record.validate()?;
        if !record.is_originating() {
            return Err(TreeError::Validation(
                "originating records MUST NOT carry a source_ancestor_id".to_string(),
            ));
        }
        insert_unique(&mut self.satellites, record)
    }

    fn delete_by_owner_and_source(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        source: &ContentId,
    ) -> Result<usize, TreeError> {
        let before = self.satellites.len();
        self.satellites.retain(|_, record| {
            !(&record.key == key
                && record.kind == kind
                && &record.owner_content_id == owner
                && record.source_ancestor_id.as_ref() == Some(source))
        });
        Ok(before - self.satellites.len())
    }

    fn delete_record(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        record_key: &str,
        source: Option<&ContentId>,
    ) -> Result<bool, TreeError> {
        let identity =
            (key.clone(), kind, owner.clone(), record_key.to_string(), source.cloned());
        Ok(self.satellites.remove(&identity).is_some())
    }

    fn delete_owned(&mut self, key: &HierarchyKey, owner: &ContentId) -> Result<usize, TreeError> {
        let before = self.satellites.len();
        self.satellites
            .retain(|_, record| !(&record.key == key && &record.owner_content_id == owner));
        Ok(before - self.satellites.len())
    }
}

fn insert_unique(
    satellites: &mut BTreeMap<SatelliteIdentity, SatelliteRecord>,
    record: &SatelliteRecord,
) -> Result<(), TreeError> {
    let identity = identity(record);
    if satellites.contains_key(&identity) {
        return Err(TreeError::Validation(format!(
            "satellite {} `{}` on {} already exists",
            record.kind.as_str(),
            record.record_key,
            record.owner_content_id
        )));
    }
    satellites.insert(identity, record.clone());
    Ok(())
}
