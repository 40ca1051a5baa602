use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{ContentId, ContentStore, HierarchyKey, TreeError};

/// Configuration one ancestor contributes to a descendant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InheritedConfig {
    pub source_id: ContentId,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRecord {
    pub key: HierarchyKey,
    pub content_id: ContentId,
    pub is_category: bool,
    pub parent_category_id: Option<ContentId>,
    pub local_config: Value,
    /// What a category hands down to its subtree. Falls back to `local_config` when unset.
    pub category_config: Option<Value>,
    #[serde(default)]
    pub ancestor_chain: Vec<ContentId>,
    #[serde(default)]
    pub inherited_config: Vec<InheritedConfig>,
    #[serde(default)]
    pub removed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContentRecord {
    /// Fresh record with empty inheritance caches.
    #[must_use]
    pub fn new(key: HierarchyKey, content_id: ContentId, is_category: bool) -> Self {
        Self {
            key,
            content_id,
            is_category,
            parent_category_id: None,
            local_config: Value::Object(serde_json::Map::new()),
            category_config: None,
            ancestor_chain: Vec::new(),
            inherited_config: Vec::new(),
            removed: false,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    /// Configuration this record hands to its descendants.
    #[must_use]
    pub fn contributed_config(&self) -> &Value {
        if self.is_category {
            if let Some(category_config) = &self.category_config {
                return category_config;
            }
        }
        &self.local_config
    }

    /// Drop the parent link and both inheritance caches. The record itself stays live.
    pub fn clear_inheritance(&mut self) {
        self.parent_category_id = None;
        self.ancestor_chain.clear();
        self.inherited_config.clear();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// # Errors
    /// Returns [`TreeError::Validation`] when identity fields are blank or the record names
    /// itself as its own parent.
    pub fn validate(&self) -> Result<(), TreeError> {
        self.key.validate()?;
        self.content_id.validate()?;
        if self.parent_category_id.as_ref() == Some(&self.content_id) {
            return Err(TreeError::Validation(format!(
                "content {} MUST NOT be its own parent category",
                self.content_id
            )));
        }
        if self.category_config.is_some() && !self.is_category {
            return Err(TreeError::Validation(format!(
                "category_config is only allowed on category records ({})",
                self.content_id
            )));
        }
        Ok(())
    }
}

fn live_record<S: ContentStore + ?Sized>(
    store: &S,
    key: &HierarchyKey,
    content_id: &ContentId,
) -> Result<ContentRecord, TreeError> {
    store
        .get_content(key, content_id)?
        .filter(|record| !record.removed)
        .ok_or_else(|| TreeError::NotFound(format!("content {content_id} in hierarchy {key}")))
}

/// Cached ancestor chain of a live record, root-most first.
///
/// # Errors
/// Returns [`TreeError::NotFound`] for missing or removed records.
pub fn ancestor_chain<S: ContentStore + ?Sized>(
    store: &S,
    key: &HierarchyKey,
    content_id: &ContentId,
) -> Result<Vec<ContentId>, TreeError> {
    Ok(live_record(store, key, content_id)?.ancestor_chain)
}

/// Cached inherited configuration snapshot of a live record, one entry per chain ancestor.
///
/// # Errors
/// Returns [`TreeError::NotFound`] for missing or removed records.
pub fn inherited_config<S: ContentStore + ?Sized>(
    store: &S,
    key: &HierarchyKey,
    content_id: &ContentId,
) -> Result<Vec<InheritedConfig>, TreeError> {
    Ok(live_record(store, key, content_id)?.inherited_config)
}
