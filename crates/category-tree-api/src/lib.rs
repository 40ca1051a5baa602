use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use category_tree_core::{
    ancestor_chain, inherited_config, verify_hierarchy, ConsistencyReport, ContentId,
    ContentRecord, ContentStore, CreateNode, EngineConfig, Hierarchy, HierarchyKey,
    InheritedConfig, MoveNode, MutationCoordinator, MutationOutcome, RemoveNode, SatelliteKind,
    SatelliteRecord, SatelliteStore, TracingAuditSink, TreeError, TreeStore, UpdateConfig,
};
use category_tree_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddSatelliteRequest {
    pub key: HierarchyKey,
    pub kind: SatelliteKind,
    pub owner_content_id: ContentId,
    pub record_key: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveSatelliteRequest {
    pub key: HierarchyKey,
    pub kind: SatelliteKind,
    pub owner_content_id: ContentId,
    pub record_key: String,
}

/// Satellites visible on one content record: what it authored and what it inherited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SatelliteListing {
    pub content_id: ContentId,
    pub originating: Vec<SatelliteRecord>,
    pub inherited: Vec<SatelliteRecord>,
}

/// Contract-versioned facade over the coordinator and the SQLite store. Every call opens the
/// database, applies pending migrations, and runs as one request.
#[derive(Debug, Clone)]
pub struct CategoryTreeApi {
    db_path: PathBuf,
    config: EngineConfig,
}

impl CategoryTreeApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: EngineConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn mutate<T>(
        &self,
        operator: &str,
        run: impl FnOnce(&mut MutationCoordinator<'_, SqliteStore>) -> Result<T, TreeError>,
    ) -> Result<T> {
        self.config.validate()?;
        let mut store = self.open_migrated()?;
        tracing::debug!(db = %self.db_path.display(), operator, "opened store for mutation");
        let sink = TracingAuditSink;
        let mut coordinator =
            MutationCoordinator::new(&mut store, self.config.clone(), &sink, operator)?;
        Ok(run(&mut coordinator)?)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        tracing::debug!(planned = ?planned_versions, "migrate request completed");
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Create an empty hierarchy with its root placement.
    ///
    /// # Errors
    /// Returns an error when the hierarchy already exists or persistence fails.
    pub fn init_hierarchy(
        &self,
        key: &HierarchyKey,
        root_content_id: ContentId,
        operator: &str,
    ) -> Result<Hierarchy> {
        self.mutate(operator, |coordinator| coordinator.init_hierarchy(key, root_content_id))
    }

    /// # Errors
    /// Returns an error when the hierarchy does not exist.
    pub fn show_hierarchy(&self, key: &HierarchyKey) -> Result<Hierarchy> {
        let store = self.open_migrated()?;
        store.load_hierarchy(key)?.ok_or_else(|| anyhow!("hierarchy {key} does not exist"))
    }

    /// # Errors
    /// Returns an error when the `SQLite` database cannot be read.
    pub fn list_hierarchies(&self) -> Result<Vec<HierarchyKey>> {
        self.open_migrated()?.list_hierarchies()
    }

    /// # Errors
    /// Returns an error for invalid requests or persistence failures. Per-node cascade failures
    /// are reported inside the outcome.
    pub fn create_node(
        &self,
        key: &HierarchyKey,
        operator: &str,
        request: CreateNode,
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| coordinator.create_node(key, request))
    }

    /// # Errors
    /// Returns an error for invalid moves or persistence failures.
    pub fn move_node(
        &self,
        key: &HierarchyKey,
        operator: &str,
        request: MoveNode,
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| coordinator.move_node(key, request))
    }

    /// # Errors
    /// Returns an error when targeting the root placement or persistence fails.
    pub fn remove_node(
        &self,
        key: &HierarchyKey,
        operator: &str,
        request: RemoveNode,
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| coordinator.remove_node(key, request))
    }

    /// # Errors
    /// Returns an error when the configuration is not allowed on the record.
    pub fn update_config(
        &self,
        key: &HierarchyKey,
        operator: &str,
        request: UpdateConfig,
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| coordinator.update_config(key, request))
    }

    /// Rebuild caches and satellites for `content_ids`, plus the descendants of any node whose
    /// parent pointer had drifted from the tree.
    ///
    /// # Errors
    /// Returns an error when the hierarchy cannot be loaded.
    pub fn refresh(
        &self,
        key: &HierarchyKey,
        operator: &str,
        content_ids: &[ContentId],
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| coordinator.refresh(key, content_ids))
    }

    /// # Errors
    /// Returns an error for duplicate records or disabled satellite kinds.
    pub fn add_satellite(
        &self,
        operator: &str,
        request: AddSatelliteRequest,
    ) -> Result<MutationOutcome> {
        let record = SatelliteRecord::originating(
            request.key,
            request.kind,
            request.owner_content_id,
            request.record_key,
            request.payload,
        );
        self.mutate(operator, |coordinator| coordinator.add_originating_satellite(record))
    }

    /// # Errors
    /// Returns an error when persistence fails; unknown records are a no-op outcome.
    pub fn remove_satellite(
        &self,
        operator: &str,
        request: &RemoveSatelliteRequest,
    ) -> Result<MutationOutcome> {
        self.mutate(operator, |coordinator| {
            coordinator.remove_originating_satellite(
                &request.key,
                request.kind,
                &request.owner_content_id,
                &request.record_key,
            )
        })
    }

    /// # Errors
    /// Returns an error when the record is missing or removed.
    pub fn get_ancestor_chain(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Vec<ContentId>> {
        let store = self.open_migrated()?;
        Ok(ancestor_chain(&store, key, content_id)?)
    }

    /// # Errors
    /// Returns an error when the record is missing or removed.
    pub fn get_inherited_config(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Vec<InheritedConfig>> {
        let store = self.open_migrated()?;
        Ok(inherited_config(&store, key, content_id)?)
    }

    /// Full content record, removed ones included.
    ///
    /// # Errors
    /// Returns an error when no record exists.
    pub fn get_content(&self, key: &HierarchyKey, content_id: &ContentId) -> Result<ContentRecord> {
        let store = self.open_migrated()?;
        store
            .get_content(key, content_id)?
            .ok_or_else(|| anyhow!("content {content_id} does not exist in hierarchy {key}"))
    }

    /// # Errors
    /// Returns an error when the `SQLite` database cannot be read.
    pub fn list_satellites(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        content_id: &ContentId,
    ) -> Result<SatelliteListing> {
        let store = self.open_migrated()?;
        Ok(SatelliteListing {
            content_id: content_id.clone(),
            originating: store.find_originating(key, kind, content_id)?,
            inherited: store.find_inherited(key, kind, content_id)?,
        })
    }

    /// # Errors
    /// Returns an error when verification cannot read the store.
    pub fn verify(&self, key: &HierarchyKey) -> Result<ConsistencyReport> {
        let store = self.open_migrated()?;
        verify_hierarchy(&store, key, &self.config)
            .with_context(|| format!("failed to verify hierarchy {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("category-tree-api-{}.sqlite3", ulid::Ulid::new()))
    }

    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = CategoryTreeApi::new(db_path.clone(), EngineConfig::default());

        let plan = api.migrate(true)?;
        assert!(plan.dry_run);
        assert_eq!(plan.current_version, 0);
        assert_eq!(plan.would_apply_versions, vec![1, 2]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn invalid_engine_config_is_rejected_before_writing() {
        let db_path = unique_temp_db_path();
        let config = EngineConfig { max_depth: 0, ..EngineConfig::default() };
        let api = CategoryTreeApi::new(db_path.clone(), config);

        let key = HierarchyKey::new("acme", "main");
        let result = api.init_hierarchy(&key, "root".into(), "tester");
        assert!(result.is_err());
        assert!(!db_path.exists());
    }
}
