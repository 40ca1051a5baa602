use std::path::Path;

use anyhow::{anyhow, Context, Result};
use category_tree_core::{
    ContentId, ContentRecord, ContentStore, Hierarchy, HierarchyKey, Placement, SatelliteKind,
    SatelliteRecord, SatelliteStore, TreeError, TreeStore,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tree_documents (
  owner_id TEXT NOT NULL,
  branch TEXT NOT NULL,
  revision INTEGER NOT NULL CHECK (revision >= 1),
  document_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (owner_id, branch)
);

CREATE TABLE IF NOT EXISTS content_records (
  owner_id TEXT NOT NULL,
  branch TEXT NOT NULL,
  content_id TEXT NOT NULL,
  is_category INTEGER NOT NULL CHECK (is_category IN (0, 1)),
  parent_category_id TEXT,
  local_config_json TEXT NOT NULL,
  category_config_json TEXT,
  ancestor_chain_json TEXT NOT NULL,
  inherited_config_json TEXT NOT NULL,
  removed INTEGER NOT NULL CHECK (removed IN (0, 1)),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (owner_id, branch, content_id),
  CHECK (parent_category_id IS NULL OR parent_category_id <> content_id)
);

CREATE TABLE IF NOT EXISTS satellite_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_id TEXT NOT NULL,
  branch TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('localization','function_link')),
  owner_content_id TEXT NOT NULL,
  record_key TEXT NOT NULL CHECK (length(record_key) > 0),
  source_ancestor_id TEXT NOT NULL DEFAULT '',
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (owner_id, branch, kind, owner_content_id, record_key, source_ancestor_id),
  FOREIGN KEY (owner_id, branch, owner_content_id)
    REFERENCES content_records(owner_id, branch, content_id)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_content_records_parent
  ON content_records(owner_id, branch, parent_category_id);
CREATE INDEX IF NOT EXISTS idx_satellite_records_source
  ON satellite_records(owner_id, branch, kind, source_ancestor_id);
CREATE INDEX IF NOT EXISTS idx_satellite_records_owner
  ON satellite_records(owner_id, branch, owner_content_id);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

/// `source_ancestor_id` column value for originating records. The column is `NOT NULL` so the
/// identity `UNIQUE` constraint also covers originating records.
const ORIGINATING_SOURCE: &str = "";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed hierarchy store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in MIGRATIONS {
            if target <= version {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            tracing::info!(version = target, "applied schema migration");
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Every hierarchy key with a stored tree document.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_hierarchies(&self) -> Result<Vec<HierarchyKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT owner_id, branch FROM tree_documents ORDER BY owner_id, branch")?;
        let rows = stmt.query_map([], |row| {
            Ok(HierarchyKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn read_document(&self, key: &HierarchyKey) -> Result<Option<Hierarchy>> {
        let row = self
            .conn
            .query_row(
                "SELECT revision, document_json FROM tree_documents
                 WHERE owner_id = ?1 AND branch = ?2",
                params![key.owner_id, key.branch],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read tree document {key}"))?;

        let Some((revision, document_json)) = row else {
            return Ok(None);
        };
        let root: Placement = serde_json::from_str(&document_json)
            .with_context(|| format!("failed to decode tree document {key}"))?;
        let revision = u64::try_from(revision)
            .with_context(|| format!("negative revision {revision} for tree document {key}"))?;
        Ok(Some(Hierarchy { key: key.clone(), revision, root }))
    }

    /// Returns whether the row was written; `false` means the stored revision moved on.
    fn write_document(&mut self, hierarchy: &Hierarchy, next_revision: u64) -> Result<bool> {
        let document_json =
            serde_json::to_string(&hierarchy.root).context("failed to encode tree document")?;
        let expected = i64::try_from(hierarchy.revision).context("revision out of range")?;
        let next = i64::try_from(next_revision).context("revision out of range")?;
        let now = now_rfc3339()?;

        let changed = if hierarchy.revision == 0 {
            self.conn
                .execute(
                    "INSERT INTO tree_documents(owner_id, branch, revision, document_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(owner_id, branch) DO NOTHING",
                    params![hierarchy.key.owner_id, hierarchy.key.branch, next, document_json, now],
                )
                .context("failed to insert tree document")?
        } else {
            self.conn
                .execute(
                    "UPDATE tree_documents
                     SET revision = ?3, document_json = ?4, updated_at = ?5
                     WHERE owner_id = ?1 AND branch = ?2 AND revision = ?6",
                    params![
                        hierarchy.key.owner_id,
                        hierarchy.key.branch,
                        next,
                        document_json,
                        now,
                        expected
                    ],
                )
                .context("failed to update tree document")?
        };
        Ok(changed == 1)
    }

    fn read_content(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Option<ContentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_records
             WHERE owner_id = ?1 AND branch = ?2 AND content_id = ?3"
        ))?;
        let mut rows = stmt.query(params![key.owner_id, key.branch, content_id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(content_from_row(key, row)?)),
            None => Ok(None),
        }
    }

    fn write_content(&mut self, record: &ContentRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO content_records(
                    owner_id, branch, content_id, is_category, parent_category_id,
                    local_config_json, category_config_json, ancestor_chain_json,
                    inherited_config_json, removed, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(owner_id, branch, content_id) DO UPDATE SET
                    is_category = excluded.is_category,
                    parent_category_id = excluded.parent_category_id,
                    local_config_json = excluded.local_config_json,
                    category_config_json = excluded.category_config_json,
                    ancestor_chain_json = excluded.ancestor_chain_json,
                    inherited_config_json = excluded.inherited_config_json,
                    removed = excluded.removed,
                    updated_at = excluded.updated_at",
                params![
                    record.key.owner_id,
                    record.key.branch,
                    record.content_id.as_str(),
                    record.is_category,
                    record.parent_category_id.as_ref().map(ContentId::as_str),
                    serde_json::to_string(&record.local_config)
                        .context("failed to encode local config")?,
                    record
                        .category_config
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()
                        .context("failed to encode category config")?,
                    serde_json::to_string(&record.ancestor_chain)
                        .context("failed to encode ancestor chain")?,
                    serde_json::to_string(&record.inherited_config)
                        .context("failed to encode inherited config")?,
                    record.removed,
                    rfc3339(record.updated_at)?,
                ],
            )
            .with_context(|| format!("failed to write content record {}", record.content_id))?;
        Ok(())
    }

    fn query_content(
        &self,
        sql_filter: &str,
        key: &HierarchyKey,
        extra: Option<&str>,
    ) -> Result<Vec<ContentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONTENT_COLUMNS} FROM content_records
             WHERE owner_id = ?1 AND branch = ?2 {sql_filter}
             ORDER BY content_id ASC"
        ))?;
        let mut rows = match extra {
            Some(value) => stmt.query(params![key.owner_id, key.branch, value])?,
            None => stmt.query(params![key.owner_id, key.branch])?,
        };
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(content_from_row(key, row)?);
        }
        Ok(records)
    }

    fn query_satellites(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        sql_filter: &str,
        value: &str,
    ) -> Result<Vec<SatelliteRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT owner_content_id, record_key, source_ancestor_id, payload_json
             FROM satellite_records
             WHERE owner_id = ?1 AND branch = ?2 AND kind = ?3 AND {sql_filter}
             ORDER BY owner_content_id ASC, record_key ASC, source_ancestor_id ASC"
        ))?;
        let mut rows = stmt.query(params![key.owner_id, key.branch, kind.as_str(), value])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let source: String = row.get(2)?;
            let payload_json: String = row.get(3)?;
            records.push(SatelliteRecord {
                key: key.clone(),
                kind,
                owner_content_id: ContentId::new(row.get::<_, String>(0)?),
                record_key: row.get(1)?,
                source_ancestor_id: (source != ORIGINATING_SOURCE).then(|| ContentId::new(source)),
                payload: serde_json::from_str(&payload_json)
                    .context("failed to decode satellite payload")?,
            });
        }
        Ok(records)
    }

    fn satellite_exists(&self, record: &SatelliteRecord) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM satellite_records
                    WHERE owner_id = ?1 AND branch = ?2 AND kind = ?3
                      AND owner_content_id = ?4 AND record_key = ?5 AND source_ancestor_id = ?6
                )",
                params![
                    record.key.owner_id,
                    record.key.branch,
                    record.kind.as_str(),
                    record.owner_content_id.as_str(),
                    record.record_key,
                    source_column(record.source_ancestor_id.as_ref()),
                ],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to check satellite identity")?;
        Ok(exists == 1)
    }

    fn insert_satellite(&mut self, record: &SatelliteRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO satellite_records(
                    owner_id, branch, kind, owner_content_id, record_key,
                    source_ancestor_id, payload_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.key.owner_id,
                    record.key.branch,
                    record.kind.as_str(),
                    record.owner_content_id.as_str(),
                    record.record_key,
                    source_column(record.source_ancestor_id.as_ref()),
                    serde_json::to_string(&record.payload)
                        .context("failed to encode satellite payload")?,
                    now_rfc3339()?,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert {} `{}` on {}",
                    record.kind.as_str(),
                    record.record_key,
                    record.owner_content_id
                )
            })?;
        Ok(())
    }

    fn create_satellite(&mut self, record: &SatelliteRecord) -> Result<(), TreeError> {
        record.validate()?;
        if self.satellite_exists(record).map_err(store_error)? {
            return Err(TreeError::Validation(format!(
                "satellite {} `{}` on {} already exists",
                record.kind.as_str(),
                record.record_key,
                record.owner_content_id
            )));
        }
        self.insert_satellite(record).map_err(store_error)
    }
}

const CONTENT_COLUMNS: &str = "content_id, is_category, parent_category_id, local_config_json,
    category_config_json, ancestor_chain_json, inherited_config_json, removed, updated_at";

fn content_from_row(key: &HierarchyKey, row: &Row<'_>) -> Result<ContentRecord> {
    let content_id: String = row.get(0)?;
    let local_config_json: String = row.get(3)?;
    let category_config_json: Option<String> = row.get(4)?;
    let ancestor_chain_json: String = row.get(5)?;
    let inherited_config_json: String = row.get(6)?;

    Ok(ContentRecord {
        key: key.clone(),
        is_category: row.get(1)?,
        parent_category_id: row.get::<_, Option<String>>(2)?.map(ContentId::new),
        local_config: serde_json::from_str(&local_config_json)
            .with_context(|| format!("failed to decode local config of {content_id}"))?,
        category_config: category_config_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("failed to decode category config of {content_id}"))?,
        ancestor_chain: serde_json::from_str(&ancestor_chain_json)
            .with_context(|| format!("failed to decode ancestor chain of {content_id}"))?,
        inherited_config: serde_json::from_str(&inherited_config_json)
            .with_context(|| format!("failed to decode inherited config of {content_id}"))?,
        removed: row.get(7)?,
        updated_at: parse_rfc3339(&row.get::<_, String>(8)?)?,
        content_id: ContentId::new(content_id),
    })
}

fn source_column(source: Option<&ContentId>) -> &str {
    source.map_or(ORIGINATING_SOURCE, ContentId::as_str)
}

fn store_error(err: anyhow::Error) -> TreeError {
    TreeError::Store(format!("{err:#}"))
}

impl TreeStore for SqliteStore {
    fn load_hierarchy(&self, key: &HierarchyKey) -> Result<Option<Hierarchy>, TreeError> {
        self.read_document(key).map_err(store_error)
    }

    fn save_hierarchy(&mut self, hierarchy: &mut Hierarchy) -> Result<(), TreeError> {
        let next_revision = hierarchy.revision + 1;
        if !self.write_document(hierarchy, next_revision).map_err(store_error)? {
            return Err(TreeError::Conflict(format!(
                "hierarchy {} changed since revision {}",
                hierarchy.key, hierarchy.revision
            )));
        }
        hierarchy.revision = next_revision;
        Ok(())
    }
}

impl ContentStore for SqliteStore {
    fn get_content(
        &self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<Option<ContentRecord>, TreeError> {
        self.read_content(key, content_id).map_err(store_error)
    }

    fn put_content(&mut self, record: &ContentRecord) -> Result<(), TreeError> {
        self.write_content(record).map_err(store_error)
    }

    fn purge_content(
        &mut self,
        key: &HierarchyKey,
        content_id: &ContentId,
    ) -> Result<bool, TreeError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM content_records WHERE owner_id = ?1 AND branch = ?2 AND content_id = ?3",
                params![key.owner_id, key.branch, content_id.as_str()],
            )
            .with_context(|| format!("failed to purge content record {content_id}"))
            .map_err(store_error)?;
        Ok(deleted > 0)
    }

    fn list_children(
        &self,
        key: &HierarchyKey,
        parent: &ContentId,
    ) -> Result<Vec<ContentId>, TreeError> {
        let records = self
            .query_content("AND parent_category_id = ?3 AND removed = 0", key, Some(parent.as_str()))
            .map_err(store_error)?;
        Ok(records.into_iter().map(|record| record.content_id).collect())
    }

    fn list_content(&self, key: &HierarchyKey) -> Result<Vec<ContentRecord>, TreeError> {
        self.query_content("", key, None).map_err(store_error)
    }
}

impl SatelliteStore for SqliteStore {
    fn find_by_source_ancestor(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        ancestor: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        self.query_satellites(key, kind, "source_ancestor_id = ?4", ancestor.as_str())
            .map_err(store_error)
    }

    fn find_originating(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        content_id: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        self.query_satellites(
            key,
            kind,
            "owner_content_id = ?4 AND source_ancestor_id = ''",
            content_id.as_str(),
        )
        .map_err(store_error)
    }

    fn find_inherited(
        &self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
    ) -> Result<Vec<SatelliteRecord>, TreeError> {
        self.query_satellites(
            key,
            kind,
            "owner_content_id = ?4 AND source_ancestor_id <> ''",
            owner.as_str(),
        )
        .map_err(store_error)
    }

    fn create_copy(&mut self, record: &SatelliteRecord) -> Result<(), TreeError> {
        if record.is_originating() {
            return Err(TreeError::Validation(
                "create_copy requires a source_ancestor_id".to_string(),
            ));
        }
        self.create_satellite(record)
    }

    fn insert_originating(&mut self, record: &SatelliteRecord) -> Result<(), TreeError> {
        if !record.is_originating() {
            return Err(TreeError::Validation(
                "originating records MUST NOT carry a source_ancestor_id".to_string(),
            ));
        }
        self.create_satellite(record)
    }

    fn delete_by_owner_and_source(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        source: &ContentId,
    ) -> Result<usize, TreeError> {
        self.conn
            .execute(
                "DELETE FROM satellite_records
                 WHERE owner_id = ?1 AND branch = ?2 AND kind = ?3
                   AND owner_content_id = ?4 AND source_ancestor_id = ?5",
                params![key.owner_id, key.branch, kind.as_str(), owner.as_str(), source.as_str()],
            )
            .with_context(|| format!("failed to delete copies on {owner} from {source}"))
            .map_err(store_error)
    }

    fn delete_record(
        &mut self,
        key: &HierarchyKey,
        kind: SatelliteKind,
        owner: &ContentId,
        record_key: &str,
        source: Option<&ContentId>,
    ) -> Result<bool, TreeError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM satellite_records
                 WHERE owner_id = ?1 AND branch = ?2 AND kind = ?3
                   AND owner_content_id = ?4 AND record_key = ?5 AND source_ancestor_id = ?6",
                params![
                    key.owner_id,
                    key.branch,
                    kind.as_str(),
                    owner.as_str(),
                    record_key,
                    source_column(source)
                ],
            )
            .with_context(|| format!("failed to delete {} `{record_key}` on {owner}", kind.as_str()))
            .map_err(store_error)?;
        Ok(deleted > 0)
    }

    fn delete_owned(&mut self, key: &HierarchyKey, owner: &ContentId) -> Result<usize, TreeError> {
        self.conn
            .execute(
                "DELETE FROM satellite_records
                 WHERE owner_id = ?1 AND branch = ?2 AND owner_content_id = ?3",
                params![key.owner_id, key.branch, owner.as_str()],
            )
            .with_context(|| format!("failed to delete satellites owned by {owner}"))
            .map_err(store_error)
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
