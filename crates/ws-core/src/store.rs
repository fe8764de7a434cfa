//! Async SQLite-backed store for all durable sync state.
//!
//! Tables map 1:1 to the entity types in [`crate::types`]. Snapshots, logs,
//! and option blobs are stored as TEXT holding JSON; timestamps are RFC 3339
//! TEXT; uuids are TEXT. Foreign keys cascade so deleting a connector or a
//! sync config removes its dependent state.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, WsError};
use crate::types::*;

/// The relational store. Clone-free; share behind an `Arc`.
pub struct Store {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// Column conversions
// ---------------------------------------------------------------------------

fn to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn from_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

/// Enums persist as their bare wire name (`last-write-wins`, `field_conflict`).
/// Conversion failures propagate and surface as [`WsError::Store`] at the
/// connection boundary.
fn enum_to_sql<T: serde::Serialize>(val: &T) -> rusqlite::Result<String> {
    let quoted = serde_json::to_string(val).map_err(to_sql_err)?;
    Ok(quoted.trim_matches('"').to_string())
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(&format!("\"{raw}\"")).map_err(from_sql_err)
}

fn to_json_text<T: serde::Serialize>(val: &T) -> rusqlite::Result<String> {
    serde_json::to_string(val).map_err(to_sql_err)
}

fn from_json_text<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(from_sql_err)
}

fn json_to_sql(val: &serde_json::Value) -> String {
    val.to_string()
}

fn opt_json_to_sql(val: &Option<serde_json::Value>) -> Option<String> {
    val.as_ref().map(json_to_sql)
}

fn opt_json_from_sql(raw: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.as_deref().map(from_json_text).transpose()
}

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("parse timestamp column")
        .with_timezone(&Utc)
}

fn opt_ts_to_sql(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(ts_to_sql)
}

fn opt_ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(ts_from_sql)
}

fn uuid_from_sql(raw: String) -> Uuid {
    Uuid::parse_str(&raw).expect("parse uuid column")
}

fn opt_uuid_from_sql(raw: Option<String>) -> Option<Uuid> {
    raw.map(uuid_from_sql)
}

impl Store {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        debug!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// Create a purely in-memory database (tests and dry runs).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Close the underlying connection, flushing WAL state.
    pub async fn close(self) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| WsError::Store(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS connectors (
                        id                    TEXT PRIMARY KEY,
                        name                  TEXT NOT NULL,
                        kind                  TEXT NOT NULL,
                        base_url              TEXT NOT NULL,
                        endpoint              TEXT,
                        auth_kind             TEXT NOT NULL,
                        encrypted_credentials TEXT NOT NULL,
                        active                INTEGER NOT NULL DEFAULT 1,
                        metadata              TEXT,
                        created_at            TEXT NOT NULL,
                        updated_at            TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS work_item_types (
                        id           TEXT PRIMARY KEY,
                        connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        type_name    TEXT NOT NULL,
                        type_id      TEXT NOT NULL,
                        UNIQUE (connector_id, type_name)
                    );

                    CREATE TABLE IF NOT EXISTS work_item_fields (
                        id                TEXT PRIMARY KEY,
                        connector_id      TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        work_item_type_id TEXT NOT NULL REFERENCES work_item_types(id) ON DELETE CASCADE,
                        reference_name    TEXT NOT NULL,
                        display_name      TEXT NOT NULL,
                        data_type         TEXT NOT NULL,
                        required          INTEGER NOT NULL DEFAULT 0,
                        read_only         INTEGER NOT NULL DEFAULT 0,
                        allowed_values    TEXT NOT NULL DEFAULT '[]',
                        default_value     TEXT,
                        suggestion_score  INTEGER NOT NULL DEFAULT 0,
                        UNIQUE (work_item_type_id, reference_name)
                    );

                    CREATE TABLE IF NOT EXISTS work_item_statuses (
                        id                TEXT PRIMARY KEY,
                        connector_id      TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        work_item_type_id TEXT NOT NULL REFERENCES work_item_types(id) ON DELETE CASCADE,
                        name              TEXT NOT NULL,
                        value             TEXT NOT NULL,
                        category          TEXT NOT NULL,
                        sort_order        INTEGER NOT NULL DEFAULT 0,
                        UNIQUE (work_item_type_id, name)
                    );

                    CREATE TABLE IF NOT EXISTS sync_configs (
                        id                  TEXT PRIMARY KEY,
                        name                TEXT NOT NULL,
                        source_connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        target_connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        active              INTEGER NOT NULL DEFAULT 1,
                        trigger_kind        TEXT NOT NULL,
                        cron_expr           TEXT,
                        direction           TEXT NOT NULL,
                        track_versions      INTEGER NOT NULL DEFAULT 0,
                        conflict_strategy   TEXT NOT NULL,
                        options             TEXT NOT NULL DEFAULT '{}',
                        sync_filter         TEXT,
                        last_sync_at        TEXT,
                        created_at          TEXT NOT NULL,
                        updated_at          TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS type_mappings (
                        id             TEXT PRIMARY KEY,
                        sync_config_id TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        source_type_id TEXT NOT NULL REFERENCES work_item_types(id) ON DELETE CASCADE,
                        target_type_id TEXT NOT NULL REFERENCES work_item_types(id) ON DELETE CASCADE,
                        active         INTEGER NOT NULL DEFAULT 1
                    );

                    CREATE TABLE IF NOT EXISTS field_mappings (
                        id                     TEXT PRIMARY KEY,
                        type_mapping_id        TEXT NOT NULL REFERENCES type_mappings(id) ON DELETE CASCADE,
                        source_field_id        TEXT REFERENCES work_item_fields(id) ON DELETE CASCADE,
                        target_field_id        TEXT REFERENCES work_item_fields(id) ON DELETE CASCADE,
                        mapping_kind           TEXT NOT NULL,
                        constant_value         TEXT,
                        transformation         TEXT,
                        reverse_transformation TEXT,
                        required               INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE TABLE IF NOT EXISTS status_mappings (
                        id               TEXT PRIMARY KEY,
                        type_mapping_id  TEXT NOT NULL REFERENCES type_mappings(id) ON DELETE CASCADE,
                        source_status_id TEXT NOT NULL REFERENCES work_item_statuses(id) ON DELETE CASCADE,
                        target_status_id TEXT NOT NULL REFERENCES work_item_statuses(id) ON DELETE CASCADE
                    );

                    CREATE TABLE IF NOT EXISTS synced_items (
                        id                  TEXT PRIMARY KEY,
                        sync_config_id      TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        source_connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        target_connector_id TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        source_item_id      TEXT NOT NULL,
                        target_item_id      TEXT NOT NULL,
                        source_item_type    TEXT,
                        target_item_type    TEXT,
                        first_synced_at     TEXT NOT NULL,
                        last_synced_at      TEXT NOT NULL,
                        sync_count          INTEGER NOT NULL DEFAULT 0,
                        status              TEXT NOT NULL,
                        UNIQUE (sync_config_id, source_connector_id, source_item_id)
                    );

                    CREATE TABLE IF NOT EXISTS synced_comments (
                        id                TEXT PRIMARY KEY,
                        synced_item_id    TEXT NOT NULL REFERENCES synced_items(id) ON DELETE CASCADE,
                        source_comment_id TEXT NOT NULL,
                        target_comment_id TEXT,
                        status            TEXT NOT NULL,
                        created_at        TEXT NOT NULL,
                        UNIQUE (synced_item_id, source_comment_id)
                    );

                    CREATE TABLE IF NOT EXISTS synced_links (
                        id                    TEXT PRIMARY KEY,
                        synced_item_id        TEXT NOT NULL REFERENCES synced_items(id) ON DELETE CASCADE,
                        source_linked_item_id TEXT NOT NULL,
                        target_linked_item_id TEXT,
                        relation_type         TEXT NOT NULL,
                        status                TEXT NOT NULL,
                        created_at            TEXT NOT NULL,
                        UNIQUE (synced_item_id, source_linked_item_id, relation_type)
                    );

                    CREATE TABLE IF NOT EXISTS work_item_versions (
                        id              TEXT PRIMARY KEY,
                        sync_config_id  TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        connector_id    TEXT NOT NULL REFERENCES connectors(id) ON DELETE CASCADE,
                        work_item_id    TEXT NOT NULL,
                        version         INTEGER NOT NULL,
                        revision        TEXT,
                        changed_date    TEXT,
                        changed_by      TEXT,
                        fields_snapshot TEXT NOT NULL,
                        hash            TEXT NOT NULL,
                        execution_id    TEXT,
                        captured_at     TEXT NOT NULL,
                        UNIQUE (sync_config_id, connector_id, work_item_id, version)
                    );

                    CREATE INDEX IF NOT EXISTS idx_versions_lookup
                        ON work_item_versions(sync_config_id, connector_id, work_item_id, version DESC);

                    CREATE TABLE IF NOT EXISTS sync_conflicts (
                        id                  TEXT PRIMARY KEY,
                        sync_config_id      TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        execution_id        TEXT,
                        source_work_item_id TEXT NOT NULL,
                        target_work_item_id TEXT NOT NULL,
                        work_item_type      TEXT,
                        kind                TEXT NOT NULL,
                        field_name          TEXT,
                        source_value        TEXT,
                        target_value        TEXT,
                        base_value          TEXT,
                        status              TEXT NOT NULL,
                        resolution_strategy TEXT,
                        resolved_value      TEXT,
                        resolved_by         TEXT,
                        resolved_at         TEXT,
                        metadata            TEXT NOT NULL DEFAULT '{}',
                        detected_at         TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_conflicts_config
                        ON sync_conflicts(sync_config_id, status);

                    CREATE TABLE IF NOT EXISTS conflict_resolutions (
                        id                 TEXT PRIMARY KEY,
                        conflict_id        TEXT NOT NULL REFERENCES sync_conflicts(id) ON DELETE CASCADE,
                        strategy           TEXT NOT NULL,
                        previous_value     TEXT,
                        resolved_value     TEXT,
                        rationale          TEXT NOT NULL,
                        applied_to_source  INTEGER NOT NULL DEFAULT 0,
                        applied_to_target  INTEGER NOT NULL DEFAULT 0,
                        application_result TEXT,
                        resolved_by        TEXT NOT NULL,
                        created_at         TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS sync_executions (
                        id                 TEXT PRIMARY KEY,
                        sync_config_id     TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        direction          TEXT NOT NULL,
                        trigger_kind       TEXT NOT NULL,
                        status             TEXT NOT NULL,
                        started_at         TEXT NOT NULL,
                        completed_at       TEXT,
                        items_created      INTEGER NOT NULL DEFAULT 0,
                        items_updated      INTEGER NOT NULL DEFAULT 0,
                        items_synced       INTEGER NOT NULL DEFAULT 0,
                        items_failed       INTEGER NOT NULL DEFAULT 0,
                        conflicts_detected INTEGER NOT NULL DEFAULT 0,
                        conflicts_resolved INTEGER NOT NULL DEFAULT 0,
                        error_message      TEXT,
                        logs               TEXT NOT NULL DEFAULT '[]'
                    );

                    CREATE INDEX IF NOT EXISTS idx_executions_config
                        ON sync_executions(sync_config_id, started_at DESC);

                    CREATE TABLE IF NOT EXISTS sync_errors (
                        id           TEXT PRIMARY KEY,
                        execution_id TEXT NOT NULL REFERENCES sync_executions(id) ON DELETE CASCADE,
                        error_type   TEXT NOT NULL,
                        message      TEXT NOT NULL,
                        detail       TEXT,
                        work_item_id TEXT,
                        created_at   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS webhooks (
                        id                TEXT PRIMARY KEY,
                        name              TEXT NOT NULL,
                        sync_config_id    TEXT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                        connector_id      TEXT REFERENCES connectors(id) ON DELETE CASCADE,
                        token             TEXT NOT NULL UNIQUE,
                        secret            TEXT NOT NULL,
                        active            INTEGER NOT NULL DEFAULT 1,
                        event_types       TEXT NOT NULL DEFAULT '[]',
                        trigger_count     INTEGER NOT NULL DEFAULT 0,
                        last_triggered_at TEXT,
                        created_at        TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS webhook_deliveries (
                        id              TEXT PRIMARY KEY,
                        webhook_id      TEXT NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
                        signature_valid INTEGER NOT NULL,
                        status          TEXT NOT NULL,
                        payload         TEXT NOT NULL,
                        headers         TEXT NOT NULL DEFAULT '{}',
                        received_at     TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Connectors
    // -----------------------------------------------------------------------

    pub async fn insert_connector(&self, rec: &ConnectorRecord) -> Result<()> {
        let rec = rec.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO connectors
                     (id, name, kind, base_url, endpoint, auth_kind, encrypted_credentials,
                      active, metadata, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        rec.id.to_string(),
                        rec.name,
                        rec.kind,
                        rec.base_url,
                        rec.endpoint,
                        enum_to_sql(&rec.auth_kind)?,
                        rec.encrypted_credentials,
                        rec.active,
                        opt_json_to_sql(&rec.metadata),
                        ts_to_sql(&rec.created_at),
                        ts_to_sql(&rec.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_connector(&self, id: Uuid) -> Result<Option<ConnectorRecord>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, base_url, endpoint, auth_kind, encrypted_credentials,
                            active, metadata, created_at, updated_at
                     FROM connectors WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(connector_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_connectors(&self) -> Result<Vec<ConnectorRecord>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, base_url, endpoint, auth_kind, encrypted_credentials,
                            active, metadata, created_at, updated_at
                     FROM connectors ORDER BY created_at",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(connector_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Update a connector row. Credentials are expected to already be
    /// re-encrypted by the caller when they change.
    pub async fn update_connector(&self, rec: &ConnectorRecord) -> Result<()> {
        let rec = rec.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE connectors SET
                       name=?2, kind=?3, base_url=?4, endpoint=?5, auth_kind=?6,
                       encrypted_credentials=?7, active=?8, metadata=?9, updated_at=?10
                     WHERE id=?1",
                    rusqlite::params![
                        rec.id.to_string(),
                        rec.name,
                        rec.kind,
                        rec.base_url,
                        rec.endpoint,
                        enum_to_sql(&rec.auth_kind)?,
                        rec.encrypted_credentials,
                        rec.active,
                        opt_json_to_sql(&rec.metadata),
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Delete a connector; mappings, synced items, and versions cascade.
    pub async fn delete_connector(&self, id: Uuid) -> Result<()> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM connectors WHERE id = ?1", [id_str])?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Discovered metadata
    // -----------------------------------------------------------------------

    /// Persist discovery output in one transaction, upserting types by
    /// (connector, type name) and fields/statuses by their natural keys.
    pub async fn save_discovered_metadata(
        &self,
        connector_id: Uuid,
        types: Vec<DiscoveredType>,
    ) -> Result<()> {
        let conn_id = connector_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for ty in &types {
                    let type_row_id: String = {
                        let existing: Option<String> = tx
                            .query_row(
                                "SELECT id FROM work_item_types
                                 WHERE connector_id=?1 AND type_name=?2",
                                rusqlite::params![conn_id, ty.type_name],
                                |r| r.get(0),
                            )
                            .ok();
                        match existing {
                            Some(id) => {
                                tx.execute(
                                    "UPDATE work_item_types SET type_id=?2 WHERE id=?1",
                                    rusqlite::params![id, ty.type_id],
                                )?;
                                id
                            }
                            None => {
                                let id = Uuid::new_v4().to_string();
                                tx.execute(
                                    "INSERT INTO work_item_types (id, connector_id, type_name, type_id)
                                     VALUES (?1,?2,?3,?4)",
                                    rusqlite::params![id, conn_id, ty.type_name, ty.type_id],
                                )?;
                                id
                            }
                        }
                    };

                    for field in &ty.fields {
                        tx.execute(
                            "INSERT INTO work_item_fields
                             (id, connector_id, work_item_type_id, reference_name, display_name,
                              data_type, required, read_only, allowed_values, default_value,
                              suggestion_score)
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                             ON CONFLICT (work_item_type_id, reference_name) DO UPDATE SET
                               display_name=excluded.display_name,
                               data_type=excluded.data_type,
                               required=excluded.required,
                               read_only=excluded.read_only,
                               allowed_values=excluded.allowed_values,
                               default_value=excluded.default_value,
                               suggestion_score=excluded.suggestion_score",
                            rusqlite::params![
                                Uuid::new_v4().to_string(),
                                conn_id,
                                type_row_id,
                                field.reference_name,
                                field.display_name,
                                enum_to_sql(&field.data_type)?,
                                field.required,
                                field.read_only,
                                to_json_text(&field.allowed_values)?,
                                opt_json_to_sql(&field.default_value),
                                field.suggestion_score,
                            ],
                        )?;
                    }

                    for status in &ty.statuses {
                        tx.execute(
                            "INSERT INTO work_item_statuses
                             (id, connector_id, work_item_type_id, name, value, category, sort_order)
                             VALUES (?1,?2,?3,?4,?5,?6,?7)
                             ON CONFLICT (work_item_type_id, name) DO UPDATE SET
                               value=excluded.value,
                               category=excluded.category,
                               sort_order=excluded.sort_order",
                            rusqlite::params![
                                Uuid::new_v4().to_string(),
                                conn_id,
                                type_row_id,
                                status.name,
                                status.value,
                                enum_to_sql(&status.category)?,
                                status.sort_order,
                            ],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_types(&self, connector_id: Uuid) -> Result<Vec<WorkItemTypeMeta>> {
        let conn_id = connector_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, connector_id, type_name, type_id
                     FROM work_item_types WHERE connector_id=?1 ORDER BY type_name",
                )?;
                let mut rows = stmt.query(rusqlite::params![conn_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(WorkItemTypeMeta {
                        id: uuid_from_sql(row.get(0)?),
                        connector_id: uuid_from_sql(row.get(1)?),
                        type_name: row.get(2)?,
                        type_id: row.get(3)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_fields(&self, work_item_type_id: Uuid) -> Result<Vec<FieldMeta>> {
        let type_id = work_item_type_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, connector_id, work_item_type_id, reference_name, display_name,
                            data_type, required, read_only, allowed_values, default_value,
                            suggestion_score
                     FROM work_item_fields WHERE work_item_type_id=?1
                     ORDER BY suggestion_score DESC, reference_name",
                )?;
                let mut rows = stmt.query(rusqlite::params![type_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let allowed: String = row.get(8)?;
                    out.push(FieldMeta {
                        id: uuid_from_sql(row.get(0)?),
                        connector_id: uuid_from_sql(row.get(1)?),
                        work_item_type_id: uuid_from_sql(row.get(2)?),
                        reference_name: row.get(3)?,
                        display_name: row.get(4)?,
                        data_type: enum_from_sql(&row.get::<_, String>(5)?)?,
                        required: row.get(6)?,
                        read_only: row.get(7)?,
                        allowed_values: from_json_text(&allowed)?,
                        default_value: opt_json_from_sql(row.get(9)?)?,
                        suggestion_score: row.get(10)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_statuses(&self, work_item_type_id: Uuid) -> Result<Vec<StatusMeta>> {
        let type_id = work_item_type_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, connector_id, work_item_type_id, name, value, category, sort_order
                     FROM work_item_statuses WHERE work_item_type_id=?1 ORDER BY sort_order",
                )?;
                let mut rows = stmt.query(rusqlite::params![type_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(StatusMeta {
                        id: uuid_from_sql(row.get(0)?),
                        connector_id: uuid_from_sql(row.get(1)?),
                        work_item_type_id: uuid_from_sql(row.get(2)?),
                        name: row.get(3)?,
                        value: row.get(4)?,
                        category: enum_from_sql(&row.get::<_, String>(5)?)?,
                        sort_order: row.get(6)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Sync configs
    // -----------------------------------------------------------------------

    pub async fn insert_sync_config(&self, cfg: &SyncConfig) -> Result<()> {
        let cfg = cfg.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_configs
                     (id, name, source_connector_id, target_connector_id, active, trigger_kind,
                      cron_expr, direction, track_versions, conflict_strategy, options,
                      sync_filter, last_sync_at, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                    rusqlite::params![
                        cfg.id.to_string(),
                        cfg.name,
                        cfg.source_connector_id.to_string(),
                        cfg.target_connector_id.to_string(),
                        cfg.active,
                        enum_to_sql(&cfg.trigger_kind)?,
                        cfg.cron_expr,
                        enum_to_sql(&cfg.direction)?,
                        cfg.track_versions,
                        enum_to_sql(&cfg.conflict_strategy)?,
                        to_json_text(&cfg.options)?,
                        opt_json_to_sql(&cfg.sync_filter),
                        opt_ts_to_sql(&cfg.last_sync_at),
                        ts_to_sql(&cfg.created_at),
                        ts_to_sql(&cfg.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_sync_config(&self, id: Uuid) -> Result<Option<SyncConfig>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, source_connector_id, target_connector_id, active,
                            trigger_kind, cron_expr, direction, track_versions, conflict_strategy,
                            options, sync_filter, last_sync_at, created_at, updated_at
                     FROM sync_configs WHERE id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(sync_config_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// All configs that the cron scheduler should register: active with
    /// `trigger_kind = scheduled` and a cron expression.
    pub async fn list_scheduled_configs(&self) -> Result<Vec<SyncConfig>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, source_connector_id, target_connector_id, active,
                            trigger_kind, cron_expr, direction, track_versions, conflict_strategy,
                            options, sync_filter, last_sync_at, created_at, updated_at
                     FROM sync_configs
                     WHERE active=1 AND trigger_kind='scheduled' AND cron_expr IS NOT NULL",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(sync_config_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn update_sync_config(&self, cfg: &SyncConfig) -> Result<()> {
        let cfg = cfg.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_configs SET
                       name=?2, active=?3, trigger_kind=?4, cron_expr=?5, direction=?6,
                       track_versions=?7, conflict_strategy=?8, options=?9, sync_filter=?10,
                       updated_at=?11
                     WHERE id=?1",
                    rusqlite::params![
                        cfg.id.to_string(),
                        cfg.name,
                        cfg.active,
                        enum_to_sql(&cfg.trigger_kind)?,
                        cfg.cron_expr,
                        enum_to_sql(&cfg.direction)?,
                        cfg.track_versions,
                        enum_to_sql(&cfg.conflict_strategy)?,
                        to_json_text(&cfg.options)?,
                        opt_json_to_sql(&cfg.sync_filter),
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn set_last_sync_at(&self, config_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let id_str = config_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_configs SET last_sync_at=?2 WHERE id=?1",
                    rusqlite::params![id_str, ts_to_sql(&at)],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn delete_sync_config(&self, id: Uuid) -> Result<()> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM sync_configs WHERE id=?1", [id_str])?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Mappings
    // -----------------------------------------------------------------------

    pub async fn insert_type_mapping(&self, tm: &TypeMapping) -> Result<()> {
        let tm = tm.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO type_mappings
                     (id, sync_config_id, source_type_id, target_type_id, active)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        tm.id.to_string(),
                        tm.sync_config_id.to_string(),
                        tm.source_type_id.to_string(),
                        tm.target_type_id.to_string(),
                        tm.active,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn insert_field_mapping(&self, fm: &FieldMapping) -> Result<()> {
        let fm = fm.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO field_mappings
                     (id, type_mapping_id, source_field_id, target_field_id, mapping_kind,
                      constant_value, transformation, reverse_transformation, required)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        fm.id.to_string(),
                        fm.type_mapping_id.to_string(),
                        fm.source_field_id.map(|u| u.to_string()),
                        fm.target_field_id.map(|u| u.to_string()),
                        enum_to_sql(&fm.mapping_kind)?,
                        opt_json_to_sql(&fm.constant_value),
                        opt_json_to_sql(&fm.transformation),
                        opt_json_to_sql(&fm.reverse_transformation),
                        fm.required,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn insert_status_mapping(&self, sm: &StatusMapping) -> Result<()> {
        let sm = sm.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO status_mappings
                     (id, type_mapping_id, source_status_id, target_status_id)
                     VALUES (?1,?2,?3,?4)",
                    rusqlite::params![
                        sm.id.to_string(),
                        sm.type_mapping_id.to_string(),
                        sm.source_status_id.to_string(),
                        sm.target_status_id.to_string(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Load all mappings for a config in one joined read, resolved against
    /// the discovered metadata they reference.
    pub async fn load_mapping_bundle(&self, config_id: Uuid) -> Result<MappingBundle> {
        let cfg_id = config_id.to_string();
        self.conn
            .call(move |conn| {
                let mut type_mappings = Vec::new();
                {
                    let mut stmt = conn.prepare(
                        "SELECT tm.id, st.type_name, tt.type_name, tm.active
                         FROM type_mappings tm
                         JOIN work_item_types st ON st.id = tm.source_type_id
                         JOIN work_item_types tt ON tt.id = tm.target_type_id
                         WHERE tm.sync_config_id = ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![cfg_id])?;
                    while let Some(row) = rows.next()? {
                        type_mappings.push(ResolvedTypeMapping {
                            id: uuid_from_sql(row.get(0)?),
                            source_type_name: row.get(1)?,
                            target_type_name: row.get(2)?,
                            active: row.get(3)?,
                            fields: Vec::new(),
                            statuses: Vec::new(),
                        });
                    }
                }

                for tm in &mut type_mappings {
                    let tm_id = tm.id.to_string();
                    let mut stmt = conn.prepare(
                        "SELECT fm.id, fm.mapping_kind, fm.constant_value, fm.transformation,
                                fm.reverse_transformation, fm.required,
                                sf.reference_name, sf.display_name, sf.data_type,
                                tf.reference_name, tf.display_name, tf.data_type
                         FROM field_mappings fm
                         LEFT JOIN work_item_fields sf ON sf.id = fm.source_field_id
                         LEFT JOIN work_item_fields tf ON tf.id = fm.target_field_id
                         WHERE fm.type_mapping_id = ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![tm_id])?;
                    while let Some(row) = rows.next()? {
                        tm.fields.push(ResolvedFieldMapping {
                            id: uuid_from_sql(row.get(0)?),
                            mapping_kind: enum_from_sql(&row.get::<_, String>(1)?)?,
                            constant_value: opt_json_from_sql(row.get(2)?)?,
                            transformation: opt_json_from_sql(row.get(3)?)?,
                            reverse_transformation: opt_json_from_sql(row.get(4)?)?,
                            required: row.get(5)?,
                            source_ref: row.get(6)?,
                            source_name: row.get(7)?,
                            source_data_type: row
                                .get::<_, Option<String>>(8)?
                                .map(|s| enum_from_sql(&s)).transpose()?,
                            target_ref: row.get(9)?,
                            target_name: row.get(10)?,
                            target_data_type: row
                                .get::<_, Option<String>>(11)?
                                .map(|s| enum_from_sql(&s)).transpose()?,
                        });
                    }

                    let mut stmt = conn.prepare(
                        "SELECT ss.name, ss.value, ts.name, ts.value
                         FROM status_mappings sm
                         JOIN work_item_statuses ss ON ss.id = sm.source_status_id
                         JOIN work_item_statuses ts ON ts.id = sm.target_status_id
                         WHERE sm.type_mapping_id = ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![tm_id])?;
                    while let Some(row) = rows.next()? {
                        tm.statuses.push(ResolvedStatusMapping {
                            source_name: row.get(0)?,
                            source_value: row.get(1)?,
                            target_name: row.get(2)?,
                            target_value: row.get(3)?,
                        });
                    }
                }

                Ok(MappingBundle {
                    sync_config_id: uuid_from_sql(cfg_id),
                    type_mappings,
                })
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Synced items
    // -----------------------------------------------------------------------

    pub async fn insert_synced_item(&self, item: &SyncedItem) -> Result<()> {
        let item = item.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO synced_items
                     (id, sync_config_id, source_connector_id, target_connector_id,
                      source_item_id, target_item_id, source_item_type, target_item_type,
                      first_synced_at, last_synced_at, sync_count, status)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        item.id.to_string(),
                        item.sync_config_id.to_string(),
                        item.source_connector_id.to_string(),
                        item.target_connector_id.to_string(),
                        item.source_item_id,
                        item.target_item_id,
                        item.source_item_type,
                        item.target_item_type,
                        ts_to_sql(&item.first_synced_at),
                        ts_to_sql(&item.last_synced_at),
                        item.sync_count,
                        enum_to_sql(&item.status)?,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Look up the identity row by the unique
    /// (config, source connector, source item) key.
    pub async fn get_synced_item(
        &self,
        config_id: Uuid,
        source_connector_id: Uuid,
        source_item_id: &str,
    ) -> Result<Option<SyncedItem>> {
        let cfg = config_id.to_string();
        let src = source_connector_id.to_string();
        let item = source_item_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, source_connector_id, target_connector_id,
                            source_item_id, target_item_id, source_item_type, target_item_type,
                            first_synced_at, last_synced_at, sync_count, status
                     FROM synced_items
                     WHERE sync_config_id=?1 AND source_connector_id=?2 AND source_item_id=?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg, src, item])?;
                match rows.next()? {
                    Some(row) => Ok(Some(synced_item_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_synced_item_by_id(&self, id: Uuid) -> Result<Option<SyncedItem>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, source_connector_id, target_connector_id,
                            source_item_id, target_item_id, source_item_type, target_item_type,
                            first_synced_at, last_synced_at, sync_count, status
                     FROM synced_items WHERE id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(synced_item_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Look up the identity row from the target side, for reverse passes.
    pub async fn get_synced_item_by_target(
        &self,
        config_id: Uuid,
        target_connector_id: Uuid,
        target_item_id: &str,
    ) -> Result<Option<SyncedItem>> {
        let cfg = config_id.to_string();
        let tgt = target_connector_id.to_string();
        let item = target_item_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, source_connector_id, target_connector_id,
                            source_item_id, target_item_id, source_item_type, target_item_type,
                            first_synced_at, last_synced_at, sync_count, status
                     FROM synced_items
                     WHERE sync_config_id=?1 AND target_connector_id=?2 AND target_item_id=?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg, tgt, item])?;
                match rows.next()? {
                    Some(row) => Ok(Some(synced_item_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_synced_items(&self, config_id: Uuid) -> Result<Vec<SyncedItem>> {
        let cfg = config_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, source_connector_id, target_connector_id,
                            source_item_id, target_item_id, source_item_type, target_item_type,
                            first_synced_at, last_synced_at, sync_count, status
                     FROM synced_items WHERE sync_config_id=?1 ORDER BY first_synced_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(synced_item_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Bump sync bookkeeping after a successful pass over an item.
    pub async fn touch_synced_item(&self, id: Uuid, status: SyncedStatus) -> Result<()> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE synced_items SET
                       sync_count = sync_count + 1,
                       last_synced_at = ?2,
                       status = ?3
                     WHERE id = ?1",
                    rusqlite::params![id_str, ts_to_sql(&Utc::now()), enum_to_sql(&status)?],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn count_synced_items(&self, config_id: Uuid) -> Result<i64> {
        let cfg = config_id.to_string();
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM synced_items WHERE sync_config_id=?1",
                    rusqlite::params![cfg],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Synced comments & links
    // -----------------------------------------------------------------------

    pub async fn insert_synced_comment(&self, c: &SyncedComment) -> Result<()> {
        let c = c.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO synced_comments
                     (id, synced_item_id, source_comment_id, target_comment_id, status, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        c.id.to_string(),
                        c.synced_item_id.to_string(),
                        c.source_comment_id,
                        c.target_comment_id,
                        enum_to_sql(&c.status)?,
                        ts_to_sql(&c.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_synced_comments(&self, synced_item_id: Uuid) -> Result<Vec<SyncedComment>> {
        let item = synced_item_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, synced_item_id, source_comment_id, target_comment_id, status,
                            created_at
                     FROM synced_comments WHERE synced_item_id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![item])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(SyncedComment {
                        id: uuid_from_sql(row.get(0)?),
                        synced_item_id: uuid_from_sql(row.get(1)?),
                        source_comment_id: row.get(2)?,
                        target_comment_id: row.get(3)?,
                        status: enum_from_sql(&row.get::<_, String>(4)?)?,
                        created_at: ts_from_sql(&row.get::<_, String>(5)?),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn insert_synced_link(&self, l: &SyncedLink) -> Result<()> {
        let l = l.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO synced_links
                     (id, synced_item_id, source_linked_item_id, target_linked_item_id,
                      relation_type, status, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT (synced_item_id, source_linked_item_id, relation_type)
                     DO NOTHING",
                    rusqlite::params![
                        l.id.to_string(),
                        l.synced_item_id.to_string(),
                        l.source_linked_item_id,
                        l.target_linked_item_id,
                        l.relation_type,
                        enum_to_sql(&l.status)?,
                        ts_to_sql(&l.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_synced_links(&self, synced_item_id: Uuid) -> Result<Vec<SyncedLink>> {
        let item = synced_item_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, synced_item_id, source_linked_item_id, target_linked_item_id,
                            relation_type, status, created_at
                     FROM synced_links WHERE synced_item_id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![item])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(synced_link_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Pending links across a whole config, joined through their parent
    /// identity rows. A later pass promotes these when counterparts appear.
    pub async fn list_pending_links(&self, config_id: Uuid) -> Result<Vec<SyncedLink>> {
        let cfg = config_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sl.id, sl.synced_item_id, sl.source_linked_item_id,
                            sl.target_linked_item_id, sl.relation_type, sl.status, sl.created_at
                     FROM synced_links sl
                     JOIN synced_items si ON si.id = sl.synced_item_id
                     WHERE si.sync_config_id = ?1 AND sl.status = 'pending'",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(synced_link_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn mark_link_synced(&self, id: Uuid, target_linked_item_id: &str) -> Result<()> {
        let id_str = id.to_string();
        let target = target_linked_item_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE synced_links SET status='synced', target_linked_item_id=?2 WHERE id=?1",
                    rusqlite::params![id_str, target],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Append a version snapshot, assigning the next monotonic version number
    /// for (config, connector, item) inside a single transaction.
    pub async fn insert_version(
        &self,
        config_id: Uuid,
        connector_id: Uuid,
        work_item_id: &str,
        revision: Option<String>,
        changed_date: Option<DateTime<Utc>>,
        changed_by: Option<String>,
        fields_snapshot: serde_json::Value,
        hash: String,
        execution_id: Option<Uuid>,
    ) -> Result<WorkItemVersion> {
        let cfg = config_id.to_string();
        let conn_id = connector_id.to_string();
        let item = work_item_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let next: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM work_item_versions
                     WHERE sync_config_id=?1 AND connector_id=?2 AND work_item_id=?3",
                    rusqlite::params![cfg, conn_id, item],
                    |r| r.get(0),
                )?;
                let version = WorkItemVersion {
                    id: Uuid::new_v4(),
                    sync_config_id: uuid_from_sql(cfg.clone()),
                    connector_id: uuid_from_sql(conn_id.clone()),
                    work_item_id: item.clone(),
                    version: next,
                    revision,
                    changed_date,
                    changed_by,
                    fields_snapshot,
                    hash,
                    execution_id,
                    captured_at: Utc::now(),
                };
                tx.execute(
                    "INSERT INTO work_item_versions
                     (id, sync_config_id, connector_id, work_item_id, version, revision,
                      changed_date, changed_by, fields_snapshot, hash, execution_id, captured_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                    rusqlite::params![
                        version.id.to_string(),
                        cfg,
                        conn_id,
                        item,
                        version.version,
                        version.revision,
                        opt_ts_to_sql(&version.changed_date),
                        version.changed_by,
                        json_to_sql(&version.fields_snapshot),
                        version.hash,
                        version.execution_id.map(|u| u.to_string()),
                        ts_to_sql(&version.captured_at),
                    ],
                )?;
                tx.commit()?;
                Ok(version)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn latest_version(
        &self,
        config_id: Uuid,
        connector_id: Uuid,
        work_item_id: &str,
    ) -> Result<Option<WorkItemVersion>> {
        let cfg = config_id.to_string();
        let conn_id = connector_id.to_string();
        let item = work_item_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, connector_id, work_item_id, version, revision,
                            changed_date, changed_by, fields_snapshot, hash, execution_id,
                            captured_at
                     FROM work_item_versions
                     WHERE sync_config_id=?1 AND connector_id=?2 AND work_item_id=?3
                     ORDER BY version DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg, conn_id, item])?;
                match rows.next()? {
                    Some(row) => Ok(Some(version_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn count_versions(
        &self,
        config_id: Uuid,
        connector_id: Uuid,
        work_item_id: &str,
    ) -> Result<i64> {
        let cfg = config_id.to_string();
        let conn_id = connector_id.to_string();
        let item = work_item_id.to_string();
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM work_item_versions
                     WHERE sync_config_id=?1 AND connector_id=?2 AND work_item_id=?3",
                    rusqlite::params![cfg, conn_id, item],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Conflicts & resolutions
    // -----------------------------------------------------------------------

    /// Bulk-insert freshly detected conflicts (`status = unresolved`).
    pub async fn insert_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()> {
        let conflicts = conflicts.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for c in &conflicts {
                    tx.execute(
                        "INSERT INTO sync_conflicts
                         (id, sync_config_id, execution_id, source_work_item_id,
                          target_work_item_id, work_item_type, kind, field_name, source_value,
                          target_value, base_value, status, resolution_strategy, resolved_value,
                          resolved_by, resolved_at, metadata, detected_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                        rusqlite::params![
                            c.id.to_string(),
                            c.sync_config_id.to_string(),
                            c.execution_id.map(|u| u.to_string()),
                            c.source_work_item_id,
                            c.target_work_item_id,
                            c.work_item_type,
                            enum_to_sql(&c.kind)?,
                            c.field_name,
                            opt_json_to_sql(&c.source_value),
                            opt_json_to_sql(&c.target_value),
                            opt_json_to_sql(&c.base_value),
                            enum_to_sql(&c.status)?,
                            c.resolution_strategy.as_ref().map(enum_to_sql).transpose()?,
                            opt_json_to_sql(&c.resolved_value),
                            c.resolved_by,
                            opt_ts_to_sql(&c.resolved_at),
                            json_to_sql(&c.metadata),
                            ts_to_sql(&c.detected_at),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_conflict(&self, id: Uuid) -> Result<Option<SyncConflict>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, execution_id, source_work_item_id,
                            target_work_item_id, work_item_type, kind, field_name, source_value,
                            target_value, base_value, status, resolution_strategy, resolved_value,
                            resolved_by, resolved_at, metadata, detected_at
                     FROM sync_conflicts WHERE id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(conflict_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_conflicts(
        &self,
        config_id: Uuid,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<SyncConflict>> {
        let cfg = config_id.to_string();
        let status_str = status.as_ref().map(enum_to_sql).transpose()?;
        self.conn
            .call(move |conn| {
                let mut out = Vec::new();
                let sql = "SELECT id, sync_config_id, execution_id, source_work_item_id,
                            target_work_item_id, work_item_type, kind, field_name, source_value,
                            target_value, base_value, status, resolution_strategy, resolved_value,
                            resolved_by, resolved_at, metadata, detected_at
                     FROM sync_conflicts
                     WHERE sync_config_id=?1 AND (?2 IS NULL OR status=?2)
                     ORDER BY detected_at";
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query(rusqlite::params![cfg, status_str])?;
                while let Some(row) = rows.next()? {
                    out.push(conflict_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Flip a conflict row after a resolution attempt.
    pub async fn update_conflict_resolution(&self, c: &SyncConflict) -> Result<()> {
        let c = c.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_conflicts SET
                       status=?2, resolution_strategy=?3, resolved_value=?4, resolved_by=?5,
                       resolved_at=?6
                     WHERE id=?1",
                    rusqlite::params![
                        c.id.to_string(),
                        enum_to_sql(&c.status)?,
                        c.resolution_strategy.as_ref().map(enum_to_sql).transpose()?,
                        opt_json_to_sql(&c.resolved_value),
                        c.resolved_by,
                        opt_ts_to_sql(&c.resolved_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn insert_resolution(&self, r: &ConflictResolution) -> Result<()> {
        let r = r.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conflict_resolutions
                     (id, conflict_id, strategy, previous_value, resolved_value, rationale,
                      applied_to_source, applied_to_target, application_result, resolved_by,
                      created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        r.id.to_string(),
                        r.conflict_id.to_string(),
                        enum_to_sql(&r.strategy)?,
                        opt_json_to_sql(&r.previous_value),
                        opt_json_to_sql(&r.resolved_value),
                        r.rationale,
                        r.applied_to_source,
                        r.applied_to_target,
                        r.application_result,
                        r.resolved_by,
                        ts_to_sql(&r.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Executions & errors
    // -----------------------------------------------------------------------

    pub async fn insert_execution(&self, exec: &SyncExecution) -> Result<()> {
        let exec = exec.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_executions
                     (id, sync_config_id, direction, trigger_kind, status, started_at,
                      completed_at, items_created, items_updated, items_synced, items_failed,
                      conflicts_detected, conflicts_resolved, error_message, logs)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                    rusqlite::params![
                        exec.id.to_string(),
                        exec.sync_config_id.to_string(),
                        enum_to_sql(&exec.direction)?,
                        enum_to_sql(&exec.trigger)?,
                        enum_to_sql(&exec.status)?,
                        ts_to_sql(&exec.started_at),
                        opt_ts_to_sql(&exec.completed_at),
                        exec.items_created,
                        exec.items_updated,
                        exec.items_synced,
                        exec.items_failed,
                        exec.conflicts_detected,
                        exec.conflicts_resolved,
                        exec.error_message,
                        json_to_sql(&exec.logs),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Persist the execution summary together with its logs.
    pub async fn update_execution(&self, exec: &SyncExecution) -> Result<()> {
        let exec = exec.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sync_executions SET
                       status=?2, completed_at=?3, items_created=?4, items_updated=?5,
                       items_synced=?6, items_failed=?7, conflicts_detected=?8,
                       conflicts_resolved=?9, error_message=?10, logs=?11
                     WHERE id=?1",
                    rusqlite::params![
                        exec.id.to_string(),
                        enum_to_sql(&exec.status)?,
                        opt_ts_to_sql(&exec.completed_at),
                        exec.items_created,
                        exec.items_updated,
                        exec.items_synced,
                        exec.items_failed,
                        exec.conflicts_detected,
                        exec.conflicts_resolved,
                        exec.error_message,
                        json_to_sql(&exec.logs),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Option<SyncExecution>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, direction, trigger_kind, status, started_at,
                            completed_at, items_created, items_updated, items_synced,
                            items_failed, conflicts_detected, conflicts_resolved, error_message,
                            logs
                     FROM sync_executions WHERE id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(execution_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_executions(&self, config_id: Uuid) -> Result<Vec<SyncExecution>> {
        let cfg = config_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sync_config_id, direction, trigger_kind, status, started_at,
                            completed_at, items_created, items_updated, items_synced,
                            items_failed, conflicts_detected, conflicts_resolved, error_message,
                            logs
                     FROM sync_executions WHERE sync_config_id=?1 ORDER BY started_at DESC",
                )?;
                let mut rows = stmt.query(rusqlite::params![cfg])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(execution_from_row(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn insert_sync_error(&self, e: &SyncErrorRecord) -> Result<()> {
        let e = e.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sync_errors
                     (id, execution_id, error_type, message, detail, work_item_id, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        e.id.to_string(),
                        e.execution_id.to_string(),
                        e.error_type,
                        e.message,
                        e.detail,
                        e.work_item_id,
                        ts_to_sql(&e.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_sync_errors(&self, execution_id: Uuid) -> Result<Vec<SyncErrorRecord>> {
        let exec = execution_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, execution_id, error_type, message, detail, work_item_id, created_at
                     FROM sync_errors WHERE execution_id=?1 ORDER BY created_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![exec])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(SyncErrorRecord {
                        id: uuid_from_sql(row.get(0)?),
                        execution_id: uuid_from_sql(row.get(1)?),
                        error_type: row.get(2)?,
                        message: row.get(3)?,
                        detail: row.get(4)?,
                        work_item_id: row.get(5)?,
                        created_at: ts_from_sql(&row.get::<_, String>(6)?),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Webhooks
    // -----------------------------------------------------------------------

    pub async fn insert_webhook(&self, w: &Webhook) -> Result<()> {
        let w = w.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO webhooks
                     (id, name, sync_config_id, connector_id, token, secret, active, event_types,
                      trigger_count, last_triggered_at, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        w.id.to_string(),
                        w.name,
                        w.sync_config_id.to_string(),
                        w.connector_id.map(|u| u.to_string()),
                        w.token,
                        w.secret,
                        w.active,
                        to_json_text(&w.event_types)?,
                        w.trigger_count,
                        opt_ts_to_sql(&w.last_triggered_at),
                        ts_to_sql(&w.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_webhook_by_token(&self, token: &str) -> Result<Option<Webhook>> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, sync_config_id, connector_id, token, secret, active,
                            event_types, trigger_count, last_triggered_at, created_at
                     FROM webhooks WHERE token=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![token])?;
                match rows.next()? {
                    Some(row) => Ok(Some(webhook_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<Option<Webhook>> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, sync_config_id, connector_id, token, secret, active,
                            event_types, trigger_count, last_triggered_at, created_at
                     FROM webhooks WHERE id=?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(webhook_from_row(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    pub async fn set_webhook_active(&self, id: Uuid, active: bool) -> Result<()> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE webhooks SET active=?2 WHERE id=?1",
                    rusqlite::params![id_str, active],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    /// Log a delivery and, for accepted ones, bump the webhook's trigger
    /// bookkeeping — atomically.
    pub async fn record_delivery(&self, d: &WebhookDelivery, bump_trigger: bool) -> Result<()> {
        let d = d.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO webhook_deliveries
                     (id, webhook_id, signature_valid, status, payload, headers, received_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        d.id.to_string(),
                        d.webhook_id.to_string(),
                        d.signature_valid,
                        enum_to_sql(&d.status)?,
                        json_to_sql(&d.payload),
                        json_to_sql(&d.headers),
                        ts_to_sql(&d.received_at),
                    ],
                )?;
                if bump_trigger {
                    tx.execute(
                        "UPDATE webhooks SET
                           trigger_count = trigger_count + 1,
                           last_triggered_at = ?2
                         WHERE id = ?1",
                        rusqlite::params![d.webhook_id.to_string(), ts_to_sql(&d.received_at)],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_deliveries(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let wid = webhook_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, webhook_id, signature_valid, status, payload, headers, received_at
                     FROM webhook_deliveries WHERE webhook_id=?1 ORDER BY received_at",
                )?;
                let mut rows = stmt.query(rusqlite::params![wid])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(WebhookDelivery {
                        id: uuid_from_sql(row.get(0)?),
                        webhook_id: uuid_from_sql(row.get(1)?),
                        signature_valid: row.get(2)?,
                        status: enum_from_sql(&row.get::<_, String>(3)?)?,
                        payload: from_json_text(&row.get::<_, String>(4)?)?,
                        headers: from_json_text(&row.get::<_, String>(5)?)?,
                        received_at: ts_from_sql(&row.get::<_, String>(6)?),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn connector_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectorRecord> {
    Ok(ConnectorRecord {
        id: uuid_from_sql(row.get(0)?),
        name: row.get(1)?,
        kind: row.get(2)?,
        base_url: row.get(3)?,
        endpoint: row.get(4)?,
        auth_kind: enum_from_sql(&row.get::<_, String>(5)?)?,
        encrypted_credentials: row.get(6)?,
        active: row.get(7)?,
        metadata: opt_json_from_sql(row.get(8)?)?,
        created_at: ts_from_sql(&row.get::<_, String>(9)?),
        updated_at: ts_from_sql(&row.get::<_, String>(10)?),
    })
}

fn sync_config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConfig> {
    let options: String = row.get(10)?;
    Ok(SyncConfig {
        id: uuid_from_sql(row.get(0)?),
        name: row.get(1)?,
        source_connector_id: uuid_from_sql(row.get(2)?),
        target_connector_id: uuid_from_sql(row.get(3)?),
        active: row.get(4)?,
        trigger_kind: enum_from_sql(&row.get::<_, String>(5)?)?,
        cron_expr: row.get(6)?,
        direction: enum_from_sql(&row.get::<_, String>(7)?)?,
        track_versions: row.get(8)?,
        conflict_strategy: enum_from_sql(&row.get::<_, String>(9)?)?,
        options: from_json_text(&options)?,
        sync_filter: opt_json_from_sql(row.get(11)?)?,
        last_sync_at: opt_ts_from_sql(row.get(12)?),
        created_at: ts_from_sql(&row.get::<_, String>(13)?),
        updated_at: ts_from_sql(&row.get::<_, String>(14)?),
    })
}

fn synced_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncedItem> {
    Ok(SyncedItem {
        id: uuid_from_sql(row.get(0)?),
        sync_config_id: uuid_from_sql(row.get(1)?),
        source_connector_id: uuid_from_sql(row.get(2)?),
        target_connector_id: uuid_from_sql(row.get(3)?),
        source_item_id: row.get(4)?,
        target_item_id: row.get(5)?,
        source_item_type: row.get(6)?,
        target_item_type: row.get(7)?,
        first_synced_at: ts_from_sql(&row.get::<_, String>(8)?),
        last_synced_at: ts_from_sql(&row.get::<_, String>(9)?),
        sync_count: row.get(10)?,
        status: enum_from_sql(&row.get::<_, String>(11)?)?,
    })
}

fn synced_link_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncedLink> {
    Ok(SyncedLink {
        id: uuid_from_sql(row.get(0)?),
        synced_item_id: uuid_from_sql(row.get(1)?),
        source_linked_item_id: row.get(2)?,
        target_linked_item_id: row.get(3)?,
        relation_type: row.get(4)?,
        status: enum_from_sql(&row.get::<_, String>(5)?)?,
        created_at: ts_from_sql(&row.get::<_, String>(6)?),
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkItemVersion> {
    Ok(WorkItemVersion {
        id: uuid_from_sql(row.get(0)?),
        sync_config_id: uuid_from_sql(row.get(1)?),
        connector_id: uuid_from_sql(row.get(2)?),
        work_item_id: row.get(3)?,
        version: row.get(4)?,
        revision: row.get(5)?,
        changed_date: opt_ts_from_sql(row.get(6)?),
        changed_by: row.get(7)?,
        fields_snapshot: from_json_text(&row.get::<_, String>(8)?)?,
        hash: row.get(9)?,
        execution_id: opt_uuid_from_sql(row.get(10)?),
        captured_at: ts_from_sql(&row.get::<_, String>(11)?),
    })
}

fn conflict_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncConflict> {
    Ok(SyncConflict {
        id: uuid_from_sql(row.get(0)?),
        sync_config_id: uuid_from_sql(row.get(1)?),
        execution_id: opt_uuid_from_sql(row.get(2)?),
        source_work_item_id: row.get(3)?,
        target_work_item_id: row.get(4)?,
        work_item_type: row.get(5)?,
        kind: enum_from_sql(&row.get::<_, String>(6)?)?,
        field_name: row.get(7)?,
        source_value: opt_json_from_sql(row.get(8)?)?,
        target_value: opt_json_from_sql(row.get(9)?)?,
        base_value: opt_json_from_sql(row.get(10)?)?,
        status: enum_from_sql(&row.get::<_, String>(11)?)?,
        resolution_strategy: row
            .get::<_, Option<String>>(12)?
            .map(|s| enum_from_sql(&s)).transpose()?,
        resolved_value: opt_json_from_sql(row.get(13)?)?,
        resolved_by: row.get(14)?,
        resolved_at: opt_ts_from_sql(row.get(15)?),
        metadata: from_json_text(&row.get::<_, String>(16)?)?,
        detected_at: ts_from_sql(&row.get::<_, String>(17)?),
    })
}

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncExecution> {
    Ok(SyncExecution {
        id: uuid_from_sql(row.get(0)?),
        sync_config_id: uuid_from_sql(row.get(1)?),
        direction: enum_from_sql(&row.get::<_, String>(2)?)?,
        trigger: enum_from_sql(&row.get::<_, String>(3)?)?,
        status: enum_from_sql(&row.get::<_, String>(4)?)?,
        started_at: ts_from_sql(&row.get::<_, String>(5)?),
        completed_at: opt_ts_from_sql(row.get(6)?),
        items_created: row.get(7)?,
        items_updated: row.get(8)?,
        items_synced: row.get(9)?,
        items_failed: row.get(10)?,
        conflicts_detected: row.get(11)?,
        conflicts_resolved: row.get(12)?,
        error_message: row.get(13)?,
        logs: from_json_text(&row.get::<_, String>(14)?)?,
    })
}

fn webhook_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Webhook> {
    let event_types: String = row.get(7)?;
    Ok(Webhook {
        id: uuid_from_sql(row.get(0)?),
        name: row.get(1)?,
        sync_config_id: uuid_from_sql(row.get(2)?),
        connector_id: opt_uuid_from_sql(row.get(3)?),
        token: row.get(4)?,
        secret: row.get(5)?,
        active: row.get(6)?,
        event_types: from_json_text(&event_types)?,
        trigger_count: row.get(8)?,
        last_triggered_at: opt_ts_from_sql(row.get(9)?),
        created_at: ts_from_sql(&row.get::<_, String>(10)?),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn connector(name: &str) -> ConnectorRecord {
        ConnectorRecord::new(name, "memory", "https://example.test", AuthKind::Pat, "00")
    }

    async fn seed_pair(store: &Store) -> (ConnectorRecord, ConnectorRecord, SyncConfig) {
        let a = connector("source");
        let b = connector("target");
        store.insert_connector(&a).await.unwrap();
        store.insert_connector(&b).await.unwrap();
        let cfg = SyncConfig::new("pair", a.id, b.id);
        store.insert_sync_config(&cfg).await.unwrap();
        (a, b, cfg)
    }

    #[test]
    fn unknown_enum_text_surfaces_as_store_error_not_a_panic() {
        let err = enum_from_sql::<AuthKind>("carrier-pigeon").unwrap_err();
        assert!(matches!(
            err,
            rusqlite::Error::FromSqlConversionFailure(..)
        ));
        let ws: crate::error::WsError = err.into();
        assert!(matches!(ws, crate::error::WsError::Store(_)));
    }

    #[test]
    fn enum_columns_roundtrip_through_bare_wire_names() {
        let text = enum_to_sql(&ConflictStrategy::LastWriteWins).unwrap();
        assert_eq!(text, "last-write-wins");
        let back: ConflictStrategy = enum_from_sql(&text).unwrap();
        assert_eq!(back, ConflictStrategy::LastWriteWins);
    }

    #[tokio::test]
    async fn connector_roundtrip() {
        let store = store().await;
        let rec = connector("ado-prod");
        store.insert_connector(&rec).await.unwrap();

        let loaded = store.get_connector(rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "ado-prod");
        assert_eq!(loaded.auth_kind, AuthKind::Pat);
        assert!(loaded.active);
        assert_eq!(store.list_connectors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn connector_delete_cascades_to_configs_and_items() {
        let store = store().await;
        let (a, _b, cfg) = seed_pair(&store).await;

        let item = SyncedItem {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            source_connector_id: cfg.source_connector_id,
            target_connector_id: cfg.target_connector_id,
            source_item_id: "A-1".into(),
            target_item_id: "B-7".into(),
            source_item_type: Some("Task".into()),
            target_item_type: Some("Task".into()),
            first_synced_at: Utc::now(),
            last_synced_at: Utc::now(),
            sync_count: 1,
            status: SyncedStatus::Synced,
        };
        store.insert_synced_item(&item).await.unwrap();

        store.delete_connector(a.id).await.unwrap();
        assert!(store.get_sync_config(cfg.id).await.unwrap().is_none());
        assert_eq!(store.count_synced_items(cfg.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn synced_item_identity_is_unique() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;

        let mut item = SyncedItem {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            source_connector_id: cfg.source_connector_id,
            target_connector_id: cfg.target_connector_id,
            source_item_id: "A-1".into(),
            target_item_id: "B-7".into(),
            source_item_type: None,
            target_item_type: None,
            first_synced_at: Utc::now(),
            last_synced_at: Utc::now(),
            sync_count: 1,
            status: SyncedStatus::Synced,
        };
        store.insert_synced_item(&item).await.unwrap();

        item.id = Uuid::new_v4();
        item.target_item_id = "B-8".into();
        let dup = store.insert_synced_item(&item).await;
        assert!(dup.is_err(), "duplicate identity must be rejected");
    }

    #[tokio::test]
    async fn version_numbers_are_monotonic_without_gaps() {
        let store = store().await;
        let (a, _b, cfg) = seed_pair(&store).await;

        for expected in 1..=5i64 {
            let v = store
                .insert_version(
                    cfg.id,
                    a.id,
                    "A-1",
                    None,
                    None,
                    None,
                    serde_json::json!({"title": format!("rev {expected}")}),
                    format!("hash-{expected}"),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(v.version, expected);
        }

        let latest = store.latest_version(cfg.id, a.id, "A-1").await.unwrap().unwrap();
        assert_eq!(latest.version, 5);
        assert_eq!(latest.hash, "hash-5");
        assert_eq!(store.count_versions(cfg.id, a.id, "A-1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn touch_synced_item_bumps_count() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;
        let item = SyncedItem {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            source_connector_id: cfg.source_connector_id,
            target_connector_id: cfg.target_connector_id,
            source_item_id: "A-1".into(),
            target_item_id: "B-7".into(),
            source_item_type: None,
            target_item_type: None,
            first_synced_at: Utc::now(),
            last_synced_at: Utc::now(),
            sync_count: 1,
            status: SyncedStatus::Synced,
        };
        store.insert_synced_item(&item).await.unwrap();
        store.touch_synced_item(item.id, SyncedStatus::Synced).await.unwrap();

        let loaded = store
            .get_synced_item(cfg.id, cfg.source_connector_id, "A-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.sync_count, 2);
    }

    #[tokio::test]
    async fn discovered_metadata_upserts_by_natural_keys() {
        let store = store().await;
        let rec = connector("ado");
        store.insert_connector(&rec).await.unwrap();

        let ty = DiscoveredType {
            type_name: "Task".into(),
            type_id: "task".into(),
            fields: vec![DiscoveredField {
                reference_name: "title".into(),
                display_name: "Title".into(),
                data_type: FieldDataType::String,
                required: true,
                read_only: false,
                allowed_values: vec![],
                default_value: None,
                suggestion_score: 80,
            }],
            statuses: vec![DiscoveredStatus {
                name: "New".into(),
                value: "new".into(),
                category: StatusCategory::Proposed,
                sort_order: 0,
            }],
        };
        store
            .save_discovered_metadata(rec.id, vec![ty.clone()])
            .await
            .unwrap();
        // Second discovery run must upsert, not duplicate.
        store.save_discovered_metadata(rec.id, vec![ty]).await.unwrap();

        let types = store.list_types(rec.id).await.unwrap();
        assert_eq!(types.len(), 1);
        let fields = store.list_fields(types[0].id).await.unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].suggestion_score, 80);
        let statuses = store.list_statuses(types[0].id).await.unwrap();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn mapping_bundle_resolves_names() {
        let store = store().await;
        let (a, b, cfg) = seed_pair(&store).await;

        for (conn_id, type_name, field_ref, status) in [
            (a.id, "Task", "title", ("New", "new")),
            (b.id, "Task", "title", ("Open", "open")),
        ] {
            store
                .save_discovered_metadata(
                    conn_id,
                    vec![DiscoveredType {
                        type_name: type_name.into(),
                        type_id: type_name.to_lowercase(),
                        fields: vec![DiscoveredField {
                            reference_name: field_ref.into(),
                            display_name: "Title".into(),
                            data_type: FieldDataType::String,
                            required: false,
                            read_only: false,
                            allowed_values: vec![],
                            default_value: None,
                            suggestion_score: 50,
                        }],
                        statuses: vec![DiscoveredStatus {
                            name: status.0.into(),
                            value: status.1.into(),
                            category: StatusCategory::Proposed,
                            sort_order: 0,
                        }],
                    }],
                )
                .await
                .unwrap();
        }

        let src_type = &store.list_types(a.id).await.unwrap()[0];
        let tgt_type = &store.list_types(b.id).await.unwrap()[0];
        let src_field = &store.list_fields(src_type.id).await.unwrap()[0];
        let tgt_field = &store.list_fields(tgt_type.id).await.unwrap()[0];
        let src_status = &store.list_statuses(src_type.id).await.unwrap()[0];
        let tgt_status = &store.list_statuses(tgt_type.id).await.unwrap()[0];

        let tm = TypeMapping {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            source_type_id: src_type.id,
            target_type_id: tgt_type.id,
            active: true,
        };
        store.insert_type_mapping(&tm).await.unwrap();
        store
            .insert_field_mapping(&FieldMapping {
                id: Uuid::new_v4(),
                type_mapping_id: tm.id,
                source_field_id: Some(src_field.id),
                target_field_id: Some(tgt_field.id),
                mapping_kind: MappingKind::Direct,
                constant_value: None,
                transformation: None,
                reverse_transformation: None,
                required: false,
            })
            .await
            .unwrap();
        store
            .insert_status_mapping(&StatusMapping {
                id: Uuid::new_v4(),
                type_mapping_id: tm.id,
                source_status_id: src_status.id,
                target_status_id: tgt_status.id,
            })
            .await
            .unwrap();

        let bundle = store.load_mapping_bundle(cfg.id).await.unwrap();
        assert_eq!(bundle.type_mappings.len(), 1);
        let resolved = &bundle.type_mappings[0];
        assert_eq!(resolved.source_type_name, "Task");
        assert_eq!(resolved.target_type_name, "Task");
        assert_eq!(resolved.fields[0].source_ref.as_deref(), Some("title"));
        assert_eq!(resolved.statuses[0].source_name, "New");
        assert_eq!(resolved.statuses[0].target_name, "Open");
        assert!(bundle.for_source_type("Task").is_some());
        assert!(bundle.for_source_type("Bug").is_none());
    }

    #[tokio::test]
    async fn webhook_delivery_bumps_trigger_count_atomically() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;

        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: "inbound".into(),
            sync_config_id: cfg.id,
            connector_id: None,
            token: "tok123".into(),
            secret: "whsec".into(),
            active: true,
            event_types: vec!["updated".into()],
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        };
        store.insert_webhook(&webhook).await.unwrap();

        let accepted = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            signature_valid: true,
            status: DeliveryStatus::Accepted,
            payload: serde_json::json!({"event": "updated"}),
            headers: serde_json::json!({}),
            received_at: Utc::now(),
        };
        store.record_delivery(&accepted, true).await.unwrap();

        let rejected = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            signature_valid: false,
            status: DeliveryStatus::Rejected,
            payload: serde_json::json!({}),
            headers: serde_json::json!({}),
            received_at: Utc::now(),
        };
        store.record_delivery(&rejected, false).await.unwrap();

        let loaded = store.get_webhook_by_token("tok123").await.unwrap().unwrap();
        assert_eq!(loaded.trigger_count, 1);
        assert!(loaded.last_triggered_at.is_some());
        assert_eq!(store.list_deliveries(webhook.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn conflicts_roundtrip_and_filter_by_status() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;

        let conflict = SyncConflict {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            execution_id: None,
            source_work_item_id: "A-1".into(),
            target_work_item_id: "B-7".into(),
            work_item_type: Some("Task".into()),
            kind: ConflictKind::FieldConflict,
            field_name: Some("title".into()),
            source_value: Some(serde_json::json!("S")),
            target_value: Some(serde_json::json!("T")),
            base_value: Some(serde_json::json!("Hello")),
            status: ConflictStatus::Unresolved,
            resolution_strategy: None,
            resolved_value: None,
            resolved_by: None,
            resolved_at: None,
            metadata: serde_json::json!({}),
            detected_at: Utc::now(),
        };
        store.insert_conflicts(&[conflict.clone()]).await.unwrap();

        let unresolved = store
            .list_conflicts(cfg.id, Some(ConflictStatus::Unresolved))
            .await
            .unwrap();
        assert_eq!(unresolved.len(), 1);

        let mut resolved = conflict;
        resolved.status = ConflictStatus::Resolved;
        resolved.resolution_strategy = Some(ConflictStrategy::LastWriteWins);
        resolved.resolved_value = Some(serde_json::json!("S"));
        resolved.resolved_by = Some("system".into());
        resolved.resolved_at = Some(Utc::now());
        store.update_conflict_resolution(&resolved).await.unwrap();

        assert!(store
            .list_conflicts(cfg.id, Some(ConflictStatus::Unresolved))
            .await
            .unwrap()
            .is_empty());
        let loaded = store.get_conflict(resolved.id).await.unwrap().unwrap();
        assert_eq!(loaded.resolution_strategy, Some(ConflictStrategy::LastWriteWins));
        assert_eq!(loaded.resolved_value, Some(serde_json::json!("S")));
    }

    #[tokio::test]
    async fn execution_summary_roundtrip() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;

        let mut exec = SyncExecution::start(
            cfg.id,
            SyncDirection::SourceToTarget,
            ExecutionTrigger::Manual,
        );
        store.insert_execution(&exec).await.unwrap();

        exec.status = ExecutionStatus::Completed;
        exec.completed_at = Some(Utc::now());
        exec.items_created = 1;
        exec.items_synced = 1;
        exec.logs = serde_json::json!([{"level": "info", "message": "done"}]);
        store.update_execution(&exec).await.unwrap();

        let loaded = store.get_execution(exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.items_created, 1);
        assert_eq!(loaded.logs[0]["message"], "done");
        assert_eq!(store.list_executions(cfg.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_links_listed_per_config_and_promoted() {
        let store = store().await;
        let (_a, _b, cfg) = seed_pair(&store).await;
        let item = SyncedItem {
            id: Uuid::new_v4(),
            sync_config_id: cfg.id,
            source_connector_id: cfg.source_connector_id,
            target_connector_id: cfg.target_connector_id,
            source_item_id: "A-1".into(),
            target_item_id: "B-7".into(),
            source_item_type: None,
            target_item_type: None,
            first_synced_at: Utc::now(),
            last_synced_at: Utc::now(),
            sync_count: 1,
            status: SyncedStatus::Synced,
        };
        store.insert_synced_item(&item).await.unwrap();

        let link = SyncedLink {
            id: Uuid::new_v4(),
            synced_item_id: item.id,
            source_linked_item_id: "A-2".into(),
            target_linked_item_id: None,
            relation_type: "related".into(),
            status: SyncedStatus::Pending,
            created_at: Utc::now(),
        };
        store.insert_synced_link(&link).await.unwrap();
        // Duplicate insert is ignored, not an error.
        store.insert_synced_link(&link).await.unwrap();

        let pending = store.list_pending_links(cfg.id).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_link_synced(link.id, "B-9").await.unwrap();
        assert!(store.list_pending_links(cfg.id).await.unwrap().is_empty());
        let links = store.list_synced_links(item.id).await.unwrap();
        assert_eq!(links[0].target_linked_item_id.as_deref(), Some("B-9"));
        assert_eq!(links[0].status, SyncedStatus::Synced);
    }
}
