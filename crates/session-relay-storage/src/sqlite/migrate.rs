//! Schema detection and migration for the SQLite backend.
//!
//! The layout version is read off the live columns of `sessions` rather than
//! a stored counter, so an install left half-way through an older upgrade is
//! still recognised. Known legacy shapes:
//!
//! - per-column metadata: `name`, `tags`, `modelProvider`, `modelId`,
//!   `modelConfiguredAt`
//! - `workingDirectory` instead of (or next to) `workspace`
//! - no `metadata` column
//! - `id` without a primary key
//!
//! Everything runs in one transaction on one connection with foreign keys
//! switched off, so a transiently dropped `sessions` table never cascades
//! into `events`.

use std::collections::HashSet;

use serde_json::{Map, Value, json};
use session_relay_core::{
    StorageError,
    session::{META_MODEL_CONFIG, META_NAME, META_TAGS, META_VERSION, METADATA_VERSION},
};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};
use tracing::{debug, error, info, warn};

const SESSIONS_DDL: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    createdAt INTEGER NOT NULL,
    updatedAt INTEGER NOT NULL,
    workspace TEXT NOT NULL,
    metadata TEXT
)";

const EVENTS_DDL: &str = r"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sessionId TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    eventData TEXT NOT NULL,
    FOREIGN KEY (sessionId) REFERENCES sessions (id) ON DELETE CASCADE
)";

const EVENTS_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_sessionId ON events (sessionId)";

/// Per-column metadata from the first layout.
const LEGACY_METADATA_COLUMNS: [&str; 5] =
    ["name", "tags", "modelProvider", "modelId", "modelConfiguredAt"];

const LEGACY_WORKSPACE_COLUMN: &str = "workingDirectory";

const REQUIRED_EVENT_COLUMNS: [&str; 3] = ["sessionId", "timestamp", "eventData"];

/// What `initialize` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No tables existed; current layout created.
    Created,
    /// Layout already current.
    UpToDate,
    /// Legacy layout converted.
    Migrated { sessions: i64, events: i64 },
}

#[derive(Debug, Default)]
struct Columns {
    names: HashSet<String>,
    id_is_pk: bool,
    indexed: HashSet<String>,
}

impl Columns {
    fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn legacy_metadata(&self) -> Vec<&'static str> {
        LEGACY_METADATA_COLUMNS
            .into_iter()
            .filter(|c| self.has(c))
            .collect()
    }
}

/// Steps needed to bring a legacy `sessions` table to the current layout.
#[derive(Debug, Default, PartialEq, Eq)]
struct MigrationPlan {
    rename_working_directory: bool,
    add_metadata: bool,
    /// Columns whose content is folded elsewhere and then dropped.
    drop_columns: Vec<&'static str>,
    /// No additive path exists; rebuild the table by explicit copy.
    recreate: bool,
}

impl MigrationPlan {
    fn from_columns(cols: &Columns) -> Self {
        let legacy = cols.legacy_metadata();
        let has_workspace = cols.has("workspace");
        let has_working_dir = cols.has(LEGACY_WORKSPACE_COLUMN);

        let mut drop_columns = legacy;
        if has_working_dir && has_workspace {
            drop_columns.push(LEGACY_WORKSPACE_COLUMN);
        }

        let drops_indexed = drop_columns.iter().any(|c| cols.indexed.contains(*c));

        Self {
            rename_working_directory: has_working_dir && !has_workspace,
            add_metadata: !cols.has("metadata"),
            drop_columns,
            recreate: !cols.id_is_pk || drops_indexed,
        }
    }

    fn is_noop(&self) -> bool {
        !self.rename_working_directory
            && !self.add_metadata
            && self.drop_columns.is_empty()
            && !self.recreate
    }
}

/// Legacy values read from one row.
#[derive(Debug, Default)]
struct LegacyFields {
    name: Option<String>,
    tags: Option<String>,
    model_provider: Option<String>,
    model_id: Option<String>,
    model_configured_at: Option<i64>,
}

/// A session row in the current layout.
#[derive(Debug)]
struct MigratedRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    workspace: String,
    metadata: String,
}

fn migration_err(context: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Migration(format!("{context}: {e}"))
}

/// Merge legacy columns into a metadata object.
///
/// Keys already present in `existing` win, so re-running over a partially
/// migrated row never overwrites newer data.
fn fold_metadata(existing: Option<&str>, legacy: &LegacyFields, updated_at: i64) -> Map<String, Value> {
    let mut metadata = existing
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    if let Some(name) = legacy.name.as_deref().filter(|n| !n.is_empty()) {
        metadata.entry(META_NAME).or_insert_with(|| json!(name));
    }

    if let Some(raw) = legacy.tags.as_deref().filter(|t| !t.trim().is_empty()) {
        let tags = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => Value::Array(items),
            _ => Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(|t| json!(t))
                    .collect(),
            ),
        };
        metadata.entry(META_TAGS).or_insert(tags);
    }

    if let (Some(provider), Some(model_id)) = (&legacy.model_provider, &legacy.model_id) {
        metadata.entry(META_MODEL_CONFIG).or_insert_with(|| {
            json!({
                "provider": provider,
                "modelId": model_id,
                "configuredAt": legacy.model_configured_at.unwrap_or(updated_at),
            })
        });
    }

    metadata
        .entry(META_VERSION)
        .or_insert_with(|| json!(METADATA_VERSION));
    metadata
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

async fn introspect(conn: &mut SqliteConnection, table: &str) -> Result<Columns, sqlx::Error> {
    let mut cols = Columns::default();

    let rows = sqlx::query("SELECT name, pk FROM pragma_table_info(?1)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
    for row in rows {
        let name: String = row.try_get("name")?;
        let pk: i64 = row.try_get("pk")?;
        if name == "id" && pk > 0 {
            cols.id_is_pk = true;
        }
        cols.names.insert(name);
    }

    let indexed = sqlx::query(
        "SELECT DISTINCT ii.name AS name \
         FROM pragma_index_list(?1) AS il, pragma_index_info(il.name) AS ii",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    for row in indexed {
        let name: Option<String> = row.try_get("name")?;
        cols.indexed.extend(name);
    }

    Ok(cols)
}

async fn count_rows(conn: &mut SqliteConnection, table: &str) -> Result<i64, sqlx::Error> {
    if !table_exists(conn, table).await? {
        return Ok(0);
    }
    let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
    sqlx::query_scalar(&sql).fetch_one(&mut *conn).await
}

/// Events whose session row is missing. Legacy installs that predate
/// foreign-key enforcement can hold these.
async fn count_orphan_events(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    if !table_exists(conn, "events").await? || !introspect(conn, "events").await?.has("sessionId") {
        return Ok(0);
    }
    if !table_exists(conn, "sessions").await? {
        return count_rows(conn, "events").await;
    }
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM events e \
         WHERE NOT EXISTS (SELECT 1 FROM sessions s WHERE s.id = e.sessionId)",
    )
    .fetch_one(&mut *conn)
    .await
}

/// Read every session row, converting it to the current layout.
async fn read_rows(
    conn: &mut SqliteConnection,
    cols: &Columns,
) -> Result<Vec<MigratedRow>, StorageError> {
    let workspace = match (cols.has("workspace"), cols.has(LEGACY_WORKSPACE_COLUMN)) {
        (true, true) => "COALESCE(NULLIF(CAST(workspace AS TEXT), ''), CAST(workingDirectory AS TEXT))",
        (true, false) => "CAST(workspace AS TEXT)",
        (false, true) => "CAST(workingDirectory AS TEXT)",
        (false, false) => "''",
    };
    let created = if cols.has("createdAt") { "CAST(createdAt AS INTEGER)" } else { "0" };
    let updated = if cols.has("updatedAt") { "CAST(updatedAt AS INTEGER)" } else { "NULL" };
    let metadata = if cols.has("metadata") { "CAST(metadata AS TEXT)" } else { "NULL" };

    let mut select = format!(
        "SELECT CAST(id AS TEXT) AS id, {created} AS createdAt, {updated} AS updatedAt, \
         {workspace} AS workspace, {metadata} AS metadata"
    );
    for col in cols.legacy_metadata() {
        let ty = if col == "modelConfiguredAt" { "INTEGER" } else { "TEXT" };
        select.push_str(&format!(", CAST(\"{col}\" AS {ty}) AS \"legacy_{col}\""));
    }
    select.push_str(" FROM sessions");

    let rows = sqlx::query(&select)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| migration_err("reading sessions", e))?;

    let text = |row: &sqlx::sqlite::SqliteRow, col: &str| -> Result<Option<String>, StorageError> {
        if cols.has(col) {
            row.try_get(format!("legacy_{col}").as_str())
                .map_err(|e| migration_err("reading legacy column", e))
        } else {
            Ok(None)
        }
    };

    let mut migrated = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: Option<String> = row.try_get("id").map_err(|e| migration_err("reading id", e))?;
        let id = id.ok_or_else(|| StorageError::Migration("session row without id".into()))?;
        let created_at: Option<i64> = row
            .try_get("createdAt")
            .map_err(|e| migration_err("reading createdAt", e))?;
        let created_at = created_at.unwrap_or(0);
        let updated_at: Option<i64> = row
            .try_get("updatedAt")
            .map_err(|e| migration_err("reading updatedAt", e))?;
        let updated_at = updated_at.unwrap_or(created_at).max(created_at);
        let workspace: Option<String> = row
            .try_get("workspace")
            .map_err(|e| migration_err("reading workspace", e))?;
        let existing: Option<String> = row
            .try_get("metadata")
            .map_err(|e| migration_err("reading metadata", e))?;

        let legacy = LegacyFields {
            name: text(row, "name")?,
            tags: text(row, "tags")?,
            model_provider: text(row, "modelProvider")?,
            model_id: text(row, "modelId")?,
            model_configured_at: if cols.has("modelConfiguredAt") {
                row.try_get("legacy_modelConfiguredAt")
                    .map_err(|e| migration_err("reading legacy column", e))?
            } else {
                None
            },
        };

        let metadata = fold_metadata(existing.as_deref(), &legacy, updated_at);
        migrated.push(MigratedRow {
            id,
            created_at,
            updated_at,
            workspace: workspace.unwrap_or_default(),
            metadata: Value::Object(metadata).to_string(),
        });
    }
    Ok(migrated)
}

async fn exec(conn: &mut SqliteConnection, sql: &str) -> Result<(), StorageError> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map(|_| ())
        .map_err(|e| migration_err(sql.trim(), e))
}

/// Alter `sessions` in place: rename, add, fold, drop.
async fn migrate_additive(
    conn: &mut SqliteConnection,
    plan: &MigrationPlan,
) -> Result<(), StorageError> {
    if plan.rename_working_directory {
        debug!("Renaming sessions.workingDirectory to workspace");
        exec(conn, "ALTER TABLE sessions RENAME COLUMN workingDirectory TO workspace").await?;
    }
    if plan.add_metadata {
        debug!("Adding sessions.metadata");
        exec(conn, "ALTER TABLE sessions ADD COLUMN metadata TEXT").await?;
    }

    let cols = introspect(conn, "sessions")
        .await
        .map_err(|e| migration_err("introspecting sessions", e))?;
    for row in read_rows(conn, &cols).await? {
        sqlx::query("UPDATE sessions SET workspace = ?1, metadata = ?2 WHERE id = ?3")
            .bind(&row.workspace)
            .bind(&row.metadata)
            .bind(&row.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| migration_err("folding legacy metadata", e))?;
    }

    for col in &plan.drop_columns {
        debug!(column = col, "Dropping legacy sessions column");
        exec(conn, &format!("ALTER TABLE sessions DROP COLUMN \"{col}\"")).await?;
    }
    Ok(())
}

/// Rebuild `sessions` by copying rows out and back in.
///
/// Only used when the table cannot be altered in place. No table renames
/// are involved, so the `events` foreign key keeps pointing at `sessions`.
async fn migrate_recreate(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let cols = introspect(conn, "sessions")
        .await
        .map_err(|e| migration_err("introspecting sessions", e))?;
    let rows = read_rows(conn, &cols).await?;
    debug!(rows = rows.len(), "Recreating sessions table");

    exec(conn, "DROP TABLE sessions").await?;
    exec(conn, SESSIONS_DDL).await?;
    for row in rows {
        sqlx::query(
            "INSERT INTO sessions (id, createdAt, updatedAt, workspace, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&row.id)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(&row.workspace)
        .bind(&row.metadata)
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_err(&format!("copying session {}", row.id), e))?;
    }
    Ok(())
}

async fn ensure_events(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    if table_exists(conn, "events")
        .await
        .map_err(|e| migration_err("checking events", e))?
    {
        let cols = introspect(conn, "events")
            .await
            .map_err(|e| migration_err("introspecting events", e))?;
        if let Some(missing) = REQUIRED_EVENT_COLUMNS.iter().find(|c| !cols.has(c)) {
            return Err(StorageError::Migration(format!(
                "events table has an unsupported layout (missing {missing})"
            )));
        }
    }
    exec(conn, EVENTS_DDL).await?;
    exec(conn, EVENTS_INDEX_DDL).await
}

async fn run_plan(conn: &mut SqliteConnection, plan: &MigrationPlan) -> Result<(i64, i64), StorageError> {
    let sessions_before = count_rows(conn, "sessions")
        .await
        .map_err(|e| migration_err("counting sessions", e))?;
    let events_before = count_rows(conn, "events")
        .await
        .map_err(|e| migration_err("counting events", e))?;
    let orphans_before = count_orphan_events(conn)
        .await
        .map_err(|e| migration_err("counting orphan events", e))?;
    info!(
        sessions = sessions_before,
        events = events_before,
        ?plan,
        "Migrating legacy session schema"
    );

    if plan.recreate {
        migrate_recreate(conn).await?;
    } else {
        migrate_additive(conn, plan).await?;
    }
    ensure_events(conn).await?;

    let sessions_after = count_rows(conn, "sessions")
        .await
        .map_err(|e| migration_err("counting sessions", e))?;
    let events_after = count_rows(conn, "events")
        .await
        .map_err(|e| migration_err("counting events", e))?;
    if sessions_after != sessions_before || events_after != events_before {
        return Err(StorageError::Migration(format!(
            "row count changed during migration: sessions {sessions_before} -> {sessions_after}, \
             events {events_before} -> {events_after}"
        )));
    }

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| migration_err("foreign key check", e))?;
    let violations = i64::try_from(violations.len()).unwrap_or(i64::MAX);
    if violations > orphans_before {
        return Err(StorageError::Migration(format!(
            "{violations} foreign key violations after migration ({orphans_before} pre-existing)"
        )));
    }
    if orphans_before > 0 {
        warn!(
            orphans = orphans_before,
            "Legacy database holds events without a session; kept as they were"
        );
    }

    Ok((sessions_after, events_after))
}

async fn set_foreign_keys(conn: &mut SqliteConnection, on: bool) -> Result<(), sqlx::Error> {
    let sql = if on { "PRAGMA foreign_keys = ON" } else { "PRAGMA foreign_keys = OFF" };
    sqlx::query(sql).execute(&mut *conn).await.map(|_| ())
}

async fn run_in_transaction(
    conn: &mut SqliteConnection,
    plan: &MigrationPlan,
) -> Result<MigrationOutcome, StorageError> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| migration_err("beginning transaction", e))?;
    match run_plan(&mut tx, plan).await {
        Ok((sessions, events)) => {
            tx.commit()
                .await
                .map_err(|e| migration_err("committing migration", e))?;
            Ok(MigrationOutcome::Migrated { sessions, events })
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                error!(error = %rollback, "Failed to roll back schema migration");
            }
            Err(e)
        }
    }
}

async fn migrate_legacy(
    conn: &mut SqliteConnection,
    plan: &MigrationPlan,
) -> Result<MigrationOutcome, StorageError> {
    // Must happen outside the transaction; SQLite ignores it inside one.
    set_foreign_keys(conn, false)
        .await
        .map_err(|e| migration_err("disabling foreign keys", e))?;

    let result = run_in_transaction(conn, plan).await;

    if let Err(e) = set_foreign_keys(conn, true).await {
        error!(error = %e, "Failed to re-enable foreign keys after migration");
    }
    result
}

async fn create_fresh(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| migration_err("beginning transaction", e))?;
    exec(&mut tx, SESSIONS_DDL).await?;
    exec(&mut tx, EVENTS_DDL).await?;
    exec(&mut tx, EVENTS_INDEX_DDL).await?;
    tx.commit()
        .await
        .map_err(|e| migration_err("committing schema", e))
}

/// Bring the database at `pool` to the current layout.
///
/// Safe to call repeatedly. Any failure leaves the database as it was.
pub async fn migrate(pool: &SqlitePool) -> Result<MigrationOutcome, StorageError> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| migration_err("acquiring connection", e))?;

    let cols = introspect(&mut conn, "sessions")
        .await
        .map_err(|e| migration_err("introspecting sessions", e))?;

    if cols.is_empty() {
        create_fresh(&mut conn).await?;
        info!("Created session schema");
        return Ok(MigrationOutcome::Created);
    }

    let plan = MigrationPlan::from_columns(&cols);
    if plan.is_noop() {
        // Tables and index may still be missing after an interrupted create.
        ensure_events(&mut conn).await?;
        return Ok(MigrationOutcome::UpToDate);
    }

    let outcome = migrate_legacy(&mut conn, &plan).await;
    match &outcome {
        Ok(MigrationOutcome::Migrated { sessions, events }) => {
            info!(sessions, events, "Session schema migrated");
        }
        Err(e) => warn!(error = %e, "Session schema migration aborted"),
        Ok(_) => {}
    }
    outcome
}
