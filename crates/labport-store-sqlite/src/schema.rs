use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

use crate::now_rfc3339;

pub const LATEST_SCHEMA_VERSION: i64 = 2;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS installation (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  installation_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS labs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  lab_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (lab_id) REFERENCES labs(id)
);

CREATE TABLE IF NOT EXISTS ontology_terms (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ontology TEXT NOT NULL,
  accession TEXT NOT NULL,
  label TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instruments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lab_id INTEGER NOT NULL,
  owner_user_id INTEGER,
  visibility TEXT NOT NULL DEFAULT 'lab' CHECK (visibility IN ('private','lab','public')),
  name TEXT NOT NULL,
  location TEXT,
  hourly_rate_cents INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (lab_id) REFERENCES labs(id),
  FOREIGN KEY (owner_user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS protocols (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lab_id INTEGER NOT NULL,
  owner_user_id INTEGER,
  visibility TEXT NOT NULL DEFAULT 'lab' CHECK (visibility IN ('private','lab','public')),
  name TEXT NOT NULL,
  description TEXT,
  version INTEGER NOT NULL DEFAULT 1,
  ontology_term_id INTEGER,
  FOREIGN KEY (lab_id) REFERENCES labs(id),
  FOREIGN KEY (owner_user_id) REFERENCES users(id),
  FOREIGN KEY (ontology_term_id) REFERENCES ontology_terms(id)
);

CREATE TABLE IF NOT EXISTS protocol_steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  protocol_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  instruction TEXT NOT NULL,
  branch_from_step_id INTEGER,
  FOREIGN KEY (protocol_id) REFERENCES protocols(id),
  FOREIGN KEY (branch_from_step_id) REFERENCES protocol_steps(id)
);

CREATE TABLE IF NOT EXISTS sample_pools (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lab_id INTEGER NOT NULL,
  owner_user_id INTEGER,
  visibility TEXT NOT NULL DEFAULT 'lab' CHECK (visibility IN ('private','lab','public')),
  name TEXT NOT NULL,
  description TEXT,
  parent_pool_id INTEGER,
  FOREIGN KEY (lab_id) REFERENCES labs(id),
  FOREIGN KEY (owner_user_id) REFERENCES users(id),
  FOREIGN KEY (parent_pool_id) REFERENCES sample_pools(id)
);

CREATE TABLE IF NOT EXISTS sessions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  lab_id INTEGER NOT NULL,
  owner_user_id INTEGER,
  visibility TEXT NOT NULL DEFAULT 'lab' CHECK (visibility IN ('private','lab','public')),
  protocol_id INTEGER,
  title TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  notes TEXT,
  FOREIGN KEY (lab_id) REFERENCES labs(id),
  FOREIGN KEY (owner_user_id) REFERENCES users(id),
  FOREIGN KEY (protocol_id) REFERENCES protocols(id)
);

CREATE TABLE IF NOT EXISTS annotations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  session_id INTEGER NOT NULL,
  protocol_step_id INTEGER,
  body TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (session_id) REFERENCES sessions(id),
  FOREIGN KEY (protocol_step_id) REFERENCES protocol_steps(id)
);

CREATE TABLE IF NOT EXISTS bookings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  instrument_id INTEGER NOT NULL,
  session_id INTEGER,
  starts_at TEXT NOT NULL,
  ends_at TEXT NOT NULL,
  cancelled INTEGER NOT NULL DEFAULT 0 CHECK (cancelled IN (0, 1)),
  FOREIGN KEY (instrument_id) REFERENCES instruments(id),
  FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS billing_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  booking_id INTEGER NOT NULL,
  amount_cents INTEGER NOT NULL,
  currency TEXT NOT NULL,
  description TEXT,
  FOREIGN KEY (booking_id) REFERENCES bookings(id)
);

CREATE TABLE IF NOT EXISTS session_sample_pools (
  session_id INTEGER NOT NULL,
  sample_pool_id INTEGER NOT NULL,
  PRIMARY KEY (session_id, sample_pool_id),
  FOREIGN KEY (session_id) REFERENCES sessions(id),
  FOREIGN KEY (sample_pool_id) REFERENCES sample_pools(id)
);

CREATE TABLE IF NOT EXISTS annotation_terms (
  annotation_id INTEGER NOT NULL,
  ontology_term_id INTEGER NOT NULL,
  PRIMARY KEY (annotation_id, ontology_term_id),
  FOREIGN KEY (annotation_id) REFERENCES annotations(id),
  FOREIGN KEY (ontology_term_id) REFERENCES ontology_terms(id)
);

CREATE TABLE IF NOT EXISTS attachments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_class TEXT NOT NULL,
  owner_id INTEGER NOT NULL,
  field TEXT NOT NULL,
  file_name TEXT NOT NULL,
  stored_path TEXT NOT NULL UNIQUE,
  byte_size INTEGER NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_protocol_steps_protocol ON protocol_steps(protocol_id);
CREATE INDEX IF NOT EXISTS idx_annotations_session ON annotations(session_id);
CREATE INDEX IF NOT EXISTS idx_bookings_instrument ON bookings(instrument_id);
CREATE INDEX IF NOT EXISTS idx_attachments_owner ON attachments(owner_class, owner_id);
";

pub(crate) const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS import_records (
  import_id TEXT PRIMARY KEY,
  user_id INTEGER NOT NULL,
  lab_id INTEGER NOT NULL,
  archive_name TEXT NOT NULL,
  archive_digest TEXT,
  source_installation TEXT,
  format_version INTEGER,
  status TEXT NOT NULL CHECK (status IN ('in-progress','completed','failed','reverted')),
  vaulted INTEGER NOT NULL CHECK (vaulted IN (0, 1)),
  revertible INTEGER NOT NULL DEFAULT 1 CHECK (revertible IN (0, 1)),
  objects_created INTEGER NOT NULL DEFAULT 0,
  files_copied INTEGER NOT NULL DEFAULT 0,
  relationships_created INTEGER NOT NULL DEFAULT 0,
  warnings INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  reverted_at TEXT,
  FOREIGN KEY (user_id) REFERENCES users(id),
  FOREIGN KEY (lab_id) REFERENCES labs(id)
);

CREATE TABLE IF NOT EXISTS import_objects (
  import_id TEXT NOT NULL,
  entity_class TEXT NOT NULL,
  source_id INTEGER NOT NULL,
  destination_id INTEGER NOT NULL,
  PRIMARY KEY (import_id, entity_class, source_id),
  FOREIGN KEY (import_id) REFERENCES import_records(import_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS import_files (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  import_id TEXT NOT NULL,
  attachment_id INTEGER NOT NULL,
  source_path TEXT NOT NULL,
  destination_path TEXT NOT NULL,
  byte_size INTEGER NOT NULL,
  FOREIGN KEY (import_id) REFERENCES import_records(import_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS import_relationships (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  import_id TEXT NOT NULL,
  relationship TEXT NOT NULL,
  left_id INTEGER NOT NULL,
  right_id INTEGER NOT NULL,
  FOREIGN KEY (import_id) REFERENCES import_records(import_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_import_records_lab_status ON import_records(lab_id, status);
CREATE INDEX IF NOT EXISTS idx_import_objects_destination ON import_objects(entity_class, destination_id);
";

pub(crate) const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

/// Whether `table_name` exists in the connected database.
///
/// # Errors
/// Returns an error when `sqlite_master` cannot be queried.
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

/// Whether `table` exists and has a column named `column`.
///
/// # Errors
/// Returns an error when table metadata cannot be inspected.
pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

/// Recorded version, or one inferred from table shape for databases created
/// before migrations were tracked.
pub(crate) fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "labs")? {
        return Ok((0, false));
    }

    if table_exists(conn, "import_records")? {
        return Ok((2, true));
    }

    if table_exists(conn, "sessions")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: labs exists without any entity tables"))
}

pub(crate) fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start migration v{version} transaction"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
    record_schema_version(&tx, version)?;
    tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    Ok(())
}

pub(crate) fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
