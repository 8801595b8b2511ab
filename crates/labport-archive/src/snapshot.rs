//! The relational snapshot embedded in every archive.
//!
//! Revision 1 is created from a base schema; every later revision is one
//! additive step on top of the previous one. A fresh snapshot at revision N
//! is therefore built by running the base schema and steps 2..=N, which keeps
//! freshly exported and migrated snapshots identical.

use std::path::Path;

use labport_core::{EntityClass, Relationship, RevisionDetection, LATEST_FORMAT_VERSION};
use labport_store_sqlite::{table_exists, table_has_column, EntityRow};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::ArchiveError;

const REVISION_1_SQL: &str = r"
CREATE TABLE ontology_terms (
  source_id INTEGER PRIMARY KEY,
  ontology TEXT NOT NULL,
  accession TEXT NOT NULL,
  label TEXT NOT NULL
);

CREATE TABLE instruments (
  source_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  location TEXT
);

CREATE TABLE protocols (
  source_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  version INTEGER NOT NULL DEFAULT 1,
  ontology_term_id INTEGER
);

CREATE TABLE protocol_steps (
  source_id INTEGER PRIMARY KEY,
  protocol_id INTEGER NOT NULL,
  position INTEGER NOT NULL,
  instruction TEXT NOT NULL
);

CREATE TABLE sessions (
  source_id INTEGER PRIMARY KEY,
  protocol_id INTEGER,
  title TEXT NOT NULL,
  started_at TEXT NOT NULL,
  notes TEXT
);

CREATE TABLE annotations (
  source_id INTEGER PRIMARY KEY,
  session_id INTEGER NOT NULL,
  protocol_step_id INTEGER,
  body TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE bookings (
  source_id INTEGER PRIMARY KEY,
  instrument_id INTEGER NOT NULL,
  session_id INTEGER,
  starts_at TEXT NOT NULL,
  ends_at TEXT NOT NULL
);

CREATE TABLE attachments (
  owner_class TEXT NOT NULL,
  owner_source_id INTEGER NOT NULL,
  field TEXT NOT NULL,
  file_name TEXT NOT NULL,
  media_path TEXT NOT NULL UNIQUE,
  byte_size INTEGER NOT NULL
);
";

const STEP_2_SQL: &str = r"
CREATE TABLE billing_entries (
  source_id INTEGER PRIMARY KEY,
  booking_id INTEGER NOT NULL,
  amount_cents INTEGER NOT NULL,
  currency TEXT NOT NULL,
  description TEXT
);
ALTER TABLE bookings ADD COLUMN cancelled INTEGER NOT NULL DEFAULT 0;
ALTER TABLE instruments ADD COLUMN hourly_rate_cents INTEGER NOT NULL DEFAULT 0;
";

const STEP_3_SQL: &str = r"
CREATE TABLE sample_pools (
  source_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT,
  parent_pool_id INTEGER,
  visibility TEXT NOT NULL DEFAULT 'lab'
);
CREATE TABLE session_sample_pools (
  session_id INTEGER NOT NULL,
  sample_pool_id INTEGER NOT NULL,
  PRIMARY KEY (session_id, sample_pool_id)
);
CREATE TABLE annotation_terms (
  annotation_id INTEGER NOT NULL,
  ontology_term_id INTEGER NOT NULL,
  PRIMARY KEY (annotation_id, ontology_term_id)
);
ALTER TABLE protocol_steps ADD COLUMN branch_from_step_id INTEGER;
ALTER TABLE instruments ADD COLUMN visibility TEXT NOT NULL DEFAULT 'lab';
ALTER TABLE protocols ADD COLUMN visibility TEXT NOT NULL DEFAULT 'lab';
ALTER TABLE sessions ADD COLUMN visibility TEXT NOT NULL DEFAULT 'lab';
";

const STEP_4_SQL: &str = r"
CREATE TABLE format_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
ALTER TABLE sessions ADD COLUMN ended_at TEXT;
INSERT OR REPLACE INTO format_meta(key, value) VALUES ('format_version', '4');
";

/// One forward step: applying `sql` to a revision `to - 1` snapshot yields revision `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionStep {
    pub to: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const REVISION_STEPS: [RevisionStep; 3] = [
    RevisionStep {
        to: 2,
        description: "add billing entries, booking cancellation, instrument hourly rates",
        sql: STEP_2_SQL,
    },
    RevisionStep {
        to: 3,
        description: "add sample pools, annotation terms, step branching, visibility",
        sql: STEP_3_SQL,
    },
    RevisionStep {
        to: 4,
        description: "add explicit format marker and session end times",
        sql: STEP_4_SQL,
    },
];

/// A table that must exist, or a column that must exist on a table.
type Marker = (&'static str, Option<&'static str>);

fn revision_markers(revision: u32) -> &'static [Marker] {
    match revision {
        1 => &[
            ("protocols", None),
            ("sessions", None),
            ("annotations", None),
            ("attachments", None),
        ],
        2 => &[("billing_entries", None), ("bookings", Some("cancelled"))],
        3 => &[("sample_pools", None), ("protocol_steps", Some("branch_from_step_id"))],
        4 => &[("sessions", Some("ended_at"))],
        _ => &[],
    }
}

/// A row read back from the snapshot: its original identifier plus every column.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub source_id: i64,
    pub values: EntityRow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAttachment {
    pub owner_class: EntityClass,
    pub owner_source_id: i64,
    pub field: String,
    pub file_name: String,
    pub media_path: String,
    pub byte_size: i64,
}

/// # Errors
/// Returns an error when the snapshot file cannot be opened.
pub fn open_snapshot(path: &Path) -> Result<Connection, ArchiveError> {
    if !path.is_file() {
        return Err(ArchiveError::Format(format!("snapshot {} does not exist", path.display())));
    }
    Ok(Connection::open(path)?)
}

/// Create a new snapshot file laid out at `revision`.
///
/// # Errors
/// Returns an error for unknown revisions or when the schema cannot be applied.
pub fn create_snapshot(path: &Path, revision: u32) -> Result<Connection, ArchiveError> {
    if revision == 0 || revision > LATEST_FORMAT_VERSION {
        return Err(ArchiveError::Schema(format!(
            "cannot create a snapshot at unknown revision {revision}"
        )));
    }
    if path.exists() {
        return Err(ArchiveError::OutputExists(path.to_path_buf()));
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(REVISION_1_SQL)?;
    for step in REVISION_STEPS.iter().filter(|step| step.to <= revision) {
        conn.execute_batch(step.sql)?;
    }
    Ok(conn)
}

/// Establish the snapshot's revision: explicit marker first, then table shape.
///
/// # Errors
/// Returns an error when the marker exists but is unreadable, or metadata queries fail.
pub fn detect_revision(conn: &Connection) -> Result<RevisionDetection, ArchiveError> {
    if table_exists(conn, "format_meta").map_err(|err| ArchiveError::storage(&err))? {
        let raw = conn
            .query_row("SELECT value FROM format_meta WHERE key = 'format_version'", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        if let Some(raw) = raw {
            let version = raw.trim().parse::<u32>().map_err(|err| {
                ArchiveError::Format(format!("format_version marker {raw:?} is not a number: {err}"))
            })?;
            return Ok(RevisionDetection::ExplicitVersion(version));
        }
    }

    // Highest revision whose markers are all present; lower gaps do not matter.
    let mut detected = None;
    for revision in 1..=LATEST_FORMAT_VERSION {
        if markers_present(conn, revision_markers(revision))? {
            detected = Some(revision);
        }
    }
    Ok(detected.map_or(RevisionDetection::Unknown, RevisionDetection::HeuristicGuess))
}

fn markers_present(conn: &Connection, markers: &[Marker]) -> Result<bool, ArchiveError> {
    for (table, column) in markers {
        let present = match column {
            Some(column) => table_has_column(conn, table, column),
            None => table_exists(conn, table),
        }
        .map_err(|err| ArchiveError::storage(&err))?;
        if !present {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Write one entity row. `row["id"]` becomes `source_id`; absent or null
/// columns fall back to the snapshot's column defaults.
///
/// # Errors
/// Returns an error when the row has no integer id or the insert fails.
pub fn write_row(
    conn: &Connection,
    class: EntityClass,
    row: &EntityRow,
) -> Result<i64, ArchiveError> {
    let Some(Value::Integer(source_id)) = row.get("id") else {
        return Err(ArchiveError::Format(format!("{class} row has no integer id")));
    };

    let mut columns = vec!["source_id"];
    let mut values = vec![Value::Integer(*source_id)];
    for column in class.all_columns() {
        match row.get(column) {
            None | Some(Value::Null) => {}
            Some(value) => {
                columns.push(column);
                values.push(value.clone());
            }
        }
    }
    let placeholders =
        (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
    let sql =
        format!("INSERT INTO {}({}) VALUES ({placeholders})", class.table(), columns.join(", "));
    conn.execute(&sql, params_from_iter(values))?;
    Ok(*source_id)
}

/// Every row of `class`, ordered by source id.
///
/// # Errors
/// Returns an error when the table is missing or the query fails.
pub fn read_rows(conn: &Connection, class: EntityClass) -> Result<Vec<SnapshotRow>, ArchiveError> {
    let columns = class.all_columns();
    let sql = format!(
        "SELECT source_id, {} FROM {} ORDER BY source_id ASC",
        columns.join(", "),
        class.table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        let mut values = EntityRow::new();
        for (index, column) in columns.iter().enumerate() {
            values.insert((*column).to_string(), row.get::<_, Value>(index + 1)?);
        }
        Ok(SnapshotRow { source_id: row.get(0)?, values })
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// # Errors
/// Returns an error when the query fails.
pub fn count_rows(conn: &Connection, table: &str) -> Result<u64, ArchiveError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// # Errors
/// Returns an error when the insert fails.
pub fn write_link(
    conn: &Connection,
    relationship: Relationship,
    left: i64,
    right: i64,
) -> Result<(), ArchiveError> {
    let sql = format!(
        "INSERT INTO {}({}, {}) VALUES (?1, ?2)",
        relationship.table, relationship.left_column, relationship.right_column
    );
    conn.execute(&sql, params![left, right])?;
    Ok(())
}

/// # Errors
/// Returns an error when the query fails.
pub fn read_links(
    conn: &Connection,
    relationship: Relationship,
) -> Result<Vec<(i64, i64)>, ArchiveError> {
    let sql = format!(
        "SELECT {left}, {right} FROM {table} ORDER BY {left}, {right}",
        left = relationship.left_column,
        right = relationship.right_column,
        table = relationship.table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    let mut pairs = Vec::new();
    for row in rows {
        pairs.push(row?);
    }
    Ok(pairs)
}

/// # Errors
/// Returns an error when the insert fails.
pub fn write_attachment(
    conn: &Connection,
    attachment: &SnapshotAttachment,
) -> Result<(), ArchiveError> {
    conn.execute(
        "INSERT INTO attachments(owner_class, owner_source_id, field, file_name, media_path, byte_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            attachment.owner_class.as_str(),
            attachment.owner_source_id,
            attachment.field,
            attachment.file_name,
            attachment.media_path,
            attachment.byte_size,
        ],
    )?;
    Ok(())
}

/// # Errors
/// Returns an error when the query fails or an owner class is unknown.
pub fn read_attachments(conn: &Connection) -> Result<Vec<SnapshotAttachment>, ArchiveError> {
    let mut stmt = conn.prepare(
        "SELECT owner_class, owner_source_id, field, file_name, media_path, byte_size
         FROM attachments ORDER BY media_path ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;

    let mut attachments = Vec::new();
    for row in rows {
        let (owner_raw, owner_source_id, field, file_name, media_path, byte_size) = row?;
        let owner_class = EntityClass::parse(&owner_raw).ok_or_else(|| {
            ArchiveError::Format(format!("attachment {media_path} has unknown owner {owner_raw}"))
        })?;
        attachments.push(SnapshotAttachment {
            owner_class,
            owner_source_id,
            field,
            file_name,
            media_path,
            byte_size,
        });
    }
    Ok(attachments)
}
