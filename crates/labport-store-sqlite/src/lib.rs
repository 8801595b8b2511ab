use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use labport_core::{EntityClass, Relationship};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod audit;
mod schema;

pub use audit::{
    complete_import, record_import_file, record_import_objects, record_import_relationship,
    ImportClaim, ImportCompletion, ImportRecord, ImportedFile, NewImportRecord, ReferenceViolation,
    RevertSummary,
};
pub use schema::{table_exists, table_has_column, LATEST_SCHEMA_VERSION};

/// One stored row keyed by column name. Always carries `id` when loaded.
pub type EntityRow = BTreeMap<String, Value>;

/// Columns present only on top-level classes in the destination store.
pub const OWNERSHIP_COLUMNS: [&str; 2] = ["lab_id", "owner_user_id"];

pub struct SqliteStore {
    conn: Connection,
    media_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lab {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub lab_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredAttachment {
    pub id: i64,
    pub owner_class: EntityClass,
    pub owner_id: i64,
    pub field: String,
    pub file_name: String,
    /// Relative to the store's media root.
    pub stored_path: String,
    pub byte_size: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy)]
pub struct NewAttachment<'a> {
    pub owner_class: EntityClass,
    pub owner_id: i64,
    pub field: &'a str,
    pub file_name: &'a str,
    pub stored_path: &'a str,
    pub byte_size: i64,
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
    pub import_reference_violations: Vec<ReferenceViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a store whose attachment files live in `<path>.media`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let media_root = if path == Path::new(":memory:") {
            std::env::temp_dir().join(format!("labport-media-{}", Ulid::new()))
        } else {
            PathBuf::from(format!("{}.media", path.display()))
        };
        Self::open_with_media_root(path, &media_root)
    }

    /// Open a SQLite-backed store with an explicit attachment directory.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_media_root(path: &Path, media_root: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, media_root: media_root.to_path_buf() })
    }

    #[must_use]
    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Start a deferred write transaction. Dropping it without commit rolls back.
    ///
    /// # Errors
    /// Returns an error when `SQLite` refuses to open the transaction.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn.transaction().context("failed to start transaction")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(schema::CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) =
            schema::detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(schema::CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred) = schema::detect_effective_schema_version(&self.conn)?;
        if inferred {
            // Tables predate migration tracking; record what is already there.
            for applied in 1..=version {
                schema::record_schema_version(&self.conn, applied)?;
            }
        }

        for (migration_version, sql) in schema::MIGRATIONS {
            if migration_version > version {
                schema::apply_migration(&mut self.conn, migration_version, sql)?;
                tracing::debug!(version = migration_version, "applied store migration");
                version = migration_version;
            }
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO installation(id, installation_id, created_at)
                 VALUES (1, ?1, ?2)",
                params![Ulid::new().to_string(), now_rfc3339()?],
            )
            .context("failed to initialize installation identity")?;

        Ok(())
    }

    /// Stable identity of this installation, written once on first migration.
    ///
    /// # Errors
    /// Returns an error when the store has not been migrated.
    pub fn installation_id(&self) -> Result<String> {
        self.conn
            .query_row("SELECT installation_id FROM installation WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .ok_or_else(|| anyhow!("installation identity missing; run migrations first"))
    }

    /// # Errors
    /// Returns an error when the name is taken or the insert fails.
    pub fn create_lab(&mut self, name: &str) -> Result<Lab> {
        if name.trim().is_empty() {
            return Err(anyhow!("lab name MUST be non-empty"));
        }
        self.conn
            .execute(
                "INSERT INTO labs(name, created_at) VALUES (?1, ?2)",
                params![name, now_rfc3339()?],
            )
            .with_context(|| format!("failed to create lab {name}"))?;
        Ok(Lab { id: self.conn.last_insert_rowid(), name: name.to_string() })
    }

    /// Look a lab up by numeric id or by name.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn find_lab(&self, key: &str) -> Result<Option<Lab>> {
        let map_lab = |row: &rusqlite::Row<'_>| Ok(Lab { id: row.get(0)?, name: row.get(1)? });
        let found = match key.parse::<i64>() {
            Ok(id) => self
                .conn
                .query_row("SELECT id, name FROM labs WHERE id = ?1", params![id], map_lab)
                .optional(),
            Err(_) => self
                .conn
                .query_row("SELECT id, name FROM labs WHERE name = ?1", params![key], map_lab)
                .optional(),
        };
        found.with_context(|| format!("failed to look up lab {key}"))
    }

    /// # Errors
    /// Returns an error when the lab does not exist or the insert fails.
    pub fn create_user(&mut self, name: &str, lab_id: i64) -> Result<User> {
        if name.trim().is_empty() {
            return Err(anyhow!("user name MUST be non-empty"));
        }
        self.conn
            .execute(
                "INSERT INTO users(name, lab_id, created_at) VALUES (?1, ?2, ?3)",
                params![name, lab_id, now_rfc3339()?],
            )
            .with_context(|| format!("failed to create user {name}"))?;
        Ok(User { id: self.conn.last_insert_rowid(), name: name.to_string(), lab_id })
    }

    /// Look a user up by numeric id or by name.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn find_user(&self, key: &str) -> Result<Option<User>> {
        let map_user = |row: &rusqlite::Row<'_>| {
            Ok(User { id: row.get(0)?, name: row.get(1)?, lab_id: row.get(2)? })
        };
        let found = match key.parse::<i64>() {
            Ok(id) => self
                .conn
                .query_row("SELECT id, name, lab_id FROM users WHERE id = ?1", params![id], map_user)
                .optional(),
            Err(_) => self
                .conn
                .query_row(
                    "SELECT id, name, lab_id FROM users WHERE name = ?1",
                    params![key],
                    map_user,
                )
                .optional(),
        };
        found.with_context(|| format!("failed to look up user {key}"))
    }

    /// # Errors
    /// Returns an error when the row names unknown columns or violates a constraint.
    pub fn insert_entity(&mut self, class: EntityClass, row: &EntityRow) -> Result<i64> {
        insert_entity(&self.conn, class, row)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn load_entity(&self, class: EntityClass, id: i64) -> Result<Option<EntityRow>> {
        let mut rows = query_entity_rows(&self.conn, class, "WHERE id = ?1", params![id])?;
        Ok(rows.pop())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_entities(&self, class: EntityClass) -> Result<Vec<EntityRow>> {
        query_entity_rows(&self.conn, class, "", [])
    }

    /// Top-level rows the given user may see: public rows, rows shared with
    /// the user's lab, and rows the user owns.
    ///
    /// # Errors
    /// Returns an error for non top-level classes or when the query fails.
    pub fn visible_entities(&self, class: EntityClass, user_id: i64) -> Result<Vec<EntityRow>> {
        if !class.is_top_level() {
            return Err(anyhow!("{class} rows have no visibility of their own"));
        }
        query_entity_rows(
            &self.conn,
            class,
            "WHERE visibility = 'public'
                OR owner_user_id = ?1
                OR (visibility = 'lab' AND lab_id = (SELECT lab_id FROM users WHERE id = ?1))",
            params![user_id],
        )
    }

    /// # Errors
    /// Returns an error when either endpoint is missing.
    pub fn link(&mut self, relationship: Relationship, left_id: i64, right_id: i64) -> Result<()> {
        insert_link(&self.conn, relationship, left_id, right_id)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn links(&self, relationship: Relationship) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT {left}, {right} FROM {table} ORDER BY {left}, {right}",
            left = relationship.left_column,
            right = relationship.right_column,
            table = relationship.table
        );
        collect_pairs(&self.conn, &sql, [])
    }

    /// Write `bytes` under the media root and register them against an owner.
    ///
    /// # Errors
    /// Returns an error for unsafe file names or when the write fails.
    pub fn store_attachment(
        &mut self,
        owner_class: EntityClass,
        owner_id: i64,
        field: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<StoredAttachment> {
        validate_file_name(file_name)?;
        let stored_path = format!("{owner_class}/{owner_id}/{}_{file_name}", Ulid::new());
        let absolute = self.media_root.join(&stored_path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create attachment directory {}", parent.display())
            })?;
        }
        fs::write(&absolute, bytes)
            .with_context(|| format!("failed to write attachment {}", absolute.display()))?;

        let byte_size = i64::try_from(bytes.len()).context("attachment too large")?;
        let id = insert_attachment(
            &self.conn,
            &NewAttachment {
                owner_class,
                owner_id,
                field,
                file_name,
                stored_path: &stored_path,
                byte_size,
            },
        )?;
        self.attachment(id)?.ok_or_else(|| anyhow!("attachment {id} vanished after insert"))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn attachment(&self, id: i64) -> Result<Option<StoredAttachment>> {
        let mut found = query_attachments(&self.conn, "WHERE id = ?1", params![id])?;
        Ok(found.pop())
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn attachments_for(
        &self,
        owner_class: EntityClass,
        owner_id: i64,
    ) -> Result<Vec<StoredAttachment>> {
        query_attachments(
            &self.conn,
            "WHERE owner_class = ?1 AND owner_id = ?2",
            params![owner_class.as_str(), owner_id],
        )
    }

    /// # Errors
    /// Returns an error when the file cannot be read.
    pub fn read_attachment(&self, attachment: &StoredAttachment) -> Result<Vec<u8>> {
        let path = self.media_root.join(&attachment.stored_path);
        fs::read(&path).with_context(|| format!("failed to read attachment {}", path.display()))
    }

    /// Directory receiving files copied by one import.
    #[must_use]
    pub fn import_media_dir(&self, import_id: &str) -> PathBuf {
        self.media_root.join(import_media_prefix(import_id))
    }

    /// Identifiers of `class` reachable from `lab_id`, ascending.
    ///
    /// # Errors
    /// Returns an error when the scope query fails.
    pub fn reachable_ids(&self, class: EntityClass, lab_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare(scope_sql(class))
            .with_context(|| format!("failed to prepare export scope for {class}"))?;
        let rows = stmt.query_map(params![lab_id], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Rows of `class` reachable from `lab_id`, ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn export_rows(&self, class: EntityClass, lab_id: i64) -> Result<Vec<EntityRow>> {
        let filter = format!("WHERE id IN ({})", scope_sql(class));
        query_entity_rows(&self.conn, class, &filter, params![lab_id])
    }

    /// Join rows whose left endpoint is reachable from `lab_id`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn export_links(&self, relationship: Relationship, lab_id: i64) -> Result<Vec<(i64, i64)>> {
        let sql = format!(
            "SELECT {left}, {right} FROM {table} WHERE {left} IN ({scope}) ORDER BY {left}, {right}",
            left = relationship.left_column,
            right = relationship.right_column,
            table = relationship.table,
            scope = scope_sql(relationship.left)
        );
        collect_pairs(&self.conn, &sql, params![lab_id])
    }

    /// Attachments whose owner is reachable from `lab_id`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn export_attachments(&self, lab_id: i64) -> Result<Vec<StoredAttachment>> {
        let mut attachments = Vec::new();
        for class in EntityClass::IMPORT_ORDER {
            let filter =
                format!("WHERE owner_class = ?2 AND owner_id IN ({})", scope_sql(class));
            attachments.extend(query_attachments(
                &self.conn,
                &filter,
                params![lab_id, class.as_str()],
            )?);
        }
        Ok(attachments)
    }

    /// Run quick-check, foreign-key-check, import reference closure, and schema status checks.
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

        let import_reference_violations = self.import_reference_violations()?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            import_reference_violations,
            schema_status,
        })
    }
}

/// Columns stored for `class` in the destination, excluding `id`.
#[must_use]
pub fn stored_columns(class: EntityClass) -> Vec<&'static str> {
    let mut columns = class.all_columns();
    if class.is_top_level() {
        columns.extend(OWNERSHIP_COLUMNS);
    }
    columns
}

/// Insert one entity row and return its new id.
///
/// # Errors
/// Returns an error when the row names unknown columns or violates a constraint.
pub fn insert_entity(conn: &Connection, class: EntityClass, row: &EntityRow) -> Result<i64> {
    let allowed = stored_columns(class);
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (column, value) in row {
        if !allowed.contains(&column.as_str()) {
            return Err(anyhow!("column {column} is not defined for {class}"));
        }
        columns.push(column.as_str());
        values.push(value);
    }

    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", class.table())
    } else {
        let placeholders =
            (1..=columns.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
        format!("INSERT INTO {}({}) VALUES ({placeholders})", class.table(), columns.join(", "))
    };
    conn.execute(&sql, params_from_iter(values))
        .with_context(|| format!("failed to insert {class} row"))?;
    Ok(conn.last_insert_rowid())
}

/// Point a reference column of one row at `target` (or clear it).
///
/// # Errors
/// Returns an error when `column` is not a reference of `class` or the update fails.
pub fn set_reference(
    conn: &Connection,
    class: EntityClass,
    id: i64,
    column: &str,
    target: Option<i64>,
) -> Result<()> {
    if !class.references().iter().any(|reference| reference.column == column) {
        return Err(anyhow!("{column} is not a reference column of {class}"));
    }
    let sql = format!("UPDATE {} SET {column} = ?1 WHERE id = ?2", class.table());
    let changed = conn
        .execute(&sql, params![target, id])
        .with_context(|| format!("failed to update {class}.{column} for id {id}"))?;
    if changed != 1 {
        return Err(anyhow!("{class} row {id} not found while updating {column}"));
    }
    Ok(())
}

/// # Errors
/// Returns an error when either endpoint is missing or the pair already exists.
pub fn insert_link(
    conn: &Connection,
    relationship: Relationship,
    left_id: i64,
    right_id: i64,
) -> Result<()> {
    let sql = format!(
        "INSERT INTO {}({}, {}) VALUES (?1, ?2)",
        relationship.table, relationship.left_column, relationship.right_column
    );
    conn.execute(&sql, params![left_id, right_id]).with_context(|| {
        format!("failed to link {} ({left_id}, {right_id})", relationship.table)
    })?;
    Ok(())
}

/// # Errors
/// Returns an error when the insert fails.
pub fn insert_attachment(conn: &Connection, attachment: &NewAttachment<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO attachments(owner_class, owner_id, field, file_name, stored_path, byte_size, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            attachment.owner_class.as_str(),
            attachment.owner_id,
            attachment.field,
            attachment.file_name,
            attachment.stored_path,
            attachment.byte_size,
            now_rfc3339()?,
        ],
    )
    .with_context(|| {
        format!(
            "failed to register attachment {} for {} {}",
            attachment.file_name, attachment.owner_class, attachment.owner_id
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/// Media-root relative prefix for files copied by one import.
#[must_use]
pub fn import_media_prefix(import_id: &str) -> String {
    format!("imports/{import_id}")
}

#[must_use]
pub fn integer_value(row: &EntityRow, column: &str) -> Option<i64> {
    match row.get(column) {
        Some(Value::Integer(value)) => Some(*value),
        _ => None,
    }
}

#[must_use]
pub fn text_value<'a>(row: &'a EntityRow, column: &str) -> Option<&'a str> {
    match row.get(column) {
        Some(Value::Text(value)) => Some(value.as_str()),
        _ => None,
    }
}

fn validate_file_name(file_name: &str) -> Result<()> {
    let path = Path::new(file_name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("attachment file name must be a single path segment: {file_name}")),
    }
}

fn scope_sql(class: EntityClass) -> &'static str {
    match class {
        EntityClass::OntologyTerm => {
            "SELECT id FROM ontology_terms
             WHERE id IN (SELECT ontology_term_id FROM protocols WHERE lab_id = ?1)
                OR id IN (
                    SELECT at.ontology_term_id FROM annotation_terms at
                    JOIN annotations a ON a.id = at.annotation_id
                    JOIN sessions s ON s.id = a.session_id
                    WHERE s.lab_id = ?1
                )"
        }
        EntityClass::Instrument => "SELECT id FROM instruments WHERE lab_id = ?1",
        EntityClass::Protocol => "SELECT id FROM protocols WHERE lab_id = ?1",
        EntityClass::ProtocolStep => {
            "SELECT ps.id FROM protocol_steps ps
             JOIN protocols p ON p.id = ps.protocol_id
             WHERE p.lab_id = ?1"
        }
        EntityClass::SamplePool => "SELECT id FROM sample_pools WHERE lab_id = ?1",
        EntityClass::Session => "SELECT id FROM sessions WHERE lab_id = ?1",
        EntityClass::Annotation => {
            "SELECT a.id FROM annotations a
             JOIN sessions s ON s.id = a.session_id
             WHERE s.lab_id = ?1"
        }
        EntityClass::Booking => {
            "SELECT b.id FROM bookings b
             JOIN instruments i ON i.id = b.instrument_id
             WHERE i.lab_id = ?1"
        }
        EntityClass::BillingEntry => {
            "SELECT be.id FROM billing_entries be
             JOIN bookings b ON b.id = be.booking_id
             JOIN instruments i ON i.id = b.instrument_id
             WHERE i.lab_id = ?1"
        }
    }
}

fn query_entity_rows<P: rusqlite::Params>(
    conn: &Connection,
    class: EntityClass,
    filter: &str,
    params: P,
) -> Result<Vec<EntityRow>> {
    let columns = stored_columns(class);
    let sql = format!(
        "SELECT id, {} FROM {} {filter} ORDER BY id ASC",
        columns.join(", "),
        class.table()
    );
    let mut stmt = conn.prepare(&sql).with_context(|| format!("failed to query {class} rows"))?;
    let rows = stmt.query_map(params, |row| {
        let mut entity = EntityRow::new();
        entity.insert("id".to_string(), row.get::<_, Value>(0)?);
        for (index, column) in columns.iter().enumerate() {
            entity.insert((*column).to_string(), row.get::<_, Value>(index + 1)?);
        }
        Ok(entity)
    })?;

    let mut entities = Vec::new();
    for row in rows {
        entities.push(row?);
    }
    Ok(entities)
}

fn query_attachments<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<StoredAttachment>> {
    let sql = format!(
        "SELECT id, owner_class, owner_id, field, file_name, stored_path, byte_size, created_at
         FROM attachments {filter} ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql).context("failed to query attachments")?;
    let rows = stmt.query_map(params, |row| {
        let owner_raw: String = row.get(1)?;
        let owner_class = EntityClass::parse(&owner_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(labport_core::CoreError::Validation(format!(
                    "invalid attachment owner class: {owner_raw}"
                ))),
            )
        })?;
        Ok(StoredAttachment {
            id: row.get(0)?,
            owner_class,
            owner_id: row.get(2)?,
            field: row.get(3)?,
            file_name: row.get(4)?,
            stored_path: row.get(5)?,
            byte_size: row.get(6)?,
            created_at: row.get(7)?,
        })
    })?;

    let mut attachments = Vec::new();
    for row in rows {
        attachments.push(row?);
    }
    Ok(attachments)
}

fn collect_pairs<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<(i64, i64)>> {
    let mut stmt = conn.prepare(sql).context("failed to query relationship rows")?;
    let rows = stmt.query_map(params, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    let mut pairs = Vec::new();
    for row in rows {
        pairs.push(row?);
    }
    Ok(pairs)
}

pub(crate) fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use labport_core::{ImportStatus, MappingEntry, RELATIONSHIPS};

    use super::*;
    use crate::schema::{CREATE_SCHEMA_MIGRATIONS_SQL, MIGRATION_001_SQL};

    fn row(values: &[(&str, Value)]) -> EntityRow {
        values.iter().map(|(column, value)| ((*column).to_string(), value.clone())).collect()
    }

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    fn seeded_store() -> Result<(SqliteStore, Lab, User)> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let lab = store.create_lab("Imaging Core")?;
        let user = store.create_user("ada", lab.id)?;
        Ok((store, lab, user))
    }

    fn owned(lab: &Lab, user: &User, values: &[(&str, Value)]) -> EntityRow {
        let mut entity = row(values);
        entity.insert("lab_id".to_string(), Value::Integer(lab.id));
        entity.insert("owner_user_id".to_string(), Value::Integer(user.id));
        entity
    }

    #[test]
    fn migrate_creates_installation_identity_once() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let first = store.installation_id()?;
        store.migrate()?;
        assert_eq!(store.installation_id()?, first);

        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn schema_status_infers_untracked_v1_tables() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert!(table_exists(&store.conn, "import_records")?);
        assert!(table_has_column(&store.conn, "import_records", "revertible")?);
        Ok(())
    }

    #[test]
    fn insert_entity_rejects_unknown_columns() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let mut entity = owned(&lab, &user, &[("name", text("Confocal"))]);
        entity.insert("tenant_id".to_string(), Value::Integer(1));

        let err = match store.insert_entity(EntityClass::Instrument, &entity) {
            Ok(id) => return Err(anyhow!("expected rejection, inserted {id}")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("tenant_id"));
        Ok(())
    }

    #[test]
    fn visible_entities_honour_visibility_levels() -> Result<()> {
        let (mut store, lab, owner) = seeded_store()?;
        let colleague = store.create_user("grace", lab.id)?;
        let other_lab = store.create_lab("Genomics")?;
        let outsider = store.create_user("linus", other_lab.id)?;

        for (name, visibility) in [("private", "private"), ("shared", "lab"), ("open", "public")] {
            store.insert_entity(
                EntityClass::Protocol,
                &owned(&lab, &owner, &[("name", text(name)), ("visibility", text(visibility))]),
            )?;
        }

        let names = |user_id: i64| -> Result<Vec<String>> {
            Ok(store
                .visible_entities(EntityClass::Protocol, user_id)?
                .iter()
                .filter_map(|entity| text_value(entity, "name").map(str::to_string))
                .collect())
        };
        assert_eq!(names(owner.id)?, vec!["private", "shared", "open"]);
        assert_eq!(names(colleague.id)?, vec!["shared", "open"]);
        assert_eq!(names(outsider.id)?, vec!["open"]);

        assert!(store.visible_entities(EntityClass::Annotation, owner.id).is_err());
        Ok(())
    }

    #[test]
    fn export_scope_follows_lab_ownership() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let other_lab = store.create_lab("Genomics")?;
        let other_user = store.create_user("linus", other_lab.id)?;

        let term = store.insert_entity(
            EntityClass::OntologyTerm,
            &row(&[("ontology", text("OBI")), ("accession", text("OBI:0000070")), ("label", text("assay"))]),
        )?;
        store.insert_entity(
            EntityClass::OntologyTerm,
            &row(&[("ontology", text("OBI")), ("accession", text("OBI:0000001")), ("label", text("unused"))]),
        )?;
        let mut protocol = owned(&lab, &user, &[("name", text("Staining"))]);
        protocol.insert("ontology_term_id".to_string(), Value::Integer(term));
        store.insert_entity(EntityClass::Protocol, &protocol)?;

        let ours = store.insert_entity(EntityClass::Instrument, &owned(&lab, &user, &[("name", text("Confocal"))]))?;
        let theirs = store.insert_entity(
            EntityClass::Instrument,
            &owned(&other_lab, &other_user, &[("name", text("Sequencer"))]),
        )?;
        for instrument in [ours, theirs] {
            store.insert_entity(
                EntityClass::Booking,
                &row(&[
                    ("instrument_id", Value::Integer(instrument)),
                    ("starts_at", text("2026-03-01T09:00:00Z")),
                    ("ends_at", text("2026-03-01T10:00:00Z")),
                ]),
            )?;
        }

        assert_eq!(store.reachable_ids(EntityClass::OntologyTerm, lab.id)?, vec![term]);
        assert_eq!(store.reachable_ids(EntityClass::Instrument, lab.id)?, vec![ours]);
        let bookings = store.export_rows(EntityClass::Booking, lab.id)?;
        assert_eq!(bookings.len(), 1);
        assert_eq!(integer_value(&bookings[0], "instrument_id"), Some(ours));
        Ok(())
    }

    #[test]
    fn store_attachment_writes_under_media_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = SqliteStore::open_with_media_root(
            &dir.path().join("labport.sqlite3"),
            &dir.path().join("media"),
        )?;
        store.migrate()?;
        let lab = store.create_lab("Imaging Core")?;
        let user = store.create_user("ada", lab.id)?;
        let session = store.insert_entity(
            EntityClass::Session,
            &owned(&lab, &user, &[("title", text("Run 1")), ("started_at", text("2026-03-01T09:00:00Z"))]),
        )?;

        let stored =
            store.store_attachment(EntityClass::Session, session, "photo", "gel.png", b"png-bytes")?;
        assert_eq!(stored.byte_size, 9);
        assert!(dir.path().join("media").join(&stored.stored_path).is_file());
        assert_eq!(store.read_attachment(&stored)?, b"png-bytes");
        assert_eq!(store.attachments_for(EntityClass::Session, session)?, vec![stored]);

        assert!(store
            .store_attachment(EntityClass::Session, session, "photo", "../escape.png", b"x")
            .is_err());
        Ok(())
    }

    fn simulate_import(store: &mut SqliteStore, lab: &Lab, user: &User) -> Result<String> {
        let import_id = Ulid::new().to_string();
        let claim = store.begin_import(&NewImportRecord {
            import_id: import_id.clone(),
            user_id: user.id,
            lab_id: lab.id,
            archive_name: "lab.zip".to_string(),
            vaulted: true,
        })?;
        assert!(matches!(claim, ImportClaim::Started(_)));

        let tx = store.transaction()?;
        let pool = insert_entity(&tx, EntityClass::SamplePool, &owned(lab, user, &[("name", text("Pool A"))]))?;
        let child = insert_entity(
            &tx,
            EntityClass::SamplePool,
            &owned(lab, user, &[("name", text("Pool A.1")), ("parent_pool_id", Value::Integer(pool))]),
        )?;
        let session = insert_entity(
            &tx,
            EntityClass::Session,
            &owned(lab, user, &[("title", text("Run 1")), ("started_at", text("2026-03-01T09:00:00Z"))]),
        )?;
        insert_link(&tx, RELATIONSHIPS[0], session, child)?;
        record_import_relationship(&tx, &import_id, RELATIONSHIPS[0], session, child)?;
        record_import_objects(
            &tx,
            &import_id,
            &[
                MappingEntry { class: EntityClass::SamplePool, source_id: 1, destination_id: pool },
                MappingEntry { class: EntityClass::SamplePool, source_id: 2, destination_id: child },
                MappingEntry { class: EntityClass::Session, source_id: 1, destination_id: session },
            ],
        )?;
        complete_import(
            &tx,
            &import_id,
            &ImportCompletion {
                archive_digest: "ab".repeat(64),
                source_installation: Some("remote".to_string()),
                format_version: 4,
                objects_created: 3,
                files_copied: 0,
                relationships_created: 1,
                warnings: 0,
            },
        )?;
        tx.commit()?;
        Ok(import_id)
    }

    #[test]
    fn begin_import_refuses_second_claim_on_same_lab() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let new = NewImportRecord {
            import_id: "first".to_string(),
            user_id: user.id,
            lab_id: lab.id,
            archive_name: "lab.zip".to_string(),
            vaulted: true,
        };
        assert!(matches!(store.begin_import(&new)?, ImportClaim::Started(_)));

        let second = NewImportRecord { import_id: "second".to_string(), ..new };
        match store.begin_import(&second)? {
            ImportClaim::Busy(active) => assert_eq!(active.import_id, "first"),
            ImportClaim::Started(_) => return Err(anyhow!("second claim should be refused")),
        }

        store.fail_import("first", "boom")?;
        let failed = store.import_record("first")?.ok_or_else(|| anyhow!("record missing"))?;
        assert_eq!(failed.status, ImportStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(matches!(store.begin_import(&second)?, ImportClaim::Started(_)));
        Ok(())
    }

    #[test]
    fn interrupted_claim_blocks_lab_until_abandoned() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = dir.path().join("labport.sqlite3");
        let media = dir.path().join("media");
        let (lab, user) = {
            let mut store = SqliteStore::open_with_media_root(&db, &media)?;
            store.migrate()?;
            let lab = store.create_lab("Imaging Core")?;
            let user = store.create_user("ada", lab.id)?;
            let claim = store.begin_import(&NewImportRecord {
                import_id: "crashed".to_string(),
                user_id: user.id,
                lab_id: lab.id,
                archive_name: "lab.zip".to_string(),
                vaulted: true,
            })?;
            assert!(matches!(claim, ImportClaim::Started(_)));
            fs::create_dir_all(store.import_media_dir("crashed").join("session"))?;
            (lab, user)
        };

        let mut store = SqliteStore::open_with_media_root(&db, &media)?;
        let retry = NewImportRecord {
            import_id: "retry".to_string(),
            user_id: user.id,
            lab_id: lab.id,
            archive_name: "lab.zip".to_string(),
            vaulted: true,
        };
        match store.begin_import(&retry)? {
            ImportClaim::Busy(active) => assert_eq!(active.import_id, "crashed"),
            ImportClaim::Started(_) => return Err(anyhow!("stale claim should still hold the lab")),
        }

        let abandoned = store.abandon_import("crashed")?;
        assert_eq!(abandoned.status, ImportStatus::Failed);
        assert_eq!(abandoned.error.as_deref(), Some("abandoned before completion"));
        assert!(abandoned.finished_at.is_some());
        assert!(!store.import_media_dir("crashed").exists());
        assert!(store.abandon_import("crashed").is_err());

        assert!(matches!(store.begin_import(&retry)?, ImportClaim::Started(_)));
        Ok(())
    }

    #[test]
    fn revert_removes_every_imported_row() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let import_id = simulate_import(&mut store, &lab, &user)?;
        assert_eq!(store.import_objects(&import_id)?.len(), 3);
        assert!(store.resolve_imported(&import_id, EntityClass::Session, 1)?.is_some());

        let summary = store.revert_import(&import_id)?;
        assert_eq!(summary.objects_deleted, 3);
        assert_eq!(summary.relationships_deleted, 1);
        assert!(store.list_entities(EntityClass::SamplePool)?.is_empty());
        assert!(store.list_entities(EntityClass::Session)?.is_empty());
        assert!(store.links(RELATIONSHIPS[0])?.is_empty());

        let record = store.import_record(&import_id)?.ok_or_else(|| anyhow!("record missing"))?;
        assert_eq!(record.status, ImportStatus::Reverted);
        assert!(record.reverted_at.is_some());
        assert!(store.revert_import(&import_id).is_err());
        Ok(())
    }

    #[test]
    fn locked_import_cannot_be_reverted() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let import_id = simulate_import(&mut store, &lab, &user)?;
        let locked = store.lock_import(&import_id)?;
        assert!(!locked.revertible);

        let err = match store.revert_import(&import_id) {
            Ok(_) => return Err(anyhow!("locked import should not revert")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("locked"));
        assert_eq!(store.list_entities(EntityClass::Session)?.len(), 1);
        Ok(())
    }

    #[test]
    fn integrity_check_flags_references_leaving_an_import() -> Result<()> {
        let (mut store, lab, user) = seeded_store()?;
        let import_id = simulate_import(&mut store, &lab, &user)?;

        let clean = store.integrity_check()?;
        assert!(clean.quick_check_ok);
        assert!(clean.foreign_key_violations.is_empty());
        assert!(clean.import_reference_violations.is_empty());

        let outside =
            store.insert_entity(EntityClass::SamplePool, &owned(&lab, &user, &[("name", text("Local"))]))?;
        let child = store
            .resolve_imported(&import_id, EntityClass::SamplePool, 2)?
            .ok_or_else(|| anyhow!("child pool missing"))?;
        set_reference(&store.conn, EntityClass::SamplePool, child, "parent_pool_id", Some(outside))?;

        let report = store.integrity_check()?;
        assert_eq!(report.import_reference_violations.len(), 1);
        assert_eq!(report.import_reference_violations[0].destination_id, child);
        assert_eq!(report.import_reference_violations[0].value, outside);
        Ok(())
    }
}
