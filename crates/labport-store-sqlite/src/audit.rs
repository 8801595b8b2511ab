use std::fs;

use anyhow::{anyhow, Context, Result};
use labport_core::{
    relationship_by_table, EntityClass, ImportStatus, MappingEntry, Relationship,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::{now_rfc3339, SqliteStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewImportRecord {
    pub import_id: String,
    pub user_id: i64,
    pub lab_id: i64,
    pub archive_name: String,
    pub vaulted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportRecord {
    pub import_id: String,
    pub user_id: i64,
    pub lab_id: i64,
    pub archive_name: String,
    pub archive_digest: Option<String>,
    pub source_installation: Option<String>,
    pub format_version: Option<u32>,
    pub status: ImportStatus,
    pub vaulted: bool,
    pub revertible: bool,
    pub objects_created: u64,
    pub files_copied: u64,
    pub relationships_created: u64,
    pub warnings: u64,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub reverted_at: Option<String>,
}

/// Outcome of trying to claim a destination lab for a new import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportClaim {
    Started(ImportRecord),
    /// Another import into the same lab has not finished.
    Busy(ImportRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportCompletion {
    pub archive_digest: String,
    pub source_installation: Option<String>,
    pub format_version: u32,
    pub objects_created: u64,
    pub files_copied: u64,
    pub relationships_created: u64,
    pub warnings: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportedFile {
    pub id: i64,
    pub attachment_id: i64,
    pub source_path: String,
    pub destination_path: String,
    pub byte_size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevertSummary {
    pub import_id: String,
    pub objects_deleted: u64,
    pub attachments_deleted: u64,
    pub relationships_deleted: u64,
    pub media_removed: bool,
}

/// An imported row whose reference escapes the set of rows its import created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceViolation {
    pub import_id: String,
    pub class: EntityClass,
    pub destination_id: i64,
    pub column: String,
    pub target: EntityClass,
    pub value: i64,
}

const IMPORT_RECORD_COLUMNS: &str = "import_id, user_id, lab_id, archive_name, archive_digest,
    source_installation, format_version, status, vaulted, revertible, objects_created,
    files_copied, relationships_created, warnings, error, started_at, finished_at, reverted_at";

impl SqliteStore {
    /// Durably record a new in-progress import unless the lab already has one.
    ///
    /// The check and the insert share an immediate transaction so two
    /// importers cannot both claim the same lab.
    ///
    /// # Errors
    /// Returns an error when the record cannot be written.
    pub fn begin_import(&mut self, new: &NewImportRecord) -> Result<ImportClaim> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start import claim transaction")?;

        if let Some(active) = active_import(&tx, new.lab_id)? {
            return Ok(ImportClaim::Busy(active));
        }

        tx.execute(
            "INSERT INTO import_records(import_id, user_id, lab_id, archive_name, status, vaulted, started_at)
             VALUES (?1, ?2, ?3, ?4, 'in-progress', ?5, ?6)",
            params![
                new.import_id,
                new.user_id,
                new.lab_id,
                new.archive_name,
                i64::from(new.vaulted),
                now_rfc3339()?,
            ],
        )
        .with_context(|| format!("failed to create import record {}", new.import_id))?;
        let record = load_import_record(&tx, &new.import_id)?
            .ok_or_else(|| anyhow!("import record {} vanished after insert", new.import_id))?;
        tx.commit().context("failed to commit import claim")?;
        Ok(ImportClaim::Started(record))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn active_import_for_lab(&self, lab_id: i64) -> Result<Option<ImportRecord>> {
        active_import(&self.conn, lab_id)
    }

    /// Mark an in-progress import failed and keep the error text for the user.
    ///
    /// # Errors
    /// Returns an error when the record is missing or not in progress.
    pub fn fail_import(&mut self, import_id: &str, error: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE import_records SET status = 'failed', error = ?2, finished_at = ?3
                 WHERE import_id = ?1 AND status = 'in-progress'",
                params![import_id, error, now_rfc3339()?],
            )
            .with_context(|| format!("failed to mark import {import_id} failed"))?;
        if changed != 1 {
            return Err(anyhow!("import {import_id} is not in progress"));
        }
        Ok(())
    }

    /// Give up on an in-progress import whose process never finished it.
    ///
    /// Its rows were never committed, so only the record and any media copied
    /// before the interruption remain. The record is marked failed and the lab
    /// accepts imports again.
    ///
    /// # Errors
    /// Returns an error when the record is missing or not in progress.
    pub fn abandon_import(&mut self, import_id: &str) -> Result<ImportRecord> {
        self.fail_import(import_id, "abandoned before completion")?;
        let media_dir = self.import_media_dir(import_id);
        if media_dir.exists() {
            fs::remove_dir_all(&media_dir).with_context(|| {
                format!("failed to remove media of abandoned import {}", media_dir.display())
            })?;
        }
        tracing::info!(import_id, "abandoned in-progress import");
        load_import_record(&self.conn, import_id)?
            .ok_or_else(|| anyhow!("import {import_id} vanished while abandoning"))
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn import_record(&self, import_id: &str) -> Result<Option<ImportRecord>> {
        load_import_record(&self.conn, import_id)
    }

    /// All import records, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_import_records(&self) -> Result<Vec<ImportRecord>> {
        let sql = format!(
            "SELECT {IMPORT_RECORD_COLUMNS} FROM import_records
             ORDER BY started_at DESC, import_id DESC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to list import records")?;
        let rows = stmt.query_map([], map_import_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Identifier mapping persisted for one import, in import order.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn import_objects(&self, import_id: &str) -> Result<Vec<MappingEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT entity_class, source_id, destination_id FROM import_objects
                 WHERE import_id = ?1",
            )
            .context("failed to query import objects")?;
        let rows = stmt.query_map(params![import_id], |row| {
            let class_raw: String = row.get(0)?;
            Ok((class_raw, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (class_raw, source_id, destination_id) = row?;
            let class = EntityClass::parse(&class_raw)
                .ok_or_else(|| anyhow!("invalid entity class in import_objects: {class_raw}"))?;
            entries.push(MappingEntry { class, source_id, destination_id });
        }
        entries.sort_by_key(|entry| (entry.class.dependency_rank(), entry.source_id));
        Ok(entries)
    }

    /// Destination id created for `source_id` of `class` by one import.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn resolve_imported(
        &self,
        import_id: &str,
        class: EntityClass,
        source_id: i64,
    ) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT destination_id FROM import_objects
                 WHERE import_id = ?1 AND entity_class = ?2 AND source_id = ?3",
                params![import_id, class.as_str(), source_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to resolve imported object")
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn import_files(&self, import_id: &str) -> Result<Vec<ImportedFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, attachment_id, source_path, destination_path, byte_size
                 FROM import_files WHERE import_id = ?1 ORDER BY id ASC",
            )
            .context("failed to query import files")?;
        let rows = stmt.query_map(params![import_id], |row| {
            Ok(ImportedFile {
                id: row.get(0)?,
                attachment_id: row.get(1)?,
                source_path: row.get(2)?,
                destination_path: row.get(3)?,
                byte_size: row.get(4)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Clear the revertible flag; the import becomes permanent.
    ///
    /// # Errors
    /// Returns an error when the import is unknown or not completed.
    pub fn lock_import(&mut self, import_id: &str) -> Result<ImportRecord> {
        let changed = self
            .conn
            .execute(
                "UPDATE import_records SET revertible = 0
                 WHERE import_id = ?1 AND status = 'completed'",
                params![import_id],
            )
            .with_context(|| format!("failed to lock import {import_id}"))?;
        if changed != 1 {
            return Err(anyhow!("import {import_id} is unknown or not completed"));
        }
        self.import_record(import_id)?
            .ok_or_else(|| anyhow!("import {import_id} vanished while locking"))
    }

    /// Delete everything a completed import created and mark it reverted.
    ///
    /// Deletion runs in one transaction, join rows first, then attachment
    /// rows, then objects in reverse import order. Copied media files are
    /// removed after commit.
    ///
    /// # Errors
    /// Returns an error when the import cannot be reverted; nothing changes then.
    pub fn revert_import(&mut self, import_id: &str) -> Result<RevertSummary> {
        let record = self
            .import_record(import_id)?
            .ok_or_else(|| anyhow!("import {import_id} not found"))?;
        if record.status != ImportStatus::Completed {
            return Err(anyhow!(
                "import {import_id} is {}; only completed imports can be reverted",
                record.status.as_str()
            ));
        }
        if !record.revertible {
            return Err(anyhow!("import {import_id} has been locked and cannot be reverted"));
        }

        let media_dir = self.import_media_dir(import_id);
        let tx = self.transaction()?;

        let mut relationships_deleted = 0_u64;
        let links = {
            let mut stmt = tx
                .prepare(
                    "SELECT relationship, left_id, right_id FROM import_relationships
                     WHERE import_id = ?1 ORDER BY id ASC",
                )
                .context("failed to query import relationships")?;
            let rows = stmt.query_map(params![import_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            let mut links = Vec::new();
            for row in rows {
                links.push(row?);
            }
            links
        };
        for (table, left_id, right_id) in links {
            let relationship = relationship_by_table(&table)
                .ok_or_else(|| anyhow!("unknown relationship recorded for import: {table}"))?;
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                relationship.table, relationship.left_column, relationship.right_column
            );
            relationships_deleted += count(tx.execute(&sql, params![left_id, right_id])?);
        }

        let attachments_deleted = count(
            tx.execute(
                "DELETE FROM attachments WHERE id IN (
                   SELECT attachment_id FROM import_files WHERE import_id = ?1
                 )",
                params![import_id],
            )
            .context("failed to delete imported attachment rows")?,
        );

        let mut objects_deleted = 0_u64;
        for class in EntityClass::IMPORT_ORDER.into_iter().rev() {
            let sql = format!(
                "DELETE FROM {} WHERE id IN (
                   SELECT destination_id FROM import_objects
                   WHERE import_id = ?1 AND entity_class = ?2
                 )",
                class.table()
            );
            let deleted = tx.execute(&sql, params![import_id, class.as_str()]).with_context(|| {
                format!("failed to delete imported {class} rows; other rows may still reference them")
            })?;
            objects_deleted += count(deleted);
        }

        tx.execute(
            "UPDATE import_records SET status = 'reverted', revertible = 0, reverted_at = ?2
             WHERE import_id = ?1",
            params![import_id, now_rfc3339()?],
        )
        .with_context(|| format!("failed to mark import {import_id} reverted"))?;
        tx.commit().context("failed to commit revert")?;

        let media_removed = if media_dir.exists() {
            match fs::remove_dir_all(&media_dir) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(
                        import_id,
                        path = %media_dir.display(),
                        error = %err,
                        "failed to remove imported media after revert"
                    );
                    false
                }
            }
        } else {
            false
        };

        tracing::info!(import_id, objects_deleted, "reverted import");
        Ok(RevertSummary {
            import_id: import_id.to_string(),
            objects_deleted,
            attachments_deleted,
            relationships_deleted,
            media_removed,
        })
    }

    /// References on rows created by completed imports that point outside
    /// the set of rows the same import created.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn import_reference_violations(&self) -> Result<Vec<ReferenceViolation>> {
        let mut violations = Vec::new();
        for class in EntityClass::IMPORT_ORDER {
            for reference in class.references() {
                let sql = format!(
                    "SELECT io.import_id, t.id, t.{column}
                     FROM import_objects io
                     JOIN import_records r ON r.import_id = io.import_id AND r.status = 'completed'
                     JOIN {table} t ON t.id = io.destination_id
                     WHERE io.entity_class = ?1
                       AND t.{column} IS NOT NULL
                       AND NOT EXISTS (
                         SELECT 1 FROM import_objects o2
                         WHERE o2.import_id = io.import_id
                           AND o2.entity_class = ?2
                           AND o2.destination_id = t.{column}
                       )
                     ORDER BY io.import_id, t.id",
                    column = reference.column,
                    table = class.table()
                );
                let mut stmt = self
                    .conn
                    .prepare(&sql)
                    .with_context(|| format!("failed to check {class}.{}", reference.column))?;
                let rows = stmt.query_map(params![class.as_str(), reference.target.as_str()], |row| {
                    Ok(ReferenceViolation {
                        import_id: row.get(0)?,
                        class,
                        destination_id: row.get(1)?,
                        column: reference.column.to_string(),
                        target: reference.target,
                        value: row.get(2)?,
                    })
                })?;
                for row in rows {
                    violations.push(row?);
                }
            }
        }
        Ok(violations)
    }
}

/// Mark an import completed inside the caller's transaction.
///
/// # Errors
/// Returns an error when the record is missing or not in progress.
pub fn complete_import(
    conn: &Connection,
    import_id: &str,
    completion: &ImportCompletion,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE import_records
             SET status = 'completed', archive_digest = ?2, source_installation = ?3,
                 format_version = ?4, objects_created = ?5, files_copied = ?6,
                 relationships_created = ?7, warnings = ?8, finished_at = ?9
             WHERE import_id = ?1 AND status = 'in-progress'",
            params![
                import_id,
                completion.archive_digest,
                completion.source_installation,
                completion.format_version,
                to_sql_count(completion.objects_created)?,
                to_sql_count(completion.files_copied)?,
                to_sql_count(completion.relationships_created)?,
                to_sql_count(completion.warnings)?,
                now_rfc3339()?,
            ],
        )
        .with_context(|| format!("failed to complete import {import_id}"))?;
    if changed != 1 {
        return Err(anyhow!("import {import_id} is not in progress"));
    }
    Ok(())
}

/// Persist the identifier mapping of one import.
///
/// # Errors
/// Returns an error when any insert fails.
pub fn record_import_objects(
    conn: &Connection,
    import_id: &str,
    entries: &[MappingEntry],
) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO import_objects(import_id, entity_class, source_id, destination_id)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare import object insert")?;
    for entry in entries {
        stmt.execute(params![import_id, entry.class.as_str(), entry.source_id, entry.destination_id])
            .with_context(|| {
                format!("failed to record {} source id {}", entry.class, entry.source_id)
            })?;
    }
    Ok(())
}

/// # Errors
/// Returns an error when the insert fails.
pub fn record_import_file(
    conn: &Connection,
    import_id: &str,
    attachment_id: i64,
    source_path: &str,
    destination_path: &str,
    byte_size: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO import_files(import_id, attachment_id, source_path, destination_path, byte_size)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![import_id, attachment_id, source_path, destination_path, byte_size],
    )
    .with_context(|| format!("failed to record imported file {source_path}"))?;
    Ok(())
}

/// # Errors
/// Returns an error when the insert fails.
pub fn record_import_relationship(
    conn: &Connection,
    import_id: &str,
    relationship: Relationship,
    left_id: i64,
    right_id: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO import_relationships(import_id, relationship, left_id, right_id)
         VALUES (?1, ?2, ?3, ?4)",
        params![import_id, relationship.table, left_id, right_id],
    )
    .with_context(|| format!("failed to record imported {} row", relationship.table))?;
    Ok(())
}

fn active_import(conn: &Connection, lab_id: i64) -> Result<Option<ImportRecord>> {
    let sql = format!(
        "SELECT {IMPORT_RECORD_COLUMNS} FROM import_records
         WHERE lab_id = ?1 AND status = 'in-progress'
         ORDER BY started_at ASC LIMIT 1"
    );
    conn.query_row(&sql, params![lab_id], map_import_record)
        .optional()
        .with_context(|| format!("failed to look up active import for lab {lab_id}"))
}

fn load_import_record(conn: &Connection, import_id: &str) -> Result<Option<ImportRecord>> {
    let sql = format!("SELECT {IMPORT_RECORD_COLUMNS} FROM import_records WHERE import_id = ?1");
    conn.query_row(&sql, params![import_id], map_import_record)
        .optional()
        .with_context(|| format!("failed to load import record {import_id}"))
}

fn map_import_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportRecord> {
    let status_raw: String = row.get(7)?;
    let status = ImportStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            Box::new(labport_core::CoreError::Validation(format!(
                "invalid import status: {status_raw}"
            ))),
        )
    })?;

    Ok(ImportRecord {
        import_id: row.get(0)?,
        user_id: row.get(1)?,
        lab_id: row.get(2)?,
        archive_name: row.get(3)?,
        archive_digest: row.get(4)?,
        source_installation: row.get(5)?,
        format_version: row.get(6)?,
        status,
        vaulted: row.get::<_, i64>(8)? == 1,
        revertible: row.get::<_, i64>(9)? == 1,
        objects_created: from_sql_count(row.get(10)?),
        files_copied: from_sql_count(row.get(11)?),
        relationships_created: from_sql_count(row.get(12)?),
        warnings: from_sql_count(row.get(13)?),
        error: row.get(14)?,
        started_at: row.get(15)?,
        finished_at: row.get(16)?,
        reverted_at: row.get(17)?,
    })
}

fn count(changed: usize) -> u64 {
    u64::try_from(changed).unwrap_or(u64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).context("count exceeds sqlite integer range")
}
