//! Recreate an archive's object graph inside a destination lab.
//!
//! Every created row is tracked in an [`IdentifierMap`] so later references
//! can be rewritten from source ids to destination ids. All writes happen in
//! one transaction owned by the caller; any error leaves the destination as
//! it was.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use labport_core::{
    EntityClass, FailureClass, IdentifierMap, ImportStatus, Reference, RevisionDetection,
    Visibility, LATEST_FORMAT_VERSION, RELATIONSHIPS,
};
use labport_store_sqlite::{
    complete_import, import_media_prefix, insert_attachment, insert_entity, insert_link,
    integer_value, record_import_file, record_import_objects, record_import_relationship,
    set_reference, EntityRow, ImportClaim, ImportCompletion, NewAttachment, NewImportRecord,
    SqliteStore, User,
};
use rusqlite::types::Value;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use ulid::Ulid;

use crate::layout::{self, SNAPSHOT_FILE};
use crate::migrate::{self, MigrationProgress};
use crate::seal::{self, SealKey};
use crate::snapshot;
use crate::ArchiveError;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Make every created top-level entity private to the importing user.
    pub vault: bool,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self { vault: true, scratch_dir: None }
    }
}

/// Where the snapshot lands in the destination.
#[derive(Debug, Clone)]
pub struct ImportTarget {
    pub import_id: String,
    pub lab_id: i64,
    pub owner_user_id: i64,
    pub vault: bool,
    pub media_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportReport {
    pub import_id: String,
    pub status: ImportStatus,
    pub archive: String,
    pub detected: RevisionDetection,
    pub migrated_from: Option<u32>,
    pub format_version: u32,
    pub source_installation: String,
    pub digest: String,
    pub objects_created: u64,
    pub objects_by_class: BTreeMap<EntityClass, u64>,
    pub files_copied: u64,
    pub relationships_created: u64,
    pub warnings: Vec<String>,
    pub vaulted: bool,
}

/// What one pass over the snapshot created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    pub objects_created: u64,
    pub objects_by_class: BTreeMap<EntityClass, u64>,
    pub files_copied: u64,
    pub relationships_created: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("lab {lab_id} already has import {active} in progress")]
    ScopeBusy { lab_id: i64, active: String },
    #[error("import {import_id} failed: {source}")]
    Failed {
        import_id: String,
        #[source]
        source: ArchiveError,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl ImportError {
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::ScopeBusy { .. } => FailureClass::Storage,
            Self::Failed { source, .. } | Self::Archive(source) => source.class(),
        }
    }

    #[must_use]
    pub fn import_id(&self) -> Option<&str> {
        match self {
            Self::Failed { import_id, .. } => Some(import_id),
            _ => None,
        }
    }
}

/// Import `archive` into `owner`'s lab.
///
/// A durable in-progress record is written first. On failure every row and
/// copied file is rolled back and the record is marked failed with the error.
///
/// # Errors
/// Returns [`ImportError::ScopeBusy`] when the lab already has an import in
/// progress, or [`ImportError::Failed`] naming the failed import.
pub fn import_archive(
    store: &mut SqliteStore,
    archive: &Path,
    owner: &User,
    key: &SealKey,
    options: &ImportOptions,
) -> Result<ImportReport, ImportError> {
    let import_id = Ulid::new().to_string();
    let archive_name = archive
        .file_name()
        .map_or_else(|| archive.display().to_string(), |name| name.to_string_lossy().into_owned());
    let claim = store
        .begin_import(&NewImportRecord {
            import_id: import_id.clone(),
            user_id: owner.id,
            lab_id: owner.lab_id,
            archive_name: archive_name.clone(),
            vaulted: options.vault,
        })
        .map_err(|err| ArchiveError::storage(&err))?;
    if let ImportClaim::Busy(active) = claim {
        return Err(ImportError::ScopeBusy { lab_id: owner.lab_id, active: active.import_id });
    }
    tracing::info!(import_id = %import_id, archive = %archive.display(), "import started");

    let target = ImportTarget {
        import_id: import_id.clone(),
        lab_id: owner.lab_id,
        owner_user_id: owner.id,
        vault: options.vault,
        media_root: store.media_root().to_path_buf(),
    };
    match run_import(store, archive, &archive_name, key, options, &target) {
        Ok(report) => {
            tracing::info!(
                import_id = %import_id,
                objects = report.objects_created,
                warnings = report.warnings.len(),
                "import completed"
            );
            Ok(report)
        }
        Err(error) => {
            let media_dir = store.import_media_dir(&import_id);
            if media_dir.exists() {
                if let Err(err) = fs::remove_dir_all(&media_dir) {
                    tracing::warn!(
                        import_id = %import_id,
                        path = %media_dir.display(),
                        error = %err,
                        "failed to remove media of failed import"
                    );
                }
            }
            if let Err(err) = store.fail_import(&import_id, &error.to_string()) {
                tracing::error!(import_id = %import_id, error = %err, "failed to record import failure");
            }
            tracing::warn!(import_id = %import_id, error = %error, "import failed");
            Err(ImportError::Failed { import_id, source: error })
        }
    }
}

fn run_import(
    store: &mut SqliteStore,
    archive: &Path,
    archive_name: &str,
    key: &SealKey,
    options: &ImportOptions,
    target: &ImportTarget,
) -> Result<ImportReport, ArchiveError> {
    let scratch_root = options.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new().prefix("labport-import-").tempdir_in(scratch_root)?;
    let root = scratch.path();
    layout::unpack(archive, root)?;
    let verification = seal::verify_dir(root, key)?;
    verification.require_passed()?;
    let metadata = layout::read_metadata(root)?;

    let mut progress = MigrationProgress::default();
    let (conn, from) = migrate::detect_snapshot(root, LATEST_FORMAT_VERSION, &mut progress)?;
    let detected = progress.detected.unwrap_or(RevisionDetection::Unknown);
    let migrated_from = if from < LATEST_FORMAT_VERSION {
        migrate::apply_steps(conn, from, LATEST_FORMAT_VERSION, &mut progress)?;
        migrate::stamp_manifest(root, from, LATEST_FORMAT_VERSION)?;
        for line in &progress.log {
            tracing::info!(import_id = %target.import_id, "{line}");
        }
        Some(from)
    } else {
        drop(conn);
        None
    };
    let snapshot_conn = snapshot::open_snapshot(&root.join(SNAPSHOT_FILE))?;

    let tx = store.transaction().map_err(|err| ArchiveError::storage(&err))?;
    let outcome = import_snapshot(&tx, &snapshot_conn, root, target)?;
    complete_import(
        &tx,
        &target.import_id,
        &ImportCompletion {
            archive_digest: verification.recorded_digest.clone(),
            source_installation: Some(metadata.source.installation_id.clone()),
            format_version: LATEST_FORMAT_VERSION,
            objects_created: outcome.objects_created,
            files_copied: outcome.files_copied,
            relationships_created: outcome.relationships_created,
            warnings: u64::try_from(outcome.warnings.len()).unwrap_or(u64::MAX),
        },
    )
    .map_err(|err| ArchiveError::storage(&err))?;
    tx.commit()?;

    Ok(ImportReport {
        import_id: target.import_id.clone(),
        status: ImportStatus::Completed,
        archive: archive_name.to_string(),
        detected,
        migrated_from,
        format_version: LATEST_FORMAT_VERSION,
        source_installation: metadata.source.installation_id,
        digest: verification.recorded_digest,
        objects_created: outcome.objects_created,
        objects_by_class: outcome.objects_by_class,
        files_copied: outcome.files_copied,
        relationships_created: outcome.relationships_created,
        warnings: outcome.warnings,
        vaulted: target.vault,
    })
}

/// Recreate every object, relationship, and attachment of a latest-revision
/// snapshot inside `tx`, and persist the identifier mapping.
///
/// The caller owns `tx`: committing makes the import visible, dropping it
/// discards everything. Copied media files are not covered by the
/// transaction; they live under `<media_root>/imports/<import_id>/`.
///
/// # Errors
/// Returns the first error; `tx` must then be dropped.
pub fn import_snapshot(
    tx: &Transaction<'_>,
    snapshot_conn: &Connection,
    root: &Path,
    target: &ImportTarget,
) -> Result<ImportOutcome, ArchiveError> {
    let mut map = IdentifierMap::new();
    let mut outcome = ImportOutcome::default();

    for class in EntityClass::IMPORT_ORDER {
        let created = import_class(tx, snapshot_conn, class, target, &mut map, &mut outcome)?;
        tracing::debug!(class = %class, created, "imported entity class");
        outcome.objects_by_class.insert(class, created);
        outcome.objects_created += created;
    }

    for relationship in RELATIONSHIPS {
        for (left, right) in snapshot::read_links(snapshot_conn, relationship)? {
            let (Some(left_id), Some(right_id)) =
                (map.resolve(relationship.left, left), map.resolve(relationship.right, right))
            else {
                warn(
                    &mut outcome,
                    target,
                    format!(
                        "skipped {} row ({left}, {right}): an endpoint is not in the archive",
                        relationship.table
                    ),
                );
                continue;
            };
            insert_link(tx, relationship, left_id, right_id)
                .and_then(|()| {
                    record_import_relationship(tx, &target.import_id, relationship, left_id, right_id)
                })
                .map_err(|err| ArchiveError::storage(&err))?;
            outcome.relationships_created += 1;
        }
    }

    for attachment in snapshot::read_attachments(snapshot_conn)? {
        let Some(owner_id) = map.resolve(attachment.owner_class, attachment.owner_source_id) else {
            warn(
                &mut outcome,
                target,
                format!(
                    "skipped attachment {}: owner {} {} was not imported",
                    attachment.media_path, attachment.owner_class, attachment.owner_source_id
                ),
            );
            continue;
        };
        let source = layout::resolve_media_path(root, &attachment.media_path)?;
        let relative = attachment
            .media_path
            .strip_prefix(&format!("{}/", layout::MEDIA_DIR))
            .unwrap_or(&attachment.media_path);
        let stored_path = format!("{}/{relative}", import_media_prefix(&target.import_id));
        let destination = target.media_root.join(&stored_path);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let byte_size = i64::try_from(fs::copy(&source, &destination)?).unwrap_or(i64::MAX);

        let attachment_id = insert_attachment(
            tx,
            &NewAttachment {
                owner_class: attachment.owner_class,
                owner_id,
                field: &attachment.field,
                file_name: &attachment.file_name,
                stored_path: &stored_path,
                byte_size,
            },
        )
        .and_then(|attachment_id| {
            record_import_file(
                tx,
                &target.import_id,
                attachment_id,
                &attachment.media_path,
                &stored_path,
                byte_size,
            )
            .map(|()| attachment_id)
        })
        .map_err(|err| ArchiveError::storage(&err))?;
        tracing::debug!(attachment_id, path = %stored_path, "copied attachment");
        outcome.files_copied += 1;
    }

    record_import_objects(tx, &target.import_id, map.entries())
        .map_err(|err| ArchiveError::storage(&err))?;
    Ok(outcome)
}

/// Create every row of one class. Self references are inserted empty and
/// patched once the whole class exists.
fn import_class(
    tx: &Transaction<'_>,
    snapshot_conn: &Connection,
    class: EntityClass,
    target: &ImportTarget,
    map: &mut IdentifierMap,
    outcome: &mut ImportOutcome,
) -> Result<u64, ArchiveError> {
    let mut deferred: Vec<(i64, &'static Reference, i64)> = Vec::new();
    let mut created = 0_u64;

    for row in snapshot::read_rows(snapshot_conn, class)? {
        let mut values = EntityRow::new();
        for column in class.data_columns() {
            if let Some(value) = row.values.get(*column).filter(|value| **value != Value::Null) {
                values.insert((*column).to_string(), value.clone());
            }
        }

        for reference in class.references() {
            let Some(source_target) = integer_value(&row.values, reference.column) else {
                continue;
            };
            if reference.target == class {
                deferred.push((row.source_id, reference, source_target));
                continue;
            }
            match map.resolve(reference.target, source_target) {
                Some(destination) => {
                    values.insert(reference.column.to_string(), Value::Integer(destination));
                }
                None => warn(
                    outcome,
                    target,
                    format!(
                        "{class} {}: {} points at {} {source_target}, which is not in the archive",
                        row.source_id, reference.column, reference.target
                    ),
                ),
            }
        }

        if class.is_top_level() {
            values.insert("lab_id".to_string(), Value::Integer(target.lab_id));
            values.insert("owner_user_id".to_string(), Value::Integer(target.owner_user_id));
            if target.vault {
                values.insert(
                    "visibility".to_string(),
                    Value::Text(Visibility::Private.as_str().to_string()),
                );
            }
        }

        let destination = insert_entity(tx, class, &values).map_err(|err| {
            ArchiveError::ImportObject {
                class,
                source_id: row.source_id,
                message: format!("{err:#}"),
            }
        })?;
        map.insert(class, row.source_id, destination).map_err(|err| {
            ArchiveError::ImportObject { class, source_id: row.source_id, message: err.to_string() }
        })?;
        created += 1;
    }

    for (source_id, reference, source_target) in deferred {
        let Some(destination) = map.resolve(class, source_id) else {
            continue;
        };
        match map.resolve(class, source_target) {
            Some(target_id) => {
                set_reference(tx, class, destination, reference.column, Some(target_id)).map_err(
                    |err| ArchiveError::ImportObject { class, source_id, message: format!("{err:#}") },
                )?;
            }
            None => warn(
                outcome,
                target,
                format!(
                    "{class} {source_id}: {} points at {class} {source_target}, which is not in the archive",
                    reference.column
                ),
            ),
        }
    }

    Ok(created)
}

fn warn(outcome: &mut ImportOutcome, target: &ImportTarget, message: String) {
    tracing::warn!(import_id = %target.import_id, "{message}");
    outcome.warnings.push(message);
}
