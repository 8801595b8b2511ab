//! Serialize everything reachable from one lab into a sealed archive.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use labport_core::{EntityClass, LATEST_FORMAT_VERSION, RELATIONSHIPS};
use labport_store_sqlite::{Lab, SqliteStore};
use serde::Serialize;
use time::OffsetDateTime;

use crate::layout::{self, ExportMetadata, SourceIdentity, MEDIA_DIR, SNAPSHOT_FILE};
use crate::seal::{self, SealKey};
use crate::snapshot::{self, SnapshotAttachment};
use crate::ArchiveError;

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExportReport {
    pub output: PathBuf,
    pub lab_id: i64,
    pub lab_name: String,
    pub format_version: u32,
    pub seal_time: String,
    pub digest: String,
    pub entity_counts: BTreeMap<EntityClass, u64>,
    pub relationship_counts: BTreeMap<String, u64>,
    pub attachments: u64,
    pub entities_serialized: u64,
    pub log: Vec<String>,
}

/// An export that stopped before the archive was finalized. Nothing exists
/// at the output path.
#[derive(Debug, thiserror::Error)]
#[error("export failed after {entities_serialized} entities: {error}")]
pub struct ExportFailure {
    pub entities_serialized: u64,
    pub log: Vec<String>,
    #[source]
    pub error: ArchiveError,
}

#[derive(Debug, Default)]
struct ExportProgress {
    entities_serialized: u64,
    log: Vec<String>,
}

/// Write the archive for `lab` to `output`.
///
/// Work happens in a scratch directory; the archive appears at `output`
/// only once it is complete and sealed.
///
/// # Errors
/// Returns an [`ExportFailure`] when `output` exists or any step fails.
pub fn export_lab(
    store: &SqliteStore,
    lab: &Lab,
    output: &Path,
    key: &SealKey,
    options: &ExportOptions,
) -> Result<ExportReport, ExportFailure> {
    let mut progress = ExportProgress::default();
    match run_export(store, lab, output, key, options, &mut progress) {
        Ok(report) => Ok(report),
        Err(error) => {
            tracing::warn!(
                lab = %lab.name,
                entities_serialized = progress.entities_serialized,
                error = %error,
                "export failed"
            );
            progress.log.push(format!("export abandoned: {error}"));
            Err(ExportFailure {
                entities_serialized: progress.entities_serialized,
                log: progress.log,
                error,
            })
        }
    }
}

fn run_export(
    store: &SqliteStore,
    lab: &Lab,
    output: &Path,
    key: &SealKey,
    options: &ExportOptions,
    progress: &mut ExportProgress,
) -> Result<ExportReport, ArchiveError> {
    if output.exists() {
        return Err(ArchiveError::OutputExists(output.to_path_buf()));
    }
    let installation_id = store.installation_id().map_err(|err| ArchiveError::storage(&err))?;

    let scratch_root = options.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new().prefix("labport-export-").tempdir_in(scratch_root)?;
    let root = scratch.path();
    let conn = snapshot::create_snapshot(&root.join(SNAPSHOT_FILE), LATEST_FORMAT_VERSION)?;

    let mut entity_counts = BTreeMap::new();
    for class in EntityClass::IMPORT_ORDER {
        let rows = store.export_rows(class, lab.id).map_err(|err| ArchiveError::storage(&err))?;
        for row in &rows {
            snapshot::write_row(&conn, class, row)?;
            progress.entities_serialized += 1;
        }
        let count = u64::try_from(rows.len()).unwrap_or(u64::MAX);
        tracing::debug!(class = %class, count, "serialized entity class");
        progress.log.push(format!("exported {count} {class} rows"));
        entity_counts.insert(class, count);
    }

    let mut relationship_counts = BTreeMap::new();
    for relationship in RELATIONSHIPS {
        let pairs =
            store.export_links(relationship, lab.id).map_err(|err| ArchiveError::storage(&err))?;
        for (left, right) in &pairs {
            snapshot::write_link(&conn, relationship, *left, *right)?;
        }
        let count = u64::try_from(pairs.len()).unwrap_or(u64::MAX);
        progress.log.push(format!("exported {count} {} rows", relationship.table));
        relationship_counts.insert(relationship.table.to_string(), count);
    }

    let attachments = copy_attachments(store, lab, root, &conn)?;
    progress.log.push(format!("copied {attachments} attachments"));
    conn.close().map_err(|(_, err)| ArchiveError::Sqlite(err))?;

    let exported_at = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ArchiveError::Format(format!("failed to format export time: {err}")))?;
    let metadata = ExportMetadata {
        format_version: LATEST_FORMAT_VERSION,
        exported_at,
        source: SourceIdentity {
            installation_id,
            lab_id: lab.id,
            lab_name: lab.name.clone(),
        },
        entity_counts: entity_counts
            .iter()
            .map(|(class, count)| (class.as_str().to_string(), *count))
            .collect(),
        relationship_counts: relationship_counts.clone(),
        attachment_count: attachments,
        migrated_from: None,
    };
    layout::write_metadata(root, &metadata)?;

    let sealed = seal::seal_dir(root, key)?;
    progress.log.push(format!("sealed at {}", sealed.seal_time));
    layout::write_archive(root, output)?;
    progress.log.push(format!("wrote {}", output.display()));
    tracing::info!(
        lab = %lab.name,
        output = %output.display(),
        entities = progress.entities_serialized,
        attachments,
        "exported lab archive"
    );

    Ok(ExportReport {
        output: output.to_path_buf(),
        lab_id: lab.id,
        lab_name: lab.name.clone(),
        format_version: LATEST_FORMAT_VERSION,
        seal_time: sealed.seal_time,
        digest: sealed.digest,
        entity_counts,
        relationship_counts,
        attachments,
        entities_serialized: progress.entities_serialized,
        log: progress.log.clone(),
    })
}

/// Copy every reachable attachment into `media/<class>/<field>_<owner id>`,
/// suffixing `_1`, `_2`, ... when a name is already taken.
fn copy_attachments(
    store: &SqliteStore,
    lab: &Lab,
    root: &Path,
    conn: &rusqlite::Connection,
) -> Result<u64, ArchiveError> {
    let mut taken = BTreeSet::new();
    let mut copied = 0_u64;
    for attachment in store.export_attachments(lab.id).map_err(|err| ArchiveError::storage(&err))? {
        let base = format!(
            "{MEDIA_DIR}/{}/{}_{}",
            attachment.owner_class, attachment.field, attachment.owner_id
        );
        let media_path = unique_name(&base, &taken);
        taken.insert(media_path.clone());

        let bytes = store.read_attachment(&attachment).map_err(|err| ArchiveError::storage(&err))?;
        let target = layout::resolve_media_path(root, &media_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &bytes)?;

        snapshot::write_attachment(
            conn,
            &SnapshotAttachment {
                owner_class: attachment.owner_class,
                owner_source_id: attachment.owner_id,
                field: attachment.field.clone(),
                file_name: attachment.file_name.clone(),
                media_path,
                byte_size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            },
        )?;
        copied += 1;
    }
    Ok(copied)
}

fn unique_name(base: &str, taken: &BTreeSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1_u32..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}
