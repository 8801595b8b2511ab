//! Forward-only migration of archives between format revisions.

use std::fs;
use std::path::{Path, PathBuf};

use labport_core::{RevisionDetection, LATEST_FORMAT_VERSION};
use rusqlite::Connection;
use serde::Serialize;

use crate::layout::{self, SNAPSHOT_FILE};
use crate::seal::{self, SealKey};
use crate::snapshot::{self, REVISION_STEPS};
use crate::ArchiveError;

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    /// Defaults to `<stem>.v<target>.zip` next to the input.
    pub output: Option<PathBuf>,
    pub target_version: u32,
    pub check_only: bool,
    /// Replace an existing output file. The input is never overwritten.
    pub force: bool,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            output: None,
            target_version: LATEST_FORMAT_VERSION,
            check_only: false,
            force: false,
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub detected: RevisionDetection,
    pub target_version: u32,
    pub planned_steps: Vec<u32>,
    pub applied_steps: Vec<u32>,
    pub check_only: bool,
    pub up_to_date: bool,
    pub seal_time: Option<String>,
    pub digest: Option<String>,
    pub log: Vec<String>,
}

/// A migration that stopped early. The input archive is untouched and no
/// output was written.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct MigrationFailure {
    pub detected: Option<RevisionDetection>,
    /// Last step that completed before the failure, if any.
    pub furthest_step: Option<u32>,
    pub log: Vec<String>,
    #[source]
    pub error: ArchiveError,
}

#[derive(Debug, Default)]
pub(crate) struct MigrationProgress {
    pub detected: Option<RevisionDetection>,
    pub furthest_step: Option<u32>,
    pub log: Vec<String>,
}

/// Default output path: `<stem>.v<target>.zip` in the input's directory.
#[must_use]
pub fn default_output_path(input: &Path, target_version: u32) -> PathBuf {
    let stem = input.file_stem().map(|stem| stem.to_string_lossy().into_owned());
    let stem = stem.unwrap_or_else(|| "archive".to_string());
    input.with_file_name(format!("{stem}.v{target_version}.zip"))
}

/// Migrate `input` forward to `options.target_version` and write a re-sealed copy.
///
/// # Errors
/// Returns a [`MigrationFailure`] carrying the step log when the input cannot be
/// verified, its revision is unknown or newer than the target, or a step fails.
pub fn migrate_archive(
    input: &Path,
    key: &SealKey,
    options: &MigrateOptions,
) -> Result<MigrationReport, MigrationFailure> {
    let mut progress = MigrationProgress::default();
    match run_migration(input, key, options, &mut progress) {
        Ok(report) => Ok(report),
        Err(error) => {
            progress.log.push(format!("migration abandoned: {error}"));
            tracing::warn!(input = %input.display(), error = %error, "archive migration failed");
            Err(MigrationFailure {
                detected: progress.detected,
                furthest_step: progress.furthest_step,
                log: progress.log,
                error,
            })
        }
    }
}

fn run_migration(
    input: &Path,
    key: &SealKey,
    options: &MigrateOptions,
    progress: &mut MigrationProgress,
) -> Result<MigrationReport, ArchiveError> {
    let target = options.target_version;
    validate_target(target)?;
    let output = options.output.clone().unwrap_or_else(|| default_output_path(input, target));
    if same_file(input, &output) {
        return Err(ArchiveError::Format(format!(
            "refusing to overwrite the input archive {}",
            input.display()
        )));
    }

    let scratch_root = options.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new().prefix("labport-migrate-").tempdir_in(scratch_root)?;
    let root = scratch.path();
    layout::unpack(input, root)?;
    let verification = seal::verify_dir(root, key)?;
    verification.require_passed()?;
    progress.log.push(format!("verified seal {}", verification.seal_time));

    let (conn, from) = detect_snapshot(root, target, progress)?;
    let detected = progress.detected.unwrap_or(RevisionDetection::Unknown);
    let mut report = MigrationReport {
        input: input.to_path_buf(),
        output: None,
        detected,
        target_version: target,
        planned_steps: ((from + 1)..=target).collect(),
        applied_steps: Vec::new(),
        check_only: options.check_only,
        up_to_date: from == target,
        seal_time: None,
        digest: None,
        log: Vec::new(),
    };

    if report.up_to_date {
        progress.log.push(format!("already at target version {target}, no migration needed"));
        report.log = progress.log.clone();
        return Ok(report);
    }

    if options.check_only {
        for step in planned(from, target) {
            progress.log.push(format!(
                "would apply step {} -> {}: {}",
                step.to - 1,
                step.to,
                step.description
            ));
        }
        report.log = progress.log.clone();
        return Ok(report);
    }

    if output.exists() && !options.force {
        return Err(ArchiveError::OutputExists(output));
    }

    report.applied_steps = apply_steps(conn, from, target, progress)?;
    stamp_manifest(root, from, target)?;
    let sealed = seal::seal_dir(root, key)?;
    progress.log.push(format!("re-sealed at {}", sealed.seal_time));

    // The rename inside write_archive replaces a forced output atomically.
    layout::write_archive(root, &output)?;
    progress.log.push(format!("wrote {}", output.display()));
    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        from,
        to = target,
        "migrated archive"
    );

    report.output = Some(output);
    report.seal_time = Some(sealed.seal_time);
    report.digest = Some(sealed.digest);
    report.log = progress.log.clone();
    Ok(report)
}

/// Open the extracted snapshot and decide whether it can reach `target`.
pub(crate) fn detect_snapshot(
    root: &Path,
    target: u32,
    progress: &mut MigrationProgress,
) -> Result<(Connection, u32), ArchiveError> {
    validate_target(target)?;
    let conn = snapshot::open_snapshot(&root.join(SNAPSHOT_FILE))?;
    let detected = snapshot::detect_revision(&conn)?;
    progress.detected = Some(detected);
    progress.log.push(format!("detected format revision {detected}"));

    let Some(from) = detected.version() else {
        return Err(ArchiveError::Schema(
            "could not determine the archive's format revision".to_string(),
        ));
    };
    if from == 0 || from > LATEST_FORMAT_VERSION {
        return Err(ArchiveError::Schema(format!(
            "archive format revision {from} is not supported (latest known is {LATEST_FORMAT_VERSION})"
        )));
    }
    if from > target {
        return Err(ArchiveError::Schema(format!(
            "archive format revision {from} is newer than target {target}; downgrade is not supported"
        )));
    }
    Ok((conn, from))
}

/// Apply every step in `(from, target]` inside one transaction.
pub(crate) fn apply_steps(
    mut conn: Connection,
    from: u32,
    target: u32,
    progress: &mut MigrationProgress,
) -> Result<Vec<u32>, ArchiveError> {
    let tx = conn.transaction()?;
    let mut applied = Vec::new();
    for step in planned(from, target) {
        progress.log.push(format!("step {} -> {}: {}", step.to - 1, step.to, step.description));
        if let Err(err) = tx.execute_batch(step.sql) {
            progress.log.push(format!("step {} -> {} failed: {err}", step.to - 1, step.to));
            return Err(ArchiveError::MigrationStep { step: step.to, message: err.to_string() });
        }
        tracing::debug!(step = step.to, "applied archive migration step");
        applied.push(step.to);
        progress.furthest_step = Some(step.to);
    }
    tx.commit()?;
    conn.close().map_err(|(_, err)| ArchiveError::Sqlite(err))?;
    Ok(applied)
}

/// Record the new revision in the manifest of an extracted archive.
pub(crate) fn stamp_manifest(root: &Path, from: u32, target: u32) -> Result<(), ArchiveError> {
    let mut metadata = layout::read_metadata(root)?;
    metadata.format_version = target;
    metadata.migrated_from = Some(from);
    layout::write_metadata(root, &metadata)
}

fn planned(from: u32, target: u32) -> impl Iterator<Item = &'static snapshot::RevisionStep> {
    REVISION_STEPS.iter().filter(move |step| step.to > from && step.to <= target)
}

fn validate_target(target: u32) -> Result<(), ArchiveError> {
    if target == 0 || target > LATEST_FORMAT_VERSION {
        return Err(ArchiveError::Schema(format!(
            "target version {target} is unknown (latest known is {LATEST_FORMAT_VERSION})"
        )));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
