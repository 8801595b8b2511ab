//! On-disk layout of an archive and the zip container around it.
//!
//! An extracted archive is a directory holding `snapshot.sqlite3`,
//! `export_metadata.json`, the seal sidecar, and a `media/` tree.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::ArchiveError;

pub const SNAPSHOT_FILE: &str = "snapshot.sqlite3";
pub const MANIFEST_FILE: &str = "export_metadata.json";
pub const MEDIA_DIR: &str = "media";
pub const SIDECAR_SUFFIX: &str = "_hash_signature.txt";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceIdentity {
    pub installation_id: String,
    pub lab_id: i64,
    pub lab_name: String,
}

/// Provenance header written next to the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportMetadata {
    pub format_version: u32,
    pub exported_at: String,
    pub source: SourceIdentity,
    pub entity_counts: BTreeMap<String, u64>,
    pub relationship_counts: BTreeMap<String, u64>,
    pub attachment_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_from: Option<u32>,
}

/// # Errors
/// Returns an error when the manifest is missing or malformed.
pub fn read_metadata(root: &Path) -> Result<ExportMetadata, ArchiveError> {
    let path = root.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(ArchiveError::Format(format!("archive has no {MANIFEST_FILE}")));
    }
    let body = fs::read(&path)?;
    Ok(serde_json::from_slice(&body)?)
}

/// # Errors
/// Returns an error when the manifest cannot be written.
pub fn write_metadata(root: &Path, metadata: &ExportMetadata) -> Result<(), ArchiveError> {
    let body = serde_json::to_vec_pretty(metadata)?;
    fs::write(root.join(MANIFEST_FILE), body)?;
    Ok(())
}

/// Relative paths (with `/` separators) of every file under `media/`, sorted.
///
/// # Errors
/// Returns an error when the media tree cannot be listed.
pub fn media_files(root: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut files = Vec::new();
    let media = root.join(MEDIA_DIR);
    if media.is_dir() {
        collect_files(root, &media, &mut files)?;
    }
    files.sort();
    Ok(files)
}

/// Zip every file under `root` into `destination`, entries in sorted order.
///
/// # Errors
/// Returns an error when a file cannot be read or the zip cannot be written.
pub fn pack_dir(root: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let mut entries = Vec::new();
    collect_files(root, root, &mut entries)?;
    entries.sort();

    let file = File::create(destination)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in &entries {
        zip.start_file(entry.as_str(), options)?;
        let mut source = File::open(root.join(entry))?;
        io::copy(&mut source, &mut zip)?;
    }
    let mut inner = zip.finish()?;
    inner.flush()?;
    inner.sync_all()?;
    Ok(())
}

/// Extract `archive` into `destination`, rejecting entries that would escape it.
///
/// # Errors
/// Returns an error when the file is not a zip or an entry path is unsafe.
pub fn unpack(archive: &Path, destination: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive).map_err(|err| {
        ArchiveError::Format(format!("cannot open archive {}: {err}", archive.display()))
    })?;
    let mut zip = ZipArchive::new(file)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::Format(format!(
                "archive entry has an unsafe path: {}",
                entry.name()
            )));
        };
        let target = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Sibling path used while an output archive is being written.
#[must_use]
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

/// Pack `root` next to `output` and move it into place only once complete.
///
/// # Errors
/// Returns an error when packing or the final rename fails; no output is left behind.
pub fn write_archive(root: &Path, output: &Path) -> Result<(), ArchiveError> {
    let partial = partial_path(output);
    if let Err(err) = pack_dir(root, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    if let Err(err) = fs::rename(&partial, output) {
        let _ = fs::remove_file(&partial);
        return Err(err.into());
    }
    Ok(())
}

/// Resolve a path recorded inside the snapshot against the extraction root.
///
/// # Errors
/// Returns an error unless the path is a plain relative path under `media/`.
pub fn resolve_media_path(root: &Path, media_path: &str) -> Result<PathBuf, ArchiveError> {
    let relative = Path::new(media_path);
    let mut components = relative.components();
    let under_media = matches!(components.next(), Some(Component::Normal(first)) if first == MEDIA_DIR);
    if !under_media || !components.all(|component| matches!(component, Component::Normal(_))) {
        return Err(ArchiveError::Format(format!("attachment path escapes media/: {media_path}")));
    }
    Ok(root.join(relative))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), ArchiveError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let relative = path.strip_prefix(root).map_err(|_| {
            ArchiveError::Format(format!("{} is outside {}", path.display(), root.display()))
        })?;
        let parts = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        out.push(parts.join("/"));
    }
    Ok(())
}
