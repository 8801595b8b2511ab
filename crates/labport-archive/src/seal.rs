//! Archive sealing and verification.
//!
//! The digest is SHA-512 over the snapshot bytes, every media file in sorted
//! path order, and finally the seal time text. The signature is HMAC-SHA512
//! of the hex digest. Both land in `<sealtime>_hash_signature.txt`.

use std::fs;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::layout::{self, SIDECAR_SUFFIX, SNAPSHOT_FILE};
use crate::ArchiveError;

type HmacSha512 = Hmac<Sha512>;

const SEAL_TIME_FORMAT: &str = "[year][month][day]T[hour][minute][second]Z";

/// 32-byte key shared by exporting and importing installations.
#[derive(Clone, PartialEq, Eq)]
pub struct SealKey([u8; 32]);

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey(..)")
    }
}

impl SealKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Read a key file holding exactly 32 hex-encoded bytes.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or does not decode to 32 bytes.
    pub fn read_hex_key_file(path: &Path) -> Result<Self, ArchiveError> {
        let body = fs::read_to_string(path)?;
        let bytes = hex::decode(body.trim()).map_err(|err| {
            ArchiveError::Format(format!(
                "seal key file {} must contain hex bytes: {err}",
                path.display()
            ))
        })?;
        if bytes.len() != 32 {
            return Err(ArchiveError::Format(format!(
                "seal key file {} must decode to exactly 32 bytes (got {})",
                path.display(),
                bytes.len()
            )));
        }

        let mut key = [0_u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    fn mac(&self) -> Result<HmacSha512, ArchiveError> {
        <HmacSha512 as Mac>::new_from_slice(&self.0)
            .map_err(|err| ArchiveError::Integrity(format!("failed to initialize seal key: {err}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seal {
    pub seal_time: String,
    pub digest: String,
    pub signature: String,
    pub sidecar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub passed: bool,
    pub seal_time: String,
    pub recorded_digest: String,
    pub computed_digest: String,
    pub signature_valid: bool,
    pub attachments: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationReport {
    /// # Errors
    /// Returns [`ArchiveError::Integrity`] unless verification passed.
    pub fn require_passed(&self) -> Result<(), ArchiveError> {
        if self.passed {
            return Ok(());
        }
        Err(ArchiveError::Integrity(
            self.reason.clone().unwrap_or_else(|| "archive seal does not match".to_string()),
        ))
    }
}

/// Current UTC time in seal format, e.g. `20260314T091500Z`.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn seal_time_now() -> Result<String, ArchiveError> {
    let format = time::format_description::parse(SEAL_TIME_FORMAT)
        .map_err(|err| ArchiveError::Format(format!("invalid seal time format: {err}")))?;
    OffsetDateTime::now_utc()
        .format(&format)
        .map_err(|err| ArchiveError::Format(format!("failed to format seal time: {err}")))
}

/// # Errors
/// Returns an error unless `text` is a `YYYYMMDDTHHMMSSZ` timestamp.
pub fn parse_seal_time(text: &str) -> Result<OffsetDateTime, ArchiveError> {
    let format = time::format_description::parse(SEAL_TIME_FORMAT)
        .map_err(|err| ArchiveError::Format(format!("invalid seal time format: {err}")))?;
    PrimitiveDateTime::parse(text, &format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| ArchiveError::Format(format!("invalid seal time {text}: {err}")))
}

/// Hex SHA-512 over the snapshot, the media files, and the seal time.
///
/// # Errors
/// Returns an error when the snapshot or a media file cannot be read.
pub fn compute_digest(root: &Path, seal_time: &str) -> Result<(String, usize), ArchiveError> {
    let snapshot = root.join(SNAPSHOT_FILE);
    if !snapshot.is_file() {
        return Err(ArchiveError::Format(format!("archive has no {SNAPSHOT_FILE}")));
    }

    let mut hasher = Sha512::new();
    hasher.update(fs::read(&snapshot)?);
    let media = layout::media_files(root)?;
    for relative in &media {
        hasher.update(fs::read(root.join(relative))?);
    }
    hasher.update(seal_time.as_bytes());
    Ok((hex::encode(hasher.finalize()), media.len()))
}

/// # Errors
/// Returns an error when the key cannot initialize the MAC.
pub fn sign_digest(key: &SealKey, digest_hex: &str) -> Result<String, ArchiveError> {
    let mut mac = key.mac()?;
    mac.update(digest_hex.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Seal an extracted archive directory with the current time.
///
/// # Errors
/// Returns an error when hashing or writing the sidecar fails.
pub fn seal_dir(root: &Path, key: &SealKey) -> Result<Seal, ArchiveError> {
    let seal_time = seal_time_now()?;
    seal_dir_at(root, key, &seal_time)
}

/// Seal with an explicit seal time, replacing any sidecar already present.
///
/// # Errors
/// Returns an error when the seal time is malformed or hashing fails.
pub fn seal_dir_at(root: &Path, key: &SealKey, seal_time: &str) -> Result<Seal, ArchiveError> {
    parse_seal_time(seal_time)?;
    for stale in sidecars(root)? {
        fs::remove_file(stale)?;
    }

    let (digest, _) = compute_digest(root, seal_time)?;
    let signature = sign_digest(key, &digest)?;
    let sidecar = format!("{seal_time}{SIDECAR_SUFFIX}");
    fs::write(root.join(&sidecar), format!("{digest}\n{signature}\n"))?;
    tracing::debug!(seal_time, sidecar = %sidecar, "sealed archive");
    Ok(Seal { seal_time: seal_time.to_string(), digest, signature, sidecar })
}

/// Recompute the seal of an extracted archive and compare it with the sidecar.
///
/// Structural problems (no sidecar, several sidecars, malformed sidecar)
/// are errors; a digest or signature mismatch yields a failed report.
///
/// # Errors
/// Returns an error when the archive layout is invalid.
pub fn verify_dir(root: &Path, key: &SealKey) -> Result<VerificationReport, ArchiveError> {
    let mut found = sidecars(root)?;
    let sidecar = match found.len() {
        0 => return Err(ArchiveError::Format("archive has no seal sidecar".to_string())),
        1 => found.remove(0),
        count => {
            return Err(ArchiveError::Format(format!("archive has {count} seal sidecars")));
        }
    };

    let file_name = sidecar.file_name().map(|name| name.to_string_lossy().into_owned());
    let seal_time = file_name
        .as_deref()
        .and_then(|name| name.strip_suffix(SIDECAR_SUFFIX))
        .map(str::to_string)
        .ok_or_else(|| ArchiveError::Format("seal sidecar has an unexpected name".to_string()))?;
    parse_seal_time(&seal_time)?;

    let body = fs::read_to_string(&sidecar)?;
    let mut lines = body.lines().map(str::trim).filter(|line| !line.is_empty());
    let (Some(recorded_digest), Some(recorded_signature), None) =
        (lines.next(), lines.next(), lines.next())
    else {
        return Err(ArchiveError::Format(
            "seal sidecar must hold exactly a digest line and a signature line".to_string(),
        ));
    };
    let signature = hex::decode(recorded_signature)
        .map_err(|err| ArchiveError::Format(format!("seal signature is not valid hex: {err}")))?;

    let (computed_digest, attachments) = compute_digest(root, &seal_time)?;
    let mut mac = key.mac()?;
    mac.update(recorded_digest.as_bytes());
    let signature_valid = mac.verify_slice(&signature).is_ok();
    let digest_matches = computed_digest.eq_ignore_ascii_case(recorded_digest);

    let reason = match (digest_matches, signature_valid) {
        (true, true) => None,
        (false, _) => Some("archive contents do not match the recorded digest".to_string()),
        (true, false) => Some("seal signature does not match the seal key".to_string()),
    };
    if let Some(reason) = reason.as_deref() {
        tracing::warn!(seal_time = %seal_time, reason, "archive verification failed");
    }

    Ok(VerificationReport {
        passed: reason.is_none(),
        seal_time,
        recorded_digest: recorded_digest.to_string(),
        computed_digest,
        signature_valid,
        attachments,
        reason,
    })
}

/// Extract `archive` into a scratch directory under `scratch_dir` and verify it.
///
/// # Errors
/// Returns an error when the archive cannot be extracted or its layout is invalid.
pub fn verify_archive(
    archive: &Path,
    key: &SealKey,
    scratch_dir: &Path,
) -> Result<VerificationReport, ArchiveError> {
    let scratch = tempfile::Builder::new().prefix("labport-verify-").tempdir_in(scratch_dir)?;
    layout::unpack(archive, scratch.path())?;
    verify_dir(scratch.path(), key)
}

fn sidecars(root: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if entry.file_type()?.is_file() && name.ends_with(SIDECAR_SUFFIX) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}
