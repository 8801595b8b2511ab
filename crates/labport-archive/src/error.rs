use std::path::PathBuf;

use labport_core::{EntityClass, FailureClass};

/// Archive error type
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Invalid archive: {0}")]
    Format(String),
    #[error("Integrity check failed: {0}")]
    Integrity(String),
    #[error("Unsupported schema: {0}")]
    Schema(String),
    #[error("Migration step {step} failed: {message}")]
    MigrationStep { step: u32, message: String },
    #[error("Could not import {class} with source id {source_id}: {message}")]
    ImportObject { class: EntityClass, source_id: i64, message: String },
    #[error("Output path already exists: {}", .0.display())]
    OutputExists(PathBuf),
    #[error("Store error: {0}")]
    Storage(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ArchiveError {
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Format(_) | Self::Zip(_) | Self::Json(_) => FailureClass::Format,
            Self::Integrity(_) => FailureClass::Integrity,
            Self::Schema(_) => FailureClass::Schema,
            Self::MigrationStep { .. } => FailureClass::MigrationStep,
            Self::ImportObject { .. } => FailureClass::ImportObject,
            Self::OutputExists(_) | Self::Io(_) => FailureClass::Io,
            Self::Storage(_) | Self::Sqlite(_) => FailureClass::Storage,
        }
    }

    pub(crate) fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_failure_classes() {
        let object = ArchiveError::ImportObject {
            class: EntityClass::Annotation,
            source_id: 3,
            message: "NOT NULL constraint failed: annotations.session_id".to_string(),
        };
        assert_eq!(object.class(), FailureClass::ImportObject);
        assert!(object.to_string().contains("annotation with source id 3"));

        let step = ArchiveError::MigrationStep { step: 3, message: "duplicate column".to_string() };
        assert_eq!(step.class(), FailureClass::MigrationStep);
        assert_eq!(ArchiveError::Format("x".to_string()).class(), FailureClass::Format);
        assert_eq!(ArchiveError::storage(&anyhow::anyhow!("locked")).class(), FailureClass::Storage);
    }
}
