//! Portable lab archives: export, seal and verify, migrate, import.
//!
//! An archive is a zip holding a relational snapshot keyed by source ids,
//! the attachments those rows own, a provenance manifest, and a keyed seal.

mod error;
pub mod export;
pub mod import;
pub mod layout;
pub mod migrate;
pub mod seal;
pub mod snapshot;

pub use error::ArchiveError;
pub use export::{export_lab, ExportFailure, ExportOptions, ExportReport};
pub use import::{
    import_archive, import_snapshot, ImportError, ImportOptions, ImportOutcome, ImportReport,
    ImportTarget,
};
pub use layout::{ExportMetadata, SourceIdentity};
pub use migrate::{
    default_output_path, migrate_archive, MigrateOptions, MigrationFailure, MigrationReport,
};
pub use seal::{verify_archive, Seal, SealKey, VerificationReport};
