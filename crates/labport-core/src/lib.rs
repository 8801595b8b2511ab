use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Newest archive format revision. Only archives at this revision are imported
/// directly; older ones pass through the migrator first.
pub const LATEST_FORMAT_VERSION: u32 = 4;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("identifier mapping error: {0}")]
    Mapping(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityClass {
    OntologyTerm,
    Instrument,
    Protocol,
    ProtocolStep,
    SamplePool,
    Session,
    Annotation,
    Booking,
    BillingEntry,
}

/// A foreign-key style column on an entity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub column: &'static str,
    pub target: EntityClass,
    pub required: bool,
}

impl Reference {
    const fn optional(column: &'static str, target: EntityClass) -> Self {
        Self { column, target, required: false }
    }

    const fn required(column: &'static str, target: EntityClass) -> Self {
        Self { column, target, required: true }
    }
}

const NO_REFERENCES: &[Reference] = &[];
const PROTOCOL_REFERENCES: &[Reference] =
    &[Reference::optional("ontology_term_id", EntityClass::OntologyTerm)];
const PROTOCOL_STEP_REFERENCES: &[Reference] = &[
    Reference::required("protocol_id", EntityClass::Protocol),
    Reference::optional("branch_from_step_id", EntityClass::ProtocolStep),
];
const SAMPLE_POOL_REFERENCES: &[Reference] =
    &[Reference::optional("parent_pool_id", EntityClass::SamplePool)];
const SESSION_REFERENCES: &[Reference] =
    &[Reference::optional("protocol_id", EntityClass::Protocol)];
const ANNOTATION_REFERENCES: &[Reference] = &[
    Reference::required("session_id", EntityClass::Session),
    Reference::optional("protocol_step_id", EntityClass::ProtocolStep),
];
const BOOKING_REFERENCES: &[Reference] = &[
    Reference::required("instrument_id", EntityClass::Instrument),
    Reference::optional("session_id", EntityClass::Session),
];
const BILLING_ENTRY_REFERENCES: &[Reference] =
    &[Reference::required("booking_id", EntityClass::Booking)];

impl EntityClass {
    /// Referenced classes come before referrers, containers before contained
    /// items, resources before the bookings that use them.
    pub const IMPORT_ORDER: [Self; 9] = [
        Self::OntologyTerm,
        Self::Instrument,
        Self::Protocol,
        Self::ProtocolStep,
        Self::SamplePool,
        Self::Session,
        Self::Annotation,
        Self::Booking,
        Self::BillingEntry,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OntologyTerm => "ontology_term",
            Self::Instrument => "instrument",
            Self::Protocol => "protocol",
            Self::ProtocolStep => "protocol_step",
            Self::SamplePool => "sample_pool",
            Self::Session => "session",
            Self::Annotation => "annotation",
            Self::Booking => "booking",
            Self::BillingEntry => "billing_entry",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::IMPORT_ORDER.into_iter().find(|class| class.as_str() == value)
    }

    /// Table name, identical in the snapshot and in the destination store.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::OntologyTerm => "ontology_terms",
            Self::Instrument => "instruments",
            Self::Protocol => "protocols",
            Self::ProtocolStep => "protocol_steps",
            Self::SamplePool => "sample_pools",
            Self::Session => "sessions",
            Self::Annotation => "annotations",
            Self::Booking => "bookings",
            Self::BillingEntry => "billing_entries",
        }
    }

    /// Plain value columns, excluding identifiers and references.
    #[must_use]
    pub fn data_columns(self) -> &'static [&'static str] {
        match self {
            Self::OntologyTerm => &["ontology", "accession", "label"],
            Self::Instrument => &["name", "location", "hourly_rate_cents", "visibility"],
            Self::Protocol => &["name", "description", "version", "visibility"],
            Self::ProtocolStep => &["position", "instruction"],
            Self::SamplePool => &["name", "description", "visibility"],
            Self::Session => &["title", "started_at", "ended_at", "notes", "visibility"],
            Self::Annotation => &["body", "created_at"],
            Self::Booking => &["starts_at", "ends_at", "cancelled"],
            Self::BillingEntry => &["amount_cents", "currency", "description"],
        }
    }

    #[must_use]
    pub fn references(self) -> &'static [Reference] {
        match self {
            Self::OntologyTerm | Self::Instrument => NO_REFERENCES,
            Self::Protocol => PROTOCOL_REFERENCES,
            Self::ProtocolStep => PROTOCOL_STEP_REFERENCES,
            Self::SamplePool => SAMPLE_POOL_REFERENCES,
            Self::Session => SESSION_REFERENCES,
            Self::Annotation => ANNOTATION_REFERENCES,
            Self::Booking => BOOKING_REFERENCES,
            Self::BillingEntry => BILLING_ENTRY_REFERENCES,
        }
    }

    pub fn self_references(self) -> impl Iterator<Item = &'static Reference> {
        self.references().iter().filter(move |reference| reference.target == self)
    }

    pub fn foreign_references(self) -> impl Iterator<Item = &'static Reference> {
        self.references().iter().filter(move |reference| reference.target != self)
    }

    /// Top-level entities are owned by a lab and a user and carry a visibility.
    #[must_use]
    pub fn is_top_level(self) -> bool {
        matches!(self, Self::Instrument | Self::Protocol | Self::SamplePool | Self::Session)
    }

    #[must_use]
    pub fn dependency_rank(self) -> usize {
        Self::IMPORT_ORDER.iter().position(|class| *class == self).unwrap_or(usize::MAX)
    }

    /// Every column stored for this class besides the identifier.
    #[must_use]
    pub fn all_columns(self) -> Vec<&'static str> {
        let mut columns = self.data_columns().to_vec();
        columns.extend(self.references().iter().map(|reference| reference.column));
        columns
    }
}

impl Display for EntityClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A many-to-many join table between two entity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub table: &'static str,
    pub left_column: &'static str,
    pub left: EntityClass,
    pub right_column: &'static str,
    pub right: EntityClass,
}

pub const RELATIONSHIPS: [Relationship; 2] = [
    Relationship {
        table: "session_sample_pools",
        left_column: "session_id",
        left: EntityClass::Session,
        right_column: "sample_pool_id",
        right: EntityClass::SamplePool,
    },
    Relationship {
        table: "annotation_terms",
        left_column: "annotation_id",
        left: EntityClass::Annotation,
        right_column: "ontology_term_id",
        right: EntityClass::OntologyTerm,
    },
];

#[must_use]
pub fn relationship_by_table(table: &str) -> Option<Relationship> {
    RELATIONSHIPS.into_iter().find(|relationship| relationship.table == table)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Lab,
    Public,
}

impl Visibility {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Lab => "lab",
            Self::Public => "public",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "private" => Some(Self::Private),
            "lab" => Some(Self::Lab),
            "public" => Some(Self::Public),
            _ => None,
        }
    }
}

/// How an archive's format revision was established.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "method", content = "version", rename_all = "snake_case")]
pub enum RevisionDetection {
    /// Read from the `format_meta` marker written at export time.
    ExplicitVersion(u32),
    /// Inferred from table and column presence in a pre-marker archive.
    HeuristicGuess(u32),
    Unknown,
}

impl RevisionDetection {
    #[must_use]
    pub fn version(self) -> Option<u32> {
        match self {
            Self::ExplicitVersion(version) | Self::HeuristicGuess(version) => Some(version),
            Self::Unknown => None,
        }
    }
}

impl Display for RevisionDetection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExplicitVersion(version) => write!(f, "{version} (explicit marker)"),
            Self::HeuristicGuess(version) => write!(f, "{version} (heuristic)"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStatus {
    InProgress,
    Completed,
    Failed,
    Reverted,
}

impl ImportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Reverted => "reverted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "reverted" => Some(Self::Reverted),
            _ => None,
        }
    }
}

/// Coarse error taxonomy reported to users next to the error text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureClass {
    Format,
    Integrity,
    Schema,
    MigrationStep,
    ImportObject,
    OptionalReference,
    Io,
    Storage,
}

impl FailureClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Integrity => "integrity",
            Self::Schema => "schema",
            Self::MigrationStep => "migration-step",
            Self::ImportObject => "import-object",
            Self::OptionalReference => "optional-reference",
            Self::Io => "io",
            Self::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MappingEntry {
    pub class: EntityClass,
    pub source_id: i64,
    pub destination_id: i64,
}

/// Source-id to destination-id table for one import.
///
/// Entries live in an append-only arena in creation order; the index resolves
/// `(class, source_id)` to an arena slot. A key maps to at most one
/// destination object.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    entries: Vec<MappingEntry>,
    index: HashMap<(EntityClass, i64), usize>,
}

impl IdentifierMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `source_id` of `class` was recreated as `destination_id`.
    ///
    /// # Errors
    /// Returns [`CoreError::Mapping`] when the source key is already mapped.
    pub fn insert(
        &mut self,
        class: EntityClass,
        source_id: i64,
        destination_id: i64,
    ) -> Result<(), CoreError> {
        if let Some(slot) = self.index.get(&(class, source_id)) {
            let existing = self.entries[*slot].destination_id;
            return Err(CoreError::Mapping(format!(
                "{class} source id {source_id} is already mapped to destination id {existing}"
            )));
        }

        self.index.insert((class, source_id), self.entries.len());
        self.entries.push(MappingEntry { class, source_id, destination_id });
        Ok(())
    }

    #[must_use]
    pub fn resolve(&self, class: EntityClass, source_id: i64) -> Option<i64> {
        self.index.get(&(class, source_id)).map(|slot| self.entries[*slot].destination_id)
    }

    #[must_use]
    pub fn contains(&self, class: EntityClass, source_id: i64) -> bool {
        self.index.contains_key(&(class, source_id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    #[must_use]
    pub fn counts_by_class(&self) -> BTreeMap<EntityClass, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.class).or_insert(0) += 1;
        }
        counts
    }
}
