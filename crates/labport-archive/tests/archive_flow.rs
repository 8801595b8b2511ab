use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use labport_archive::layout::{self, ExportMetadata, SourceIdentity, SNAPSHOT_FILE};
use labport_archive::seal::{self, SealKey};
use labport_archive::snapshot;
use labport_archive::{
    export_lab, import_archive, migrate_archive, verify_archive, ArchiveError, ExportOptions,
    ImportError, ImportOptions, MigrateOptions,
};
use labport_core::{
    EntityClass, FailureClass, ImportStatus, RevisionDetection, LATEST_FORMAT_VERSION,
    RELATIONSHIPS,
};
use labport_store_sqlite::{
    integer_value, text_value, EntityRow, ImportClaim, Lab, NewImportRecord, SqliteStore, User,
};
use rusqlite::types::Value;
use tempfile::TempDir;

fn seal_key() -> SealKey {
    SealKey::from_bytes([0x5a; 32])
}

fn open_store(dir: &Path, name: &str) -> Result<SqliteStore> {
    let mut store = SqliteStore::open_with_media_root(
        &dir.join(format!("{name}.sqlite3")),
        &dir.join(format!("{name}-media")),
    )?;
    store.migrate()?;
    Ok(store)
}

fn seed_owner(store: &mut SqliteStore, lab: &str, user: &str) -> Result<(Lab, User)> {
    let lab = store.create_lab(lab)?;
    let user = store.create_user(user, lab.id)?;
    Ok((lab, user))
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn row(values: &[(&str, Value)]) -> EntityRow {
    values.iter().map(|(column, value)| ((*column).to_string(), value.clone())).collect()
}

fn owned(lab: &Lab, user: &User, values: &[(&str, Value)]) -> EntityRow {
    let mut entity = row(values);
    entity.insert("lab_id".to_string(), Value::Integer(lab.id));
    entity.insert("owner_user_id".to_string(), Value::Integer(user.id));
    entity
}

struct Graph {
    first_step: i64,
    second_step: i64,
    session: i64,
}

/// One row of every class, both join tables, self references, and an attachment.
fn seed_full_graph(store: &mut SqliteStore, lab: &Lab, user: &User) -> Result<Graph> {
    let term = store.insert_entity(
        EntityClass::OntologyTerm,
        &row(&[
            ("ontology", text("OBI")),
            ("accession", text("OBI:0000070")),
            ("label", text("assay")),
        ]),
    )?;
    let mut protocol = owned(lab, user, &[("name", text("Staining")), ("visibility", text("lab"))]);
    protocol.insert("ontology_term_id".to_string(), Value::Integer(term));
    let protocol = store.insert_entity(EntityClass::Protocol, &protocol)?;

    let first_step = store.insert_entity(
        EntityClass::ProtocolStep,
        &row(&[
            ("protocol_id", Value::Integer(protocol)),
            ("position", Value::Integer(1)),
            ("instruction", text("Fix cells")),
        ]),
    )?;
    let second_step = store.insert_entity(
        EntityClass::ProtocolStep,
        &row(&[
            ("protocol_id", Value::Integer(protocol)),
            ("position", Value::Integer(2)),
            ("instruction", text("Stain")),
            ("branch_from_step_id", Value::Integer(first_step)),
        ]),
    )?;

    let parent_pool = store.insert_entity(
        EntityClass::SamplePool,
        &owned(lab, user, &[("name", text("Plate A")), ("visibility", text("public"))]),
    )?;
    let child_pool = store.insert_entity(
        EntityClass::SamplePool,
        &owned(
            lab,
            user,
            &[("name", text("Plate A row 1")), ("parent_pool_id", Value::Integer(parent_pool))],
        ),
    )?;

    let session = store.insert_entity(
        EntityClass::Session,
        &owned(
            lab,
            user,
            &[
                ("title", text("Run 1")),
                ("started_at", text("2026-03-01T09:00:00Z")),
                ("ended_at", text("2026-03-01T11:00:00Z")),
                ("protocol_id", Value::Integer(protocol)),
            ],
        ),
    )?;
    let annotation = store.insert_entity(
        EntityClass::Annotation,
        &row(&[
            ("session_id", Value::Integer(session)),
            ("protocol_step_id", Value::Integer(second_step)),
            ("body", text("nuclei clearly stained")),
            ("created_at", text("2026-03-01T10:00:00Z")),
        ]),
    )?;
    store.link(RELATIONSHIPS[0], session, child_pool)?;
    store.link(RELATIONSHIPS[1], annotation, term)?;

    let instrument = store.insert_entity(
        EntityClass::Instrument,
        &owned(lab, user, &[("name", text("Confocal")), ("hourly_rate_cents", Value::Integer(4500))]),
    )?;
    let booking = store.insert_entity(
        EntityClass::Booking,
        &row(&[
            ("instrument_id", Value::Integer(instrument)),
            ("session_id", Value::Integer(session)),
            ("starts_at", text("2026-03-01T09:00:00Z")),
            ("ends_at", text("2026-03-01T11:00:00Z")),
        ]),
    )?;
    store.insert_entity(
        EntityClass::BillingEntry,
        &row(&[
            ("booking_id", Value::Integer(booking)),
            ("amount_cents", Value::Integer(9000)),
            ("currency", text("EUR")),
        ]),
    )?;
    store.store_attachment(EntityClass::Session, session, "photo", "gel.png", b"gel image")?;

    Ok(Graph { first_step, second_step, session })
}

fn export_to(store: &SqliteStore, lab: &Lab, dir: &Path, name: &str) -> Result<PathBuf> {
    let output = dir.join(name);
    export_lab(store, lab, &output, &seal_key(), &ExportOptions::default())?;
    Ok(output)
}

/// Unpack an archive, let `edit` change the tree, then re-seal and re-pack it.
fn rewrite_archive(
    archive: &Path,
    output: &Path,
    edit: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let tree = TempDir::new()?;
    layout::unpack(archive, tree.path())?;
    edit(tree.path())?;
    seal::seal_dir(tree.path(), &seal_key())?;
    layout::write_archive(tree.path(), output)?;
    Ok(())
}

fn legacy_r1_archive(dir: &Path) -> Result<PathBuf> {
    let root = dir.join("r1-tree");
    fs::create_dir_all(&root)?;
    let conn = snapshot::create_snapshot(&root.join(SNAPSHOT_FILE), 1)?;
    conn.execute_batch(
        "INSERT INTO protocols(source_id, name) VALUES (10, 'Staining');
         INSERT INTO protocol_steps(source_id, protocol_id, position, instruction)
           VALUES (20, 10, 1, 'Fix cells');
         INSERT INTO instruments(source_id, name, location) VALUES (30, 'Confocal', 'Room 4');
         INSERT INTO sessions(source_id, protocol_id, title, started_at)
           VALUES (40, 10, 'Run 1', '2019-05-01T09:00:00Z');
         INSERT INTO annotations(source_id, session_id, protocol_step_id, body, created_at)
           VALUES (50, 40, 20, 'looks good', '2019-05-01T09:30:00Z');
         INSERT INTO bookings(source_id, instrument_id, session_id, starts_at, ends_at)
           VALUES (60, 30, 40, '2019-05-01T09:00:00Z', '2019-05-01T10:00:00Z');",
    )?;
    drop(conn);

    layout::write_metadata(
        &root,
        &ExportMetadata {
            format_version: 1,
            exported_at: "2019-05-02T00:00:00Z".to_string(),
            source: SourceIdentity {
                installation_id: "legacy-installation".to_string(),
                lab_id: 1,
                lab_name: "Old Lab".to_string(),
            },
            entity_counts: BTreeMap::new(),
            relationship_counts: BTreeMap::new(),
            attachment_count: 0,
            migrated_from: None,
        },
    )?;
    seal::seal_dir_at(&root, &seal_key(), "20190502T000000Z")?;
    let archive = dir.join("legacy.zip");
    layout::write_archive(&root, &archive)?;
    Ok(archive)
}

fn total_rows(store: &SqliteStore) -> Result<usize> {
    let mut total = 0;
    for class in EntityClass::IMPORT_ORDER {
        total += store.list_entities(class)?.len();
    }
    Ok(total)
}

#[test]
fn round_trip_recreates_graph_with_rewritten_references() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    let graph = seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    // Pre-existing rows shift destination ids away from source ids.
    destination.insert_entity(
        EntityClass::OntologyTerm,
        &row(&[("ontology", text("GO")), ("accession", text("GO:1")), ("label", text("x"))]),
    )?;

    let report =
        import_archive(&mut destination, &archive, &importer, &seal_key(), &ImportOptions::default())?;
    assert_eq!(report.status, ImportStatus::Completed);
    assert_eq!(report.detected, RevisionDetection::ExplicitVersion(LATEST_FORMAT_VERSION));
    assert_eq!(report.migrated_from, None);
    assert_eq!(report.objects_created, 11);
    assert_eq!(report.relationships_created, 2);
    assert_eq!(report.files_copied, 1);
    assert!(report.warnings.is_empty(), "unexpected warnings: {:?}", report.warnings);

    for class in EntityClass::IMPORT_ORDER {
        let expected = source.list_entities(class)?.len();
        let created = report.objects_by_class.get(&class).copied().unwrap_or(0);
        assert_eq!(created, u64::try_from(expected)?, "{class} count differs");
    }

    let id = &report.import_id;
    let resolve = |class, source_id| -> Result<i64> {
        destination
            .resolve_imported(id, class, source_id)?
            .ok_or_else(|| anyhow!("{class} {source_id} was not imported"))
    };
    let second_step = destination
        .load_entity(EntityClass::ProtocolStep, resolve(EntityClass::ProtocolStep, graph.second_step)?)?
        .ok_or_else(|| anyhow!("second step missing"))?;
    assert_eq!(
        integer_value(&second_step, "branch_from_step_id"),
        Some(resolve(EntityClass::ProtocolStep, graph.first_step)?)
    );

    let session_id = resolve(EntityClass::Session, graph.session)?;
    let pairs = destination.links(RELATIONSHIPS[0])?;
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].0, session_id);

    let attachments = destination.attachments_for(EntityClass::Session, session_id)?;
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].file_name, "gel.png");
    assert!(attachments[0].stored_path.starts_with(&format!("imports/{id}/")));
    assert_eq!(destination.read_attachment(&attachments[0])?, b"gel image");

    let integrity = destination.integrity_check()?;
    assert!(integrity.foreign_key_violations.is_empty());
    assert!(integrity.import_reference_violations.is_empty());
    Ok(())
}

#[test]
fn round_trip_without_vaulting_preserves_every_column() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (dest_lab, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    destination.insert_entity(
        EntityClass::OntologyTerm,
        &row(&[("ontology", text("GO")), ("accession", text("GO:1")), ("label", text("x"))]),
    )?;
    destination.insert_entity(
        EntityClass::Instrument,
        &owned(&dest_lab, &importer, &[("name", text("Widefield"))]),
    )?;

    let options = ImportOptions { vault: false, ..ImportOptions::default() };
    let report = import_archive(&mut destination, &archive, &importer, &seal_key(), &options)?;
    assert!(!report.vaulted);
    let id = &report.import_id;
    let resolve = |class, source_id| -> Result<i64> {
        destination
            .resolve_imported(id, class, source_id)?
            .ok_or_else(|| anyhow!("{class} {source_id} was not imported"))
    };

    let mut compared = 0;
    for class in EntityClass::IMPORT_ORDER {
        for source_row in source.list_entities(class)? {
            let source_id = integer_value(&source_row, "id")
                .ok_or_else(|| anyhow!("{class} row without id"))?;
            let destination_id = resolve(class, source_id)?;
            let imported = destination
                .load_entity(class, destination_id)?
                .ok_or_else(|| anyhow!("{class} {destination_id} missing"))?;

            for column in class.data_columns() {
                assert_eq!(
                    imported.get(*column),
                    source_row.get(*column),
                    "{class} {source_id}: {column} changed"
                );
            }
            for reference in class.references() {
                let expected = match integer_value(&source_row, reference.column) {
                    Some(target) => Some(resolve(reference.target, target)?),
                    None => None,
                };
                assert_eq!(
                    integer_value(&imported, reference.column),
                    expected,
                    "{class} {source_id}: {} not rewritten",
                    reference.column
                );
            }
            if class.is_top_level() {
                assert_eq!(integer_value(&imported, "lab_id"), Some(dest_lab.id));
                assert_eq!(integer_value(&imported, "owner_user_id"), Some(importer.id));
            }
            compared += 1;
        }
    }
    assert_eq!(compared, 11);
    Ok(())
}

#[test]
fn missing_endpoints_and_optional_targets_become_warnings() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    // The child pool is a session_sample_pools endpoint; the term is an
    // annotation_terms endpoint and the protocol's optional ontology term.
    let partial = dir.path().join("partial.zip");
    rewrite_archive(&archive, &partial, |root| {
        let conn = snapshot::open_snapshot(&root.join(SNAPSHOT_FILE))?;
        conn.execute_batch(
            "DELETE FROM sample_pools WHERE parent_pool_id IS NOT NULL;
             DELETE FROM ontology_terms;",
        )?;
        Ok(())
    })?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    let report =
        import_archive(&mut destination, &partial, &importer, &seal_key(), &ImportOptions::default())?;
    assert_eq!(report.status, ImportStatus::Completed);
    assert_eq!(report.objects_created, 9);
    assert_eq!(report.relationships_created, 0);
    assert!(destination.links(RELATIONSHIPS[0])?.is_empty());
    assert!(destination.links(RELATIONSHIPS[1])?.is_empty());

    let protocols = destination.list_entities(EntityClass::Protocol)?;
    assert_eq!(protocols.len(), 1);
    assert_eq!(integer_value(&protocols[0], "ontology_term_id"), None);

    assert_eq!(report.warnings.len(), 3, "warnings: {:?}", report.warnings);
    let mentions = |needle: &str| report.warnings.iter().any(|warning| warning.contains(needle));
    assert!(mentions("skipped session_sample_pools row"));
    assert!(mentions("skipped annotation_terms row"));
    assert!(mentions("ontology_term_id points at ontology_term"));

    let record = destination
        .import_record(&report.import_id)?
        .ok_or_else(|| anyhow!("import record missing"))?;
    assert_eq!(record.warnings, 3);
    assert_eq!(record.relationships_created, 0);
    Ok(())
}

#[test]
fn export_refuses_to_overwrite_existing_output() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, _) = seed_owner(&mut source, "Imaging Core", "ada")?;
    let output = dir.path().join("taken.zip");
    fs::write(&output, b"keep me")?;

    let failure = match export_lab(&source, &lab, &output, &seal_key(), &ExportOptions::default())
    {
        Ok(report) => return Err(anyhow!("export should refuse, wrote {:?}", report.output)),
        Err(failure) => failure,
    };
    assert!(matches!(failure.error, ArchiveError::OutputExists(_)));
    assert_eq!(failure.entities_serialized, 0);
    assert_eq!(fs::read(&output)?, b"keep me");
    Ok(())
}

#[test]
fn verification_is_deterministic_and_rejects_tampering() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let first = verify_archive(&archive, &seal_key(), dir.path())?;
    let second = verify_archive(&archive, &seal_key(), dir.path())?;
    assert!(first.passed);
    assert_eq!(first, second);

    let wrong_key = verify_archive(&archive, &SealKey::from_bytes([1; 32]), dir.path())?;
    assert!(!wrong_key.passed);

    let tampered = dir.path().join("tampered.zip");
    let tree = TempDir::new()?;
    layout::unpack(&archive, tree.path())?;
    let media = layout::media_files(tree.path())?;
    let photo = tree.path().join(&media[0]);
    let mut bytes = fs::read(&photo)?;
    bytes[0] ^= 0x01;
    fs::write(&photo, bytes)?;
    layout::write_archive(tree.path(), &tampered)?;

    let report = verify_archive(&tampered, &seal_key(), dir.path())?;
    assert!(!report.passed);
    assert_ne!(report.recorded_digest, report.computed_digest);

    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    let err = match import_archive(
        &mut destination,
        &tampered,
        &importer,
        &seal_key(),
        &ImportOptions::default(),
    ) {
        Ok(report) => return Err(anyhow!("tampered archive imported as {}", report.import_id)),
        Err(err) => err,
    };
    assert_eq!(err.class(), FailureClass::Integrity);
    assert_eq!(total_rows(&destination)?, 0);
    Ok(())
}

#[test]
fn legacy_archive_migrates_forward_once() -> Result<()> {
    let dir = TempDir::new()?;
    let legacy = legacy_r1_archive(dir.path())?;

    let plan = migrate_archive(
        &legacy,
        &seal_key(),
        &MigrateOptions { check_only: true, ..MigrateOptions::default() },
    )?;
    assert_eq!(plan.detected, RevisionDetection::HeuristicGuess(1));
    assert_eq!(plan.planned_steps, vec![2, 3, 4]);
    assert!(plan.applied_steps.is_empty());
    assert!(plan.output.is_none());
    assert!(!dir.path().join("legacy.v4.zip").exists());

    let original = fs::read(&legacy)?;
    let report = migrate_archive(&legacy, &seal_key(), &MigrateOptions::default())?;
    assert_eq!(report.applied_steps, vec![2, 3, 4]);
    let output = report.output.clone().ok_or_else(|| anyhow!("no output written"))?;
    assert_eq!(output, dir.path().join("legacy.v4.zip"));
    assert_eq!(fs::read(&legacy)?, original);
    assert!(verify_archive(&output, &seal_key(), dir.path())?.passed);

    let tree = TempDir::new()?;
    layout::unpack(&output, tree.path())?;
    let metadata = layout::read_metadata(tree.path())?;
    assert_eq!(metadata.format_version, LATEST_FORMAT_VERSION);
    assert_eq!(metadata.migrated_from, Some(1));

    let again = migrate_archive(
        &output,
        &seal_key(),
        &MigrateOptions { output: Some(dir.path().join("again.zip")), ..MigrateOptions::default() },
    )?;
    assert!(again.up_to_date);
    assert_eq!(again.detected, RevisionDetection::ExplicitVersion(LATEST_FORMAT_VERSION));
    assert!(again.log.iter().any(|line| line.contains("already at target version 4")));
    assert!(!dir.path().join("again.zip").exists());

    let refused = match migrate_archive(&legacy, &seal_key(), &MigrateOptions::default()) {
        Ok(_) => return Err(anyhow!("existing output should be refused without force")),
        Err(failure) => failure,
    };
    assert!(matches!(refused.error, ArchiveError::OutputExists(_)));

    fs::write(&output, b"stale bytes")?;
    let forced = migrate_archive(
        &legacy,
        &seal_key(),
        &MigrateOptions { force: true, ..MigrateOptions::default() },
    )?;
    assert_eq!(forced.output.as_deref(), Some(output.as_path()));
    assert_ne!(fs::read(&output)?, b"stale bytes");
    assert!(!layout::partial_path(&output).exists());
    assert!(verify_archive(&output, &seal_key(), dir.path())?.passed);
    Ok(())
}

#[test]
fn downgrade_is_refused() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, _) = seed_owner(&mut source, "Imaging Core", "ada")?;
    let archive = export_to(&source, &lab, dir.path(), "current.zip")?;

    let failure = match migrate_archive(
        &archive,
        &seal_key(),
        &MigrateOptions { target_version: 2, ..MigrateOptions::default() },
    ) {
        Ok(_) => return Err(anyhow!("downgrade should be refused")),
        Err(failure) => failure,
    };
    assert!(matches!(failure.error, ArchiveError::Schema(_)));
    assert_eq!(failure.detected, Some(RevisionDetection::ExplicitVersion(LATEST_FORMAT_VERSION)));
    assert_eq!(failure.furthest_step, None);
    Ok(())
}

#[test]
fn importer_migrates_legacy_working_copy() -> Result<()> {
    let dir = TempDir::new()?;
    let legacy = legacy_r1_archive(dir.path())?;
    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;

    let report =
        import_archive(&mut destination, &legacy, &importer, &seal_key(), &ImportOptions::default())?;
    assert_eq!(report.detected, RevisionDetection::HeuristicGuess(1));
    assert_eq!(report.migrated_from, Some(1));
    assert_eq!(report.objects_created, 6);
    assert_eq!(report.source_installation, "legacy-installation");

    let booking = destination
        .list_entities(EntityClass::Booking)?
        .pop()
        .ok_or_else(|| anyhow!("booking missing"))?;
    assert_eq!(integer_value(&booking, "cancelled"), Some(0));
    Ok(())
}

#[test]
fn failed_object_rolls_back_entire_import() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    let graph = seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    // Dropping the session leaves the annotation's required session_id dangling.
    let broken = dir.path().join("broken.zip");
    rewrite_archive(&archive, &broken, |root| {
        let conn = snapshot::open_snapshot(&root.join(SNAPSHOT_FILE))?;
        conn.execute("DELETE FROM sessions WHERE source_id = ?1", [graph.session])?;
        Ok(())
    })?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    let err = match import_archive(
        &mut destination,
        &broken,
        &importer,
        &seal_key(),
        &ImportOptions::default(),
    ) {
        Ok(report) => return Err(anyhow!("broken archive imported as {}", report.import_id)),
        Err(err) => err,
    };
    assert_eq!(err.class(), FailureClass::ImportObject);
    let import_id = err.import_id().ok_or_else(|| anyhow!("failure should name the import"))?;

    assert_eq!(total_rows(&destination)?, 0);
    assert!(destination.import_objects(import_id)?.is_empty());
    assert!(!destination.import_media_dir(import_id).exists());
    let record =
        destination.import_record(import_id)?.ok_or_else(|| anyhow!("import record missing"))?;
    assert_eq!(record.status, ImportStatus::Failed);
    assert!(record.error.as_deref().is_some_and(|error| error.contains("annotation")));

    // The lab is free again once the failed import is recorded.
    assert!(destination.active_import_for_lab(importer.lab_id)?.is_none());
    Ok(())
}

#[test]
fn three_protocols_five_sessions_forty_annotations_scenario() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;

    let mut protocols = Vec::new();
    for index in 0..3 {
        protocols.push(source.insert_entity(
            EntityClass::Protocol,
            &owned(&lab, &user, &[("name", text(&format!("Protocol {index}")))]),
        )?);
    }
    let mut sessions = Vec::new();
    for index in 0..5 {
        sessions.push(source.insert_entity(
            EntityClass::Session,
            &owned(
                &lab,
                &user,
                &[
                    ("title", text(&format!("Session {index}"))),
                    ("started_at", text("2026-03-01T09:00:00Z")),
                    ("protocol_id", Value::Integer(protocols[index % 3])),
                ],
            ),
        )?);
    }
    for index in 0..40 {
        source.insert_entity(
            EntityClass::Annotation,
            &row(&[
                ("session_id", Value::Integer(sessions[index % 5])),
                ("body", text(&format!("note {index}"))),
                ("created_at", text("2026-03-01T10:00:00Z")),
            ]),
        )?;
    }
    source.store_attachment(EntityClass::Annotation, 12, "photo", "cells.jpg", b"photo twelve")?;

    let archive = export_to(&source, &lab, dir.path(), "scenario.zip")?;
    let tree = TempDir::new()?;
    layout::unpack(&archive, tree.path())?;
    assert_eq!(layout::media_files(tree.path())?, vec!["media/annotation/photo_12".to_string()]);

    let mut destination = open_store(dir.path(), "destination")?;
    let (dest_lab, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    // Existing annotations occupy the low ids, so source id 12 cannot land on 12.
    let local_session = destination.insert_entity(
        EntityClass::Session,
        &owned(
            &dest_lab,
            &importer,
            &[("title", text("Local run")), ("started_at", text("2026-02-01T09:00:00Z"))],
        ),
    )?;
    for index in 0..3 {
        destination.insert_entity(
            EntityClass::Annotation,
            &row(&[
                ("session_id", Value::Integer(local_session)),
                ("body", text(&format!("local {index}"))),
                ("created_at", text("2026-02-01T10:00:00Z")),
            ]),
        )?;
    }

    let report =
        import_archive(&mut destination, &archive, &importer, &seal_key(), &ImportOptions::default())?;
    assert_eq!(report.objects_created, 48);
    assert_eq!(report.files_copied, 1);

    let annotation = destination
        .resolve_imported(&report.import_id, EntityClass::Annotation, 12)?
        .ok_or_else(|| anyhow!("annotation 12 not mapped"))?;
    assert_eq!(annotation, 15);
    assert!(destination.attachments_for(EntityClass::Annotation, 12)?.is_empty());
    let attachments = destination.attachments_for(EntityClass::Annotation, annotation)?;
    assert_eq!(attachments.len(), 1);
    assert_eq!(destination.read_attachment(&attachments[0])?, b"photo twelve");

    let files = destination.import_files(&report.import_id)?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].source_path, "media/annotation/photo_12");
    Ok(())
}

#[test]
fn vaulting_hides_imported_entities_from_the_rest_of_the_lab() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut vaulted_store = open_store(dir.path(), "vaulted")?;
    let (vault_lab, importer) = seed_owner(&mut vaulted_store, "Partner Lab", "grace")?;
    let colleague = vaulted_store.create_user("linus", vault_lab.id)?;
    import_archive(&mut vaulted_store, &archive, &importer, &seal_key(), &ImportOptions::default())?;

    for class in EntityClass::IMPORT_ORDER.into_iter().filter(|class| class.is_top_level()) {
        let mine = vaulted_store.visible_entities(class, importer.id)?;
        assert_eq!(mine.len(), vaulted_store.list_entities(class)?.len(), "{class}");
        assert!(mine.iter().all(|entity| text_value(entity, "visibility") == Some("private")));
        assert!(vaulted_store.visible_entities(class, colleague.id)?.is_empty(), "{class} leaked");
    }

    let mut open_store_ = open_store(dir.path(), "open")?;
    let (open_lab, importer) = seed_owner(&mut open_store_, "Open Lab", "grace")?;
    let colleague = open_store_.create_user("linus", open_lab.id)?;
    let report = import_archive(
        &mut open_store_,
        &archive,
        &importer,
        &seal_key(),
        &ImportOptions { vault: false, scratch_dir: None },
    )?;
    assert!(!report.vaulted);
    let shared = open_store_.visible_entities(EntityClass::Protocol, colleague.id)?;
    assert_eq!(shared.len(), 1);
    assert_eq!(integer_value(&shared[0], "lab_id"), Some(open_lab.id));
    assert_eq!(integer_value(&shared[0], "owner_user_id"), Some(importer.id));
    Ok(())
}

#[test]
fn concurrent_import_into_same_lab_is_refused() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, _) = seed_owner(&mut source, "Imaging Core", "ada")?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (dest_lab, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    let claim = destination.begin_import(&NewImportRecord {
        import_id: "held".to_string(),
        user_id: importer.id,
        lab_id: dest_lab.id,
        archive_name: "other.zip".to_string(),
        vaulted: true,
    })?;
    assert!(matches!(claim, ImportClaim::Started(_)));

    let err = match import_archive(
        &mut destination,
        &archive,
        &importer,
        &seal_key(),
        &ImportOptions::default(),
    ) {
        Ok(_) => return Err(anyhow!("second import should be refused")),
        Err(err) => err,
    };
    assert!(matches!(err, ImportError::ScopeBusy { ref active, .. } if active == "held"));
    Ok(())
}

#[test]
fn interrupted_import_holds_lab_across_restart_until_abandoned() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (dest_lab, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    destination.begin_import(&NewImportRecord {
        import_id: "crashed".to_string(),
        user_id: importer.id,
        lab_id: dest_lab.id,
        archive_name: "imaging.zip".to_string(),
        vaulted: true,
    })?;
    drop(destination);

    let mut destination = open_store(dir.path(), "destination")?;
    let busy =
        import_archive(&mut destination, &archive, &importer, &seal_key(), &ImportOptions::default());
    assert!(matches!(busy, Err(ImportError::ScopeBusy { ref active, .. }) if active == "crashed"));

    let abandoned = destination.abandon_import("crashed")?;
    assert_eq!(abandoned.status, ImportStatus::Failed);

    let report =
        import_archive(&mut destination, &archive, &importer, &seal_key(), &ImportOptions::default())?;
    assert_eq!(report.status, ImportStatus::Completed);
    let record = destination
        .import_record(&report.import_id)?
        .ok_or_else(|| anyhow!("retried import should be recorded"))?;
    assert_eq!(record.status, ImportStatus::Completed);
    Ok(())
}

#[test]
fn revert_removes_import_and_its_media() -> Result<()> {
    let dir = TempDir::new()?;
    let mut source = open_store(dir.path(), "source")?;
    let (lab, user) = seed_owner(&mut source, "Imaging Core", "ada")?;
    seed_full_graph(&mut source, &lab, &user)?;
    let archive = export_to(&source, &lab, dir.path(), "imaging.zip")?;

    let mut destination = open_store(dir.path(), "destination")?;
    let (_, importer) = seed_owner(&mut destination, "Partner Lab", "grace")?;
    let report =
        import_archive(&mut destination, &archive, &importer, &seal_key(), &ImportOptions::default())?;
    assert!(destination.import_media_dir(&report.import_id).is_dir());

    let summary = destination.revert_import(&report.import_id)?;
    assert_eq!(summary.objects_deleted, report.objects_created);
    assert_eq!(summary.relationships_deleted, 2);
    assert_eq!(summary.attachments_deleted, 1);
    assert!(summary.media_removed);
    assert_eq!(total_rows(&destination)?, 0);
    assert!(!destination.import_media_dir(&report.import_id).exists());
    Ok(())
}
