use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use labport_archive::{
    export_lab, import_archive, migrate_archive, verify_archive, ExportOptions, ImportError,
    ImportOptions, MigrateOptions,
};
use labport_core::{EntityClass, FailureClass, LATEST_FORMAT_VERSION};
use labport_store_sqlite::SqliteStore;
use serde_json::Value;

mod config;
mod logging;

use config::{Settings, SettingsArgs};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXIT_INTEGRITY_FAILED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "labport")]
#[command(about = "Export, verify, migrate and import lab record archives")]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Raise log verbosity on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a sealed archive of everything reachable from a lab.
    Export(ExportArgs),
    /// Check an archive's seal without importing it.
    Verify(VerifyArgs),
    /// Bring an archive forward to a newer format revision.
    Migrate(MigrateArgs),
    /// Import an archive into a user's lab.
    Import(ImportArgs),
    /// Delete everything a completed import created.
    Revert(RevertArgs),
    Imports {
        #[command(subcommand)]
        command: Box<ImportsCommand>,
    },
    Lab {
        #[command(subcommand)]
        command: Box<LabCommand>,
    },
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Lab id or name.
    lab: String,
    output: PathBuf,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    archive: PathBuf,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    archive: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = LATEST_FORMAT_VERSION)]
    target_version: u32,
    #[arg(long, default_value_t = false)]
    check_only: bool,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    archive: PathBuf,
    /// User id or name; the import lands in this user's lab.
    owner: String,
    #[arg(long, default_value_t = false)]
    no_vault: bool,
}

#[derive(Debug, Args)]
struct RevertArgs {
    import_id: String,
}

#[derive(Debug, Subcommand)]
enum ImportsCommand {
    List,
    Show { import_id: String },
    /// Mark an import as no longer revertible.
    Lock { import_id: String },
    /// Release a lab held by an import that was interrupted mid-run.
    Abandon { import_id: String },
}

#[derive(Debug, Subcommand)]
enum LabCommand {
    Create {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Create {
        #[arg(long)]
        name: String,
        /// Lab id or name.
        #[arg(long)]
        lab: String,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::resolve(&cli.settings)?;
    match cli.command {
        Command::Export(args) => run_export(&args, &settings),
        Command::Verify(args) => run_verify(&args, &settings),
        Command::Migrate(args) => run_migrate(&args, &settings),
        Command::Import(args) => run_import(&args, &settings),
        Command::Revert(args) => {
            let mut store = settings.open_store()?;
            let summary = store.revert_import(&args.import_id)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize revert summary")?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Imports { command } => {
            let mut store = settings.open_store()?;
            run_imports(*command, &mut store)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Lab { command } => {
            let mut store = settings.open_store()?;
            let LabCommand::Create { name } = *command;
            let lab = store.create_lab(&name)?;
            emit_json(serde_json::json!({ "lab": lab }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::User { command } => {
            let mut store = settings.open_store()?;
            let UserCommand::Create { name, lab } = *command;
            let lab = store.find_lab(&lab)?.ok_or_else(|| anyhow!("lab not found: {lab}"))?;
            let user = store.create_user(&name, lab.id)?;
            emit_json(serde_json::json!({ "user": user }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Db { command } => {
            let mut store = settings.open_store_unmigrated()?;
            run_db(*command, &mut store)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn failure_json(class: FailureClass, error: &dyn std::fmt::Display) -> Value {
    serde_json::json!({
        "status": "failed",
        "failure_class": class,
        "error": error.to_string()
    })
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Value::Object(base), Value::Object(extra)) = (&mut base, extra) {
        base.extend(extra);
    }
    base
}

fn run_export(args: &ExportArgs, settings: &Settings) -> Result<ExitCode> {
    let key = settings.seal_key()?;
    let store = settings.open_store()?;
    let lab = store.find_lab(&args.lab)?.ok_or_else(|| anyhow!("lab not found: {}", args.lab))?;
    let options = ExportOptions { scratch_dir: settings.scratch_dir.clone() };

    match export_lab(&store, &lab, &args.output, &key, &options) {
        Ok(report) => {
            let value = serde_json::to_value(&report).context("failed to serialize export report")?;
            emit_json(merge(serde_json::json!({ "status": "completed" }), value))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            emit_json(merge(
                failure_json(failure.error.class(), &failure.error),
                serde_json::json!({
                    "entities_serialized": failure.entities_serialized,
                    "log": failure.log
                }),
            ))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_verify(args: &VerifyArgs, settings: &Settings) -> Result<ExitCode> {
    let key = settings.seal_key()?;
    let scratch = settings.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);

    match verify_archive(&args.archive, &key, &scratch) {
        Ok(report) => {
            let passed = report.passed;
            emit_json(serde_json::to_value(&report).context("failed to serialize verification")?)?;
            if passed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_INTEGRITY_FAILED))
            }
        }
        Err(err) if matches!(err.class(), FailureClass::Format | FailureClass::Integrity) => {
            emit_json(serde_json::json!({
                "passed": false,
                "failure_class": err.class(),
                "reason": err.to_string()
            }))?;
            Ok(ExitCode::from(EXIT_INTEGRITY_FAILED))
        }
        Err(err) => Err(err.into()),
    }
}

fn run_migrate(args: &MigrateArgs, settings: &Settings) -> Result<ExitCode> {
    let key = settings.seal_key()?;
    let options = MigrateOptions {
        output: args.output.clone(),
        target_version: args.target_version,
        check_only: args.check_only,
        force: args.force,
        scratch_dir: settings.scratch_dir.clone(),
    };

    match migrate_archive(&args.archive, &key, &options) {
        Ok(report) => {
            emit_json(serde_json::to_value(&report).context("failed to serialize migration")?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            emit_json(merge(
                failure_json(failure.error.class(), &failure.error),
                serde_json::json!({
                    "detected": failure.detected,
                    "furthest_step": failure.furthest_step,
                    "log": failure.log
                }),
            ))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_import(args: &ImportArgs, settings: &Settings) -> Result<ExitCode> {
    let key = settings.seal_key()?;
    let mut store = settings.open_store()?;
    let owner =
        store.find_user(&args.owner)?.ok_or_else(|| anyhow!("user not found: {}", args.owner))?;
    let options = ImportOptions { vault: !args.no_vault, scratch_dir: settings.scratch_dir.clone() };

    match import_archive(&mut store, &args.archive, &owner, &key, &options) {
        Ok(report) => {
            emit_json(serde_json::to_value(&report).context("failed to serialize import report")?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let active = match &err {
                ImportError::ScopeBusy { active, .. } => Some(active.clone()),
                _ => None,
            };
            emit_json(merge(
                failure_json(err.class(), &err),
                serde_json::json!({
                    "import_id": err.import_id(),
                    "active_import": active
                }),
            ))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_imports(command: ImportsCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        ImportsCommand::List => {
            let records = store.list_import_records()?;
            emit_json(serde_json::json!({ "imports": records }))
        }
        ImportsCommand::Show { import_id } => {
            let record = store
                .import_record(&import_id)?
                .ok_or_else(|| anyhow!("import not found: {import_id}"))?;
            let mut objects_by_class: BTreeMap<EntityClass, u64> = BTreeMap::new();
            for entry in store.import_objects(&import_id)? {
                *objects_by_class.entry(entry.class).or_default() += 1;
            }
            let files = store.import_files(&import_id)?;
            emit_json(serde_json::json!({
                "import": record,
                "objects_by_class": objects_by_class,
                "files": files
            }))
        }
        ImportsCommand::Lock { import_id } => {
            let record = store.lock_import(&import_id)?;
            emit_json(serde_json::json!({ "import": record }))
        }
        ImportsCommand::Abandon { import_id } => {
            let record = store.abandon_import(&import_id)?;
            emit_json(serde_json::json!({ "import": record }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}
