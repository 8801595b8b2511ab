use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use labport_archive::SealKey;
use labport_store_sqlite::SqliteStore;
use serde::Deserialize;

pub const DB_ENV: &str = "LABPORT_DB";
pub const MEDIA_ROOT_ENV: &str = "LABPORT_MEDIA_ROOT";
pub const SCRATCH_DIR_ENV: &str = "LABPORT_SCRATCH_DIR";
pub const SEAL_KEY_FILE_ENV: &str = "LABPORT_SEAL_KEY_FILE";
pub const CONFIG_ENV: &str = "LABPORT_CONFIG";

const DEFAULT_DB: &str = "./labport.sqlite3";

/// Global flags. Each falls back to its environment variable, then to the
/// config file, then to a default.
#[derive(Debug, Clone, Args)]
pub struct SettingsArgs {
    #[arg(long, global = true, env = DB_ENV)]
    pub db: Option<PathBuf>,
    #[arg(long, global = true, env = MEDIA_ROOT_ENV)]
    pub media_root: Option<PathBuf>,
    #[arg(long, global = true, env = SCRATCH_DIR_ENV)]
    pub scratch_dir: Option<PathBuf>,
    #[arg(long, global = true, env = SEAL_KEY_FILE_ENV)]
    pub key_file: Option<PathBuf>,
    #[arg(long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    db: Option<PathBuf>,
    media_root: Option<PathBuf>,
    scratch_dir: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        // Relative paths in the file are relative to the file itself.
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for entry in [
            &mut config.db,
            &mut config.media_root,
            &mut config.scratch_dir,
            &mut config.key_file,
        ] {
            if let Some(value) = entry.as_mut() {
                if value.is_relative() {
                    *value = base.join(&*value);
                }
            }
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub db: PathBuf,
    pub media_root: PathBuf,
    pub scratch_dir: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Settings {
    /// # Errors
    /// Returns an error when the config file cannot be read or parsed.
    pub fn resolve(args: &SettingsArgs) -> Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let db = args.db.clone().or(file.db).unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        let media_root = args
            .media_root
            .clone()
            .or(file.media_root)
            .unwrap_or_else(|| default_media_root(&db));
        Ok(Self {
            db,
            media_root,
            scratch_dir: args.scratch_dir.clone().or(file.scratch_dir),
            key_file: args.key_file.clone().or(file.key_file),
        })
    }

    /// # Errors
    /// Returns an error when no key file is configured or it is malformed.
    pub fn seal_key(&self) -> Result<SealKey> {
        let path = self.key_file.as_deref().ok_or_else(|| {
            anyhow!("a seal key is required: pass --key-file or set {SEAL_KEY_FILE_ENV}")
        })?;
        Ok(SealKey::read_hex_key_file(path)?)
    }

    /// Open the destination store and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store_unmigrated()?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened.
    pub fn open_store_unmigrated(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_media_root(&self.db, &self.media_root)
    }
}

fn default_media_root(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_os_string();
    name.push(".media");
    PathBuf::from(name)
}
