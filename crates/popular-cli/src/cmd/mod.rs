//! Subcommand handlers. Each takes the resolved [`Context`] and its own
//! clap args.

pub mod ingest;
pub mod privacy;
pub mod run;
pub mod tallies;
pub mod top;
pub mod visits;

use anyhow::Result;
use popular_core::config::{PopularConfig, TallySettings, resolve_config};
use popular_core::db::store::TallyStore;
use std::path::{Path, PathBuf};

use crate::output::OutputMode;

/// Configuration, database location and output mode shared by every
/// subcommand.
#[derive(Debug)]
pub struct Context {
    pub config: PopularConfig,
    pub db_path: PathBuf,
    pub output: OutputMode,
}

impl Context {
    /// Resolve `popular.toml` and the database path. `--db` wins over
    /// `[storage] database`; relative paths resolve against `working_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed.
    pub fn load(
        config_path: Option<&Path>,
        db_override: Option<PathBuf>,
        output: OutputMode,
        working_dir: &Path,
    ) -> Result<Self> {
        let config = resolve_config(config_path, working_dir)?;
        let db = db_override.unwrap_or_else(|| config.storage.database.clone());
        let db_path = if db.is_absolute() { db } else { working_dir.join(db) };
        Ok(Self {
            config,
            db_path,
            output,
        })
    }

    /// Validated tally settings.
    ///
    /// # Errors
    ///
    /// Returns [`popular_core::config::ConfigError`] for malformed settings.
    pub fn settings(&self) -> Result<TallySettings> {
        Ok(self.config.tally.validate()?)
    }

    /// Open (and migrate) the tally database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_store(&self) -> Result<TallyStore> {
        TallyStore::open(&self.db_path)
    }
}
