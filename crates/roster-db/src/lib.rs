pub mod migrations;
pub mod models;
pub mod statements;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

pub use migrations::MigrationReport;
pub use statements::{Row, RunResult, Statement};

/// Where the database lives when the embedding process doesn't say otherwise.
pub const DEFAULT_DB_PATH: &str = "/tmp/users.db";

/// Owned handle to the bootstrapped database.
///
/// Construct it once at startup and share it (usually behind an `Arc`) with
/// everything that needs to run statements.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
    report: MigrationReport,
}

/// Bootstrap the database at [`DEFAULT_DB_PATH`].
pub fn initialize() -> Result<Database> {
    Database::open(Path::new(DEFAULT_DB_PATH))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create database directory {}", dir.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // WAL mode for concurrent reads
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let report = migrations::run(&conn)?;

        info!(
            "Database opened at {} (journal_mode={})",
            path.display(),
            journal_mode
        );
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            report,
        })
    }

    /// Raw access to the underlying connection for anything the statement
    /// helpers don't cover.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Outcome of the best-effort migration steps run by this open.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }
}
