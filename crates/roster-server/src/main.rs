use std::path::PathBuf;

use tracing::{info, warn};

use roster_db::Database;

const TABLES: &[&str] = &[
    "users",
    "changelog",
    "feedback",
    "user_settings",
    "user_sessions",
    "comments",
    "likes",
];

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster=debug,roster_db=debug".into()),
        )
        .init();

    // Init database, at ROSTER_DB_PATH when set
    let db = match std::env::var("ROSTER_DB_PATH") {
        Ok(db_path) => Database::open(&PathBuf::from(db_path))?,
        Err(_) => roster_db::initialize()?,
    };

    log_migrations(&db);
    log_table_counts(&db)?;

    info!("Roster database ready at {}", db.path().display());
    Ok(())
}

fn log_migrations(db: &Database) {
    let report = db.migration_report();
    match &report.error {
        Some(e) => warn!("Schema may be partially migrated: {}", e),
        None if report.added.is_empty() && report.rebuilt.is_empty() => {
            info!("Schema already up to date")
        }
        None => info!(
            "Added columns [{}], rebuilt tables [{}], backfilled {} row(s)",
            report.added.join(", "),
            report.rebuilt.join(", "),
            report.backfilled
        ),
    }
}

fn log_table_counts(db: &Database) -> anyhow::Result<()> {
    for table in TABLES {
        let count = db
            .get(&format!("SELECT COUNT(*) AS n FROM {}", table), [])?
            .and_then(|row| row.get("n").and_then(|n| n.as_i64()))
            .unwrap_or(0);
        info!("{}: {} row(s)", table, count);
    }
    Ok(())
}
