use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, error, info, warn};

const USERS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id              TEXT PRIMARY KEY,
        email           TEXT UNIQUE NOT NULL,
        password_hash   TEXT NOT NULL,
        username        TEXT,
        bio             TEXT,
        avatar_url      TEXT,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL
    );
";

// changelog.author_id carries no REFERENCES clause: with foreign keys
// enforced, deleting an author must leave the entry behind, not fail.
const DEPENDENT_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS changelog (
        id          TEXT PRIMARY KEY,
        title       TEXT NOT NULL,
        content     TEXT NOT NULL,
        author_id   TEXT NOT NULL,
        created_at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS feedback (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        content     TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS user_settings (
        user_id             TEXT PRIMARY KEY,
        localstorage_data   TEXT,
        theme               TEXT DEFAULT 'dark',
        updated_at          INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS user_sessions (
        session_id  TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        expires_at  INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS comments (
        id          TEXT PRIMARY KEY,
        type        TEXT NOT NULL,
        target_id   TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        content     TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS likes (
        id          TEXT PRIMARY KEY,
        type        TEXT NOT NULL,
        target_id   TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        UNIQUE(type, target_id, user_id),
        FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_users_email ON users(email);
    CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON user_sessions(user_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_expires ON user_sessions(expires_at);
";

// Files created before foreign keys were enforced declare
// `FOREIGN KEY (author_id) REFERENCES users(id)` on changelog. The table is
// rebuilt without it so authors stay deletable.
const CHANGELOG_REBUILD: &str = "
    CREATE TABLE changelog_rebuild (
        id          TEXT PRIMARY KEY,
        title       TEXT NOT NULL,
        content     TEXT NOT NULL,
        author_id   TEXT NOT NULL,
        created_at  INTEGER NOT NULL
    );

    INSERT INTO changelog_rebuild (id, title, content, author_id, created_at)
        SELECT id, title, content, author_id, created_at FROM changelog;

    DROP TABLE changelog;
    ALTER TABLE changelog_rebuild RENAME TO changelog;
";

/// A column added to `users` after the table first shipped.
struct ColumnStep {
    column: &'static str,
    sql: &'static str,
    /// Runs after the column is added, only if `users` already had rows.
    backfill: Option<&'static str>,
}

/// Column additions in the order they shipped. New columns are appended here.
const USER_COLUMNS: &[ColumnStep] = &[
    ColumnStep {
        column: "email_verified",
        sql: "ALTER TABLE users ADD COLUMN email_verified INTEGER DEFAULT 0",
        // Accounts created before verification existed are grandfathered in.
        backfill: Some("UPDATE users SET email_verified = 1"),
    },
    ColumnStep {
        column: "verification_token",
        sql: "ALTER TABLE users ADD COLUMN verification_token TEXT",
        backfill: None,
    },
    ColumnStep {
        column: "is_admin",
        sql: "ALTER TABLE users ADD COLUMN is_admin INTEGER DEFAULT 0",
        backfill: None,
    },
    ColumnStep {
        column: "school",
        sql: "ALTER TABLE users ADD COLUMN school TEXT",
        backfill: None,
    },
    ColumnStep {
        column: "age",
        sql: "ALTER TABLE users ADD COLUMN age INTEGER",
        backfill: None,
    },
    ColumnStep {
        column: "ip",
        sql: "ALTER TABLE users ADD COLUMN ip TEXT",
        backfill: None,
    },
];

/// What the column migration pass did on this open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Columns added, in order.
    pub added: Vec<&'static str>,
    /// Rows touched by backfills.
    pub backfilled: usize,
    /// Tables rebuilt to drop a legacy constraint.
    pub rebuilt: Vec<&'static str>,
    /// First failure of the best-effort steps. The schema is left as it was at that point.
    pub error: Option<String>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Bring the schema up to date.
///
/// Table creation failures are returned; failures in the column pass or the
/// changelog rebuild are logged and recorded in the report instead.
pub fn run(conn: &Connection) -> Result<MigrationReport> {
    conn.execute_batch(USERS_TABLE)
        .context("Failed to create users table")?;

    let mut report = upgrade_users(conn);

    conn.execute_batch(DEPENDENT_TABLES)
        .context("Failed to create dependent tables")?;

    detach_changelog_author(conn, &mut report);

    info!(
        "Database migrations complete ({} column(s) added)",
        report.added.len()
    );
    Ok(report)
}

/// Best-effort column pass over `users`. Never fails; see [`MigrationReport::error`].
pub fn upgrade_users(conn: &Connection) -> MigrationReport {
    let mut report = MigrationReport::default();

    if let Err(e) = apply_column_steps(conn, USER_COLUMNS, &mut report) {
        error!("Migration error: {:#}", e);
        report.error = Some(format!("{:#}", e));
    }

    report
}

fn apply_column_steps(
    conn: &Connection,
    steps: &[ColumnStep],
    report: &mut MigrationReport,
) -> Result<()> {
    let columns = table_columns(conn, "users")?;

    // Must be counted before any ALTER so backfills see the old population.
    let existing_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
        .context("Failed to count existing users")?;

    for step in steps {
        if columns.iter().any(|c| c == step.column) {
            debug!("users.{} already present", step.column);
            continue;
        }

        conn.execute_batch(step.sql)
            .with_context(|| format!("Failed to add users.{}", step.column))?;
        info!("Added {} column to users", step.column);
        report.added.push(step.column);

        if let Some(backfill) = step.backfill.filter(|_| existing_rows > 0) {
            let touched = conn
                .execute(backfill, [])
                .with_context(|| format!("Failed to backfill users.{}", step.column))?;
            warn!(
                "Backfilled users.{} on {} pre-existing row(s)",
                step.column, touched
            );
            report.backfilled += touched;
        }
    }

    Ok(())
}

/// Best-effort rebuild of a legacy `changelog` whose author column still
/// references `users`. Failures are logged and recorded in the report.
pub fn detach_changelog_author(conn: &Connection, report: &mut MigrationReport) {
    if let Err(e) = rebuild_changelog(conn, report) {
        error!("Migration error: {:#}", e);
        if report.error.is_none() {
            report.error = Some(format!("{:#}", e));
        }
    }
}

fn rebuild_changelog(conn: &Connection, report: &mut MigrationReport) -> Result<()> {
    if !references_table(conn, "changelog", "users")? {
        debug!("changelog.author_id already unconstrained");
        return Ok(());
    }

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(CHANGELOG_REBUILD)
        .context("Failed to rebuild changelog")?;
    tx.commit()?;

    info!("Rebuilt changelog without the users foreign key");
    report.rebuilt.push("changelog");
    Ok(())
}

/// Whether `table` declares a foreign key into `parent`.
pub fn references_table(conn: &Connection, table: &str, parent: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_foreign_key_list(?1) WHERE \"table\" = ?2",
        [table, parent],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Live column names of `table`, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_users(conn: &Connection) {
        conn.execute_batch(USERS_TABLE).unwrap();
    }

    fn insert_legacy_user(conn: &Connection, id: &str, email: &str) {
        conn.execute(
            "INSERT INTO users (id, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, 'hash', 1, 1)",
            [id, email],
        )
        .unwrap();
    }

    fn column_info(conn: &Connection, column: &str) -> (bool, Option<String>) {
        conn.query_row(
            "SELECT \"notnull\", dflt_value FROM pragma_table_info('users') WHERE name = ?1",
            [column],
            |row| Ok((row.get::<_, i64>(0)? == 1, row.get(1)?)),
        )
        .unwrap()
    }

    #[test]
    fn fresh_database_gets_all_fourteen_user_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let report = run(&conn).unwrap();

        assert!(report.is_clean());
        assert_eq!(report.backfilled, 0);
        assert_eq!(
            table_columns(&conn, "users").unwrap(),
            vec![
                "id",
                "email",
                "password_hash",
                "username",
                "bio",
                "avatar_url",
                "created_at",
                "updated_at",
                "email_verified",
                "verification_token",
                "is_admin",
                "school",
                "age",
                "ip",
            ]
        );
    }

    #[test]
    fn user_columns_have_documented_nullability_and_defaults() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        assert_eq!(column_info(&conn, "email"), (true, None));
        assert_eq!(column_info(&conn, "password_hash"), (true, None));
        assert_eq!(column_info(&conn, "created_at"), (true, None));
        assert_eq!(column_info(&conn, "updated_at"), (true, None));
        assert_eq!(column_info(&conn, "username"), (false, None));
        assert_eq!(column_info(&conn, "email_verified"), (false, Some("0".into())));
        assert_eq!(column_info(&conn, "is_admin"), (false, Some("0".into())));
        assert_eq!(column_info(&conn, "verification_token"), (false, None));
        assert_eq!(column_info(&conn, "age"), (false, None));
    }

    #[test]
    fn second_run_adds_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let first = run(&conn).unwrap();
        assert_eq!(first.added.len(), USER_COLUMNS.len());

        let second = run(&conn).unwrap();
        assert!(second.is_clean());
        assert!(second.added.is_empty());
    }

    #[test]
    fn populated_legacy_table_is_grandfathered_as_verified() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_users(&conn);
        insert_legacy_user(&conn, "u1", "a@example.com");
        insert_legacy_user(&conn, "u2", "b@example.com");
        insert_legacy_user(&conn, "u3", "c@example.com");

        let report = run(&conn).unwrap();
        assert_eq!(report.backfilled, 3);

        let verified: i64 = conn
            .query_row("SELECT COUNT(*) FROM users WHERE email_verified = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(verified, 3);
    }

    #[test]
    fn empty_legacy_table_is_not_backfilled() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_users(&conn);

        let report = run(&conn).unwrap();
        assert_eq!(report.added.first(), Some(&"email_verified"));
        assert_eq!(report.backfilled, 0);

        insert_legacy_user(&conn, "u1", "new@example.com");
        let verified: i64 = conn
            .query_row("SELECT email_verified FROM users WHERE id = 'u1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(verified, 0);
    }

    #[test]
    fn partially_migrated_table_only_gets_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_users(&conn);
        conn.execute_batch(
            "ALTER TABLE users ADD COLUMN email_verified INTEGER DEFAULT 0;
             ALTER TABLE users ADD COLUMN verification_token TEXT;
             ALTER TABLE users ADD COLUMN is_admin INTEGER DEFAULT 0;",
        )
        .unwrap();
        insert_legacy_user(&conn, "u1", "a@example.com");

        let report = run(&conn).unwrap();

        assert_eq!(report.added, vec!["school", "age", "ip"]);
        // email_verified already existed, so its backfill must not run again.
        assert_eq!(report.backfilled, 0);
        let verified: i64 = conn
            .query_row("SELECT email_verified FROM users WHERE id = 'u1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(verified, 0);
    }

    #[test]
    fn column_pass_failure_is_reported_not_raised() {
        // No users table at all: the row count fails.
        let conn = Connection::open_in_memory().unwrap();

        let report = upgrade_users(&conn);

        assert!(!report.is_clean());
        assert!(report.added.is_empty());
    }

    #[test]
    fn failing_step_stops_the_pass_and_keeps_earlier_columns() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_users(&conn);
        let steps = [
            ColumnStep {
                column: "school",
                sql: "ALTER TABLE users ADD COLUMN school TEXT",
                backfill: None,
            },
            ColumnStep {
                column: "broken",
                sql: "ALTER TABLE users ADD COLUMN",
                backfill: None,
            },
            ColumnStep {
                column: "ip",
                sql: "ALTER TABLE users ADD COLUMN ip TEXT",
                backfill: None,
            },
        ];
        let mut report = MigrationReport::default();

        let result = apply_column_steps(&conn, &steps, &mut report);

        assert!(result.is_err());
        assert_eq!(report.added, vec!["school"]);
        let columns = table_columns(&conn, "users").unwrap();
        assert!(columns.contains(&"school".to_string()));
        assert!(!columns.contains(&"ip".to_string()));
    }

    #[test]
    fn fresh_changelog_has_no_author_constraint() {
        let conn = Connection::open_in_memory().unwrap();

        let report = run(&conn).unwrap();

        assert!(report.rebuilt.is_empty());
        assert!(!references_table(&conn, "changelog", "users").unwrap());
        assert!(references_table(&conn, "likes", "users").unwrap());
    }

    #[test]
    fn legacy_changelog_is_rebuilt_once_with_rows_kept() {
        let conn = Connection::open_in_memory().unwrap();
        legacy_users(&conn);
        conn.execute_batch(
            "CREATE TABLE changelog (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                author_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (author_id) REFERENCES users(id)
            );
            INSERT INTO changelog VALUES ('c1', 'v1', 'first', 'u1', 1);",
        )
        .unwrap();

        let first = run(&conn).unwrap();
        assert!(first.is_clean());
        assert_eq!(first.rebuilt, vec!["changelog"]);
        assert!(!references_table(&conn, "changelog", "users").unwrap());

        let title: String = conn
            .query_row("SELECT title FROM changelog WHERE id = 'c1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(title, "v1");

        let second = run(&conn).unwrap();
        assert!(second.rebuilt.is_empty());
    }

    #[test]
    fn dependent_tables_and_indexes_exist() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = ?1 AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map(["table"], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let indexes: Vec<String> = stmt
            .query_map(["index"], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(
            tables,
            vec![
                "changelog",
                "comments",
                "feedback",
                "likes",
                "user_sessions",
                "user_settings",
                "users",
            ]
        );
        assert_eq!(
            indexes,
            vec!["idx_sessions_expires", "idx_sessions_user_id", "idx_users_email"]
        );
    }
}
