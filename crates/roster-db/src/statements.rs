use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Params};
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::Database;

/// One result row, keyed by column name in select order.
pub type Row = Map<String, Value>;

/// Metadata from a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    /// Rows inserted, updated or deleted by the statement.
    pub changes: usize,
    pub last_insert_rowid: i64,
}

impl Database {
    /// First row produced by `sql`, or `None` when nothing matches.
    pub fn get<P: Params>(&self, sql: &str, params: P) -> Result<Option<Row>> {
        self.with_conn(|conn| {
            query_rows(conn, sql, params, Some(1)).map(|rows| rows.into_iter().next())
        })
    }

    pub fn all<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Row>> {
        self.with_conn(|conn| query_rows(conn, sql, params, None))
    }

    /// Execute a single statement and report what it wrote. Rows the
    /// statement produces (`RETURNING`, pragmas) are stepped through and dropped.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<RunResult> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut rows = stmt.query(params)?;
            while rows.next()?.is_some() {}
            drop(rows);

            Ok(RunResult {
                changes: usize::try_from(conn.changes())?,
                last_insert_rowid: conn.last_insert_rowid(),
            })
        })
    }

    /// Execute one or more `;`-separated statements that take no parameters.
    pub fn exec(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }

    pub fn get_as<T, P>(&self, sql: &str, params: P) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        P: Params,
    {
        self.get(sql, params)?.map(from_row).transpose()
    }

    pub fn all_as<T, P>(&self, sql: &str, params: P) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        P: Params,
    {
        self.all(sql, params)?.into_iter().map(from_row).collect()
    }

    /// Bind `sql` once and run it with different parameters.
    pub fn prepare<'db>(&'db self, sql: &str) -> Statement<'db> {
        Statement {
            db: self,
            sql: sql.to_string(),
        }
    }
}

/// A statement bound to a [`Database`]. Compiled statements are cached by the
/// connection, so reusing one is cheap.
pub struct Statement<'db> {
    db: &'db Database,
    sql: String,
}

impl Statement<'_> {
    pub fn get<P: Params>(&self, params: P) -> Result<Option<Row>> {
        self.db.get(&self.sql, params)
    }

    pub fn all<P: Params>(&self, params: P) -> Result<Vec<Row>> {
        self.db.all(&self.sql, params)
    }

    pub fn run<P: Params>(&self, params: P) -> Result<RunResult> {
        self.db.run(&self.sql, params)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn query_rows<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    limit: Option<usize>,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut out = Vec::new();
    let mut rows = stmt.query(params)?;
    while let Some(row) = rows.next()? {
        let mut record = Map::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        out.push(record);

        if limit.is_some_and(|max| out.len() >= max) {
            break;
        }
    }

    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}
