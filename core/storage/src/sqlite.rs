//! SQLite-backed store adapter.
//!
//! Plays the role of the primary transactional store. One table holds one
//! row per record: the identity as primary key, the modification time as
//! Unix epoch milliseconds, and one column per mirrored field.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::adapter::StoreAdapter;
use mirrorsync_common::schema::is_identifier;
use mirrorsync_common::{
    Change, ChangeSet, Error, FieldValue, Fields, RecordId, Result, SchemaMapping,
};

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite store adapter.
pub struct SqliteStore {
    name: String,
    schema: SchemaMapping,
    conn: Arc<Mutex<Connection>>,
    select_sql: String,
    upsert_sql: String,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the record table exists.
    ///
    /// # Preconditions
    /// - `table` is a plain identifier
    /// - `schema` passes [`SchemaMapping::validate`]
    ///
    /// # Errors
    /// - `Config` for an invalid table name or schema
    /// - `Storage` if the database cannot be opened or the table created
    pub fn open(
        path: impl AsRef<Path>,
        table: impl Into<String>,
        schema: SchemaMapping,
    ) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            Error::Storage(format!(
                "Failed to open SQLite database {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_connection(conn, table.into(), schema)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory(table: impl Into<String>, schema: SchemaMapping) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open SQLite database: {}", e)))?;
        Self::from_connection(conn, table.into(), schema)
    }

    fn from_connection(conn: Connection, table: String, schema: SchemaMapping) -> Result<Self> {
        schema.validate()?;
        if !is_identifier(&table) {
            return Err(Error::Config(format!("Invalid table name: '{}'", table)));
        }

        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(format!("Failed to set busy timeout: {}", e)))?;

        let mut columns = vec![
            format!("{} TEXT PRIMARY KEY", schema.identity_field),
            format!("{} INTEGER NOT NULL", schema.timestamp_field),
        ];
        // Untyped columns keep whatever storage class a value was written with.
        columns.extend(schema.mirrored_fields.iter().cloned());

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             CREATE INDEX IF NOT EXISTS idx_{table}_{ts} ON {table}({ts});",
            table = table,
            columns = columns.join(", "),
            ts = schema.timestamp_field,
        ))
        .map_err(|e| Error::Storage(format!("Failed to create table {}: {}", table, e)))?;

        let all_fields = schema.all_fields();
        let select_sql = format!(
            "SELECT {} FROM {} WHERE {} > ?1 ORDER BY {}",
            all_fields.join(", "),
            table,
            schema.timestamp_field,
            schema.timestamp_field,
        );
        let placeholders: Vec<String> = (1..=all_fields.len()).map(|i| format!("?{}", i)).collect();
        let upsert_sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table,
            all_fields.join(", "),
            placeholders.join(", "),
        );

        info!(table = %table, "SQLite store opened");

        Ok(Self {
            name: format!("sqlite:{}", table),
            schema,
            conn: Arc::new(Mutex::new(conn)),
            select_sql,
            upsert_sql,
        })
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SchemaMapping {
        &self.schema
    }

    async fn fetch_changes_since(&self, cutoff: DateTime<Utc>) -> Result<ChangeSet> {
        let conn = self.conn.clone();
        let sql = self.select_sql.clone();
        let schema = self.schema.clone();
        let name = self.name.clone();
        let cutoff_ms = cutoff.timestamp_millis();

        debug!(store = %self.name, cutoff = %cutoff, "Fetching changes from SQLite");

        let changes = tokio::task::spawn_blocking(move || -> Result<Vec<Change>> {
            let conn = conn
                .lock()
                .map_err(|_| Error::fetch_fatal(&name, "Connection lock poisoned"))?;
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(|e| classify(&e, |t, m| fetch_error(&name, t, m)))?;
            let mut rows = stmt
                .query([cutoff_ms])
                .map_err(|e| classify(&e, |t, m| fetch_error(&name, t, m)))?;

            let mut changes = Vec::new();
            while let Some(row) = rows
                .next()
                .map_err(|e| classify(&e, |t, m| fetch_error(&name, t, m)))?
            {
                let change = row_to_change(row, &schema)
                    .map_err(|e| Error::fetch_fatal(&name, e.to_string()))?;
                changes.push(change);
            }
            Ok(changes)
        })
        .await
        .map_err(|e| Error::fetch_transient(&self.name, format!("Blocking task failed: {}", e)))??;

        debug!(store = %self.name, count = changes.len(), "Fetched changes from SQLite");
        Ok(changes.into())
    }

    async fn upsert(&self, change: &Change) -> Result<()> {
        let conn = self.conn.clone();
        let sql = self.upsert_sql.clone();
        let name = self.name.clone();
        let id = change.id().to_string();

        let mut values = vec![
            SqlValue::Text(id.clone()),
            SqlValue::Integer(change.modified_at().timestamp_millis()),
        ];
        values.extend(
            self.schema
                .mirrored_fields
                .iter()
                .map(|field| change.field(field).map(field_to_sql).unwrap_or(SqlValue::Null)),
        );

        debug!(store = %self.name, id = %id, "Upserting into SQLite");

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn
                .lock()
                .map_err(|_| Error::write_fatal(&name, &id, "Connection lock poisoned"))?;
            conn.execute(&sql, params_from_iter(values))
                .map_err(|e| classify(&e, |t, m| write_error(&name, &id, t, m)))?;
            Ok(())
        })
        .await
        .map_err(|e| {
            Error::write_transient(
                &self.name,
                change.id().as_str(),
                format!("Blocking task failed: {}", e),
            )
        })?
    }
}

fn fetch_error(store: &str, transient: bool, message: String) -> Error {
    if transient {
        Error::fetch_transient(store, message)
    } else {
        Error::fetch_fatal(store, message)
    }
}

fn write_error(store: &str, id: &str, transient: bool, message: String) -> Error {
    if transient {
        Error::write_transient(store, id, message)
    } else {
        Error::write_fatal(store, id, message)
    }
}

/// Busy and locked databases clear up once the other writer is done.
fn classify(err: &rusqlite::Error, build: impl FnOnce(bool, String) -> Error) -> Error {
    let transient = matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    build(transient, err.to_string())
}

fn row_to_change(row: &rusqlite::Row<'_>, schema: &SchemaMapping) -> Result<Change> {
    let id = match row.get_ref(0).map_err(sql_err)? {
        ValueRef::Text(bytes) => RecordId::new(text(bytes)?)?,
        ValueRef::Integer(i) => RecordId::new(i.to_string())?,
        other => {
            return Err(Error::InvalidInput(format!(
                "Unsupported identity column type: {:?}",
                other.data_type()
            )))
        }
    };

    let millis: i64 = row.get(1).map_err(sql_err)?;
    let modified_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        Error::InvalidInput(format!("Timestamp out of range for {}: {}", id, millis))
    })?;

    let mut fields = Fields::new();
    for (offset, field) in schema.mirrored_fields.iter().enumerate() {
        let value = sql_to_field(row.get_ref(offset + 2).map_err(sql_err)?)?;
        fields.insert(field.clone(), value);
    }

    Ok(Change::with_fields(id, modified_at, fields))
}

fn sql_to_field(value: ValueRef<'_>) -> Result<FieldValue> {
    match value {
        ValueRef::Null => Ok(FieldValue::Null),
        ValueRef::Integer(i) => Ok(FieldValue::Integer(i)),
        ValueRef::Real(f) => Ok(FieldValue::Float(f)),
        ValueRef::Text(bytes) => Ok(FieldValue::Text(text(bytes)?.to_string())),
        ValueRef::Blob(_) => Err(Error::InvalidInput(
            "BLOB columns cannot be mirrored".to_string(),
        )),
    }
}

fn field_to_sql(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        FieldValue::Integer(i) => SqlValue::Integer(*i),
        FieldValue::Float(f) => SqlValue::Real(*f),
        FieldValue::Text(s) => SqlValue::Text(s.clone()),
        FieldValue::Timestamp(ts) => SqlValue::Text(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
    }
}

fn text(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map_err(|e| Error::InvalidInput(format!("Column is not valid UTF-8: {}", e)))
}

fn sql_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}
