//! DuckDB-backed query executor.
//!
//! The database file is opened once, read-only, by [`DuckDbFactory`]; every
//! executor it hands out is a cloned connection to that same instance.
//! Queries run on the blocking pool and feed rows through a bounded channel,
//! so a slow consumer holds the driver back instead of buffering the table.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, Value};
use duckdb::{params_from_iter, AccessMode, Connection};
use futures::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use super::executor::{
    quote_identifier, CatalogObject, ExecutorFactory, ObjectKind, QueryExecutor, QuerySpec,
    RawColumn, RawRow, RawValue, RowStream, SelectColumn,
};
use crate::catalog::{map, Coercer};
use crate::{Config, Error, Result};

const LIST_OBJECTS: &str = "SELECT table_schema, table_name, table_type \
     FROM information_schema.tables \
     WHERE table_catalog = ? AND table_schema NOT IN ('information_schema', 'pg_catalog') \
     ORDER BY table_schema, table_name";

const DESCRIBE_COLUMNS: &str = "SELECT column_name, data_type, is_nullable \
     FROM information_schema.columns \
     WHERE table_catalog = ? AND table_schema = ? AND table_name = ? \
     ORDER BY ordinal_position";

const PRIMARY_KEY: &str = "SELECT unnest(constraint_column_names) \
     FROM duckdb_constraints() \
     WHERE database_name = ? AND schema_name = ? AND table_name = ? \
     AND constraint_type = 'PRIMARY KEY'";

/// Opens the configured database file and hands out connections to it.
pub struct DuckDbFactory {
    path: PathBuf,
    database: String,
    row_buffer: usize,
    connection: Mutex<Option<Connection>>,
}

impl DuckDbFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.path.clone(),
            database: config.database.clone(),
            row_buffer: config.sync.row_buffer,
            connection: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<Connection> {
        let flags = duckdb::Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(|e| Error::Connection(e.to_string()))?;
        let connection = Connection::open_with_flags(&self.path, flags)
            .map_err(|e| Error::Connection(format!("Cannot open {:?}: {}", self.path, e)))?;
        info!("Opened DuckDB database {:?} read-only", self.path);
        Ok(connection)
    }
}

#[async_trait]
impl ExecutorFactory for DuckDbFactory {
    async fn connect(&self) -> Result<Box<dyn QueryExecutor>> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| Error::Connection("connection lock poisoned".to_string()))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let connection = match guard.as_ref() {
            Some(connection) => connection
                .try_clone()
                .map_err(|e| Error::Connection(e.to_string()))?,
            None => return Err(Error::Connection("database is not open".to_string())),
        };
        Ok(Box::new(DuckDbExecutor {
            connection,
            database: self.database.clone(),
            row_buffer: self.row_buffer,
        }))
    }
}

/// One connection; owned by a single worker.
pub struct DuckDbExecutor {
    connection: Connection,
    database: String,
    row_buffer: usize,
}

/// Runs `work` on the blocking pool.
async fn blocking<T, F>(connection: Connection, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Connection) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(connection))
        .await
        .map_err(|e| Error::Query(format!("query task failed: {}", e)))?
}

#[async_trait]
impl QueryExecutor for DuckDbExecutor {
    async fn list_objects(&mut self) -> Result<BoxStream<'static, Result<CatalogObject>>> {
        let database = self.database.clone();
        let (tx, rx) = mpsc::channel(self.row_buffer);
        let connection = self.connection.try_clone()?;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_objects(&connection, &database, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn describe(&mut self, object: &CatalogObject) -> Result<Vec<RawColumn>> {
        let database = self.database.clone();
        let object = object.clone();
        let connection = self.connection.try_clone()?;
        blocking(connection, move |connection| {
            let keys = {
                let mut statement = connection.prepare(PRIMARY_KEY)?;
                let mut rows = statement.query(params_from_iter([&database, &object.schema, &object.name]))?;
                let mut keys = Vec::new();
                while let Some(row) = rows.next()? {
                    keys.push(row.get::<_, String>(0)?);
                }
                keys
            };

            let mut statement = connection.prepare(DESCRIBE_COLUMNS)?;
            let mut rows = statement.query(params_from_iter([&database, &object.schema, &object.name]))?;
            let mut columns = Vec::new();
            while let Some(row) = rows.next()? {
                let mut column = RawColumn::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
                if row.get::<_, String>(2)? == "NO" {
                    column = column.not_null();
                }
                if keys.contains(&column.name) {
                    column = column.primary_key();
                }
                columns.push(column);
            }
            Ok(columns)
        })
        .await
    }

    async fn execute(&mut self, query: &QuerySpec) -> Result<RowStream> {
        let (sql, params) = query.to_sql_with(project);
        let width = query.columns.len();
        debug!("Executing {}", sql);

        let (tx, rx) = mpsc::channel(self.row_buffer);
        let connection = self.connection.try_clone()?;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_rows(&connection, &sql, &params, width, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Select-list entry for one column. Decimals and types without a native
/// driver mapping are read as text and parsed by the coercer.
fn project(column: &SelectColumn) -> String {
    let quoted = quote_identifier(&column.name);
    let as_text = matches!(map(&column.native_type).coercer, Coercer::Decimal { .. } | Coercer::Fallback)
        || column.native_type.trim().eq_ignore_ascii_case("UHUGEINT");
    if as_text {
        format!("CAST({} AS VARCHAR)", quoted)
    } else {
        quoted
    }
}

fn stream_objects(
    connection: &Connection,
    database: &str,
    tx: &mpsc::Sender<Result<CatalogObject>>,
) -> Result<()> {
    let mut statement = connection.prepare(LIST_OBJECTS)?;
    let mut rows = statement.query(params_from_iter([database]))?;
    let mut count = 0usize;
    while let Some(row) = rows.next()? {
        let kind = if row.get::<_, String>(2)? == "VIEW" {
            ObjectKind::View
        } else {
            ObjectKind::Table
        };
        let object = CatalogObject::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, kind);
        if tx.blocking_send(Ok(object)).is_err() {
            debug!("Catalog consumer dropped after {} objects", count);
            return Ok(());
        }
        count += 1;
    }
    debug!("Catalog lists {} objects", count);
    Ok(())
}

fn stream_rows(
    connection: &Connection,
    sql: &str,
    params: &[String],
    width: usize,
    tx: &mpsc::Sender<Result<RawRow>>,
) -> Result<()> {
    let mut statement = connection
        .prepare(sql)
        .map_err(|e| Error::Query(format!("{}: {}", sql, e)))?;
    let mut rows = statement
        .query(params_from_iter(params.iter()))
        .map_err(|e| Error::Query(e.to_string()))?;
    while let Some(row) = rows.next().map_err(|e| Error::Query(e.to_string()))? {
        let mut raw = Vec::with_capacity(width);
        for index in 0..width {
            raw.push(to_raw(row.get::<_, Value>(index)?));
        }
        if tx.blocking_send(Ok(raw)).is_err() {
            debug!("Row consumer dropped; abandoning query");
            return Ok(());
        }
    }
    Ok(())
}

fn to_raw(value: Value) -> RawValue {
    match value {
        Value::Null => RawValue::Null,
        Value::Boolean(b) => RawValue::Bool(b),
        Value::TinyInt(i) => RawValue::Int(i.into()),
        Value::SmallInt(i) => RawValue::Int(i.into()),
        Value::Int(i) => RawValue::Int(i.into()),
        Value::BigInt(i) => RawValue::Int(i.into()),
        Value::HugeInt(i) => RawValue::Int(i),
        Value::UTinyInt(i) => RawValue::Int(i.into()),
        Value::USmallInt(i) => RawValue::Int(i.into()),
        Value::UInt(i) => RawValue::Int(i.into()),
        Value::UBigInt(i) => RawValue::Int(i.into()),
        Value::Float(f) => RawValue::Float(f.into()),
        Value::Double(f) => RawValue::Float(f),
        Value::Decimal(d) => RawValue::Text(d.to_string()),
        Value::Text(s) | Value::Enum(s) => RawValue::Text(s),
        Value::Blob(bytes) => RawValue::Blob(bytes),
        Value::Timestamp(unit, value) => {
            let (secs, nanos) = split_seconds(unit, value);
            DateTime::from_timestamp(secs, nanos)
                .map(|ts| RawValue::Timestamp(ts.naive_utc()))
                .unwrap_or_else(|| RawValue::Text(value.to_string()))
        }
        Value::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days.saturating_add(719_163))
            .map(RawValue::Date)
            .unwrap_or_else(|| RawValue::Text(days.to_string())),
        Value::Time64(unit, value) => {
            let (secs, nanos) = split_seconds(unit, value);
            u32::try_from(secs)
                .ok()
                .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos))
                .map(RawValue::Time)
                .unwrap_or_else(|| RawValue::Text(value.to_string()))
        }
        Value::Interval { months, days, nanos } => {
            RawValue::Text(format!("{} months {} days {} microseconds", months, days, nanos / 1_000))
        }
        Value::List(items) | Value::Array(items) => RawValue::List(items.into_iter().map(to_raw).collect()),
        Value::Struct(fields) => RawValue::Struct(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), to_raw(value.clone())))
                .collect(),
        ),
        Value::Map(entries) => RawValue::List(
            entries
                .iter()
                .map(|(key, value)| {
                    RawValue::Struct(vec![
                        ("key".to_string(), to_raw(key.clone())),
                        ("value".to_string(), to_raw(value.clone())),
                    ])
                })
                .collect(),
        ),
        Value::Union(inner) => to_raw(*inner),
        #[allow(unreachable_patterns)]
        other => RawValue::Text(format!("{:?}", other)),
    }
}

/// Whole seconds and the nanosecond remainder of a count of `unit`. Every
/// stored digit survives, including those below a microsecond.
fn split_seconds(unit: TimeUnit, value: i64) -> (i64, u32) {
    let per_second: i64 = match unit {
        TimeUnit::Second => 1,
        TimeUnit::Millisecond => 1_000,
        TimeUnit::Microsecond => 1_000_000,
        TimeUnit::Nanosecond => 1_000_000_000,
    };
    let nanos = value.rem_euclid(per_second) * (1_000_000_000 / per_second);
    (value.div_euclid(per_second), nanos as u32)
}
