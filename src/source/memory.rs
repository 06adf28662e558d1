//! In-memory query executor.
//!
//! Interprets a [`QuerySpec`] directly over rows held in memory. It backs
//! the test suite and lets the tap run against data produced by another
//! part of a host program without a database file.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use super::executor::{
    CatalogObject, Comparison, ExecutorFactory, ObjectKind, QueryExecutor, QuerySpec, RawColumn,
    RawRow, RawValue, RowStream,
};
use crate::catalog::type_mapper;
use crate::sync::compare_cursor;
use crate::{Error, Result};

/// A table or view with its rows.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    object: CatalogObject,
    columns: Vec<RawColumn>,
    rows: Vec<RawRow>,
    change_log: Option<String>,
}

impl MemoryTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object: CatalogObject::new(schema, name, ObjectKind::Table),
            columns: Vec::new(),
            rows: Vec::new(),
            change_log: None,
        }
    }

    pub fn kind(mut self, kind: ObjectKind) -> Self {
        self.object.kind = kind;
        self
    }

    pub fn column(mut self, column: RawColumn) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends a row laid out in column order.
    pub fn row(mut self, row: RawRow) -> Self {
        self.rows.push(row);
        self
    }

    /// Declares `column` as an append-only change position.
    pub fn change_log(mut self, column: impl Into<String>) -> Self {
        self.change_log = Some(column.into());
        self
    }

    fn key(&self) -> (String, String) {
        (self.object.schema.clone(), self.object.name.clone())
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                Error::Query(format!(
                    "column \"{}\" not found in {}",
                    name,
                    self.object.qualified_name()
                ))
            })
    }
}

/// Injected misbehavior, for exercising failure paths.
#[derive(Debug, Clone, Default)]
struct Faults {
    listing: bool,
    unordered_listing: bool,
    describe: HashSet<(String, String)>,
    query: HashSet<(String, String)>,
    rows_after: BTreeMap<(String, String), usize>,
    ignore_order: HashSet<(String, String)>,
}

/// Query executor over in-memory tables.
///
/// Cloning shares nothing but the connection counter, so every worker gets
/// an independent executor, like separate database connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    tables: BTreeMap<(String, String), MemoryTable>,
    faults: Faults,
    connections: Arc<AtomicUsize>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.tables.insert(table.key(), table);
        self
    }

    /// Makes the catalog listing itself fail.
    pub fn fail_listing(mut self) -> Self {
        self.faults.listing = true;
        self
    }

    /// Lists objects in reverse order.
    pub fn unordered_listing(mut self) -> Self {
        self.faults.unordered_listing = true;
        self
    }

    pub fn fail_describe(mut self, schema: &str, name: &str) -> Self {
        self.faults.describe.insert((schema.to_string(), name.to_string()));
        self
    }

    pub fn fail_query(mut self, schema: &str, name: &str) -> Self {
        self.faults.query.insert((schema.to_string(), name.to_string()));
        self
    }

    /// Yields `count` rows, then a query error.
    pub fn fail_after_rows(mut self, schema: &str, name: &str, count: usize) -> Self {
        self.faults
            .rows_after
            .insert((schema.to_string(), name.to_string()), count);
        self
    }

    /// Returns rows in storage order regardless of the requested ORDER BY.
    pub fn ignore_order(mut self, schema: &str, name: &str) -> Self {
        self.faults
            .ignore_order
            .insert((schema.to_string(), name.to_string()));
        self
    }

    /// Number of executors opened through [`ExecutorFactory::connect`].
    pub fn connections(&self) -> usize {
        self.connections.load(AtomicOrdering::SeqCst)
    }

    fn table(&self, schema: &str, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(&(schema.to_string(), name.to_string()))
            .ok_or_else(|| Error::Query(format!("table {}.{} does not exist", schema, name)))
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn list_objects(&mut self) -> Result<BoxStream<'static, Result<CatalogObject>>> {
        if self.faults.listing {
            return Err(Error::Connection("catalog is unavailable".to_string()));
        }
        let mut objects: Vec<CatalogObject> =
            self.tables.values().map(|t| t.object.clone()).collect();
        if self.faults.unordered_listing {
            objects.reverse();
        }
        Ok(stream::iter(objects.into_iter().map(Ok)).boxed())
    }

    async fn describe(&mut self, object: &CatalogObject) -> Result<Vec<RawColumn>> {
        let key = (object.schema.clone(), object.name.clone());
        if self.faults.describe.contains(&key) {
            return Err(Error::Query(format!(
                "permission denied for {}",
                object.qualified_name()
            )));
        }
        Ok(self.table(&object.schema, &object.name)?.columns.clone())
    }

    async fn execute(&mut self, query: &QuerySpec) -> Result<RowStream> {
        let key = (query.schema.clone(), query.table.clone());
        if self.faults.query.contains(&key) {
            return Err(Error::Query(format!("query failed: {}", query)));
        }
        let table = self.table(&query.schema, &query.table)?;

        let projection = query
            .columns
            .iter()
            .map(|c| table.column_index(&c.name))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = table.rows.clone();
        if let Some(predicate) = &query.predicate {
            let index = table.column_index(&predicate.column)?;
            let coercer = type_mapper::map(&predicate.native_type).coercer;
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                let value = coercer
                    .coerce(row.get(index).cloned().unwrap_or(RawValue::Null))
                    .map_err(|e| Error::Query(e.to_string()))?;
                let keep = match predicate.bound.compare(&value) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => predicate.comparison == Comparison::GreaterOrEqual,
                    _ => false,
                };
                if keep {
                    kept.push(row);
                }
            }
            rows = kept;
        }

        if let Some(order_by) = &query.order_by {
            if !self.faults.ignore_order.contains(&key) {
                let index = table.column_index(order_by)?;
                let native = table.columns[index].data_type.clone();
                let coercer = type_mapper::map(&native).coercer;
                let mut keyed = rows
                    .into_iter()
                    .map(|row| {
                        let value = coercer
                            .coerce(row.get(index).cloned().unwrap_or(RawValue::Null))
                            .map_err(|e| Error::Query(e.to_string()))?;
                        Ok((value, row))
                    })
                    .collect::<Result<Vec<_>>>()?;
                keyed.sort_by(|(a, _), (b, _)| compare_cursor(a, b).unwrap_or(Ordering::Equal));
                rows = keyed.into_iter().map(|(_, row)| row).collect();
            }
        }

        let projected = rows.into_iter().map(move |row| {
            Ok(projection
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(RawValue::Null))
                .collect::<RawRow>())
        });

        match self.faults.rows_after.get(&key).copied() {
            Some(count) => {
                let failure = stream::once(async move {
                    Err(Error::Query("connection lost during scan".to_string()))
                });
                Ok(stream::iter(projected.take(count)).chain(failure).boxed())
            }
            None => Ok(stream::iter(projected).boxed()),
        }
    }

    fn change_log(&self, object: &CatalogObject) -> Option<String> {
        self.tables
            .get(&(object.schema.clone(), object.name.clone()))
            .and_then(|t| t.change_log.clone())
    }
}

#[async_trait]
impl ExecutorFactory for MemoryExecutor {
    async fn connect(&self) -> Result<Box<dyn QueryExecutor>> {
        self.connections.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}
