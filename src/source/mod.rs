//! Query execution against the source database.

mod executor;
pub mod memory;

#[cfg(feature = "duckdb")]
pub mod duckdb;

pub use executor::{
    quote_identifier, CatalogObject, Comparison, ExecutorFactory, ObjectKind, Predicate,
    QueryExecutor, QuerySpec, RawColumn, RawRow, RawValue, RowStream, SelectColumn,
};
pub use memory::{MemoryExecutor, MemoryTable};
