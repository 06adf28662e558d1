use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::stream::BoxStream;
use std::fmt;

use crate::catalog::Decimal;
use crate::sync::Bookmark;
use crate::Result;

/// A value exactly as the driver reported it, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Blob(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Timestamps are reported in UTC.
    Timestamp(NaiveDateTime),
    List(Vec<RawValue>),
    Struct(Vec<(String, RawValue)>),
}

impl RawValue {
    /// Short description for error messages.
    pub fn describe(&self) -> String {
        let text = match self {
            RawValue::Null => "NULL".to_string(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Int(i) => i.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Decimal(d) => d.to_string(),
            RawValue::Text(s) => format!("'{}'", s),
            RawValue::Blob(b) => format!("<{} bytes>", b.len()),
            RawValue::Date(d) => d.to_string(),
            RawValue::Time(t) => t.to_string(),
            RawValue::Timestamp(ts) => ts.to_string(),
            RawValue::List(items) => format!("<list of {}>", items.len()),
            RawValue::Struct(fields) => format!("<struct of {} fields>", fields.len()),
        };
        if text.chars().count() > 64 {
            let mut short: String = text.chars().take(61).collect();
            short.push_str("...");
            short
        } else {
            text
        }
    }
}

pub type RawRow = Vec<RawValue>;

/// Lazy, single-consumer sequence of rows owned by the executor.
pub type RowStream = BoxStream<'static, Result<RawRow>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

/// A table or view listed by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogObject {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
}

impl CatalogObject {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Singer stream id, `<schema>-<table>`.
    pub fn stream_id(&self) -> String {
        format!("{}-{}", self.schema, self.name)
    }
}

/// One column of catalog metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Native type as printed by the source, e.g. `DECIMAL(10,2)`.
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
        }
    }
}

/// Lower bound on the cursor column.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub native_type: String,
    pub comparison: Comparison,
    pub bound: Bookmark,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    pub name: String,
    pub native_type: String,
}

/// Structured SELECT handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub schema: String,
    pub table: String,
    pub columns: Vec<SelectColumn>,
    pub predicate: Option<Predicate>,
    pub order_by: Option<String>,
}

impl QuerySpec {
    /// Renders the SQL text and its positional parameters.
    ///
    /// Bound values travel as text and are cast to the column's native type
    /// on the server side, so no literal is ever spliced into the SQL.
    pub fn to_sql(&self) -> (String, Vec<String>) {
        self.to_sql_with(|c| quote_identifier(&c.name))
    }

    /// Like [`QuerySpec::to_sql`], with each select-list entry rendered by
    /// `project`.
    pub fn to_sql_with(&self, project: impl Fn(&SelectColumn) -> String) -> (String, Vec<String>) {
        let columns = self.columns.iter().map(project).collect::<Vec<_>>().join(", ");
        let mut sql = format!(
            "SELECT {} FROM {}.{}",
            columns,
            quote_identifier(&self.schema),
            quote_identifier(&self.table)
        );
        let mut params = Vec::new();

        if let Some(predicate) = &self.predicate {
            sql.push_str(&format!(
                " WHERE {} {} CAST(? AS {})",
                quote_identifier(&predicate.column),
                predicate.comparison.as_sql(),
                predicate.native_type
            ));
            params.push(predicate.bound.to_param());
        }
        if let Some(column) = &self.order_by {
            sql.push_str(&format!(" ORDER BY {} ASC NULLS FIRST", quote_identifier(column)));
        }
        (sql, params)
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sql, params) = self.to_sql();
        write!(f, "{} {:?}", sql, params)
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The query capability the engine consumes.
///
/// Implementations own their connection. One executor is never shared
/// between concurrently extracted streams; each worker obtains its own from
/// an [`ExecutorFactory`].
#[async_trait]
pub trait QueryExecutor: Send {
    /// Lists discoverable objects, ordered by qualified name.
    async fn list_objects(&mut self) -> Result<BoxStream<'static, Result<CatalogObject>>>;

    /// Column metadata of one object, in ordinal order.
    async fn describe(&mut self, object: &CatalogObject) -> Result<Vec<RawColumn>>;

    /// Runs a SELECT and yields its rows lazily, in the requested order.
    async fn execute(&mut self, query: &QuerySpec) -> Result<RowStream>;

    /// Column carrying an append-only change position, when the source keeps
    /// a change log for this object.
    fn change_log(&self, _object: &CatalogObject) -> Option<String> {
        None
    }
}

/// Opens independent executors, one per worker.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn QueryExecutor>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn orders_query() -> QuerySpec {
        QuerySpec {
            schema: "main".to_string(),
            table: "orders".to_string(),
            columns: vec![
                SelectColumn {
                    name: "id".to_string(),
                    native_type: "INTEGER".to_string(),
                },
                SelectColumn {
                    name: "updated_at".to_string(),
                    native_type: "TIMESTAMP".to_string(),
                },
            ],
            predicate: None,
            order_by: None,
        }
    }

    #[test]
    fn test_full_table_sql() {
        let (sql, params) = orders_query().to_sql();
        assert_eq!(sql, r#"SELECT "id", "updated_at" FROM "main"."orders""#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_incremental_sql() {
        let mut query = orders_query();
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        query.predicate = Some(Predicate {
            column: "updated_at".to_string(),
            native_type: "TIMESTAMP".to_string(),
            comparison: Comparison::GreaterOrEqual,
            bound: Bookmark::Timestamp(ts),
        });
        query.order_by = Some("updated_at".to_string());

        let (sql, params) = query.to_sql();
        assert_eq!(
            sql,
            r#"SELECT "id", "updated_at" FROM "main"."orders" WHERE "updated_at" >= CAST(? AS TIMESTAMP) ORDER BY "updated_at" ASC NULLS FIRST"#
        );
        assert_eq!(params, vec!["2024-01-01 00:00:00+00".to_string()]);
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_stream_id() {
        let object = CatalogObject::new("main", "orders", ObjectKind::Table);
        assert_eq!(object.stream_id(), "main-orders");
        assert_eq!(object.qualified_name(), "main.orders");
    }
}
