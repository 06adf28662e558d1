use serde_json::json;
use std::collections::HashSet;

use super::type_mapper::{self, Coercer};
use super::types::{PortableType, Record, Value};
use crate::error::CoercionError;
use crate::source::{CatalogObject, ObjectKind, RawColumn, RawRow, RawValue, SelectColumn};

/// Name fragments that mark a column as a change timestamp, strongest first.
const UPDATE_HINTS: [&str; 3] = ["updated", "modified", "changed"];
const CREATE_HINTS: [&str; 3] = ["created", "inserted", "loaded"];

/// One column of a stream, mapped from its native type.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub native_type: String,
    pub portable: PortableType,
    pub nullable: bool,
    pub is_key: bool,
    /// Set when the native type fell back to a lossy representation.
    pub warning: Option<String>,
    coercer: Coercer,
    cursor_capable: bool,
}

impl Column {
    pub fn from_raw(raw: RawColumn) -> Self {
        let mapping = type_mapper::map(&raw.data_type);
        let cursor_capable = mapping.portable.is_cursor_capable()
            && mapping.warning.is_none()
            && type_mapper::preserves_order(&raw.data_type);
        Self {
            name: raw.name,
            native_type: raw.data_type,
            portable: mapping.portable,
            nullable: raw.nullable,
            is_key: raw.is_primary_key,
            warning: mapping.warning,
            coercer: mapping.coercer,
            cursor_capable,
        }
    }

    /// Whether the column can bound and order an incremental extraction.
    pub fn is_cursor_capable(&self) -> bool {
        self.cursor_capable
    }

    /// Coerces one value and enforces nullability.
    pub fn coerce(&self, raw: RawValue) -> Result<Value, CoercionError> {
        if !self.nullable && matches!(raw, RawValue::Null) {
            return Err(CoercionError::new("NULL", self.portable.to_string(), "column is not nullable")
                .in_column(&self.name));
        }
        self.coercer.coerce(raw).map_err(|e| e.in_column(&self.name))
    }

    pub fn json_schema(&self) -> serde_json::Value {
        self.portable.json_schema(self.nullable)
    }
}

/// Everything known about one extractable table or view.
///
/// Built once per discovery pass and never persisted; only its
/// [`schema_fingerprint`](Self::schema_fingerprint) outlives the run.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub name: String,
    pub schema: String,
    pub table: String,
    pub kind: ObjectKind,
    pub columns: Vec<Column>,
    pub replication_key_candidates: Vec<String>,
    pub primary_key: Vec<String>,
    pub schema_fingerprint: String,
}

impl StreamDescriptor {
    /// Maps raw column metadata into a descriptor.
    ///
    /// Fails with a human-readable reason when the object cannot be
    /// extracted at all (no columns, duplicate column names).
    pub fn build(object: CatalogObject, raw_columns: Vec<RawColumn>) -> Result<Self, String> {
        if raw_columns.is_empty() {
            return Err("object has no columns".to_string());
        }
        let mut seen = HashSet::new();
        for column in &raw_columns {
            if !seen.insert(column.name.as_str()) {
                return Err(format!("duplicate column name '{}'", column.name));
            }
        }

        let columns: Vec<Column> = raw_columns.into_iter().map(Column::from_raw).collect();
        let primary_key = columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect();

        Ok(Self {
            name: object.stream_id(),
            replication_key_candidates: rank_candidates(&columns),
            schema_fingerprint: fingerprint(&columns),
            schema: object.schema,
            table: object.name,
            kind: object.kind,
            columns,
            primary_key,
        })
    }

    /// Replication key used when the catalog names none.
    ///
    /// Only integer and temporal columns qualify, and only when their name
    /// marks them as change or creation stamps or they belong to the primary
    /// key. Text keys need not grow with new rows, so they are never picked
    /// implicitly.
    pub fn default_replication_key(&self) -> Option<&str> {
        self.columns
            .iter()
            .filter(|c| {
                c.is_cursor_capable()
                    && matches!(
                        c.portable,
                        PortableType::Integer | PortableType::Date | PortableType::Timestamp
                    )
            })
            .filter_map(|c| match hint_rank(c) {
                2 if !c.is_key => None,
                rank => Some((rank, c)),
            })
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, c)| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn object(&self) -> CatalogObject {
        CatalogObject::new(self.schema.clone(), self.table.clone(), self.kind)
    }

    /// The same stream narrowed to the columns a query selects.
    ///
    /// The fingerprint still describes the whole object, so selecting a
    /// different set of columns never discards replication progress.
    pub fn project(&self, selected: &[SelectColumn]) -> Self {
        let keep = |name: &String| selected.iter().any(|s| &s.name == name);
        Self {
            columns: self.columns.iter().filter(|c| keep(&c.name)).cloned().collect(),
            replication_key_candidates: self
                .replication_key_candidates
                .iter()
                .filter(|name| keep(name))
                .cloned()
                .collect(),
            primary_key: self.primary_key.iter().filter(|name| keep(name)).cloned().collect(),
            ..self.clone()
        }
    }

    /// JSON Schema of a RECORD of this stream.
    pub fn json_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.json_schema()))
            .collect();
        json!({ "type": "object", "properties": properties })
    }

    /// Coerces a row laid out in column order.
    pub fn coerce_row(&self, row: RawRow) -> Result<Record, CoercionError> {
        if row.len() != self.columns.len() {
            return Err(CoercionError::new(
                format!("<row of {} values>", row.len()),
                "record",
                format!("expected {} values", self.columns.len()),
            ));
        }
        let values = self
            .columns
            .iter()
            .zip(row)
            .map(|(column, raw)| Ok((column.name.clone(), column.coerce(raw)?)))
            .collect::<Result<Vec<_>, CoercionError>>()?;
        Ok(Record::new(values))
    }
}

/// 0 for change stamps, 1 for creation stamps, 2 otherwise.
fn hint_rank(column: &Column) -> u8 {
    let lower = column.name.to_ascii_lowercase();
    if UPDATE_HINTS.iter().any(|h| lower.contains(h)) {
        0
    } else if CREATE_HINTS.iter().any(|h| lower.contains(h)) {
        1
    } else {
        2
    }
}

/// Cursor-capable columns, change timestamps first, then creation
/// timestamps, then everything else in ordinal order.
fn rank_candidates(columns: &[Column]) -> Vec<String> {
    let mut ranked: Vec<(u8, &Column)> = columns
        .iter()
        .filter(|c| c.is_cursor_capable())
        .map(|c| (hint_rank(c), c))
        .collect();
    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, c)| c.name.clone()).collect()
}

fn fingerprint(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| {
            format!(
                "{}:{}:{}",
                c.name,
                c.portable,
                if c.nullable { "null" } else { "not null" }
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}
