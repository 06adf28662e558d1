//! Singer catalog documents: discovery output and stream selection input.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

use super::descriptor::StreamDescriptor;
use crate::source::ObjectKind;
use crate::sync::ReplicationMethod;
use crate::{Error, Result};

/// A Singer catalog, as written by `--discover` and read by `--catalog`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    #[serde(default)]
    pub stream: String,
    #[serde(default)]
    pub schema: JsonValue,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key: Option<String>,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, JsonValue>,
}

impl CatalogEntry {
    /// Catalog entry advertising a discovered stream. Nothing is selected.
    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        let mut metadata = vec![MetadataEntry {
            breadcrumb: Vec::new(),
            metadata: object(json!({
                "inclusion": "available",
                "selected-by-default": false,
                "schema-name": descriptor.schema,
                "table-key-properties": descriptor.primary_key,
                "valid-replication-keys": descriptor.replication_key_candidates,
                "is-view": descriptor.kind == ObjectKind::View,
            })),
        }];
        for column in &descriptor.columns {
            let inclusion = if column.is_key { "automatic" } else { "available" };
            metadata.push(MetadataEntry {
                breadcrumb: vec!["properties".to_string(), column.name.clone()],
                metadata: object(json!({
                    "inclusion": inclusion,
                    "sql-datatype": column.native_type,
                })),
            });
        }

        Self {
            tap_stream_id: descriptor.name.clone(),
            stream: descriptor.table.clone(),
            schema: descriptor.json_schema(),
            key_properties: descriptor.primary_key.clone(),
            replication_method: None,
            replication_key: None,
            metadata,
        }
    }

    /// Stream-level metadata, breadcrumb `[]`.
    fn stream_metadata(&self) -> Option<&Map<String, JsonValue>> {
        self.metadata
            .iter()
            .find(|m| m.breadcrumb.is_empty())
            .map(|m| &m.metadata)
    }

    fn is_selected(&self) -> bool {
        let Some(metadata) = self.stream_metadata() else {
            return false;
        };
        metadata
            .get("selected")
            .or_else(|| metadata.get("selected-by-default"))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Columns whose `["properties", <column>]` metadata says
    /// `selected: false`.
    fn deselected_properties(&self) -> BTreeSet<String> {
        self.metadata
            .iter()
            .filter(|m| m.metadata.get("selected").and_then(JsonValue::as_bool) == Some(false))
            .filter_map(|m| match m.breadcrumb.as_slice() {
                [kind, column] if kind == "properties" => Some(column.clone()),
                _ => None,
            })
            .collect()
    }

    fn metadata_str(&self, key: &str) -> Option<String> {
        self.stream_metadata()
            .and_then(|m| m.get(key))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }
}

fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => Map::new(),
    }
}

/// What a catalog asked for one stream, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub method: Option<String>,
    pub replication_key: Option<String>,
    pub deselected: BTreeSet<String>,
}

/// Validated replication settings for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub method: ReplicationMethod,
    pub replication_key: Option<String>,
    /// Columns left out of SCHEMA and RECORD. Never holds a primary key
    /// column; the planner also keeps whichever column it orders by.
    pub deselected: BTreeSet<String>,
}

/// Which streams to extract and how.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// `None` selects every discovered stream.
    streams: Option<BTreeMap<String, StreamRequest>>,
}

impl Selection {
    /// Selects every stream with the default method.
    pub fn all() -> Self {
        Self { streams: None }
    }

    pub fn from_catalog(catalog: &Catalog) -> Self {
        let streams = catalog
            .streams
            .iter()
            .filter(|entry| entry.is_selected())
            .map(|entry| {
                let request = StreamRequest {
                    method: entry
                        .metadata_str("replication-method")
                        .or_else(|| entry.replication_method.clone()),
                    replication_key: entry
                        .metadata_str("replication-key")
                        .or_else(|| entry.replication_key.clone()),
                    deselected: entry.deselected_properties(),
                };
                (entry.tap_stream_id.clone(), request)
            })
            .collect();
        Self {
            streams: Some(streams),
        }
    }

    /// Reads a Singer catalog file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        let catalog: Catalog = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid catalog file {:?}: {}", path, e)))?;
        let selection = Self::from_catalog(&catalog);
        debug!(
            "Loaded catalog with {} streams, {} selected",
            catalog.streams.len(),
            selection.selected().count()
        );
        Ok(selection)
    }

    pub fn is_selected(&self, stream: &str) -> bool {
        match &self.streams {
            Some(streams) => streams.contains_key(stream),
            None => true,
        }
    }

    /// Explicitly selected stream ids; empty when everything is selected.
    pub fn selected(&self) -> impl Iterator<Item = &str> {
        self.streams
            .iter()
            .flat_map(|streams| streams.keys().map(String::as_str))
    }

    /// Selected streams that discovery did not produce.
    pub fn missing(&self, discovered: &HashSet<String>) -> Vec<Error> {
        self.selected()
            .filter(|stream| !discovered.contains(*stream))
            .map(|stream| Error::InvalidSelection {
                stream: stream.to_string(),
                message: "stream does not exist in the source catalog".to_string(),
            })
            .collect()
    }

    /// Validates the request for `descriptor` against its columns.
    pub fn resolve(
        &self,
        descriptor: &StreamDescriptor,
        default_method: ReplicationMethod,
    ) -> Result<StreamSettings> {
        let request = self
            .streams
            .as_ref()
            .and_then(|streams| streams.get(&descriptor.name))
            .cloned()
            .unwrap_or_default();
        let invalid = |message: String| Error::InvalidSelection {
            stream: descriptor.name.clone(),
            message,
        };

        let method = match request.method.as_deref() {
            Some(raw) => ReplicationMethod::from_singer(raw)
                .ok_or_else(|| invalid(format!("unknown replication method '{}'", raw)))?,
            None if request.replication_key.is_some() => ReplicationMethod::IncrementalKey,
            None => default_method,
        };

        if let Some(key) = &request.replication_key {
            if descriptor.column(key).is_none() {
                return Err(invalid(format!("replication key '{}' is not a column", key)));
            }
            if method == ReplicationMethod::IncrementalKey
                && !descriptor.replication_key_candidates.contains(key)
            {
                return Err(invalid(format!(
                    "column '{}' cannot be used as a replication key",
                    key
                )));
            }
        }

        let mut deselected = BTreeSet::new();
        for name in request.deselected {
            match descriptor.column(&name) {
                None => debug!(stream = %descriptor.name, "Ignoring metadata for unknown column '{}'", name),
                Some(column) if column.is_key || request.replication_key.as_ref() == Some(&name) => warn!(
                    stream = %descriptor.name,
                    "Column '{}' is always extracted and cannot be deselected",
                    name
                ),
                Some(_) => {
                    deselected.insert(name);
                }
            }
        }

        Ok(StreamSettings {
            method,
            replication_key: request.replication_key,
            deselected,
        })
    }
}
