use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::Record;
use crate::sync::StateDocument;

/// One line of the Singer message stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message<'a> {
    Schema {
        stream: &'a str,
        schema: serde_json::Value,
        key_properties: &'a [String],
        #[serde(skip_serializing_if = "Vec::is_empty")]
        bookmark_properties: Vec<String>,
    },
    Record {
        stream: &'a str,
        record: &'a Record,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        time_extracted: DateTime<Utc>,
    },
    State {
        value: &'a StateDocument,
    },
    ActivateVersion {
        stream: &'a str,
        version: u64,
    },
}

impl Message<'_> {
    /// Serializes the message as one JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}
