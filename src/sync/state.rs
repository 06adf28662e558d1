//! Replication state: per-stream bookmarks and checkpoint cadence.
//!
//! The whole-run document serializes as
//!
//! ```json
//! {"bookmarks": {"main-orders": {
//!     "method": "incremental-key",
//!     "replication_key": "updated_at",
//!     "bookmark": {"type": "timestamp", "value": "2024-01-03T00:00:00Z"},
//!     "version": 1,
//!     "schema_fingerprint": "id:integer:not null,..."
//! }}}
//! ```
//!
//! A bookmark only moves after the record carrying it went through the
//! emitter, so a STATE message never points past unwritten data.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::planner::ExtractionPlan;
use crate::catalog::{Decimal, PortableType, Record, Value};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationMethod {
    FullTable,
    IncrementalKey,
    LogBased,
}

impl ReplicationMethod {
    /// Parses the Singer metadata spelling (`FULL_TABLE`, `INCREMENTAL`,
    /// `LOG_BASED`) as well as our own kebab-case names.
    pub fn from_singer(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FULL_TABLE" => Some(ReplicationMethod::FullTable),
            "INCREMENTAL" | "INCREMENTAL_KEY" => Some(ReplicationMethod::IncrementalKey),
            "LOG_BASED" => Some(ReplicationMethod::LogBased),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMethod::FullTable => "full-table",
            ReplicationMethod::IncrementalKey => "incremental-key",
            ReplicationMethod::LogBased => "log-based",
        }
    }
}

impl fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A comparable resume position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Bookmark {
    Integer(#[serde(with = "wide_integer")] i128),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    LogPosition(u64),
}

impl Bookmark {
    /// Bookmark for a cursor value; `None` for nulls and non-cursor values.
    pub fn from_value(value: &Value) -> Option<Bookmark> {
        match value {
            Value::Integer(i) => Some(Bookmark::Integer(*i)),
            Value::Decimal(d) => Some(Bookmark::Decimal(*d)),
            Value::String(s) => Some(Bookmark::Text(s.clone())),
            Value::Date(d) => Some(Bookmark::Date(*d)),
            Value::Time(t) => Some(Bookmark::Time(*t)),
            Value::Timestamp(ts) => Some(Bookmark::Timestamp(*ts)),
            _ => None,
        }
    }

    /// Change-log position carried by a non-negative integer value.
    pub fn position(value: &Value) -> Option<Bookmark> {
        match value {
            Value::Integer(i) => u64::try_from(*i).ok().map(Bookmark::LogPosition),
            _ => None,
        }
    }

    /// Text parameter bound into SQL and cast server-side.
    pub fn to_param(&self) -> String {
        match self {
            Bookmark::Integer(i) => i.to_string(),
            Bookmark::Decimal(d) => d.to_string(),
            Bookmark::Text(s) => s.clone(),
            Bookmark::Date(d) => d.format("%Y-%m-%d").to_string(),
            Bookmark::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            // Explicit offset so a TIMESTAMPTZ cast ignores the session zone
            Bookmark::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f+00").to_string(),
            Bookmark::LogPosition(p) => p.to_string(),
        }
    }

    /// Orders `value` against this bookmark. `None` when the value is null
    /// or of a different kind.
    pub fn compare(&self, value: &Value) -> Option<Ordering> {
        match (value, self) {
            (Value::Integer(v), Bookmark::Integer(b)) => Some(v.cmp(b)),
            (Value::Integer(v), Bookmark::LogPosition(b)) => Some(v.cmp(&i128::from(*b))),
            (Value::Decimal(v), Bookmark::Decimal(b)) => Some(v.cmp(b)),
            (Value::String(v), Bookmark::Text(b)) => Some(v.as_str().cmp(b.as_str())),
            (Value::Date(v), Bookmark::Date(b)) => Some(v.cmp(b)),
            (Value::Time(v), Bookmark::Time(b)) => Some(v.cmp(b)),
            (Value::Timestamp(v), Bookmark::Timestamp(b)) => Some(v.cmp(b)),
            _ => None,
        }
    }

    /// Whether this bookmark can bound a column of type `ty`.
    pub fn fits(&self, ty: &PortableType) -> bool {
        matches!(
            (self, ty),
            (Bookmark::Integer(_), PortableType::Integer)
                | (Bookmark::LogPosition(_), PortableType::Integer)
                | (Bookmark::Decimal(_), PortableType::Decimal { .. })
                | (Bookmark::Text(_), PortableType::String)
                | (Bookmark::Date(_), PortableType::Date)
                | (Bookmark::Time(_), PortableType::Time)
                | (Bookmark::Timestamp(_), PortableType::Timestamp)
        )
    }
}

impl PartialOrd for Bookmark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Bookmark::Integer(a), Bookmark::Integer(b)) => Some(a.cmp(b)),
            (Bookmark::Decimal(a), Bookmark::Decimal(b)) => Some(a.cmp(b)),
            (Bookmark::Text(a), Bookmark::Text(b)) => Some(a.cmp(b)),
            (Bookmark::Date(a), Bookmark::Date(b)) => Some(a.cmp(b)),
            (Bookmark::Time(a), Bookmark::Time(b)) => Some(a.cmp(b)),
            (Bookmark::Timestamp(a), Bookmark::Timestamp(b)) => Some(a.cmp(b)),
            (Bookmark::LogPosition(a), Bookmark::LogPosition(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Orders two cursor values the way `ORDER BY ... ASC NULLS FIRST` does.
pub fn compare_cursor(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => Bookmark::from_value(b).and_then(|bound| bound.compare(a)),
    }
}

/// Integers up to 128 bits; JSON numbers when they fit in an `i64`.
mod wide_integer {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        match i64::try_from(*value) {
            Ok(small) => serializer.serialize_i64(small),
            Err(_) => serializer.collect_str(value),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Signed(i64),
            Unsigned(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Signed(v) => Ok(i128::from(v)),
            Repr::Unsigned(v) => Ok(i128::from(v)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Durable progress marker of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub method: ReplicationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<Bookmark>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_fingerprint: Option<String>,
}

/// State of every stream, as read with `--state` and emitted in STATE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, StreamState>,
}

impl StateDocument {
    /// Parses and validates a state document.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let document: StateDocument =
            serde_json::from_str(text).map_err(|e| Error::State(e.to_string()))?;
        for (stream, state) in &document.bookmarks {
            if state.version == 0 {
                return Err(Error::State(format!(
                    "stream '{}' has version 0; versions start at 1",
                    stream
                )));
            }
        }
        Ok(document)
    }

    pub fn get(&self, stream: &str) -> Option<&StreamState> {
        self.bookmarks.get(stream)
    }
}

#[derive(Debug, Clone)]
struct Cursor {
    column: String,
    log_based: bool,
}

/// Tracks bookmarks as records are emitted and decides when to checkpoint.
#[derive(Debug)]
pub struct StateTracker {
    document: StateDocument,
    checkpoint_every: u64,
    cursors: HashMap<String, Cursor>,
    /// Records emitted per stream since the last checkpoint
    pending: HashMap<String, u64>,
}

impl StateTracker {
    pub fn new(initial: StateDocument, checkpoint_every: u64) -> Self {
        Self {
            document: initial,
            checkpoint_every: checkpoint_every.max(1),
            cursors: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Records the plan of a stream that is about to be extracted.
    pub fn begin(&mut self, plan: &ExtractionPlan) {
        self.document.bookmarks.insert(
            plan.stream.clone(),
            StreamState {
                method: plan.record_method,
                replication_key: plan.replication_key.clone(),
                bookmark: plan.start_bookmark.clone(),
                version: plan.version,
                schema_fingerprint: Some(plan.schema_fingerprint.clone()),
            },
        );
        match &plan.cursor_column {
            Some(column) if plan.record_method != ReplicationMethod::FullTable => {
                self.cursors.insert(
                    plan.stream.clone(),
                    Cursor {
                        column: column.clone(),
                        log_based: plan.record_method == ReplicationMethod::LogBased,
                    },
                );
            }
            _ => {
                self.cursors.remove(&plan.stream);
            }
        }
    }

    /// Moves the bookmark of `stream` past an emitted record.
    ///
    /// Returns the new bookmark when it changed. Nulls and values behind
    /// the current bookmark leave it in place.
    pub fn advance(&mut self, stream: &str, record: &Record) -> Option<Bookmark> {
        *self.pending.entry(stream.to_string()).or_insert(0) += 1;
        let cursor = self.cursors.get(stream)?;
        let value = record.get(&cursor.column)?;
        let candidate = if cursor.log_based {
            Bookmark::position(value)?
        } else {
            Bookmark::from_value(value)?
        };

        let state = self.document.bookmarks.get_mut(stream)?;
        let moves = match &state.bookmark {
            Some(current) => matches!(candidate.partial_cmp(current), Some(Ordering::Greater)),
            None => true,
        };
        if moves {
            state.bookmark = Some(candidate.clone());
            Some(candidate)
        } else {
            None
        }
    }

    /// Whether enough records went by since the last checkpoint of `stream`.
    pub fn checkpoint_due(&self, stream: &str) -> bool {
        self.pending
            .get(stream)
            .map(|count| *count >= self.checkpoint_every)
            .unwrap_or(false)
    }

    /// Snapshot of every stream's state; resets the record counters.
    pub fn checkpoint(&mut self) -> StateDocument {
        self.pending.clear();
        self.document.clone()
    }

    pub fn get(&self, stream: &str) -> Option<&StreamState> {
        self.document.get(stream)
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }
}
