use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::state::{Bookmark, ReplicationMethod, StreamState};
use crate::catalog::{StreamDescriptor, StreamSettings};
use crate::source::{Comparison, Predicate, QuerySpec, SelectColumn};
use crate::{Error, Result};

/// How rows equal to the stored bookmark are treated on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookmarkComparison {
    /// Re-emit boundary ties (at-least-once).
    #[default]
    Inclusive,
    /// Skip rows equal to the bookmark. Rows sharing the last key value that
    /// were not yet emitted are lost.
    Exclusive,
}

impl BookmarkComparison {
    fn comparison(&self) -> Comparison {
        match self {
            BookmarkComparison::Inclusive => Comparison::GreaterOrEqual,
            BookmarkComparison::Exclusive => Comparison::Greater,
        }
    }
}

/// Everything the extractor needs to run one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionPlan {
    pub stream: String,
    /// Method this run executes
    pub method: ReplicationMethod,
    /// Method persisted for the next run
    pub record_method: ReplicationMethod,
    pub query: QuerySpec,
    /// Column the rows are ordered by and bookmarks are read from
    pub cursor_column: Option<String>,
    pub replication_key: Option<String>,
    pub version: u64,
    /// Version of the previous run, if any
    pub prior_version: Option<u64>,
    /// Prior bookmarks were discarded
    pub reset: bool,
    pub start_bookmark: Option<Bookmark>,
    pub schema_fingerprint: String,
}

impl ExtractionPlan {
    /// Whether RECORDs carry a version and ACTIVATE_VERSION is emitted.
    pub fn is_versioned(&self) -> bool {
        self.method == ReplicationMethod::FullTable && self.record_method == ReplicationMethod::FullTable
    }
}

/// Decides how to extract one stream given what happened last time.
///
/// `change_log` is the executor's change position column for the object,
/// if it keeps one.
pub fn plan(
    descriptor: &StreamDescriptor,
    prior: Option<&StreamState>,
    settings: &StreamSettings,
    comparison: BookmarkComparison,
    change_log: Option<&str>,
) -> Result<ExtractionPlan> {
    let stream = descriptor.name.clone();

    let cursor = match settings.method {
        ReplicationMethod::FullTable => None,
        ReplicationMethod::IncrementalKey => {
            let key = match &settings.replication_key {
                Some(key) => key.clone(),
                None => {
                    let key = descriptor.default_replication_key().ok_or_else(|| Error::InvalidSelection {
                        stream: stream.clone(),
                        message: "no change timestamp or primary key column can serve as the replication key; \
                                  set replication-key in the catalog"
                            .to_string(),
                    })?;
                    info!(stream = %stream, "Using '{}' as the replication key", key);
                    key.to_string()
                }
            };
            match descriptor.column(&key) {
                Some(column) if column.is_cursor_capable() => Some(key),
                _ => {
                    return Err(Error::InvalidSelection {
                        stream,
                        message: format!("column '{}' cannot be used as a replication key", key),
                    })
                }
            }
        }
        ReplicationMethod::LogBased => match change_log {
            Some(column) if descriptor.column(column).is_some() => Some(column.to_string()),
            _ => {
                return Err(Error::UnsupportedMethod {
                    stream,
                    method: ReplicationMethod::LogBased,
                })
            }
        },
    };

    let fingerprint = descriptor.schema_fingerprint.clone();
    let mut reset = false;
    if let Some(prior) = prior {
        let mut reasons = Vec::new();
        if prior
            .schema_fingerprint
            .as_ref()
            .is_some_and(|previous| previous != &fingerprint)
        {
            reasons.push("schema changed".to_string());
        }
        if prior.method != settings.method {
            reasons.push(format!("method changed from {} to {}", prior.method, settings.method));
        }
        if prior.replication_key != cursor {
            reasons.push(format!(
                "replication key changed from {} to {}",
                prior.replication_key.as_deref().unwrap_or("none"),
                cursor.as_deref().unwrap_or("none")
            ));
        }
        if let (Some(bookmark), Some(column)) = (&prior.bookmark, &cursor) {
            let fits = descriptor
                .column(column)
                .map(|c| bookmark.fits(&c.portable))
                .unwrap_or(false);
            if !fits {
                reasons.push("stored bookmark does not match the key column type".to_string());
            }
        }
        if !reasons.is_empty() {
            warn!(
                stream = %stream,
                "Restarting replication from scratch: {}",
                reasons.join("; ")
            );
            reset = true;
        }
    }

    let prior_version = prior.map(|p| p.version);
    let version = match (prior_version, reset, settings.method) {
        (None, _, _) => 1,
        (Some(v), true, _) | (Some(v), false, ReplicationMethod::FullTable) => v + 1,
        (Some(v), false, _) => v,
    };
    let start_bookmark = match (prior, reset, settings.method) {
        (Some(p), false, ReplicationMethod::IncrementalKey | ReplicationMethod::LogBased) => {
            p.bookmark.clone()
        }
        _ => None,
    };

    let method = match settings.method {
        ReplicationMethod::IncrementalKey if start_bookmark.is_none() => ReplicationMethod::FullTable,
        other => other,
    };

    let predicate = match (&start_bookmark, &cursor) {
        (Some(bound), Some(column)) => {
            let native_type = descriptor
                .column(column)
                .map(|c| c.native_type.clone())
                .unwrap_or_default();
            let comparison = if settings.method == ReplicationMethod::LogBased {
                Comparison::Greater
            } else {
                comparison.comparison()
            };
            Some(Predicate {
                column: column.clone(),
                native_type,
                comparison,
                bound: bound.clone(),
            })
        }
        _ => None,
    };

    let query = QuerySpec {
        schema: descriptor.schema.clone(),
        table: descriptor.table.clone(),
        columns: descriptor
            .columns
            .iter()
            .filter(|c| {
                !settings.deselected.contains(&c.name) || c.is_key || cursor.as_ref() == Some(&c.name)
            })
            .map(|c| SelectColumn {
                name: c.name.clone(),
                native_type: c.native_type.clone(),
            })
            .collect(),
        predicate,
        order_by: cursor.clone(),
    };

    info!(
        stream = %stream,
        method = %method,
        version = version,
        reset = reset,
        "Planned extraction{}",
        match &start_bookmark {
            Some(b) => format!(" from bookmark {}", b.to_param()),
            None => String::new(),
        }
    );

    Ok(ExtractionPlan {
        stream,
        method,
        record_method: settings.method,
        query,
        replication_key: cursor.clone(),
        cursor_column: cursor,
        version,
        prior_version,
        reset,
        start_bookmark,
        schema_fingerprint: fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CatalogObject, ObjectKind, RawColumn};
    use chrono::{TimeZone, Utc};

    fn orders() -> StreamDescriptor {
        StreamDescriptor::build(
            CatalogObject::new("main", "orders", ObjectKind::Table),
            vec![
                RawColumn::new("id", "INTEGER").primary_key(),
                RawColumn::new("updated_at", "TIMESTAMP"),
                RawColumn::new("amount", "DECIMAL(10,2)"),
                RawColumn::new("ratio", "DOUBLE"),
            ],
        )
        .unwrap()
    }

    fn incremental() -> StreamSettings {
        StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: Some("updated_at".to_string()),
            deselected: Default::default(),
        }
    }

    fn full_table() -> StreamSettings {
        StreamSettings {
            method: ReplicationMethod::FullTable,
            replication_key: None,
            deselected: Default::default(),
        }
    }

    fn jan(day: u32) -> Bookmark {
        Bookmark::Timestamp(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
    }

    fn prior_incremental(descriptor: &StreamDescriptor, bookmark: Bookmark) -> StreamState {
        StreamState {
            method: ReplicationMethod::IncrementalKey,
            replication_key: Some("updated_at".to_string()),
            bookmark: Some(bookmark),
            version: 3,
            schema_fingerprint: Some(descriptor.schema_fingerprint.clone()),
        }
    }

    #[test]
    fn test_first_incremental_run_is_ordered_full_pass() {
        let descriptor = orders();
        let plan = plan(&descriptor, None, &incremental(), BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(plan.method, ReplicationMethod::FullTable);
        assert_eq!(plan.record_method, ReplicationMethod::IncrementalKey);
        assert_eq!(plan.query.order_by.as_deref(), Some("updated_at"));
        assert!(plan.query.predicate.is_none());
        assert_eq!(plan.version, 1);
        assert!(!plan.is_versioned());
    }

    #[test]
    fn test_resume_from_bookmark() {
        let descriptor = orders();
        let prior = prior_incremental(&descriptor, jan(1));
        let plan = plan(&descriptor, Some(&prior), &incremental(), BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(plan.method, ReplicationMethod::IncrementalKey);
        assert_eq!(plan.version, 3);
        assert!(!plan.reset);
        let predicate = plan.query.predicate.unwrap();
        assert_eq!(predicate.comparison, Comparison::GreaterOrEqual);
        assert_eq!(predicate.bound, jan(1));
        assert_eq!(predicate.native_type, "TIMESTAMP");
    }

    #[test]
    fn test_exclusive_comparison() {
        let descriptor = orders();
        let prior = prior_incremental(&descriptor, jan(1));
        let plan = plan(&descriptor, Some(&prior), &incremental(), BookmarkComparison::Exclusive, None).unwrap();
        assert_eq!(plan.query.predicate.unwrap().comparison, Comparison::Greater);
    }

    #[test]
    fn test_schema_drift_resets() {
        let descriptor = orders();
        let mut prior = prior_incremental(&descriptor, jan(1));
        prior.schema_fingerprint = Some("id:integer:not null".to_string());
        let plan = plan(&descriptor, Some(&prior), &incremental(), BookmarkComparison::Inclusive, None).unwrap();
        assert!(plan.reset);
        assert_eq!(plan.version, 4);
        assert!(plan.start_bookmark.is_none());
        assert!(plan.query.predicate.is_none());
        assert_eq!(plan.method, ReplicationMethod::FullTable);
    }

    #[test]
    fn test_key_change_resets() {
        let descriptor = orders();
        let prior = prior_incremental(&descriptor, jan(1));
        let settings = StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: Some("id".to_string()),
            deselected: Default::default(),
        };
        let plan = plan(&descriptor, Some(&prior), &settings, BookmarkComparison::Inclusive, None).unwrap();
        assert!(plan.reset);
        assert_eq!(plan.cursor_column.as_deref(), Some("id"));
    }

    #[test]
    fn test_method_change_resets() {
        let descriptor = orders();
        let prior = prior_incremental(&descriptor, jan(1));
        let plan = plan(&descriptor, Some(&prior), &full_table(), BookmarkComparison::Inclusive, None).unwrap();
        assert!(plan.reset);
        assert_eq!(plan.version, 4);
        assert!(plan.is_versioned());
    }

    #[test]
    fn test_full_table_version_increments_every_run() {
        let descriptor = orders();
        let first = plan(&descriptor, None, &full_table(), BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.prior_version, None);
        assert!(first.query.order_by.is_none());

        let prior = StreamState {
            method: ReplicationMethod::FullTable,
            replication_key: None,
            bookmark: None,
            version: 1,
            schema_fingerprint: Some(descriptor.schema_fingerprint.clone()),
        };
        let second = plan(&descriptor, Some(&prior), &full_table(), BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(second.version, 2);
        assert!(!second.reset);
    }

    #[test]
    fn test_default_key_is_first_candidate() {
        let descriptor = orders();
        let settings = StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: None,
            deselected: Default::default(),
        };
        let plan = plan(&descriptor, None, &settings, BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(plan.cursor_column.as_deref(), Some("updated_at"));
    }

    #[test]
    fn test_default_key_prefers_primary_key_over_text() {
        let descriptor = StreamDescriptor::build(
            CatalogObject::new("main", "people", ObjectKind::Table),
            vec![
                RawColumn::new("name", "VARCHAR"),
                RawColumn::new("id", "INTEGER").primary_key(),
            ],
        )
        .unwrap();
        let settings = StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: None,
            deselected: Default::default(),
        };
        let plan = plan(&descriptor, None, &settings, BookmarkComparison::Inclusive, None).unwrap();
        assert_eq!(plan.cursor_column.as_deref(), Some("id"));
    }

    #[test]
    fn test_no_candidate_is_invalid_selection() {
        let descriptor = StreamDescriptor::build(
            CatalogObject::new("main", "floats", ObjectKind::Table),
            vec![RawColumn::new("x", "DOUBLE")],
        )
        .unwrap();
        let settings = StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: None,
            deselected: Default::default(),
        };
        let err = plan(&descriptor, None, &settings, BookmarkComparison::Inclusive, None).unwrap_err();
        assert!(matches!(err, Error::InvalidSelection { .. }));
    }

    #[test]
    fn test_deselected_columns_are_not_selected() {
        let descriptor = orders();
        let settings = StreamSettings {
            method: ReplicationMethod::IncrementalKey,
            replication_key: None,
            deselected: ["updated_at", "ratio"].into_iter().map(String::from).collect(),
        };
        let plan = plan(&descriptor, None, &settings, BookmarkComparison::Inclusive, None).unwrap();
        let names: Vec<&str> = plan.query.columns.iter().map(|c| c.name.as_str()).collect();
        // The cursor column stays even when deselected
        assert_eq!(names, vec!["id", "updated_at", "amount"]);
    }

    #[test]
    fn test_log_based_without_change_log_is_unsupported() {
        let descriptor = orders();
        let settings = StreamSettings {
            method: ReplicationMethod::LogBased,
            replication_key: None,
            deselected: Default::default(),
        };
        let err = plan(&descriptor, None, &settings, BookmarkComparison::Inclusive, None).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedMethod {
                method: ReplicationMethod::LogBased,
                ..
            }
        ));
    }

    #[test]
    fn test_log_based_resumes_exclusively() {
        let descriptor = orders();
        let settings = StreamSettings {
            method: ReplicationMethod::LogBased,
            replication_key: None,
            deselected: Default::default(),
        };
        let prior = StreamState {
            method: ReplicationMethod::LogBased,
            replication_key: Some("id".to_string()),
            bookmark: Some(Bookmark::LogPosition(10)),
            version: 1,
            schema_fingerprint: None,
        };
        let plan = plan(&descriptor, Some(&prior), &settings, BookmarkComparison::Inclusive, Some("id")).unwrap();
        assert_eq!(plan.method, ReplicationMethod::LogBased);
        let predicate = plan.query.predicate.unwrap();
        assert_eq!(predicate.comparison, Comparison::Greater);
        assert_eq!(predicate.bound, Bookmark::LogPosition(10));
    }

    #[test]
    fn test_mismatched_bookmark_type_resets() {
        let descriptor = orders();
        let prior = prior_incremental(&descriptor, Bookmark::Integer(5));
        let plan = plan(&descriptor, Some(&prior), &incremental(), BookmarkComparison::Inclusive, None).unwrap();
        assert!(plan.reset);
        assert!(plan.start_bookmark.is_none());
    }
}
