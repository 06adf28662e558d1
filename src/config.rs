use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::sync::{BookmarkComparison, ReplicationMethod};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// DuckDB database file
    pub path: PathBuf,
    /// Catalog name the file is attached as
    pub database: String,
    /// Only discover these schemas
    #[serde(default)]
    pub include_schemas: Option<Vec<String>>,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: usize,
    #[serde(default = "default_replication_method")]
    pub default_replication_method: ReplicationMethod,
    #[serde(default)]
    pub bookmark_comparison: BookmarkComparison,
    #[serde(default = "default_row_buffer")]
    pub row_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_every: default_checkpoint_every(),
            max_concurrent_streams: default_max_concurrent_streams(),
            default_replication_method: default_replication_method(),
            bookmark_comparison: BookmarkComparison::default(),
            row_buffer: default_row_buffer(),
        }
    }
}

impl Config {
    /// Config pointing at `path` with default sync settings.
    pub fn new(path: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            database: database.into(),
            include_schemas: None,
            sync: SyncConfig::default(),
        }
    }

    /// Loads the file given with `--config`, overlaid with `TAP_DUCKDB_*`
    /// environment variables (`TAP_DUCKDB_SYNC__CHECKPOINT_EVERY=500`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("TAP_DUCKDB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(Error::Config("database must not be empty".to_string()));
        }
        if self.sync.checkpoint_every == 0 {
            return Err(Error::Config("sync.checkpoint_every must be at least 1".to_string()));
        }
        if self.sync.max_concurrent_streams == 0 {
            return Err(Error::Config(
                "sync.max_concurrent_streams must be at least 1".to_string(),
            ));
        }
        if self.sync.row_buffer == 0 {
            return Err(Error::Config("sync.row_buffer must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_checkpoint_every() -> u64 {
    10_000
}

fn default_max_concurrent_streams() -> usize {
    1
}

fn default_replication_method() -> ReplicationMethod {
    ReplicationMethod::FullTable
}

fn default_row_buffer() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = write_config(r#"{"path": "/data/warehouse.duckdb", "database": "warehouse"}"#);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.path, PathBuf::from("/data/warehouse.duckdb"));
        assert_eq!(config.sync.checkpoint_every, 10_000);
        assert_eq!(config.sync.max_concurrent_streams, 1);
        assert_eq!(config.sync.default_replication_method, ReplicationMethod::FullTable);
        assert_eq!(config.sync.bookmark_comparison, BookmarkComparison::Inclusive);
        assert!(config.include_schemas.is_none());
    }

    #[test]
    fn test_sync_section() {
        let file = write_config(
            r#"{"path": "w.duckdb", "database": "w", "include_schemas": ["main"],
                "sync": {"checkpoint_every": 50, "default_replication_method": "incremental-key",
                         "bookmark_comparison": "exclusive"}}"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sync.checkpoint_every, 50);
        assert_eq!(config.sync.default_replication_method, ReplicationMethod::IncrementalKey);
        assert_eq!(config.sync.bookmark_comparison, BookmarkComparison::Exclusive);
        assert_eq!(config.include_schemas, Some(vec!["main".to_string()]));
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let file = write_config(r#"{"path": "w.duckdb", "database": "w", "sync": {"checkpoint_every": 0}}"#);
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));

        let mut config = Config::new("w.duckdb", "w");
        config.sync.max_concurrent_streams = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_database_is_an_error() {
        let file = write_config(r#"{"path": "w.duckdb"}"#);
        assert!(matches!(Config::from_file(file.path()), Err(Error::Config(_))));
    }
}
