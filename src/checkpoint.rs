//! State file persistence.
//!
//! Singer taps normally hand their state to the target through STATE
//! messages and let the orchestrator store it. When `--state-output` is
//! given, every checkpoint is additionally written to a local file so a
//! crashed run can be resumed with `--state` on that same file.
//!
//! # Example
//!
//! ```rust,no_run
//! use tap_duckdb::checkpoint::CheckpointManager;
//! use tap_duckdb::sync::StateDocument;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("state.json");
//!
//!     // Load existing state
//!     if let Some(state) = manager.load().await? {
//!         println!("Resuming {} streams", state.bookmarks.len());
//!     }
//!
//!     // Save new state
//!     manager.save(&StateDocument::default()).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::sync::StateDocument;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Manages a state document on disk.
///
/// The `CheckpointManager` writes atomically so the file is never left
/// half-written, even if the process crashes during a write.
///
/// # Example
///
/// ```rust,no_run
/// use tap_duckdb::checkpoint::CheckpointManager;
/// use std::path::PathBuf;
///
/// let manager = CheckpointManager::new(PathBuf::from("/var/lib/tap-duckdb/state.json"));
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager with the specified file path.
    ///
    /// # Arguments
    ///
    /// * `state_path` - Path where the state file will be stored
    pub fn new(state_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: state_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the state document from disk if it exists.
    ///
    /// Returns `None` if the file doesn't exist, which typically means this
    /// is the first run.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - The file exists but cannot be read
    /// - The file is not a valid state document ([`Error::State`])
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use tap_duckdb::checkpoint::CheckpointManager;
    /// # async fn example() -> tap_duckdb::Result<()> {
    /// let manager = CheckpointManager::new("state.json");
    ///
    /// match manager.load().await? {
    ///     Some(state) => {
    ///         for (stream, entry) in &state.bookmarks {
    ///             println!("{}: version {}", stream, entry.version);
    ///         }
    ///     }
    ///     None => {
    ///         println!("No state found, extracting everything");
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn load(&self) -> Result<Option<StateDocument>> {
        if !self.file_path.exists() {
            debug!("No state file found at {:?}", self.file_path);
            return Ok(None);
        }

        match fs::read_to_string(&self.file_path).await {
            Ok(content) => match StateDocument::parse(&content) {
                Ok(state) => {
                    info!(
                        "Loaded state: {} streams from {:?}",
                        state.bookmarks.len(),
                        self.file_path
                    );
                    Ok(Some(state))
                }
                Err(e) => {
                    error!("Failed to parse state file: {}", e);
                    Err(e)
                }
            },
            Err(e) => {
                error!("Failed to read state file: {}", e);
                Err(Error::Io(e))
            }
        }
    }

    /// Saves the state document atomically.
    ///
    /// This method ensures that the file is written atomically by:
    /// 1. Writing to a temporary file
    /// 2. Syncing the file to ensure data is on disk
    /// 3. Atomically renaming the temp file to the final location
    ///
    /// # Errors
    ///
    /// Returns `Err` if the document cannot be serialized or any of the
    /// filesystem operations fail.
    pub async fn save(&self, state: &StateDocument) -> Result<()> {
        debug!("Saving state for {} streams", state.bookmarks.len());

        // Create temporary file
        let temp_path = self.file_path.with_extension("tmp");

        // Write to temporary file
        let json = serde_json::to_string_pretty(state)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        // Atomically rename temp file to final location
        fs::rename(&temp_path, &self.file_path).await?;

        debug!("State saved successfully");
        Ok(())
    }
}
