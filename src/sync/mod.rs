//! Replication planning, extraction and state tracking.

pub mod extractor;
pub mod planner;
pub mod state;

pub use extractor::{extract, RecordStream};
pub use planner::{plan, BookmarkComparison, ExtractionPlan};
pub use state::{
    compare_cursor, Bookmark, ReplicationMethod, StateDocument, StateTracker, StreamState,
};
