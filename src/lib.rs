pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod singer;
pub mod source;
pub mod sync;
pub mod tap;

pub use config::Config;
pub use error::{Error, Result};
pub use tap::{RunContext, RunSummary, Tap};
