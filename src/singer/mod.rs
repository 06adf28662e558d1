//! Singer message stream output.

pub mod emitter;
pub mod message;

pub use emitter::{Emitter, SharedBuffer};
pub use message::Message;
