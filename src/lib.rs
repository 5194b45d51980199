//! pipeflow library - pipe throughput monitoring over shared terminals

pub mod config;
pub mod cursor;
pub mod display;
pub mod numeric;
pub mod signals;
pub mod terminal;
pub mod transfer;
pub mod watch;
pub mod watchfd;

// Re-export commonly used types
pub use config::Config;
pub use cursor::{CursorCoordinator, CursorError};
pub use watchfd::{FdError, FdIntrospection, FdTracker, SlotId, WatchError};
