//! Filesystem watching and debouncing.
//!
//! ```text
//! PathWatcher (one recursive notify watcher, all roots)
//!   - PathFilter (watch_dirs, root files, extensions, ignores)
//!         |
//!     WatchEvent (created / modified / deleted)
//!         |
//! Debouncer (per-path quiet interval, injected clock)
//!         |
//!     StableEvent (path, latest kind, generation)
//! ```
//!
//! `rescan` repairs drift by diffing the disk against the store's known paths.

mod debouncer;
mod error;
mod event;
mod filter;
mod path_watcher;
pub mod rescan;

pub use debouncer::Debouncer;
pub use error::WatchError;
pub use event::{ChangeKind, StableEvent, WatchEvent};
pub use filter::PathFilter;
pub use path_watcher::PathWatcher;
