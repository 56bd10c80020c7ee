//! Persistent agent state.
//!
//! A single SQLite database (`<data_dir>/state.db`, WAL mode) holds the
//! applied-state singleton, one row per managed service, and an append-only
//! per-service log. Schema changes are additive: `open` creates missing
//! tables and columns, never drops or rewrites existing ones, so downgrades
//! keep working against newer databases.

mod store;
mod types;

pub use store::StateStore;
pub use types::{AppliedState, ProcessStatus, ServiceLogRow, ServiceProcess};
