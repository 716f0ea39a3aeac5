//! Immutable filesystem snapshots.
//!
//! Every filesystem-producing operation ends by committing a tree here; the
//! rest of the engine only passes [`SnapshotRef`]s around.

mod store;
mod types;

pub use store::SnapshotStore;
pub use types::{SnapshotError, SnapshotRef};
