#![doc = r"Snapshot state and change tracking core for Compose-RS."]
//!
//! Mutable state lives in [`MutableState`] cells. Every cell keeps a list of
//! records tagged with the id of the snapshot that wrote them; a [`Snapshot`]
//! sees, for each cell, the newest record it considers valid. Writes stay
//! private to their snapshot until [`Snapshot::apply`] publishes them, and the
//! [`ChangeObserverRegistry`] hears about every write set applied globally.

pub mod collections;
mod observer;
mod snapshot;
pub mod snapshot_id_set;
mod snapshot_pinning;
mod state;

pub use observer::{
    ApplyObserver, ChangeObserverRegistry, ObserverToken, ReadObserver, WriteObserver,
};
pub use snapshot::{collect_unused_records, Snapshot, SnapshotState};
pub use snapshot_id_set::{SnapshotId, SnapshotIdSet};
pub use state::{
    mutable_state_of, CellId, LastWriterWins, MutableState, MutationPolicy, NeverEqual,
    StructuralEquality,
};

#[cfg(test)]
pub(crate) use snapshot::test_guard;

/// The set of cells written by one applied snapshot.
pub type CellSet = collections::map::HashSet<CellId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// A cell was accessed with no snapshot entered on this thread.
    NoSnapshot,
    /// Another snapshot committed a conflicting value and the cell's policy
    /// could not merge it.
    Conflict { snapshot: SnapshotId, cell: CellId },
    /// No record of the cell is valid for the snapshot.
    InvalidCellAccess { cell: CellId, snapshot: SnapshotId },
    Disposed { snapshot: SnapshotId },
    Applied { snapshot: SnapshotId },
    ReadOnly { snapshot: SnapshotId },
    /// A nested snapshot was applied after its parent closed.
    ParentClosed { snapshot: SnapshotId },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::NoSnapshot => write!(f, "no snapshot is current on this thread"),
            SnapshotError::Conflict { snapshot, cell } => {
                write!(f, "snapshot {snapshot} conflicts on {cell}")
            }
            SnapshotError::InvalidCellAccess { cell, snapshot } => {
                write!(f, "{cell} has no record readable from snapshot {snapshot}")
            }
            SnapshotError::Disposed { snapshot } => write!(f, "snapshot {snapshot} is disposed"),
            SnapshotError::Applied { snapshot } => {
                write!(f, "snapshot {snapshot} was already applied")
            }
            SnapshotError::ReadOnly { snapshot } => write!(f, "snapshot {snapshot} is read-only"),
            SnapshotError::ParentClosed { snapshot } => {
                write!(f, "parent of snapshot {snapshot} is no longer open")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Run `f` inside a fresh mutable snapshot and apply it.
///
/// The snapshot nests under the current snapshot when one is entered and
/// mutable, otherwise it is a root snapshot. The snapshot is disposed on every
/// exit path.
pub fn with_mutable_snapshot<R>(f: impl FnOnce() -> R) -> Result<R, SnapshotError> {
    let snapshot = match Snapshot::current() {
        Some(current) if !current.is_read_only() => {
            current.take_nested_mutable_snapshot(None, None)?
        }
        _ => Snapshot::take_mutable_snapshot(None, None),
    };
    let result = snapshot.enter(f);
    let applied = snapshot.apply();
    snapshot.dispose();
    applied.map(|()| result)
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;
