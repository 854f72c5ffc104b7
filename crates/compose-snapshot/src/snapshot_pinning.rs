//! Snapshot pinning to prevent premature reclamation of state records.
//!
//! Each open snapshot pins the lowest snapshot id it still treats as
//! invalid (or its own id when it ignores nothing). No record newer than the
//! lowest pin may be collapsed, because some open snapshot may resolve to it.
//!
//! The table lives inside the global snapshot state and is only touched while
//! the global lock is held.
use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};

/// A handle to a pin. Released exactly once through [`PinningTable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PinHandle(usize);

impl PinHandle {
    /// Invalid pin handle constant.
    pub(crate) const INVALID: PinHandle = PinHandle(0);

    /// Check if this handle is valid (non-zero).
    pub(crate) fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug)]
pub(crate) struct PinningTable {
    /// Pins sorted by snapshot id; several handles may pin the same id.
    pins: Vec<(SnapshotId, PinHandle)>,
    /// Counter for generating unique pin handles. Starts at 1 (0 is INVALID).
    next_handle: usize,
}

impl PinningTable {
    pub(crate) const fn new() -> Self {
        Self {
            pins: Vec::new(),
            next_handle: 1,
        }
    }

    /// Pin the lowest id `invalid` contains, or `snapshot_id` when it is empty.
    pub(crate) fn track(&mut self, snapshot_id: SnapshotId, invalid: &SnapshotIdSet) -> PinHandle {
        let pinned = invalid.lowest(snapshot_id);
        let position = self.pins.partition_point(|&(id, _)| id <= pinned);

        let handle = PinHandle(self.next_handle);
        self.next_handle += 1;
        self.pins.insert(position, (pinned, handle));
        handle
    }

    /// Release a pin. Unknown and invalid handles are ignored.
    pub(crate) fn release(&mut self, handle: PinHandle) -> bool {
        if !handle.is_valid() {
            return false;
        }
        match self.pins.iter().position(|&(_, pin)| pin == handle) {
            Some(position) => {
                self.pins.remove(position);
                true
            }
            None => false,
        }
    }

    /// The lowest pinned snapshot id, or None if nothing is pinned.
    pub(crate) fn lowest_pinned(&self) -> Option<SnapshotId> {
        self.pins.first().map(|&(id, _)| id)
    }

    #[cfg(test)]
    pub(crate) fn is_pinned(&self, snapshot_id: SnapshotId) -> bool {
        self.pins.iter().any(|&(id, _)| id == snapshot_id)
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self) -> usize {
        self.pins.len()
    }
}
