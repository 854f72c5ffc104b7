//! Versioned mutable state cells.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::observer;
use crate::snapshot::{Snapshot, SnapshotView};
use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};
use crate::SnapshotError;

/// Records tagged with this id are never readable.
pub(crate) const INVALID_SNAPSHOT: SnapshotId = 0;
/// Tag of the initial record of every cell; readable from every snapshot.
pub(crate) const PREEXISTING_SNAPSHOT_ID: SnapshotId = 1;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Decides when two values of a cell are the same and how to merge
/// concurrent writes.
///
/// Policies are called while cell records are locked and must not touch
/// snapshot state themselves.
pub trait MutationPolicy<T>: Send + Sync {
    fn equivalent(&self, a: &T, b: &T) -> bool;

    /// Merge `applied` (the applying snapshot's value) with `current` (a value
    /// committed since `previous` was read). `None` reports a conflict.
    fn merge(&self, _previous: &T, _current: &T, _applied: &T) -> Option<T> {
        None
    }
}

/// Values are equivalent when `==`; concurrent different writes conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralEquality;

impl<T: PartialEq> MutationPolicy<T> for StructuralEquality {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Every write counts as a change, even of an equal value.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEqual;

impl<T> MutationPolicy<T> for NeverEqual {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

/// Structural equality, with the applying snapshot winning concurrent writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl<T: PartialEq + Clone> MutationPolicy<T> for LastWriterWins {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn merge(&self, _previous: &T, _current: &T, applied: &T) -> Option<T> {
        Some(applied.clone())
    }
}

pub(crate) struct StateRecord<T> {
    snapshot_id: SnapshotId,
    value: T,
}

#[inline]
pub(crate) fn valid(current: SnapshotId, candidate: SnapshotId, invalid: &SnapshotIdSet) -> bool {
    candidate != INVALID_SNAPSHOT && candidate <= current && !invalid.contains(candidate)
}

/// Index of the valid record with the highest id.
fn readable<T>(
    records: &[StateRecord<T>],
    id: SnapshotId,
    invalid: &SnapshotIdSet,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (index, record) in records.iter().enumerate() {
        if !valid(id, record.snapshot_id, invalid) {
            continue;
        }
        match best {
            Some(current) if records[current].snapshot_id >= record.snapshot_id => {}
            _ => best = Some(index),
        }
    }
    best
}

fn record_by_id<T>(records: &[StateRecord<T>], id: SnapshotId) -> Option<&StateRecord<T>> {
    records.iter().find(|record| record.snapshot_id == id)
}

pub(crate) enum MergeResolution {
    Conflict,
    /// The committed value is equivalent to the applied one.
    KeepCurrent,
    /// A merged value, boxed so it can travel through the type-erased apply.
    Merged(Box<dyn Any + Send>),
}

/// Type-erased view of a cell used by snapshot apply, abandon and reclamation.
pub(crate) trait StateObject: Send + Sync {
    fn cell_id(&self) -> CellId;

    fn readable_id(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId>;

    fn merge_records(
        &self,
        previous: SnapshotId,
        current: SnapshotId,
        applied: SnapshotId,
    ) -> MergeResolution;

    /// Add a record tagged `id` holding a copy of record `source`.
    fn prepend_copy(&self, source: SnapshotId, id: SnapshotId);

    fn prepend_merged(&self, merged: Box<dyn Any + Send>, id: SnapshotId);

    /// Retag every record whose id is in `ids` as invalid.
    fn invalidate_records(&self, ids: &SnapshotIdSet);

    /// Drop invalid records and every record at or below `reuse_limit` except
    /// the newest one. Returns the number of records removed.
    fn reclaim_records(&self, reuse_limit: SnapshotId) -> usize;

    fn record_count(&self) -> usize;
}

struct MutableStateInner<T> {
    id: CellId,
    records: RwLock<Vec<StateRecord<T>>>,
    policy: Arc<dyn MutationPolicy<T>>,
}

impl<T> MutableStateInner<T> {
    fn records(&self) -> RwLockReadGuard<'_, Vec<StateRecord<T>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn records_mut(&self) -> RwLockWriteGuard<'_, Vec<StateRecord<T>>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + Sync + 'static> StateObject for MutableStateInner<T> {
    fn cell_id(&self) -> CellId {
        self.id
    }

    fn readable_id(&self, id: SnapshotId, invalid: &SnapshotIdSet) -> Option<SnapshotId> {
        let records = self.records();
        readable(&records, id, invalid).map(|index| records[index].snapshot_id)
    }

    fn merge_records(
        &self,
        previous: SnapshotId,
        current: SnapshotId,
        applied: SnapshotId,
    ) -> MergeResolution {
        let values = {
            let records = self.records();
            match (
                record_by_id(&records, previous),
                record_by_id(&records, current),
                record_by_id(&records, applied),
            ) {
                (Some(previous), Some(current), Some(applied)) => Some((
                    previous.value.clone(),
                    current.value.clone(),
                    applied.value.clone(),
                )),
                _ => None,
            }
        };
        let Some((previous, current, applied)) = values else {
            debug_assert!(false, "{} lost a record needed for merging", self.id);
            return MergeResolution::Conflict;
        };

        if self.policy.equivalent(&current, &applied) {
            return MergeResolution::KeepCurrent;
        }
        match self.policy.merge(&previous, &current, &applied) {
            Some(merged) => MergeResolution::Merged(Box::new(merged)),
            None => MergeResolution::Conflict,
        }
    }

    fn prepend_copy(&self, source: SnapshotId, id: SnapshotId) {
        let mut records = self.records_mut();
        let value = match record_by_id(&records, source) {
            Some(record) => record.value.clone(),
            None => panic!("{} has no record {source} to copy", self.id),
        };
        records.push(StateRecord { snapshot_id: id, value });
    }

    fn prepend_merged(&self, merged: Box<dyn Any + Send>, id: SnapshotId) {
        match merged.downcast::<T>() {
            Ok(value) => self.records_mut().push(StateRecord {
                snapshot_id: id,
                value: *value,
            }),
            Err(_) => panic!("merged value for {} has the wrong type", self.id),
        }
    }

    fn invalidate_records(&self, ids: &SnapshotIdSet) {
        for record in self.records_mut().iter_mut() {
            if ids.contains(record.snapshot_id) {
                record.snapshot_id = INVALID_SNAPSHOT;
            }
        }
    }

    fn reclaim_records(&self, reuse_limit: SnapshotId) -> usize {
        let mut records = self.records_mut();
        let newest_reusable = records
            .iter()
            .map(|record| record.snapshot_id)
            .filter(|&id| id != INVALID_SNAPSHOT && id <= reuse_limit)
            .max();
        let before = records.len();
        records.retain(|record| {
            record.snapshot_id != INVALID_SNAPSHOT
                && (record.snapshot_id > reuse_limit || Some(record.snapshot_id) == newest_reusable)
        });
        before - records.len()
    }

    fn record_count(&self) -> usize {
        self.records().len()
    }
}

/// A cell of mutable state observed through snapshots.
///
/// Clones share the same cell.
pub struct MutableState<T> {
    inner: Arc<MutableStateInner<T>>,
}

impl<T: Clone + Send + Sync + 'static> MutableState<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_policy(value, Arc::new(StructuralEquality))
    }

    pub fn with_policy(value: T, policy: Arc<dyn MutationPolicy<T>>) -> Self {
        Self {
            inner: Arc::new(MutableStateInner {
                id: CellId::next(),
                records: RwLock::new(vec![StateRecord {
                    snapshot_id: PREEXISTING_SNAPSHOT_ID,
                    value,
                }]),
                policy,
            }),
        }
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// Read the value visible to the current snapshot.
    pub fn get(&self) -> Result<T, SnapshotError> {
        let snapshot = Snapshot::current().ok_or(SnapshotError::NoSnapshot)?;
        self.get_in(&snapshot)
    }

    pub fn get_in(&self, snapshot: &Snapshot) -> Result<T, SnapshotError> {
        let view = snapshot.read_view()?;
        snapshot.notify_read(self.inner.id);
        observer::notify_read(self.inner.id);
        self.visible_value(&view)
    }

    pub fn set(&self, value: T) -> Result<(), SnapshotError> {
        let snapshot = Snapshot::current().ok_or(SnapshotError::NoSnapshot)?;
        self.set_in(&snapshot, value)
    }

    pub fn set_in(&self, snapshot: &Snapshot, value: T) -> Result<(), SnapshotError> {
        let view = snapshot.write_view()?;
        self.write(snapshot, &view, value)
    }

    /// Mutate a copy of the visible value and write it back.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, SnapshotError> {
        let snapshot = Snapshot::current().ok_or(SnapshotError::NoSnapshot)?;
        self.update_in(&snapshot, f)
    }

    pub fn update_in<R>(
        &self,
        snapshot: &Snapshot,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, SnapshotError> {
        let view = snapshot.write_view()?;
        let mut value = self.visible_value(&view)?;
        let result = f(&mut value);
        self.write(snapshot, &view, value)?;
        Ok(result)
    }

    fn visible_value(&self, view: &SnapshotView) -> Result<T, SnapshotError> {
        let records = self.inner.records();
        readable(&records, view.id, &view.invalid)
            .map(|index| records[index].value.clone())
            .ok_or(SnapshotError::InvalidCellAccess {
                cell: self.inner.id,
                snapshot: view.id,
            })
    }

    fn write(
        &self,
        snapshot: &Snapshot,
        view: &SnapshotView,
        value: T,
    ) -> Result<(), SnapshotError> {
        {
            let mut records = self.inner.records_mut();
            let index = readable(&records, view.id, &view.invalid).ok_or(
                SnapshotError::InvalidCellAccess {
                    cell: self.inner.id,
                    snapshot: view.id,
                },
            )?;
            if self.inner.policy.equivalent(&records[index].value, &value) {
                return Ok(());
            }
            if records[index].snapshot_id == view.id {
                records[index].value = value;
            } else {
                records.push(StateRecord {
                    snapshot_id: view.id,
                    value,
                });
            }
        }
        snapshot.record_modified(Arc::clone(&self.inner) as Arc<dyn StateObject>);
        snapshot.notify_write(self.inner.id);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.inner.record_count()
    }
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for MutableState<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for MutableState<T> {}

impl<T> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("id", &self.inner.id)
            .field("records", &self.inner.records().len())
            .finish()
    }
}

pub fn mutable_state_of<T: Clone + PartialEq + Send + Sync + 'static>(value: T) -> MutableState<T> {
    MutableState::new(value)
}
