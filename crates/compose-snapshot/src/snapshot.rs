//! Snapshots: isolated views of mutable state and their lifecycle.
//!
//! Global bookkeeping (id allocation, the open set, pins, cells waiting for
//! reclamation) sits behind one mutex. Lock order is global state, then
//! snapshot fields (ancestor before descendant), then cell records.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use once_cell::sync::Lazy;

use crate::collections::map::HashMap;
use crate::observer::{
    ApplyObserver, ChangeObserverRegistry, ObserverToken, ReadObserver, WriteObserver,
};
use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};
use crate::snapshot_pinning::{PinHandle, PinningTable};
use crate::state::{MergeResolution, StateObject, PREEXISTING_SNAPSHOT_ID};
use crate::{CellId, CellSet, SnapshotError};

const FIRST_SNAPSHOT_ID: SnapshotId = PREEXISTING_SNAPSHOT_ID + 1;

struct GlobalState {
    next_snapshot_id: SnapshotId,
    /// Ids of snapshots not yet applied or abandoned.
    open: SnapshotIdSet,
    pinning: PinningTable,
    /// Cells that kept more than one record after their last reclamation.
    extra_state_objects: HashMap<CellId, Weak<dyn StateObject>>,
}

impl GlobalState {
    fn new() -> Self {
        Self {
            next_snapshot_id: FIRST_SNAPSHOT_ID,
            open: SnapshotIdSet::new(),
            pinning: PinningTable::new(),
            extra_state_objects: HashMap::default(),
        }
    }

    fn allocate_id(&mut self) -> SnapshotId {
        let id = self.next_snapshot_id;
        assert!(id < SnapshotId::MAX, "snapshot ids exhausted");
        self.next_snapshot_id += 1;
        self.open = self.open.with(id);
        id
    }

    fn reuse_limit(&self) -> SnapshotId {
        self.pinning
            .lowest_pinned()
            .unwrap_or(self.next_snapshot_id)
            - 1
    }

    fn process_unused_records(&mut self, modified: &[Arc<dyn StateObject>]) {
        let reuse_limit = self.reuse_limit();
        let mut reclaimed = 0;
        self.extra_state_objects.retain(|_, state| match state.upgrade() {
            Some(state) => {
                reclaimed += state.reclaim_records(reuse_limit);
                state.record_count() > 1
            }
            None => false,
        });
        for state in modified {
            reclaimed += state.reclaim_records(reuse_limit);
            if state.record_count() > 1 {
                self.extra_state_objects
                    .insert(state.cell_id(), Arc::downgrade(state));
            }
        }
        if reclaimed > 0 {
            log::trace!("reclaimed {reclaimed} record(s) at or below snapshot {reuse_limit}");
        }
    }
}

static GLOBAL: Lazy<Mutex<GlobalState>> = Lazy::new(|| Mutex::new(GlobalState::new()));

fn sync() -> MutexGuard<'static, GlobalState> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static CURRENT_SNAPSHOT: RefCell<Option<Snapshot>> = RefCell::new(None);
}

/// Run an explicit reclamation pass over every cell still holding several
/// records.
pub fn collect_unused_records() {
    sync().process_unused_records(&[]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Open,
    Applied,
    Disposed,
}

/// The id and invalid set a snapshot reads with.
pub(crate) struct SnapshotView {
    pub(crate) id: SnapshotId,
    pub(crate) invalid: SnapshotIdSet,
}

struct SnapshotFields {
    id: SnapshotId,
    invalid: SnapshotIdSet,
    /// Ids this snapshot held before advancing, plus ids of nested snapshots
    /// applied into it.
    previous_ids: SnapshotIdSet,
    modified: HashMap<CellId, Arc<dyn StateObject>>,
    applied: bool,
    disposed: bool,
    /// This snapshot plus its nested snapshots that are still active.
    active: usize,
    /// Set once a nested snapshot has reported to its parent.
    deactivated: bool,
    pin: PinHandle,
    previous_pins: Vec<PinHandle>,
}

impl SnapshotFields {
    fn new(id: SnapshotId, invalid: SnapshotIdSet, pin: PinHandle) -> Self {
        Self {
            id,
            invalid,
            previous_ids: SnapshotIdSet::new(),
            modified: HashMap::default(),
            applied: false,
            disposed: false,
            active: 1,
            deactivated: false,
            pin,
            previous_pins: Vec::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), SnapshotError> {
        if self.disposed {
            Err(SnapshotError::Disposed { snapshot: self.id })
        } else if self.applied {
            Err(SnapshotError::Applied { snapshot: self.id })
        } else {
            Ok(())
        }
    }

    /// Move to a fresh id so records written from here on are invisible to
    /// snapshots taken before.
    fn advance(&mut self, global: &mut GlobalState) {
        if self.applied || self.disposed {
            return;
        }
        let previous = self.id;
        let id = global.allocate_id();
        self.previous_ids = self.previous_ids.with(previous);
        self.invalid = self.invalid.add_range(previous + 1, id);
        self.id = id;
        log::trace!("snapshot {previous} advanced to {id}");
    }

    fn close(&self, global: &mut GlobalState) {
        global.open = global.open.without(self.id).subtract(&self.previous_ids);
    }

    fn release_pins(&mut self, global: &mut GlobalState) {
        global.pinning.release(self.pin);
        self.pin = PinHandle::INVALID;
        for pin in self.previous_pins.drain(..) {
            global.pinning.release(pin);
        }
    }
}

struct SnapshotInner {
    parent: Option<Snapshot>,
    read_only: bool,
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
    fields: Mutex<SnapshotFields>,
}

/// Merge decisions taken before the global lock, keyed by cell, with the
/// current record id each decision was based on.
type OptimisticMerges = HashMap<CellId, (SnapshotId, MergeResolution)>;

enum PendingRecord {
    Copy(SnapshotId),
    Merged(Box<dyn std::any::Any + Send>),
}

impl SnapshotInner {
    fn fields(&self) -> MutexGuard<'_, SnapshotFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id(&self) -> SnapshotId {
        self.fields().id
    }

    /// The pin stays until [`abandon`](Self::abandon) runs: an unapplied
    /// snapshot's records remain valid while nested snapshots are active.
    fn dispose(&self) {
        let id = {
            let mut fields = self.fields();
            if fields.disposed {
                return;
            }
            fields.disposed = true;
            fields.id
        };
        log::trace!("snapshot {id} disposed");
        self.nested_deactivated();
        self.deactivate();
    }

    /// Report to the parent that this nested snapshot is finished.
    fn deactivate(&self) {
        let Some(parent) = &self.parent else {
            return;
        };
        {
            let mut fields = self.fields();
            if fields.deactivated {
                return;
            }
            fields.deactivated = true;
        }
        parent.inner.nested_deactivated();
    }

    fn nested_deactivated(&self) {
        let abandon = {
            let mut fields = self.fields();
            debug_assert!(fields.active > 0, "snapshot {} deactivated too often", fields.id);
            fields.active = fields.active.saturating_sub(1);
            fields.active == 0 && !fields.applied
        };
        if abandon {
            self.abandon();
        }
    }

    /// Discard every record this snapshot wrote and close it.
    fn abandon(&self) {
        let mut global = sync();
        let mut fields = self.fields();
        let modified = std::mem::take(&mut fields.modified);
        if !modified.is_empty() {
            let ids = fields.previous_ids.with(fields.id);
            for state in modified.values() {
                state.invalidate_records(&ids);
            }
        }
        fields.close(&mut global);
        fields.release_pins(&mut global);
        let modified: Vec<Arc<dyn StateObject>> = modified.into_values().collect();
        global.process_unused_records(&modified);
        log::trace!("snapshot {} abandoned {} cell(s)", fields.id, modified.len());
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        let (id, applied, disposed) = {
            let fields = self.fields();
            (fields.id, fields.applied, fields.disposed)
        };
        if disposed {
            return;
        }
        if !applied {
            log::warn!("snapshot {id} dropped while still open; disposing it");
        }
        self.dispose();
    }
}

/// An isolated view of all mutable state.
///
/// Clones are handles to the same snapshot.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    fn from_parts(
        parent: Option<Snapshot>,
        read_only: bool,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
        fields: SnapshotFields,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                parent,
                read_only,
                read_observer,
                write_observer,
                fields: Mutex::new(fields),
            }),
        }
    }

    /// Open a root mutable snapshot over the latest applied state.
    pub fn take_mutable_snapshot(
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Snapshot {
        Self::take_root(false, read_observer, write_observer)
    }

    /// Open a root read-only snapshot over the latest applied state.
    pub fn take_snapshot(read_observer: Option<ReadObserver>) -> Snapshot {
        Self::take_root(true, read_observer, None)
    }

    /// Open a mutable snapshot, nested when `parent` is given.
    pub fn open(parent: Option<&Snapshot>) -> Result<Snapshot, SnapshotError> {
        match parent {
            Some(parent) => parent.take_nested_mutable_snapshot(None, None),
            None => Ok(Self::take_mutable_snapshot(None, None)),
        }
    }

    fn take_root(
        read_only: bool,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Snapshot {
        let fields = {
            let mut global = sync();
            let invalid = global.open.clone();
            let id = global.allocate_id();
            let pin = global.pinning.track(id, &invalid);
            SnapshotFields::new(id, invalid, pin)
        };
        log::trace!(
            "opened {} snapshot {}",
            if read_only { "read-only" } else { "mutable" },
            fields.id
        );
        Self::from_parts(None, read_only, read_observer, write_observer, fields)
    }

    pub fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        if self.inner.read_only {
            return Err(SnapshotError::ReadOnly { snapshot: self.id() });
        }
        self.take_nested(false, read_observer, write_observer)
    }

    pub fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        self.take_nested(true, read_observer, None)
    }

    fn take_nested(
        &self,
        read_only: bool,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        let child = {
            let mut global = sync();
            let mut fields = self.inner.fields();
            fields.ensure_open()?;
            let id = global.allocate_id();
            let invalid = fields.invalid.add_range(fields.id + 1, id);
            if !read_only {
                fields.invalid = fields.invalid.with(id);
            }
            let pin = global.pinning.track(id, &invalid);
            fields.active += 1;
            if !self.inner.read_only {
                fields.advance(&mut global);
            }
            SnapshotFields::new(id, invalid, pin)
        };
        log::trace!("opened nested snapshot {} under {}", child.id, self.id());

        let read_observer = merge_observers(read_observer, self.inner.read_observer.clone());
        let write_observer = if read_only {
            None
        } else {
            merge_observers(write_observer, self.inner.write_observer.clone())
        };
        Ok(Self::from_parts(
            Some(self.clone()),
            read_only,
            read_observer,
            write_observer,
            child,
        ))
    }

    /// The snapshot entered on this thread, if any.
    pub fn current() -> Option<Snapshot> {
        CURRENT_SNAPSHOT.with(|current| current.borrow().clone())
    }

    /// Run `f` with this snapshot current on this thread.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = CurrentSnapshotGuard::install(self.clone());
        f()
    }

    pub fn id(&self) -> SnapshotId {
        self.inner.id()
    }

    pub fn invalid(&self) -> SnapshotIdSet {
        self.inner.fields().invalid.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn state(&self) -> SnapshotState {
        let fields = self.inner.fields();
        if fields.disposed {
            SnapshotState::Disposed
        } else if fields.applied {
            SnapshotState::Applied
        } else {
            SnapshotState::Open
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.fields().modified.is_empty()
    }

    pub fn modified_cells(&self) -> CellSet {
        self.inner.fields().modified.keys().copied().collect()
    }

    /// Ids not yet applied or abandoned anywhere in the process. A snapshot
    /// that advanced holds every id it had until it closes.
    pub fn open_snapshot_ids() -> SnapshotIdSet {
        sync().open.clone()
    }

    /// Subscribe `observer` to every write set applied globally.
    pub fn register_apply_observer(
        observer: impl Fn(&CellSet) + Send + Sync + 'static,
    ) -> ObserverToken {
        let observer: ApplyObserver = Arc::new(observer);
        ChangeObserverRegistry::global().subscribe(None, Some(observer))
    }

    /// Publish this snapshot's writes.
    ///
    /// A root snapshot publishes to every snapshot taken afterwards and
    /// notifies the global registry. A nested snapshot publishes into its
    /// parent only. On conflict nothing is published and the snapshot stays
    /// open.
    pub fn apply(&self) -> Result<(), SnapshotError> {
        if self.inner.read_only {
            return Err(SnapshotError::ReadOnly { snapshot: self.id() });
        }
        match &self.inner.parent {
            Some(parent) => self.apply_nested(parent),
            None => self.apply_root(),
        }
    }

    fn apply_root(&self) -> Result<(), SnapshotError> {
        let modified = self.pending_states()?;
        let optimistic = if modified.is_empty() {
            None
        } else {
            let (limit, invalid) = {
                let global = sync();
                (global.next_snapshot_id, global.open.clone())
            };
            self.optimistic_merges(&modified, limit, &invalid)
        };

        let (id, changed) = {
            let mut global = sync();
            let mut fields = self.inner.fields();
            fields.ensure_open()?;
            if !fields.modified.is_empty() {
                let limit = global.next_snapshot_id;
                let invalid = global.open.clone();
                apply_locked(&mut global, &mut fields, limit, &invalid, optimistic)?;
            }
            fields.close(&mut global);
            fields.applied = true;
            fields.release_pins(&mut global);
            let changed: CellSet = std::mem::take(&mut fields.modified).into_keys().collect();
            global.process_unused_records(&modified);
            (fields.id, changed)
        };

        log::debug!("snapshot {id} applied {} change(s)", changed.len());
        if !changed.is_empty() {
            ChangeObserverRegistry::global().notify_changed(&changed);
        }
        Ok(())
    }

    fn apply_nested(&self, parent: &Snapshot) -> Result<(), SnapshotError> {
        let modified = self.pending_states()?;
        let optimistic = if modified.is_empty() {
            None
        } else {
            let (limit, invalid) = {
                let parent_fields = parent.inner.fields();
                if parent_fields.ensure_open().is_err() {
                    return Err(SnapshotError::ParentClosed { snapshot: self.id() });
                }
                (parent_fields.id, parent_fields.invalid.clone())
            };
            self.optimistic_merges(&modified, limit, &invalid)
        };

        let id = {
            let mut global = sync();
            let mut parent_fields = parent.inner.fields();
            let mut fields = self.inner.fields();
            fields.ensure_open()?;
            if parent_fields.ensure_open().is_err() {
                return Err(SnapshotError::ParentClosed { snapshot: fields.id });
            }

            if fields.modified.is_empty() {
                fields.close(&mut global);
            } else {
                let limit = parent_fields.id;
                let invalid = parent_fields.invalid.clone();
                apply_locked(&mut global, &mut fields, limit, &invalid, optimistic)?;
                for (cell, state) in fields.modified.drain() {
                    parent_fields.modified.entry(cell).or_insert(state);
                }
            }

            if parent_fields.id < fields.id {
                parent_fields.advance(&mut global);
            }
            parent_fields.invalid = parent_fields
                .invalid
                .without(fields.id)
                .subtract(&fields.previous_ids);
            parent_fields.previous_ids = parent_fields
                .previous_ids
                .with(fields.id)
                .union(&fields.previous_ids);

            let pin = std::mem::replace(&mut fields.pin, PinHandle::INVALID);
            if pin.is_valid() {
                parent_fields.previous_pins.push(pin);
            }
            parent_fields.previous_pins.append(&mut fields.previous_pins);
            fields.applied = true;
            fields.id
        };

        log::debug!("nested snapshot {id} applied into {}", parent.id());
        self.inner.deactivate();
        Ok(())
    }

    /// The write set, after checking the snapshot can still apply.
    fn pending_states(&self) -> Result<Vec<Arc<dyn StateObject>>, SnapshotError> {
        let fields = self.inner.fields();
        fields.ensure_open()?;
        Ok(fields.modified.values().cloned().collect())
    }

    /// Resolve merges before the global lock is taken. Returns None when a
    /// conflict is already certain, leaving the decision to the locked pass.
    fn optimistic_merges(
        &self,
        modified: &[Arc<dyn StateObject>],
        limit: SnapshotId,
        invalid_snapshots: &SnapshotIdSet,
    ) -> Option<OptimisticMerges> {
        let (id, start, invalid) = {
            let fields = self.inner.fields();
            (
                fields.id,
                fields.invalid.with(fields.id).union(&fields.previous_ids),
                fields.invalid.clone(),
            )
        };
        let mut merges: Option<OptimisticMerges> = None;
        for state in modified {
            let Some(current) = state.readable_id(limit, invalid_snapshots) else {
                continue;
            };
            let Some(previous) = state.readable_id(id, &start) else {
                continue;
            };
            if current == previous {
                continue;
            }
            let applied = state.readable_id(id, &invalid)?;
            match state.merge_records(previous, current, applied) {
                MergeResolution::Conflict => return None,
                resolution => {
                    merges
                        .get_or_insert_with(HashMap::default)
                        .insert(state.cell_id(), (current, resolution));
                }
            }
        }
        merges
    }

    pub(crate) fn read_view(&self) -> Result<SnapshotView, SnapshotError> {
        let fields = self.inner.fields();
        if fields.disposed {
            return Err(SnapshotError::Disposed { snapshot: fields.id });
        }
        Ok(SnapshotView {
            id: fields.id,
            invalid: fields.invalid.clone(),
        })
    }

    pub(crate) fn write_view(&self) -> Result<SnapshotView, SnapshotError> {
        let fields = self.inner.fields();
        fields.ensure_open()?;
        if self.inner.read_only {
            return Err(SnapshotError::ReadOnly { snapshot: fields.id });
        }
        Ok(SnapshotView {
            id: fields.id,
            invalid: fields.invalid.clone(),
        })
    }

    pub(crate) fn notify_read(&self, cell: CellId) {
        if let Some(observer) = &self.inner.read_observer {
            observer(cell);
        }
    }

    pub(crate) fn notify_write(&self, cell: CellId) {
        if let Some(observer) = &self.inner.write_observer {
            observer(cell);
        }
    }

    pub(crate) fn record_modified(&self, state: Arc<dyn StateObject>) {
        let cell = state.cell_id();
        self.inner.fields().modified.entry(cell).or_insert(state);
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.inner.fields();
        f.debug_struct("Snapshot")
            .field("id", &fields.id)
            .field("invalid", &fields.invalid)
            .field("read_only", &self.inner.read_only)
            .field("nested", &self.inner.parent.is_some())
            .field("modified", &fields.modified.len())
            .finish()
    }
}

/// Check every cell in the write set against the value committed in the
/// target (`limit`, `invalid_snapshots`) and stage the records apply adds.
fn apply_locked(
    global: &mut GlobalState,
    fields: &mut SnapshotFields,
    limit: SnapshotId,
    invalid_snapshots: &SnapshotIdSet,
    mut optimistic: Option<OptimisticMerges>,
) -> Result<(), SnapshotError> {
    let start = fields.invalid.with(fields.id).union(&fields.previous_ids);
    let mut pending: Vec<(Arc<dyn StateObject>, PendingRecord)> = Vec::new();
    let mut reverted: Vec<CellId> = Vec::new();

    for (&cell, state) in fields.modified.iter() {
        let Some(current) = state.readable_id(limit, invalid_snapshots) else {
            continue;
        };
        let Some(previous) = state.readable_id(fields.id, &start) else {
            continue;
        };
        if current == previous {
            continue;
        }
        let applied = state
            .readable_id(fields.id, &fields.invalid)
            .ok_or(SnapshotError::InvalidCellAccess {
                cell,
                snapshot: fields.id,
            })?;
        let resolution = match optimistic.as_mut().and_then(|merges| merges.remove(&cell)) {
            Some((seen_current, resolution)) if seen_current == current => resolution,
            _ => state.merge_records(previous, current, applied),
        };
        match resolution {
            MergeResolution::Conflict => {
                log::debug!("snapshot {} conflicts on {cell}", fields.id);
                return Err(SnapshotError::Conflict {
                    snapshot: fields.id,
                    cell,
                });
            }
            MergeResolution::KeepCurrent => {
                pending.push((Arc::clone(state), PendingRecord::Copy(current)));
                reverted.push(cell);
            }
            MergeResolution::Merged(value) => {
                pending.push((Arc::clone(state), PendingRecord::Merged(value)));
            }
        }
    }

    if !pending.is_empty() {
        fields.advance(global);
        let id = fields.id;
        for (state, record) in pending {
            match record {
                PendingRecord::Copy(source) => state.prepend_copy(source, id),
                PendingRecord::Merged(value) => state.prepend_merged(value, id),
            }
        }
    }
    for cell in reverted {
        fields.modified.remove(&cell);
    }
    Ok(())
}

fn merge_observers(
    first: Option<Arc<dyn Fn(CellId) + Send + Sync>>,
    second: Option<Arc<dyn Fn(CellId) + Send + Sync>>,
) -> Option<Arc<dyn Fn(CellId) + Send + Sync>> {
    match (first, second) {
        (Some(first), Some(second)) => Some(Arc::new(move |cell: CellId| {
            first(cell);
            second(cell);
        })),
        (first, second) => first.or(second),
    }
}

struct CurrentSnapshotGuard {
    previous: Option<Snapshot>,
}

impl CurrentSnapshotGuard {
    fn install(snapshot: Snapshot) -> Self {
        let previous = CURRENT_SNAPSHOT.with(|current| current.replace(Some(snapshot)));
        Self { previous }
    }
}

impl Drop for CurrentSnapshotGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let entered = CURRENT_SNAPSHOT
            .try_with(|current| current.replace(previous))
            .ok()
            .flatten();
        drop(entered);
    }
}

#[cfg(test)]
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that depend on the process-wide snapshot state.
#[cfg(test)]
pub(crate) fn test_guard() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) fn lowest_pinned() -> Option<SnapshotId> {
    sync().pinning.lowest_pinned()
}

#[cfg(test)]
pub(crate) fn pin_count() -> usize {
    sync().pinning.pin_count()
}
