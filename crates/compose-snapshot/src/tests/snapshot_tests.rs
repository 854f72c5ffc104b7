use super::*;
use crate::snapshot::{lowest_pinned, pin_count};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

fn record_applies() -> (ObserverToken, Arc<Mutex<Vec<CellSet>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let token = Snapshot::register_apply_observer(move |cells: &CellSet| {
        sink.lock().unwrap().push(cells.clone());
    });
    (token, seen)
}

fn latest<T: Clone + Send + Sync + 'static>(cell: &MutableState<T>) -> T {
    let snapshot = Snapshot::take_snapshot(None);
    let value = cell.get_in(&snapshot).unwrap();
    snapshot.dispose();
    value
}

struct Additive;

impl MutationPolicy<i64> for Additive {
    fn equivalent(&self, a: &i64, b: &i64) -> bool {
        a == b
    }

    fn merge(&self, previous: &i64, current: &i64, applied: &i64) -> Option<i64> {
        Some(current + applied - previous)
    }
}

#[test]
fn access_without_snapshot_fails() {
    let _guard = test_guard();
    let cell = MutableState::new(1);

    assert_eq!(cell.get(), Err(SnapshotError::NoSnapshot));
    assert_eq!(cell.set(2), Err(SnapshotError::NoSnapshot));
    assert_eq!(latest(&cell), 1);
}

#[test]
fn snapshot_ids_increase_from_two() {
    let _guard = test_guard();
    let first = Snapshot::take_snapshot(None);
    let second = Snapshot::take_mutable_snapshot(None, None);

    assert!(first.id() >= 2);
    assert!(second.id() > first.id());
    assert!(second.invalid().contains(first.id()));
    assert!(Snapshot::open_snapshot_ids().contains(second.id()));

    first.dispose();
    second.dispose();
    assert!(!Snapshot::open_snapshot_ids().contains(first.id()));
    assert!(!Snapshot::open_snapshot_ids().contains(second.id()));
}

#[test]
fn writes_are_isolated_until_apply() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let writer = Snapshot::take_mutable_snapshot(None, None);
    let reader = Snapshot::take_mutable_snapshot(None, None);

    cell.set_in(&writer, 5).unwrap();
    assert_eq!(cell.get_in(&writer), Ok(5));
    assert_eq!(cell.get_in(&reader), Ok(0));

    writer.apply().unwrap();
    assert_eq!(writer.state(), SnapshotState::Applied);
    assert_eq!(cell.get_in(&reader), Ok(0));
    assert_eq!(latest(&cell), 5);

    writer.dispose();
    reader.dispose();
    assert_eq!(writer.state(), SnapshotState::Disposed);
}

#[test]
fn writes_inside_entered_snapshot_use_it() {
    let _guard = test_guard();
    let cell = MutableState::new(String::from("a"));
    let snapshot = Snapshot::take_mutable_snapshot(None, None);

    snapshot.enter(|| {
        cell.set(String::from("b")).unwrap();
        assert_eq!(cell.get().unwrap(), "b");
    });
    assert!(Snapshot::current().is_none());
    assert_eq!(latest(&cell), "a");

    snapshot.apply().unwrap();
    snapshot.dispose();
    assert_eq!(latest(&cell), "b");
}

#[test]
fn concurrent_different_writes_conflict() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let first = Snapshot::take_mutable_snapshot(None, None);
    let second = Snapshot::take_mutable_snapshot(None, None);

    cell.set_in(&first, 1).unwrap();
    cell.set_in(&second, 2).unwrap();
    first.apply().unwrap();

    let result = second.apply();
    assert_eq!(
        result,
        Err(SnapshotError::Conflict {
            snapshot: second.id(),
            cell: cell.id(),
        })
    );
    assert_eq!(second.state(), SnapshotState::Open);
    assert_eq!(cell.get_in(&second), Ok(2));

    first.dispose();
    second.dispose();
    assert_eq!(latest(&cell), 1);
}

#[test]
fn apply_notifies_once_with_whole_write_set() {
    let _guard = test_guard();
    let (token, seen) = record_applies();
    let a = MutableState::new(0);
    let b = MutableState::new(0);

    with_mutable_snapshot(|| {
        a.set(1).unwrap();
        b.set(2).unwrap();
        a.set(3).unwrap();
    })
    .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(ChangeObserverRegistry::global().unsubscribe(token));
    assert_eq!(seen.len(), 1);
    let expected: CellSet = [a.id(), b.id()].into_iter().collect();
    assert_eq!(seen[0], expected);
}

#[test]
fn empty_apply_does_not_notify() {
    let _guard = test_guard();
    let (token, seen) = record_applies();

    with_mutable_snapshot(|| ()).unwrap();

    assert!(ChangeObserverRegistry::global().unsubscribe(token));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn equal_concurrent_write_is_left_out_of_notification() {
    let _guard = test_guard();
    let a = MutableState::new(0);
    let b = MutableState::new(0);
    let first = Snapshot::take_mutable_snapshot(None, None);
    let second = Snapshot::take_mutable_snapshot(None, None);

    a.set_in(&first, 1).unwrap();
    a.set_in(&second, 1).unwrap();
    b.set_in(&second, 7).unwrap();
    first.apply().unwrap();

    let (token, seen) = record_applies();
    second.apply().unwrap();
    let seen = seen.lock().unwrap().clone();
    assert!(ChangeObserverRegistry::global().unsubscribe(token));

    let expected: CellSet = [b.id()].into_iter().collect();
    assert_eq!(seen, vec![expected]);
    first.dispose();
    second.dispose();
    assert_eq!(latest(&a), 1);
    assert_eq!(latest(&b), 7);
}

#[test]
fn equivalent_write_is_skipped() {
    let _guard = test_guard();
    let writes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&writes);
    let write_observer: WriteObserver =
        Arc::new(move |cell: CellId| sink.lock().unwrap().push(cell));
    let cell = MutableState::new(3);
    let snapshot = Snapshot::take_mutable_snapshot(None, Some(write_observer));

    cell.set_in(&snapshot, 3).unwrap();
    assert!(!snapshot.has_pending_changes());
    assert!(writes.lock().unwrap().is_empty());

    cell.set_in(&snapshot, 4).unwrap();
    assert!(snapshot.has_pending_changes());
    assert!(snapshot.modified_cells().contains(&cell.id()));
    assert_eq!(*writes.lock().unwrap(), vec![cell.id()]);
    snapshot.dispose();
}

#[test]
fn never_equal_policy_records_every_write() {
    let _guard = test_guard();
    let cell = MutableState::with_policy(3, Arc::new(NeverEqual));
    let snapshot = Snapshot::take_mutable_snapshot(None, None);

    cell.set_in(&snapshot, 3).unwrap();
    assert!(snapshot.has_pending_changes());
    snapshot.dispose();
}

#[test]
fn update_mutates_a_copy_of_the_visible_value() {
    let _guard = test_guard();
    let cell = MutableState::new(vec![1, 2]);
    let snapshot = Snapshot::take_mutable_snapshot(None, None);
    let other = Snapshot::take_snapshot(None);

    let len = cell
        .update_in(&snapshot, |values| {
            values.push(3);
            values.len()
        })
        .unwrap();
    assert_eq!(len, 3);
    assert_eq!(cell.get_in(&snapshot), Ok(vec![1, 2, 3]));
    assert_eq!(cell.get_in(&other), Ok(vec![1, 2]));

    snapshot.enter(|| cell.update(|values| values.push(4))).unwrap();
    assert_eq!(cell.get_in(&snapshot), Ok(vec![1, 2, 3, 4]));
    snapshot.dispose();
    other.dispose();
}

#[test]
fn reads_reach_snapshot_observer_and_read_scope() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let snapshot_reads = Arc::new(Mutex::new(0));
    let scope_reads = Arc::new(Mutex::new(0));
    let observer: ReadObserver = {
        let reads = Arc::clone(&snapshot_reads);
        Arc::new(move |_: CellId| *reads.lock().unwrap() += 1)
    };
    let scope: ReadObserver = {
        let reads = Arc::clone(&scope_reads);
        Arc::new(move |_: CellId| *reads.lock().unwrap() += 1)
    };
    let registry = ChangeObserverRegistry::global();
    let token = registry.subscribe(Some(scope), None);
    let snapshot = Snapshot::take_snapshot(Some(observer));

    cell.get_in(&snapshot).unwrap();
    registry.observe_reads(token, || snapshot.enter(|| cell.get().unwrap()));

    assert!(registry.unsubscribe(token));
    assert_eq!(*snapshot_reads.lock().unwrap(), 2);
    assert_eq!(*scope_reads.lock().unwrap(), 1);
    snapshot.dispose();
}

#[test]
fn merge_policy_resolves_concurrent_writes() {
    let _guard = test_guard();
    let counter = MutableState::with_policy(10i64, Arc::new(Additive));
    let first = Snapshot::take_mutable_snapshot(None, None);
    let second = Snapshot::take_mutable_snapshot(None, None);

    counter.update_in(&first, |value| *value += 5).unwrap();
    counter.update_in(&second, |value| *value += 3).unwrap();
    first.apply().unwrap();
    second.apply().unwrap();

    assert_eq!(latest(&counter), 18);
    first.dispose();
    second.dispose();
}

#[test]
fn last_writer_wins_policy_takes_applied_value() {
    let _guard = test_guard();
    let cell = MutableState::with_policy("start", Arc::new(LastWriterWins));
    let first = Snapshot::take_mutable_snapshot(None, None);
    let second = Snapshot::take_mutable_snapshot(None, None);

    cell.set_in(&second, "second").unwrap();
    cell.set_in(&first, "first").unwrap();
    second.apply().unwrap();
    first.apply().unwrap();

    assert_eq!(latest(&cell), "first");
    first.dispose();
    second.dispose();
}

#[test]
fn nested_writes_reach_parent_then_global() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();

    cell.set_in(&child, 1).unwrap();
    assert_eq!(cell.get_in(&child), Ok(1));
    assert_eq!(cell.get_in(&parent), Ok(0));

    child.apply().unwrap();
    assert_eq!(cell.get_in(&parent), Ok(1));
    assert!(parent.modified_cells().contains(&cell.id()));
    assert_eq!(latest(&cell), 0);

    parent.apply().unwrap();
    assert_eq!(latest(&cell), 1);
    child.dispose();
    parent.dispose();
}

#[test]
fn nested_apply_does_not_notify() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    let (token, seen) = record_applies();

    cell.set_in(&child, 1).unwrap();
    child.apply().unwrap();
    assert!(seen.lock().unwrap().is_empty());

    parent.apply().unwrap();
    assert!(ChangeObserverRegistry::global().unsubscribe(token));
    assert_eq!(seen.lock().unwrap().len(), 1);
    child.dispose();
    parent.dispose();
}

#[test]
fn parent_writes_after_nesting_stay_hidden_from_child() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let parent_id = parent.id();
    let child = parent.take_nested_snapshot(None).unwrap();

    assert!(parent.id() > parent_id);
    cell.set_in(&parent, 9).unwrap();
    assert_eq!(cell.get_in(&parent), Ok(9));
    assert_eq!(cell.get_in(&child), Ok(0));
    assert!(child.is_read_only());

    child.dispose();
    parent.dispose();
}

#[test]
fn sibling_nested_snapshots_conflict() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let first = parent.take_nested_mutable_snapshot(None, None).unwrap();
    let second = parent.take_nested_mutable_snapshot(None, None).unwrap();

    cell.set_in(&first, 1).unwrap();
    cell.set_in(&second, 2).unwrap();
    first.apply().unwrap();
    assert!(matches!(
        second.apply(),
        Err(SnapshotError::Conflict { cell: id, .. }) if id == cell.id()
    ));
    assert_eq!(cell.get_in(&parent), Ok(1));

    first.dispose();
    second.dispose();
    parent.dispose();
}

#[test]
fn nested_apply_after_parent_closed_fails() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();

    cell.set_in(&child, 1).unwrap();
    parent.apply().unwrap();
    assert_eq!(
        child.apply(),
        Err(SnapshotError::ParentClosed {
            snapshot: child.id()
        })
    );
    assert!(parent.take_nested_mutable_snapshot(None, None).is_err());

    child.dispose();
    parent.dispose();
    assert_eq!(latest(&cell), 0);
}

#[test]
fn dispose_abandons_writes() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let snapshot = Snapshot::take_mutable_snapshot(None, None);
    cell.set_in(&snapshot, 9).unwrap();
    let id = snapshot.id();

    snapshot.dispose();
    snapshot.dispose();

    assert_eq!(snapshot.state(), SnapshotState::Disposed);
    assert!(!Snapshot::open_snapshot_ids().contains(id));
    assert_eq!(cell.get_in(&snapshot), Err(SnapshotError::Disposed { snapshot: id }));
    assert_eq!(snapshot.apply(), Err(SnapshotError::Disposed { snapshot: id }));
    assert_eq!(cell.set_in(&snapshot, 1), Err(SnapshotError::Disposed { snapshot: id }));
    assert_eq!(latest(&cell), 0);
    assert_eq!(cell.record_count(), 1);
}

#[test]
fn applied_snapshot_rejects_further_writes() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let snapshot = Snapshot::take_mutable_snapshot(None, None);
    snapshot.apply().unwrap();
    let id = snapshot.id();

    assert_eq!(cell.set_in(&snapshot, 1), Err(SnapshotError::Applied { snapshot: id }));
    assert_eq!(snapshot.apply(), Err(SnapshotError::Applied { snapshot: id }));
    snapshot.dispose();
}

#[test]
fn dropping_open_snapshot_disposes_it() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let id = {
        let snapshot = Snapshot::take_mutable_snapshot(None, None);
        cell.set_in(&snapshot, 4).unwrap();
        snapshot.id()
    };

    assert!(!Snapshot::open_snapshot_ids().contains(id));
    assert_eq!(latest(&cell), 0);
}

#[test]
fn parent_abandon_waits_for_nested_snapshots() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    cell.set_in(&parent, 1).unwrap();
    let parent_id = parent.id();

    parent.dispose();
    assert!(Snapshot::open_snapshot_ids().contains(parent_id));

    cell.set_in(&child, 2).unwrap();
    assert_eq!(
        child.apply(),
        Err(SnapshotError::ParentClosed {
            snapshot: child.id()
        })
    );
    child.dispose();

    assert!(!Snapshot::open_snapshot_ids().contains(parent_id));
    assert_eq!(latest(&cell), 0);
    assert_eq!(cell.record_count(), 1);
}

#[test]
fn disposed_parent_keeps_records_readable_until_abandoned() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent = Snapshot::take_mutable_snapshot(None, None);
    cell.set_in(&parent, 1).unwrap();
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    parent.dispose();

    let other = Snapshot::take_mutable_snapshot(None, None);
    cell.set_in(&other, 5).unwrap();
    other.dispose();
    assert_eq!(latest(&cell), 0);
    assert_eq!(cell.get_in(&child), Ok(1));

    child.dispose();
    assert_eq!(latest(&cell), 0);
    assert_eq!(cell.record_count(), 1);
    assert_eq!(lowest_pinned(), None);
}

#[test]
fn open_takes_root_or_nested_snapshot() {
    let _guard = test_guard();
    let cell = mutable_state_of(0);
    let root = Snapshot::open(None).unwrap();
    let nested = Snapshot::open(Some(&root)).unwrap();
    assert!(!root.is_read_only());
    assert!(nested.id() > root.id());

    cell.set_in(&nested, 3).unwrap();
    assert_eq!(cell.get_in(&root), Ok(0));
    nested.apply().unwrap();
    assert_eq!(cell.get_in(&root), Ok(3));
    assert_eq!(latest(&cell), 0);

    root.apply().unwrap();
    nested.dispose();
    root.dispose();
    assert_eq!(latest(&cell), 3);
    assert!(Snapshot::open(Some(&root)).is_err());
}

#[test]
fn snapshots_opened_from_same_parent_conflict() {
    let _guard = test_guard();
    let cell = mutable_state_of(String::from("base"));
    let parent = Snapshot::open(None).unwrap();
    let first = Snapshot::open(Some(&parent)).unwrap();
    let second = Snapshot::open(Some(&parent)).unwrap();

    cell.set_in(&first, String::from("first")).unwrap();
    cell.set_in(&second, String::from("second")).unwrap();
    first.apply().unwrap();
    assert_eq!(
        second.apply(),
        Err(SnapshotError::Conflict {
            snapshot: second.id(),
            cell: cell.id(),
        })
    );
    assert_eq!(cell.get_in(&parent).unwrap(), "first");

    first.dispose();
    second.dispose();
    parent.dispose();
    assert_eq!(latest(&cell), "base");
}

#[test]
fn read_only_snapshot_rejects_writes() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let snapshot = Snapshot::take_snapshot(None);
    let id = snapshot.id();

    assert!(snapshot.is_read_only());
    assert_eq!(cell.set_in(&snapshot, 1), Err(SnapshotError::ReadOnly { snapshot: id }));
    assert_eq!(snapshot.apply(), Err(SnapshotError::ReadOnly { snapshot: id }));
    assert!(snapshot.take_nested_mutable_snapshot(None, None).is_err());

    let nested = snapshot.take_nested_snapshot(None).unwrap();
    assert_eq!(cell.get_in(&nested), Ok(0));
    assert!(cell.set_in(&nested, 1).is_err());

    nested.dispose();
    snapshot.dispose();
    assert!(!Snapshot::open_snapshot_ids().contains(id));
}

#[test]
fn enter_restores_previous_snapshot_after_panic() {
    let _guard = test_guard();
    let outer = Snapshot::take_snapshot(None);
    let inner = Snapshot::take_snapshot(None);

    outer.enter(|| {
        let result = catch_unwind(AssertUnwindSafe(|| {
            inner.enter(|| panic!("body failed"));
        }));
        assert!(result.is_err());
        assert_eq!(Snapshot::current().map(|s| s.id()), Some(outer.id()));
    });
    assert!(Snapshot::current().is_none());

    inner.dispose();
    outer.dispose();
}

#[test]
fn with_mutable_snapshot_nests_under_current() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let value = with_mutable_snapshot(|| {
        cell.set(1).unwrap();
        cell.get().unwrap()
    })
    .unwrap();
    assert_eq!(value, 1);
    assert_eq!(latest(&cell), 1);

    let outer = Snapshot::take_mutable_snapshot(None, None);
    outer
        .enter(|| with_mutable_snapshot(|| cell.set(2).unwrap()))
        .unwrap();
    assert_eq!(cell.get_in(&outer), Ok(2));
    assert_eq!(latest(&cell), 1);

    outer.apply().unwrap();
    outer.dispose();
    assert_eq!(latest(&cell), 2);
}

#[test]
fn with_mutable_snapshot_reports_conflict() {
    let _guard = test_guard();
    let cell = MutableState::new(0);

    let result = with_mutable_snapshot(|| {
        cell.set(1).unwrap();
        let other = Snapshot::take_mutable_snapshot(None, None);
        cell.set_in(&other, 2).unwrap();
        other.apply().unwrap();
        other.dispose();
    });

    assert!(matches!(
        result,
        Err(SnapshotError::Conflict { cell: id, .. }) if id == cell.id()
    ));
    assert_eq!(latest(&cell), 2);
}

#[test]
fn records_are_reclaimed_once_unobservable() {
    let _guard = test_guard();
    let cell = MutableState::new(0);

    with_mutable_snapshot(|| cell.set(1).unwrap()).unwrap();
    assert_eq!(cell.record_count(), 1);

    let reader = Snapshot::take_snapshot(None);
    with_mutable_snapshot(|| cell.set(2).unwrap()).unwrap();
    with_mutable_snapshot(|| cell.set(3).unwrap()).unwrap();
    collect_unused_records();

    assert_eq!(cell.get_in(&reader), Ok(1));
    assert!(cell.record_count() > 1);

    reader.dispose();
    collect_unused_records();
    assert_eq!(cell.record_count(), 1);
    assert_eq!(latest(&cell), 3);
    assert_eq!(lowest_pinned(), None);
}

#[test]
fn nested_pins_move_to_parent_on_apply() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let before = pin_count();
    let parent = Snapshot::take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    assert_eq!(pin_count(), before + 2);

    cell.set_in(&child, 1).unwrap();
    child.apply().unwrap();
    child.dispose();
    assert_eq!(pin_count(), before + 2);

    parent.apply().unwrap();
    assert_eq!(pin_count(), before);
    parent.dispose();
}

#[test]
fn merged_observers_both_hear_nested_writes() {
    let _guard = test_guard();
    let cell = MutableState::new(0);
    let parent_writes = Arc::new(Mutex::new(0));
    let child_writes = Arc::new(Mutex::new(0));
    let parent_observer: WriteObserver = {
        let writes = Arc::clone(&parent_writes);
        Arc::new(move |_: CellId| *writes.lock().unwrap() += 1)
    };
    let child_observer: WriteObserver = {
        let writes = Arc::clone(&child_writes);
        Arc::new(move |_: CellId| *writes.lock().unwrap() += 1)
    };
    let parent = Snapshot::take_mutable_snapshot(None, Some(parent_observer));
    let child = parent
        .take_nested_mutable_snapshot(None, Some(child_observer))
        .unwrap();

    cell.set_in(&child, 1).unwrap();
    assert_eq!(*parent_writes.lock().unwrap(), 1);
    assert_eq!(*child_writes.lock().unwrap(), 1);

    child.dispose();
    parent.dispose();
}

#[test]
fn error_messages_name_snapshot_and_cell() {
    let cell = MutableState::new(0);
    let later = mutable_state_of(0);
    assert!(later.id().as_u64() > cell.id().as_u64());
    assert_eq!(cell.id().to_string(), format!("cell#{}", cell.id().as_u64()));
    let conflict = SnapshotError::Conflict {
        snapshot: 7,
        cell: cell.id(),
    };
    assert_eq!(conflict.to_string(), format!("snapshot 7 conflicts on {}", cell.id()));
    assert_eq!(
        SnapshotError::NoSnapshot.to_string(),
        "no snapshot is current on this thread"
    );
}
