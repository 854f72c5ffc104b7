//! Change observers: who hears about reads and applied write sets.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::collections::map::HashMap;
use crate::{CellId, CellSet};

pub type ReadObserver = Arc<dyn Fn(CellId) + Send + Sync>;
pub type WriteObserver = Arc<dyn Fn(CellId) + Send + Sync>;
pub type ApplyObserver = Arc<dyn Fn(&CellSet) + Send + Sync>;

/// Identifies one subscription of a [`ChangeObserverRegistry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverToken(u64);

struct Registration {
    on_read: Option<ReadObserver>,
    on_changed: Option<ApplyObserver>,
}

pub struct ChangeObserverRegistry {
    next_token: AtomicU64,
    observers: RwLock<HashMap<ObserverToken, Arc<Registration>>>,
}

static GLOBAL_REGISTRY: Lazy<ChangeObserverRegistry> = Lazy::new(ChangeObserverRegistry::new);

thread_local! {
    // Only the top entry is notified. `None` shadows outer scopes.
    static READ_SCOPES: RefCell<Vec<Option<ReadObserver>>> = RefCell::new(Vec::new());
}

impl ChangeObserverRegistry {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            observers: RwLock::new(HashMap::default()),
        }
    }

    /// The registry notified by every root snapshot apply.
    pub fn global() -> &'static ChangeObserverRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn subscribe(
        &self,
        on_read: Option<ReadObserver>,
        on_changed: Option<ApplyObserver>,
    ) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token, Arc::new(Registration { on_read, on_changed }));
        token
    }

    /// Returns false when the token was never subscribed or is already gone.
    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&token)
            .is_some()
    }

    /// Call every change observer once with `cells`, in subscription order.
    ///
    /// The observer list is captured before any callback runs, so callbacks may
    /// subscribe or unsubscribe freely.
    pub fn notify_changed(&self, cells: &CellSet) {
        let mut observers: Vec<(ObserverToken, ApplyObserver)> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(token, registration)| {
                registration
                    .on_changed
                    .clone()
                    .map(|observer| (*token, observer))
            })
            .collect();
        observers.sort_unstable_by_key(|(token, _)| *token);
        for (_, observer) in observers {
            observer(cells);
        }
    }

    /// Run `f` with `token`'s read observer as this thread's read scope.
    ///
    /// An unknown token, or one subscribed without a read observer, still
    /// opens a scope: reads inside it notify nobody.
    pub fn observe_reads<R>(&self, token: ObserverToken, f: impl FnOnce() -> R) -> R {
        let on_read = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&token)
            .and_then(|registration| registration.on_read.clone());
        let _scope = ReadScope::push(on_read);
        f()
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

struct ReadScope;

impl ReadScope {
    fn push(observer: Option<ReadObserver>) -> Self {
        READ_SCOPES.with(|scopes| scopes.borrow_mut().push(observer));
        ReadScope
    }
}

impl Drop for ReadScope {
    fn drop(&mut self) {
        let popped = READ_SCOPES
            .try_with(|scopes| scopes.borrow_mut().pop())
            .ok()
            .flatten();
        drop(popped);
    }
}

/// Report a read to the innermost read scope of this thread, if any.
pub(crate) fn notify_read(cell: CellId) {
    let observer = READ_SCOPES
        .try_with(|scopes| scopes.borrow().last().cloned().flatten())
        .ok()
        .flatten();
    if let Some(observer) = observer {
        observer(cell);
    }
}
