//! Observable values with reference-counted listeners
//!
//! An [`Observable`] holds a current value and a set of listeners. Each
//! registration bumps a reference count; when the last registration is
//! cancelled the optional idle callback runs, at most once. Indexes use the
//! callback to evict entries from their read cache.
//!
//! Listeners are always invoked without the observable's lock held, so a
//! listener may read the observable or cancel registrations.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::error::LogError;

/// Callback invoked with every new value
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

type IdleCallback = Box<dyn FnOnce() + Send>;

/// Per-observable bookkeeping: value, live listeners and their count
struct ObservableState<T> {
    value: T,
    /// Version of `value` as stamped by [`Observable::set_newer`]
    version: u64,
    refcount: usize,
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
    on_idle: Option<IdleCallback>,
}

/// A shared, mutable value with change listeners
pub struct Observable<T> {
    state: Arc<Mutex<ObservableState<T>>>,
    /// Held across a versioned store and its notifications
    order: Arc<ReentrantMutex<()>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            order: Arc::clone(&self.order),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + 'static,
{
    /// Create an observable without an idle callback
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    /// Create an observable whose `on_idle` fires when the last listener leaves
    pub fn with_cleanup(value: T, on_idle: impl FnOnce() + Send + 'static) -> Self {
        Self::build(value, Some(Box::new(on_idle)))
    }

    fn build(value: T, on_idle: Option<IdleCallback>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ObservableState {
                value,
                version: 0,
                refcount: 0,
                next_id: 0,
                listeners: BTreeMap::new(),
                on_idle,
            })),
            order: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Mark the initial value as already being at `version`
    pub fn starting_at(self, version: u64) -> Self {
        self.state.lock().version = version;
        self
    }

    /// Version of the current value
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Snapshot of the current value
    pub fn value(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Replace the value and notify every listener
    pub fn set(&self, value: T) {
        let listeners: Vec<Listener<T>> = {
            let mut state = self.state.lock();
            state.value = value.clone();
            state.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(&value);
        }
    }

    /// Replace the value only if `version` is newer than the current one
    ///
    /// Concurrent writers may arrive in any order; the highest version wins
    /// and listeners see accepted values in version order. A stale value is
    /// dropped without notifying anyone. Returns whether it was stored.
    pub fn set_newer(&self, version: u64, value: T) -> bool {
        let _order = self.order.lock();
        let listeners: Vec<Listener<T>> = {
            let mut state = self.state.lock();
            if version <= state.version {
                return false;
            }
            state.version = version;
            state.value = value.clone();
            state.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Register a listener; it is called immediately with the current value
    pub fn register(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Registration {
        let listener: Listener<T> = Arc::new(listener);
        let (id, current) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.refcount += 1;
            state.listeners.insert(id, Arc::clone(&listener));
            (id, state.value.clone())
        };
        listener(&current);

        let state = Arc::clone(&self.state);
        Registration {
            cancel: Some(Box::new(move || cancel_listener(&state, id))),
        }
    }

    /// Number of active registrations
    pub fn listener_count(&self) -> usize {
        self.state.lock().refcount
    }

    /// Read-only wrapper sharing the same state
    pub fn read_only(&self) -> ReadOnlyObservable<T> {
        ReadOnlyObservable(self.clone())
    }

    /// True if both handles share the same state
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

fn cancel_listener<T>(state: &Mutex<ObservableState<T>>, id: u64) {
    let on_idle = {
        let mut state = state.lock();
        if state.listeners.remove(&id).is_none() {
            return;
        }
        state.refcount -= 1;
        if state.refcount == 0 {
            state.on_idle.take()
        } else {
            None
        }
    };
    if let Some(on_idle) = on_idle {
        on_idle();
    }
}

impl<T: fmt::Debug> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Observable")
            .field("value", &state.value)
            .field("refcount", &state.refcount)
            .finish()
    }
}

/// Handle for one listener registration; cancels on drop
#[must_use = "dropping a registration cancels it"]
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    /// Remove the listener now
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Observable handed out to readers; writes must go through the owner
pub struct ReadOnlyObservable<T>(Observable<T>);

impl<T> Clone for ReadOnlyObservable<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> ReadOnlyObservable<T>
where
    T: Clone + Send + 'static,
{
    pub fn value(&self) -> T {
        self.0.value()
    }

    pub fn register(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Registration {
        self.0.register(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.0.listener_count()
    }

    /// Always fails: the value belongs to the owning index
    pub fn set(&self, _value: T) -> Result<(), LogError> {
        Err(LogError::ReadOnly("observable"))
    }

    /// True if this view wraps the given observable
    pub fn is_view_of(&self, other: &Observable<T>) -> bool {
        self.0.ptr_eq(other)
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadOnlyObservable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadOnlyObservable").field(&self.0).finish()
    }
}
