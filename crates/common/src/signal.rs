//! Completion signals and the dispatcher wait-set
//!
//! [`Event`] is a manual-clear signal: once signaled it stays signaled until
//! someone clears it, and any number of threads may wait on it. Transports
//! hand one out per endpoint, the engine hands four out per slot to clients.
//!
//! [`WaitSet`] lets a single thread block on many events at once. Entries are
//! scanned in the order they were linked, so when several events are already
//! signaled the earliest-linked one wins. The dispatcher relies on this to
//! service reads before writes before control transfers.
//!
//! # Example
//!
//! ```
//! use common::signal::{Event, WaitSet};
//!
//! let read = Event::new();
//! let write = Event::new();
//! let mut set = WaitSet::new();
//! set.link(&read, "read");
//! set.link(&write, "write");
//!
//! write.signal();
//! read.signal();
//! assert_eq!(set.wait_any(), "read");
//! read.clear();
//! assert_eq!(set.wait_any(), "write");
//! ```

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a holder panicked
///
/// Signal state stays consistent across a panic (every critical section is a
/// plain field update), so a poisoned lock is safe to reuse.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manual-clear completion signal
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Default)]
struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Default)]
struct EventState {
    signaled: bool,
    watchers: Vec<Arc<Hub>>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter
    pub fn signal(&self) {
        let watchers = {
            let mut state = lock(&self.inner.state);
            state.signaled = true;
            self.inner.cond.notify_all();
            state.watchers.clone()
        };
        for hub in watchers {
            hub.wake();
        }
    }

    /// Reset the signal
    pub fn clear(&self) {
        lock(&self.inner.state).signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        lock(&self.inner.state).signaled
    }

    /// Block until signaled. Does not clear.
    pub fn wait(&self) {
        let mut state = lock(&self.inner.state);
        while !state.signaled {
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until signaled or `timeout` elapses
    ///
    /// Returns whether the event is signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while !state.signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Whether both handles refer to the same signal
    pub fn same_as(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn attach(&self, hub: &Arc<Hub>) {
        lock(&self.inner.state).watchers.push(Arc::clone(hub));
    }

    fn detach(&self, hub: &Arc<Hub>) {
        lock(&self.inner.state)
            .watchers
            .retain(|w| !Arc::ptr_eq(w, hub));
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Wake-up point shared by a wait-set and the events linked into it
#[derive(Default)]
struct Hub {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Hub {
    fn wake(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

/// Ordered set of events a single thread can block on
pub struct WaitSet<T> {
    hub: Arc<Hub>,
    entries: Vec<(Event, T)>,
}

impl<T: Copy> WaitSet<T> {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::default()),
            entries: Vec::new(),
        }
    }

    /// Append an event with its tag
    ///
    /// An event may be linked at most once; relinking requires
    /// [`WaitSet::unlink_all`] first.
    pub fn link(&mut self, event: &Event, tag: T) {
        debug_assert!(
            !self.entries.iter().any(|(e, _)| e.same_as(event)),
            "event linked twice into one wait-set"
        );
        event.attach(&self.hub);
        self.entries.push((event.clone(), tag));
    }

    /// Remove every entry
    pub fn unlink_all(&mut self) {
        for (event, _) in self.entries.drain(..) {
            event.detach(&self.hub);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tags in link order
    pub fn tags(&self) -> Vec<T> {
        self.entries.iter().map(|(_, tag)| *tag).collect()
    }

    /// Block until a linked event is signaled and return its tag
    ///
    /// The earliest-linked signaled entry is returned. The event is left
    /// signaled; the caller clears it once the completion is consumed.
    pub fn wait_any(&self) -> T {
        let mut generation = lock(&self.hub.generation);
        loop {
            if let Some(tag) = self.first_signaled() {
                return tag;
            }
            generation = self
                .hub
                .cond
                .wait(generation)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`WaitSet::wait_any`] but gives up after `timeout`
    pub fn wait_any_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut generation = lock(&self.hub.generation);
        loop {
            if let Some(tag) = self.first_signaled() {
                return Some(tag);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            generation = self
                .hub
                .cond
                .wait_timeout(generation, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn first_signaled(&self) -> Option<T> {
        self.entries
            .iter()
            .find(|(event, _)| event.is_signaled())
            .map(|(_, tag)| *tag)
    }
}

impl<T: Copy> Default for WaitSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for WaitSet<T> {
    fn drop(&mut self) {
        for (event, _) in self.entries.drain(..) {
            event.detach(&self.hub);
        }
    }
}
