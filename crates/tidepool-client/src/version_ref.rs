//! Reference-counted hot-swap of the version serving reads
//!
//! A [`VersionRef`] holds one current payload per generation. Borrowing pins
//! the current generation until the returned [`VersionHandle`] is dropped;
//! swapping installs a new generation and retires the old one. A retired
//! generation is torn down exactly once, by whichever of `swap` or the last
//! handle release sees its borrower count reach zero.
//!
//! Borrowing and swapping take the same short mutex, so a borrow can never
//! attach to a generation that is being retired without being counted. The
//! teardown callback always runs after that mutex is released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tidepool_common::{Error, Result};
use tracing::debug;

/// Callback releasing the resources of a retired payload
pub type Teardown<T> = Box<dyn Fn(Arc<T>) + Send + Sync>;

struct Slot<T> {
    payload: Arc<T>,
    borrowers: usize,
    retired: bool,
}

struct State<T> {
    current: Option<u64>,
    slots: HashMap<u64, Slot<T>>,
    next_generation: u64,
}

impl<T> State<T> {
    /// Mark `generation` retired, returning its payload if nobody borrows it
    fn retire(&mut self, generation: u64) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(&generation)?;
        slot.retired = true;
        if slot.borrowers == 0 {
            return self.slots.remove(&generation).map(|s| s.payload);
        }
        None
    }
}

/// Versioned, swappable payload with deferred teardown
pub struct VersionRef<T> {
    name: String,
    state: Mutex<State<T>>,
    teardown: Teardown<T>,
}

impl<T> VersionRef<T> {
    /// Create an empty reference; `name` identifies it in errors and logs
    pub fn new(name: impl Into<String>, teardown: Teardown<T>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                current: None,
                slots: HashMap::new(),
                next_generation: 1,
            }),
            teardown,
        }
    }

    /// Create a reference whose retired payloads need no cleanup
    pub fn without_teardown(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(|_| {}))
    }

    /// Name used in logs, usually the store's
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pin the current payload
    ///
    /// Fails with `Error::NotReady` if nothing is installed.
    pub fn borrow(self: &Arc<Self>) -> Result<VersionHandle<T>> {
        let mut state = self.state.lock();
        let generation = state
            .current
            .ok_or_else(|| Error::NotReady(self.name.clone()))?;
        let slot = state
            .slots
            .get_mut(&generation)
            .ok_or_else(|| Error::internal(format!("{}: current slot missing", self.name)))?;
        slot.borrowers += 1;
        Ok(VersionHandle {
            owner: Arc::clone(self),
            generation,
            payload: Arc::clone(&slot.payload),
        })
    }

    /// Install `payload` as current and retire the previous payload
    ///
    /// Returns the generation assigned to `payload`.
    pub fn swap(&self, payload: T) -> u64 {
        let (generation, retired) = {
            let mut state = self.state.lock();
            let generation = state.next_generation;
            state.next_generation += 1;
            state.slots.insert(
                generation,
                Slot {
                    payload: Arc::new(payload),
                    borrowers: 0,
                    retired: false,
                },
            );
            let previous = state.current.replace(generation);
            (generation, previous.and_then(|p| state.retire(p)))
        };
        debug!("{}: installed generation {}", self.name, generation);
        self.tear_down(retired);
        generation
    }

    /// Retire the current payload, leaving nothing installed
    ///
    /// Returns whether a payload was installed.
    pub fn retire_current(&self) -> bool {
        let (had_current, retired) = {
            let mut state = self.state.lock();
            match state.current.take() {
                Some(generation) => (true, state.retire(generation)),
                None => (false, None),
            }
        };
        self.tear_down(retired);
        had_current
    }

    /// Generation currently installed
    pub fn current_generation(&self) -> Option<u64> {
        self.state.lock().current
    }

    /// Number of generations not yet torn down, current included
    pub fn live_generations(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of handles held on `generation`
    pub fn borrowers(&self, generation: u64) -> usize {
        self.state
            .lock()
            .slots
            .get(&generation)
            .map_or(0, |slot| slot.borrowers)
    }

    fn release(&self, generation: u64) {
        let retired = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&generation) else {
                return;
            };
            slot.borrowers = slot.borrowers.saturating_sub(1);
            if slot.retired && slot.borrowers == 0 {
                state.slots.remove(&generation).map(|s| s.payload)
            } else {
                None
            }
        };
        if retired.is_some() {
            debug!(
                "{}: last handle on generation {} released",
                self.name, generation
            );
        }
        self.tear_down(retired);
    }

    fn tear_down(&self, retired: Option<Arc<T>>) {
        if let Some(payload) = retired {
            (self.teardown)(payload);
        }
    }
}

impl<T> fmt::Debug for VersionRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VersionRef")
            .field("name", &self.name)
            .field("current", &state.current)
            .field("live", &state.slots.len())
            .finish()
    }
}

/// Scoped borrow of one generation; released on drop
pub struct VersionHandle<T> {
    owner: Arc<VersionRef<T>>,
    generation: u64,
    payload: Arc<T>,
}

impl<T> VersionHandle<T> {
    /// Generation this handle pins
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Deref for VersionHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T> Drop for VersionHandle<T> {
    fn drop(&mut self) {
        self.owner.release(self.generation);
    }
}
