//! Debounced commit scheduling with a "max skip" forced-flush escape.
//!
//! Grounded on the teacher's `os/threads.rs` `SqliteThread` (spawn a
//! background worker, or run inline when single-threaded) for the
//! "background task, synchronous fallback" shape. The spec's debounce
//! (§4.2 `commitWithDebounce`, §5 "the only cancel is the debouncer's
//! cancel of a pending scheduled commit") has no promise-fan-in analogue in
//! a synchronous crate, so this models it as one background timer thread
//! per [`Debouncer`] plus a generation counter that lets a later call
//! supersede an earlier scheduled flush.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::Result;

struct State {
    skip_count: u32,
    pending: bool,
    generation: u64,
    shutdown: bool,
}

/// Schedules a debounced commit action, forcing it after too many deferred
/// calls in a row.
pub struct Debouncer {
    debounce: Duration,
    max_skip: u32,
    action: Arc<dyn Fn() -> Result<()> + Send + Sync>,
    state: Arc<Mutex<State>>,
    condvar: Arc<Condvar>,
}

impl Debouncer {
    /// Build a debouncer that invokes `action` either inline
    /// (`debounce == Duration::ZERO`) or after `debounce` elapses, forcing
    /// immediate execution once `max_skip` calls have been deferred without
    /// a flush.
    pub fn new(
        debounce: Duration,
        max_skip: u32,
        action: impl Fn() -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Debouncer {
            debounce,
            max_skip: max_skip.max(1),
            action: Arc::new(action),
            state: Arc::new(Mutex::new(State {
                skip_count: 0,
                pending: false,
                generation: 0,
                shutdown: false,
            })),
            condvar: Arc::new(Condvar::new()),
        }
    }

    /// Request a debounced commit. Returns immediately unless `debounce` is
    /// zero, in which case the action runs inline and its result is
    /// returned directly.
    pub fn commit_with_debounce(&self) -> Result<()> {
        if self.debounce.is_zero() {
            return (self.action)();
        }

        let mut state = self.state.lock().unwrap();
        state.skip_count += 1;

        if state.skip_count >= self.max_skip {
            state.skip_count = 0;
            state.pending = false;
            state.generation += 1;
            drop(state);
            let result = (self.action)();
            self.condvar.notify_all();
            return result;
        }

        if !state.pending {
            state.pending = true;
            let generation = state.generation;
            drop(state);
            self.spawn_timer(generation);
        }
        Ok(())
    }

    fn spawn_timer(&self, generation: u64) {
        let debounce = self.debounce;
        let state = Arc::clone(&self.state);
        let condvar = Arc::clone(&self.condvar);
        let action = Arc::clone(&self.action);
        thread::spawn(move || {
            thread::sleep(debounce);
            let mut guard = state.lock().unwrap();
            if guard.shutdown || guard.generation != generation {
                // Superseded by a forced flush or cancellation; this timer
                // has nothing left to do.
                return;
            }
            guard.pending = false;
            guard.skip_count = 0;
            guard.generation += 1;
            drop(guard);
            let _ = action();
            condvar.notify_all();
        });
    }

    /// Force the action to run now, regardless of any pending timer, and
    /// block until it completes.
    pub fn commit_now(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pending = false;
        state.skip_count = 0;
        state.generation += 1;
        drop(state);
        let result = (self.action)();
        self.condvar.notify_all();
        result
    }

    /// Cancel any pending scheduled commit without running it. Matches
    /// spec §5: cancellation rejects the pending flush rather than
    /// executing it.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.pending = false;
        state.shutdown = true;
        self.condvar.notify_all();
    }
}
