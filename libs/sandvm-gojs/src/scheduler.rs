// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred resumption of a guest.
//!
//! The Go runtime parks itself when every goroutine is blocked on a timer and asks the host to
//! call its `resume` export once the earliest timer expires. Each scheduled timeout waits on its
//! own thread and re-enters the instance through [`Instance::call_if`], so a timeout only starts
//! firing while it holds the instance. A guest cancelling a timeout from inside a call can
//! therefore never observe it mid-fire, while a cancellation from any other thread waits for an
//! in-flight firing to complete.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use hashbrown::HashMap;
use sandvm::{Error, Instance};

/// The export a fired timeout calls.
pub const RESUME_EXPORT: &str = "resume";

/// The timeouts one instance has scheduled.
///
/// Owned by the instance (see [`Scheduler::of`]) and cancelled wholesale when it closes.
#[derive(Debug, Default)]
pub struct Scheduler {
    table: Mutex<Table>,
    /// Signalled whenever the table becomes empty.
    idle: Condvar,
}

#[derive(Debug)]
struct Table {
    next_id: u32,
    events: HashMap<u32, Arc<Event>>,
    closed: bool,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            next_id: 1,
            events: HashMap::new(),
            closed: false,
        }
    }
}

#[derive(Debug, Default)]
struct Event {
    state: Mutex<EventState>,
    changed: Condvar,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum EventState {
    #[default]
    Pending,
    Cancelled,
    /// `resume` is running on this thread.
    Firing(ThreadId),
    Finished,
}

impl Scheduler {
    /// Returns the scheduler of `instance`, creating it on first use.
    pub fn of(instance: &Instance) -> Arc<Self> {
        let mut created = false;
        let scheduler = instance.extension(|| {
            created = true;
            Self::default()
        });

        if created {
            let scheduler = scheduler.clone();
            instance.on_close(move || {
                scheduler.cancel_all();
                Ok(())
            });
        }

        scheduler
    }

    /// Schedules a call to the [`RESUME_EXPORT`] of `instance` after `delay`, returning the id
    /// that cancels it.
    pub fn schedule(self: &Arc<Self>, instance: &Instance, delay: Duration) -> sandvm::Result<u32> {
        let event = Arc::new(Event::default());
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id = table.next_id.wrapping_add(1).max(1);
            if table.closed {
                // the instance is going away, nothing will ever fire
                return Ok(id);
            }
            table.events.insert(id, event.clone());
            id
        };

        let scheduler = self.clone();
        let target = instance.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-timeout-{id}", instance.name()))
            .spawn(move || scheduler.fire(&target, id, &event, delay));

        if let Err(e) = spawned {
            self.remove(id);
            return Err(Error::host(e));
        }

        tracing::debug!(instance = instance.name(), id, ?delay, "scheduled timeout");
        Ok(id)
    }

    /// Cancels the timeout `id`.
    ///
    /// A timeout that has not started firing never will. If it is firing on another thread this
    /// blocks until `resume` returns. Returns `false` if there was no such timeout.
    pub fn cancel(&self, id: u32) -> bool {
        let Some(event) = self.remove(id) else {
            return false;
        };
        event.cancel();
        tracing::debug!(id, "cancelled timeout");
        true
    }

    /// The number of timeouts that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.table).events.len()
    }

    /// Blocks until no timeout is left.
    pub fn wait_idle(&self) {
        let table = lock(&self.table);
        drop(
            self.idle
                .wait_while(table, |table| !table.events.is_empty())
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Cancels every timeout and refuses new ones.
    fn cancel_all(&self) {
        let events: Vec<_> = {
            let mut table = lock(&self.table);
            table.closed = true;
            table.events.drain().map(|(_, event)| event).collect()
        };
        self.idle.notify_all();

        for event in &events {
            event.cancel();
        }
        if !events.is_empty() {
            tracing::debug!(cancelled = events.len(), "cancelled all timeouts");
        }
    }

    fn remove(&self, id: u32) -> Option<Arc<Event>> {
        let mut table = lock(&self.table);
        let event = table.events.remove(&id);
        if table.events.is_empty() {
            self.idle.notify_all();
        }
        event
    }

    fn fire(&self, instance: &Instance, id: u32, event: &Event, delay: Duration) {
        let expired = {
            let state = lock(&event.state);
            let (state, _) = event
                .changed
                .wait_timeout_while(state, delay, |state| *state == EventState::Pending)
                .unwrap_or_else(PoisonError::into_inner);
            *state == EventState::Pending
        };

        if expired {
            let res = instance.call_if(RESUME_EXPORT, &[], || {
                !instance.is_closed() && event.begin_firing()
            });
            event.finish();

            match res {
                Ok(Some(_)) => tracing::trace!(instance = instance.name(), id, "fired timeout"),
                Ok(None) => {}
                Err(Error::Closed { .. }) => {
                    tracing::debug!(instance = instance.name(), id, "instance closed before timeout");
                }
                Err(Error::Exit { code, .. }) => {
                    tracing::debug!(instance = instance.name(), id, code, "guest exited while resuming");
                }
                Err(e) => tracing::warn!(instance = instance.name(), id, "resume failed: {e}"),
            }
        }

        self.remove(id);
    }
}

impl Event {
    /// Moves a pending event to firing on the current thread.
    fn begin_firing(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == EventState::Pending {
            *state = EventState::Firing(thread::current().id());
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        *lock(&self.state) = EventState::Finished;
        self.changed.notify_all();
    }

    fn cancel(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        if *state == EventState::Pending {
            *state = EventState::Cancelled;
            self.changed.notify_all();
            return;
        }

        // a timeout cancelling itself from inside `resume` must not wait for itself
        drop(
            self.changed
                .wait_while(state, |state| {
                    matches!(state, EventState::Firing(owner) if *owner != me)
                })
                .unwrap_or_else(PoisonError::into_inner),
        );
    }
}

/// Locks `mutex`, ignoring poisoning. Guest code never runs while one of these is held.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
