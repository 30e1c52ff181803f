//! FIFO admission scheduler for engine operations.
//!
//! A ticket turnstile over a counting semaphore: operations draw a ticket
//! on arrival and are admitted strictly in ticket order, at most
//! `max_concurrent_ops` in flight. Operations beyond the limit wait in
//! arrival order — the turnstile doubles as the FIFO queue, with no
//! separate queue structure.
//!
//! Shutdown is two-phase: `begin_drain` makes new arrivals fail with
//! [`EngineError::Busy`] while in-flight operations finish;
//! `mark_closed` turns the failure into [`EngineError::NotOpen`].

use std::sync::{Condvar, Mutex, MutexGuard};

use super::EngineError;

struct SchedulerState {
    /// Permits currently available.
    available: usize,

    /// Total permits (`max_concurrent_ops`).
    permits: usize,

    /// Ticket handed to the next arrival.
    next_ticket: u64,

    /// Ticket currently allowed through the turnstile.
    now_serving: u64,

    /// Shutdown in progress: new arrivals get `Busy`.
    draining: bool,

    /// Shutdown complete: new arrivals get `NotOpen`.
    closed: bool,
}

/// Bounds in-flight operations and admits them in arrival order.
pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
    turnstile: Condvar,
}

/// An admission slot; dropping it releases the permit.
pub(crate) struct SchedulerPermit<'a> {
    scheduler: &'a Scheduler,
}

impl Scheduler {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                available: permits,
                permits,
                next_ticket: 0,
                now_serving: 0,
                draining: false,
                closed: false,
            }),
            turnstile: Condvar::new(),
        }
    }

    /// Blocks until this arrival's turn comes up and a permit is free.
    pub(crate) fn acquire(&self) -> Result<SchedulerPermit<'_>, EngineError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(EngineError::NotOpen);
        }
        if state.draining {
            return Err(EngineError::Busy);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;

        loop {
            if state.closed || state.draining {
                // Bailing out must still advance the turnstile, or every
                // ticket behind this one would wait forever.
                if state.now_serving == ticket {
                    state.now_serving += 1;
                    self.turnstile.notify_all();
                }
                return Err(if state.closed {
                    EngineError::NotOpen
                } else {
                    EngineError::Busy
                });
            }

            if state.now_serving == ticket && state.available > 0 {
                state.available -= 1;
                state.now_serving += 1;
                self.turnstile.notify_all();
                return Ok(SchedulerPermit { scheduler: self });
            }

            state = self
                .turnstile
                .wait(state)
                .map_err(|_| EngineError::Internal("scheduler mutex poisoned".into()))?;
        }
    }

    /// Starts rejecting new arrivals with `Busy`.
    pub(crate) fn begin_drain(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.draining = true;
            self.turnstile.notify_all();
        }
    }

    /// Blocks until no operation holds a permit.
    pub(crate) fn wait_idle(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while state.available < state.permits {
            state = match self.turnstile.wait(state) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    /// Finalizes shutdown: new arrivals get `NotOpen`.
    pub(crate) fn mark_closed(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            self.turnstile.notify_all();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SchedulerState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Internal("scheduler mutex poisoned".into()))
    }
}

impl Drop for SchedulerPermit<'_> {
    fn drop(&mut self) {
        let mut state = match self.scheduler.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.available += 1;
        self.scheduler.turnstile.notify_all();
    }
}
