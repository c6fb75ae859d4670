// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::Rc,
};

use scopeguard::defer;

use crate::{
    error::Result,
    task::{
        self,
        state::{self, RawTask},
    },
};

struct SemWaiter {
    task: Rc<dyn RawTask>,
    granted: Cell<bool>,
    linked: Cell<bool>,
}

struct SemState {
    avail: u64,
    waiting: VecDeque<Rc<SemWaiter>>,
}

impl SemState {
    fn prune_stale(&mut self) {
        while matches!(self.waiting.front(), Some(w) if !w.linked.get()) {
            self.waiting.pop_front();
        }
    }
}

/// A counting semaphore that is friendly to single-threaded execution.
///
/// [`acquire`](Semaphore::acquire) suspends the current task while no permit
/// is available; [`release`](Semaphore::release) hands the permit directly
/// to the longest-waiting task and resumes it, so waiters are served in
/// strict FIFO order and a permit never sits in the counter while a task
/// waits.
///
/// # Examples
///
/// ```
/// use filato::{host::LocalLoop, sync::Semaphore};
/// use std::{rc::Rc, time::Duration};
///
/// LocalLoop::new().run(|| {
///     let sem = Rc::new(Semaphore::new(1));
///     let t = filato::spawn({
///         let sem = sem.clone();
///         async move {
///             sem.acquire().await?;
///             // ... exclusive section ...
///             sem.release();
///             Ok(())
///         }
///     });
///     let out = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(out, Ok(()));
/// });
/// ```
pub struct Semaphore {
    state: RefCell<SemState>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Semaphore")
            .field("available", &state.avail)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl Semaphore {
    /// Creates a semaphore with `avail` permits.
    pub fn new(avail: u64) -> Semaphore {
        Semaphore {
            state: RefCell::new(SemState {
                avail,
                waiting: VecDeque::new(),
            }),
        }
    }

    /// Number of permits currently available.
    pub fn available(&self) -> u64 {
        self.state.borrow().avail
    }

    /// Takes a permit without suspending. Fails when none is free or when
    /// earlier tasks are already queued for one.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.prune_stale();
        if state.waiting.is_empty() && state.avail > 0 {
            state.avail -= 1;
            true
        } else {
            false
        }
    }

    /// Takes a permit, suspending the current task until one is free.
    ///
    /// The caller is responsible for giving the permit back with
    /// [`release`](Semaphore::release). Cancellation of the waiting task
    /// surfaces as `Err(Cancelled)`; a permit that was already granted to it
    /// is passed on to the next waiter.
    pub async fn acquire(&self) -> Result<()> {
        let waiter = {
            let mut state = self.state.borrow_mut();
            state.prune_stale();
            if state.waiting.is_empty() && state.avail > 0 {
                state.avail -= 1;
                return Ok(());
            }
            let task = state::current_raw().unwrap_or_else(|| {
                panic!("`Semaphore::acquire` with no free permit must be called from within a task")
            });
            let waiter = Rc::new(SemWaiter {
                task,
                granted: Cell::new(false),
                linked: Cell::new(true),
            });
            state.waiting.push_back(waiter.clone());
            waiter
        };
        let unlink = waiter.clone();
        defer! {
            unlink.linked.set(false);
        }
        loop {
            match task::suspend().await {
                Ok(()) => {
                    if waiter.granted.get() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    if waiter.granted.replace(false) {
                        // Granted and cancelled in the same breath: keep the
                        // permit moving.
                        self.release();
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Returns a permit, handing it directly to the head waiter if any.
    pub fn release(&self) {
        let waiter = {
            let mut state = self.state.borrow_mut();
            state.prune_stale();
            match state.waiting.pop_front() {
                Some(waiter) => {
                    waiter.linked.set(false);
                    waiter.granted.set(true);
                    Some(waiter)
                }
                None => {
                    state.avail += 1;
                    None
                }
            }
        };
        if let Some(waiter) = waiter {
            waiter.task.clone().resume_raw();
        }
    }
}
