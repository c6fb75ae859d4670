// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The capability surface the runtime consumes from its embedding event loop.
//!
//! The runtime itself never touches the operating system. Everything
//! time- or scheduling-related is requested from a [`Host`]: an object the
//! embedder installs for the current thread with [`with_host`] (or by using
//! the built-in [`LocalLoop`]). An editor-like environment implements `Host`
//! on top of its own event loop; tests and standalone programs use
//! [`LocalLoop`] directly.
//!
//! Hosts distinguish a restricted *fast event* context (e.g. callbacks run
//! directly from an I/O poll, where many APIs are illegal) from the safe
//! main context. [`Host::schedule`] is the bridge between the two: closures
//! handed to it always run at the next safe point.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, VecDeque},
    fmt,
    rc::Rc,
    thread,
    time::{Duration, Instant},
};

use scoped_tls::scoped_thread_local;
use scopeguard::defer;

/// Identifies a one-shot timer registered with a [`Host`].
///
/// The deadline is carried inside the id so a host can index timers by
/// `(deadline, sequence)` without a secondary lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    when: Instant,
    seq: u64,
}

impl TimerId {
    /// Creates a timer id from a deadline and a host-assigned sequence number.
    pub fn new(when: Instant, seq: u64) -> TimerId {
        TimerId { when, seq }
    }

    /// The deadline this timer was armed for.
    pub fn when(&self) -> Instant {
        self.when
    }

    /// The host-assigned sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// What the runtime needs from the embedding event loop.
pub trait Host {
    /// Enqueues `f` to run at the next safe (non-fast) point.
    fn schedule(&self, f: Box<dyn FnOnce()>);

    /// True iff the current context is restricted.
    fn in_fast_event(&self) -> bool;

    /// Runs the event loop until `pred` returns true or `timeout` elapses,
    /// polling `pred` at roughly `interval` granularity. Returns whether
    /// `pred` fired.
    fn blocking_wait(
        &self,
        timeout: Duration,
        interval: Duration,
        pred: &mut dyn FnMut() -> bool,
    ) -> bool;

    /// Arms a one-shot timer running `cb` once `after` has elapsed.
    fn start_timer(&self, after: Duration, cb: Box<dyn FnOnce()>) -> TimerId;

    /// Disarms a timer. A no-op if it already fired or was stopped.
    fn stop_timer(&self, id: TimerId);
}

scoped_thread_local!(static CURRENT_HOST: Rc<dyn Host>);

/// Makes `host` the current host for this thread for the duration of `f`.
///
/// Every suspending primitive that needs time or scheduling resolves the
/// host through this slot. Nesting is allowed; the innermost host wins.
pub fn with_host<R>(host: Rc<dyn Host>, f: impl FnOnce() -> R) -> R {
    CURRENT_HOST.set(&host, f)
}

/// True iff a host has been entered on this thread.
pub fn is_set() -> bool {
    CURRENT_HOST.is_set()
}

/// The host entered for this thread.
///
/// Panics with guidance when no host has been entered.
pub fn current() -> Rc<dyn Host> {
    if !CURRENT_HOST.is_set() {
        panic!(
            "no host is current on this thread; enter one with `host::with_host` \
             or run inside `LocalLoop::run`"
        );
    }
    CURRENT_HOST.with(Rc::clone)
}

/// True iff the current host reports a restricted context.
pub fn in_fast_event() -> bool {
    current().in_fast_event()
}

struct LoopState {
    scheduled: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    timers: RefCell<BTreeMap<(Instant, u64), Box<dyn FnOnce()>>>,
    seq: Cell<u64>,
    fast: Cell<bool>,
}

/// A minimal single-threaded event loop implementing [`Host`].
///
/// Good enough to embed the runtime outside an editor and to run the test
/// suite: a FIFO of scheduled closures serviced in safe context, a one-shot
/// timer store, and a fast-event flag. Timer callbacks fire in *fast*
/// context, as host timers commonly do; anything routed through
/// [`Host::schedule`] runs in safe context.
///
/// # Examples
///
/// ```
/// use filato::host::LocalLoop;
/// use std::time::Duration;
///
/// let lp = LocalLoop::new();
/// lp.run(|| {
///     let t = filato::spawn(async {
///         filato::sleep(Duration::from_millis(5)).await?;
///         Ok(7)
///     });
///     let v = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(v, Ok(7));
/// });
/// ```
#[derive(Clone)]
pub struct LocalLoop {
    state: Rc<LoopState>,
}

impl fmt::Debug for LocalLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLoop")
            .field("scheduled", &self.state.scheduled.borrow().len())
            .field("timers", &self.state.timers.borrow().len())
            .field("fast", &self.state.fast.get())
            .finish()
    }
}

impl Default for LocalLoop {
    fn default() -> LocalLoop {
        LocalLoop::new()
    }
}

impl LocalLoop {
    /// Creates an empty loop.
    pub fn new() -> LocalLoop {
        LocalLoop {
            state: Rc::new(LoopState {
                scheduled: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BTreeMap::new()),
                seq: Cell::new(0),
                fast: Cell::new(false),
            }),
        }
    }

    /// Enters this loop as the current host and runs `f`.
    ///
    /// `f` executes in the main (non-fast) context; blocking waits issued
    /// from inside it drive the loop.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let host: Rc<dyn Host> = Rc::new(self.clone());
        with_host(host, f)
    }

    /// Runs `f` as a restricted "fast" callback, the way a host would invoke
    /// an I/O completion. Restores the previous context flag afterwards.
    pub fn run_fast_event<R>(&self, f: impl FnOnce() -> R) -> R {
        let state = self.state.clone();
        let prev = state.fast.replace(true);
        defer! {
            state.fast.set(prev);
        }
        f()
    }

    /// Runs every callback that is currently due: expired timers first (in
    /// fast context), then the whole scheduled queue (in safe context).
    /// Returns how many callbacks ran.
    pub fn turn(&self) -> usize {
        self.run_due_timers() + self.run_scheduled()
    }

    fn run_due_timers(&self) -> usize {
        let mut ran = 0;
        loop {
            let now = Instant::now();
            let cb = {
                let mut timers = self.state.timers.borrow_mut();
                let due = timers.first_key_value().map(|(&(when, _), _)| when);
                match due {
                    Some(when) if when <= now => timers.pop_first().map(|(_, cb)| cb),
                    _ => None,
                }
            };
            let Some(cb) = cb else { break };
            let state = self.state.clone();
            let prev = state.fast.replace(true);
            defer! {
                state.fast.set(prev);
            }
            cb();
            ran += 1;
        }
        ran
    }

    fn run_scheduled(&self) -> usize {
        let mut ran = 0;
        loop {
            let cb = self.state.scheduled.borrow_mut().pop_front();
            let Some(cb) = cb else { break };
            let state = self.state.clone();
            let prev = state.fast.replace(false);
            defer! {
                state.fast.set(prev);
            }
            cb();
            ran += 1;
        }
        ran
    }

    fn next_timer_due(&self) -> Option<Instant> {
        self.state
            .timers
            .borrow()
            .first_key_value()
            .map(|(&(when, _), _)| when)
    }
}

impl Host for LocalLoop {
    fn schedule(&self, f: Box<dyn FnOnce()>) {
        self.state.scheduled.borrow_mut().push_back(f);
    }

    fn in_fast_event(&self) -> bool {
        self.state.fast.get()
    }

    fn blocking_wait(
        &self,
        timeout: Duration,
        interval: Duration,
        pred: &mut dyn FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.turn();
            if pred() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let mut nap = interval.min(deadline - now);
            if let Some(due) = self.next_timer_due() {
                nap = nap.min(due.saturating_duration_since(now));
            }
            if !self.state.scheduled.borrow().is_empty() {
                nap = Duration::ZERO;
            }
            if !nap.is_zero() {
                thread::sleep(nap);
            }
        }
    }

    fn start_timer(&self, after: Duration, cb: Box<dyn FnOnce()>) -> TimerId {
        let seq = self.state.seq.get();
        self.state.seq.set(seq + 1);
        let when = Instant::now() + after;
        self.state.timers.borrow_mut().insert((when, seq), cb);
        TimerId::new(when, seq)
    }

    fn stop_timer(&self, id: TimerId) {
        self.state.timers.borrow_mut().remove(&(id.when(), id.seq()));
    }
}
