// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Bridges host-style callback APIs into suspendable task code.
//!
//! Editor hosts expose asynchronous primitives as functions taking a
//! completion callback. [`from_callback`] turns one invocation of such a
//! primitive into an `await`able expression: the calling task suspends until
//! the callback fires, with well-defined behavior on cancellation and on
//! callbacks that arrive late.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use scopeguard::defer;

use crate::{
    error::Result,
    host,
    task::state::{self, RawTask, Status},
};

struct CallState<A> {
    // True while the adapter still wants the payload; flipped off once the
    // awaiter has returned (successfully or by unwinding).
    waiting: Cell<bool>,
    value: RefCell<Option<A>>,
    cleanup: RefCell<Option<Box<dyn FnOnce(A)>>>,
    task: Weak<dyn RawTask>,
}

/// The completion handle passed to the host primitive.
///
/// Exactly one invocation is expected; the handle is consumed by it.
pub struct Callback<A> {
    state: Rc<CallState<A>>,
    schedule: bool,
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.state.waiting.get())
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl<A: 'static> Callback<A> {
    /// Delivers the completion payload, resuming the awaiting task.
    ///
    /// If the awaiter was cancelled in the meantime, the payload goes to the
    /// adapter's `cleanup` hook instead and the task is left alone.
    pub fn invoke(self, value: A) {
        if self.schedule && host::is_set() {
            let state = self.state;
            host::current().schedule(Box::new(move || Self::deliver(&state, value)));
        } else {
            Self::deliver(&self.state, value);
        }
    }

    fn deliver(state: &Rc<CallState<A>>, value: A) {
        if !state.waiting.get() {
            // The awaiter is gone; hand the payload to the cleanup hook so
            // resources it carries are not leaked.
            if let Some(cleanup) = state.cleanup.borrow_mut().take() {
                cleanup(value);
            }
            return;
        }
        *state.value.borrow_mut() = Some(value);
        if let Some(task) = state.task.upgrade() {
            if task.status() == Status::Suspended {
                task.resume_raw();
            }
            // A `Running` status means the primitive completed synchronously;
            // the adapter picks the value up without ever suspending.
        }
    }
}

/// Options for [`from_callback_with`].
///
/// `A` is the callback payload, `R` the immediate return value of the host
/// primitive (typically an in-flight handle that `on_cancel` can abort).
pub struct CallbackOptions<A, R = ()> {
    schedule: bool,
    on_cancel: Option<Box<dyn FnOnce(R)>>,
    cleanup: Option<Box<dyn FnOnce(A)>>,
}

impl<A, R> fmt::Debug for CallbackOptions<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackOptions")
            .field("schedule", &self.schedule)
            .field("on_cancel", &self.on_cancel.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

impl<A, R> Default for CallbackOptions<A, R> {
    fn default() -> CallbackOptions<A, R> {
        CallbackOptions::new()
    }
}

impl<A, R> CallbackOptions<A, R> {
    /// Options with no hooks and direct callback delivery.
    pub fn new() -> CallbackOptions<A, R> {
        CallbackOptions {
            schedule: false,
            on_cancel: None,
            cleanup: None,
        }
    }

    /// Routes the completion through [`Host::schedule`], escaping fast-event
    /// restrictions before the task is resumed.
    ///
    /// [`Host::schedule`]: crate::host::Host::schedule
    pub fn schedule(mut self, on: bool) -> Self {
        self.schedule = on;
        self
    }

    /// Hook invoked with the primitive's in-flight handle when the awaiting
    /// task is cancelled before the callback fired. Use it to abort the
    /// underlying operation.
    pub fn on_cancel(mut self, f: impl FnOnce(R) + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Hook invoked with the payload when the callback fires after the
    /// awaiting task was cancelled. Use it to release resources the callback
    /// hands back.
    pub fn cleanup(mut self, f: impl FnOnce(A) + 'static) -> Self {
        self.cleanup = Some(Box::new(f));
        self
    }
}

/// [`from_callback_with`] with default options.
pub async fn from_callback<A, R, F>(start: F) -> Result<A>
where
    A: 'static,
    F: FnOnce(Callback<A>) -> R,
{
    from_callback_with(CallbackOptions::new(), start).await
}

/// Calls a callback-taking host primitive and suspends until it completes.
///
/// `start` receives the completion [`Callback`] and invokes the primitive,
/// returning its immediate result (an in-flight handle, or `()`); the
/// payload later passed to the callback becomes this function's return
/// value. There is at most one suspension: when the primitive completes
/// synchronously the task never leaves the CPU.
///
/// On cancellation while suspended, `on_cancel` runs with the in-flight
/// handle, the cancellation propagates as `Err(Cancelled)`, and a late
/// callback becomes a no-op apart from the `cleanup` hook.
///
/// # Examples
///
/// ```
/// use filato::host::{self, Host, LocalLoop};
/// use filato::task::from_callback;
/// use std::time::Duration;
///
/// LocalLoop::new().run(|| {
///     let t = filato::spawn(async {
///         // A host primitive that reports completion via callback; here a
///         // bare timer stands in for one.
///         let n = from_callback(|done| {
///             host::current().start_timer(
///                 Duration::from_millis(2),
///                 Box::new(move || done.invoke(21)),
///             )
///         })
///         .await?;
///         Ok(n * 2)
///     });
///     let out = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(out, Ok(42));
/// });
/// ```
pub async fn from_callback_with<A, R, F>(opts: CallbackOptions<A, R>, start: F) -> Result<A>
where
    A: 'static,
    F: FnOnce(Callback<A>) -> R,
{
    let me = state::current_raw()
        .unwrap_or_else(|| panic!("`from_callback` must be called from within a task"));
    let state = Rc::new(CallState {
        waiting: Cell::new(true),
        value: RefCell::new(None),
        cleanup: RefCell::new(opts.cleanup),
        task: Rc::downgrade(&me),
    });
    drop(me);
    // However this returns, a late callback must find the adapter gone.
    let release = state.clone();
    defer! {
        release.waiting.set(false);
    }
    let callback = Callback {
        state: state.clone(),
        schedule: opts.schedule,
    };
    let inflight = start(callback);
    let mut on_cancel = opts.on_cancel;
    let err = loop {
        if let Some(value) = state.value.borrow_mut().take() {
            return Ok(value);
        }
        if let Err(err) = crate::task::suspend().await {
            break err;
        }
    };
    state.waiting.set(false);
    if let Some(abort) = on_cancel.take() {
        abort(inflight);
    }
    Err(err)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::Error,
        host::{Host, LocalLoop},
        task::spawn,
    };
    use enclose::enclose;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn callback_fired_from_a_timer_resumes_the_task() {
        LocalLoop::new().run(|| {
            let t = spawn(async {
                let n = from_callback(|done| {
                    host::current().start_timer(ms(3), Box::new(move || done.invoke(21)))
                })
                .await?;
                Ok(n * 2)
            });
            assert_eq!(t.wait(ms(5000), ms(1)).unwrap(), Ok(42));
        });
    }

    #[test]
    fn synchronous_completion_skips_the_suspension() {
        LocalLoop::new().run(|| {
            let t = spawn(async {
                let v = from_callback(|done| done.invoke("now")).await?;
                Ok(v)
            });
            // Completed without a single turn of the loop.
            assert!(t.is_done());
            assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Ok("now"));
        });
    }

    #[test]
    fn cancel_runs_on_cancel_and_cleanup() {
        LocalLoop::new().run(|| {
            let aborted = Rc::new(Cell::new(false));
            let cleaned = Rc::new(RefCell::new(None));
            let late: Rc<RefCell<Option<Callback<u32>>>> = Rc::new(RefCell::new(None));
            let t = spawn(enclose! { (aborted, cleaned, late) async move {
                let opts = CallbackOptions::new()
                    .on_cancel(enclose! { (aborted) move |handle: u32| {
                        assert_eq!(handle, 99);
                        aborted.set(true);
                    }})
                    .cleanup(enclose! { (cleaned) move |v: u32| {
                        *cleaned.borrow_mut() = Some(v);
                    }});
                let v = from_callback_with(opts, |done| {
                    // Keep the callback around; it fires only after the
                    // cancellation below.
                    *late.borrow_mut() = Some(done);
                    99_u32
                })
                .await?;
                Ok(v)
            }});
            t.cancel().unwrap();
            assert!(aborted.get());
            assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Err(Error::Cancelled));

            // The late callback must not resume the dead task, only clean up.
            late.borrow_mut().take().unwrap().invoke(7);
            assert_eq!(*cleaned.borrow(), Some(7));
        });
    }

    #[test]
    fn scheduled_delivery_waits_for_a_safe_point() {
        let lp = LocalLoop::new();
        lp.run(|| {
            let t = spawn(enclose! { (lp) async move {
                let opts = CallbackOptions::<(), _>::new().schedule(true);
                from_callback_with(opts, |done| {
                    let lp = lp.clone();
                    host::current().start_timer(
                        ms(2),
                        Box::new(move || {
                            assert!(lp.in_fast_event());
                            done.invoke(());
                        }),
                    )
                })
                .await?;
                // Delivery was rerouted through `schedule`, so the task is
                // back on safe ground.
                assert!(!lp.in_fast_event());
                Ok(())
            }});
            assert_eq!(t.wait(ms(5000), ms(1)).unwrap(), Ok(()));
        });
    }
}
