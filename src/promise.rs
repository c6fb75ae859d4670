// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    time::Duration,
};

use scopeguard::defer;
use smallvec::SmallVec;

use crate::{
    error::{Error, Result},
    host,
    task::{
        self,
        state::Status,
    },
};

type Waiter<T> = Box<dyn FnOnce(&Result<T>)>;

struct PromiseState<T> {
    result: RefCell<Option<Result<T>>>,
    waiters: RefCell<SmallVec<[Waiter<T>; 2]>>,
}

/// A write-once result slot with an ordered waiter list.
///
/// A promise starts out pending, is settled exactly once with
/// [`complete`](Promise::complete) or [`fail`](Promise::fail), and then stays
/// settled forever. Waiters registered with [`on_done`](Promise::on_done) are
/// invoked synchronously, in registration order, at the moment the promise
/// settles; waiters registered after that run immediately.
///
/// Every [`Task`](crate::task::Task) owns one promise carrying its outcome,
/// but promises are also useful on their own as a rendezvous between a task
/// and callback-style host code.
///
/// # Examples
///
/// ```
/// use filato::{host::LocalLoop, Promise};
/// use std::time::Duration;
///
/// let lp = LocalLoop::new();
/// lp.run(|| {
///     let p = Promise::new();
///     let t = filato::spawn({
///         let p = p.clone();
///         async move { p.recv().await }
///     });
///     p.complete("ready");
///     let got = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(got, Ok("ready"));
/// });
/// ```
pub struct Promise<T> {
    state: Rc<PromiseState<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        Promise {
            state: self.state.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .field("waiters", &self.state.waiters.borrow().len())
            .finish()
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Promise<T> {
        Promise::new()
    }
}

impl<T: 'static> Promise<T> {
    /// Creates a pending promise.
    pub fn new() -> Promise<T> {
        Promise {
            state: Rc::new(PromiseState {
                result: RefCell::new(None),
                waiters: RefCell::new(SmallVec::new()),
            }),
        }
    }

    /// True once the promise has been completed or failed.
    pub fn is_done(&self) -> bool {
        self.state.result.borrow().is_some()
    }

    /// Settles the promise with a value.
    ///
    /// Panics if the promise is already settled; a promise is write-once.
    pub fn complete(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Settles the promise with an error.
    ///
    /// Panics if the promise is already settled.
    pub fn fail(&self, err: impl Into<Error>) {
        self.settle(Err(err.into()));
    }

    pub(crate) fn settle(&self, result: Result<T>) {
        {
            let mut slot = self.state.result.borrow_mut();
            if slot.is_some() {
                panic!("tried to settle a promise that is already done");
            }
            *slot = Some(result);
        }
        // Waiters may resume tasks that register new waiters on this very
        // promise; those must observe the settled state, so the list is
        // detached before the first callback runs.
        let waiters = std::mem::take(&mut *self.state.waiters.borrow_mut());
        let slot = self.state.result.borrow();
        let result = slot.as_ref().expect("settled above");
        for waiter in waiters {
            waiter(result);
        }
    }

    /// Registers `f` to run when the promise settles, with the result.
    ///
    /// Runs `f` immediately if the promise is already settled.
    pub fn on_done(&self, f: impl FnOnce(&Result<T>) + 'static) {
        if self.is_done() {
            let slot = self.state.result.borrow();
            f(slot.as_ref().expect("checked above"));
        } else {
            self.state.waiters.borrow_mut().push(Box::new(f));
        }
    }

    /// A copy of the result, or `None` while the promise is pending.
    pub fn try_result(&self) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.state.result.borrow().clone()
    }

    /// Suspends the current task until the promise settles, then returns the
    /// result.
    ///
    /// Cancelling the waiting task surfaces here as `Err(Cancelled)`; the
    /// waiter this call registered becomes inert and a later settle will not
    /// touch the gone task. Must be called from within a task; use
    /// [`wait`](Promise::wait) from the main context.
    pub async fn recv(&self) -> Result<T>
    where
        T: Clone,
    {
        if let Some(result) = self.try_result() {
            return result;
        }
        let me = task::state::current_raw()
            .unwrap_or_else(|| panic!("`Promise::recv` must be called from within a task"));
        let armed = Rc::new(Cell::new(true));
        let disarm = armed.clone();
        defer! {
            disarm.set(false);
        }
        let weak = Rc::downgrade(&me);
        drop(me);
        self.on_done(move |_| {
            if !armed.get() {
                return;
            }
            if let Some(task) = weak.upgrade() {
                if task.status() == Status::Suspended {
                    task.resume_raw();
                }
            }
        });
        loop {
            task::suspend().await?;
            if let Some(result) = self.try_result() {
                return result;
            }
        }
    }

    /// Blocks the caller until the promise settles, driving the host loop.
    ///
    /// This never suspends and is legal outside tasks; the host's blocking
    /// wait services scheduled work while polling. Returns `None` if
    /// `timeout` elapsed first.
    pub fn wait(&self, timeout: Duration, interval: Duration) -> Option<Result<T>>
    where
        T: Clone,
    {
        let host = host::current();
        let settled = host.blocking_wait(timeout, interval, &mut || self.is_done());
        if settled {
            self.try_result()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn waiters_run_in_registration_order() {
        let p = Promise::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            p.on_done(move |r: &Result<u32>| {
                assert_eq!(*r, Ok(9));
                order.borrow_mut().push(i);
            });
        }
        p.complete(9);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn late_waiter_runs_immediately() {
        let p = Promise::new();
        p.fail("nope");
        let seen = Rc::new(Cell::new(false));
        let seen2 = seen.clone();
        p.on_done(move |r: &Result<()>| {
            assert_eq!(*r, Err(Error::Fail("nope".to_string())));
            seen2.set(true);
        });
        assert!(seen.get());
    }

    #[test]
    #[should_panic(expected = "already done")]
    fn double_settle_panics() {
        let p = Promise::new();
        p.complete(1);
        p.complete(2);
    }

    #[test]
    fn cancelled_recv_ignores_a_late_settle() {
        use std::time::Duration;
        crate::host::LocalLoop::new().run(|| {
            let p = Promise::new();
            let t = crate::task::spawn(enclose::enclose! { (p) async move { p.recv().await }});
            t.cancel().unwrap();
            let out = t
                .wait(Duration::from_millis(100), Duration::from_millis(1))
                .unwrap();
            assert_eq!(out, Err(Error::Cancelled));
            // The dead waiter must not react; the promise settles normally.
            p.complete("foo");
            assert_eq!(p.try_result(), Some(Ok("foo")));
        });
    }

    #[test]
    fn try_result_peeks_without_consuming() {
        let p = Promise::new();
        assert_eq!(p.try_result(), None);
        p.complete("v");
        assert_eq!(p.try_result(), Some(Ok("v")));
        assert_eq!(p.try_result(), Some(Ok("v")));
    }
}
