// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Cooperative tasks: creation, resumption, suspension, and structured
//! cancellation.
//!
//! A task wraps a future and drives it through explicit [`resume`] steps; at
//! most one task is running at any instant, and a task leaves the CPU only
//! at a suspension point ([`suspend`], or any primitive built on it such as
//! [`sleep`], [`Promise::recv`], [`Queue::pop`] or [`Semaphore::acquire`]).
//! Whoever holds a [`Task`] handle can observe its [`Status`], await its
//! result, or cancel it; cancellation is a cooperative signal that surfaces
//! as [`Error::Cancelled`] at the target's next suspension point and
//! propagates to the tasks it spawned.
//!
//! [`resume`]: Task::resume
//! [`sleep`]: crate::sleep
//! [`Promise::recv`]: crate::Promise::recv
//! [`Queue::pop`]: crate::sync::Queue::pop
//! [`Semaphore::acquire`]: crate::sync::Semaphore::acquire

mod callback;
pub mod join;
pub(crate) mod state;
mod waker_fn;

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use scopeguard::defer;

use crate::{
    error::{panic_message, Error, Result},
    host,
    promise::Promise,
};

pub use callback::{from_callback, from_callback_with, Callback, CallbackOptions};
pub use join::{wait_all, wait_any, Awaitable};
pub use state::{Status, TaskRef};

use state::RawTask;

thread_local! {
    static NEXT_TASK_ID: Cell<u64> = const { Cell::new(1) };
}

fn next_id() -> u64 {
    NEXT_TASK_ID.with(|id| {
        let v = id.get();
        id.set(v + 1);
        v
    })
}

struct TaskInner<T> {
    id: u64,
    status: Cell<Status>,
    cancelled: Cell<bool>,
    started: Cell<bool>,
    // Set when the waker fires while the task is being polled; the resume
    // loop turns it into a scheduled re-resume.
    woke: Cell<bool>,
    fut: RefCell<Option<Pin<Box<dyn Future<Output = Result<T>>>>>>,
    promise: Promise<T>,
    children: RefCell<Vec<Weak<dyn RawTask>>>,
}

impl<T: 'static> TaskInner<T> {
    fn do_resume(self: Rc<Self>) {
        let status = self.status.get();
        if status != Status::Suspended {
            panic!("tried to resume a task that is not suspended but {}", status);
        }
        log::trace!("resuming task {}", self.id);
        self.started.set(true);
        let poll = {
            if let Some(prev) = state::current_raw() {
                prev.set_status(Status::Normal);
            }
            self.status.set(Status::Running);
            state::push_running(self.clone() as Rc<dyn RawTask>);
            defer! {
                state::pop_running();
                if let Some(prev) = state::current_raw() {
                    if prev.status() == Status::Normal {
                        prev.set_status(Status::Running);
                    }
                }
            }
            let weak = Rc::downgrade(&self);
            let waker = waker_fn::local_waker(move || {
                if let Some(task) = weak.upgrade() {
                    task.wake_hint();
                }
            });
            let mut cx = Context::from_waker(&waker);
            let mut slot = self.fut.borrow_mut();
            let fut = slot
                .as_mut()
                .expect("resumed a task whose continuation is gone");
            panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)))
        };
        match poll {
            Ok(Poll::Pending) => {
                self.status.set(Status::Suspended);
                if self.woke.replace(false) {
                    self.wake_hint();
                }
            }
            Ok(Poll::Ready(result)) => {
                self.status.set(Status::Dead);
                *self.fut.borrow_mut() = None;
                self.promise.settle(result);
            }
            Err(payload) => {
                let msg = panic_message(payload);
                log::error!("task {} panicked: {}", self.id, msg);
                self.status.set(Status::Dead);
                *self.fut.borrow_mut() = None;
                self.promise.settle(Err(Error::Panicked(msg)));
            }
        }
    }

    // Called by the waker. Our own primitives resume tasks directly, so this
    // only matters for foreign futures that rely on the `Waker` contract.
    fn wake_hint(self: Rc<Self>) {
        match self.status.get() {
            Status::Running => self.woke.set(true),
            Status::Suspended => {
                if host::is_set() {
                    let weak = Rc::downgrade(&self);
                    host::current().schedule(Box::new(move || {
                        if let Some(task) = weak.upgrade() {
                            if task.status.get() == Status::Suspended {
                                task.do_resume();
                            }
                        }
                    }));
                } else {
                    log::warn!(
                        "task {} woken with no host entered; the wakeup is lost",
                        self.id
                    );
                }
            }
            Status::Normal | Status::Dead => {}
        }
    }
}

impl<T: 'static> RawTask for TaskInner<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn status(&self) -> Status {
        self.status.get()
    }

    fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    fn resume_raw(self: Rc<Self>) {
        self.do_resume();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    fn set_cancel_flag(&self, on: bool) {
        self.cancelled.set(on);
    }

    fn cancel_raw(self: Rc<Self>, detach_children: bool) -> Result<()> {
        match self.status.get() {
            Status::Running | Status::Normal => panic!(
                "tried to cancel a task that is {}; a task cannot cancel itself \
                 synchronously (observe `is_cancelled` or use `unset_cancelled` instead)",
                self.status.get()
            ),
            Status::Dead => Err(Error::Dead),
            Status::Suspended => {
                self.cancelled.set(true);
                if self.started.get() {
                    // The signal surfaces at the task's suspension point.
                    self.clone().do_resume();
                } else {
                    // Never ran: there is no suspension point to deliver the
                    // signal to, so the task dies without running its body.
                    self.status.set(Status::Dead);
                    *self.fut.borrow_mut() = None;
                    self.promise.settle(Err(Error::Cancelled));
                }
                if !detach_children {
                    let children: Vec<_> = self.children.borrow().clone();
                    for child in children {
                        if let Some(child) = child.upgrade() {
                            if let Err(err) = child.clone().cancel_raw(false) {
                                log::debug!(
                                    "child task {} not cancelled: {}",
                                    child.id(),
                                    err
                                );
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn add_child(&self, child: Weak<dyn RawTask>) {
        self.children.borrow_mut().push(child);
    }
}

/// A handle to a cooperative task.
///
/// Handles are cheap to clone and do not keep the task running: dropping
/// every handle while a task is parked simply destroys it, releasing the
/// resources its suspension points registered. The task's outcome is carried
/// by its [`Promise`], reachable through [`promise`](Task::promise),
/// [`join`](Task::join) and [`wait`](Task::wait).
pub struct Task<T> {
    inner: Rc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Task<T> {
        Task {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .field("cancelled", &self.inner.cancelled.get())
            .finish()
    }
}

impl<T: 'static> Task<T> {
    /// Creates a task without running it.
    ///
    /// The task starts out `Suspended`; nothing happens until someone calls
    /// [`resume`](Task::resume) (or cancels it). If a task is currently
    /// running, the new task is registered as its child and will be reached
    /// by a structured [`cancel`](Task::cancel) of the parent. Prefer
    /// [`spawn`], which also performs the first resume.
    pub fn new<F>(fut: F) -> Task<T>
    where
        F: Future<Output = Result<T>> + 'static,
    {
        let inner = Rc::new(TaskInner {
            id: next_id(),
            status: Cell::new(Status::Suspended),
            cancelled: Cell::new(false),
            started: Cell::new(false),
            woke: Cell::new(false),
            fut: RefCell::new(Some(Box::pin(fut))),
            promise: Promise::new(),
            children: RefCell::new(Vec::new()),
        });
        if let Some(parent) = state::current_raw() {
            parent.add_child(Rc::downgrade(&(inner.clone() as Rc<dyn RawTask>)));
        }
        Task { inner }
    }

    /// Runs the task until its next suspension point.
    ///
    /// Panics if the task is not `Suspended`. User code rarely calls this
    /// directly: the primitives resume their waiters themselves.
    pub fn resume(&self) {
        self.inner.clone().do_resume();
    }

    /// The task's current lifecycle state.
    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// True once the task's outcome is settled.
    pub fn is_done(&self) -> bool {
        self.inner.promise.is_done()
    }

    /// True iff a cancellation signal is pending or was observed.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.get()
    }

    /// Clears a pending cancellation signal.
    pub fn unset_cancelled(&self) {
        self.inner.cancelled.set(false);
    }

    /// Cancels this task and, transitively, every live child task.
    ///
    /// The task is resumed so the signal is observed at its suspension point
    /// and its body unwinds (or intercepts the signal via
    /// [`unset_cancelled`]); then each task it spawned is cancelled the same
    /// way. Cancelling a finished task returns [`Error::Dead`]. Panics if
    /// the task is currently running: a task cannot cancel itself
    /// synchronously.
    ///
    /// [`unset_cancelled`]: unset_cancelled()
    pub fn cancel(&self) -> Result<()> {
        (self.inner.clone() as Rc<dyn RawTask>).cancel_raw(false)
    }

    /// Cancels only this task, leaving the tasks it spawned untouched.
    pub fn cancel_detached(&self) -> Result<()> {
        (self.inner.clone() as Rc<dyn RawTask>).cancel_raw(true)
    }

    /// The promise carrying this task's outcome.
    pub fn promise(&self) -> &Promise<T> {
        &self.inner.promise
    }

    /// Suspends the current task until this one finishes, returning its
    /// outcome. A shorthand for `task.promise().recv()`.
    pub async fn join(&self) -> Result<T>
    where
        T: Clone,
    {
        self.inner.promise.recv().await
    }

    /// Blocks until this task finishes, driving the host loop; legal outside
    /// tasks. Returns `None` on timeout.
    pub fn wait(&self, timeout: Duration, interval: Duration) -> Option<Result<T>>
    where
        T: Clone,
    {
        self.inner.promise.wait(timeout, interval)
    }

    /// An untyped handle to the same task.
    pub fn handle(&self) -> TaskRef {
        TaskRef {
            raw: self.inner.clone() as Rc<dyn RawTask>,
        }
    }
}

/// Creates a task from `fut` and immediately resumes it once.
///
/// The body runs up to its first suspension point before `spawn` returns.
/// If a task is currently running, the new task becomes its child for the
/// purposes of structured cancellation.
///
/// # Examples
///
/// ```
/// use filato::host::LocalLoop;
/// use std::time::Duration;
///
/// LocalLoop::new().run(|| {
///     let t = filato::spawn(async {
///         filato::sleep(Duration::from_millis(2)).await?;
///         Ok("done")
///     });
///     let out = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(out, Ok("done"));
/// });
/// ```
pub fn spawn<T, F>(fut: F) -> Task<T>
where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
{
    let task = Task::new(fut);
    task.resume();
    task
}

/// Parks the current task until something resumes it.
///
/// This is the one true suspension point: every other suspending primitive
/// bottoms out here. On resumption it reports a pending cancellation signal
/// as `Err(Cancelled)`: propagate it with `?` to unwind, or match on it and
/// call [`unset_cancelled`] to keep running.
///
/// Panics when called outside a task, or when entered while the task is
/// already flagged as cancelled (clear the flag first).
///
/// [`unset_cancelled`]: unset_cancelled()
pub async fn suspend() -> Result<()> {
    let mut owner: Option<u64> = None;
    futures_lite::future::poll_fn(move |_cx| match owner {
        None => {
            let cur = state::current_raw().unwrap_or_else(|| {
                panic!(
                    "`suspend` called outside of a task; suspension points only \
                     work inside spawned tasks"
                )
            });
            if cur.is_cancelled() {
                panic!(
                    "`suspend` entered inside a cancelled task; call \
                     `unset_cancelled` first to keep running"
                );
            }
            owner = Some(cur.id());
            Poll::Pending
        }
        Some(owner) => {
            let cur = state::current_raw()
                .unwrap_or_else(|| panic!("a parked task was polled outside of `resume`"));
            if cur.id() != owner {
                panic!(
                    "a suspension point woke inside the wrong task; tasks must be \
                     driven through `resume`"
                );
            }
            if cur.is_cancelled() {
                Poll::Ready(Err(Error::Cancelled))
            } else {
                Poll::Ready(Ok(()))
            }
        }
    })
    .await
}

/// The currently running task, if any.
pub fn current() -> Option<TaskRef> {
    state::current_raw().map(|raw| TaskRef { raw })
}

/// True iff no task is running (i.e. we are on the host's main stack).
pub fn in_main() -> bool {
    state::current_raw().is_none()
}

/// True iff the currently running task has a pending cancellation signal.
/// False outside tasks.
pub fn is_cancelled() -> bool {
    state::current_raw().map_or(false, |t| t.is_cancelled())
}

/// Clears the cancellation signal of the currently running task, allowing it
/// to keep suspending normally. A no-op outside tasks.
pub fn unset_cancelled() {
    if let Some(task) = state::current_raw() {
        task.set_cancel_flag(false);
    }
}

/// Runs a suspendable future protectedly, reporting failures as values.
///
/// The future runs in a fresh child task, so a failure (an error return or
/// a panic) lands in that task's promise instead of unwinding the caller.
/// Useful where an ordinary `catch`-style wrapper cannot straddle suspension
/// points.
pub async fn pcall<T, F>(fut: F) -> Result<T>
where
    T: Clone + 'static,
    F: Future<Output = Result<T>> + 'static,
{
    spawn(fut).join().await
}

/// Suspends until the host has left its restricted "fast event" context.
///
/// A no-op when already in a safe context. Otherwise the resume is routed
/// through [`Host::schedule`](crate::host::Host::schedule), which by
/// contract runs at the next safe point.
pub async fn sleep_until_nonfast() -> Result<()> {
    let host = host::current();
    if !host.in_fast_event() {
        return Ok(());
    }
    let me = state::current_raw().unwrap_or_else(|| {
        panic!("`sleep_until_nonfast` must be called from within a task")
    });
    let armed = Rc::new(Cell::new(true));
    let weak = Rc::downgrade(&me);
    drop(me);
    host.schedule(Box::new({
        let armed = armed.clone();
        move || {
            if !armed.replace(false) {
                return;
            }
            if let Some(task) = weak.upgrade() {
                if task.status() == Status::Suspended {
                    task.resume_raw();
                }
            }
        }
    }));
    let disarm = armed.clone();
    defer! {
        disarm.set(false);
    }
    loop {
        suspend().await?;
        if !armed.get() {
            return Ok(());
        }
    }
}
