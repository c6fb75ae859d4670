// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use crate::error::Result;

/// The lifecycle of a task, mirroring the states of its continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, or parked at a suspension point. Eligible for resumption.
    Suspended,
    /// Currently executing on this thread. At most one task at a time.
    Running,
    /// Resumed another task and is waiting for it to suspend or finish.
    Normal,
    /// The body returned or failed; the result lives in the task's promise.
    Dead,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Suspended => "suspended",
            Status::Running => "running",
            Status::Normal => "normal",
            Status::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Object-safe view of a task shared by the scheduler, the suspending
/// primitives, and the cancellation walk. The typed façade is
/// [`Task`](crate::task::Task).
pub(crate) trait RawTask {
    fn id(&self) -> u64;
    fn status(&self) -> Status;
    fn set_status(&self, status: Status);
    fn resume_raw(self: Rc<Self>);
    fn is_cancelled(&self) -> bool;
    fn set_cancel_flag(&self, on: bool);
    fn cancel_raw(self: Rc<Self>, detach_children: bool) -> Result<()>;
    fn add_child(&self, child: Weak<dyn RawTask>);
}

thread_local! {
    // The stack of nested resumes. The top entry is the running task; the
    // ones below it are `Normal`.
    static RUNNING: RefCell<Vec<Rc<dyn RawTask>>> = RefCell::new(Vec::new());
}

pub(crate) fn push_running(task: Rc<dyn RawTask>) {
    RUNNING.with(|stack| stack.borrow_mut().push(task));
}

pub(crate) fn pop_running() {
    RUNNING.with(|stack| {
        stack.borrow_mut().pop();
    });
}

pub(crate) fn current_raw() -> Option<Rc<dyn RawTask>> {
    RUNNING.with(|stack| stack.borrow().last().cloned())
}

/// An untyped handle to a live task.
///
/// This is what [`current`](crate::task::current) hands out: enough surface
/// to inspect and cancel a task without knowing its result type. Typed
/// results stay on [`Task`](crate::task::Task).
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) raw: Rc<dyn RawTask>,
}

impl TaskRef {
    /// A process-unique identifier for the task.
    pub fn id(&self) -> u64 {
        self.raw.id()
    }

    /// The task's current lifecycle state.
    pub fn status(&self) -> Status {
        self.raw.status()
    }

    /// True iff a cancellation signal is pending or was observed.
    pub fn is_cancelled(&self) -> bool {
        self.raw.is_cancelled()
    }

    /// Clears a pending cancellation signal so the task keeps running.
    pub fn unset_cancelled(&self) {
        self.raw.set_cancel_flag(false);
    }

    /// Cancels the task and, transitively, every live child task.
    ///
    /// See [`Task::cancel`](crate::task::Task::cancel) for the full contract.
    pub fn cancel(&self) -> Result<()> {
        self.raw.clone().cancel_raw(false)
    }

    /// Cancels only this task, leaving its children untouched.
    pub fn cancel_detached(&self) -> Result<()> {
        self.raw.clone().cancel_raw(true)
    }

    pub(crate) fn resume(&self) {
        self.raw.clone().resume_raw();
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn RawTask> {
        Rc::downgrade(&self.raw)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &TaskRef) -> bool {
        Rc::ptr_eq(&self.raw, &other.raw)
    }
}

impl Eq for TaskRef {}
