// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Waiting on heterogeneous sets of tasks and promises.

use std::{cell::Cell, rc::Rc};

use scopeguard::defer;

use crate::{
    error::Result,
    promise::Promise,
    task::{
        self,
        state::{self, Status},
        Task,
    },
};

/// A completion that can be observed: the capability shared by [`Task`] and
/// [`Promise`]. [`wait_all`] and [`wait_any`] accept any mix of the two.
pub trait Awaitable {
    /// True once the outcome is settled.
    fn is_done(&self) -> bool;

    /// Registers `f` to run at settlement; runs it immediately if already
    /// settled.
    fn on_done_boxed(&self, f: Box<dyn FnOnce()>);
}

impl<T: 'static> Awaitable for Promise<T> {
    fn is_done(&self) -> bool {
        Promise::is_done(self)
    }

    fn on_done_boxed(&self, f: Box<dyn FnOnce()>) {
        self.on_done(move |_| f());
    }
}

impl<T: 'static> Awaitable for Task<T> {
    fn is_done(&self) -> bool {
        Task::is_done(self)
    }

    fn on_done_boxed(&self, f: Box<dyn FnOnce()>) {
        self.promise().on_done(move |_| f());
    }
}

// One resume hook shared by the combinators below: fires at most once, and
// only while the registering call is still parked.
fn resume_hook(armed: &Rc<Cell<bool>>, before: impl Fn() + 'static) -> Box<dyn FnOnce()> {
    let armed = armed.clone();
    let task = state::current_raw().map(|t| std::rc::Rc::downgrade(&t));
    Box::new(move || {
        if !armed.get() {
            return;
        }
        before();
        if let Some(task) = task.as_ref().and_then(std::rc::Weak::upgrade) {
            if task.status() == Status::Suspended {
                task.resume_raw();
            }
        }
    })
}

/// Suspends the current task until every entry has settled.
///
/// Outcomes are not collected here; read them from each task or promise
/// afterwards. Waiting on an empty set is a programming error and panics,
/// as does calling this outside a task.
pub async fn wait_all(items: &[&dyn Awaitable]) -> Result<()> {
    if items.is_empty() {
        panic!("`wait_all` called with an empty set of awaitables");
    }
    if state::current_raw().is_none() {
        panic!("`wait_all` must be called from within a task");
    }
    let pending = Rc::new(Cell::new(0_usize));
    let armed = Rc::new(Cell::new(true));
    let disarm = armed.clone();
    defer! {
        disarm.set(false);
    }
    for item in items {
        if item.is_done() {
            continue;
        }
        pending.set(pending.get() + 1);
        let pending = pending.clone();
        item.on_done_boxed(resume_hook(&armed, move || {
            pending.set(pending.get() - 1);
        }));
    }
    while pending.get() > 0 {
        task::suspend().await?;
    }
    Ok(())
}

/// Suspends the current task until one entry settles, returning its index.
///
/// Entries that were already settled win immediately, lowest index first.
/// Panics on an empty set and when called outside a task.
pub async fn wait_any(items: &[&dyn Awaitable]) -> Result<usize> {
    if items.is_empty() {
        panic!("`wait_any` called with an empty set of awaitables");
    }
    if state::current_raw().is_none() {
        panic!("`wait_any` must be called from within a task");
    }
    if let Some(idx) = items.iter().position(|item| item.is_done()) {
        return Ok(idx);
    }
    let winner = Rc::new(Cell::new(None));
    let armed = Rc::new(Cell::new(true));
    let disarm = armed.clone();
    defer! {
        disarm.set(false);
    }
    for (idx, item) in items.iter().enumerate() {
        let winner = winner.clone();
        item.on_done_boxed(resume_hook(&armed, move || {
            if winner.get().is_none() {
                winner.set(Some(idx));
            }
        }));
    }
    loop {
        task::suspend().await?;
        if let Some(idx) = winner.get() {
            return Ok(idx);
        }
    }
}
