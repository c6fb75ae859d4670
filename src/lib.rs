// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020
// Datadog, Inc.
//
//! # Filato - cooperative tasks and asynchronous pipelines for single-threaded hosts.
//!
//! ## What is Filato
//!
//! Filato is a library for expressing long-running, I/O-bound work as ordinary
//! straight-line `async` code inside a *single-threaded* host process that owns
//! the event loop - an editor, a REPL, a plugin sandbox. The host stays in
//! charge: it provides timers, a way to schedule closures at a safe point, and
//! a notion of restricted "fast event" contexts; Filato provides cooperative
//! tasks on top of exactly that surface, plus an asynchronous pipeline engine
//! for fan-out work.
//!
//! There are no threads here, and that is the point. At most one task runs at
//! any instant; a task leaves the CPU only at an explicit suspension point;
//! everything else in the process observes ordinary sequential memory. This
//! buys the same property that makes thread-per-core designs pleasant: no
//! locks, no atomics, no data races by construction.
//!
//! ## Tasks
//!
//! A task wraps a future and is driven by explicit resumes: primitives hand
//! values (and permits, and timer expiries) directly to the task waiting for
//! them and resume it on the spot. Every task carries a [`Promise`] with its
//! outcome, a cancel flag, and the set of tasks it spawned:
//!
//! ```
//! use filato::host::LocalLoop;
//! use std::time::Duration;
//!
//! LocalLoop::new().run(|| {
//!     let t = filato::spawn(async {
//!         filato::sleep(Duration::from_millis(15)).await?;
//!         Ok(42)
//!     });
//!     let out = t
//!         .wait(Duration::from_millis(100), Duration::from_millis(2))
//!         .unwrap();
//!     assert_eq!(out, Ok(42));
//! });
//! ```
//!
//! Cancellation is a cooperative, structured signal: [`Task::cancel`] resumes
//! the target so its next suspension point reports `Err(Cancelled)`, unwinding
//! the body unless it intercepts the signal with
//! [`task::unset_cancelled`]; the tasks it spawned are then cancelled the same
//! way. External resources are released on the way out by the adapter hooks of
//! [`task::from_callback_with`].
//!
//! ## Pipelines
//!
//! [`Pipe`] chains asynchronous `map` stages over a source of items, with
//! per-stage parallelism limits, start throttling, per-item timeouts, ordered
//! emission, and an error-recovery hook:
//!
//! ```
//! use filato::{host::LocalLoop, pipe::{MapOptions, Pipe}};
//! use std::time::Duration;
//!
//! LocalLoop::new().run(|| {
//!     let t = filato::spawn(async {
//!         Pipe::new(1..=4_u32)
//!             .map(
//!                 |n| async move { Ok((n % 2 == 0).then_some(n * 10)) },
//!                 MapOptions::new(),
//!             )
//!             .to_vec()
//!             .await
//!     });
//!     let out = t
//!         .wait(Duration::from_secs(1), Duration::from_millis(1))
//!         .unwrap();
//!     assert_eq!(out, Ok(vec![20, 40]));
//! });
//! ```
//!
//! ## The host contract
//!
//! Filato consumes four capabilities from its embedder, collected in the
//! [`host::Host`] trait: `schedule` (run a closure at the next safe point),
//! `in_fast_event` (is the current context restricted?), `blocking_wait`
//! (run the loop until a predicate holds), and one-shot timers. The built-in
//! [`host::LocalLoop`] implements the contract for tests and standalone use;
//! an editor embedding binds the trait to its own loop.
//!
//! ## Prior work
//!
//! The task model follows the cooperative scheduling tradition of
//! thread-per-core runtimes; the explicit-resume discipline and the direct
//! handoff in the queue and semaphore mirror how such runtimes keep waiters
//! fair without helper threads.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

// Stands up a LocalLoop, runs the future as a task, and fails the test if it
// does not finish cleanly within five seconds. Mostly useful for tests.
#[cfg(test)]
macro_rules! test_loop {
    ($fut:expr) => {{
        let lp = crate::host::LocalLoop::new();
        lp.run(|| {
            let t = crate::task::spawn($fut);
            let out = t
                .wait(
                    std::time::Duration::from_secs(5),
                    std::time::Duration::from_millis(1),
                )
                .expect("test timed out");
            out.expect("test task failed");
        });
    }};
}

mod error;
pub mod host;
pub mod pipe;
mod promise;
pub mod sync;
pub mod task;
mod timer;

pub use crate::error::{Error, Result};
pub use crate::pipe::Pipe;
pub use crate::promise::Promise;
pub use crate::task::{spawn, Status, Task, TaskRef};
pub use crate::timer::sleep;
pub use enclose::enclose;

/// Common imports that almost all Filato applications will need.
pub mod prelude {
    pub use crate::host::LocalLoop;
    pub use crate::pipe::{MapOptions, Pipe};
    pub use crate::task::{current, in_main, pcall, spawn, suspend};
    pub use crate::{sleep, Error, Promise, Result, Status, Task};
}
