// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Synchronization primitives whose blocking operations suspend the current
//! task: an unbounded FIFO [`Queue`] and a counting FIFO [`Semaphore`].
//!
//! Both are single-threaded by construction. Waiters are served strictly in
//! arrival order, and handoff is direct: a pushed value or released permit
//! goes straight to the head waiter, which is resumed on the spot.

mod queue;
mod semaphore;

pub use queue::Queue;
pub use semaphore::Semaphore;
