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

struct PopWaiter<T> {
    task: Rc<dyn RawTask>,
    slot: RefCell<Option<T>>,
    // Flipped off when the waiter is served or unwinds; stale entries are
    // skipped lazily by `push`.
    linked: Cell<bool>,
}

struct QueueState<T> {
    values: VecDeque<T>,
    waiting: VecDeque<Rc<PopWaiter<T>>>,
}

/// An unbounded FIFO whose `pop` suspends the current task while empty.
///
/// `push` never blocks: with a task parked in [`pop`](Queue::pop) the value
/// is handed to it directly and the task is resumed immediately; otherwise
/// the value is enqueued. Consequently a value never sits in the buffer
/// while a consumer waits.
///
/// # Examples
///
/// ```
/// use filato::{host::LocalLoop, sync::Queue};
/// use std::{rc::Rc, time::Duration};
///
/// LocalLoop::new().run(|| {
///     let q = Rc::new(Queue::new());
///     let t = filato::spawn({
///         let q = q.clone();
///         async move {
///             let a = q.pop().await?;
///             let b = q.pop().await?;
///             Ok(a + b)
///         }
///     });
///     q.push(3);
///     q.push(4);
///     let sum = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(sum, Ok(7));
/// });
/// ```
pub struct Queue<T> {
    state: RefCell<QueueState<T>>,
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Queue")
            .field("values", &state.values.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

impl<T: 'static> Default for Queue<T> {
    fn default() -> Queue<T> {
        Queue::new()
    }
}

impl<T: 'static> Queue<T> {
    /// Creates an empty queue.
    pub fn new() -> Queue<T> {
        Queue {
            state: RefCell::new(QueueState {
                values: VecDeque::new(),
                waiting: VecDeque::new(),
            }),
        }
    }

    /// Appends a value, or hands it straight to the longest-waiting task and
    /// resumes it.
    pub fn push(&self, value: T) {
        let waiter = {
            let mut state = self.state.borrow_mut();
            loop {
                match state.waiting.pop_front() {
                    Some(waiter) if !waiter.linked.get() => continue,
                    other => break other,
                }
            }
        };
        match waiter {
            Some(waiter) => {
                waiter.linked.set(false);
                *waiter.slot.borrow_mut() = Some(value);
                waiter.task.clone().resume_raw();
            }
            None => self.state.borrow_mut().values.push_back(value),
        }
    }

    /// Removes the value at the head of the queue, suspending while empty.
    ///
    /// Cancellation of the waiting task surfaces as `Err(Cancelled)` and
    /// removes it from the waiter list. Must be called from within a task
    /// when the queue is empty.
    pub async fn pop(&self) -> Result<T> {
        let waiter = {
            let mut state = self.state.borrow_mut();
            if let Some(value) = state.values.pop_front() {
                return Ok(value);
            }
            let task = state::current_raw().unwrap_or_else(|| {
                panic!("`Queue::pop` on an empty queue must be called from within a task")
            });
            let waiter = Rc::new(PopWaiter {
                task,
                slot: RefCell::new(None),
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
            task::suspend().await?;
            if let Some(value) = waiter.slot.borrow_mut().take() {
                return Ok(value);
            }
        }
    }

    /// Removes the head value without suspending; `None` while empty.
    pub fn try_pop(&self) -> Option<T> {
        self.state.borrow_mut().values.pop_front()
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.state.borrow().values.len()
    }

    /// True iff no values are buffered.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().values.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::Error, host::LocalLoop, task::spawn, timer::sleep};
    use enclose::enclose;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn values_come_out_in_push_order() {
        LocalLoop::new().run(|| {
            let q = Rc::new(Queue::new());
            for i in 0..4 {
                q.push(i);
            }
            let t = spawn(enclose! { (q) async move {
                let mut out = Vec::new();
                for _ in 0..4 {
                    out.push(q.pop().await?);
                }
                Ok(out)
            }});
            assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Ok(vec![0, 1, 2, 3]));
        });
    }

    #[test]
    fn push_resumes_the_longest_waiting_task() {
        LocalLoop::new().run(|| {
            let q = Rc::new(Queue::new());
            let order = Rc::new(RefCell::new(Vec::new()));
            let ts: Vec<_> = (0..3)
                .map(|i| {
                    spawn(enclose! { (q, order) async move {
                        let v = q.pop().await?;
                        order.borrow_mut().push((i, v));
                        Ok(())
                    }})
                })
                .collect();
            for v in ["a", "b", "c"] {
                q.push(v);
            }
            for t in &ts {
                assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Ok(()));
            }
            assert_eq!(*order.borrow(), vec![(0, "a"), (1, "b"), (2, "c")]);
        });
    }

    #[test]
    fn waiters_never_coexist_with_values() {
        LocalLoop::new().run(|| {
            let q: Rc<Queue<u8>> = Rc::new(Queue::new());
            let t = spawn(enclose! { (q) async move { q.pop().await }});
            assert!(!t.is_done());
            q.push(1);
            // The handoff was direct; nothing was buffered.
            assert!(q.is_empty());
            assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Ok(1));
        });
    }

    #[test]
    fn cancelled_pop_leaves_the_queue_usable() {
        LocalLoop::new().run(|| {
            let q: Rc<Queue<u8>> = Rc::new(Queue::new());
            let doomed = spawn(enclose! { (q) async move { q.pop().await }});
            let survivor = spawn(enclose! { (q) async move {
                sleep(ms(2)).await?;
                q.pop().await
            }});
            doomed.cancel().unwrap();
            assert_eq!(doomed.wait(ms(100), ms(1)).unwrap(), Err(Error::Cancelled));
            q.push(9);
            // The value skips the cancelled waiter's stale entry.
            assert_eq!(survivor.wait(ms(5000), ms(1)).unwrap(), Ok(9));
        });
    }
}
