// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Lazy asynchronous pipelines with bounded parallelism.
//!
//! A [`Pipe`] wraps a source of items and a chain of [`map`](Pipe::map)
//! stages. Each stage runs a *runner* task that pulls from upstream and
//! spawns one *worker* task per item; stage policy ([`MapOptions`]) bounds
//! worker concurrency, paces worker starts, times individual items out, and
//! optionally forces emission to follow upstream order. Failed items are
//! filtered out of the stream and recorded; [`report`](Pipe::report) exposes
//! the record and a [`catch`](MapOptions::catch) hook can recover per item.
//!
//! ```
//! use filato::{host::LocalLoop, pipe::{MapOptions, Pipe}};
//! use std::time::Duration;
//!
//! LocalLoop::new().run(|| {
//!     let t = filato::spawn(async {
//!         Pipe::new([3_u64, 2, 1])
//!             .map(
//!                 |n| async move {
//!                     filato::sleep(Duration::from_millis(n * 10)).await?;
//!                     Ok(Some(n * 2))
//!                 },
//!                 MapOptions::new().parallel(2).ordered(true),
//!             )
//!             .to_vec()
//!             .await
//!     });
//!     let out = t
//!         .wait(Duration::from_secs(5), Duration::from_millis(1))
//!         .unwrap();
//!     assert_eq!(out, Ok(vec![6, 4, 2]));
//! });
//! ```

mod stage;

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    rc::Rc,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    sync::Queue,
    task::{spawn, Status, Task},
};

pub use stage::MapOptions;

// Element protocol of a stage's output queue. End-of-stream is its own
// variant, never a magic value.
pub(crate) enum Item<T> {
    Value(T),
    Done,
}

enum Upstream<T> {
    Iter(Box<dyn Iterator<Item = T>>),
    Pull(Box<dyn FnMut() -> Option<T>>),
    Stage(Rc<Queue<Item<T>>>),
}

struct PipeShared<T> {
    upstream: RefCell<Upstream<T>>,
    errors: Rc<RefCell<Vec<Error>>>,
    // The stage's runner; `None` for a source pipe.
    runner: Option<Task<()>>,
}

/// A lazy, asynchronous, composable sequence.
///
/// Cloning a pipe yields another handle onto the same stream; concurrent
/// consumers are served in FIFO order. See the [module docs](self) for the
/// stage model.
pub struct Pipe<T> {
    shared: Rc<PipeShared<T>>,
}

impl<T> Clone for Pipe<T> {
    fn clone(&self) -> Pipe<T> {
        Pipe {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("staged", &self.shared.runner.is_some())
            .field("errors", &self.shared.errors.borrow().len())
            .finish()
    }
}

impl<T: 'static> Pipe<T> {
    fn from_upstream(
        upstream: Upstream<T>,
        errors: Rc<RefCell<Vec<Error>>>,
        runner: Option<Task<()>>,
    ) -> Pipe<T> {
        Pipe {
            shared: Rc::new(PipeShared {
                upstream: RefCell::new(upstream),
                errors,
                runner,
            }),
        }
    }

    /// A pipe over the items of `src`.
    pub fn new<I>(src: I) -> Pipe<T>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
    {
        Pipe::from_upstream(
            Upstream::Iter(Box::new(src.into_iter())),
            Rc::new(RefCell::new(Vec::new())),
            None,
        )
    }

    /// A pipe fed by a pull closure; the stream ends at the first `None`.
    pub fn from_fn(pull: impl FnMut() -> Option<T> + 'static) -> Pipe<T> {
        Pipe::from_upstream(
            Upstream::Pull(Box::new(pull)),
            Rc::new(RefCell::new(Vec::new())),
            None,
        )
    }

    /// Chains a stage that maps every item through `func` under the policy
    /// in `opts`.
    ///
    /// `func` returns `Ok(Some(v))` to emit `v`, `Ok(None)` to filter the
    /// item out, or an error to record it (subject to the stage's
    /// [`catch`](MapOptions::catch) hook). The stage starts pulling from
    /// upstream immediately.
    pub fn map<U, F, Fut>(self, func: F, opts: MapOptions<T, U>) -> Pipe<U>
    where
        T: Clone,
        U: Clone + 'static,
        F: FnMut(T) -> Fut + 'static,
        Fut: Future<Output = Result<Option<U>>> + 'static,
    {
        let errors = self.shared.errors.clone();
        let (queue, runner) = stage::launch(self, func, opts, errors.clone());
        Pipe::from_upstream(Upstream::Stage(queue), errors, Some(runner))
    }

    /// Pulls the next item. `Ok(None)` signals end of stream.
    ///
    /// Suspends while a staged pipe has nothing ready; fails with
    /// `Err(Cancelled)` once the pipe has been [`cancel`](Pipe::cancel)led.
    pub async fn anext(&self) -> Result<Option<T>> {
        let queue = {
            let mut upstream = self.shared.upstream.borrow_mut();
            match &mut *upstream {
                Upstream::Iter(iter) => return Ok(iter.next()),
                Upstream::Pull(pull) => return Ok(pull()),
                Upstream::Stage(queue) => queue.clone(),
            }
        };
        if self.runner_cancelled() {
            return Err(Error::Cancelled);
        }
        match queue.pop().await? {
            Item::Value(value) => Ok(Some(value)),
            Item::Done => {
                // Leave the sentinel in place for other consumers.
                queue.push(Item::Done);
                if self.runner_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Blocking [`anext`](Pipe::anext), legal outside tasks: drives the host
    /// loop until an item (or end of stream) is available. Fails with
    /// `Err(Timeout)` if `timeout` elapses first.
    pub fn next_blocking(&self, timeout: Duration, interval: Duration) -> Result<Option<T>>
    where
        T: Clone,
    {
        let pipe = self.clone();
        let puller = spawn(async move { pipe.anext().await });
        match puller.wait(timeout, interval) {
            Some(result) => result,
            None => {
                let _ = puller.cancel();
                Err(Error::Timeout)
            }
        }
    }

    /// Pulls up to `n` items (stopping early at end of stream). Does not
    /// close the pipe. Panics when `n` is zero.
    pub async fn collect(&self, n: usize) -> Result<Vec<T>> {
        assert!(n >= 1, "`collect` needs a positive item count");
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            match self.anext().await? {
                Some(value) => out.push(value),
                None => break,
            }
        }
        Ok(out)
    }

    /// Pulls up to `n` items, then cancels the pipe. Panics when `n` is
    /// zero.
    pub async fn race(&self, n: usize) -> Result<Vec<T>> {
        assert!(n >= 1, "`race` needs a positive item count");
        let out = self.collect(n).await?;
        self.cancel();
        Ok(out)
    }

    /// Maps every item through `func` and drains the result to end of
    /// stream.
    pub async fn each<U, F, Fut>(self, func: F, opts: MapOptions<T, U>) -> Result<()>
    where
        T: Clone,
        U: Clone + 'static,
        F: FnMut(T) -> Fut + 'static,
        Fut: Future<Output = Result<Option<U>>> + 'static,
    {
        let staged = self.map(func, opts);
        while staged.anext().await?.is_some() {}
        Ok(())
    }

    /// Drains the pipe, left-folding the items into an accumulator.
    pub async fn fold<A>(&self, init: A, mut f: impl FnMut(A, T) -> A) -> Result<A> {
        let mut acc = init;
        while let Some(value) = self.anext().await? {
            acc = f(acc, value);
        }
        Ok(acc)
    }

    /// True iff `pred` holds for every item. Drains the whole stream even
    /// after a counterexample.
    pub async fn all(&self, mut pred: impl FnMut(&T) -> bool) -> Result<bool> {
        let mut holds = true;
        while let Some(value) = self.anext().await? {
            if !pred(&value) {
                holds = false;
            }
        }
        Ok(holds)
    }

    /// True iff `pred` holds for some item; the pipe is cancelled as soon as
    /// one is found.
    pub async fn any(&self, mut pred: impl FnMut(&T) -> bool) -> Result<bool> {
        while let Some(value) = self.anext().await? {
            if pred(&value) {
                self.cancel();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drains the pipe into a `Vec`.
    pub async fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(value) = self.anext().await? {
            out.push(value);
        }
        Ok(out)
    }

    /// The errors recorded along the whole stage chain so far, oldest first;
    /// `None` when the chain is clean.
    pub fn report(&self) -> Option<Vec<Error>> {
        let errors = self.shared.errors.borrow();
        if errors.is_empty() {
            None
        } else {
            Some(errors.clone())
        }
    }

    /// Suspends until this stage's runner has finished. Does not close the
    /// pipe; immediate on a source pipe.
    pub async fn join(&self) -> Result<()> {
        match &self.shared.runner {
            Some(runner) => runner.join().await,
            None => Ok(()),
        }
    }

    /// Blocks until this stage's runner has finished, driving the host loop.
    /// Returns `None` on timeout.
    pub fn wait(&self, timeout: Duration, interval: Duration) -> Option<Result<()>> {
        match &self.shared.runner {
            Some(runner) => runner.wait(timeout, interval),
            None => Some(Ok(())),
        }
    }

    /// Cancels this stage's runner; structured cancellation tears down its
    /// workers in turn. A no-op on a source pipe.
    pub fn cancel(&self) {
        let Some(runner) = &self.shared.runner else { return };
        // A consumer resumed by the runner's own push finds the runner live
        // on the resume stack below it; only a parked runner is cancelled.
        // A dead runner has nothing left to tear down either way.
        if runner.status() == Status::Suspended {
            if let Err(err) = runner.cancel() {
                log::debug!("pipe runner not cancelled: {}", err);
            }
        }
        // Wake any consumer parked on the output queue so it observes the
        // cancellation.
        if let Upstream::Stage(queue) = &*self.shared.upstream.borrow() {
            queue.push(Item::Done);
        }
    }

    fn runner_cancelled(&self) -> bool {
        self.shared
            .runner
            .as_ref()
            .map_or(false, |runner| runner.is_cancelled())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{host::LocalLoop, timer::sleep};
    use enclose::enclose;
    use std::{
        cell::Cell,
        time::{Duration, Instant},
    };

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn unordered_map_emits_in_completion_order() {
        test_loop!(async {
            let out = Pipe::new([3_u64, 1, 2])
                .map(
                    |n| async move {
                        sleep(ms(n * 20)).await?;
                        Ok(Some(n * 2))
                    },
                    MapOptions::new(),
                )
                .to_vec()
                .await?;
            assert_eq!(out, vec![2, 4, 6]);
            Ok(())
        });
    }

    #[test]
    fn ordered_parallel_map_follows_input_order() {
        test_loop!(async {
            let pipe = Pipe::new([3_u64, 2, 1]).map(
                |n| async move {
                    sleep(ms(n * 20)).await?;
                    Ok(Some(n * 2))
                },
                MapOptions::new().ordered(true).parallel(2),
            );
            let out = pipe.to_vec().await?;
            assert_eq!(out, vec![6, 4, 2]);
            assert_eq!(pipe.report(), None);
            Ok(())
        });
    }

    #[test]
    fn parallel_bounds_inflight_workers() {
        test_loop!(async {
            let live = Rc::new(Cell::new(0_u32));
            let peak = Rc::new(Cell::new(0_u32));
            Pipe::new(0..5_u32)
                .map(
                    enclose! { (live, peak) move |_| enclose! { (live, peak) async move {
                        live.set(live.get() + 1);
                        peak.set(peak.get().max(live.get()));
                        sleep(ms(10)).await?;
                        live.set(live.get() - 1);
                        Ok(Some(()))
                    }}},
                    MapOptions::new().parallel(2),
                )
                .to_vec()
                .await?;
            assert_eq!(peak.get(), 2);
            Ok(())
        });
    }

    #[test]
    fn throttle_paces_worker_starts() {
        test_loop!(async {
            let starts = Rc::new(RefCell::new(Vec::new()));
            Pipe::new(0..3_u32)
                .map(
                    enclose! { (starts) move |_| enclose! { (starts) async move {
                        starts.borrow_mut().push(Instant::now());
                        Ok(Some(()))
                    }}},
                    MapOptions::new().throttle(ms(20)),
                )
                .to_vec()
                .await?;
            let starts = starts.borrow();
            assert_eq!(starts.len(), 3);
            for pair in starts.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(gap >= ms(15), "workers started only {:?} apart", gap);
            }
            Ok(())
        });
    }

    #[test]
    fn timeout_cancels_the_worker_and_is_reported() {
        test_loop!(async {
            let pipe = Pipe::new([1_u64, 10, 2]).map(
                |n| async move {
                    sleep(ms(n * 10)).await?;
                    Ok(Some(n * 2))
                },
                MapOptions::new().timeout(ms(50)),
            );
            let out = pipe.to_vec().await?;
            assert_eq!(out, vec![2, 4]);
            assert_eq!(pipe.report(), Some(vec![Error::Timeout]));
            Ok(())
        });
    }

    #[test]
    fn catch_replaces_errors_and_recovers_items() {
        test_loop!(async {
            let pipe = Pipe::new([1_u32, 3, 2, 1]).map(
                |n| async move {
                    if n > 1 {
                        return Err(Error::fail(n.to_string()));
                    }
                    Ok(Some(n * 2))
                },
                MapOptions::<u32, u32>::new().catch(|err, n| {
                    Err(Error::fail(format!("{} is too big by {}", err, n - 1)))
                }),
            );
            let out = pipe.to_vec().await?;
            assert_eq!(out, vec![2, 2]);
            let report = pipe.report().unwrap();
            assert_eq!(report.len(), 2);
            assert!(report.contains(&Error::Fail("3 is too big by 2".to_string())));
            assert!(report.contains(&Error::Fail("2 is too big by 1".to_string())));
            Ok(())
        });
    }

    #[test]
    fn catch_can_substitute_a_value_or_filter() {
        test_loop!(async {
            let pipe = Pipe::new(1..=4_u32).map(
                |n| async move {
                    if n % 2 == 0 {
                        return Err(Error::fail("even"));
                    }
                    Ok(Some(n))
                },
                MapOptions::new().catch(|_, n| if *n == 2 { Ok(Some(99)) } else { Ok(None) }),
            );
            let out = pipe.to_vec().await?;
            assert_eq!(out, vec![1, 99, 3]);
            // Both failures were recovered, so the chain is clean.
            assert_eq!(pipe.report(), None);
            Ok(())
        });
    }

    #[test]
    fn none_results_filter_items_out() {
        test_loop!(async {
            let out = Pipe::new(1..=6_u32)
                .map(
                    |n| async move { Ok((n % 2 == 0).then_some(n)) },
                    MapOptions::new(),
                )
                .to_vec()
                .await?;
            assert_eq!(out, vec![2, 4, 6]);
            Ok(())
        });
    }

    #[test]
    fn chained_stages_share_one_report() {
        test_loop!(async {
            let pipe = Pipe::new(1..=3_u32)
                .map(
                    |n| async move {
                        if n == 1 {
                            return Err(Error::fail("first"));
                        }
                        Ok(Some(n))
                    },
                    MapOptions::new(),
                )
                .map(
                    |n| async move {
                        if n == 3 {
                            return Err(Error::fail("second"));
                        }
                        Ok(Some(n * 10))
                    },
                    MapOptions::new(),
                );
            let out = pipe.to_vec().await?;
            assert_eq!(out, vec![20]);
            let report = pipe.report().unwrap();
            assert!(report.contains(&Error::Fail("first".to_string())));
            assert!(report.contains(&Error::Fail("second".to_string())));
            Ok(())
        });
    }

    #[test]
    fn fold_and_all_drain_the_stream() {
        test_loop!(async {
            let sum = Pipe::new(1..=4_u32).fold(0, |acc, n| acc + n).await?;
            assert_eq!(sum, 10);

            let seen = Rc::new(Cell::new(0_u32));
            let pipe = Pipe::new(1..=4_u32).map(
                enclose! { (seen) move |n| enclose! { (seen) async move {
                    seen.set(seen.get() + 1);
                    Ok(Some(n))
                }}},
                MapOptions::new(),
            );
            let holds = pipe.all(|n| *n == 1).await?;
            assert!(!holds);
            // `all` keeps draining after the counterexample.
            assert_eq!(seen.get(), 4);
            Ok(())
        });
    }

    #[test]
    fn any_cancels_the_pipe_after_a_hit() {
        test_loop!(async {
            let mut n = 0_u32;
            let pipe = Pipe::from_fn(move || {
                n += 1;
                // Enough items that the stage is still busy when the hit
                // arrives.
                (n <= 100).then_some(n)
            })
            .map(
                |n| async move {
                    sleep(ms(1)).await?;
                    Ok(Some(n))
                },
                MapOptions::new().parallel(1),
            );
            let hit = pipe.any(|n| *n == 3).await?;
            assert!(hit);
            assert_eq!(pipe.anext().await, Err(Error::Cancelled));
            Ok(())
        });
    }

    #[test]
    fn race_takes_n_and_cancels() {
        test_loop!(async {
            let pipe = Pipe::new(1..=100_u32).map(
                |n| async move {
                    sleep(ms(1)).await?;
                    Ok(Some(n))
                },
                MapOptions::new().parallel(1).ordered(true),
            );
            let out = pipe.race(2).await?;
            assert_eq!(out, vec![1, 2]);
            assert!(pipe.anext().await.is_err());
            Ok(())
        });
    }

    #[test]
    fn each_processes_every_item() {
        test_loop!(async {
            let seen = Rc::new(RefCell::new(Vec::new()));
            Pipe::new([5_u32, 6, 7])
                .each(
                    enclose! { (seen) move |n| enclose! { (seen) async move {
                        seen.borrow_mut().push(n);
                        Ok(Some(()))
                    }}},
                    MapOptions::new().ordered(true),
                )
                .await?;
            assert_eq!(*seen.borrow(), vec![5, 6, 7]);
            Ok(())
        });
    }

    #[test]
    fn collect_does_not_close_the_pipe() {
        test_loop!(async {
            let pipe = Pipe::new(1..=4_u32).map(
                |n| async move { Ok(Some(n)) },
                MapOptions::new().ordered(true),
            );
            assert_eq!(pipe.collect(2).await?, vec![1, 2]);
            assert_eq!(pipe.collect(5).await?, vec![3, 4]);
            // End of stream is sticky.
            assert_eq!(pipe.anext().await?, None);
            Ok(())
        });
    }

    #[test]
    #[should_panic(expected = "positive item count")]
    fn collect_zero_is_rejected() {
        test_loop!(async {
            let pipe = Pipe::new(1..=3_u32);
            let _ = pipe.collect(0).await;
            Ok(())
        });
    }

    #[test]
    fn next_blocking_pulls_from_the_main_context() {
        LocalLoop::new().run(|| {
            let pipe = Pipe::new([7_u32]).map(
                |n| async move {
                    sleep(ms(5)).await?;
                    Ok(Some(n))
                },
                MapOptions::new(),
            );
            assert_eq!(pipe.next_blocking(ms(5000), ms(1)), Ok(Some(7)));
            assert_eq!(pipe.next_blocking(ms(5000), ms(1)), Ok(None));
        });
    }

    #[test]
    fn wait_and_join_leave_the_pipe_open() {
        test_loop!(async {
            let pipe = Pipe::new(1..=3_u32).map(
                |n| async move { Ok(Some(n)) },
                MapOptions::new().ordered(true),
            );
            pipe.join().await?;
            // The runner is done, but the buffered output is still there.
            assert_eq!(pipe.to_vec().await?, vec![1, 2, 3]);
            Ok(())
        });
    }
}
