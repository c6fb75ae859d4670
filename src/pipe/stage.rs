// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The map-stage engine: one runner task drains the upstream pipe and fans
//! out one worker task per item, under the stage's concurrency policy.

use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    time::{Duration, Instant},
};

use enclose::enclose;
use scopeguard::ScopeGuard;

use crate::{
    error::{panic_message, Error, Result},
    sync::{Queue, Semaphore},
    task::{self, spawn, Status, Task},
    timer::sleep,
};

use super::{Item, Pipe};

type CatchFn<T, U> = Box<dyn FnMut(Error, &T) -> Result<Option<U>>>;

/// Per-stage policy for [`Pipe::map`].
///
/// All knobs are off by default: workers run unbounded, unpaced, untimed,
/// and emit in completion order.
pub struct MapOptions<T, U> {
    pub(crate) timeout: Option<Duration>,
    pub(crate) parallel: Option<u64>,
    pub(crate) throttle: Option<Duration>,
    pub(crate) ordered: bool,
    pub(crate) catch: Option<CatchFn<T, U>>,
}

impl<T, U> fmt::Debug for MapOptions<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapOptions")
            .field("timeout", &self.timeout)
            .field("parallel", &self.parallel)
            .field("throttle", &self.throttle)
            .field("ordered", &self.ordered)
            .field("catch", &self.catch.is_some())
            .finish()
    }
}

impl<T, U> Default for MapOptions<T, U> {
    fn default() -> MapOptions<T, U> {
        MapOptions::new()
    }
}

impl<T, U> MapOptions<T, U> {
    /// Options with every knob at its default.
    pub fn new() -> MapOptions<T, U> {
        MapOptions {
            timeout: None,
            parallel: None,
            throttle: None,
            ordered: false,
            catch: None,
        }
    }

    /// Per-item time limit. A worker exceeding it is cancelled and the stage
    /// records [`Error::Timeout`] for the item.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Maximum number of concurrently running workers.
    pub fn parallel(mut self, workers: u64) -> Self {
        self.parallel = Some(workers);
        self
    }

    /// Minimum gap between worker starts. Paces starts, not completions.
    pub fn throttle(mut self, gap: Duration) -> Self {
        self.throttle = Some(gap);
        self
    }

    /// Emit results in upstream order instead of completion order.
    pub fn ordered(mut self, on: bool) -> Self {
        self.ordered = on;
        self
    }

    /// Failure hook, invoked with the error and the item's input.
    ///
    /// Returning `Ok(Some(v))` emits `v` in place of the failed result;
    /// `Ok(None)` suppresses the error and filters the item; an error return
    /// replaces the recorded error.
    pub fn catch(mut self, f: impl FnMut(Error, &T) -> Result<Option<U>> + 'static) -> Self {
        self.catch = Some(Box::new(f));
        self
    }
}

// Everything a worker shares with its siblings and the runner.
struct StageCx<T, U, F> {
    func: Rc<RefCell<F>>,
    catch: Option<Rc<RefCell<CatchFn<T, U>>>>,
    sem: Rc<Semaphore>,
    out: Rc<Queue<Item<U>>>,
    workers: Rc<RefCell<Vec<Task<()>>>>,
    errors: Rc<RefCell<Vec<Error>>>,
    timeout: Option<Duration>,
    throttle: Option<Duration>,
    next_start: Rc<Cell<Instant>>,
    ordered: bool,
}

impl<T, U, F> Clone for StageCx<T, U, F> {
    fn clone(&self) -> Self {
        StageCx {
            func: self.func.clone(),
            catch: self.catch.clone(),
            sem: self.sem.clone(),
            out: self.out.clone(),
            workers: self.workers.clone(),
            errors: self.errors.clone(),
            timeout: self.timeout,
            throttle: self.throttle,
            next_start: self.next_start.clone(),
            ordered: self.ordered,
        }
    }
}

pub(crate) fn launch<T, U, F, Fut>(
    upstream: Pipe<T>,
    func: F,
    opts: MapOptions<T, U>,
    errors: Rc<RefCell<Vec<Error>>>,
) -> (Rc<Queue<Item<U>>>, Task<()>)
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnMut(T) -> Fut + 'static,
    Fut: Future<Output = Result<Option<U>>> + 'static,
{
    let cx = StageCx {
        func: Rc::new(RefCell::new(func)),
        catch: opts.catch.map(|f| Rc::new(RefCell::new(f))),
        sem: Rc::new(Semaphore::new(opts.parallel.unwrap_or(u64::MAX))),
        out: Rc::new(Queue::new()),
        workers: Rc::new(RefCell::new(Vec::new())),
        errors,
        timeout: opts.timeout,
        throttle: opts.throttle.filter(|gap| !gap.is_zero()),
        next_start: Rc::new(Cell::new(Instant::now())),
        ordered: opts.ordered,
    };
    let out = cx.out.clone();
    let runner = spawn(enclose! { (cx) async move {
        let mut index = 0_usize;
        loop {
            let Some(input) = upstream.anext().await? else { break };
            let worker = spawn(run_worker(cx.clone(), index, input));
            cx.workers.borrow_mut().push(worker);
            index += 1;
        }
        // Every worker settles before the end-of-stream marker goes out.
        let mut joined = 0;
        loop {
            let worker = cx.workers.borrow().get(joined).cloned();
            let Some(worker) = worker else { break };
            let _ = worker.join().await;
            if task::is_cancelled() {
                // Torn down mid-drain; the cascade reaches the workers next.
                return Err(Error::Cancelled);
            }
            joined += 1;
        }
        cx.out.push(Item::Done);
        Ok(())
    }});
    (out, runner)
}

async fn run_worker<T, U, F, Fut>(cx: StageCx<T, U, F>, index: usize, input: T) -> Result<()>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: FnMut(T) -> Fut + 'static,
    Fut: Future<Output = Result<Option<U>>> + 'static,
{
    cx.sem.acquire().await?;
    // Give the permit back even if cancellation unwinds us below.
    let permit = scopeguard::guard(cx.sem.clone(), |sem| sem.release());

    if let Some(gap) = cx.throttle {
        let now = Instant::now();
        let at = cx.next_start.get();
        cx.next_start.set(at + gap);
        let delay = at.saturating_duration_since(now);
        if !delay.is_zero() {
            sleep(delay).await?;
        }
    }

    // The input is only retained when a failure hook may want it back.
    let kept = cx.catch.as_ref().map(|_| input.clone());
    let user = {
        let mut func = cx.func.borrow_mut();
        let fut = (&mut *func)(input);
        drop(func);
        spawn(fut)
    };
    let timed_out = Rc::new(Cell::new(false));
    let watchdog = cx.timeout.map(|limit| {
        spawn(enclose! { (user, timed_out) async move {
            sleep(limit).await?;
            if !user.is_done() {
                timed_out.set(true);
                let _ = user.cancel();
            }
            Ok(())
        }})
    });

    let mut outcome = user.join().await;
    if task::is_cancelled() {
        // The stage itself is being torn down; do not record anything.
        return Err(Error::Cancelled);
    }
    if let Some(dog) = watchdog {
        // On expiry the watchdog is the task that resumed us and is still on
        // the resume stack below; only a parked watchdog gets cancelled.
        if dog.status() == Status::Suspended {
            let _ = dog.cancel();
        }
    }
    if let (Err(err), Some(catch)) = (&outcome, &cx.catch) {
        let err = err.clone();
        let input = kept.as_ref().expect("kept alongside the failure hook");
        outcome = match panic::catch_unwind(AssertUnwindSafe(|| {
            let mut hook = catch.borrow_mut();
            (&mut *hook)(err, input)
        })) {
            Ok(replaced) => replaced,
            Err(payload) => Err(Error::Panicked(panic_message(payload))),
        };
    }

    // The permit covers the user function only; an ordered wait below must
    // not hold up the stage's concurrency budget.
    ScopeGuard::into_inner(permit).release();

    if timed_out.get() {
        log::debug!("pipe stage item {} timed out", index);
        cx.errors.borrow_mut().push(Error::Timeout);
        return Ok(());
    }
    let value = match outcome {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(()),
        Err(err) => {
            log::debug!("pipe stage item {} failed: {}", index, err);
            cx.errors.borrow_mut().push(err);
            return Ok(());
        }
    };
    if cx.ordered && index > 0 {
        // The previous item's worker pushes before it dies, so waiting for
        // it chains emissions into upstream order.
        let prev = cx.workers.borrow().get(index - 1).cloned();
        if let Some(prev) = prev {
            let _ = prev.join().await;
        }
        if task::is_cancelled() {
            return Err(Error::Cancelled);
        }
    }
    cx.out.push(Item::Value(value));
    Ok(())
}
