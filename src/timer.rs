// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Suspending sleeps built on the host's one-shot timers.

use std::{cell::Cell, rc::Rc, time::Duration};

use scopeguard::defer;

use crate::{
    error::Result,
    host,
    task::{
        self,
        state::{self, Status},
    },
};

/// Suspends the current task for at least `dur`.
///
/// The wakeup comes from a host timer, so the task resumes in whatever
/// context the host fires timers in; follow up with
/// [`sleep_until_nonfast`](crate::task::sleep_until_nonfast) if safe context
/// is needed. Cancelling the sleeping task disarms the timer and surfaces
/// as `Err(Cancelled)` here.
///
/// # Examples
///
/// ```
/// use filato::host::LocalLoop;
/// use std::time::{Duration, Instant};
///
/// LocalLoop::new().run(|| {
///     let t = filato::spawn(async {
///         let start = Instant::now();
///         filato::sleep(Duration::from_millis(10)).await?;
///         Ok(start.elapsed() >= Duration::from_millis(10))
///     });
///     let slept = t
///         .wait(Duration::from_secs(1), Duration::from_millis(1))
///         .unwrap();
///     assert_eq!(slept, Ok(true));
/// });
/// ```
pub async fn sleep(dur: Duration) -> Result<()> {
    let me = state::current_raw()
        .unwrap_or_else(|| panic!("`sleep` must be called from within a task"));
    let host = host::current();
    let armed = Rc::new(Cell::new(true));
    let weak = Rc::downgrade(&me);
    drop(me);
    let id = host.start_timer(
        dur,
        Box::new({
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
        }),
    );
    // If we unwind before the timer fires, the host must forget about it.
    let disarm = armed.clone();
    defer! {
        if disarm.replace(false) {
            host.stop_timer(id);
        }
    }
    loop {
        task::suspend().await?;
        if !armed.get() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::Error, host::LocalLoop, task::spawn};
    use std::time::Instant;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn sleep_takes_at_least_the_requested_time() {
        LocalLoop::new().run(|| {
            let t = spawn(async {
                let start = Instant::now();
                sleep(ms(12)).await?;
                Ok(start.elapsed())
            });
            let elapsed = t.wait(ms(5000), ms(1)).unwrap().unwrap();
            assert!(elapsed >= ms(12), "slept only {:?}", elapsed);
        });
    }

    #[test]
    fn cancelled_sleep_stops_the_timer() {
        let lp = LocalLoop::new();
        lp.run(|| {
            let t = spawn(async {
                sleep(ms(2)).await?;
                Ok(())
            });
            t.cancel().unwrap();
            assert_eq!(t.wait(ms(100), ms(1)).unwrap(), Err(Error::Cancelled));
            // The disarmed timer is gone from the host entirely.
            assert!(format!("{:?}", lp).contains("timers: 0"));
        });
    }

    #[test]
    fn zero_sleep_still_suspends_once() {
        LocalLoop::new().run(|| {
            let t = spawn(async {
                sleep(Duration::ZERO).await?;
                Ok(())
            });
            // Not done yet: the body parked and needs a loop turn.
            assert!(!t.is_done());
            assert_eq!(t.wait(ms(1000), ms(1)).unwrap(), Ok(()));
        });
    }
}
