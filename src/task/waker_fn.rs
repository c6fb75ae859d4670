// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use core::{
    mem::ManuallyDrop,
    task::{RawWaker, RawWakerVTable, Waker},
};
use std::rc::Rc;

/// Creates a waker that runs `wake` every time it is woken.
///
/// Wakers built here never leave the thread that owns their task: the
/// runtime is single-threaded and a task is only ever resumed where it
/// lives. That keeps the callback free of `Send`/`Sync` bounds and lets a
/// plain `Rc` back the vtable where a thread-pool executor would need an
/// `Arc`.
pub(crate) fn local_waker<F: Fn() + 'static>(wake: F) -> Waker {
    let data = Rc::into_raw(Rc::new(wake)) as *const ();
    unsafe { Waker::from_raw(raw_waker::<F>(data)) }
}

fn raw_waker<F: Fn() + 'static>(data: *const ()) -> RawWaker {
    RawWaker::new(
        data,
        &RawWakerVTable::new(clone_rc::<F>, wake_rc::<F>, wake_rc_ref::<F>, drop_rc::<F>),
    )
}

// Each vtable entry views `data` as the `Rc<F>` it was created from; they
// differ only in what happens to the reference count.

unsafe fn clone_rc<F: Fn() + 'static>(data: *const ()) -> RawWaker {
    // The cloned waker owns a reference of its own.
    Rc::increment_strong_count(data as *const F);
    raw_waker::<F>(data)
}

unsafe fn wake_rc<F: Fn() + 'static>(data: *const ()) {
    // Waking by value consumes the waker, and with it the reference.
    let callback = Rc::from_raw(data as *const F);
    (callback)();
}

unsafe fn wake_rc_ref<F: Fn() + 'static>(data: *const ()) {
    // The waker stays alive afterwards, so the reference is only borrowed.
    let callback = ManuallyDrop::new(Rc::from_raw(data as *const F));
    (callback)();
}

unsafe fn drop_rc<F: Fn() + 'static>(data: *const ()) {
    drop(Rc::from_raw(data as *const F));
}
