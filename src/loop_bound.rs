//! Thread-affinity wrapper for values owned by the event-loop thread.
//!
//! RPC capabilities are reference-counted without atomics and their clone,
//! call, and drop operations all touch connection state, so they must only
//! ever be exercised on the loop thread. A [`LoopBound`] may be *stored*
//! anywhere (the descriptor table lives on caller threads) but is only
//! *usable* on the loop thread, and it routes its own destruction back there.

use std::mem::ManuallyDrop;
use std::thread::ThreadId;

use once_cell::sync::OnceCell;

static LOOP_THREAD: OnceCell<ThreadId> = OnceCell::new();

/// Records the calling thread as the event-loop thread. Called exactly once,
/// from the loop thread itself, before any job runs.
pub(crate) fn register_loop_thread() {
    LOOP_THREAD
        .set(std::thread::current().id())
        .expect("event-loop thread registered twice");
}

pub(crate) fn on_loop_thread() -> bool {
    LOOP_THREAD.get().copied() == Some(std::thread::current().id())
}

/// A value that may only be touched on the event-loop thread.
pub struct LoopBound<T>(ManuallyDrop<T>);

// SAFETY: every access to the inner value goes through `new`/`get`/`drop`,
// all of which run on the loop thread (asserted for `new` and `get`;
// `drop` ships the value there). Between accesses the value is inert, so
// moving the wrapper across threads is fine.
unsafe impl<T> Send for LoopBound<T> {}
unsafe impl<T> Sync for LoopBound<T> {}

/// Smuggles a value past a `Send` bound so the loop thread can destroy it.
struct Parcel<T>(T);

// SAFETY: the parcel is constructed and opened without touching the value;
// it only transits back to the thread the value came from.
unsafe impl<T> Send for Parcel<T> {}

impl<T> LoopBound<T> {
    /// Wrap a value. Panics off the loop thread.
    pub fn new(value: T) -> Self {
        assert!(on_loop_thread(), "LoopBound::new off the loop thread");
        LoopBound(ManuallyDrop::new(value))
    }

    /// Borrow the value. Panics off the loop thread.
    pub fn get(&self) -> &T {
        assert!(on_loop_thread(), "LoopBound::get off the loop thread");
        &self.0
    }
}

impl<T> Drop for LoopBound<T> {
    fn drop(&mut self) {
        // SAFETY: taken exactly once; `self.0` is never used afterwards.
        let value = unsafe { ManuallyDrop::take(&mut self.0) };
        if on_loop_thread() {
            drop(value);
            return;
        }
        // A caller thread dropped us (e.g. close of a virtual fd). Releasing
        // the capability must still happen on the loop thread.
        let Some(injector) = crate::vfs::global().injector_if_spawned() else {
            // No loop thread means no loop-bound value was ever created;
            // unreachable in practice. Leak rather than race.
            std::mem::forget(Parcel(value));
            return;
        };
        let parcel = Parcel(value);
        let _ = injector.run_in_loop(move |_state| {
            Box::pin(async move {
                drop(parcel);
                Ok(())
            })
        });
    }
}
