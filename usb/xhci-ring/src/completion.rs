//! Handing results from the event handler back to whoever submitted the work.
//!
//! Results are never delivered under the engine lock. The engine turns each [`Waiter`] into a
//! [`Continuation`], queues it, and runs the queue in order once the lock has been released. A
//! continuation may therefore submit new work.
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use log::trace;

/// Deferred work queued under the engine lock and run after it is released.
pub type Continuation = Box<dyn FnOnce() + Send>;

struct Slot<T> {
    result: Option<T>,
    waker: Option<task::Waker>,
    abandoned: bool,
}

/// Resolves once the engine completes the matching [`Completer`].
pub struct CompletionFuture<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

/// The engine side of a [`CompletionFuture`].
pub struct Completer<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

pub fn channel<T>() -> (Completer<T>, CompletionFuture<T>) {
    let slot = Arc::new(Mutex::new(Slot {
        result: None,
        waker: None,
        abandoned: false,
    }));
    (
        Completer {
            slot: Arc::clone(&slot),
        },
        CompletionFuture { slot },
    )
}

impl<T> Completer<T> {
    pub fn complete(self, value: T) {
        let mut slot = self.slot.lock().unwrap();
        if slot.abandoned {
            trace!("Dropping result of an abandoned request");
            return;
        }
        slot.result = Some(value);
        if let Some(waker) = slot.waker.take() {
            waker.wake();
        }
    }
}

impl<T> CompletionFuture<T> {
    /// Blocks the calling thread until the result is there.
    pub fn wait(self) -> T {
        futures::executor::block_on(self)
    }

    /// Takes the result if it has already been delivered.
    pub fn try_take(&mut self) -> Option<T> {
        self.slot.lock().unwrap().result.take()
    }
}

impl<T> Future for CompletionFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, context: &mut task::Context) -> task::Poll<T> {
        let mut slot = self.slot.lock().unwrap();
        match slot.result.take() {
            Some(value) => task::Poll::Ready(value),
            None => {
                slot.waker = Some(context.waker().clone());
                task::Poll::Pending
            }
        }
    }
}

impl<T> Drop for CompletionFuture<T> {
    fn drop(&mut self) {
        self.slot.lock().unwrap().abandoned = true;
    }
}

/// Who is told about a completion.
pub enum Waiter<T> {
    Future(Completer<T>),
    Callback(Box<dyn FnOnce(T) + Send>),
}

impl<T: Send + 'static> Waiter<T> {
    pub fn callback<F: FnOnce(T) + Send + 'static>(f: F) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn into_continuation(self, value: T) -> Continuation {
        match self {
            Self::Future(completer) => Box::new(move || completer.complete(value)),
            Self::Callback(callback) => Box::new(move || callback(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn future_resolves_after_completion() {
        let (completer, future) = channel();
        let waiter = Waiter::Future(completer);
        let continuation = waiter.into_continuation(7u32);
        continuation();
        assert_eq!(future.wait(), 7);
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let (completer, future) = channel();
        let thread = std::thread::spawn(move || future.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        completer.complete("done");
        assert_eq!(thread.join().unwrap(), "done");
    }

    #[test]
    fn dropped_future_abandons_result() {
        let (completer, mut future) = channel::<u8>();
        assert_eq!(future.try_take(), None);
        drop(future);
        completer.complete(1);
    }

    #[test]
    fn callback_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let waiter = Waiter::callback(move |value: u32| {
            seen.fetch_add(value, Ordering::SeqCst);
        });
        waiter.into_continuation(3)();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
