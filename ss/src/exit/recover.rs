//! Panics that are caught and handled locally
//!
//! The process panic hook funnels every panic into the shutdown chain. Code
//! that recovers from a panic itself (a failed step, a shutdown handler)
//! polls its future through [`catch_recovered`] so the hook leaves it alone.

use std::any::Any;
use std::cell::Cell;
use std::future::{Future, poll_fn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::task::Poll;

thread_local! {
    static RECOVERING: Cell<usize> = const { Cell::new(0) };
}

struct RecoveringGuard;

impl RecoveringGuard {
    fn enter() -> Self {
        RECOVERING.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for RecoveringGuard {
    fn drop(&mut self) {
        RECOVERING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is polling inside [`catch_recovered`]
pub(crate) fn is_recovering() -> bool {
    RECOVERING.with(|depth| depth.get() > 0)
}

/// Drive `future`, turning a panic into `Err(payload)`
///
/// The marker is only set while `future` itself is being polled, so tasks it
/// spawns are still covered by the panic hook.
pub fn catch_recovered<F>(future: F) -> impl Future<Output = Result<F::Output, Box<dyn Any + Send>>>
where
    F: Future,
{
    let mut future = Box::pin(future);
    poll_fn(move |cx| {
        let _guard = RecoveringGuard::enter();
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn test_output_passes_through() {
        let result = catch_recovered(async {
            tokio::task::yield_now().await;
            7
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!is_recovering());
    }

    #[tokio::test]
    #[serial]
    async fn test_panic_becomes_payload_and_marker_is_cleared() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |_| {
            *s.lock().unwrap() = Some(is_recovering());
        }));

        let result = catch_recovered(async {
            tokio::task::yield_now().await;
            panic!("step blew up");
        })
        .await;

        std::panic::set_hook(previous);
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"step blew up"));
        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert!(!is_recovering());
    }
}
