//! Time source abstraction
//!
//! Every wait in the controller (modem bring-up, UART receive, network
//! acquisition, HTTP exchange, backoff) goes through [`Clock`], so each one is
//! an explicit, bounded suspension point. On hardware the clock is backed by
//! `embassy-time`; host tests and the simulator's fast mode use
//! [`ManualClock`], which keeps virtual time and never really sleeps.

use core::future::Future;

use embassy_time::Duration;

/// The bounded operation did not finish in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

/// Source of time and bounded waits.
///
/// Implementations are cheap handles; components keep their own clone.
pub trait Clock: Clone {
    /// Milliseconds since an arbitrary epoch (usually boot).
    fn now_ms(&self) -> u64;

    /// Suspend for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;

    /// Run `future` to completion, or give up once `duration` has elapsed.
    fn timeout<F: Future>(
        &self,
        duration: Duration,
        future: F,
    ) -> impl Future<Output = Result<F::Output, TimedOut>>;

    /// Milliseconds left until `deadline_ms`, or `None` once it has passed.
    fn remaining(&self, deadline_ms: u64) -> Option<Duration> {
        let now = self.now_ms();
        if now >= deadline_ms {
            None
        } else {
            Some(Duration::from_millis(deadline_ms - now))
        }
    }
}

#[cfg(feature = "embassy-clock")]
pub use embassy::EmbassyClock;

#[cfg(feature = "embassy-clock")]
mod embassy {
    use core::future::Future;

    use embassy_time::{Duration, Instant, Timer, with_timeout};

    use super::{Clock, TimedOut};

    /// Wall-clock time from the embassy time driver.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct EmbassyClock;

    impl Clock for EmbassyClock {
        fn now_ms(&self) -> u64 {
            Instant::now().as_millis()
        }

        async fn sleep(&self, duration: Duration) {
            Timer::after(duration).await;
        }

        async fn timeout<F: Future>(
            &self,
            duration: Duration,
            future: F,
        ) -> Result<F::Output, TimedOut> {
            with_timeout(duration, future).await.map_err(|_| TimedOut)
        }
    }
}

pub use manual::ManualClock;

mod manual {
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll, Waker};

    use embassy_futures::yield_now;
    use embassy_time::Duration;

    use super::{Clock, TimedOut};

    /// Polls without virtual-time progress granted to a bounded future before it is considered stuck.
    const STALL_POLLS: usize = 64;

    /// Deterministic virtual clock.
    ///
    /// `sleep` yields to the executor once, then records the requested delay
    /// and advances virtual time at once. `timeout` polls the wrapped future
    /// until it stops making progress; a future that stays pending without
    /// sleeping is treated as a stuck peripheral, so after one more yield
    /// virtual time jumps to the deadline and the wait fails. A future that
    /// completes but whose own sleeps carried virtual time past the deadline
    /// also fails, as a real timer would have fired first.
    ///
    /// The yields are where a racing future, such as a stop signal, gets to
    /// run; a cancelled sleep or timeout leaves virtual time untouched.
    #[derive(Debug, Clone, Default)]
    pub struct ManualClock {
        inner: Rc<Inner>,
    }

    #[derive(Debug, Default)]
    struct Inner {
        now_ms: Cell<u64>,
        /// Bumped on every completed sleep and every timeout that fires.
        progress: Cell<u64>,
        sleeps: RefCell<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        /// Move virtual time forward.
        pub fn advance(&self, duration: Duration) {
            let now = self.inner.now_ms.get();
            self.inner
                .now_ms
                .set(now.saturating_add(duration.as_millis()));
        }

        fn tick(&self) {
            self.inner.progress.set(self.inner.progress.get().wrapping_add(1));
        }

        /// Every delay passed to [`Clock::sleep`] so far, in order.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.inner.sleeps.borrow().clone()
        }

        /// Forget the recorded sleeps, keeping the current time.
        pub fn clear_sleeps(&self) {
            self.inner.sleeps.borrow_mut().clear();
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.inner.now_ms.get()
        }

        async fn sleep(&self, duration: Duration) {
            yield_now().await;
            self.inner.sleeps.borrow_mut().push(duration);
            self.advance(duration);
            self.tick();
        }

        async fn timeout<F: Future>(
            &self,
            duration: Duration,
            future: F,
        ) -> Result<F::Output, TimedOut> {
            let started = self.now_ms();
            let deadline = started.saturating_add(duration.as_millis());
            let mut future = pin!(future);
            let mut cx = Context::from_waker(Waker::noop());

            let mut stalls = 0;
            while stalls < STALL_POLLS {
                let progress = self.inner.progress.get();
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    if self.now_ms() > deadline {
                        return Err(TimedOut);
                    }
                    return Ok(output);
                }
                if self.inner.progress.get() == progress {
                    stalls += 1;
                } else {
                    stalls = 0;
                }
            }

            yield_now().await;
            if self.now_ms() < deadline {
                self.inner.now_ms.set(deadline);
            }
            self.tick();
            Err(TimedOut)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::select::{Either, select};

    #[test]
    fn test_sleep_advances_virtual_time() {
        let clock = ManualClock::new();
        block_on(clock.sleep(Duration::from_millis(1500)));
        block_on(clock.sleep(Duration::from_secs(2)));

        assert_eq!(clock.now_ms(), 3500);
        assert_eq!(
            clock.sleeps(),
            [Duration::from_millis(1500), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_timeout_passes_ready_future_through() {
        let clock = ManualClock::new();
        let result = block_on(clock.timeout(Duration::from_secs(1), async { 7 }));
        assert_eq!(result, Ok(7));
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_timeout_on_stuck_future_jumps_to_deadline() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(100));
        let result = block_on(
            clock.timeout(Duration::from_secs(5), core::future::pending::<()>()),
        );
        assert_eq!(result, Err(TimedOut));
        assert_eq!(clock.now_ms(), 5100);
    }

    #[test]
    fn test_timeout_when_inner_sleeps_overrun() {
        let clock = ManualClock::new();
        let inner = clock.clone();
        let result = block_on(clock.timeout(Duration::from_secs(1), async move {
            inner.sleep(Duration::from_secs(3)).await;
        }));
        assert_eq!(result, Err(TimedOut));
    }

    #[test]
    fn test_nested_timeouts_count_as_progress() {
        let clock = ManualClock::new();
        let inner = clock.clone();
        let result = block_on(clock.timeout(Duration::from_secs(10), async move {
            for _ in 0..3 {
                let _ = inner
                    .timeout(Duration::from_secs(1), core::future::pending::<()>())
                    .await;
            }
        }));
        assert_eq!(result, Ok(()));
        assert_eq!(clock.now_ms(), 3000);
    }

    #[test]
    fn test_sleep_yields_to_racing_future() {
        let clock = ManualClock::new();
        let outcome = block_on(select(clock.sleep(Duration::from_secs(60)), async {}));

        assert!(matches!(outcome, Either::Second(())));
        assert_eq!(clock.now_ms(), 0);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_stuck_timeout_yields_before_firing() {
        let clock = ManualClock::new();
        let stuck = clock.timeout(Duration::from_secs(5), core::future::pending::<()>());
        let outcome = block_on(select(stuck, async {}));

        assert!(matches!(outcome, Either::Second(())));
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_remaining_until_deadline() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(400));
        assert_eq!(clock.remaining(1000), Some(Duration::from_millis(600)));
        assert_eq!(clock.remaining(400), None);
    }
}
