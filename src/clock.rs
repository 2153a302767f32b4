//! Time source for every timing-sensitive operation of the bus.
//!
//! Delays, visibility timeouts, the dedup window and move-task pacing all read
//! the clock through this trait, so tests can swap in a [`ManualClock`] and
//! advance time explicitly instead of sleeping.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

/// A pending wake-up returned by [`Clock::sleep_until`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Completes once the clock reads `deadline_millis` or later.
    fn sleep_until(&self, deadline_millis: i64) -> Sleep;

    fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.now_millis() + duration.as_millis() as i64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep_until(&self, deadline_millis: i64) -> Sleep {
        let remaining = deadline_millis - self.now_millis();
        Box::pin(async move {
            if remaining > 0 {
                tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
            }
        })
    }
}

struct ManualClockInner {
    now: AtomicI64,
    tick: Notify,
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            inner: Arc::new(ManualClockInner {
                now: AtomicI64::new(start.timestamp_millis()),
                tick: Notify::new(),
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.inner
            .now
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        self.inner.tick.notify_waiters();
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.inner
            .now
            .store(to.timestamp_millis(), Ordering::SeqCst);
        self.inner.tick.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z keeps test timestamps readable.
        ManualClock::new(
            Utc.timestamp_millis_opt(1_704_067_200_000)
                .single()
                .unwrap_or_else(Utc::now),
        )
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.inner.now.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn now_millis(&self) -> i64 {
        self.inner.now.load(Ordering::SeqCst)
    }

    fn sleep_until(&self, deadline_millis: i64) -> Sleep {
        let inner = self.inner.clone();
        Box::pin(async move {
            loop {
                let notified = inner.tick.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if inner.now.load(Ordering::SeqCst) >= deadline_millis {
                    return;
                }
                notified.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_sleep_waits_for_advance() {
        let clock = ManualClock::default();
        let start = clock.now_millis();
        let sleeper = tokio::spawn(clock.sleep(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(2));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(3));
        sleeper.await.unwrap();
        assert_eq!(clock.now_millis() - start, 5_000);
    }

    #[tokio::test]
    async fn past_deadline_completes_immediately() {
        let clock = ManualClock::default();
        clock.sleep_until(clock.now_millis() - 1).await;
    }
}
