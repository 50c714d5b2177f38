//! Countdown that can be paused and resumed without losing progress.
//!
//! The timer is shared (`&self` methods) so one task can await [`PausableTimer::elapsed`] while
//! another pauses it. Built on `tokio::time::Instant`, so paused-clock tests drive it
//! deterministically.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Stopped,
    Running,
    Paused,
    Finished,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer has already been started")]
    AlreadyStarted,
    #[error("timer is not running")]
    NotRunning,
    #[error("timer is not paused")]
    NotPaused,
}

#[derive(Debug)]
struct Inner {
    status: TimerStatus,
    remaining: Duration,
    deadline: Option<Instant>,
    cancelled: bool,
}

#[derive(Debug)]
pub struct PausableTimer {
    duration: Duration,
    inner: Mutex<Inner>,
    changed: watch::Sender<TimerStatus>,
}

impl PausableTimer {
    pub fn new(duration: Duration) -> Self {
        let (changed, _) = watch::channel(TimerStatus::Stopped);
        Self {
            duration,
            inner: Mutex::new(Inner {
                status: TimerStatus::Stopped,
                remaining: duration,
                deadline: None,
                cancelled: false,
            }),
            changed,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn status(&self) -> TimerStatus {
        self.inner.lock().status
    }

    pub fn remaining(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.status, inner.deadline) {
            (TimerStatus::Running, Some(deadline)) => {
                deadline.saturating_duration_since(Instant::now())
            }
            _ => inner.remaining,
        }
    }

    pub fn start(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if inner.status != TimerStatus::Stopped {
            return Err(TimerError::AlreadyStarted);
        }
        inner.deadline = Some(Instant::now() + inner.remaining);
        self.set_status(&mut inner, TimerStatus::Running);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if inner.status != TimerStatus::Running {
            return Err(TimerError::NotRunning);
        }
        if let Some(deadline) = inner.deadline.take() {
            inner.remaining = deadline.saturating_duration_since(Instant::now());
        }
        self.set_status(&mut inner, TimerStatus::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), TimerError> {
        let mut inner = self.inner.lock();
        if inner.status != TimerStatus::Paused {
            return Err(TimerError::NotPaused);
        }
        inner.deadline = Some(Instant::now() + inner.remaining);
        self.set_status(&mut inner, TimerStatus::Running);
        Ok(())
    }

    /// Finish without counting as elapsed. No-op once finished.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.status == TimerStatus::Finished {
            return;
        }
        inner.cancelled = true;
        inner.deadline = None;
        self.set_status(&mut inner, TimerStatus::Finished);
    }

    /// Resolves once the timer finishes. Returns `true` if the budget ran out and `false` if it
    /// was cancelled.
    pub async fn elapsed(&self) -> bool {
        let mut rx = self.changed.subscribe();
        loop {
            rx.borrow_and_update();
            let (status, deadline, cancelled) = {
                let inner = self.inner.lock();
                (inner.status, inner.deadline, inner.cancelled)
            };
            match (status, deadline) {
                (TimerStatus::Finished, _) => return !cancelled,
                (TimerStatus::Running, Some(deadline)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => self.finish_if_due(),
                        res = rx.changed() => {
                            if res.is_err() {
                                return false;
                            }
                        }
                    }
                }
                _ => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn finish_if_due(&self) {
        let mut inner = self.inner.lock();
        let due = matches!(
            (inner.status, inner.deadline),
            (TimerStatus::Running, Some(deadline)) if deadline <= Instant::now()
        );
        if due {
            inner.remaining = Duration::ZERO;
            inner.deadline = None;
            self.set_status(&mut inner, TimerStatus::Finished);
        }
    }

    fn set_status(&self, inner: &mut Inner, status: TimerStatus) {
        inner.status = status;
        self.changed.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn elapses_after_duration() {
        let timer = PausableTimer::new(Duration::from_millis(100));
        timer.start().expect("start");
        let started = Instant::now();
        assert!(timer.elapsed().await);
        assert_eq!(timer.status(), TimerStatus::Finished);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(timer.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_preserves_progress() {
        let timer = Arc::new(PausableTimer::new(Duration::from_millis(100)));
        timer.start().expect("start");
        tokio::time::sleep(Duration::from_millis(40)).await;
        timer.pause().expect("pause");
        assert_eq!(timer.remaining(), Duration::from_millis(60));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(timer.status(), TimerStatus::Paused);
        assert_eq!(timer.remaining(), Duration::from_millis(60));

        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.elapsed().await })
        };
        tokio::task::yield_now().await;
        let resumed = Instant::now();
        timer.resume().expect("resume");
        assert!(waiter.await.expect("join"));
        assert!(resumed.elapsed() >= Duration::from_millis(60));
        assert!(resumed.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wakes_waiters_without_elapsing() {
        let timer = Arc::new(PausableTimer::new(Duration::from_secs(60)));
        timer.start().expect("start");
        let waiter = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.elapsed().await })
        };
        tokio::task::yield_now().await;
        timer.cancel();
        assert!(!waiter.await.expect("join"));
        assert_eq!(timer.status(), TimerStatus::Finished);
    }

    #[test]
    fn illegal_calls_are_errors() {
        let timer = PausableTimer::new(Duration::from_secs(1));
        assert_eq!(timer.pause(), Err(TimerError::NotRunning));
        assert_eq!(timer.resume(), Err(TimerError::NotPaused));
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        rt.block_on(async {
            timer.start().expect("start");
            assert_eq!(timer.start(), Err(TimerError::AlreadyStarted));
            assert_eq!(timer.resume(), Err(TimerError::NotPaused));
            timer.pause().expect("pause");
            assert_eq!(timer.pause(), Err(TimerError::NotRunning));
        });
    }
}
