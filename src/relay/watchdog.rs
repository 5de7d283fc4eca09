use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type FireHook = Arc<dyn Fn(u64) + Send + Sync>;

/// One-shot idle timer that restarts the relay when no segment arrives
/// for `timeout`.
///
/// Every `arm`/`reset`/`disarm` bumps an epoch. The hook receives the epoch
/// it was scheduled under, and the owner checks [`is_current`] before
/// acting, so a timer that raced with a reset or disarm is ignored.
///
/// [`is_current`]: StarvationWatchdog::is_current
pub struct StarvationWatchdog {
    on_fire: FireHook,
    timeout: Option<Duration>,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl StarvationWatchdog {
    pub fn new(on_fire: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            on_fire: Arc::new(on_fire),
            timeout: None,
            epoch: 0,
            timer: None,
        }
    }

    /// Start (or restart) the countdown.
    pub fn arm(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        self.schedule();
    }

    /// Restart the countdown with the armed timeout. No-op when disarmed.
    pub fn reset(&mut self) {
        if self.timeout.is_some() {
            self.schedule();
        }
    }

    /// Cancel any pending countdown.
    pub fn disarm(&mut self) {
        self.timeout = None;
        self.epoch += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timeout.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether a firing scheduled under `epoch` should still be honoured.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.timeout.is_some() && self.epoch == epoch
    }

    fn schedule(&mut self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let on_fire = Arc::clone(&self.on_fire);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire(epoch);
        }));
    }
}

impl Drop for StarvationWatchdog {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_watchdog() -> (StarvationWatchdog, Arc<Mutex<Vec<u64>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let watchdog = StarvationWatchdog::new(move |epoch| sink.lock().unwrap().push(epoch));
        (watchdog, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_timeout() {
        let (mut watchdog, fired) = recording_watchdog();
        watchdog.arm(Duration::from_secs(20));

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let fired = fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert!(watchdog.is_current(fired[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_postpones_firing() {
        let (mut watchdog, fired) = recording_watchdog();
        watchdog.arm(Duration::from_secs(10));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            watchdog.reset();
        }
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_and_reset_does_not_rearm() {
        let (mut watchdog, fired) = recording_watchdog();
        watchdog.arm(Duration::from_secs(5));
        watchdog.disarm();
        watchdog.reset();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert!(!watchdog.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_not_current() {
        let (mut watchdog, _fired) = recording_watchdog();
        watchdog.arm(Duration::from_secs(5));
        let first = watchdog.epoch;
        watchdog.reset();
        assert!(!watchdog.is_current(first));
        assert!(watchdog.is_current(watchdog.epoch));
    }
}
