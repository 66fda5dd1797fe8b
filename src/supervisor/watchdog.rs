//! Stall detector (§4.4 step 5): if no `ProgressDelta` with a changed
//! `progress` arrives for `watchdogTimeout` while the job is in an active
//! stage, the child is killed and the run fails with `WATCHDOG_STALL`.

use std::time::{Duration, Instant};

use crate::domain::Stage;

pub struct Watchdog {
    timeout: Duration,
    last_progress: Option<f64>,
    last_change: Instant,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_progress: None,
            last_change: Instant::now(),
        }
    }

    /// Record an observed progress value. Resets the stall clock only when
    /// the value actually changed.
    pub fn observe(&mut self, progress: f64) {
        if self.last_progress != Some(progress) {
            self.last_progress = Some(progress);
            self.last_change = Instant::now();
        }
    }

    /// Whether the active stages (`download`, `transcode`) have gone silent
    /// past the stall threshold.
    pub fn is_stalled(&self, stage: Option<Stage>) -> bool {
        let active = matches!(stage, Some(Stage::Download) | Some(Stage::Transcode));
        active && self.last_change.elapsed() >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_stall_before_timeout() {
        let wd = Watchdog::new(Duration::from_millis(200));
        assert!(!wd.is_stalled(Some(Stage::Download)));
    }

    #[test]
    fn stalls_after_timeout_with_no_change() {
        let wd = Watchdog::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(wd.is_stalled(Some(Stage::Download)));
    }

    #[test]
    fn ignores_inactive_stages() {
        let wd = Watchdog::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!wd.is_stalled(Some(Stage::Finalize)));
        assert!(!wd.is_stalled(None));
    }

    #[test]
    fn progress_change_resets_clock() {
        let mut wd = Watchdog::new(Duration::from_millis(50));
        wd.observe(10.0);
        std::thread::sleep(Duration::from_millis(30));
        wd.observe(20.0);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!wd.is_stalled(Some(Stage::Download)));
    }
}
