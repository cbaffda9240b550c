//! Upload/processing progress as a 0–100 value.
//!
//! While a submission is in flight the value only moves forward and stays at or
//! below 99; it becomes exactly 100 when the session reaches its result.

use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::debug;

/// Highest value reachable before the response lands.
pub const IN_FLIGHT_CEILING: u8 = 99;
/// Share of the bar given to the upload itself; the rest covers server time.
pub const UPLOAD_SHARE: u8 = 90;

const RAMP_TICK: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressState {
    pub percent: u8,
    pub finished: bool,
}

/// Shared progress value. Cloning yields another handle to the same value.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    tx: watch::Sender<ProgressState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.tx.subscribe()
    }

    pub fn percent(&self) -> u8 {
        self.tx.borrow().percent
    }

    pub fn is_finished(&self) -> bool {
        self.tx.borrow().finished
    }

    pub fn reset(&self) {
        self.tx.send_replace(ProgressState::default());
    }

    /// Move forward to `percent`, clamped to the in-flight ceiling. Lower values
    /// and updates after completion are ignored.
    pub fn advance_to(&self, percent: u8) -> bool {
        let target = percent.min(IN_FLIGHT_CEILING);
        self.tx.send_if_modified(|state| {
            if state.finished || target <= state.percent {
                return false;
            }
            state.percent = target;
            true
        })
    }

    pub fn finish(&self) {
        self.tx.send_replace(ProgressState {
            percent: 100,
            finished: true,
        });
    }
}

/// Percent shown for `elapsed` time into a synthetic ramp of `duration`.
pub fn ramp_percent(elapsed: Duration, duration: Duration) -> u8 {
    if duration.is_zero() {
        return IN_FLIGHT_CEILING;
    }
    let fraction = elapsed.as_secs_f64() / duration.as_secs_f64();
    ((fraction * 100.0).floor() as u64).min(IN_FLIGHT_CEILING as u64) as u8
}

/// Percent shown after `loaded` of `total` upload bytes were handed to the network.
pub fn byte_percent(loaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let fraction = (loaded.min(total) as f64) / (total as f64);
    ((fraction * UPLOAD_SHARE as f64).floor() as u8).min(IN_FLIGHT_CEILING)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStrategy {
    /// Clock driven ramp for transports with no progress signal.
    SyntheticTimer { duration: Duration },
    /// Upload byte counts reported by the transport.
    ByteProgress,
}

impl ProgressStrategy {
    pub fn select(transport_reports_progress: bool, ramp: Duration) -> Self {
        if transport_reports_progress {
            ProgressStrategy::ByteProgress
        } else {
            ProgressStrategy::SyntheticTimer { duration: ramp }
        }
    }
}

/// Handed to the transport so it can report upload bytes. Inert unless the
/// byte strategy is active.
#[derive(Clone, Debug)]
pub struct UploadProgress {
    tracker: Option<ProgressTracker>,
}

impl UploadProgress {
    pub fn disabled() -> Self {
        Self { tracker: None }
    }

    pub fn record(&self, loaded: u64, total: u64) {
        if let Some(tracker) = &self.tracker {
            tracker.advance_to(byte_percent(loaded, total));
        }
    }
}

/// Drives one processing attempt. Dropping it cancels any scheduled ramp
/// updates, so every exit path stops the timer.
pub struct ProgressRun {
    tracker: ProgressTracker,
    strategy: ProgressStrategy,
    ramp: Option<JoinHandle<()>>,
}

impl ProgressRun {
    /// Reset the tracker to 0 and start the chosen strategy.
    pub fn start(tracker: ProgressTracker, strategy: ProgressStrategy) -> Self {
        tracker.reset();
        debug!(?strategy, "progress started");

        let ramp = match strategy {
            ProgressStrategy::SyntheticTimer { duration } => {
                let ramp_tracker = tracker.clone();
                Some(tokio::spawn(async move {
                    let start = Instant::now();
                    let mut ticker = tokio::time::interval(RAMP_TICK);
                    loop {
                        ticker.tick().await;
                        let percent = ramp_percent(start.elapsed(), duration);
                        ramp_tracker.advance_to(percent);
                        if percent >= IN_FLIGHT_CEILING || ramp_tracker.is_finished() {
                            break;
                        }
                    }
                }))
            }
            ProgressStrategy::ByteProgress => None,
        };

        Self {
            tracker,
            strategy,
            ramp,
        }
    }

    pub fn strategy(&self) -> ProgressStrategy {
        self.strategy
    }

    pub fn upload_progress(&self) -> UploadProgress {
        match self.strategy {
            ProgressStrategy::ByteProgress => UploadProgress {
                tracker: Some(self.tracker.clone()),
            },
            ProgressStrategy::SyntheticTimer { .. } => UploadProgress::disabled(),
        }
    }

    /// Stop the ramp and snap to 100.
    pub fn finish(mut self) {
        self.stop_ramp();
        self.tracker.finish();
    }

    /// Stop the ramp and leave the value where it is.
    pub fn cancel(mut self) {
        self.stop_ramp();
    }

    fn stop_ramp(&mut self) {
        if let Some(handle) = self.ramp.take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressRun {
    fn drop(&mut self) {
        self.stop_ramp();
    }
}
