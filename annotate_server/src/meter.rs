//! Frame rate of a single annotation run.
//!
//! Every run owns its meter. Rates are logged once per window while frames flow, and the total
//! elapsed time ends up in the run's report.
use std::time::{Duration, Instant};

/// Default length of a measuring window.
pub const LOG_WINDOW: Duration = Duration::from_secs(2);

/// Rates measured over one window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rates {
    /// Frames passed through the detector per second.
    pub frames: f32,
    /// Images sent to the display per second.
    pub updates: f32,
}

pub struct RunMeter {
    label: String,
    started: Instant,
    window: Duration,
    window_start: Instant,
    window_frames: u64,
    window_updates: u64,
}

impl RunMeter {
    pub fn start(label: impl Into<String>) -> Self {
        Self::with_window(label, LOG_WINDOW, Instant::now())
    }

    pub fn with_window(label: impl Into<String>, window: Duration, now: Instant) -> Self {
        Self {
            label: label.into(),
            started: now,
            window,
            window_start: now,
            window_frames: 0,
            window_updates: 0,
        }
    }

    /// Count a processed frame and the display updates it produced, logging the rates when a
    /// window is full.
    pub fn tick(&mut self, updates: u64) {
        if let Some(rates) = self.record(updates, Instant::now()) {
            log::info!(
                "[{}] {:.2} frames/s, {:.2} updates/s",
                self.label,
                rates.frames,
                rates.updates
            );
        }
    }

    /// Count at `now`, returning the rates of the window if it just closed.
    pub fn record(&mut self, updates: u64, now: Instant) -> Option<Rates> {
        self.window_frames += 1;
        self.window_updates += updates;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }

        let secs = elapsed.as_secs_f32();
        let rates = Rates {
            frames: self.window_frames as f32 / secs,
            updates: self.window_updates as f32 / secs,
        };
        self.window_start = now;
        self.window_frames = 0;
        self.window_updates = 0;

        Some(rates)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
