use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RestartSettings;

/// Restart budget and exponential backoff of one projection stream.
pub struct RestartBackoff {
    settings: RestartSettings,
    restarts: VecDeque<Instant>,
    consecutive: u32,
}

impl RestartBackoff {
    pub fn new(settings: RestartSettings) -> Self {
        Self {
            settings,
            restarts: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Record a failure. Returns the delay before restarting, or None once
    /// `max_restarts` restarts already happened inside the window.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let window = self.settings.max_restarts_within;
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= self.settings.max_restarts {
            return None;
        }

        self.restarts.push_back(now);
        let delay = self.delay_for(self.consecutive);
        self.consecutive = self.consecutive.saturating_add(1);
        Some(delay)
    }

    /// The stream made progress: the next failure starts from the minimum delay.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Restarts counted in the current window.
    pub fn restarts(&self) -> usize {
        self.restarts.len()
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let base = self
            .settings
            .min_backoff
            .saturating_mul(factor)
            .min(self.settings.max_backoff);
        let jitter = 1.0 + rand::random::<f64>() * self.settings.random_factor;
        base.mul_f64(jitter)
    }
}
