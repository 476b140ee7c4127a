//! Reconnection backoff with jitter

use crate::config::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
    /// A session that stays Ready at least this long resets the backoff
    #[serde(with = "duration_ms")]
    pub stability_window: Duration,
    /// Maximum number of consecutive reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            stability_window: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsReached(usize),
}

/// Exponential backoff state for the supervisor
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, advancing the backoff
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        let delay = self.jittered(self.current_backoff);
        debug!(
            "Waiting {}ms before reconnection attempt {}",
            delay.as_millis(),
            self.attempt
        );

        let max_backoff = self.config.max_backoff;
        let scaled = self.current_backoff.as_secs_f64() * self.config.multiplier;
        let next_backoff = Duration::try_from_secs_f64(scaled).unwrap_or(max_backoff);
        self.current_backoff = next_backoff.min(max_backoff);

        Ok(delay)
    }

    /// Account for a session that reached Ready and lasted `ready_for`
    pub fn record_session(&mut self, ready_for: Duration) {
        if ready_for >= self.config.stability_window {
            self.reset();
        }
    }

    /// Reset backoff (call after a stable connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get the un-jittered delay the next attempt will use
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    fn jittered(&self, base: Duration) -> Duration {
        let spread = self.config.jitter;
        if !spread.is_finite() || spread <= 0.0 {
            return base;
        }
        let spread = spread.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<usize>) -> ReconnectConfig {
        ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            stability_window: Duration::from_secs(30),
            max_attempts,
        }
    }

    #[test]
    fn test_reconnect_backoff() {
        let mut backoff = Backoff::new(config(None));

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_backoff(), Duration::from_millis(10));

        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(
            delays,
            [10, 20, 40, 80, 100, 100].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reconnect_reset() {
        let mut backoff = Backoff::new(config(None));

        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(10));
    }

    #[test]
    fn test_stable_session_resets() {
        let mut backoff = Backoff::new(config(None));
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();

        // too short to count as stable
        backoff.record_session(Duration::from_secs(5));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(40));

        backoff.record_session(Duration::from_secs(30));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut cfg = config(None);
        cfg.jitter = 0.2;
        cfg.initial_backoff = Duration::from_millis(1000);
        cfg.max_backoff = Duration::from_millis(1000);
        let mut backoff = Backoff::new(cfg);

        for _ in 0..200 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(799), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1201), "{:?}", delay);
        }
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::new(config(Some(3)));

        assert!(backoff.next_delay().is_ok());
        assert!(backoff.next_delay().is_ok());
        assert!(backoff.next_delay().is_ok());

        let result = backoff.next_delay();
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached(3))));
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max() {
        let mut cfg = config(None);
        cfg.multiplier = 1.0e300;
        let mut backoff = Backoff::new(cfg);

        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn test_nan_settings_do_not_panic() {
        let mut cfg = config(None);
        cfg.multiplier = f64::NAN;
        cfg.jitter = f64::NAN;
        let mut backoff = Backoff::new(cfg);

        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }
}
