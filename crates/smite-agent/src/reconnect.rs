//! Exponential backoff between panel connection attempts

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(u32),
}

/// Delay doubles after every failed attempt, up to `max_backoff`
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Sleep for the current delay, then double it
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        self.attempt += 1;
        if let Some(max) = self.config.max_attempts {
            if self.attempt > max {
                return Err(ReconnectError::MaxAttemptsReached(max));
            }
        }

        debug!(
            attempt = self.attempt,
            delay_ms = self.current.as_millis() as u64,
            "Waiting before reconnecting"
        );
        tokio::time::sleep(self.current).await;

        self.current = self.current.saturating_mul(2).min(self.config.max_backoff);
        Ok(())
    }

    /// Start over after a session was established
    pub fn reset(&mut self) {
        self.current = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
