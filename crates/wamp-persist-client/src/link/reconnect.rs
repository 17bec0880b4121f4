use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

pub struct ReconnectManager {
    min_interval: Duration,

    max_interval: Duration,

    /// Exponential backoff multiplier
    backoff_multiplier: f64,

    /// None means unlimited retries
    max_attempts: Option<u32>,
}

impl ReconnectManager {
    pub fn new() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before the first attempt after a dropped link
    pub fn initial_delay(&self) -> Duration {
        self.min_interval
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let scaled_ms = current.as_millis() as f64 * self.backoff_multiplier;
        let scaled = Duration::from_millis(scaled_ms as u64);
        scaled.min(self.max_interval)
    }

    /// Retry `connect_fn` with exponential backoff until it succeeds or the
    /// attempt budget runs out.
    pub async fn reconnect_loop<F, Fut, T>(&self, mut connect_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut current_interval = self.min_interval;

        loop {
            attempt += 1;
            log::debug!("Connect attempt #{attempt}");

            match connect_fn().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("Connected after {attempt} attempts");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    log::warn!("Connect attempt #{attempt} failed: {e:#}");

                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        let reason = format!("Giving up after {attempt} connect attempts");
                        return Err(e.context(reason));
                    }

                    log::debug!("Waiting {current_interval:?} before next attempt");
                    sleep(current_interval).await;
                    current_interval = self.next_interval(current_interval);
                }
            }
        }
    }
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect policy of a router link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reopen the link after it drops. When off, a single connect attempt
    /// is made and the link stays closed once lost.
    pub enabled: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 1_000,
            max_interval_ms: 60_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms > self.max_interval_ms {
            anyhow::bail!(
                "reconnect.min_interval_ms ({}) exceeds reconnect.max_interval_ms ({})",
                self.min_interval_ms,
                self.max_interval_ms
            );
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            anyhow::bail!(
                "reconnect.backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.max_attempts == Some(0) {
            anyhow::bail!("reconnect.max_attempts must be at least 1 when set");
        }
        Ok(())
    }

    pub fn create_manager(&self) -> ReconnectManager {
        let mut manager = ReconnectManager::new()
            .min_interval(self.min_interval())
            .max_interval(self.max_interval())
            .backoff_multiplier(self.backoff_multiplier);

        if !self.enabled {
            manager = manager.max_attempts(1);
        } else if let Some(max) = self.max_attempts {
            manager = manager.max_attempts(max);
        }

        manager
    }
}
