use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, read from `COURIER_*` environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,

    pub bind_addr: String,
    pub port: u16,

    /// Messages claimed per scheduler tick.
    pub batch_size: usize,
    pub processing_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub invocation_timeout_secs: u64,

    pub delivery_timeout_secs: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    /// Retries within one delivery cycle, not counting the first attempt.
    pub max_delivery_retries: u32,

    pub cache_ttl_secs: u64,
    pub claim_lease_secs: u64,

    pub autostart: bool,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        let config = envy::prefixed("COURIER_").from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings under which a claim could expire during a delivery.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.claim_lease() <= self.delivery_timeout() {
            eyre::bail!(
                "COURIER_CLAIM_LEASE_SECS ({}) must be greater than COURIER_DELIVERY_TIMEOUT_SECS ({})",
                self.claim_lease_secs,
                self.delivery_timeout_secs
            );
        }

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("courier.db")
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn backoff_jitter(&self) -> Duration {
        Duration::from_millis(self.backoff_jitter_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bind_addr: "127.0.0.1".to_owned(),
            port: 8080,
            batch_size: 2,
            processing_interval_secs: 120,
            retry_interval_secs: 300,
            invocation_timeout_secs: 30,
            delivery_timeout_secs: 30,
            backoff_min_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_jitter_ms: 1_000,
            max_delivery_retries: 2,
            cache_ttl_secs: 24 * 60 * 60,
            claim_lease_secs: 60,
            autostart: false,
        }
    }
}
