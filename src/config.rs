//! runtime configuration for pipelines, items and the replicated proxy.

use super::error::ConfigError;

/// default lower bound for [`ServerStats`](crate::proxy::stats::ServerStats) poll interval, in seconds.
pub const DEFAULT_SLEEP_MIN: u64 = 150;
/// default upper bound for [`ServerStats`](crate::proxy::stats::ServerStats) poll interval, in seconds.
pub const DEFAULT_SLEEP_MAX: u64 = 300;
/// default traffic floor applied to every live replica, as a percent.
pub const DEFAULT_MIN_PERCENT: f64 = 1.0;

/// builder for [`Config`]. validates eagerly: invalid combinations are rejected the moment
/// they would make the resulting `Config` inconsistent, final assembly happens in [`build`](ConfigBuilder::build).
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    min_ttl: u64,
    max_ttl: u64,
    max_keys_per_batch: usize,
    min_percent: f64,
    sleep_min: u64,
    sleep_max: u64,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            min_ttl: 0,
            max_ttl: 0,
            max_keys_per_batch: 1000,
            min_percent: DEFAULT_MIN_PERCENT,
            sleep_min: DEFAULT_SLEEP_MIN,
            sleep_max: DEFAULT_SLEEP_MAX,
        }
    }
}

impl ConfigBuilder {
    /// set the inclusive bounds, in seconds, a SET's TTL is drawn uniformly from.
    pub fn ttl(mut self, min_ttl: u64, max_ttl: u64) -> Self {
        self.min_ttl = min_ttl;
        self.max_ttl = max_ttl;
        self
    }

    /// set the maximum number of keys flushed in a single GET, SET or DELETE round-trip.
    /// larger batches are chunked.
    pub fn max_keys_per_batch(mut self, max_keys_per_batch: usize) -> Self {
        self.max_keys_per_batch = max_keys_per_batch;
        self
    }

    /// set the traffic floor, as a percent, every live replica is guaranteed regardless of
    /// its memory weight.
    ///
    /// # Default
    /// defaults to 1.0
    pub fn min_percent(mut self, min_percent: f64) -> Self {
        self.min_percent = min_percent;
        self
    }

    /// set the inclusive bounds, in seconds, the server stats sampler's poll interval is
    /// drawn uniformly from.
    ///
    /// # Default
    /// defaults to 150/300
    pub fn sleep_range(mut self, sleep_min: u64, sleep_max: u64) -> Self {
        self.sleep_min = sleep_min;
        self.sleep_max = sleep_max;
        self
    }

    /// validate and assemble the final [`Config`].
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.min_ttl > self.max_ttl {
            return Err(ConfigError::TtlRange {
                min_ttl: self.min_ttl,
                max_ttl: self.max_ttl,
            });
        }

        if self.max_keys_per_batch == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        if self.sleep_min > self.sleep_max {
            return Err(ConfigError::SleepRange {
                sleep_min: self.sleep_min,
                sleep_max: self.sleep_max,
            });
        }

        Ok(Config {
            min_ttl: self.min_ttl,
            max_ttl: self.max_ttl,
            max_keys_per_batch: self.max_keys_per_batch,
            min_percent: self.min_percent,
            sleep_min: self.sleep_min,
            sleep_max: self.sleep_max,
        })
    }
}

/// validated runtime configuration shared by a pipeline, its items and, when replicated
/// routing is in use, the server stats sampler.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    pub(crate) min_ttl: u64,
    pub(crate) max_ttl: u64,
    pub(crate) max_keys_per_batch: usize,
    pub(crate) min_percent: f64,
    pub(crate) sleep_min: u64,
    pub(crate) sleep_max: u64,
}

impl Config {
    /// start a [`ConfigBuilder`] with every field at its default.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn min_ttl(&self) -> u64 {
        self.min_ttl
    }

    pub fn max_ttl(&self) -> u64 {
        self.max_ttl
    }

    pub fn max_keys_per_batch(&self) -> usize {
        self.max_keys_per_batch
    }

    pub fn min_percent(&self) -> f64 {
        self.min_percent
    }

    pub fn sleep_min(&self) -> u64 {
        self.sleep_min
    }

    pub fn sleep_max(&self) -> u64 {
        self.sleep_max
    }
}
