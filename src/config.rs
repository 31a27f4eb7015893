//! Configuration for the proxy pool and the probe engine.

use std::time::Duration;

/// Configuration for the proxy pool.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Eligible proxy count under which the pool asks for a restock.
    pub min_size: usize,
    /// Upper bound on the number of records kept after a restock.
    pub max_size: usize,
    /// Minimum success percentage (0-100) for a sampled proxy to stay eligible.
    pub health_threshold: f64,
    /// Maximum average latency for a sampled proxy to stay eligible.
    pub latency_threshold: Duration,
    /// Number of samples a proxy gets before health policy applies.
    pub min_sample_size: u32,
    /// Consecutive failures after which a sampled proxy becomes ineligible.
    pub failure_cap: u32,
    /// Minimum rest between two acquisitions of the same proxy.
    pub cooldown: Duration,
    /// Minimum time between two proactive restocks of a low pool.
    pub restock_interval: Duration,
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        ProxyPoolConfigBuilder::new().build()
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    min_size: Option<usize>,
    max_size: Option<usize>,
    health_threshold: Option<f64>,
    latency_threshold: Option<Duration>,
    min_sample_size: Option<u32>,
    failure_cap: Option<u32>,
    cooldown: Option<Duration>,
    restock_interval: Option<Duration>,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            min_size: None,
            max_size: None,
            health_threshold: None,
            latency_threshold: None,
            min_sample_size: None,
            failure_cap: None,
            cooldown: None,
            restock_interval: None,
        }
    }

    /// Set the eligible count under which a restock is wanted.
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = Some(size);
        self
    }

    /// Set the maximum number of records in the pool.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    /// Set the minimum health percentage.
    pub fn health_threshold(mut self, pct: f64) -> Self {
        self.health_threshold = Some(pct);
        self
    }

    /// Set the maximum tolerated average latency.
    pub fn latency_threshold(mut self, latency: Duration) -> Self {
        self.latency_threshold = Some(latency);
        self
    }

    /// Set the grace period, in samples, for new proxies.
    pub fn min_sample_size(mut self, samples: u32) -> Self {
        self.min_sample_size = Some(samples);
        self
    }

    /// Set the consecutive failure cap.
    pub fn failure_cap(mut self, failures: u32) -> Self {
        self.failure_cap = Some(failures);
        self
    }

    /// Set the per-proxy cooldown.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set the minimum time between proactive restocks.
    pub fn restock_interval(mut self, interval: Duration) -> Self {
        self.restock_interval = Some(interval);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        let min_size = self.min_size.unwrap_or(10);
        ProxyPoolConfig {
            min_size,
            max_size: self.max_size.unwrap_or(50).max(min_size),
            health_threshold: self.health_threshold.unwrap_or(50.0).clamp(0.0, 100.0),
            latency_threshold: self.latency_threshold.unwrap_or(Duration::from_secs(5)),
            min_sample_size: self.min_sample_size.unwrap_or(10),
            failure_cap: self.failure_cap.unwrap_or(5).max(1),
            cooldown: self.cooldown.unwrap_or(Duration::from_secs(10)),
            restock_interval: self.restock_interval.unwrap_or(Duration::from_secs(30)),
        }
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the probe engine.
#[derive(Debug, Clone)]
pub struct ProbeEngineConfig {
    /// Attempts per candidate before it is reported as exhausted.
    pub max_attempts: u32,
    /// Number of candidates probed at the same time.
    pub concurrency: usize,
    /// Timeout for a single probe request.
    pub probe_timeout: Duration,
    /// First delay between two attempts of the same candidate.
    pub retry_base_delay: Duration,
    /// Upper bound for the inter-attempt delay.
    pub retry_max_delay: Duration,
    /// Acquisition retries on an empty pool before the candidate is requeued.
    pub pool_empty_retries: u32,
    /// Wait between two acquisition retries on an empty pool.
    pub pool_empty_delay: Duration,
    /// Wait before polling a candidate source that had nothing ready.
    pub idle_delay: Duration,
    /// Longest the engine waits for the sink to accept one report.
    pub sink_timeout: Duration,
    /// Optional global cap on probes per second.
    pub max_probes_per_second: Option<f64>,
}

impl ProbeEngineConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProbeEngineConfigBuilder {
        ProbeEngineConfigBuilder::new()
    }
}

impl Default for ProbeEngineConfig {
    fn default() -> Self {
        ProbeEngineConfigBuilder::new().build()
    }
}

/// Builder for `ProbeEngineConfig`.
#[derive(Default)]
pub struct ProbeEngineConfigBuilder {
    max_attempts: Option<u32>,
    concurrency: Option<usize>,
    probe_timeout: Option<Duration>,
    retry_base_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    pool_empty_retries: Option<u32>,
    pool_empty_delay: Option<Duration>,
    idle_delay: Option<Duration>,
    sink_timeout: Option<Duration>,
    max_probes_per_second: Option<f64>,
}

impl ProbeEngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts per candidate.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set the concurrency cap.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set the per-probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Set the base retry delay.
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    /// Set the maximum retry delay.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    /// Set how many times acquisition is retried on an empty pool.
    pub fn pool_empty_retries(mut self, retries: u32) -> Self {
        self.pool_empty_retries = Some(retries);
        self
    }

    /// Set the wait between acquisition retries on an empty pool.
    pub fn pool_empty_delay(mut self, delay: Duration) -> Self {
        self.pool_empty_delay = Some(delay);
        self
    }

    /// Set the wait used when the candidate source has nothing ready.
    pub fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = Some(delay);
        self
    }

    /// Set the sink delivery timeout.
    pub fn sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = Some(timeout);
        self
    }

    /// Cap the global probe rate.
    pub fn max_probes_per_second(mut self, rps: f64) -> Self {
        self.max_probes_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProbeEngineConfig {
        let retry_base_delay = self.retry_base_delay.unwrap_or(Duration::from_millis(500));
        ProbeEngineConfig {
            max_attempts: self.max_attempts.unwrap_or(3).max(1),
            concurrency: self.concurrency.unwrap_or(10).max(1),
            probe_timeout: self.probe_timeout.unwrap_or(Duration::from_secs(10)),
            retry_base_delay,
            retry_max_delay: self
                .retry_max_delay
                .unwrap_or(Duration::from_secs(8))
                .max(retry_base_delay),
            pool_empty_retries: self.pool_empty_retries.unwrap_or(3),
            pool_empty_delay: self.pool_empty_delay.unwrap_or(Duration::from_secs(2)),
            idle_delay: self.idle_delay.unwrap_or(Duration::from_secs(1)),
            sink_timeout: self.sink_timeout.unwrap_or(Duration::from_secs(5)),
            max_probes_per_second: self.max_probes_per_second.filter(|rps| *rps > 0.0),
        }
    }
}
