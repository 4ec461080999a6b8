use crate::core::{Result, RoutingError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Routing layer configuration.
///
/// Durations are stored in milliseconds so the struct maps one-to-one onto
/// its JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub cache: CacheConfig,
    pub endpoints: EndpointConfig,
}

/// Settings shared by the metadata caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound for a single metadata fetch
    pub fetch_timeout_ms: u64,

    /// Age after which cached addresses are refreshed in the background
    pub address_refresh_ttl_ms: u64,

    /// How long past the TTL stale addresses may still be served
    pub address_grace_period_ms: u64,

    /// First delay between failed background refreshes
    pub refresh_backoff_base_ms: u64,

    /// Cap for the background refresh delay
    pub refresh_backoff_max_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 10_000,
            address_refresh_ttl_ms: 300_000,
            address_grace_period_ms: 60_000,
            refresh_backoff_base_ms: 100,
            refresh_backoff_max_ms: 5_000,
        }
    }
}

/// Doubling beyond this many steps already exceeds any sensible cap.
const MAX_BACKOFF_DOUBLINGS: u32 = 20;

impl CacheConfig {
    /// Set the fetch timeout
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the address refresh TTL
    pub fn address_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.address_refresh_ttl_ms = duration_ms(ttl);
        self
    }

    /// Set the stale-while-revalidate grace period
    pub fn address_grace_period(mut self, grace: Duration) -> Self {
        self.address_grace_period_ms = duration_ms(grace);
        self
    }

    /// Set the background refresh backoff bounds
    pub fn refresh_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.refresh_backoff_base_ms = duration_ms(base);
        self.refresh_backoff_max_ms = duration_ms(max);
        self
    }

    pub fn fetch_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn address_refresh_ttl_duration(&self) -> Duration {
        Duration::from_millis(self.address_refresh_ttl_ms)
    }

    pub fn address_grace_period_duration(&self) -> Duration {
        Duration::from_millis(self.address_grace_period_ms)
    }

    /// Delay before the next background refresh after `failures` consecutive
    /// failed attempts.
    pub fn refresh_backoff_after(&self, failures: u32) -> Duration {
        let base = self.refresh_backoff_base_ms.max(1);
        let cap = self.refresh_backoff_max_ms.max(base);

        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        Duration::from_millis(base.saturating_mul(1u64 << exponent).min(cap))
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_timeout_ms == 0 {
            return Err(RoutingError::ConfigError(
                "cache.fetch_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.address_refresh_ttl_ms == 0 {
            return Err(RoutingError::ConfigError(
                "cache.address_refresh_ttl_ms must be > 0".to_string(),
            ));
        }
        if self.refresh_backoff_base_ms > self.refresh_backoff_max_ms {
            return Err(RoutingError::ConfigError(
                "cache.refresh_backoff_base_ms cannot exceed cache.refresh_backoff_max_ms"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the regional endpoint manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Global account endpoint, used for topology discovery
    pub default_endpoint: String,

    /// Regions in the order the client prefers them
    pub preferred_regions: Vec<String>,

    /// Use every write region of a multi-write account
    pub enable_multiple_write_locations: bool,

    /// Consecutive failures before a healthy region becomes suspected
    pub failure_threshold: u32,

    /// How long a region may keep failing while suspected before it is
    /// marked unavailable
    pub unavailable_after_ms: u64,

    /// How long an unavailable region rests before it is checked again
    pub recheck_cooldown_ms: u64,

    /// Period of the background topology refresh
    pub topology_refresh_interval_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            default_endpoint: String::new(),
            preferred_regions: Vec::new(),
            enable_multiple_write_locations: true,
            failure_threshold: 3,
            unavailable_after_ms: 30_000,
            recheck_cooldown_ms: 30_000,
            topology_refresh_interval_ms: 300_000,
        }
    }
}

impl EndpointConfig {
    /// Create a configuration for the account reachable at `default_endpoint`
    pub fn new(default_endpoint: &str) -> Self {
        Self {
            default_endpoint: default_endpoint.to_string(),
            ..Self::default()
        }
    }

    /// Set the preferred regions
    pub fn preferred_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable multi-region writes
    pub fn multiple_write_locations(mut self, enabled: bool) -> Self {
        self.enable_multiple_write_locations = enabled;
        self
    }

    /// Set the consecutive failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the suspected-to-unavailable window
    pub fn unavailable_after(mut self, window: Duration) -> Self {
        self.unavailable_after_ms = duration_ms(window);
        self
    }

    /// Set the recheck cooldown
    pub fn recheck_cooldown(mut self, cooldown: Duration) -> Self {
        self.recheck_cooldown_ms = duration_ms(cooldown);
        self
    }

    /// Set the topology refresh period
    pub fn topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval_ms = duration_ms(interval);
        self
    }

    pub fn unavailable_after_duration(&self) -> Duration {
        Duration::from_millis(self.unavailable_after_ms)
    }

    pub fn recheck_cooldown_duration(&self) -> Duration {
        Duration::from_millis(self.recheck_cooldown_ms)
    }

    pub fn topology_refresh_interval_duration(&self) -> Duration {
        Duration::from_millis(self.topology_refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_endpoint.trim().is_empty() {
            return Err(RoutingError::ConfigError(
                "endpoints.default_endpoint must not be empty".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(RoutingError::ConfigError(
                "endpoints.failure_threshold must be >= 1".to_string(),
            ));
        }
        if self.topology_refresh_interval_ms == 0 {
            return Err(RoutingError::ConfigError(
                "endpoints.topology_refresh_interval_ms must be > 0".to_string(),
            ));
        }
        if self.preferred_regions.iter().any(|region| region.trim().is_empty()) {
            return Err(RoutingError::ConfigError(
                "endpoints.preferred_regions must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }
}

impl RoutingConfig {
    /// Create a configuration with default cache settings
    pub fn new(default_endpoint: &str) -> Self {
        Self {
            cache: CacheConfig::default(),
            endpoints: EndpointConfig::new(default_endpoint),
        }
    }

    /// Replace the cache settings
    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the endpoint settings
    pub fn endpoints(mut self, endpoints: EndpointConfig) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RoutingError::ConfigError(format!(
                "Failed to read routing config '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.endpoints.validate()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
