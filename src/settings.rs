/*!
 * TOML settings for the resilience registries
 *
 * A settings file has one section per primitive. Each section holds shared
 * configurations under `configs` and pre-created instances under `instances`:
 *
 * ```toml
 * [logging]
 * level = "debug"
 *
 * [circuit_breaker.configs.default]
 * sliding_window_size = 50
 *
 * [circuit_breaker.configs.critical]
 * failure_rate_threshold = 25.0
 *
 * [circuit_breaker.instances.payments]
 * base_config = "critical"
 * wait_duration_in_open_state_ms = 5000
 * ```
 *
 * Every properties block only overrides the fields it names. A block without
 * `base_config` builds on the section's `default` config. Durations are given
 * in milliseconds.
 */

use crate::error::{BulwarkError, Result};
use bulwark_core_resilience::bulkhead::BulkheadRegistry;
use bulwark_core_resilience::circuit_breaker::CircuitBreakerRegistry;
use bulwark_core_resilience::rate_limiter::RateLimiterRegistry;
use bulwark_core_resilience::registry::DEFAULT_CONFIG_NAME;
use bulwark_core_resilience::retry::RetryRegistry;
use bulwark_core_resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, IntervalFunction, RateLimiter,
    RateLimiterConfig, Registry, ResilienceError, Retry, RetryConfig, SlidingWindowType,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,

    /// Write JSON lines here instead of compact output on stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Force debug level regardless of `level`
    pub verbose: bool,
}

/// Shared configs and instances of one primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Section<P> {
    pub configs: BTreeMap<String, P>,
    pub instances: BTreeMap<String, P>,
}

impl<P> Default for Section<P> {
    fn default() -> Self {
        Self {
            configs: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }
}

/// Root of a settings file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub circuit_breaker: Section<CircuitBreakerProperties>,
    pub rate_limiter: Section<RateLimiterProperties>,
    pub bulkhead: Section<BulkheadProperties>,
    pub retry: Section<RetryProperties>,
}

type Customize<C> = Arc<dyn Fn(C) -> C + Send + Sync>;

/// A properties block that overlays its fields onto a primitive's config
pub trait Properties: Clone + Send + Sync + 'static {
    type Config: Clone + Default + Send + Sync + 'static;

    /// Section name used in error messages
    const SECTION: &'static str;

    fn base_config(&self) -> Option<&str>;

    /// Build the overlay. Fails if the block itself is inconsistent.
    fn customizer(&self) -> std::result::Result<Customize<Self::Config>, ResilienceError>;

    fn validate(config: &Self::Config) -> std::result::Result<(), ResilienceError>;
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Window shape as written in settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    CountBased,
    TimeBased,
}

impl From<WindowType> for SlidingWindowType {
    fn from(value: WindowType) -> Self {
        match value {
            WindowType::CountBased => SlidingWindowType::CountBased,
            WindowType::TimeBased => SlidingWindowType::TimeBased,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_rate_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_call_rate_threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_call_duration_threshold_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window_type: Option<WindowType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sliding_window_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_number_of_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permitted_number_of_calls_in_half_open_state: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_in_half_open_state_ms: Option<u64>,
    /// Fixed open wait, or the first wait when a multiplier is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_duration_in_open_state_ms: Option<u64>,
    /// Grow the open wait on every consecutive open period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponential_backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponential_max_wait_duration_in_open_state_ms: Option<u64>,
}

impl CircuitBreakerProperties {
    fn open_wait(&self) -> std::result::Result<Option<IntervalFunction>, ResilienceError> {
        match (self.exponential_backoff_multiplier, self.wait_duration_in_open_state_ms) {
            (Some(multiplier), initial) => {
                let initial = initial.map_or(Duration::from_secs(60), millis);
                let max = self
                    .exponential_max_wait_duration_in_open_state_ms
                    .map_or(Duration::MAX, millis);
                IntervalFunction::exponential_with_max(initial, multiplier, max).map(Some)
            }
            (None, Some(wait)) => Ok(Some(IntervalFunction::fixed(millis(wait)))),
            (None, None) => Ok(None),
        }
    }
}

impl Properties for CircuitBreakerProperties {
    type Config = CircuitBreakerConfig;
    const SECTION: &'static str = "circuit_breaker";

    fn base_config(&self) -> Option<&str> {
        self.base_config.as_deref()
    }

    fn customizer(&self) -> std::result::Result<Customize<CircuitBreakerConfig>, ResilienceError> {
        let open_wait = self.open_wait()?;
        let p = self.clone();
        Ok(Arc::new(move |mut c: CircuitBreakerConfig| {
            if let Some(v) = p.failure_rate_threshold {
                c.failure_rate_threshold = v;
            }
            if let Some(v) = p.slow_call_rate_threshold {
                c.slow_call_rate_threshold = v;
            }
            if let Some(v) = p.slow_call_duration_threshold_ms {
                c.slow_call_duration_threshold = millis(v);
            }
            if let Some(v) = p.sliding_window_type {
                c.sliding_window_type = v.into();
            }
            if let Some(v) = p.sliding_window_size {
                c.sliding_window_size = v;
            }
            if let Some(v) = p.minimum_number_of_calls {
                c.minimum_number_of_calls = v;
            }
            if let Some(v) = p.permitted_number_of_calls_in_half_open_state {
                c.permitted_number_of_calls_in_half_open_state = v;
            }
            if let Some(v) = p.max_wait_duration_in_half_open_state_ms {
                c.max_wait_duration_in_half_open_state = millis(v);
            }
            if let Some(wait) = &open_wait {
                c.wait_duration_in_open_state = wait.clone();
            }
            c
        }))
    }

    fn validate(config: &CircuitBreakerConfig) -> std::result::Result<(), ResilienceError> {
        config.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_for_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_refresh_period_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_duration_ms: Option<u64>,
}

impl Properties for RateLimiterProperties {
    type Config = RateLimiterConfig;
    const SECTION: &'static str = "rate_limiter";

    fn base_config(&self) -> Option<&str> {
        self.base_config.as_deref()
    }

    fn customizer(&self) -> std::result::Result<Customize<RateLimiterConfig>, ResilienceError> {
        let p = self.clone();
        Ok(Arc::new(move |mut c: RateLimiterConfig| {
            if let Some(v) = p.limit_for_period {
                c.limit_for_period = v;
            }
            if let Some(v) = p.limit_refresh_period_ms {
                c.limit_refresh_period = millis(v);
            }
            if let Some(v) = p.timeout_duration_ms {
                c.timeout_duration = millis(v);
            }
            c
        }))
    }

    fn validate(config: &RateLimiterConfig) -> std::result::Result<(), ResilienceError> {
        config.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_calls: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_duration_ms: Option<u64>,
}

impl Properties for BulkheadProperties {
    type Config = BulkheadConfig;
    const SECTION: &'static str = "bulkhead";

    fn base_config(&self) -> Option<&str> {
        self.base_config.as_deref()
    }

    fn customizer(&self) -> std::result::Result<Customize<BulkheadConfig>, ResilienceError> {
        let p = self.clone();
        Ok(Arc::new(move |mut c: BulkheadConfig| {
            if let Some(v) = p.max_concurrent_calls {
                c.max_concurrent_calls = v;
            }
            if let Some(v) = p.max_wait_duration_ms {
                c.max_wait_duration = millis(v);
            }
            c
        }))
    }

    fn validate(config: &BulkheadConfig) -> std::result::Result<(), ResilienceError> {
        config.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Fixed wait, or the first wait when a multiplier is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponential_backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exponential_max_wait_duration_ms: Option<u64>,
    /// Jitter factor in `[0, 1)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub randomized_wait_factor: Option<f64>,
}

impl RetryProperties {
    fn interval(&self) -> std::result::Result<Option<IntervalFunction>, ResilienceError> {
        if self.wait_duration_ms.is_none()
            && self.exponential_backoff_multiplier.is_none()
            && self.randomized_wait_factor.is_none()
        {
            return Ok(None);
        }
        let initial = self.wait_duration_ms.map_or(Duration::from_millis(500), millis);
        let max = self.exponential_max_wait_duration_ms.map_or(Duration::MAX, millis);
        let interval = match (self.exponential_backoff_multiplier, self.randomized_wait_factor) {
            (Some(multiplier), Some(factor)) => {
                IntervalFunction::exponential_randomized(initial, multiplier, factor, max)?
            }
            (Some(multiplier), None) => IntervalFunction::exponential_with_max(initial, multiplier, max)?,
            (None, Some(factor)) => IntervalFunction::randomized(initial, factor)?,
            (None, None) => IntervalFunction::fixed(initial),
        };
        Ok(Some(interval))
    }
}

impl Properties for RetryProperties {
    type Config = RetryConfig;
    const SECTION: &'static str = "retry";

    fn base_config(&self) -> Option<&str> {
        self.base_config.as_deref()
    }

    fn customizer(&self) -> std::result::Result<Customize<RetryConfig>, ResilienceError> {
        let interval = self.interval()?;
        let max_attempts = self.max_attempts;
        Ok(Arc::new(move |mut c: RetryConfig| {
            if let Some(v) = max_attempts {
                c.max_attempts = v;
            }
            if let Some(interval) = &interval {
                c.interval_function = interval.clone();
            }
            c
        }))
    }

    fn validate(config: &RetryConfig) -> std::result::Result<(), ResilienceError> {
        config.validate()
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| BulwarkError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&contents)?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// Parse settings from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Render settings as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Register shared configs and create the configured instances.
    ///
    /// `default` configs are skipped here: a registry's fallback is fixed
    /// when it is built, see [`Registries::from_settings`].
    pub fn apply(&self, registries: &Registries) -> Result<()> {
        apply_section(&self.circuit_breaker, &registries.circuit_breakers)?;
        apply_section(&self.rate_limiter, &registries.rate_limiters)?;
        apply_section(&self.bulkhead, &registries.bulkheads)?;
        apply_section(&self.retry, &registries.retries)?;
        info!(
            circuit_breakers = registries.circuit_breakers.names().len(),
            rate_limiters = registries.rate_limiters.names().len(),
            bulkheads = registries.bulkheads.names().len(),
            retries = registries.retries.names().len(),
            "settings applied"
        );
        Ok(())
    }
}

/// One registry per primitive
pub struct Registries {
    pub circuit_breakers: CircuitBreakerRegistry,
    pub rate_limiters: RateLimiterRegistry,
    pub bulkheads: BulkheadRegistry,
    pub retries: RetryRegistry,
}

impl Registries {
    /// Registries on the built-in defaults
    pub fn new() -> Self {
        Self {
            circuit_breakers: CircuitBreaker::registry(CircuitBreakerConfig::default()),
            rate_limiters: RateLimiter::registry(RateLimiterConfig::default()),
            bulkheads: Bulkhead::registry(BulkheadConfig::default()),
            retries: Retry::registry(RetryConfig::default()),
        }
    }

    /// Registries whose fallback is each section's `default` config, with
    /// the rest of `settings` applied
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let registries = Self {
            circuit_breakers: CircuitBreaker::registry(default_config(&settings.circuit_breaker)?),
            rate_limiters: RateLimiter::registry(default_config(&settings.rate_limiter)?),
            bulkheads: Bulkhead::registry(default_config(&settings.bulkhead)?),
            retries: Retry::registry(default_config(&settings.retry)?),
        };
        settings.apply(&registries)?;
        Ok(registries)
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries")
            .field("circuit_breakers", &self.circuit_breakers.names())
            .field("rate_limiters", &self.rate_limiters.names())
            .field("bulkheads", &self.bulkheads.names())
            .field("retries", &self.retries.names())
            .finish()
    }
}

fn default_config<P: Properties>(section: &Section<P>) -> Result<P::Config> {
    let err = |source| BulwarkError::resilience(P::SECTION, DEFAULT_CONFIG_NAME, source);
    let Some(props) = section.configs.get(DEFAULT_CONFIG_NAME) else {
        return Ok(P::Config::default());
    };
    if let Some(base) = props.base_config() {
        return Err(err(ResilienceError::InvalidConfig(format!(
            "the default config cannot derive from '{}'",
            base
        ))));
    }
    let config = props.customizer().map_err(err)?(P::Config::default());
    P::validate(&config).map_err(err)?;
    Ok(config)
}

fn apply_section<T, P>(section: &Section<P>, registry: &Registry<T, P::Config>) -> Result<()>
where
    T: fmt::Debug + Send + Sync + 'static,
    P: Properties,
{
    for name in shared_config_order(&section.configs)? {
        let err = |source| BulwarkError::resilience(P::SECTION, name, source);
        let props = &section.configs[name];
        let customize = props.customizer().map_err(err)?;
        let base = props.base_config().unwrap_or(DEFAULT_CONFIG_NAME);
        registry
            .add_derived_configuration(name, base, move |config| customize(config))
            .map_err(err)?;
        let resolved = registry.configuration(name).map_err(err)?;
        P::validate(&resolved).map_err(err)?;
        debug!(section = P::SECTION, name, base, "shared config registered");
    }

    for (name, props) in &section.instances {
        let err = |source| BulwarkError::resilience(P::SECTION, name, source);
        let base = match props.base_config() {
            Some(base) => registry.configuration(base).map_err(err)?,
            None => registry.default_config(),
        };
        let config = props.customizer().map_err(err)?(base);
        registry.get_or_create_with_config(name, config).map_err(err)?;
        debug!(section = P::SECTION, name = %name, "instance created");
    }
    Ok(())
}

/// Names of the non-default shared configs, every base before the configs
/// derived from it
fn shared_config_order<P: Properties>(configs: &BTreeMap<String, P>) -> Result<Vec<&str>> {
    let mut ordered = Vec::new();
    let mut placed: HashSet<&str> = HashSet::new();

    for start in configs.keys().map(String::as_str) {
        let mut chain: Vec<&str> = Vec::new();
        let mut current = start;
        while current != DEFAULT_CONFIG_NAME && !placed.contains(current) {
            let Some(props) = configs.get(current) else {
                // Unknown bases are reported by the registry.
                break;
            };
            if chain.contains(&current) {
                let mut cycle: Vec<String> = chain.iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return Err(BulwarkError::resilience(
                    P::SECTION,
                    start,
                    ResilienceError::ConfigurationCycle(cycle),
                ));
            }
            chain.push(current);
            match props.base_config() {
                Some(base) => current = base,
                None => break,
            }
        }
        for name in chain.into_iter().rev() {
            if placed.insert(name) {
                ordered.push(name);
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[logging]
level = "debug"

[circuit_breaker.configs.default]
sliding_window_size = 20
minimum_number_of_calls = 10

[circuit_breaker.configs.critical]
failure_rate_threshold = 25.0
wait_duration_in_open_state_ms = 5000

[circuit_breaker.configs.critical_slow]
base_config = "critical"
slow_call_duration_threshold_ms = 200

[circuit_breaker.instances.payments]
base_config = "critical_slow"

[circuit_breaker.instances.search]
failure_rate_threshold = 80.0

[rate_limiter.instances.api]
limit_for_period = 10
limit_refresh_period_ms = 1000
timeout_duration_ms = 0

[bulkhead.instances.db]
max_concurrent_calls = 4

[retry.configs.backoff]
max_attempts = 5
wait_duration_ms = 100
exponential_backoff_multiplier = 2.0
exponential_max_wait_duration_ms = 1000

[retry.instances.fetch]
base_config = "backoff"
"#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.circuit_breaker.configs.len(), 3);
        assert_eq!(
            settings.circuit_breaker.instances["payments"].base_config.as_deref(),
            Some("critical_slow")
        );
        assert_eq!(settings.rate_limiter.instances["api"].limit_for_period, Some(10));
    }

    #[test]
    fn test_empty_settings_are_default() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Settings::from_toml("[bulkhead.instances.db]\nmax_concurent_calls = 3\n").unwrap_err();
        assert!(matches!(err, BulwarkError::Parse(_)));
    }

    #[test]
    fn test_inheritance_chain() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let registries = Registries::from_settings(&settings).unwrap();

        let payments = registries.circuit_breakers.find("payments").unwrap();
        let config = payments.config();
        assert_eq!(config.sliding_window_size, 20, "from default");
        assert_eq!(config.failure_rate_threshold, 25.0, "from critical");
        assert_eq!(config.slow_call_duration_threshold, Duration::from_millis(200));
        assert_eq!(config.wait_duration_in_open_state.wait(1), Duration::from_secs(5));

        let search = registries.circuit_breakers.find("search").unwrap();
        assert_eq!(search.config().failure_rate_threshold, 80.0);
        assert_eq!(search.config().minimum_number_of_calls, 10);
    }

    #[test]
    fn test_retry_backoff_from_settings() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let registries = Registries::from_settings(&settings).unwrap();
        let fetch = registries.retries.find("fetch").unwrap();

        assert_eq!(fetch.config().max_attempts, 5);
        let wait = &fetch.config().interval_function;
        assert_eq!(wait.wait(1), Duration::from_millis(100));
        assert_eq!(wait.wait(2), Duration::from_millis(200));
        assert_eq!(wait.wait(10), Duration::from_millis(1000), "capped");
    }

    #[test]
    fn test_config_cycle_is_reported() {
        let toml = r#"
[bulkhead.configs.a]
base_config = "b"

[bulkhead.configs.b]
base_config = "a"
"#;
        let settings = Settings::from_toml(toml).unwrap();
        let err = Registries::from_settings(&settings).unwrap_err();
        match err {
            BulwarkError::Resilience {
                source: ResilienceError::ConfigurationCycle(chain),
                ..
            } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_base_is_reported() {
        let toml = "[retry.instances.fetch]\nbase_config = \"missing\"\n";
        let settings = Settings::from_toml(toml).unwrap();
        let err = Registries::from_settings(&settings).unwrap_err();
        assert!(matches!(
            err,
            BulwarkError::Resilience {
                source: ResilienceError::UnknownConfiguration(_),
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_shared_config_fails_at_load() {
        let toml = "[bulkhead.configs.broken]\nmax_concurrent_calls = 0\n";
        let settings = Settings::from_toml(toml).unwrap();
        let err = Registries::from_settings(&settings).unwrap_err();
        assert_eq!(err.to_string().split(':').next(), Some("bulkhead.broken"));
    }

    #[test]
    fn test_default_cannot_have_base() {
        let toml = "[rate_limiter.configs.default]\nbase_config = \"other\"\n";
        let settings = Settings::from_toml(toml).unwrap();
        assert!(Registries::from_settings(&settings).is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        let rendered = settings.to_toml().unwrap();
        assert_eq!(Settings::from_toml(&rendered).unwrap(), settings);
    }
}
