//! Driver configuration.
//!
//! Loaded from the environment (prefix `TRAWL_`) or a TOML file via figment.
//! Duration fields accept both numeric values (seconds) and duration strings
//! with units ("500ms", "2m", "30s").

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};

/// Top-level driver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Directory for archived files. Defaults to a `trawl_files` dir next to
    /// the database.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Number of initial concurrent workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Ceiling for dynamic scaling.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Reset stale in-progress rows to pending on open.
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// Start the worker monitor for dynamic scaling. Disable in tests that
    /// need the driver to exit quickly.
    #[serde(default = "default_enable_monitor")]
    pub enable_monitor: bool,
    /// Total backoff budget per request before it is marked failed.
    #[serde(
        default = "default_max_backoff_time",
        deserialize_with = "deserialize_duration"
    )]
    pub max_backoff_time: Duration,
    /// Base delay of the exponential backoff.
    #[serde(
        default = "default_retry_base_delay",
        deserialize_with = "deserialize_duration"
    )]
    pub retry_base_delay: Duration,
    /// Per-request HTTP timeout. Zero disables the timeout.
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,
    /// Queue poll interval while other workers may still produce work.
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub poll_interval: Duration,
    /// How long the queue must be truly idle before a worker exits.
    #[serde(
        default = "default_idle_grace",
        deserialize_with = "deserialize_duration"
    )]
    pub idle_grace: Duration,
    /// Worker monitor wake interval.
    #[serde(
        default = "default_monitor_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub monitor_interval: Duration,
    /// Store fetched responses into the request-fingerprint cache.
    #[serde(default)]
    pub populate_cache: bool,
    #[serde(default)]
    pub atb: AtbConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            num_workers: default_num_workers(),
            max_workers: default_max_workers(),
            resume: default_resume(),
            enable_monitor: default_enable_monitor(),
            max_backoff_time: default_max_backoff_time(),
            retry_base_delay: default_retry_base_delay(),
            request_timeout: default_request_timeout(),
            poll_interval: default_poll_interval(),
            idle_grace: default_idle_grace(),
            monitor_interval: default_monitor_interval(),
            populate_cache: false,
            atb: AtbConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Load from environment variables prefixed `TRAWL_`.
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Env::prefixed("TRAWL_").split("__"))
            .extract()
    }

    /// Load from a TOML file, with `TRAWL_` environment overrides on top.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TRAWL_").split("__"))
            .extract()
    }
}

fn default_num_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    10
}

fn default_resume() -> bool {
    true
}

fn default_enable_monitor() -> bool {
    true
}

/// One hour of cumulative backoff before giving up on a request.
fn default_max_backoff_time() -> Duration {
    Duration::from_secs(3600)
}

fn default_retry_base_delay() -> Duration {
    Duration::from_secs(1)
}

/// Zero means no HTTP timeout.
fn default_request_timeout() -> Duration {
    Duration::ZERO
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_idle_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(60)
}

/// Adaptive Token Bucket parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AtbConfig {
    /// Maximum tokens in the bucket.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: f64,
    /// Starting token count.
    #[serde(default = "default_initial_tokens")]
    pub initial_tokens: f64,
    /// Initial rate in tokens/second (0.1 = 6 req/min).
    #[serde(default = "default_initial_rate")]
    pub initial_rate: f64,
    /// Initial congestion rate.
    #[serde(default = "default_initial_congestion")]
    pub initial_congestion: f64,
    /// Aggressive increase multiplier, applied below the congestion rate.
    #[serde(default = "default_first_step")]
    pub first_step: f64,
    /// Conservative increase multiplier, applied at or above it.
    #[serde(default = "default_second_step")]
    pub second_step: f64,
    #[serde(default = "default_min_rate")]
    pub min_rate: f64,
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
}

impl Default for AtbConfig {
    fn default() -> Self {
        Self {
            bucket_size: default_bucket_size(),
            initial_tokens: default_initial_tokens(),
            initial_rate: default_initial_rate(),
            initial_congestion: default_initial_congestion(),
            first_step: default_first_step(),
            second_step: default_second_step(),
            min_rate: default_min_rate(),
            max_rate: default_max_rate(),
        }
    }
}

fn default_bucket_size() -> f64 {
    4.0
}

fn default_initial_tokens() -> f64 {
    1.0
}

fn default_initial_rate() -> f64 {
    0.1
}

fn default_initial_congestion() -> f64 {
    1.0
}

fn default_first_step() -> f64 {
    1.5
}

fn default_second_step() -> f64 {
    1.2
}

fn default_min_rate() -> f64 {
    0.01
}

fn default_max_rate() -> f64 {
    40.0
}

/// Duration parser with seconds as the default unit. No fractions,
/// exponents, or infinity.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::MilliSecond, TimeUnit::Second, TimeUnit::Minute])
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Accepts an unsigned integer (seconds) or a duration string ("1500ms").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "invalid duration '{value}': {e}. Examples: '5' (seconds), '1500ms', '30s', '2m'"
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration out of range: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
