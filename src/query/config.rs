use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for query behavior.
///
/// Durations are (de)serialized as milliseconds so the config can be loaded
/// from JSON or TOML:
///
/// ```
/// use quiver::query::QueryConfig;
///
/// let config: QueryConfig = serde_json::from_str(
///     r#"{ "cache_timeout_ms": 5000, "retry": { "max_retries": 2 } }"#,
/// ).unwrap();
/// assert_eq!(config.cache_timeout.as_millis(), 5000);
/// assert_eq!(config.retry.max_retries, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// How long a successful query result is served from the cache.
    ///
    /// A zero timeout disables caching entirely.
    #[serde(rename = "cache_timeout_ms", with = "millis")]
    pub cache_timeout: Duration,

    /// Upper bound for a single transport call. `None` waits forever.
    #[serde(rename = "timeout_ms", with = "millis::option")]
    pub timeout: Option<Duration>,

    /// Retries applied to retryable transport failures.
    pub retry: RetryPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_secs(30),
            timeout: None,
            retry: RetryPolicy::none(),
        }
    }
}

impl QueryConfig {
    /// Creates a new query configuration with the given cache timeout.
    #[must_use]
    pub const fn new(cache_timeout: Duration) -> Self {
        Self {
            cache_timeout,
            timeout: None,
            retry: RetryPolicy::none(),
        }
    }

    #[must_use]
    pub const fn with_cache_timeout(mut self, cache_timeout: Duration) -> Self {
        self.cache_timeout = cache_timeout;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Exponential backoff for failed transport calls.
///
/// Attempt `n` (zero-based) waits `base_delay * 2^n` before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Never retry.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub const fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// Doubles per attempt and saturates at [`Duration::MAX`] once the factor
    /// no longer fits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_millis))
        }
    }
}
