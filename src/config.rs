//! Circuit breaker configuration.
//!
//! Configuration is immutable once a breaker is created: every field has a
//! default, values are validated once at construction, and invalid values
//! fail fast with [`BreakerError::InvalidConfig`] rather than at call time.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use fusebox::CircuitBreakerConfig;
//!
//! // Defaults: 5 failures, 2s call timeout, 10s reset timeout
//! let config = CircuitBreakerConfig::default();
//! assert_eq!(config.max_failures, 5);
//!
//! // A breaker that never times out individual calls and never auto-resets
//! let manual = CircuitBreakerConfig {
//!     call_timeout: None,
//!     reset_timeout: None,
//!     ..CircuitBreakerConfig::default()
//! };
//! assert!(manual.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::{
    error::{BreakerError, Result},
    notify::DEFAULT_NOTIFICATION_TOPIC,
};

/// Configuration for a [`CircuitBreaker`](crate::CircuitBreaker).
///
/// These parameters control when the circuit opens, how individual calls are
/// bounded, how long the circuit stays open before probing recovery, and how
/// state changes are announced.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of qualifying failures that opens the circuit.
    ///
    /// Once this many failures accumulate in the closed state, the circuit
    /// transitions to open. Must be at least 1.
    ///
    /// Default: 5
    pub max_failures: u32,

    /// Per-call timeout for the guarded operation.
    ///
    /// An operation that does not resolve within this duration is classified
    /// as a qualifying failure and its late completion is discarded.
    /// `None` disables the per-call timeout entirely; an operation that never
    /// signals then never resolves, which is accepted as caller
    /// misconfiguration.
    ///
    /// Default: 2 seconds
    pub call_timeout: Option<Duration>,

    /// Cooldown before an open circuit probes recovery via half-open.
    ///
    /// `None` means the circuit never auto-resets; only a manual
    /// [`reset`](crate::CircuitBreaker::reset) closes it again.
    ///
    /// Default: 10 seconds
    pub reset_timeout: Option<Duration>,

    /// Whether a failure of the guarded operation itself (not just an open
    /// circuit) triggers the fallback.
    ///
    /// The failure still counts toward the threshold either way.
    ///
    /// Default: `false`
    pub fallback_on_failure: bool,

    /// Topic under which state-change records are published.
    ///
    /// `None` disables notification publishing even when a publisher is
    /// configured.
    ///
    /// Default: [`DEFAULT_NOTIFICATION_TOPIC`]
    pub notification_topic: Option<String>,

    /// Identifier of the emitting process in published records.
    ///
    /// Default: `"local"`
    pub node_id: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            call_timeout: Some(Duration::from_secs(2)),
            reset_timeout: Some(Duration::from_secs(10)),
            fallback_on_failure: false,
            notification_topic: Some(DEFAULT_NOTIFICATION_TOPIC.to_owned()),
            node_id: "local".to_owned(),
        }
    }
}

/// TOML shape of [`CircuitBreakerConfig`].
///
/// Durations are expressed in milliseconds; absent keys take the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    max_failures: Option<u32>,
    #[serde(default)]
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    reset_timeout_ms: Option<u64>,
    #[serde(default)]
    fallback_on_failure: Option<bool>,
    #[serde(default)]
    notification_topic: Option<String>,
    #[serde(default)]
    node_id: Option<String>,
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use fusebox::CircuitBreakerConfig;
    ///
    /// let config = CircuitBreakerConfig::new();
    /// assert_eq!(config.max_failures, 5);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a TOML document.
    ///
    /// Recognized keys: `max_failures`, `call_timeout_ms`, `reset_timeout_ms`,
    /// `fallback_on_failure`, `notification_topic`, `node_id`. Absent keys
    /// take the defaults; a duration of `0` is rejected the same way
    /// `Some(Duration::ZERO)` is.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::InvalidConfig`] if the document does not parse
    /// or the resulting configuration fails validation.
    ///
    /// # Examples
    ///
    /// ```
    /// use fusebox::CircuitBreakerConfig;
    ///
    /// let config = CircuitBreakerConfig::from_toml(
    ///     r#"
    ///     max_failures = 3
    ///     call_timeout_ms = 500
    ///     fallback_on_failure = true
    ///     "#,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(config.max_failures, 3);
    /// assert!(config.fallback_on_failure);
    /// ```
    pub fn from_toml(document: &str) -> Result<Self> {
        let raw: ConfigToml = toml::from_str(document)
            .map_err(|e| BreakerError::InvalidConfig(format!("TOML parse error: {e}")))?;
        let defaults = Self::default();

        let config = Self {
            max_failures: raw.max_failures.unwrap_or(defaults.max_failures),
            call_timeout: raw
                .call_timeout_ms
                .map(Duration::from_millis)
                .or(defaults.call_timeout),
            reset_timeout: raw
                .reset_timeout_ms
                .map(Duration::from_millis)
                .or(defaults.reset_timeout),
            fallback_on_failure: raw.fallback_on_failure.unwrap_or(defaults.fallback_on_failure),
            notification_topic: raw.notification_topic.or(defaults.notification_topic),
            node_id: raw.node_id.unwrap_or(defaults.node_id),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Checked once at breaker construction:
    /// - `max_failures` must be at least 1
    /// - `call_timeout` and `reset_timeout` must not be zero when present
    ///   (use `None` to disable)
    /// - `notification_topic` must not be empty when present (use `None` to
    ///   disable)
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_failures == 0 {
            return Err(BreakerError::InvalidConfig(
                "max_failures must be at least 1".to_owned(),
            ));
        }
        if self.call_timeout == Some(Duration::ZERO) {
            return Err(BreakerError::InvalidConfig(
                "call_timeout must be positive; use None to disable".to_owned(),
            ));
        }
        if self.reset_timeout == Some(Duration::ZERO) {
            return Err(BreakerError::InvalidConfig(
                "reset_timeout must be positive; use None to disable".to_owned(),
            ));
        }
        if self.notification_topic.as_deref() == Some("") {
            return Err(BreakerError::InvalidConfig(
                "notification_topic must not be empty; use None to disable".to_owned(),
            ));
        }
        Ok(())
    }
}
