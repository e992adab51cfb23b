//! Error types for breaker-guarded operations.
//!
//! This module defines all error types that can reach a caller of a
//! [`CircuitBreaker`](crate::CircuitBreaker). All errors implement the
//! standard [`std::error::Error`] trait via [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Operation outcomes** ([`BreakerError::OperationFailed`],
//!   [`BreakerError::OperationPanicked`], [`BreakerError::OperationTimedOut`]):
//!   the guarded operation ran and did not produce a value. These count
//!   toward the failure threshold.
//! - **Rejections** ([`BreakerError::CircuitOpen`]): the operation was never
//!   invoked. Rejections never count toward the failure threshold.
//! - **Fallback failures** ([`BreakerError::FallbackFailed`]): a substitute
//!   computation was attempted and failed itself.
//! - **Configuration** ([`BreakerError::InvalidConfig`]): rejected at
//!   construction, before any call is made.
//!
//! # Examples
//!
//! ```
//! use fusebox::BreakerError;
//!
//! fn classify(err: &BreakerError) -> &'static str {
//!     match err {
//!         BreakerError::CircuitOpen { .. } => "rejected without running",
//!         BreakerError::OperationTimedOut(_) => "ran too long",
//!         _ => "other",
//!     }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from guarded operations and fallbacks.
///
/// Guarded operations report failures as any error type behind this alias,
/// so a single breaker can guard operations with heterogeneous error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for breaker operations.
///
/// This is a convenience type that uses [`BreakerError`] as the error type.
/// All fallible functions in this crate return this type.
pub type Result<T> = std::result::Result<T, BreakerError>;

/// Errors produced by a circuit breaker or surfaced through one.
///
/// Exactly one resolution reaches the caller per submitted operation:
/// a success value, a fallback value, or one of these errors.
///
/// # Failure Accounting
///
/// [`OperationFailed`](Self::OperationFailed),
/// [`OperationPanicked`](Self::OperationPanicked) and
/// [`OperationTimedOut`](Self::OperationTimedOut) are qualifying failures and
/// move the breaker toward (or back to) the open state.
/// [`CircuitOpen`](Self::CircuitOpen) does not: a rejected call says nothing
/// new about the guarded resource.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The guarded operation reported a failure.
    ///
    /// The original error is preserved as the source. Counts toward the
    /// failure threshold.
    #[error("guarded operation failed: {0}")]
    OperationFailed(#[source] BoxError),

    /// The guarded operation panicked while executing.
    ///
    /// The panic payload is captured as a message where possible. Counts
    /// toward the failure threshold, exactly like a reported failure.
    #[error("guarded operation panicked: {0}")]
    OperationPanicked(String),

    /// The guarded operation did not resolve within the configured call
    /// timeout.
    ///
    /// The operation's eventual late completion, if any, is discarded; it
    /// cannot alter this outcome or count a second time.
    #[error("guarded operation timed out after {0:?}")]
    OperationTimedOut(Duration),

    /// The call was rejected because the circuit is open.
    ///
    /// The operation was not invoked. This also covers calls arriving in the
    /// half-open state while the single trial slot is taken.
    ///
    /// # Recovery
    ///
    /// Wait for the reset timeout to elapse; the breaker then admits one
    /// trial call to probe the guarded resource.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        /// Name of the rejecting breaker.
        name: String,
    },

    /// A fallback was invoked and failed itself.
    ///
    /// Fallback failures are terminal: the fallback is not retried and the
    /// failure does not count toward the breaker's threshold.
    #[error("fallback failed: {0}")]
    FallbackFailed(#[source] BoxError),

    /// The breaker configuration was rejected at construction.
    ///
    /// Invalid values fail fast when the breaker is created, never at call
    /// time.
    #[error("invalid circuit breaker configuration: {0}")]
    InvalidConfig(String),
}

impl BreakerError {
    /// Returns `true` if this error represents a qualifying failure of the
    /// guarded operation (reported failure, panic, or timeout).
    #[must_use]
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed(_) | Self::OperationPanicked(_) | Self::OperationTimedOut(_)
        )
    }
}
