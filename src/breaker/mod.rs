//! Circuit breaker guarding asynchronous operations.
//!
//! The circuit breaker prevents repeated calls to a failing resource,
//! allowing it time to recover while protecting the caller from resource
//! exhaustion. It acts like an electrical circuit breaker that trips when too
//! many errors occur.
//!
//! # States
//!
//! - **Closed**: normal operation, calls run and failures are counted
//! - **Open**: too many failures, calls fail fast without running
//! - **`HalfOpen`**: probing recovery, exactly one trial call admitted
//!
//! # State Transitions
//!
//! ```text
//! Closed ──[max_failures qualifying failures]──> Open
//!   ▲                                              │
//!   │                                              │ [reset_timeout elapses]
//!   │                                              ▼
//!   └──────[trial call succeeds]────────────── HalfOpen
//!              [trial call fails] ──────────────> Open
//! ```
//!
//! A qualifying failure is a reported failure, a panic, or a timeout of the
//! guarded operation. A rejected call ([`BreakerError::CircuitOpen`]) never
//! qualifies: it says nothing new about the guarded resource.
//!
//! # Examples
//!
//! ```rust
//! use fusebox::{BoxError, CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! # async fn example() -> fusebox::Result<()> {
//! let breaker: CircuitBreaker<String> =
//!     CircuitBreaker::new("merchant-api", CircuitBreakerConfig::default())?;
//!
//! let greeting = breaker.execute(|| async { Ok::<_, BoxError>("hello".to_owned()) }).await?;
//!
//! assert_eq!(greeting, "hello");
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, task::JoinError};
use tracing::instrument;

use crate::{
    config::CircuitBreakerConfig,
    error::{BoxError, BreakerError, Result},
    notify::NotificationPublisher,
};

pub(crate) mod core;

use self::core::{Admission, BreakerCore, TrialPermit};

#[cfg(test)]
#[path = "tests/proptest_transitions.rs"]
mod proptest_transitions;

/// Circuit breaker state.
///
/// Exactly one state is active at any instant; transitions are atomic with
/// respect to concurrent callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation: calls run, failures are counted.
    Closed,
    /// Failing fast: calls are rejected without running.
    Open,
    /// Probing recovery: exactly one trial call is admitted.
    HalfOpen,
}

/// Registered fallback: maps the triggering error to a substitute result.
type Fallback<T> = Arc<dyn Fn(&BreakerError) -> std::result::Result<T, BoxError> + Send + Sync>;

/// A named circuit breaker guarding operations that resolve to `T`.
///
/// The breaker is cheap to clone; clones share state, registrations, and the
/// notification publisher. The result type parameter exists because
/// registered fallbacks must produce the same type the guarded operation
/// would have.
///
/// A tokio runtime must be current when calls are executed or the circuit is
/// tripped: guarded operations run in spawned tasks and open circuits arm a
/// spawned reset timer.
///
/// # Thread Safety
///
/// All internal state sits behind one fine-grained mutex per breaker, so the
/// threshold-crossing decision and the count mutation are a single atomic
/// step: two callers racing on the last failure produce exactly one open
/// transition, one round of handler invocations, and one published record.
///
/// # Examples
///
/// ```rust
/// use fusebox::{BoxError, CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() -> fusebox::Result<()> {
/// let breaker: CircuitBreaker<u64> =
///     CircuitBreaker::new("inventory", CircuitBreakerConfig::default())?;
///
/// // Chainable, accumulating registration.
/// breaker
///     .fallback(|_err| Ok(0))
///     .open_handler(|| eprintln!("inventory circuit opened"))
///     .close_handler(|| eprintln!("inventory circuit closed"));
///
/// let count = breaker.execute(|| async { Ok::<_, BoxError>(42) }).await?;
/// assert_eq!(count, 42);
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<T> {
    core: Arc<BreakerCore>,
    fallbacks: Arc<RwLock<Vec<Fallback<T>>>>,
}

impl<T> Clone for CircuitBreaker<T> {
    fn clone(&self) -> Self {
        Self { core: Arc::clone(&self.core), fallbacks: Arc::clone(&self.fallbacks) }
    }
}

impl<T> fmt::Debug for CircuitBreaker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker").field("core", &self.core).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> CircuitBreaker<T> {
    /// Creates a named breaker with the given configuration and no
    /// notification publisher.
    ///
    /// The circuit starts closed with a failure count of zero.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::InvalidConfig`] if the configuration fails
    /// validation; invalid values fail fast here, never at call time.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fusebox::{CircuitBreaker, CircuitBreakerConfig};
    ///
    /// let breaker: CircuitBreaker<String> =
    ///     CircuitBreaker::new("payments", CircuitBreakerConfig::default()).unwrap();
    /// assert_eq!(breaker.name(), "payments");
    /// ```
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for constructors"
    )]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: BreakerCore::new(name.into(), config, None),
            fallbacks: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Creates a named breaker that publishes state-change records through
    /// the given publisher.
    ///
    /// Records are published under the configured `notification_topic`; a
    /// topic of `None` disables publishing even with a publisher present.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::InvalidConfig`] if the configuration fails
    /// validation.
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for constructors"
    )]
    pub fn with_publisher(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: BreakerCore::new(name.into(), config, Some(publisher)),
            fallbacks: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Returns the breaker's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Returns the current state.
    pub fn state(&self) -> CircuitState {
        self.core.state()
    }

    /// Returns the current failure count.
    ///
    /// The count is capped at `max_failures` once the circuit opens.
    pub fn failure_count(&self) -> u32 {
        self.core.failure_count()
    }

    /// Registers a fallback producing a substitute result.
    ///
    /// The fallback receives the triggering error and is invoked when the
    /// circuit rejects a call, or when the guarded operation itself fails and
    /// `fallback_on_failure` is set. Registrations accumulate: fallbacks are
    /// tried in registration order until one succeeds, and the last failure
    /// propagates as [`BreakerError::FallbackFailed`] if none does.
    pub fn fallback<F>(&self, fallback: F) -> &Self
    where
        F: Fn(&BreakerError) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        self.fallbacks.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(fallback));
        self
    }

    /// Registers a handler invoked when the circuit opens.
    ///
    /// Handlers run synchronously in registration order at the transition;
    /// they accumulate and cannot affect the transition itself.
    pub fn open_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.register_open_handler(Arc::new(handler));
        self
    }

    /// Registers a handler invoked when the circuit moves to half-open.
    pub fn half_open_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.register_half_open_handler(Arc::new(handler));
        self
    }

    /// Registers a handler invoked when the circuit closes.
    pub fn close_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.register_close_handler(Arc::new(handler));
        self
    }

    /// Executes an operation under breaker protection.
    ///
    /// 1. **Open** (or half-open with the trial slot taken): the operation is
    ///    not invoked; registered fallbacks substitute a result, or the
    ///    caller receives [`BreakerError::CircuitOpen`].
    /// 2. **Closed / half-open trial**: the operation runs, raced against the
    ///    configured call timeout. A timed-out operation is aborted and its
    ///    late completion discarded.
    /// 3. The classified outcome feeds the state machine, then exactly one
    ///    resolution reaches the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::CircuitOpen`] on rejection,
    /// [`BreakerError::OperationFailed`] / [`BreakerError::OperationPanicked`]
    /// / [`BreakerError::OperationTimedOut`] for the operation's own outcome,
    /// or [`BreakerError::FallbackFailed`] if a fallback was applicable and
    /// failed.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fusebox::{BoxError, BreakerError, CircuitBreaker, CircuitBreakerConfig};
    ///
    /// # async fn example() -> fusebox::Result<()> {
    /// let breaker: CircuitBreaker<String> =
    ///     CircuitBreaker::new("catalog", CircuitBreakerConfig::default())?;
    ///
    /// match breaker.execute(|| async { Err::<String, BoxError>("boom".into()) }).await {
    ///     Ok(value) => println!("got {value}"),
    ///     Err(BreakerError::CircuitOpen { .. }) => println!("failing fast"),
    ///     Err(err) => println!("operation outcome: {err}"),
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        self.run(operation, None::<fn(&BreakerError) -> std::result::Result<T, BoxError>>).await
    }

    /// Executes an operation with a per-call fallback override.
    ///
    /// The override replaces the registered fallback chain for this call
    /// only; applicability rules are unchanged (rejection always, operation
    /// failure only with `fallback_on_failure`).
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute), with the override's failure surfacing
    /// as [`BreakerError::FallbackFailed`].
    pub async fn execute_with_fallback<F, Fut, FB>(&self, operation: F, fallback: FB) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
        FB: FnOnce(&BreakerError) -> std::result::Result<T, BoxError>,
    {
        self.run(operation, Some(fallback)).await
    }

    /// Executes an operation and delivers the resolution into a caller-owned
    /// sink instead of a returned future.
    ///
    /// Spawns internally and returns immediately. Exactly one resolution is
    /// sent; if the receiver was dropped, the resolution is discarded.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fusebox::{BoxError, CircuitBreaker, CircuitBreakerConfig};
    /// use tokio::sync::oneshot;
    ///
    /// # async fn example() -> fusebox::Result<()> {
    /// let breaker: CircuitBreaker<u64> =
    ///     CircuitBreaker::new("metrics", CircuitBreakerConfig::default())?;
    ///
    /// let (tx, rx) = oneshot::channel();
    /// breaker.execute_and_report(tx, || async { Ok::<_, BoxError>(7) });
    ///
    /// assert_eq!(rx.await.unwrap()?, 7);
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute_and_report<F, Fut>(&self, sink: oneshot::Sender<Result<T>>, operation: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        let breaker = self.clone();
        tokio::spawn(async move {
            let resolution = breaker.execute(operation).await;
            let _ = sink.send(resolution);
        });
    }

    /// Trips the circuit open regardless of the failure count.
    ///
    /// Open handlers run and a record is published exactly as for a
    /// threshold-driven open; the reset timer is armed as usual.
    pub fn open(&self) {
        self.core.trip();
    }

    /// Forces the circuit closed and resets the failure count to zero.
    ///
    /// Cancels any pending reset timer. Close handlers run and a record is
    /// published if the state actually changed.
    pub fn reset(&self) {
        self.core.force_reset();
    }

    /// Disarms any pending reset timer so the runtime can shut down cleanly.
    ///
    /// The state is left as-is; a breaker closed this way no longer
    /// auto-resets until it transitions again. Idempotent.
    pub fn close(&self) {
        self.core.shutdown();
    }

    #[instrument(level = "debug", skip_all, fields(breaker = %self.core.name()))]
    async fn run<F, Fut, FB>(&self, operation: F, per_call: Option<FB>) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
        FB: FnOnce(&BreakerError) -> std::result::Result<T, BoxError>,
    {
        match self.core.admit() {
            Admission::Rejected => {
                let err = BreakerError::CircuitOpen { name: self.core.name().to_owned() };
                self.substitute(err, per_call)
            }
            Admission::Admitted { trial } => {
                let mut permit = trial.then(|| TrialPermit::new(Arc::clone(&self.core)));
                let outcome = self.guard(operation).await;
                if let Some(permit) = permit.as_mut() {
                    permit.disarm();
                }
                match outcome {
                    Ok(value) => {
                        self.core.record_success(trial);
                        Ok(value)
                    }
                    Err(err) => {
                        self.core.record_failure(trial);
                        if self.core.config().fallback_on_failure {
                            self.substitute(err, per_call)
                        } else {
                            Err(err)
                        }
                    }
                }
            }
        }
    }

    /// Runs the operation in a spawned task raced against the call timeout,
    /// and classifies the outcome exactly once.
    ///
    /// The race is biased toward the timer: when completion and timeout fire
    /// within the same scheduling tick, the timeout wins deterministically.
    /// On timeout the task is aborted, discarding any late completion.
    async fn guard<F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        let mut task = tokio::spawn(async move { operation().await });
        match self.core.config().call_timeout {
            Some(limit) => {
                tokio::select! {
                    biased;
                    () = tokio::time::sleep(limit) => {
                        task.abort();
                        Err(BreakerError::OperationTimedOut(limit))
                    }
                    joined = &mut task => Self::classify(joined),
                }
            }
            None => Self::classify(task.await),
        }
    }

    fn classify(joined: std::result::Result<std::result::Result<T, BoxError>, JoinError>) -> Result<T> {
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BreakerError::OperationFailed(err)),
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                Err(BreakerError::OperationPanicked(message))
            }
            Err(_) => {
                Err(BreakerError::OperationFailed("guarded operation task was cancelled".into()))
            }
        }
    }

    /// Substitutes a result for the triggering error, if a fallback applies.
    ///
    /// A per-call override wins outright; otherwise the registered chain is
    /// tried in registration order until one succeeds. With nothing
    /// registered the triggering error reaches the caller unchanged.
    fn substitute<FB>(&self, err: BreakerError, per_call: Option<FB>) -> Result<T>
    where
        FB: FnOnce(&BreakerError) -> std::result::Result<T, BoxError>,
    {
        if let Some(fallback) = per_call {
            return fallback(&err).map_err(BreakerError::FallbackFailed);
        }

        let chain: Vec<Fallback<T>> =
            self.fallbacks.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut last_failure = None;
        for fallback in &chain {
            match fallback(&err) {
                Ok(value) => return Ok(value),
                Err(failure) => last_failure = Some(failure),
            }
        }
        match last_failure {
            Some(failure) => Err(BreakerError::FallbackFailed(failure)),
            None => Err(err),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::str_to_string,
    clippy::panic,
    clippy::let_underscore_must_use,
    reason = "test code uses these patterns for readability and assertion"
)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use tokio::{sync::mpsc, time::sleep};

    use super::*;
    use crate::notify::{DEFAULT_NOTIFICATION_TOPIC, StateChange};

    fn breaker_with(config: CircuitBreakerConfig) -> CircuitBreaker<String> {
        CircuitBreaker::new("test", config).expect("config should validate")
    }

    fn no_reset_config(max_failures: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { max_failures, reset_timeout: None, ..CircuitBreakerConfig::default() }
    }

    fn fast_reset_config(max_failures: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures,
            reset_timeout: Some(Duration::from_millis(reset_ms)),
            ..CircuitBreakerConfig::default()
        }
    }

    async fn fail_times(breaker: &CircuitBreaker<String>, times: u32) {
        for _ in 0..times {
            let _ = breaker.execute(|| async { Err::<String, BoxError>("failure".into()) }).await;
        }
    }

    struct ChannelPublisher(mpsc::UnboundedSender<(String, StateChange)>);

    impl NotificationPublisher for ChannelPublisher {
        fn publish(&self, topic: &str, change: &StateChange) {
            let _ = self.0.send((topic.to_owned(), change.clone()));
        }
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let config = CircuitBreakerConfig { max_failures: 0, ..CircuitBreakerConfig::default() };
        let err = CircuitBreaker::<String>::new("bad", config).unwrap_err();
        assert!(matches!(err, BreakerError::InvalidConfig(_)));
    }

    #[test]
    fn test_initial_state() {
        let breaker = breaker_with(no_reset_config(5));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.name(), "test");
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let breaker = breaker_with(no_reset_config(5));

        let result =
            breaker.execute(|| async { Ok::<_, BoxError>("success".to_string()) }).await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_operation_counts() {
        let breaker = breaker_with(no_reset_config(5));

        let result = breaker.execute(|| async { Err::<String, BoxError>("boom".into()) }).await;

        match result {
            Err(BreakerError::OperationFailed(source)) => {
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker_with(no_reset_config(5));

        fail_times(&breaker, 3).await;
        assert_eq!(breaker.failure_count(), 3);

        let _ = breaker.execute(|| async { Ok::<_, BoxError>("ok".to_string()) }).await;
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold_and_rejects_without_invoking() {
        let breaker = breaker_with(no_reset_config(3));
        fail_times(&breaker, 3).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let result = breaker
            .execute(move || async move {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>("never".to_string())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::CircuitOpen { ref name }) if name == "test"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0, "operation must not run while open");
    }

    #[tokio::test]
    async fn test_rejections_do_not_count_as_failures() {
        let breaker = breaker_with(no_reset_config(2));
        fail_times(&breaker, 2).await;
        assert_eq!(breaker.failure_count(), 2);

        for _ in 0..5 {
            let _ = breaker.execute(|| async { Ok::<_, BoxError>("x".to_string()) }).await;
        }
        assert_eq!(breaker.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_on_open_circuit() {
        let breaker = breaker_with(no_reset_config(1));
        breaker.fallback(|err| {
            assert!(matches!(err, BreakerError::CircuitOpen { .. }));
            Ok("cached".to_string())
        });

        fail_times(&breaker, 1).await;
        let result = breaker.execute(|| async { Ok::<_, BoxError>("live".to_string()) }).await;

        assert_eq!(result.unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_fallback_on_failure_substitutes_while_counting() {
        let config = CircuitBreakerConfig {
            fallback_on_failure: true,
            ..no_reset_config(5)
        };
        let breaker = breaker_with(config);
        breaker.fallback(|_err| Ok("substitute".to_string()));

        let result = breaker.execute(|| async { Err::<String, BoxError>("boom".into()) }).await;

        assert_eq!(result.unwrap(), "substitute");
        assert_eq!(breaker.failure_count(), 1, "failure still counts toward threshold");
    }

    #[tokio::test]
    async fn test_failure_without_fallback_on_failure_reaches_caller() {
        let breaker = breaker_with(no_reset_config(5));
        breaker.fallback(|_err| Ok("substitute".to_string()));

        let result = breaker.execute(|| async { Err::<String, BoxError>("boom".into()) }).await;

        assert!(matches!(result, Err(BreakerError::OperationFailed(_))));
    }

    #[tokio::test]
    async fn test_fallback_chain_accumulates_and_tries_in_order() {
        let breaker = breaker_with(no_reset_config(1));
        breaker
            .fallback(|_err| Err::<String, BoxError>("first fallback empty".into()))
            .fallback(|_err| Ok("second fallback".to_string()));

        fail_times(&breaker, 1).await;
        let result = breaker.execute(|| async { Ok::<_, BoxError>("live".to_string()) }).await;

        assert_eq!(result.unwrap(), "second fallback");
    }

    #[tokio::test]
    async fn test_all_fallbacks_failing_surfaces_last_failure() {
        let breaker = breaker_with(no_reset_config(1));
        breaker
            .fallback(|_err| Err::<String, BoxError>("first".into()))
            .fallback(|_err| Err::<String, BoxError>("second".into()));

        fail_times(&breaker, 1).await;
        let result = breaker.execute(|| async { Ok::<_, BoxError>("live".to_string()) }).await;

        match result {
            Err(BreakerError::FallbackFailed(source)) => assert_eq!(source.to_string(), "second"),
            other => panic!("expected FallbackFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_per_call_fallback_overrides_chain() {
        let breaker = breaker_with(no_reset_config(1));
        breaker.fallback(|_err| Ok("registered".to_string()));

        fail_times(&breaker, 1).await;
        let result = breaker
            .execute_with_fallback(
                || async { Ok::<_, BoxError>("live".to_string()) },
                |_err| Ok("override".to_string()),
            )
            .await;

        assert_eq!(result.unwrap(), "override");
    }

    #[tokio::test]
    async fn test_timeout_classified_and_late_completion_discarded() {
        let config = CircuitBreakerConfig {
            call_timeout: Some(Duration::from_millis(50)),
            ..no_reset_config(5)
        };
        let breaker = breaker_with(config);

        let result = breaker
            .execute(|| async {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, BoxError>("late".to_string())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::OperationTimedOut(t)) if t == Duration::from_millis(50)));
        assert_eq!(breaker.failure_count(), 1);

        // The operation would have completed around 200ms; its late
        // completion must not reset or double-count anything.
        sleep(Duration::from_millis(250)).await;
        assert_eq!(breaker.failure_count(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_timeout_lets_slow_operations_finish() {
        let config = CircuitBreakerConfig { call_timeout: None, ..no_reset_config(5) };
        let breaker = breaker_with(config);

        let result = breaker
            .execute(|| async {
                sleep(Duration::from_millis(80)).await;
                Ok::<_, BoxError>("slow but fine".to_string())
            })
            .await;

        assert_eq!(result.unwrap(), "slow but fine");
    }

    #[tokio::test]
    async fn test_panicking_operation_classified() {
        let breaker = breaker_with(no_reset_config(5));

        let result = breaker
            .execute(|| async { panic!("wired wrong") })
            .await;

        match result {
            Err(BreakerError::OperationPanicked(message)) => {
                assert!(message.contains("wired wrong"));
            }
            other => panic!("expected OperationPanicked, got {other:?}"),
        }
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_half_open_admits_one_trial_and_rejects_the_rest() {
        let breaker = breaker_with(fast_reset_config(1, 50));
        fail_times(&breaker, 1).await;
        sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Slow trial: holds the slot while the second call arrives.
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async {
                    sleep(Duration::from_millis(150)).await;
                    Ok::<_, BoxError>("recovered".to_string())
                })
                .await
        });
        sleep(Duration::from_millis(40)).await;

        let invoked = Arc::new(AtomicU32::new(0));
        let invoked_clone = Arc::clone(&invoked);
        let second = breaker
            .execute(move || async move {
                invoked_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>("should not run".to_string())
            })
            .await;

        assert!(matches!(second, Err(BreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        assert_eq!(trial.await.unwrap().unwrap(), "recovered");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_trial_reopens() {
        let breaker = breaker_with(fast_reset_config(1, 50));
        fail_times(&breaker, 1).await;
        sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail_times(&breaker, 1).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // The fresh reset timer probes again.
        sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_execute_and_report_delivers_into_sink() {
        let breaker = breaker_with(no_reset_config(5));

        let (tx, rx) = oneshot::channel();
        breaker.execute_and_report(tx, || async { Ok::<_, BoxError>("reported".to_string()) });

        assert_eq!(rx.await.unwrap().unwrap(), "reported");
    }

    #[tokio::test]
    async fn test_execute_and_report_delivers_errors() {
        let breaker = breaker_with(no_reset_config(1));
        fail_times(&breaker, 1).await;

        let (tx, rx) = oneshot::channel();
        breaker.execute_and_report(tx, || async { Ok::<_, BoxError>("x".to_string()) });

        assert!(matches!(rx.await.unwrap(), Err(BreakerError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_handler_registrations_accumulate() {
        let breaker = breaker_with(no_reset_config(1));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            breaker.open_handler(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        fail_times(&breaker, 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "both registered handlers must fire");
    }

    #[tokio::test]
    async fn test_notification_records_full_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = CircuitBreakerConfig {
            max_failures: 2,
            reset_timeout: Some(Duration::from_millis(50)),
            ..CircuitBreakerConfig::default()
        };
        let breaker: CircuitBreaker<String> =
            CircuitBreaker::with_publisher("lifecycle", config, Arc::new(ChannelPublisher(tx)))
                .unwrap();

        fail_times(&breaker, 2).await;
        sleep(Duration::from_millis(120)).await;
        let _ = breaker.execute(|| async { Ok::<_, BoxError>("ok".to_string()) }).await;

        let (topic, opened) = rx.recv().await.unwrap();
        assert_eq!(topic, DEFAULT_NOTIFICATION_TOPIC);
        assert_eq!(opened.state, CircuitState::Open);
        assert_eq!(opened.name, "lifecycle");
        assert_eq!(opened.failures, 2);
        assert_eq!(opened.node, "local");

        let (_, half_open) = rx.recv().await.unwrap();
        assert_eq!(half_open.state, CircuitState::HalfOpen);

        let (_, closed) = rx.recv().await.unwrap();
        assert_eq!(closed.state, CircuitState::Closed);
        assert_eq!(closed.failures, 0);

        assert!(rx.try_recv().is_err(), "exactly one record per transition");
    }

    #[tokio::test]
    async fn test_disabled_topic_publishes_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = CircuitBreakerConfig { notification_topic: None, ..no_reset_config(1) };
        let breaker: CircuitBreaker<String> =
            CircuitBreaker::with_publisher("silent", config, Arc::new(ChannelPublisher(tx)))
                .unwrap();

        fail_times(&breaker, 1).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_open_and_reset() {
        let breaker = breaker_with(no_reset_config(5));

        breaker.open();
        assert_eq!(breaker.state(), CircuitState::Open);
        let rejected =
            breaker.execute(|| async { Ok::<_, BoxError>("x".to_string()) }).await;
        assert!(matches!(rejected, Err(BreakerError::CircuitOpen { .. })));

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        let admitted =
            breaker.execute(|| async { Ok::<_, BoxError>("back".to_string()) }).await;
        assert_eq!(admitted.unwrap(), "back");
    }

    #[tokio::test]
    async fn test_close_disarms_reset_timer() {
        let breaker = breaker_with(fast_reset_config(1, 50));
        fail_times(&breaker, 1).await;
        breaker.close();

        sleep(Duration::from_millis(120)).await;
        assert_eq!(breaker.state(), CircuitState::Open, "no probe after shutdown");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let breaker = breaker_with(no_reset_config(1));
        let clone = breaker.clone();

        fail_times(&breaker, 1).await;
        assert_eq!(clone.state(), CircuitState::Open);
    }
}
