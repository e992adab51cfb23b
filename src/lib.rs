//! Fusebox: Circuit Breakers for Asynchronous Rust Services
//!
//! A fault-isolation library that protects callers from repeatedly invoking
//! an operation that is likely to fail or hang. A breaker wraps an
//! asynchronous operation, observes its outcome (success, reported failure,
//! panic, or timeout), accumulates a failure signal, and — once a threshold
//! is crossed — stops invoking the operation for a cooldown period, failing
//! fast or running a fallback instead. After the cooldown it cautiously
//! admits a single trial call to decide whether the underlying resource has
//! recovered.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   execute()    ┌───────────────────────────────────────┐
//! │   Caller   │───────────────>│        CircuitBreaker (this crate)    │
//! └────────────┘                │  ┌───────────┐      ┌──────────────┐  │
//!       ▲                       │  │   state   │      │ timeout race │  │
//!       │ value / fallback /    │  │  machine  │<─────│ + classifier │  │
//!       │ error (exactly once)  │  └─────┬─────┘      └──────┬───────┘  │
//!       └───────────────────────│        │ transitions       │ runs     │
//!                               └────────┼───────────────────┼──────────┘
//!                                        ▼                   ▼
//!                               handlers + StateChange   guarded async
//!                               records (publish seam)   operation
//! ```
//!
//! # Quick Start
//!
//! ## 1. Guard an Operation
//!
//! ```rust
//! use fusebox::{BoxError, CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> fusebox::Result<()> {
//! let breaker: CircuitBreaker<String> =
//!     CircuitBreaker::new("merchant-api", CircuitBreakerConfig::default())?;
//!
//! let body = breaker
//!     .execute(|| async {
//!         // ... call the flaky resource here ...
//!         Ok::<_, BoxError>("response body".to_owned())
//!     })
//!     .await?;
//!
//! println!("{body}");
//! # Ok(())
//! # }
//! ```
//!
//! ## 2. Fall Back When the Circuit Is Open
//!
//! ```rust
//! use fusebox::{BoxError, CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> fusebox::Result<()> {
//! let config = CircuitBreakerConfig { fallback_on_failure: true, ..Default::default() };
//! let breaker: CircuitBreaker<String> = CircuitBreaker::new("catalog", config)?;
//!
//! breaker
//!     .fallback(|_err| Ok("cached catalog".to_owned()))
//!     .open_handler(|| eprintln!("catalog circuit opened"));
//!
//! let catalog = breaker
//!     .execute(|| async { Err::<String, BoxError>("upstream down".into()) })
//!     .await?;
//!
//! assert_eq!(catalog, "cached catalog");
//! # Ok(())
//! # }
//! ```
//!
//! ## 3. Publish State Changes
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use fusebox::{CircuitBreaker, CircuitBreakerConfig, TracingPublisher};
//!
//! # fn example() -> fusebox::Result<()> {
//! // Every transition emits {state, name, failures, node} under the
//! // configured topic; TracingPublisher routes records to tracing.
//! let breaker: CircuitBreaker<u64> = CircuitBreaker::with_publisher(
//!     "payments",
//!     CircuitBreakerConfig::default(),
//!     Arc::new(TracingPublisher),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`breaker`]: the breaker itself — state machine, timeout racing,
//!   half-open trial gating, fallback dispatch
//! - [`config`]: configuration with validation and TOML loading
//! - [`notify`]: state-change records and the publish seam
//! - [`registry`]: process-wide breaker registry keyed by name
//! - [`error`]: error taxonomy with failure-accounting semantics
//!
//! # Semantics
//!
//! - A qualifying failure is a reported failure, a panic, or a timeout of
//!   the guarded operation; rejections never qualify.
//! - Transitions, failure accounting, and half-open admission are one atomic
//!   step per breaker — concurrent callers racing on the threshold produce
//!   exactly one open transition and one published record.
//! - Exactly one reset timer is pending per open episode; leaving the open
//!   state cancels it, and cancel-vs-fire races resolve deterministically.
//! - A timed-out operation is aborted; its late completion cannot alter the
//!   delivered outcome or count a second time.
//! - Callers receive exactly one resolution per submission: a success value,
//!   a fallback value, or an error. Nothing is retried and nothing is
//!   silently dropped.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod breaker;
pub mod config;
pub mod error;
pub mod notify;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use config::CircuitBreakerConfig;
pub use error::{BoxError, BreakerError, Result};
pub use notify::{
    DEFAULT_NOTIFICATION_TOPIC, NotificationPublisher, StateChange, TracingPublisher,
};
pub use registry::BreakerRegistry;
