//! Process-wide registry of circuit breakers keyed by name.
//!
//! Callers expect exactly one live breaker per name; the registry is the
//! convenience that enforces it. A breaker is created on first lookup and
//! never silently replaced — later lookups under the same name return the
//! existing instance and ignore the supplied configuration.
//!
//! The registry holds no breaker state of its own; each breaker stays fully
//! self-contained.
//!
//! # Examples
//!
//! ```
//! use fusebox::{BreakerRegistry, CircuitBreakerConfig};
//!
//! let registry: BreakerRegistry<String> = BreakerRegistry::new();
//!
//! let breaker = registry
//!     .get_or_create("merchant-api", CircuitBreakerConfig::default())
//!     .unwrap();
//!
//! // Same name, same instance: the second config is ignored.
//! let again = registry
//!     .get_or_create("merchant-api", CircuitBreakerConfig { max_failures: 99, ..Default::default() })
//!     .unwrap();
//!
//! assert_eq!(breaker.name(), again.name());
//! assert_eq!(again.failure_count(), 0);
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, PoisonError},
};

use crate::{breaker::CircuitBreaker, config::CircuitBreakerConfig, error::Result};

/// Registry of breakers guarding operations that resolve to `T`.
///
/// Heterogeneous result types use separate registries; within one registry
/// every lookup is type-safe.
pub struct BreakerRegistry<T> {
    breakers: Mutex<HashMap<String, CircuitBreaker<T>>>,
}

impl<T> fmt::Debug for BreakerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry").field("len", &self.len()).finish_non_exhaustive()
    }
}

impl<T> Default for BreakerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BreakerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { breakers: Mutex::new(HashMap::new()) }
    }

    /// Returns the number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no breaker is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the names of all registered breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Returns the breaker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<CircuitBreaker<T>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Removes and returns the breaker registered under `name`.
    ///
    /// Clones held by callers keep working; the name merely becomes free for
    /// a fresh breaker.
    pub fn remove(&self, name: &str) -> Option<CircuitBreaker<T>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner).remove(name)
    }
}

impl<T: Send + 'static> BreakerRegistry<T> {
    /// Returns the breaker registered under `name`, creating it with `config`
    /// on first lookup.
    ///
    /// An existing breaker wins: its configuration stays in force and the
    /// supplied one is ignored, so concurrent first lookups cannot silently
    /// replace each other's instance.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::InvalidConfig`](crate::BreakerError::InvalidConfig)
    /// if the breaker does not exist yet and `config` fails validation.
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for lookup-or-create"
    )]
    pub fn get_or_create(
        &self,
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<CircuitBreaker<T>> {
        let name = name.into();
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = breakers.get(&name) {
            return Ok(existing.clone());
        }
        let breaker = CircuitBreaker::new(name.clone(), config)?;
        breakers.insert(name, breaker.clone());
        Ok(breaker)
    }
}
