//! Fallback and notification example.
//!
//! Serves cached values while the upstream is down and prints every
//! state-change record a custom publisher receives.
//!
//! # Running this example
//!
//! ```bash
//! cargo run --example fallback_and_notifications
//! ```

#![allow(
    clippy::print_stdout,
    clippy::str_to_string,
    clippy::uninlined_format_args,
    clippy::use_debug,
    reason = "examples are allowed to use println and simple formatting"
)]

use std::{sync::Arc, time::Duration};

use fusebox::{
    BoxError, CircuitBreaker, CircuitBreakerConfig, NotificationPublisher, StateChange,
};
use tokio::time::sleep;

/// Publisher that prints each record as the JSON a message bus would carry.
struct StdoutPublisher;

impl NotificationPublisher for StdoutPublisher {
    fn publish(&self, topic: &str, change: &StateChange) {
        let payload = serde_json::to_string(change).unwrap_or_default();
        println!("  [{topic}] {payload}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Fusebox: Fallback and Notifications Example\n");

    let config = CircuitBreakerConfig {
        max_failures: 2,
        reset_timeout: Some(Duration::from_millis(600)),
        fallback_on_failure: true,
        node_id: "demo-node".to_string(),
        ..CircuitBreakerConfig::default()
    };

    let breaker: CircuitBreaker<String> =
        CircuitBreaker::with_publisher("price-feed", config, Arc::new(StdoutPublisher))?;
    breaker.fallback(|err| {
        println!("  fallback invoked because: {err}");
        Ok("cached price: 41.99".to_string())
    });

    // The upstream is down: every call substitutes the cached price while
    // the failures count toward the threshold.
    for attempt in 1..=3 {
        let price = breaker
            .execute(|| async { Err::<String, BoxError>("price feed unreachable".into()) })
            .await?;
        println!("attempt {attempt}: {price} (state={:?})\n", breaker.state());
    }

    // After the cooldown the probe finds the feed recovered.
    sleep(Duration::from_millis(800)).await;
    let live = breaker
        .execute(|| async { Ok::<_, BoxError>("live price: 42.10".to_string()) })
        .await?;
    println!("after recovery: {live} (state={:?})", breaker.state());

    Ok(())
}
