//! Basic guarded-call example showing the full breaker lifecycle.
//!
//! Simulates a flaky upstream: the breaker counts failures, opens, rejects
//! calls for the cooldown, probes with a single trial, and closes again.
//!
//! # Running this example
//!
//! ```bash
//! cargo run --example guarded_call
//! ```

#![allow(
    clippy::print_stdout,
    clippy::str_to_string,
    clippy::uninlined_format_args,
    clippy::use_debug,
    reason = "examples are allowed to use println and simple formatting"
)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use fusebox::{BoxError, BreakerError, CircuitBreaker, CircuitBreakerConfig};
use tokio::time::sleep;

/// A resource that fails its first few calls, then recovers.
async fn flaky_upstream(calls: Arc<AtomicU32>) -> Result<String, BoxError> {
    let call = calls.fetch_add(1, Ordering::SeqCst);
    if call < 3 {
        Err(format!("connection refused (call {call})").into())
    } else {
        Ok("200 OK".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Fusebox: Guarded Call Example\n");

    let config = CircuitBreakerConfig {
        max_failures: 3,
        call_timeout: Some(Duration::from_millis(500)),
        reset_timeout: Some(Duration::from_millis(800)),
        ..CircuitBreakerConfig::default()
    };

    let breaker: CircuitBreaker<String> = CircuitBreaker::new("flaky-upstream", config)?;
    breaker
        .open_handler(|| println!("  -> circuit opened, failing fast"))
        .half_open_handler(|| println!("  -> circuit half-open, probing recovery"))
        .close_handler(|| println!("  -> circuit closed, normal operation"));

    let calls = Arc::new(AtomicU32::new(0));

    // Phase 1: failures accumulate until the circuit opens.
    for attempt in 1..=5 {
        let calls = Arc::clone(&calls);
        let result = breaker.execute(move || flaky_upstream(calls)).await;
        match result {
            Ok(body) => println!("attempt {attempt}: {body}"),
            Err(BreakerError::CircuitOpen { .. }) => {
                println!("attempt {attempt}: rejected, circuit is open");
            }
            Err(err) => println!("attempt {attempt}: {err}"),
        }
        println!("  state={:?} failures={}", breaker.state(), breaker.failure_count());
    }

    // Phase 2: wait out the cooldown; the probe finds a recovered upstream.
    println!("\nwaiting for the cooldown to elapse...");
    sleep(Duration::from_millis(1000)).await;

    let calls = Arc::clone(&calls);
    let probed = breaker.execute(move || flaky_upstream(calls)).await?;
    println!("probe succeeded: {probed}");
    println!("final state={:?} failures={}", breaker.state(), breaker.failure_count());

    Ok(())
}
