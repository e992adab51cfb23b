//! End-to-end lifecycle tests for the public breaker API.
//!
//! Exercises the full closed → open → half-open → closed/open loop through
//! `execute`, including fail-fast rejection, timeout classification,
//! fallback substitution, and state-change notifications.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use fusebox::{
    BoxError, BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    NotificationPublisher, StateChange,
};
use tokio::{sync::mpsc, time::sleep};

fn config(max_failures: u32, reset_ms: Option<u64>) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        max_failures,
        call_timeout: Some(Duration::from_millis(50)),
        reset_timeout: reset_ms.map(Duration::from_millis),
        ..CircuitBreakerConfig::default()
    }
}

async fn fail_once(breaker: &CircuitBreaker<String>) {
    let _ = breaker.execute(|| async { Err::<String, BoxError>("upstream down".into()) }).await;
}

#[tokio::test]
async fn test_five_failures_open_the_circuit_and_the_sixth_fails_fast() {
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", config(5, None)).unwrap();

    for _ in 0..5 {
        fail_once(&breaker).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.failure_count(), 5);

    let invoked = Arc::new(AtomicU32::new(0));
    let invoked_clone = Arc::clone(&invoked);
    let sixth = breaker
        .execute(move || async move {
            invoked_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>("never".to_string())
        })
        .await;

    assert!(matches!(sixth, Err(BreakerError::CircuitOpen { ref name }) if name == "merchant-api"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_successful_probe_after_cooldown_closes_the_circuit() {
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", config(2, Some(80))).unwrap();

    fail_once(&breaker).await;
    fail_once(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    sleep(Duration::from_millis(160)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let probed = breaker.execute(|| async { Ok::<_, BoxError>("recovered".to_string()) }).await;

    assert_eq!(probed.unwrap(), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test]
async fn test_failing_probe_reopens_and_a_fresh_cooldown_probes_again() {
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", config(2, Some(80))).unwrap();

    fail_once(&breaker).await;
    fail_once(&breaker).await;
    sleep(Duration::from_millis(160)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    fail_once(&breaker).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    // The reopen armed a new cooldown timer.
    sleep(Duration::from_millis(160)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    let probed = breaker.execute(|| async { Ok::<_, BoxError>("back".to_string()) }).await;
    assert_eq!(probed.unwrap(), "back");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_slow_operation_recorded_as_timeout_and_late_callback_ignored() {
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", config(5, None)).unwrap();

    let completed = Arc::new(AtomicU32::new(0));
    let completed_clone = Arc::clone(&completed);
    let result = breaker
        .execute(move || async move {
            sleep(Duration::from_millis(150)).await;
            completed_clone.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>("too late".to_string())
        })
        .await;

    assert!(matches!(result, Err(BreakerError::OperationTimedOut(_))));
    assert_eq!(breaker.failure_count(), 1);

    // Give the aborted operation time to have completed, had it survived.
    sleep(Duration::from_millis(250)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 0, "aborted operation must not complete");
    assert_eq!(breaker.failure_count(), 1, "late completion must not double-count");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_fallback_on_failure_substitutes_while_counting_toward_threshold() {
    let breaker_config =
        CircuitBreakerConfig { fallback_on_failure: true, ..config(3, None) };
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", breaker_config).unwrap();
    breaker.fallback(|_err| Ok("from cache".to_string()));

    for expected_failures in 1_u32..=2 {
        let result =
            breaker.execute(|| async { Err::<String, BoxError>("upstream down".into()) }).await;
        assert_eq!(result.unwrap(), "from cache");
        assert_eq!(breaker.failure_count(), expected_failures);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // Third failure crosses the threshold; the fallback still answers.
    let result =
        breaker.execute(|| async { Err::<String, BoxError>("upstream down".into()) }).await;
    assert_eq!(result.unwrap(), "from cache");
    assert_eq!(breaker.state(), CircuitState::Open);
}

struct ChannelPublisher(mpsc::UnboundedSender<StateChange>);

impl NotificationPublisher for ChannelPublisher {
    fn publish(&self, _topic: &str, change: &StateChange) {
        let _ = self.0.send(change.clone());
    }
}

#[tokio::test]
async fn test_notifications_and_handlers_track_the_whole_lifecycle() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let opened = Arc::new(AtomicU32::new(0));
    let half_opened = Arc::new(AtomicU32::new(0));
    let closed = Arc::new(AtomicU32::new(0));

    let breaker: CircuitBreaker<String> = CircuitBreaker::with_publisher(
        "merchant-api",
        config(2, Some(80)),
        Arc::new(ChannelPublisher(tx)),
    )
    .unwrap();

    {
        let opened = Arc::clone(&opened);
        let half_opened = Arc::clone(&half_opened);
        let closed = Arc::clone(&closed);
        breaker
            .open_handler(move || {
                opened.fetch_add(1, Ordering::SeqCst);
            })
            .half_open_handler(move || {
                half_opened.fetch_add(1, Ordering::SeqCst);
            })
            .close_handler(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            });
    }

    fail_once(&breaker).await;
    fail_once(&breaker).await;
    sleep(Duration::from_millis(160)).await;
    let _ = breaker.execute(|| async { Ok::<_, BoxError>("recovered".to_string()) }).await;

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(half_opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let record = rx.recv().await.unwrap();
    assert_eq!((record.state, record.failures), (CircuitState::Open, 2));
    assert_eq!(record.name, "merchant-api");
    assert_eq!(record.node, "local");

    let record = rx.recv().await.unwrap();
    assert_eq!(record.state, CircuitState::HalfOpen);

    let record = rx.recv().await.unwrap();
    assert_eq!((record.state, record.failures), (CircuitState::Closed, 0));

    assert!(rx.try_recv().is_err(), "exactly one record per transition");
}

#[tokio::test]
async fn test_concurrent_callers_while_open_all_fail_fast() {
    let breaker: CircuitBreaker<String> =
        CircuitBreaker::new("merchant-api", config(1, None)).unwrap();
    fail_once(&breaker).await;

    let invoked = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let breaker = breaker.clone();
        let invoked = Arc::clone(&invoked);
        tasks.push(tokio::spawn(async move {
            breaker
                .execute(move || async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>("never".to_string())
                })
                .await
        }));
    }

    for task in tasks {
        let result = task.await.unwrap();
        assert!(matches!(result, Err(BreakerError::CircuitOpen { .. })));
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}
