// Integration tests for retry, circuit breaking, and checkpoint resume

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ferrox::fault::circuit::{BreakerState, CircuitBreakerConfig};
use ferrox::fault::retry::RetryConfig;
use ferrox::{CheckpointManager, CircuitBreaker, RetryExecutor, RetryStrategy, TaskError};

#[test]
fn test_retry_eventually_succeeds_with_recorded_attempts() {
    let executor = RetryExecutor::with_config(RetryConfig {
        max_attempts: 3,
        strategy: RetryStrategy::Fixed,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        retryable_kinds: Default::default(),
    });

    let calls = AtomicU32::new(0);
    let value = executor
        .execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskError::Timeout("transient".into()))
            } else {
                Ok(7)
            }
        })
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(executor.get_stats().total_attempts, 3);
}

#[test]
fn test_circuit_opens_and_fails_fast() {
    let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(60),
    });

    for _ in 0..3 {
        let _ = breaker.execute::<_, ()>(|| Err(TaskError::TaskFailure("down".into())));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    // The callable must not run while the circuit is open.
    let calls = AtomicU32::new(0);
    let err = breaker
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err, TaskError::CircuitOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_circuit_recovers_through_half_open() {
    let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_millis(30),
    });

    let _ = breaker.execute::<_, ()>(|| Err(TaskError::TaskFailure("down".into())));
    assert_eq!(breaker.state(), BreakerState::Open);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.execute(|| Ok(())).unwrap();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn test_retry_wrapped_in_breaker() {
    // The combination the fault layer is built for: retries inside,
    // breaker outside.
    let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
        failure_threshold: 2,
        recovery_timeout: Duration::from_secs(60),
    });
    let retry = RetryExecutor::with_config(RetryConfig {
        max_attempts: 2,
        strategy: RetryStrategy::Fixed,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        backoff_multiplier: 1.0,
        retryable_kinds: Default::default(),
    });

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = breaker.execute(|| {
        retry.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            if calls.load(Ordering::SeqCst) < 2 {
                Err(TaskError::Timeout("flaky".into()))
            } else {
                Ok(())
            }
        })
    });

    assert!(result.is_ok());
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn test_checkpoint_resume_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path()).unwrap();

    let first: HashMap<String, String> =
        [("cursor".to_string(), "250".to_string())].into_iter().collect();
    manager
        .save_checkpoint("op-x", first, 0.25, HashMap::new())
        .unwrap();
    std::thread::sleep(Duration::from_millis(5));

    let second: HashMap<String, String> =
        [("cursor".to_string(), "500".to_string())].into_iter().collect();
    manager
        .save_checkpoint("op-x", second.clone(), 0.5, HashMap::new())
        .unwrap();

    let latest = manager.get_latest_checkpoint("op-x").unwrap().unwrap();
    assert!((latest.progress - 0.5).abs() < 1e-9);
    assert_eq!(latest.state, second);

    // A fresh manager over the same directory sees the same state, as a
    // process restart would.
    let recovered = CheckpointManager::new(dir.path()).unwrap();
    let latest_after_restart = recovered.get_latest_checkpoint("op-x").unwrap().unwrap();
    assert_eq!(latest_after_restart.id, latest.id);
}

#[test]
fn test_checkpointed_batch_job_resumes_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path()).unwrap();
    let total = 100usize;

    // First run processes 40 items, checkpointing every 20, then "crashes".
    let mut processed = 0usize;
    while processed < 40 {
        processed += 1;
        if processed % 20 == 0 {
            let state: HashMap<String, String> =
                [("processed".to_string(), processed.to_string())]
                    .into_iter()
                    .collect();
            manager
                .save_checkpoint("batch", state, processed as f64 / total as f64, HashMap::new())
                .unwrap();
            std::thread::sleep(Duration::from_millis(3));
        }
    }

    // Second run resumes from the latest checkpoint.
    let latest = manager.get_latest_checkpoint("batch").unwrap().unwrap();
    let mut resumed: usize = latest.state.get("processed").unwrap().parse().unwrap();
    assert_eq!(resumed, 40);

    while resumed < total {
        resumed += 1;
    }
    assert_eq!(resumed, total);
}
