use super::*;

#[test]
fn test_state_write_defaults() {
    let policy = BackoffPolicy::for_state_writes();
    assert_eq!(policy.base_delay, Duration::from_millis(50));
    assert_eq!(policy.max_delay, Duration::from_secs(1));
    assert_eq!(policy.max_retries, 3);
    assert!((policy.factor - 2.0).abs() < f64::EPSILON);
}

#[test]
fn test_event_delivery_defaults() {
    let policy = BackoffPolicy::for_event_delivery();
    assert_eq!(policy.base_delay, Duration::from_secs(1));
    assert_eq!(policy.max_retries, 2);
}

#[test]
fn test_counter_delays_stay_short() {
    let policy = BackoffPolicy {
        jitter: 0.0,
        ..BackoffPolicy::for_counters()
    };
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1));
    assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(25));
    assert!(policy.max_retries > 1_000);
}

#[test]
fn test_exponential_backoff() {
    let policy = BackoffPolicy {
        base_delay: Duration::from_millis(100),
        factor: 2.0,
        max_delay: Duration::from_secs(10),
        max_retries: 5,
        jitter: 0.0, // No jitter for predictable testing
    };

    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
}

#[test]
fn test_delay_capped_at_max() {
    let policy = BackoffPolicy {
        jitter: 0.0,
        ..BackoffPolicy::for_state_writes()
    };

    // 50 * 2^5 = 1600, capped at 1000
    assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(1));
}

#[test]
fn test_jitter_stays_in_band() {
    let policy = BackoffPolicy {
        base_delay: Duration::from_millis(1000),
        factor: 2.0,
        max_delay: Duration::from_secs(10),
        max_retries: 5,
        jitter: 0.25,
    };

    for _ in 0..50 {
        let ms = policy.delay_for_attempt(0).as_millis();
        assert!((750..=1250).contains(&ms), "delay {} outside jitter band", ms);
    }
}

#[test]
fn test_should_retry() {
    let policy = BackoffPolicy {
        max_retries: 3,
        ..Default::default()
    };

    assert!(policy.should_retry(0));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
    assert!(!policy.should_retry(4));
}
