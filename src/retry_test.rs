use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::error::Canceled;
use crate::retry::{retry, RetryPolicy};

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        retries: 5,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 1.5,
        jitter: 0.1,
    }
}

#[tokio::test]
async fn succeeds_after_transient_failures() -> Result<()> {
    let attempts = AtomicUsize::new(0);
    let cancel = CancellationToken::new();
    let output = retry(&fast_policy(), &cancel, |_err, _attempt| true, || async {
        match attempts.fetch_add(1, Ordering::SeqCst) {
            n if n < 3 => Err(anyhow!("transient")),
            n => Ok(n),
        }
    })
    .await?;
    assert_eq!(output, 3, "expected success on the fourth attempt");
    Ok(())
}

#[tokio::test]
async fn non_retryable_errors_stop_immediately() {
    let attempts = AtomicUsize::new(0);
    let cancel = CancellationToken::new();
    let res: Result<()> = retry(&fast_policy(), &cancel, |_err, _attempt| false, || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("fatal"))
    })
    .await;
    assert!(res.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "expected a single attempt");
}

#[tokio::test]
async fn exhausting_the_budget_returns_the_last_error() {
    let attempts = AtomicUsize::new(0);
    let cancel = CancellationToken::new();
    let res: Result<()> = retry(&fast_policy(), &cancel, |_err, _attempt| true, || async {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("failure {}", n))
    })
    .await;
    let err = res.expect_err("expected the retry budget to be exhausted");
    assert_eq!(err.to_string(), "failure 5", "expected the last error, got {}", err);
    assert_eq!(attempts.load(Ordering::SeqCst), 6, "expected the initial attempt plus 5 retries");
}

#[tokio::test]
async fn cancellation_interrupts_the_backoff() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let res: Result<()> = retry(&fast_policy(), &cancel, |_err, _attempt| true, || async {
        Err(anyhow!("transient"))
    })
    .await;
    let err = res.expect_err("expected cancellation to interrupt the retry");
    assert!(err.downcast_ref::<Canceled>().is_some(), "expected a Canceled error, got {}", err);
}

#[test]
fn delays_grow_and_stay_within_the_jittered_cap() {
    let policy = RetryPolicy::default();
    let first = policy.delay(0).as_secs_f64();
    assert!((0.2..=0.3).contains(&first), "expected ~250ms for the first delay, got {}", first);

    let capped = policy.delay(100).as_secs_f64();
    let cap = policy.max_delay.as_secs_f64();
    assert!(capped <= cap * (1.0 + policy.jitter) + f64::EPSILON, "expected the cap to hold, got {}", capped);
    assert!(capped >= cap * (1.0 - policy.jitter) - f64::EPSILON);
}
