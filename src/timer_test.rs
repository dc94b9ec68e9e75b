use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::faults::FaultSink;
use crate::timer::{Scheduler, Timer};

/// With the clock paused, tick alignment is exact: a 400ms callback must
/// not push fires off the 1s epoch grid.
#[tokio::test(start_paused = true)]
async fn ticks_stay_aligned_to_the_epoch() {
    let started = Instant::now();
    let fires: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(vec![]));
    let recorded = fires.clone();
    let timer = Timer::spawn(
        "test-timer",
        Duration::from_millis(1000),
        FaultSink::new(),
        CancellationToken::new(),
        Arc::new(move || {
            let fires = recorded.clone();
            Box::pin(async move {
                fires.lock().await.push(started.elapsed());
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(())
            })
        }),
    );

    tokio::time::sleep(Duration::from_millis(3500)).await;
    timer.destroy().await;

    let fires = fires.lock().await;
    let millis: Vec<u128> = fires.iter().map(|at| at.as_millis()).collect();
    assert_eq!(millis, vec![1000, 2000, 3000], "expected drift-free fires, got {:?}", millis);
}

#[tokio::test(start_paused = true)]
async fn destroy_cancels_the_pending_tick() {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let timer = Timer::spawn(
        "test-timer",
        Duration::from_millis(100),
        FaultSink::new(),
        CancellationToken::new(),
        Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }),
    );

    tokio::time::sleep(Duration::from_millis(250)).await;
    timer.destroy().await;
    let at_destroy = count.load(Ordering::SeqCst);
    assert_eq!(at_destroy, 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), at_destroy, "expected no fires after destroy");
}

#[tokio::test(start_paused = true)]
async fn callback_failures_do_not_stop_the_timer() {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let timer = Timer::spawn(
        "test-timer",
        Duration::from_millis(100),
        FaultSink::new(),
        CancellationToken::new(),
        Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(anyhow::anyhow!("tick failed")) })
        }),
    );

    tokio::time::sleep(Duration::from_millis(350)).await;
    timer.destroy().await;
    assert_eq!(count.load(Ordering::SeqCst), 3, "expected the timer to keep firing through failures");
}

#[tokio::test(start_paused = true)]
async fn scheduler_debounces_to_the_first_requested_delay() {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let scheduler = Scheduler::new(
        "test-scheduler",
        FaultSink::new(),
        CancellationToken::new(),
        Arc::new(move |_now, _handle| {
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }),
    );

    scheduler.schedule(Duration::from_millis(100));
    scheduler.schedule(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0, "expected the second schedule to be a no-op");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "expected exactly one fire");

    // Disarmed after firing: a new schedule works again.
    scheduler.schedule(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
    scheduler.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn scheduler_callback_can_rearm_itself() {
    let count = Arc::new(AtomicUsize::new(0));
    let counted = count.clone();
    let scheduler = Scheduler::new(
        "test-scheduler",
        FaultSink::new(),
        CancellationToken::new(),
        Arc::new(move |_now, handle| {
            let count = counted.clone();
            Box::pin(async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    handle.schedule(Duration::from_millis(10));
                }
                Ok(())
            })
        }),
    );

    scheduler.schedule(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3, "expected the chain of re-arms to run to completion");
    scheduler.destroy().await;
}
