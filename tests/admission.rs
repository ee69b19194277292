//! End-to-end admission scenarios against the in-process store.
//!
//! Tokio time is paused so poll sleeps auto-advance; window time is driven
//! separately through `ManualClock`, which stands in for the Redis server
//! clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use llm_ratelimiter::{
    ManualClock, MemoryStore, RateLimitConfig, RateLimitConfigBuilder, RateLimiter,
};

const EPOCH: Duration = Duration::from_secs(1_000_000);

struct Harness {
    clock: ManualClock,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::starting_at(EPOCH);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self { clock, store }
    }

    fn limiter(&self, configure: impl FnOnce(RateLimitConfigBuilder) -> RateLimitConfigBuilder) -> RateLimiter {
        let config = configure(RateLimitConfig::builder()).build().expect("valid config");
        RateLimiter::with_store(self.store.clone(), "gpt-4", config)
    }
}

/// Let spawned waiters run until they are parked in their poll loops.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Slide the window clock forward in small steps, yielding between steps so
/// blocked waiters keep polling (and keep their liveness leases fresh, as
/// they would against a continuously advancing real clock).
async fn slide(clock: &ManualClock, secs: u64) {
    for _ in 0..secs / 2 {
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn rpm_two_admits_a_b_then_c_after_window_slides() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(2).tpm(1_000_000));

    // A and B admit immediately.
    limiter.acquire().await.unwrap();
    limiter.acquire().await.unwrap();

    // C blocks: the window holds two requests.
    let c = tokio::spawn({
        let limiter = limiter.clone();
        async move { limiter.acquire().await }
    });
    settle().await;
    assert!(!c.is_finished(), "C must wait while the window is full");

    // Sixty seconds after A's admission the early charges age out.
    slide(&harness.clock, 60).await;
    c.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn blocked_waiters_admit_in_arrival_order() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(1).tpm(1_000_000));
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    limiter.acquire().await.unwrap();

    let spawn_waiter = |name: &'static str| {
        let limiter = limiter.clone();
        let order = order.clone();
        tokio::spawn(async move {
            limiter.acquire().await.unwrap();
            order.lock().unwrap().push(name);
        })
    };

    let a = spawn_waiter("a");
    settle().await;
    let b = spawn_waiter("b");
    settle().await;

    // Capacity frees for exactly one admission per minute with rpm=1: A
    // must take it, B must keep waiting.
    slide(&harness.clock, 60).await;
    a.await.unwrap();
    settle().await;
    assert!(!b.is_finished(), "B arrived after A and must not overtake it");
    assert_eq!(*order.lock().unwrap(), vec!["a"]);

    slide(&harness.clock, 60).await;
    b.await.unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn window_sum_never_exceeds_the_ceiling() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(100).tpm(1_000).max_wait(Duration::from_millis(400)));

    limiter.acquire_tokens(600).await.unwrap();
    harness.clock.advance(Duration::from_secs(30));
    limiter.acquire_tokens(300).await.unwrap();

    // 600 + 300 + 200 would overflow the trailing window.
    let err = limiter.acquire_tokens(200).await.unwrap_err();
    assert!(err.is_timeout());
    let status = limiter.status().await.unwrap();
    assert_eq!(status.tpm_remaining, Some(100));

    // Thirty more seconds age the 600-token charge out; 300 + 200 fits.
    harness.clock.advance(Duration::from_secs(30));
    limiter.acquire_tokens(200).await.unwrap();
    let status = limiter.status().await.unwrap();
    assert_eq!(status.tpm_remaining, Some(500));
}

#[tokio::test(start_paused = true)]
async fn impossible_cost_fails_fast_instead_of_blocking() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(100).tpm(1_000));

    let before = tokio::time::Instant::now();
    let err = limiter.acquire_tokens(1_200).await.unwrap_err();
    assert!(err.is_cost_exceeds_ceiling());
    assert_eq!(before.elapsed(), Duration::ZERO, "no waiting, no store polling");
}

#[tokio::test(start_paused = true)]
async fn split_dimensions_are_enforced_independently() {
    let harness = Harness::new();
    let limiter = harness
        .limiter(|b| b.rpm(100).input_tpm(10_000).output_tpm(2_000).max_wait(Duration::from_millis(400)));

    limiter.acquire_split(9_000, 500).await.unwrap();

    // Input headroom remains (9_000 + 500 <= 10_000), but the output
    // dimension is what blocks this one (500 + 1_600 > 2_000).
    let err = limiter.acquire_split(500, 1_600).await.unwrap_err();
    assert!(err.is_timeout());

    let status = limiter.status().await.unwrap();
    assert_eq!(status.input_tpm_remaining, Some(1_000), "input must not be charged");
    assert_eq!(status.output_tpm_remaining, Some(1_500));

    // A request that fits the output headroom admits despite the failure
    // above.
    limiter.acquire_split(500, 1_000).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn adjust_round_trip_records_actual_output() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(100).input_tpm(10_000).output_tpm(2_000));

    let result = limiter.acquire_split(5_000, 1_000).await.unwrap();
    let record_id = result.record_id.expect("split mode issues a record");

    // Actual usage came in higher than the estimate.
    limiter.adjust(&record_id, 1_500).await.unwrap();

    let status = limiter.status().await.unwrap();
    assert_eq!(status.output_tpm_remaining, Some(500), "total recorded output must be 1_500");
    assert_eq!(status.input_tpm_remaining, Some(5_000));
}

#[tokio::test(start_paused = true)]
async fn adjust_refunds_unused_headroom() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(100).input_tpm(10_000).output_tpm(2_000));

    let result = limiter.acquire_split(100, 1_000).await.unwrap();
    limiter.adjust(&result.record_id.unwrap(), 200).await.unwrap();

    let status = limiter.status().await.unwrap();
    assert_eq!(status.output_tpm_remaining, Some(1_800));
}

#[tokio::test(start_paused = true)]
async fn second_adjust_fails_without_double_applying() {
    let harness = Harness::new();
    let limiter = harness.limiter(|b| b.rpm(100).input_tpm(10_000).output_tpm(2_000));

    let result = limiter.acquire_split(100, 1_000).await.unwrap();
    let record_id = result.record_id.unwrap();

    limiter.adjust(&record_id, 1_500).await.unwrap();
    let err = limiter.adjust(&record_id, 1_500).await.unwrap_err();
    assert!(err.is_record_not_found());

    let status = limiter.status().await.unwrap();
    assert_eq!(status.output_tpm_remaining, Some(500), "delta must apply exactly once");
}

#[tokio::test(start_paused = true)]
async fn timed_out_waiter_does_not_disturb_the_queue() {
    let harness = Harness::new();
    let patient = harness.limiter(|b| b.rpm(1).tpm(1_000_000));
    let impatient = harness.limiter(|b| b.rpm(1).tpm(1_000_000).max_wait(Duration::from_millis(300)));

    patient.acquire().await.unwrap();

    let b = tokio::spawn({
        let impatient = impatient.clone();
        async move { impatient.acquire().await }
    });
    settle().await;
    let c = tokio::spawn({
        let patient = patient.clone();
        async move { patient.acquire().await }
    });
    settle().await;

    // B's max_wait elapses while the window is still full.
    let b_result = b.await.unwrap();
    assert!(b_result.unwrap_err().is_timeout());
    assert!(!c.is_finished());

    // B's withdrawal must leave C able to admit once capacity frees.
    slide(&harness.clock, 60).await;
    c.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn adjustment_can_overshoot_the_ceiling() {
    let harness = Harness::new();
    let limiter = harness
        .limiter(|b| b.rpm(100).input_tpm(10_000).output_tpm(2_000).max_wait(Duration::from_millis(300)));

    let result = limiter.acquire_split(100, 1_900).await.unwrap();
    // The provider produced more than the ceiling's remaining headroom;
    // the work already happened, so the charge lands anyway.
    limiter.adjust(&result.record_id.unwrap(), 2_500).await.unwrap();

    let status = limiter.status().await.unwrap();
    assert_eq!(status.output_tpm_remaining, Some(0));

    // And the window stays closed until the oversized charge ages out.
    let err = limiter.acquire_split(0, 100).await.unwrap_err();
    assert!(err.is_timeout());
    harness.clock.advance(Duration::from_secs(60));
    limiter.acquire_split(0, 100).await.unwrap();
}
