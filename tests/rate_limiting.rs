#![allow(missing_docs)]

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use stowage::ratelimit::{DEFAULT_IDLE_TTL, DEFAULT_SWEEP_INTERVAL, GLOBAL_POLICY};
use stowage::{ClientKey, ConfigError, Policy, RateLimitError, RateLimiters};
use tokio_util::sync::CancellationToken;

const MINUTE: Duration = Duration::from_secs(60);

fn user(id: &str) -> ClientKey {
    ClientKey::User(id.to_owned())
}

fn limiters_with_burst() -> RateLimiters {
    RateLimiters::new([
        Policy::per_minute(GLOBAL_POLICY, 60),
        Policy::new("burst", 5, 5 * MINUTE),
    ])
    .expect("valid policies")
}

#[tokio::test(start_paused = true)]
async fn five_allowed_then_one_per_refill() {
    let limiters = limiters_with_burst();
    let alice = user("alice");

    for expected_remaining in (0..5).rev() {
        let info = limiters.check("burst", &alice).expect("within budget");
        assert_eq!(info.limit, 5);
        assert_eq!(info.remaining, expected_remaining);
    }

    let err = limiters.check("burst", &alice).expect_err("budget exhausted");
    let RateLimitError::TooManyRequests { ref policy, ref info } = err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(policy, "burst");
    assert_eq!(info.remaining, 0);
    assert_eq!(err.retry_after(), MINUTE);

    tokio::time::advance(MINUTE).await;
    limiters.check("burst", &alice).expect("one token refilled");
    assert!(limiters.check("burst", &alice).is_err());
}

#[tokio::test(start_paused = true)]
async fn retry_hint_shrinks_as_time_passes() {
    let limiters = limiters_with_burst();
    let bob = user("bob");
    for _ in 0..5 {
        limiters.check("burst", &bob).expect("within budget");
    }

    tokio::time::advance(Duration::from_secs(45)).await;
    let err = limiters.check("burst", &bob).expect_err("still exhausted");
    assert_eq!(err.retry_after(), Duration::from_secs(15));

    let RateLimitError::TooManyRequests { info, .. } = err else {
        panic!("unexpected error");
    };
    assert_eq!(info.reset_after_secs(), 15);
    assert!(info.reset_at() > chrono::Utc::now());
}

#[tokio::test(start_paused = true)]
async fn refill_progress_carries_across_requests() {
    let limiters = RateLimiters::new([
        Policy::per_minute(GLOBAL_POLICY, 60),
        Policy::new("pair", 2, Duration::from_secs(20)),
    ])
    .expect("valid policies");
    let erin = user("erin");

    limiters.check("pair", &erin).expect("first token");
    limiters.check("pair", &erin).expect("second token");

    tokio::time::advance(Duration::from_secs(25)).await;
    limiters.check("pair", &erin).expect("two tokens refilled by 25s");

    tokio::time::advance(Duration::from_secs(5)).await;
    limiters.check("pair", &erin).expect("leftover token");
    limiters.check("pair", &erin).expect("third interval completed at 30s");
    assert!(limiters.check("pair", &erin).is_err());
}

#[tokio::test(start_paused = true)]
async fn budgets_are_isolated_per_client_and_policy() {
    let limiters = limiters_with_burst();
    let alice = user("alice");
    let localhost = ClientKey::Address(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let alice_by_name_as_address = user("127.0.0.1");

    for _ in 0..5 {
        limiters.check("burst", &alice).expect("alice within budget");
    }
    assert!(limiters.check("burst", &alice).is_err());

    limiters.check("burst", &user("carol")).expect("carol has a separate bucket");
    limiters.check("burst", &localhost).expect("address bucket is separate");
    limiters
        .check("burst", &alice_by_name_as_address)
        .expect("user ids and addresses never collide");
    limiters
        .check(GLOBAL_POLICY, &alice)
        .expect("other policies keep their own budget");
}

#[tokio::test(start_paused = true)]
async fn unknown_policy_falls_back_to_global() {
    let limiters = RateLimiters::with_default_policies();
    let dave = user("dave");

    assert_eq!(limiters.policy("no-such-policy").name, GLOBAL_POLICY);
    for _ in 0..60 {
        limiters.check("no-such-policy", &dave).expect("global budget");
    }
    let err = limiters.check("no-such-policy", &dave).expect_err("global exhausted");
    assert!(matches!(err, RateLimitError::TooManyRequests { ref policy, .. } if policy == GLOBAL_POLICY));
    assert!(limiters.check(GLOBAL_POLICY, &dave).is_err());
}

#[test]
fn default_policies() {
    let limiters = RateLimiters::with_default_policies();
    for (name, limit) in [
        ("global", 60),
        ("auth", 10),
        ("upload", 30),
        ("download", 100),
        ("api", 1000),
    ] {
        let policy = limiters.policy(name);
        assert_eq!(policy.name, name);
        assert_eq!(policy.limit, limit);
        assert_eq!(policy.window, MINUTE);
    }
    assert_eq!(limiters.policy("auth").refill_every(), Duration::from_secs(6));
}

#[test]
fn invalid_policy_sets_are_rejected() {
    let missing_global = RateLimiters::new([Policy::per_minute("upload", 30)]);
    assert!(matches!(missing_global, Err(ConfigError::MissingGlobalPolicy)));

    let duplicate = RateLimiters::new([
        Policy::per_minute(GLOBAL_POLICY, 60),
        Policy::per_minute("upload", 30),
        Policy::per_minute("upload", 10),
    ]);
    assert!(matches!(duplicate, Err(ConfigError::InvalidPolicy { ref name }) if name == "upload"));

    let zero = RateLimiters::new([Policy::per_minute(GLOBAL_POLICY, 0)]);
    assert!(matches!(zero, Err(ConfigError::InvalidPolicy { .. })));

    let empty_window = RateLimiters::new([Policy::new(GLOBAL_POLICY, 10, Duration::ZERO)]);
    assert!(matches!(empty_window, Err(ConfigError::InvalidPolicy { .. })));
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_only_idle_clients() {
    let limiters = RateLimiters::with_default_policies();
    limiters.check("upload", &user("idle")).expect("allowed");
    limiters.check("api", &user("idle")).expect("allowed");
    assert_eq!(limiters.tracked_clients(), 2);

    tokio::time::advance(Duration::from_secs(120)).await;
    limiters.check("upload", &user("active")).expect("allowed");

    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(limiters.sweep(DEFAULT_IDLE_TTL), 2);
    assert_eq!(limiters.tracked_clients(), 1);

    for _ in 0..30 {
        limiters.check("upload", &user("idle")).expect("evicted client starts full");
    }
}

#[tokio::test(start_paused = true)]
async fn sweeper_runs_until_cancelled() {
    let limiters = Arc::new(RateLimiters::with_default_policies());
    let cancel = CancellationToken::new();
    let sweeper = limiters.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, DEFAULT_IDLE_TTL, cancel.clone());

    limiters
        .check("download", &ClientKey::from(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))))
        .expect("allowed");
    assert_eq!(limiters.tracked_clients(), 1);

    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(limiters.tracked_clients(), 1, "not idle long enough yet");

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(limiters.tracked_clients(), 0, "evicted by the sweep at 180s");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), sweeper)
        .await
        .expect("sweeper stops after cancellation")
        .expect("sweeper task should not panic");
}
