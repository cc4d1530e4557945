use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tracing::debug;

/// Requests allowed per rolling window for one source.
///
/// Two sentinel values:
/// - `max_count == 0`: the source has a known quota that cannot be enforced
///   here (e.g. monthly caps). The session routes such sources to the
///   shared default bucket; a bucket built directly from a zero policy
///   grants tokens without limiting.
/// - `max_count == u64::MAX`: unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_count: u64,
    pub duration: Duration,
}

impl RatePolicy {
    pub const fn new(max_count: u64, duration: Duration) -> Self {
        Self {
            max_count,
            duration,
        }
    }

    pub const fn per_second(max_count: u64) -> Self {
        Self::new(max_count, Duration::from_secs(1))
    }

    pub const fn per_minute(max_count: u64) -> Self {
        Self::new(max_count, Duration::from_secs(60))
    }

    /// Known quota that cannot be enforced per-request.
    pub const fn unenforceable() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub const fn unlimited() -> Self {
        Self::new(u64::MAX, Duration::from_millis(1))
    }
}

/// The static provider quota table, gathered from the providers' public
/// documentation. Unknown providers fall back to the shared default bucket.
///
/// Callers copy this table and apply user overrides during configuration;
/// nothing mutates it at runtime.
pub fn default_rate_limits() -> HashMap<String, RatePolicy> {
    [
        ("github", RatePolicy::per_minute(30)),
        ("fullhunt", RatePolicy::per_minute(60)),
        ("securitytrails", RatePolicy::per_second(1)),
        ("shodan", RatePolicy::per_second(1)),
        ("hackertarget", RatePolicy::per_second(2)),
        ("waybackarchive", RatePolicy::per_minute(15)),
        ("whoisxmlapi", RatePolicy::per_second(50)),
        ("censys", RatePolicy::new(120, Duration::from_secs(5 * 60))),
        ("crtsh", RatePolicy::per_minute(60)),
        ("dnsdumpster", RatePolicy::per_second(2)),
        // Quotas exist but are monthly/hourly and cannot be enforced here.
        ("bufferover", RatePolicy::unenforceable()),
        ("binaryedge", RatePolicy::unenforceable()),
        ("alienvault", RatePolicy::unenforceable()),
        // Possibly unlimited.
        ("c99", RatePolicy::unlimited()),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_owned(), policy))
    .collect()
}

/// A multi-keyed rate limiter: one fixed-window token bucket per string
/// key, created lazily on first take.
///
/// Keys are `source` or `source-credential`, so different credentials for
/// the same source are limited independently while unknown sources share
/// the `"default"` bucket.
///
/// Takers of one key are granted tokens in FIFO arrival order (the window
/// wait happens while holding the bucket's fair mutex). No fairness is
/// promised across keys.
#[derive(Debug, Default)]
pub struct MultiLimiter {
    buckets: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl MultiLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently create the bucket for `key` with `policy` and consume
    /// one token, blocking until one is available.
    pub async fn add_and_take(&self, key: &str, policy: RatePolicy) {
        let bucket = self.bucket(key, policy);
        bucket.take().await;
    }

    /// Block for `wait`, then replace `key`'s bucket with a fresh one under
    /// `policy`. Used when a remote backoff signal arrives: the in-flight
    /// caller absorbs the wait and the source continues under the new,
    /// conservative policy.
    pub async fn sleep_and_reset(
        &self,
        wait: Duration,
        key: &str,
        policy: RatePolicy,
    ) {
        debug!(key, ?wait, ?policy, "sleeping before rate-limit reset");
        tokio::time::sleep(wait).await;
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        buckets.insert(key.to_owned(), Arc::new(Bucket::new(policy)));
    }

    fn bucket(&self, key: &str, policy: RatePolicy) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        buckets
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Bucket::new(policy)))
            .clone()
    }
}

/// Fixed-window token accounting. All permits are replenished at window
/// boundaries; a taker that finds the window exhausted sleeps out the
/// remainder while holding the (FIFO) state lock, which serializes takers
/// of the same bucket in arrival order.
#[derive(Debug)]
struct Bucket {
    state: tokio::sync::Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    policy: RatePolicy,
    taken: u64,
    started_at: Instant,
}

impl Bucket {
    fn new(policy: RatePolicy) -> Self {
        Self {
            state: tokio::sync::Mutex::new(Window {
                policy,
                taken: 0,
                started_at: Instant::now(),
            }),
        }
    }

    async fn take(&self) {
        let mut window = self.state.lock().await;
        let policy = window.policy;
        // Sentinels: unlimited and unenforceable quotas grant immediately.
        if policy.max_count == u64::MAX || policy.max_count == 0 {
            return;
        }

        loop {
            let elapsed = window.started_at.elapsed();
            if elapsed >= policy.duration {
                window.taken = 0;
                window.started_at = Instant::now();
            }
            if window.taken < policy.max_count {
                window.taken += 1;
                return;
            }
            let remaining = policy.duration.saturating_sub(elapsed);
            tokio::time::sleep(remaining).await;
        }
    }
}
