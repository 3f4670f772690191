//! Per-client admission control with named token-bucket policies.

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, RateLimitError};

/// Integer token bucket.
pub mod bucket;

pub use bucket::TokenBucket;

/// Policy used for unknown policy names.
pub const GLOBAL_POLICY: &str = "global";
/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default idle time after which a client is evicted.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(180);

const MINUTE: Duration = Duration::from_secs(60);

/// Identity a budget is tracked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    /// Authenticated user id.
    User(String),
    /// Anonymous client address.
    Address(IpAddr),
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Address(addr) => write!(f, "ip:{addr}"),
        }
    }
}

impl From<IpAddr> for ClientKey {
    fn from(addr: IpAddr) -> Self {
        Self::Address(addr)
    }
}

/// `limit` requests per `window`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Policy name, such as `upload`.
    pub name: String,
    /// Requests allowed per window, also the burst size.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

impl Policy {
    /// Creates a policy.
    pub fn new(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
        }
    }

    /// Creates a per-minute policy.
    pub fn per_minute(name: impl Into<String>, limit: u32) -> Self {
        Self::new(name, limit, MINUTE)
    }

    /// Interval at which one token is returned.
    pub fn refill_every(&self) -> Duration {
        self.window / self.limit.max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() || self.limit == 0 || self.window.is_zero() {
            return Err(ConfigError::InvalidPolicy {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Budget state reported with every decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Bucket capacity.
    pub limit: u32,
    /// Tokens left after this request.
    pub remaining: u32,
    /// Until the next token when rejected, until a full bucket otherwise.
    pub reset_after: Duration,
}

impl RateLimitInfo {
    /// `reset_after` as a wall-clock timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(self.reset_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + delta
    }

    /// `reset_after` rounded up to whole seconds, for `Retry-After`.
    pub fn reset_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Debug)]
struct VisitorState {
    bucket: TokenBucket,
    last_seen: Instant,
}

#[derive(Debug)]
struct Visitor {
    state: Mutex<VisitorState>,
}

#[derive(Debug)]
struct Limiter {
    policy: Policy,
    visitors: RwLock<HashMap<ClientKey, Arc<Visitor>>>,
}

impl Limiter {
    fn new(policy: Policy) -> Self {
        Self {
            policy,
            visitors: RwLock::new(HashMap::new()),
        }
    }

    fn visitor(&self, key: &ClientKey, now: Instant) -> Arc<Visitor> {
        if let Some(visitor) = self.visitors.read().get(key) {
            return Arc::clone(visitor);
        }

        let mut visitors = self.visitors.write();
        Arc::clone(visitors.entry(key.clone()).or_insert_with(|| {
            Arc::new(Visitor {
                state: Mutex::new(VisitorState {
                    bucket: TokenBucket::new(self.policy.limit, self.policy.refill_every(), now),
                    last_seen: now,
                }),
            })
        }))
    }

    // Stale keys are collected under the read lock so checks on other
    // clients keep running; each one is re-checked before removal.
    fn sweep(&self, idle: Duration, now: Instant) -> usize {
        let is_stale = |visitor: &Visitor| now.saturating_duration_since(visitor.state.lock().last_seen) >= idle;

        let stale: Vec<ClientKey> = self
            .visitors
            .read()
            .iter()
            .filter(|(_, visitor)| is_stale(visitor))
            .map(|(key, _)| key.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }

        let mut visitors = self.visitors.write();
        let mut evicted = 0;
        for key in stale {
            if visitors.get(&key).is_some_and(|visitor| is_stale(visitor)) {
                visitors.remove(&key);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Registry of named rate-limit policies and their per-client buckets.
///
/// Construct once and share by `Arc`. Each policy keeps an independent
/// budget per [`ClientKey`].
#[derive(Debug)]
pub struct RateLimiters {
    global: Limiter,
    named: HashMap<String, Limiter>,
}

impl RateLimiters {
    /// Builds a registry from `policies`, which must include `global`.
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Result<Self, ConfigError> {
        let mut global = None;
        let mut named = HashMap::new();

        for policy in policies {
            policy.validate()?;
            let duplicate = if policy.name == GLOBAL_POLICY {
                global.replace(Limiter::new(policy.clone())).is_some()
            } else {
                named
                    .insert(policy.name.clone(), Limiter::new(policy.clone()))
                    .is_some()
            };
            if duplicate {
                return Err(ConfigError::InvalidPolicy { name: policy.name });
            }
        }

        let global = global.ok_or(ConfigError::MissingGlobalPolicy)?;
        Ok(Self { global, named })
    }

    /// `global` 60, `auth` 10, `upload` 30, `download` 100 and `api` 1000
    /// requests per minute.
    pub fn with_default_policies() -> Self {
        let global = Limiter::new(Policy::per_minute(GLOBAL_POLICY, 60));
        let named = [
            Policy::per_minute("auth", 10),
            Policy::per_minute("upload", 30),
            Policy::per_minute("download", 100),
            Policy::per_minute("api", 1000),
        ]
        .into_iter()
        .map(|policy| (policy.name.clone(), Limiter::new(policy)))
        .collect();
        Self { global, named }
    }

    /// Returns the policy `name` resolves to.
    pub fn policy(&self, name: &str) -> &Policy {
        &self.limiter(name).policy
    }

    /// Spends one token of `key`'s budget under `policy`.
    ///
    /// Unknown policies fall back to `global`. Rejections are final; the
    /// caller decides whether to retry after [`RateLimitError::retry_after`].
    pub fn check(&self, policy: &str, key: &ClientKey) -> Result<RateLimitInfo, RateLimitError> {
        let limiter = self.limiter(policy);
        let now = Instant::now();
        let visitor = limiter.visitor(key, now);

        let mut state = visitor.state.lock();
        state.last_seen = now;
        let allowed = state.bucket.try_acquire(now);
        let info = RateLimitInfo {
            limit: state.bucket.capacity(),
            remaining: state.bucket.tokens(),
            reset_after: if allowed {
                state.bucket.time_until_full(now)
            } else {
                state.bucket.time_until_next(now)
            },
        };
        drop(state);

        if allowed {
            return Ok(info);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            policy = limiter.policy.name.as_str(),
            client = %key,
            retry_after_ms = info.reset_after.as_millis() as u64,
            "ratelimit: request rejected"
        );

        Err(RateLimitError::TooManyRequests {
            policy: limiter.policy.name.clone(),
            info,
        })
    }

    /// Evicts clients idle for at least `idle` and returns how many were removed.
    pub fn sweep(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let evicted = self.global.sweep(idle, now)
            + self
                .named
                .values()
                .map(|limiter| limiter.sweep(idle, now))
                .sum::<usize>();

        #[cfg(feature = "tracing")]
        if evicted > 0 {
            tracing::debug!(evicted, "ratelimit: idle clients evicted");
        }

        evicted
    }

    /// Number of tracked clients across all policies.
    pub fn tracked_clients(&self) -> usize {
        self.global.visitors.read().len()
            + self
                .named
                .values()
                .map(|limiter| limiter.visitors.read().len())
                .sum::<usize>()
    }

    /// Runs [`sweep`](Self::sweep) every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiters = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiters.sweep(idle);
                    }
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("ratelimit: sweeper stopped");
        })
    }

    fn limiter(&self, name: &str) -> &Limiter {
        self.named.get(name).unwrap_or(&self.global)
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::with_default_policies()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(limiter: &Limiter, id: &str, now: Instant) {
        limiter.visitor(&ClientKey::User(id.to_owned()), now).state.lock().last_seen = now;
    }

    #[test]
    fn sweep_removes_clients_idle_for_at_least_the_threshold() {
        let limiter = Limiter::new(Policy::per_minute("upload", 30));
        let start = Instant::now();
        touch(&limiter, "stale", start);
        touch(&limiter, "boundary", start + Duration::from_secs(60));
        touch(&limiter, "fresh", start + Duration::from_secs(100));

        let now = start + Duration::from_secs(180);
        assert_eq!(limiter.sweep(Duration::from_secs(120), now), 2);

        let visitors = limiter.visitors.read();
        assert_eq!(visitors.len(), 1);
        assert!(visitors.contains_key(&ClientKey::User("fresh".to_owned())));
    }

    #[test]
    fn sweep_keeps_clients_seen_after_the_sweep_instant() {
        let limiter = Limiter::new(Policy::per_minute("upload", 30));
        let start = Instant::now();
        touch(&limiter, "late", start + Duration::from_secs(10));

        // A check that lands after the sweep sampled the clock is never stale.
        assert_eq!(limiter.sweep(Duration::from_secs(1), start), 0);
        assert_eq!(limiter.visitors.read().len(), 1);
        assert_eq!(limiter.sweep(Duration::from_secs(5), start + Duration::from_secs(15)), 1);
    }
}
