//! Per-client request limits on `governor` keyed limiters.
//!
//! Every tier and action pair gets its own GCRA limiter that admits `limit`
//! requests per window, keyed by client. Clients are also tracked in a
//! bounded last-seen map: once `max_clients` are known, new clients are
//! refused until [`RateLimiter::sweep`] drops the idle ones.

use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter as Governor};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::OwnerId;

type KeyedLimiter = DefaultKeyedRateLimiter<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateAction {
    CreatePaste,
    ViewPaste,
}

impl RateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateAction::CreatePaste => "createPaste",
            RateAction::ViewPaste => "viewPaste",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateSubject {
    Anonymous(IpAddr),
    Owner(OwnerId),
}

impl RateSubject {
    fn key(&self, action: RateAction) -> String {
        match self {
            RateSubject::Anonymous(ip) => format!("ratelimit:{ip}:{}", action.as_str()),
            RateSubject::Owner(owner) => format!("ratelimit:user:{owner}:{}", action.as_str()),
        }
    }
}

impl fmt::Display for RateSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSubject::Anonymous(ip) => write!(f, "{ip}"),
            RateSubject::Owner(owner) => write!(f, "user:{owner}"),
        }
    }
}

/// Requests allowed per window. Zero disables the limit for that action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub create: u32,
    pub view: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub anonymous: TierLimits,
    pub authenticated: TierLimits,
    pub window: Duration,
    pub max_clients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
    /// Too many distinct clients are tracked to admit another one.
    AtCapacity,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

struct ActionLimiters {
    create: Option<KeyedLimiter>,
    view: Option<KeyedLimiter>,
}

impl ActionLimiters {
    fn new(limits: TierLimits, window: Duration) -> Self {
        Self {
            create: keyed(limits.create, window),
            view: keyed(limits.view, window),
        }
    }

    fn for_action(&self, action: RateAction) -> Option<&KeyedLimiter> {
        match action {
            RateAction::CreatePaste => self.create.as_ref(),
            RateAction::ViewPaste => self.view.as_ref(),
        }
    }
}

/// `limit` requests as a burst, refilled evenly over `window`.
fn keyed(limit: u32, window: Duration) -> Option<KeyedLimiter> {
    let burst = NonZeroU32::new(limit)?;
    let quota = Quota::with_period(window / limit)?.allow_burst(burst);
    Some(Governor::keyed(quota))
}

struct RateLimiterInner {
    anonymous: ActionLimiters,
    authenticated: ActionLimiters,
    last_seen: DashMap<String, Instant>,
    idle_after: Duration,
    max_clients: usize,
    at_capacity_warned: AtomicBool,
}

/// Cheap to clone; clones share the same counters.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                anonymous: ActionLimiters::new(policy.anonymous, policy.window),
                authenticated: ActionLimiters::new(policy.authenticated, policy.window),
                last_seen: DashMap::new(),
                idle_after: policy.window,
                max_clients: policy.max_clients,
                at_capacity_warned: AtomicBool::new(false),
            }),
        }
    }

    pub fn check(&self, subject: &RateSubject, action: RateAction) -> RateDecision {
        let inner = &self.inner;
        let tier = match subject {
            RateSubject::Anonymous(_) => &inner.anonymous,
            RateSubject::Owner(_) => &inner.authenticated,
        };
        let Some(limiter) = tier.for_action(action) else {
            return RateDecision::Allowed;
        };

        let key = subject.key(action);
        // len() must not run while an entry guard is held.
        let tracked = inner.last_seen.len();
        match inner.last_seen.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.insert(Instant::now());
            }
            Entry::Vacant(entry) => {
                if tracked >= inner.max_clients {
                    if !inner.at_capacity_warned.swap(true, Ordering::Relaxed) {
                        log::warn!(
                            "rate limiter tracks {tracked} clients, refusing new ones until the next sweep"
                        );
                    }
                    return RateDecision::AtCapacity;
                }
                entry.insert(Instant::now());
            }
        }

        match limiter.check_key(&key) {
            Ok(()) => RateDecision::Allowed,
            Err(not_until) => {
                log::debug!("rate limit hit for {subject} on {}", action.as_str());
                RateDecision::Limited {
                    retry_after: not_until.wait_time_from(DefaultClock::default().now()),
                }
            }
        }
    }

    /// Drops clients idle for a whole window. Their limiter state has fully
    /// refilled by then, so forgetting them changes no decision.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let inner = &self.inner;
        let idle_after = inner.idle_after;
        let is_idle = |seen: &Instant| now.saturating_duration_since(*seen) >= idle_after;

        let idle: Vec<String> = inner
            .last_seen
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut evicted = 0;
        for key in idle {
            if inner
                .last_seen
                .remove_if(&key, |_, seen| is_idle(seen))
                .is_some()
            {
                evicted += 1;
            }
        }

        for tier in [&inner.anonymous, &inner.authenticated] {
            for limiter in [tier.create.as_ref(), tier.view.as_ref()].into_iter().flatten() {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
        }

        if evicted > 0 {
            inner.at_capacity_warned.store(false, Ordering::Relaxed);
            log::debug!(
                "rate limiter dropped {evicted} idle clients, {} remain",
                self.tracked()
            );
        }
        evicted
    }

    /// Number of clients currently tracked.
    pub fn tracked(&self) -> usize {
        self.inner.last_seen.len()
    }
}

/// Runs [`RateLimiter::sweep`] on a fixed interval until the task is aborted.
pub fn spawn_limiter_sweeper(limiter: RateLimiter, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            limiter.sweep();
        }
    })
}
