use crate::clock::Clock;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sliding-window limits for one limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Lookback window for admitted requests
    pub window: Duration,
    /// Admissions allowed inside the window
    pub max_requests: usize,
    /// Permanent blacklisting for persistent offenders, if enabled
    pub escalation: Option<EscalationPolicy>,
}

/// Escalation from throttled to blocked.
///
/// Every attempt (admitted or not) is remembered for `violation_window`.
/// When the cap is hit and more than `threshold` attempts fall inside that
/// window, the principal is blacklisted until a manual reset.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub violation_window: Duration,
    pub threshold: usize,
}

impl RateLimitPolicy {
    /// 5 content creations per user every 15 minutes.
    pub fn content_creation() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 5,
            escalation: None,
        }
    }

    /// 10 requests per address per minute, blacklisting after more than
    /// 50 attempts in 5 minutes.
    pub fn ip() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 10,
            escalation: Some(EscalationPolicy {
                violation_window: Duration::from_secs(5 * 60),
                threshold: 50,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request admitted and recorded
    Allowed {
        /// Admissions left in the current window
        remaining: usize,
        /// Time until the oldest admission leaves the window
        reset_in: Duration,
    },
    /// Window is full; retry later
    Throttled { retry_after: Duration },
    /// Principal is blacklisted
    Blocked,
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Per-principal window state.
#[derive(Debug)]
struct RateWindowEntry {
    /// Admitted request instants, oldest first
    admitted: VecDeque<Instant>,
    /// Every attempt inside the violation window, oldest first
    attempts: VecDeque<Instant>,
    blacklisted: bool,
    last_seen: Instant,
}

impl RateWindowEntry {
    fn new(now: Instant) -> Self {
        Self {
            admitted: VecDeque::new(),
            attempts: VecDeque::new(),
            blacklisted: false,
            last_seen: now,
        }
    }
}

/// Drop instants that are at least `window` old.
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

/// In-process sliding-window rate limiter with optional blacklist escalation.
///
/// State is sharded by principal; the prune/check/append sequence for one
/// principal runs under that principal's shard lock, so two concurrent
/// requests can never both take the last slot.
#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    policy: RateLimitPolicy,
    entries: Arc<DashMap<String, RateWindowEntry>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter. `name` labels logs and metrics (e.g. "ip", "content").
    pub fn new(name: &'static str, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            policy,
            entries: Arc::new(DashMap::new()),
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Check whether `principal` may proceed and record the admission if so.
    ///
    /// Rejected attempts never occupy a slot in the admission window; they
    /// only count toward escalation when it is enabled.
    pub fn check_and_record(&self, principal: &str) -> RateLimitResult {
        let now = self.clock.now();
        let window = self.policy.window;
        let max = self.policy.max_requests;

        let mut entry = self
            .entries
            .entry(principal.to_string())
            .or_insert_with(|| RateWindowEntry::new(now));

        if entry.blacklisted {
            metrics::increment_counter!("rate_limit_blocked_total", "limiter" => self.name);
            return RateLimitResult::Blocked;
        }

        entry.last_seen = now;
        prune(&mut entry.admitted, now, window);

        if let Some(escalation) = &self.policy.escalation {
            prune(&mut entry.attempts, now, escalation.violation_window);
            entry.attempts.push_back(now);
        }

        if entry.admitted.len() >= max {
            if let Some(escalation) = &self.policy.escalation {
                let violations = entry.attempts.len();
                if violations > escalation.threshold {
                    entry.blacklisted = true;
                    entry.admitted.clear();
                    entry.attempts.clear();
                    warn!(
                        limiter = self.name,
                        principal,
                        violations,
                        "Principal blacklisted after repeated rate limit violations"
                    );
                    metrics::increment_counter!("rate_limit_blacklisted_total", "limiter" => self.name);
                    metrics::increment_counter!("rate_limit_blocked_total", "limiter" => self.name);
                    return RateLimitResult::Blocked;
                }
            }

            let retry_after = entry
                .admitted
                .front()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(window);
            debug!(limiter = self.name, principal, ?retry_after, "Rate limit exceeded");
            metrics::increment_counter!("rate_limit_throttled_total", "limiter" => self.name);
            return RateLimitResult::Throttled { retry_after };
        }

        entry.admitted.push_back(now);
        let reset_in = entry
            .admitted
            .front()
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(window);

        RateLimitResult::Allowed {
            remaining: max - entry.admitted.len(),
            reset_in,
        }
    }

    /// Current standing of `principal` without recording anything.
    pub fn status(&self, principal: &str) -> RateLimitResult {
        let now = self.clock.now();
        let window = self.policy.window;

        let Some(entry) = self.entries.get(principal) else {
            return RateLimitResult::Allowed {
                remaining: self.policy.max_requests,
                reset_in: window,
            };
        };

        if entry.blacklisted {
            return RateLimitResult::Blocked;
        }

        let live: Vec<Instant> = entry
            .admitted
            .iter()
            .copied()
            .filter(|t| now.saturating_duration_since(*t) < window)
            .collect();
        let until_oldest_expires = live
            .first()
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(window);

        if live.len() >= self.policy.max_requests {
            RateLimitResult::Throttled {
                retry_after: until_oldest_expires,
            }
        } else {
            RateLimitResult::Allowed {
                remaining: self.policy.max_requests - live.len(),
                reset_in: until_oldest_expires,
            }
        }
    }

    pub fn is_blacklisted(&self, principal: &str) -> bool {
        self.entries
            .get(principal)
            .map(|entry| entry.blacklisted)
            .unwrap_or(false)
    }

    /// Manually clear a principal's history and blacklist flag.
    ///
    /// Returns true if the principal was tracked.
    pub fn reset(&self, principal: &str) -> bool {
        let removed = self.entries.remove(principal).is_some();
        if removed {
            info!(limiter = self.name, principal, "Rate limit state reset");
        }
        removed
    }

    /// Forget principals that have been quiet for `idle_multiple` windows.
    ///
    /// Blacklisted principals are kept; the blacklist is a permanent ledger
    /// for the process lifetime.
    pub fn evict_idle(&self, idle_multiple: u32) -> usize {
        let now = self.clock.now();
        let idle_after = self.policy.window.saturating_mul(idle_multiple.max(1));
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            entry.blacklisted || now.saturating_duration_since(entry.last_seen) < idle_after
        });

        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(limiter = self.name, evicted, "Evicted idle principals");
        }
        metrics::gauge!("rate_limit_tracked_principals", self.entries.len() as f64, "limiter" => self.name);
        evicted
    }

    /// Number of principals currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Run `evict_idle` every `interval` on the current runtime.
    pub fn spawn_eviction(&self, interval: Duration, idle_multiple: u32) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.evict_idle(idle_multiple);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn limiter(policy: RateLimitPolicy) -> (RateLimiter, MockClock) {
        let clock = MockClock::starting_now();
        (RateLimiter::new("test", policy, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_policy_values() {
        let content = RateLimitPolicy::content_creation();
        assert_eq!(content.window, Duration::from_secs(900));
        assert_eq!(content.max_requests, 5);
        assert!(content.escalation.is_none());

        let ip = RateLimitPolicy::ip();
        assert_eq!(ip.window, Duration::from_secs(60));
        assert_eq!(ip.max_requests, 10);
        assert_eq!(ip.escalation.as_ref().unwrap().threshold, 50);
    }

    #[test]
    fn test_exactly_one_throttle_then_window_reopens() {
        let (limiter, clock) = limiter(RateLimitPolicy::content_creation());

        for i in 0..5 {
            assert!(
                limiter.check_and_record("user-1").is_allowed(),
                "Request {} should be allowed",
                i + 1
            );
        }

        match limiter.check_and_record("user-1") {
            RateLimitResult::Throttled { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(900));
            }
            other => panic!("expected throttle, got {:?}", other),
        }

        clock.advance(Duration::from_secs(900));
        assert!(limiter.check_and_record("user-1").is_allowed());
    }

    #[test]
    fn test_rejected_attempts_do_not_consume_slots() {
        let (limiter, clock) = limiter(RateLimitPolicy::content_creation());

        for _ in 0..5 {
            assert!(limiter.check_and_record("user-1").is_allowed());
        }
        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            assert!(!limiter.check_and_record("user-1").is_allowed());
        }

        // Only the original five age out; the rejected ones were never stored.
        clock.advance(Duration::from_secs(840));
        for i in 0..5 {
            assert!(
                limiter.check_and_record("user-1").is_allowed(),
                "Request {} after reopening should be allowed",
                i + 1
            );
        }
    }

    #[test]
    fn test_sliding_window_frees_oldest_first() {
        let (limiter, clock) = limiter(RateLimitPolicy {
            window: Duration::from_secs(60),
            max_requests: 2,
            escalation: None,
        });

        assert!(limiter.check_and_record("a").is_allowed());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.check_and_record("a").is_allowed());
        assert_eq!(
            limiter.check_and_record("a"),
            RateLimitResult::Throttled {
                retry_after: Duration::from_secs(30)
            }
        );

        clock.advance(Duration::from_secs(30));
        assert!(limiter.check_and_record("a").is_allowed());
        assert!(!limiter.check_and_record("a").is_allowed());
    }

    #[test]
    fn test_escalation_blocks_permanently() {
        let (limiter, clock) = limiter(RateLimitPolicy::ip());
        let ip = "203.0.113.9";

        for _ in 0..10 {
            assert!(limiter.check_and_record(ip).is_allowed());
        }
        // Attempts 11..=50 are throttled; the 51st crosses the threshold.
        for i in 11..=50 {
            assert!(
                matches!(limiter.check_and_record(ip), RateLimitResult::Throttled { .. }),
                "Attempt {} should be throttled",
                i
            );
        }
        assert_eq!(limiter.check_and_record(ip), RateLimitResult::Blocked);
        assert!(limiter.is_blacklisted(ip));

        clock.advance(Duration::from_secs(24 * 3600));
        for _ in 0..5 {
            assert_eq!(limiter.check_and_record(ip), RateLimitResult::Blocked);
        }
        assert_eq!(limiter.status(ip), RateLimitResult::Blocked);
    }

    #[test]
    fn test_violations_outside_window_do_not_escalate() {
        let (limiter, clock) = limiter(RateLimitPolicy::ip());
        let ip = "198.51.100.1";

        // 30 attempts per round, rounds spaced beyond the violation window.
        for _ in 0..3 {
            for _ in 0..30 {
                limiter.check_and_record(ip);
            }
            clock.advance(Duration::from_secs(301));
        }
        assert!(!limiter.is_blacklisted(ip));
        assert!(limiter.check_and_record(ip).is_allowed());
    }

    #[test]
    fn test_reset_clears_blacklist() {
        let (limiter, _clock) = limiter(RateLimitPolicy {
            window: Duration::from_secs(60),
            max_requests: 1,
            escalation: Some(EscalationPolicy {
                violation_window: Duration::from_secs(300),
                threshold: 2,
            }),
        });

        assert!(limiter.check_and_record("ip").is_allowed());
        assert!(matches!(limiter.check_and_record("ip"), RateLimitResult::Throttled { .. }));
        assert_eq!(limiter.check_and_record("ip"), RateLimitResult::Blocked);

        assert!(limiter.reset("ip"));
        assert!(!limiter.is_blacklisted("ip"));
        assert!(limiter.check_and_record("ip").is_allowed());
    }

    #[test]
    fn test_principals_are_independent() {
        let (limiter, _clock) = limiter(RateLimitPolicy::content_creation());

        for _ in 0..5 {
            assert!(limiter.check_and_record("alice").is_allowed());
        }
        assert!(!limiter.check_and_record("alice").is_allowed());
        assert!(limiter.check_and_record("bob").is_allowed());
    }

    #[test]
    fn test_status_does_not_record() {
        let (limiter, _clock) = limiter(RateLimitPolicy::content_creation());

        for _ in 0..10 {
            assert!(limiter.status("user").is_allowed());
        }
        for _ in 0..4 {
            limiter.check_and_record("user");
        }
        assert!(matches!(
            limiter.status("user"),
            RateLimitResult::Allowed { remaining: 1, .. }
        ));
        limiter.check_and_record("user");
        assert!(matches!(limiter.status("user"), RateLimitResult::Throttled { .. }));
    }

    #[test]
    fn test_evict_idle_keeps_blacklisted() {
        let (limiter, clock) = limiter(RateLimitPolicy {
            window: Duration::from_secs(10),
            max_requests: 1,
            escalation: Some(EscalationPolicy {
                violation_window: Duration::from_secs(60),
                threshold: 1,
            }),
        });

        limiter.check_and_record("quiet");
        limiter.check_and_record("abuser");
        limiter.check_and_record("abuser");
        assert!(limiter.is_blacklisted("abuser"));
        assert_eq!(limiter.tracked(), 2);

        clock.advance(Duration::from_secs(10 * 10));
        assert_eq!(limiter.evict_idle(10), 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.is_blacklisted("abuser"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_exceed_max() {
        let (limiter, _clock) = limiter(RateLimitPolicy::content_creation());

        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_record("same-user").is_allowed()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
