//! Token-bucket rate limiting for the gateway.
//!
//! Two independent bucket families (per-IP and per-token) refill
//! continuously at `capacity / window` tokens per second. A key that is
//! refused gets a block record whose duration doubles on every further
//! refusal while the block is live, capped at one hour. The first allowed
//! request after `blocked_until` removes the record.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Longest back-off a repeat offender can accumulate.
const MAX_BLOCK: Duration = Duration::from_secs(3600);

/// How often a blocked IP may appear in the log.
const IP_BLOCK_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Which family produced a decision; exposed in `X-RateLimit-Resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitResource {
    Ip,
    Token,
}

impl LimitResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitResource::Ip => "ip",
            LimitResource::Token => "token",
        }
    }
}

/// Outcome of one bucket check, carrying everything the rate-limit
/// response headers need.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub resource: LimitResource,
    pub limit: u64,
    pub remaining: u64,
    pub used: u64,
    /// Seconds until the bucket is full again.
    pub reset_secs: u64,
    /// Present on refusals.
    pub retry_after_secs: Option<u64>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct BlockRecord {
    blocked_until: Instant,
    consecutive_blocks: u32,
    block_duration: Duration,
    last_block_log: Option<Instant>,
}

struct Family {
    resource: LimitResource,
    capacity: f64,
    window: Duration,
    refill_rate: f64,
    buckets: DashMap<String, Bucket>,
    blocks: DashMap<String, BlockRecord>,
}

impl Family {
    fn new(resource: LimitResource, capacity: u64, window: Duration) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            resource,
            capacity,
            window,
            refill_rate: capacity / window.as_secs_f64(),
            buckets: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        // An active block refuses outright and doubles the back-off.
        if let Some(mut block) = self.blocks.get_mut(key) {
            if now < block.blocked_until {
                block.consecutive_blocks += 1;
                block.block_duration = (block.block_duration * 2).min(MAX_BLOCK);
                block.blocked_until = now + block.block_duration;
                let retry = block.block_duration.as_secs();
                self.log_block(key, &mut block, now);
                return self.denied(key, now, retry);
            }
        }
        // Past blocked_until: the record is removed and the request gets a
        // fresh bucket check.
        self.blocks.remove(key);

        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let remaining = bucket.tokens.floor() as u64;
            return RateLimitDecision {
                allowed: true,
                resource: self.resource,
                limit: self.capacity as u64,
                remaining,
                used: self.capacity as u64 - remaining,
                reset_secs: self.secs_until_full(bucket.tokens),
                retry_after_secs: None,
            };
        }
        drop(entry);

        // First refusal installs the block at one full window.
        let mut block = self
            .blocks
            .entry(key.to_string())
            .or_insert_with(|| BlockRecord {
                blocked_until: now + self.window,
                consecutive_blocks: 1,
                block_duration: self.window,
                last_block_log: None,
            });
        let retry = block.block_duration.as_secs();
        self.log_block(key, &mut block, now);
        self.denied(key, now, retry)
    }

    fn denied(&self, key: &str, now: Instant, retry_after: u64) -> RateLimitDecision {
        let tokens = self
            .buckets
            .get(key)
            .map(|b| {
                let elapsed = now.saturating_duration_since(b.last_refill);
                (b.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity)
            })
            .unwrap_or(0.0);
        RateLimitDecision {
            allowed: false,
            resource: self.resource,
            limit: self.capacity as u64,
            remaining: 0,
            used: self.capacity as u64,
            reset_secs: self.secs_until_full(tokens),
            retry_after_secs: Some(retry_after),
        }
    }

    fn secs_until_full(&self, tokens: f64) -> u64 {
        ((self.capacity - tokens) / self.refill_rate).ceil() as u64
    }

    fn log_block(&self, key: &str, block: &mut BlockRecord, now: Instant) {
        // IP block events are throttled so a flood cannot swamp the log.
        if self.resource == LimitResource::Ip {
            let due = block
                .last_block_log
                .is_none_or(|last| now.saturating_duration_since(last) >= IP_BLOCK_LOG_INTERVAL);
            if !due {
                return;
            }
            block.last_block_log = Some(now);
        }
        warn!(
            resource = self.resource.as_str(),
            key = %key,
            consecutive = block.consecutive_blocks,
            block_secs = block.block_duration.as_secs(),
            "Rate limit exceeded"
        );
    }

    fn is_blocked_at(&self, key: &str, now: Instant) -> bool {
        self.blocks
            .get(key)
            .is_some_and(|b| now < b.blocked_until)
    }
}

/// The gateway's two bucket families.
pub struct RateLimiter {
    ip: Family,
    token: Family,
}

impl RateLimiter {
    pub fn new(
        ip_limit: u64,
        ip_window: Duration,
        token_limit: u64,
        token_window: Duration,
    ) -> Self {
        Self {
            ip: Family::new(LimitResource::Ip, ip_limit, ip_window),
            token: Family::new(LimitResource::Token, token_limit, token_window),
        }
    }

    pub fn check_ip(&self, ip: &str) -> RateLimitDecision {
        self.ip.check_at(ip, Instant::now())
    }

    pub fn check_token(&self, token_key: &str) -> RateLimitDecision {
        self.token.check_at(token_key, Instant::now())
    }

    pub fn check_ip_at(&self, ip: &str, now: Instant) -> RateLimitDecision {
        self.ip.check_at(ip, now)
    }

    pub fn check_token_at(&self, token_key: &str, now: Instant) -> RateLimitDecision {
        self.token.check_at(token_key, now)
    }

    pub fn is_ip_blocked_at(&self, ip: &str, now: Instant) -> bool {
        self.ip.is_blocked_at(ip, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u64, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            capacity,
            Duration::from_secs(window_secs),
            capacity,
            Duration::from_secs(window_secs),
        )
    }

    #[test]
    fn test_burst_capacity_then_deny() {
        let rl = limiter(2, 60);
        let t0 = Instant::now();

        assert!(rl.check_ip_at("1.2.3.4", t0).allowed);
        assert!(rl.check_ip_at("1.2.3.4", t0).allowed);

        let denied = rl.check_ip_at("1.2.3.4", t0 + Duration::from_secs(1));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(60));
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn test_window_allow_bound() {
        // P1: at most capacity + 1 allows within one window.
        let capacity = 5;
        let rl = limiter(capacity, 10);
        let t0 = Instant::now();

        let mut allows = 0;
        for i in 0..100 {
            let t = t0 + Duration::from_millis(i * 100); // all within 10 s
            if rl.check_token_at("tok", t).allowed {
                allows += 1;
            }
        }
        assert!(allows <= capacity + 1, "got {allows} allows");
    }

    #[test]
    fn test_blocked_key_denies_despite_refill() {
        // P2: while blocked, refill does not matter.
        let rl = limiter(1, 10);
        let t0 = Instant::now();

        assert!(rl.check_token_at("tok", t0).allowed);
        assert!(!rl.check_token_at("tok", t0).allowed); // installs 10 s block

        // 8 s later the bucket alone would have refilled, but the block holds
        // and each refused check doubles the back-off.
        let denied = rl.check_token_at("tok", t0 + Duration::from_secs(8));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(20));
        assert!(rl.is_ip_blocked_at("tok", t0) == false); // separate family
    }

    #[test]
    fn test_block_expiry_removes_record() {
        let rl = limiter(2, 60);
        let t0 = Instant::now();

        assert!(rl.check_ip_at("9.9.9.9", t0).allowed);
        assert!(rl.check_ip_at("9.9.9.9", t0).allowed);
        assert!(!rl.check_ip_at("9.9.9.9", t0).allowed);
        assert!(rl.is_ip_blocked_at("9.9.9.9", t0 + Duration::from_secs(1)));

        // 61 s later the window has passed: allowed again, block removed.
        let later = t0 + Duration::from_secs(61);
        assert!(rl.check_ip_at("9.9.9.9", later).allowed);
        assert!(!rl.is_ip_blocked_at("9.9.9.9", later));
    }

    #[test]
    fn test_block_doubling_caps_at_one_hour() {
        let rl = limiter(1, 1800);
        let t0 = Instant::now();

        assert!(rl.check_token_at("tok", t0).allowed);
        assert!(!rl.check_token_at("tok", t0).allowed); // 1800 s block
        let d = rl.check_token_at("tok", t0 + Duration::from_secs(1));
        assert_eq!(d.retry_after_secs, Some(3600)); // doubled to the cap
        let d = rl.check_token_at("tok", t0 + Duration::from_secs(2));
        assert_eq!(d.retry_after_secs, Some(3600)); // capped
    }

    #[test]
    fn test_continuous_refill() {
        let rl = limiter(10, 10); // 1 token/sec
        let t0 = Instant::now();

        for _ in 0..10 {
            assert!(rl.check_ip_at("ip", t0).allowed);
        }
        assert!(!rl.check_ip_at("ip", t0).allowed); // blocked for 10 s

        // After the block expires, ~12 tokens worth of refill have accrued
        // but the bucket is capped at capacity.
        let later = t0 + Duration::from_secs(22);
        let d = rl.check_ip_at("ip", later);
        assert!(d.allowed);
        assert_eq!(d.limit, 10);
        assert_eq!(d.remaining, 9);
    }

    #[test]
    fn test_families_are_independent() {
        let rl = limiter(1, 60);
        let t0 = Instant::now();

        assert!(rl.check_ip_at("key", t0).allowed);
        // Same key in the token family has its own bucket.
        assert!(rl.check_token_at("key", t0).allowed);
        assert!(!rl.check_ip_at("key", t0).allowed);
        assert!(!rl.check_token_at("key", t0).allowed);
    }

    #[test]
    fn test_decision_header_values() {
        let rl = limiter(4, 60);
        let t0 = Instant::now();

        let d = rl.check_ip_at("ip", t0);
        assert!(d.allowed);
        assert_eq!(d.limit, 4);
        assert_eq!(d.remaining, 3);
        assert_eq!(d.used, 1);
        assert_eq!(d.resource.as_str(), "ip");
        assert!(d.reset_secs > 0 && d.reset_secs <= 60);
    }
}
