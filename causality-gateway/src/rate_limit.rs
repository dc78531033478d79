use dashmap::DashMap;
use metrics::counter;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Refill tokens based on elapsed time.
#[inline]
fn refill(tokens: &mut f64, last_refill: &mut Instant, rate_per_sec: f64, burst: f64) {
    let now = Instant::now();
    let elapsed = now.duration_since(*last_refill);
    *tokens = (*tokens + elapsed.as_secs_f64() * rate_per_sec).min(burst);
    *last_refill = now;
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }
}

/// Two-tier admission limiter: one process-wide bucket plus one bucket per
/// tenant. Either tier running dry rejects the request.
pub struct RateLimiter {
    enabled: bool,
    global: Mutex<TokenBucket>,
    global_rate: f64,
    global_burst: f64,
    per_key: DashMap<String, TokenBucket>,
    per_key_rate: f64,
    per_key_burst: f64,
}

impl RateLimiter {
    pub fn new(
        enabled: bool,
        global_rps: u64,
        global_burst: u64,
        per_key_rps: u64,
        per_key_burst: u64,
    ) -> Self {
        Self {
            enabled,
            global: Mutex::new(TokenBucket::full(global_burst as f64)),
            global_rate: global_rps as f64,
            global_burst: global_burst as f64,
            per_key: DashMap::new(),
            per_key_rate: per_key_rps as f64,
            per_key_burst: per_key_burst as f64,
        }
    }

    /// Consume one token from the global bucket and, when `app_id` is known,
    /// from that tenant's bucket. Both tiers are checked before either is
    /// committed, so a per-key-throttled tenant never drains global
    /// capacity. Requests with no tenant in context (health paths) bypass
    /// the per-key tier.
    pub fn try_acquire(&self, app_id: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }

        // Global lock first, then the per-key shard; every caller takes
        // them in this order.
        let mut global_guard = self.global.lock().expect("rate limiter lock poisoned");
        let global = &mut *global_guard;
        refill(
            &mut global.tokens,
            &mut global.last_refill,
            self.global_rate,
            self.global_burst,
        );
        if global.tokens < 1.0 {
            counter!("rate_limit_rejections_total", &[("tier", "global")]).increment(1);
            return false;
        }

        if let Some(app_id) = app_id {
            let mut entry = self
                .per_key
                .entry(app_id.to_string())
                .or_insert_with(|| TokenBucket::full(self.per_key_burst));
            let bucket = entry.value_mut();
            refill(
                &mut bucket.tokens,
                &mut bucket.last_refill,
                self.per_key_rate,
                self.per_key_burst,
            );
            if bucket.tokens < 1.0 {
                counter!("rate_limit_rejections_total", &[("tier", "per_key")]).increment(1);
                return false;
            }
            bucket.tokens -= 1.0;
        }

        global.tokens -= 1.0;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let limiter = RateLimiter::new(true, 1000, 1000, 1, 1);
        assert!(limiter.try_acquire(Some("demo")));
        assert!(!limiter.try_acquire(Some("demo")));
    }

    #[test]
    fn tenants_are_independent() {
        let limiter = RateLimiter::new(true, 1000, 1000, 1, 1);
        assert!(limiter.try_acquire(Some("a")));
        assert!(limiter.try_acquire(Some("b")));
        assert!(!limiter.try_acquire(Some("a")));
    }

    #[test]
    fn global_tier_applies_without_app_id() {
        let limiter = RateLimiter::new(true, 1, 2, 1000, 1000);
        assert!(limiter.try_acquire(None));
        assert!(limiter.try_acquire(None));
        assert!(!limiter.try_acquire(None));
    }

    #[test]
    fn per_key_rejection_does_not_drain_global() {
        let limiter = RateLimiter::new(true, 1, 2, 1, 1);
        assert!(limiter.try_acquire(Some("a")));
        // Tenant "a" is throttled; the global token must be refunded...
        assert!(!limiter.try_acquire(Some("a")));
        // ...so another tenant can still spend it.
        assert!(limiter.try_acquire(Some("b")));
    }

    #[test]
    fn disabled_limiter_always_admits() {
        let limiter = RateLimiter::new(false, 1, 1, 1, 1);
        for _ in 0..100 {
            assert!(limiter.try_acquire(Some("demo")));
        }
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(true, 1000, 1000, 50, 1);
        assert!(limiter.try_acquire(Some("demo")));
        assert!(!limiter.try_acquire(Some("demo")));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.try_acquire(Some("demo")));
    }
}
