// Per-identity token bucket on inbound record rate. Denials are silent to
// the vehicle: the record is dropped, the connection stays open.
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Bucket capacity, records.
    pub capacity: u32,
    /// Refill rate, records per second.
    pub refill_per_sec: f64,
    /// Idle buckets are evicted after this long without traffic.
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            refill_per_sec: 50.0,
            idle_ttl: Duration::from_secs(900),
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Admit or drop one record for the given vehicle.
    pub fn try_admit(&self, device_id: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(device_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: f64::from(self.config.capacity),
                last_refill: now,
                last_seen: now,
            });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec)
            .min(f64::from(self.config.capacity));
        bucket.last_refill = now;
        bucket.last_seen = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            metrics::counter!(
                "fleetline_records_dropped_total",
                "reason" => "rate_limited"
            )
            .increment(1);
            false
        }
    }

    /// Drop buckets idle past the configured TTL, returning the count.
    pub fn evict_idle(&self) -> usize {
        let before = self.buckets.len();
        let ttl = self.config.idle_ttl;
        self.buckets
            .retain(|_, bucket| bucket.last_seen.elapsed() < ttl);
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Periodic idle-bucket eviction until shutdown flips.
    pub async fn run_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let evicted = self.evict_idle();
                    if evicted > 0 {
                        tracing::debug!(evicted, "evicted idle rate-limit buckets");
                    }
                }
            }
        }
    }
}
