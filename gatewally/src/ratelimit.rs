// gatewally/src/ratelimit.rs
//
// Sliding-window rate limiter, per principal and tier.
//
// Two sorted-set windows per principal — `rate_limit:<id>:minute` and
// `rate_limit:<id>:hour` — members and scores are both the admission
// timestamp. A check counts entries in (now − window, now]; on admission
// the timestamp is inserted into both windows, both get an EXPIRE, and
// entries older than the window are trimmed.
//
// Without Redis, the same arithmetic runs over in-process deques. A Redis
// error fails open with a warning: a degraded limiter must not take the
// gateway down with it.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::config::{RateLimitConfig, TierLimits};
use crate::errors::{GatewayError, Result};

const MINUTE_WINDOW: u64 = 60;
const HOUR_WINDOW:   u64 = 3600;

#[derive(Default)]
struct Windows {
    minute: VecDeque<f64>,
    hour:   VecDeque<f64>,
}

pub struct RateLimiter {
    redis:   Option<ConnectionManager>,
    memory:  DashMap<String, Mutex<Windows>>,
    enabled: bool,
    tiers:   std::collections::HashMap<String, TierLimits>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, redis: Option<ConnectionManager>) -> Self {
        Self {
            redis,
            memory:  DashMap::new(),
            enabled: config.enabled,
            tiers:   config.tiers.clone(),
        }
    }

    fn limits_for(&self, tier: &str) -> TierLimits {
        self.tiers
            .get(tier)
            .or_else(|| self.tiers.get("default"))
            .copied()
            .unwrap_or(TierLimits { requests_per_minute: 60, requests_per_hour: 1000 })
    }

    /// Admit or reject one request. Rejection carries the seconds until the
    /// violated window rolls over.
    pub async fn check(&self, principal_id: &str, tier: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let limits = self.limits_for(tier);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_secs_f64();

        match &self.redis {
            Some(conn) => match self.check_redis(conn.clone(), principal_id, limits, now).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Rate limiter Redis failure: {e} — admitting");
                    Ok(())
                }
            },
            None => self.check_memory(principal_id, limits, now),
        }
    }

    // ── Redis path ────────────────────────────────────────────────────────────

    async fn check_redis(
        &self,
        mut conn: ConnectionManager,
        principal_id: &str,
        limits: TierLimits,
        now: f64,
    ) -> redis::RedisResult<Result<()>> {
        let minute_key = format!("rate_limit:{principal_id}:minute");
        let hour_key   = format!("rate_limit:{principal_id}:hour");

        let minute_count: u64 = redis::cmd("ZCOUNT")
            .arg(&minute_key)
            .arg(now - MINUTE_WINDOW as f64)
            .arg(now)
            .query_async(&mut conn)
            .await?;
        if minute_count >= limits.requests_per_minute {
            return Ok(Err(rejection(now, MINUTE_WINDOW)));
        }

        let hour_count: u64 = redis::cmd("ZCOUNT")
            .arg(&hour_key)
            .arg(now - HOUR_WINDOW as f64)
            .arg(now)
            .query_async(&mut conn)
            .await?;
        if hour_count >= limits.requests_per_hour {
            return Ok(Err(rejection(now, HOUR_WINDOW)));
        }

        let member = now.to_string();
        for (key, window) in [(&minute_key, MINUTE_WINDOW), (&hour_key, HOUR_WINDOW)] {
            redis::cmd("ZADD")
                .arg(key)
                .arg(now)
                .arg(&member)
                .query_async::<_, ()>(&mut conn)
                .await?;
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(window)
                .query_async::<_, ()>(&mut conn)
                .await?;
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(0)
                .arg(now - window as f64)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        Ok(Ok(()))
    }

    // ── In-process path ───────────────────────────────────────────────────────

    fn check_memory(&self, principal_id: &str, limits: TierLimits, now: f64) -> Result<()> {
        let entry = self
            .memory
            .entry(principal_id.to_string())
            .or_insert_with(|| Mutex::new(Windows::default()));
        let mut windows = entry.lock();

        trim(&mut windows.minute, now - MINUTE_WINDOW as f64);
        trim(&mut windows.hour, now - HOUR_WINDOW as f64);

        if windows.minute.len() as u64 >= limits.requests_per_minute {
            return Err(rejection(now, MINUTE_WINDOW));
        }
        if windows.hour.len() as u64 >= limits.requests_per_hour {
            return Err(rejection(now, HOUR_WINDOW));
        }

        windows.minute.push_back(now);
        windows.hour.push_back(now);
        Ok(())
    }
}

fn trim(window: &mut VecDeque<f64>, cutoff: f64) {
    while window.front().map(|&t| t <= cutoff).unwrap_or(false) {
        window.pop_front();
    }
}

fn rejection(now: f64, window: u64) -> GatewayError {
    let retry_after = (window as f64 - (now % window as f64)) as u64 + 1;
    GatewayError::RateLimitExceeded { retry_after }
}
