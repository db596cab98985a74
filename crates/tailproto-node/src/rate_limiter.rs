//! Per-session token bucket for defensive re-handshake notices.
//!
//! A `DecryptFailed` frame may be answered with a "rekey required"
//! notice asking the client to re-handshake. Each session gets an
//! independent bucket of `rehandshake_per_min` tokens so a client stuck
//! on a bad key cannot turn every frame into a notice. Tokens refill
//! with integer-only arithmetic. Idle buckets are swept periodically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tailproto_types::{Result, SessionId, TailProtoError};

/// Duration after which an idle bucket is eligible for cleanup.
const BUCKET_EXPIRY_SECS: u64 = 300;

/// Minimum interval between cleanup sweeps.
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Longest gap credited by one refill.
const MAX_REFILL_MS: u64 = 600_000;

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Thread-safe, per-session token bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<RateLimiterInner>,
    tokens_per_min: u32,
}

struct RateLimiterInner {
    map: HashMap<SessionId, Bucket>,
    last_cleanup: Instant,
}

impl RateLimiter {
    pub fn new(tokens_per_min: u32) -> Self {
        Self {
            buckets: Mutex::new(RateLimiterInner {
                map: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            tokens_per_min,
        }
    }

    /// Consumes one token for `session_id`. Returns `false` when the
    /// bucket is empty.
    pub fn try_acquire(&self, session_id: &SessionId) -> Result<bool> {
        let mut inner = self.buckets.lock().map_err(|_| TailProtoError::LockError {
            reason: "rate limiter lock poisoned".into(),
        })?;

        let now = Instant::now();
        maybe_cleanup(&mut inner, now);

        let tokens_per_min = self.tokens_per_min;
        let bucket = inner
            .map
            .entry(session_id.clone())
            .or_insert_with(|| Bucket {
                tokens: tokens_per_min,
                last_refill: now,
            });
        refill_bucket(bucket, tokens_per_min, now);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drops the bucket of a closed session.
    pub fn forget(&self, session_id: &SessionId) {
        if let Ok(mut inner) = self.buckets.lock() {
            inner.map.remove(session_id);
        }
    }

    /// Number of sessions with a live bucket.
    pub fn tracked_sessions(&self) -> usize {
        self.buckets
            .lock()
            .map(|inner| inner.map.len())
            .unwrap_or(0)
    }
}

fn maybe_cleanup(inner: &mut RateLimiterInner, now: Instant) {
    if now.duration_since(inner.last_cleanup).as_secs() < CLEANUP_INTERVAL_SECS {
        return;
    }
    inner.last_cleanup = now;
    inner
        .map
        .retain(|_, bucket| now.duration_since(bucket.last_refill).as_secs() < BUCKET_EXPIRY_SECS);
}

// ---------------------------------------------------------------------------
// Refill logic (integer-only)
// ---------------------------------------------------------------------------

/// `refill = elapsed_ms * tokens_per_min / 60_000`, capped at the
/// bucket size.
fn refill_bucket(bucket: &mut Bucket, tokens_per_min: u32, now: Instant) {
    let elapsed_ms = now.duration_since(bucket.last_refill).as_millis();
    if elapsed_ms == 0 {
        return;
    }
    let capped_ms = u64::try_from(elapsed_ms).unwrap_or(MAX_REFILL_MS).min(MAX_REFILL_MS);

    let refill = capped_ms.saturating_mul(u64::from(tokens_per_min)) / 60_000;
    if refill > 0 {
        let new_tokens = u64::from(bucket.tokens)
            .saturating_add(refill)
            .min(u64::from(tokens_per_min));
        bucket.tokens = u32::try_from(new_tokens).unwrap_or(tokens_per_min);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn allows_up_to_limit_then_refuses() -> std::result::Result<(), TailProtoError> {
        let limiter = RateLimiter::new(2);
        let sid = SessionId::new("s1");

        assert!(limiter.try_acquire(&sid)?);
        assert!(limiter.try_acquire(&sid)?);
        assert!(!limiter.try_acquire(&sid)?);
        Ok(())
    }

    #[test]
    fn sessions_are_independent() -> std::result::Result<(), TailProtoError> {
        let limiter = RateLimiter::new(1);
        let a = SessionId::new("a");
        let b = SessionId::new("b");

        assert!(limiter.try_acquire(&a)?);
        assert!(!limiter.try_acquire(&a)?);
        assert!(limiter.try_acquire(&b)?);
        Ok(())
    }

    #[test]
    fn tokens_refill_after_time() -> std::result::Result<(), TailProtoError> {
        // 600/min = 1 token per 100ms.
        let limiter = RateLimiter::new(600);
        let sid = SessionId::new("s1");
        for _ in 0..600 {
            let _ = limiter.try_acquire(&sid)?;
        }
        assert!(!limiter.try_acquire(&sid)?);

        thread::sleep(Duration::from_millis(200));
        assert!(limiter.try_acquire(&sid)?);
        Ok(())
    }

    #[test]
    fn forget_drops_bucket() -> std::result::Result<(), TailProtoError> {
        let limiter = RateLimiter::new(1);
        let sid = SessionId::new("s1");
        assert!(limiter.try_acquire(&sid)?);
        assert_eq!(limiter.tracked_sessions(), 1);

        limiter.forget(&sid);
        assert_eq!(limiter.tracked_sessions(), 0);
        assert!(limiter.try_acquire(&sid)?);
        Ok(())
    }
}
