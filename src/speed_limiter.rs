//! Global download speed limiting
//!
//! All connections across all pools share one token bucket: tokens are bytes,
//! refilled at the configured rate, consumed before each socket read. Sharing
//! a single bucket distributes bandwidth by demand without any per-connection
//! accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared token-bucket throttle, lock-free and cheap to clone.
///
/// A limit of 0 (or `None`) means unlimited and `acquire` returns
/// immediately. The limit can be changed at runtime; waiters re-read it on
/// every refill cycle, so lowering, raising, or removing the limit takes
/// effect within one sleep interval.
///
/// # Algorithm
///
/// - Tokens are bytes; the bucket holds at most one second's worth
/// - Tokens accrue continuously at `limit_bps`
/// - Readers consume tokens before touching the socket
/// - An empty bucket makes the reader sleep until tokens accrue
///
/// # Implementation
///
/// Three `AtomicU64`s behind `Arc`s, so clones share one bucket and no
/// mutex sits on the read path:
/// - `limit_bps`: the limit, 0 meaning unlimited
/// - `tokens`: bytes available right now
/// - `last_refill`: monotonic nanoseconds of the last top-up
#[derive(Clone)]
pub struct SpeedLimiter {
    /// Bytes per second, 0 = unlimited
    limit_bps: Arc<AtomicU64>,
    /// Bytes currently available to consume
    tokens: Arc<AtomicU64>,
    /// Monotonic nanoseconds of the last refill
    last_refill: Arc<AtomicU64>,
}

impl SpeedLimiter {
    /// Create a limiter; `None` disables throttling.
    ///
    /// # Arguments
    ///
    /// * `limit_bps` - Limit in bytes per second (`None` = unlimited)
    ///
    /// # Examples
    ///
    /// ```
    /// use nzb_dl::speed_limiter::SpeedLimiter;
    ///
    /// // 10 MB/s shared across every connection
    /// let limiter = SpeedLimiter::new(Some(10 * 1024 * 1024));
    ///
    /// // No throttling at all
    /// let unlimited = SpeedLimiter::new(None);
    /// ```
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Change the limit at runtime; `None` removes it.
    ///
    /// Raising the limit tops up the bucket by the difference so waiting
    /// readers unblock without waiting a full refill interval. Lowering it
    /// leaves already-accrued tokens in place until consumed.
    ///
    /// # Arguments
    ///
    /// * `limit_bps` - New limit in bytes per second (`None` = unlimited)
    ///
    /// # Examples
    ///
    /// ```
    /// use nzb_dl::speed_limiter::SpeedLimiter;
    ///
    /// let limiter = SpeedLimiter::new(Some(5_000_000));
    ///
    /// limiter.set_limit(Some(10_000_000));
    /// assert_eq!(limiter.limit(), Some(10_000_000));
    ///
    /// limiter.set_limit(None);
    /// assert_eq!(limiter.limit(), None);
    /// ```
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.limit_bps.swap(new_limit, Ordering::SeqCst);
        if new_limit > old_limit {
            self.tokens.fetch_add(new_limit - old_limit, Ordering::SeqCst);
        }
    }

    /// Current limit in bytes per second, `None` when unlimited
    pub fn limit(&self) -> Option<u64> {
        match self.limit_bps.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Wait until `bytes` may be read from the network.
    ///
    /// Returns immediately when unlimited. Consumes tokens partially as they
    /// become available, so a large read cannot be starved forever by many
    /// small ones.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Size of the read about to be issued
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() {
    /// use nzb_dl::speed_limiter::SpeedLimiter;
    ///
    /// let limiter = SpeedLimiter::new(Some(1_000_000)); // 1 MB/s
    ///
    /// // Sleeps whenever the last second's budget is spent
    /// limiter.acquire(16_384).await;
    /// # }
    /// ```
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 || self.limit_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = bytes;
        loop {
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                // Limit was removed while waiting
                return;
            }

            self.refill(limit);

            let available = self.tokens.load(Ordering::SeqCst);
            let take = remaining.min(available);
            if take > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        available,
                        available - take,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= take;
                    if remaining == 0 {
                        return;
                    }
                }
                continue;
            }

            // Bucket empty. Sleep roughly until enough tokens accrue, capped
            // so runtime limit changes are noticed quickly.
            let wait_ms = (remaining as f64 / limit as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    /// Add tokens for the time elapsed since the last refill, capped at one
    /// second's worth (the bucket capacity).
    fn refill(&self, limit: u64) {
        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let add = (limit as f64 * elapsed_secs) as u64;
        if add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let current = self.tokens.load(Ordering::SeqCst);
            self.tokens.store((current + add).min(limit), Ordering::SeqCst);
        }
    }

    /// Monotonic nanoseconds since an arbitrary process-local epoch
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}
