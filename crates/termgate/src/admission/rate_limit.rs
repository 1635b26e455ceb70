//! Per-source token bucket rate limiter.
//!
//! Each normalized source address owns one bucket holding up to `burst`
//! tokens. A full window's worth of tokens is restored for every elapsed
//! refill window. When the table reaches `max_tracked`, the least recently
//! seen address is forgotten to make room for the new one, so an attacker
//! cycling addresses can push an idle, well-behaved address back to a cold
//! bucket. That trade keeps memory bounded.
//!
//! Recency is tracked in a min-heap stamped at insert time. Touches only
//! update the bucket; a stale heap record is re-stamped when it reaches the
//! top, so finding the eviction victim never scans the table.
//!
//! State lives only in memory; a restart forgets every bucket.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SourceKey;

// ============================================================================
// Configuration
// ============================================================================

/// Rate limiter settings. Validated by `Config::validate` before use.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Length of one refill window.
    pub window: Duration,
    /// Bucket capacity, also the number of tokens restored per window.
    pub burst: u32,
    /// Optional ban applied when a bucket runs dry.
    pub ban: Option<Duration>,
    /// Upper bound on tracked addresses.
    pub max_tracked: usize,
    /// Buckets untouched for this long are swept.
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            burst: 10,
            ban: None,
            max_tracked: 10_000,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

// ============================================================================
// Bucket
// ============================================================================

#[derive(Debug, Clone)]
struct Bucket {
    /// Identifies this bucket's recency record. A re-inserted address gets a new one.
    seq: u64,
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
    banned_until: Option<Instant>,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The bucket is empty.
    RateLimited,
    /// The source is serving a ban.
    Banned,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denial::RateLimited => "rate_limited",
            Denial::Banned => "banned",
        }
    }
}

impl Bucket {
    fn new(seq: u64, burst: u32, now: Instant) -> Self {
        Self {
            seq,
            tokens: burst,
            last_refill: now,
            last_seen: now,
            banned_until: None,
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let window = config.window.as_nanos().max(1);
        let windows = elapsed.as_nanos() / window;
        if windows == 0 {
            return;
        }

        let restored = windows.saturating_mul(u128::from(config.burst));
        self.tokens = (u128::from(self.tokens) + restored).min(u128::from(config.burst)) as u32;
        self.last_refill = u32::try_from(windows)
            .ok()
            .and_then(|n| config.window.checked_mul(n))
            .and_then(|advance| self.last_refill.checked_add(advance))
            .unwrap_or(now);
    }

    fn take(&mut self, config: &RateLimitConfig, now: Instant) -> Result<(), Denial> {
        self.last_seen = now;

        if let Some(until) = self.banned_until {
            if now < until {
                return Err(Denial::Banned);
            }
            self.banned_until = None;
        }

        self.refill(config, now);

        if self.tokens == 0 {
            if let Some(ban) = config.ban {
                self.banned_until = now.checked_add(ban);
            }
            return Err(Denial::RateLimited);
        }

        self.tokens -= 1;
        Ok(())
    }

    fn is_idle(&self, ttl: Duration, now: Instant) -> bool {
        let banned = self.banned_until.is_some_and(|until| now < until);
        !banned && now.saturating_duration_since(self.last_seen) >= ttl
    }
}

// ============================================================================
// Recency index
// ============================================================================

/// `(last seen when stamped, bucket seq, source)`, oldest first.
type RecencyRecord = Reverse<(Instant, u64, SourceKey)>;

#[derive(Default)]
struct Recency {
    heap: BinaryHeap<RecencyRecord>,
    next_seq: u64,
}

// ============================================================================
// RateLimiter
// ============================================================================

/// Running totals for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub allowed: u64,
    pub denied: u64,
    pub evicted: u64,
    pub tracked: usize,
}

/// Token bucket table keyed by normalized source address.
///
/// Checks on an already-tracked address only lock that address's shard.
/// Admitting a previously unseen address additionally takes the recency
/// lock so the table never grows past `max_tracked`.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<SourceKey, Bucket>,
    recency: Mutex<Recency>,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            recency: Mutex::new(Recency::default()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Returns true if a connection from `source` may proceed.
    pub fn allow(&self, source: SourceKey) -> bool {
        self.check_at(source, Instant::now()).is_ok()
    }

    /// Spend one token for `source` as of `now`.
    pub fn check_at(&self, source: SourceKey, now: Instant) -> Result<(), Denial> {
        if !self.config.enabled {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // The shard guard must be gone before logging reads `len()`.
        let outcome = {
            let existing = self
                .buckets
                .get_mut(&source)
                .map(|mut bucket| bucket.take(&self.config, now));
            match existing {
                Some(outcome) => outcome,
                None => self.admit_new(source, now),
            }
        };

        match outcome {
            Ok(()) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Err(denial) => {
                let denied_total = self.denied.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    target: "termgate::throttle",
                    source = %source,
                    reason = denial.as_str(),
                    denied_total,
                    allowed_total = self.allowed.load(Ordering::Relaxed),
                    tracked = self.buckets.len(),
                    "connection throttled"
                );
            }
        }

        outcome
    }

    fn admit_new(&self, source: SourceKey, now: Instant) -> Result<(), Denial> {
        let mut recency = self.recency.lock().unwrap_or_else(PoisonError::into_inner);

        // Another connection may have inserted it while we waited.
        if let Some(mut bucket) = self.buckets.get_mut(&source) {
            return bucket.take(&self.config, now);
        }

        while self.buckets.len() >= self.config.max_tracked.max(1) {
            if !self.evict_least_recent(&mut recency) {
                break;
            }
        }

        let seq = recency.next_seq;
        recency.next_seq += 1;
        let mut bucket = Bucket::new(seq, self.config.burst, now);
        let outcome = bucket.take(&self.config, now);
        self.buckets.insert(source, bucket);
        recency.heap.push(Reverse((now, seq, source)));
        outcome
    }

    /// Current `last_seen` of the bucket a recency record points at, if that
    /// bucket still exists.
    fn last_seen(&self, source: &SourceKey, seq: u64) -> Option<Instant> {
        self.buckets
            .get(source)
            .filter(|bucket| bucket.seq == seq)
            .map(|bucket| bucket.last_seen)
    }

    fn evict_least_recent(&self, recency: &mut Recency) -> bool {
        while let Some(Reverse((stamp, seq, key))) = recency.heap.pop() {
            match self.last_seen(&key, seq) {
                // Swept or replaced since the record was pushed.
                None => {}
                Some(last_seen) if last_seen > stamp => {
                    recency.heap.push(Reverse((last_seen, seq, key)));
                }
                Some(_) => {
                    let removed = self
                        .buckets
                        .remove_if(&key, |_, bucket| bucket.seq == seq && bucket.last_seen <= stamp);
                    if removed.is_some() {
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        debug!(source = %key, "evicted rate limit bucket");
                        return true;
                    }
                    // Touched between the lookup and the removal.
                    if let Some(last_seen) = self.last_seen(&key, seq) {
                        recency.heap.push(Reverse((last_seen, seq, key)));
                    }
                }
            }
        }
        false
    }

    /// Drop buckets idle for longer than the configured TTL.
    ///
    /// Buckets still serving a ban are kept. Returns the number removed.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let ttl = self.config.idle_ttl;
        let mut recency = self.recency.lock().unwrap_or_else(PoisonError::into_inner);
        self.buckets.retain(|_, bucket| !bucket.is_idle(ttl, now));
        recency
            .heap
            .retain(|Reverse((_, seq, key))| self.last_seen(key, *seq).is_some());
        before.saturating_sub(self.buckets.len())
    }

    /// Periodically sweep idle buckets until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep_idle(Instant::now());
                        if removed > 0 {
                            debug!(removed, tracked = limiter.tracked(), "swept idle rate limit buckets");
                        }
                    }
                }
            }
        })
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            tracked: self.buckets.len(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
