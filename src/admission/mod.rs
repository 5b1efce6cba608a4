//! Per-client admission control.
//!
//! Every transport asks an [`AdmissionController`] whether a request from a given
//! [`ClientKey`] may proceed before doing any work for it. Each key owns a token bucket:
//! a fresh key starts full at [`RateLimitConfig::capacity`] tokens, every admitted
//! request spends one, and tokens flow back in continuously at
//! `refill_amount / refill_period`.
//!
//! # Bounded memory
//!
//! Keys live in two generations. New keys are inserted into the current generation. Once
//! it holds [`RateLimitConfig::max_entries`] keys it becomes the previous generation and a
//! fresh, empty map takes its place; whatever was in the old previous generation is
//! discarded wholesale. A lookup that misses the current generation but hits the
//! previous one promotes the bucket back into the current generation, so a client seen
//! shortly before a rotation keeps its spent tokens.
//!
//! At most `2 * max_entries` buckets are ever held. A key that goes quiet for two
//! rotations is forgotten and comes back with a full bucket.
//!
//! Separately, [`slots::SessionSlots`] caps the number of concurrently open
//! long-lived sessions.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod slots;

pub use slots::SessionSlots;

/// The bare source address of a request, used as the admission lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Derive a key from a transport level address string, stripping any port.
    ///
    /// Addresses that don't carry a recognisable port are used verbatim.
    #[must_use]
    pub fn parse(addr: &str) -> Self {
        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return socket_addr.into();
        }
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
                Self(host.to_string())
            }
            _ => Self(addr.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ClientKey {
    fn from(addr: SocketAddr) -> Self {
        addr.ip().into()
    }
}

impl From<IpAddr> for ClientKey {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, rate_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Generations {
    current: Arc<DashMap<ClientKey, Bucket>>,
    previous: Arc<DashMap<ClientKey, Bucket>>,
}

/// Token bucket rate limiter keyed by [`ClientKey`].
///
/// Cloning is cheap; clones share the same bucket table.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: f64,
    rate_per_sec: f64,
    max_entries: usize,
    generations: RwLock<Generations>,
    current_len: AtomicUsize,
}

impl AdmissionController {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let period = if config.refill_period.is_zero() {
            Duration::from_secs(1)
        } else {
            config.refill_period
        };
        Self {
            inner: Arc::new(Inner {
                capacity: f64::from(config.capacity),
                rate_per_sec: f64::from(config.refill_amount) / period.as_secs_f64(),
                max_entries: config.max_entries.max(1),
                generations: RwLock::new(Generations::default()),
                current_len: AtomicUsize::new(0),
            }),
        }
    }

    /// Decide whether `key` may make a request now, spending a token if so.
    pub fn allow(&self, key: &ClientKey) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &ClientKey, now: Instant) -> bool {
        let inner = &self.inner;
        if inner.current_len.load(Ordering::Acquire) >= inner.max_entries {
            self.rotate();
        }

        // Known keys are served outside the lock so a rotation never waits on a bucket.
        let current = inner.generations.read().current.clone();
        if let Some(mut bucket) = current.get_mut(key) {
            bucket.refill(now, inner.capacity, inner.rate_per_sec);
            return bucket.try_take();
        }
        drop(current);

        // New keys are inserted under the read lock, so the entry and its count always
        // land in the same generation.
        let generations = inner.generations.read();
        let seed = generations
            .previous
            .remove(key)
            .map_or_else(|| Bucket::full(inner.capacity, now), |(_, bucket)| bucket);
        let mut entry = generations.current.entry(key.clone()).or_insert_with(|| {
            inner.current_len.fetch_add(1, Ordering::AcqRel);
            seed
        });
        entry.refill(now, inner.capacity, inner.rate_per_sec);
        entry.try_take()
    }

    fn rotate(&self) {
        let inner = &self.inner;
        let retired = {
            let mut generations = inner.generations.write();
            // Another caller may have rotated while we waited for the lock.
            if inner.current_len.load(Ordering::Acquire) < inner.max_entries {
                return;
            }
            let current = std::mem::take(&mut generations.current);
            inner.current_len.store(0, Ordering::Release);
            std::mem::replace(&mut generations.previous, current)
        };
        tracing::debug!(discarded = retired.len(), "rotated admission generations");
        drop(retired);
    }

    /// Number of keys currently tracked across both generations.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        let generations = self.inner.generations.read();
        generations.current.len() + generations.previous.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(capacity: u32, refill_amount: u32, refill_period: u64) -> AdmissionController {
        AdmissionController::new(&RateLimitConfig {
            capacity,
            refill_amount,
            refill_period: Duration::from_secs(refill_period),
            max_entries: 10_000,
        })
    }

    #[test]
    fn client_key_strips_port() {
        assert_eq!(ClientKey::parse("192.0.2.1:5353").as_str(), "192.0.2.1");
        assert_eq!(ClientKey::parse("[2001:db8::1]:22").as_str(), "2001:db8::1");
        assert_eq!(ClientKey::parse("example.net:80").as_str(), "example.net");
    }

    #[test]
    fn client_key_keeps_portless_addresses() {
        assert_eq!(ClientKey::parse("192.0.2.1").as_str(), "192.0.2.1");
        assert_eq!(ClientKey::parse("2001:db8::1").as_str(), "2001:db8::1");
        assert_eq!(ClientKey::parse("not an address").as_str(), "not an address");
        assert_eq!(ClientKey::parse("host:notaport").as_str(), "host:notaport");
    }

    #[test]
    fn burst_of_capacity_then_reject() {
        // One token per day: nothing refills during the test.
        let limiter = controller(10, 1, 86_400);
        let key = ClientKey::parse("198.51.100.7:1234");
        let results: Vec<bool> = (0..11).map(|_| limiter.allow(&key)).collect();
        assert_eq!(results.iter().filter(|allowed| **allowed).count(), 10);
        assert!(results[..10].iter().all(|allowed| *allowed));
        assert!(!results[10]);
    }

    #[test]
    fn hundred_per_minute_rejects_the_hundred_and_first() {
        let limiter = controller(100, 100, 60);
        let key = ClientKey::parse("203.0.113.9");
        for _ in 0..100 {
            assert!(limiter.allow(&key));
        }
        assert!(!limiter.allow(&key));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = controller(1, 1, 86_400);
        let a = ClientKey::parse("192.0.2.1");
        let b = ClientKey::parse("192.0.2.2");
        assert!(limiter.allow(&a));
        assert!(!limiter.allow(&a));
        assert!(limiter.allow(&b));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = controller(2, 60, 60);
        let key = ClientKey::parse("192.0.2.1");
        let start = Instant::now();
        assert!(limiter.allow_at(&key, start));
        assert!(limiter.allow_at(&key, start));
        assert!(!limiter.allow_at(&key, start));
        assert!(limiter.allow_at(&key, start + Duration::from_secs(1)));
        // Refill never exceeds capacity.
        let later = start + Duration::from_secs(3_600);
        assert!(limiter.allow_at(&key, later));
        assert!(limiter.allow_at(&key, later));
        assert!(!limiter.allow_at(&key, later));
    }

    #[test]
    fn rejection_has_no_side_effects() {
        let limiter = controller(1, 60, 60);
        let key = ClientKey::parse("192.0.2.1");
        let start = Instant::now();
        assert!(limiter.allow_at(&key, start));
        for _ in 0..5 {
            assert!(!limiter.allow_at(&key, start));
        }
        assert!(limiter.allow_at(&key, start + Duration::from_secs(1)));
    }

    #[test]
    fn rotation_bounds_memory_and_promotes_recent_keys() {
        let limiter = AdmissionController::new(&RateLimitConfig {
            capacity: 1,
            refill_amount: 1,
            refill_period: Duration::from_secs(86_400),
            max_entries: 4,
        });
        let recent = ClientKey::parse("192.0.2.200");
        assert!(limiter.allow(&recent));
        for i in 0..3 {
            assert!(limiter.allow(&ClientKey::parse(&format!("192.0.2.{i}"))));
        }
        // The next new key rotates; the spent bucket survives in the previous generation.
        assert!(limiter.allow(&ClientKey::parse("198.51.100.1")));
        assert!(!limiter.allow(&recent));

        for i in 0..1_000 {
            limiter.allow(&ClientKey::parse(&format!("10.0.{}.{}", i / 256, i % 256)));
        }
        assert!(limiter.tracked_keys() <= 8);
    }

    #[test]
    fn concurrent_callers_share_one_bucket() {
        let limiter = controller(50, 1, 86_400);
        let key = ClientKey::parse("192.0.2.1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let key = key.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.allow(&key)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn entry_count_tracks_the_current_generation_under_contention() {
        let limiter = AdmissionController::new(&RateLimitConfig {
            capacity: 1,
            refill_amount: 1,
            refill_period: Duration::from_secs(86_400),
            max_entries: 16,
        });
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for i in 0..500u32 {
                        limiter.allow(&ClientKey::parse(&format!("10.{t}.{}.{}", i / 256, i % 256)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let inner = &limiter.inner;
        let generations = inner.generations.read();
        assert_eq!(inner.current_len.load(Ordering::Acquire), generations.current.len());
        assert!(generations.current.len() <= 16 + 8);
    }
}
