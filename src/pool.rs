//! Core proxy pool implementation.

use crate::config::ProxyPoolConfig;
use crate::error::{NoProxyAvailable, SourceError};
use crate::proxy::{redact, ProxyRecord};
use crate::source::ProxySource;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A pool of proxies with health-based selection and per-proxy cooldown.
///
/// The record map sits behind a synchronous lock that is only held for
/// bookkeeping, never across network I/O. Restocks are single-flight: a
/// caller arriving while a restock runs waits for it and then returns
/// without fetching again.
pub struct ProxyPool {
    /// All proxies in the pool, keyed by address.
    records: Mutex<HashMap<String, ProxyRecord>>,
    /// Configuration for the pool.
    pub config: ProxyPoolConfig,
    /// Serializes restocks.
    restock_lock: tokio::sync::Mutex<()>,
    /// Number of restocks completed so far.
    restock_generation: AtomicU64,
    /// Start of the most recent restock.
    last_restock: Mutex<Option<Instant>>,
}

/// Snapshot of the pool composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Records currently held.
    pub total: usize,
    /// Records the health policy allows to be handed out.
    pub eligible: usize,
    /// Eligible records still resting after their last use.
    pub cooling: usize,
}

/// What a call to [`ProxyPool::restock`] did.
#[derive(Debug, Default)]
pub struct RestockReport {
    /// Ineligible records dropped by compaction.
    pub removed: usize,
    /// New records added from the source.
    pub added: usize,
    /// The call waited for a concurrent restock instead of running one.
    pub coalesced: bool,
    /// The source fetch failed; the pool was left as it was.
    pub error: Option<SourceError>,
}

impl ProxyPool {
    /// Create an empty pool.
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            restock_lock: tokio::sync::Mutex::new(()),
            restock_generation: AtomicU64::new(0),
            last_restock: Mutex::new(None),
        }
    }

    /// Create a pool seeded with known addresses, such as a saved good-list.
    ///
    /// Duplicates are ignored and at most `max_size` addresses are kept.
    pub fn with_addresses<I, S>(config: ProxyPoolConfig, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new(config);
        let added = pool.insert_new(addresses.into_iter().map(Into::into));
        info!("Seeded proxy pool with {} proxies", added);
        pool
    }

    /// Reserve the best rested, eligible proxy.
    ///
    /// Among eligible records off cooldown, picks the lowest average latency,
    /// then the fewest attempts, then at random. The record is stamped as
    /// used before the lock is released so no concurrent caller gets it.
    /// `None` means the pool is temporarily exhausted.
    pub fn acquire(&self) -> Option<ProxyRecord> {
        let now = Instant::now();
        let mut records = self.records.lock();

        let address = {
            let available: Vec<&ProxyRecord> = records
                .values()
                .filter(|r| r.is_eligible(&self.config) && r.is_rested(now, self.config.cooldown))
                .collect();

            let best = available
                .iter()
                .map(|r| (r.avg_latency(), r.attempts))
                .min()?;

            let tied: Vec<&ProxyRecord> = available
                .into_iter()
                .filter(|r| (r.avg_latency(), r.attempts) == best)
                .collect();
            tied.choose(&mut rand::rng())?.address.clone()
        };

        let record = records.get_mut(&address)?;
        record.last_used_at = Some(now);
        debug!("Acquired proxy {}", record.display_address());
        Some(record.clone())
    }

    /// Like [`acquire`](Self::acquire), with exhaustion as an error value.
    pub fn try_acquire(&self) -> Result<ProxyRecord, NoProxyAvailable> {
        self.acquire().ok_or(NoProxyAvailable)
    }

    /// Record the outcome of one use of the proxy at `address`.
    ///
    /// Unknown addresses (e.g. compacted away while in use) are ignored.
    pub fn release(&self, address: &str, latency: Duration, success: bool) {
        let mut records = self.records.lock();
        match records.get_mut(address) {
            Some(record) => {
                let was_eligible = record.is_eligible(&self.config);
                record.record(latency, success);

                if was_eligible && !record.is_eligible(&self.config) {
                    warn!(
                        "Proxy {} marked ineligible: {}/{} successes, avg {:?}, {} failures in a row",
                        record.display_address(),
                        record.successes,
                        record.attempts,
                        record.avg_latency(),
                        record.consecutive_failures
                    );
                }
            }
            None => debug!("Release for unknown proxy {}", redact(address)),
        }
    }

    /// Time until the next eligible record is off cooldown, zero if one is
    /// rested already. `None` when no record is eligible.
    pub fn next_rested_in(&self) -> Option<Duration> {
        let now = Instant::now();
        let records = self.records.lock();
        records
            .values()
            .filter(|r| r.is_eligible(&self.config))
            .map(|r| match r.last_used_at {
                Some(last) => (last + self.config.cooldown).saturating_duration_since(now),
                None => Duration::ZERO,
            })
            .min()
    }

    /// Whether the eligible count has dropped under `min_size`.
    pub fn needs_restock(&self) -> bool {
        self.stats().eligible < self.config.min_size
    }

    /// Whether a proactive restock is due: the pool is low and no restock
    /// started within `restock_interval`. A `true` answer claims the slot,
    /// so concurrent callers do not all schedule one.
    pub fn claim_restock(&self) -> bool {
        if !self.needs_restock() {
            return false;
        }
        let mut last = self.last_restock.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.saturating_duration_since(at) < self.config.restock_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Drop ineligible records and top the pool up from `source`.
    ///
    /// Only one restock runs at a time; callers that arrive while one is in
    /// flight wait for it and return a coalesced report. A failed fetch
    /// leaves the pool as it is and is returned in the report.
    pub async fn restock(&self, source: &dyn ProxySource) -> RestockReport {
        let seen_generation = self.restock_generation.load(Ordering::Acquire);
        let _guard = self.restock_lock.lock().await;

        if self.restock_generation.load(Ordering::Acquire) != seen_generation {
            debug!("Restock already completed by a concurrent caller");
            return RestockReport {
                coalesced: true,
                ..RestockReport::default()
            };
        }

        *self.last_restock.lock() = Some(Instant::now());
        let mut report = RestockReport {
            removed: self.compact(),
            ..RestockReport::default()
        };

        let room = self.config.max_size.saturating_sub(self.records.lock().len());
        if room > 0 {
            info!("Proxy pool has room for {} proxies, fetching new proxies", room);
            match source.fetch(room).await {
                Ok(fresh) => {
                    report.added = self.insert_new(fresh);
                    info!("Added {} new proxies", report.added);
                }
                Err(e) => {
                    warn!("Proxy source fetch failed, pool left as is: {}", e);
                    report.error = Some(e);
                }
            }
        }

        self.restock_generation.fetch_add(1, Ordering::Release);

        let stats = self.stats();
        info!(
            "Proxy pool status update: {}/{} eligible proxies",
            stats.eligible, stats.total
        );
        if stats.eligible == 0 {
            warn!("No healthy proxies available in pool");
        }

        report
    }

    /// Drop every ineligible record, returning how many went.
    fn compact(&self) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.is_eligible(&self.config));
        let removed = before - records.len();
        if removed > 0 {
            info!("Removed {} bad/slow proxies", removed);
        }
        removed
    }

    /// Add unseen addresses while there is room, returning how many went in.
    fn insert_new(&self, addresses: impl IntoIterator<Item = String>) -> usize {
        let mut records = self.records.lock();
        let mut batch = HashSet::new();
        let mut added = 0;

        for address in addresses {
            if records.len() >= self.config.max_size {
                break;
            }
            let address = address.trim().to_string();
            if address.is_empty() || records.contains_key(&address) || !batch.insert(address.clone())
            {
                continue;
            }
            records.insert(address.clone(), ProxyRecord::new(address));
            added += 1;
        }

        added
    }

    /// Addresses of all eligible records, for persisting a good-list.
    pub fn good_addresses(&self) -> Vec<String> {
        let records = self.records.lock();
        let mut good: Vec<String> = records
            .values()
            .filter(|r| r.is_eligible(&self.config))
            .map(|r| r.address.clone())
            .collect();
        good.sort();
        good
    }

    /// The best `n` records, by successes then average latency.
    pub fn leaderboard(&self, n: usize) -> Vec<ProxyRecord> {
        let records = self.records.lock();
        let mut ranked: Vec<ProxyRecord> = records.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.successes
                .cmp(&a.successes)
                .then_with(|| a.avg_latency().cmp(&b.avg_latency()))
        });
        ranked.truncate(n);
        ranked
    }

    /// A copy of the record for `address`, if present.
    pub fn get(&self, address: &str) -> Option<ProxyRecord> {
        self.records.lock().get(address).cloned()
    }

    /// Get statistics about the proxy pool.
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let records = self.records.lock();
        let mut stats = PoolStats {
            total: records.len(),
            eligible: 0,
            cooling: 0,
        };
        for record in records.values().filter(|r| r.is_eligible(&self.config)) {
            stats.eligible += 1;
            if !record.is_rested(now, self.config.cooldown) {
                stats.cooling += 1;
            }
        }
        stats
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the pool holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingSource {
        prefix: &'static str,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(prefix: &'static str) -> Self {
            Self {
                prefix,
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ProxySource for CountingSource {
        async fn fetch(&self, count: usize) -> Result<Vec<String>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            // Hand out more than asked, with a duplicate, to exercise the caps.
            let mut out: Vec<String> = (0..count + 5)
                .map(|i| format!("http://{}-{}:8080", self.prefix, i))
                .collect();
            out.push(format!("http://{}-0:8080", self.prefix));
            Ok(out)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ProxySource for FailingSource {
        async fn fetch(&self, _count: usize) -> Result<Vec<String>, SourceError> {
            Err(SourceError::Status(503))
        }
    }

    fn config() -> ProxyPoolConfig {
        ProxyPoolConfig::builder()
            .min_size(2)
            .max_size(4)
            .min_sample_size(3)
            .cooldown(Duration::from_secs(10))
            .build()
    }

    #[test]
    fn acquire_prefers_lowest_latency_then_fewest_attempts() {
        let pool = ProxyPool::with_addresses(
            ProxyPoolConfig::builder().cooldown(Duration::ZERO).build(),
            ["http://slow:1", "http://fast:1", "http://busy:1"],
        );
        pool.release("http://slow:1", Duration::from_millis(900), true);
        pool.release("http://fast:1", Duration::from_millis(100), true);
        pool.release("http://busy:1", Duration::from_millis(100), true);
        pool.release("http://busy:1", Duration::from_millis(100), true);

        let picked = pool.acquire().unwrap();
        assert_eq!(picked.address, "http://fast:1");
    }

    #[test]
    fn acquire_skips_cooling_proxies() {
        let pool = ProxyPool::with_addresses(config(), ["http://a:1", "http://b:1"]);

        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        assert_ne!(first.address, second.address);

        // Both are resting now.
        assert!(pool.acquire().is_none());
        assert!(pool.try_acquire().is_err());
        assert_eq!(pool.stats().cooling, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_hands_out_again_after_cooldown() {
        let pool = ProxyPool::with_addresses(config(), ["http://a:1"]);

        let first = pool.acquire().unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(pool.acquire().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        let again = pool.acquire().unwrap();
        assert_eq!(first.address, again.address);
        assert!(again.last_used_at.unwrap() - first.last_used_at.unwrap() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn next_rested_in_tracks_the_nearest_cooldown() {
        let pool = ProxyPool::with_addresses(config(), ["http://a:1", "http://b:1"]);
        assert_eq!(pool.next_rested_in(), Some(Duration::ZERO));

        pool.acquire().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        pool.acquire().unwrap();
        assert_eq!(pool.next_rested_in(), Some(Duration::from_secs(6)));

        for _ in 0..3 {
            pool.release("http://a:1", Duration::from_millis(10), false);
            pool.release("http://b:1", Duration::from_millis(10), false);
        }
        assert_eq!(pool.next_rested_in(), None);
    }

    #[test]
    fn acquire_never_returns_ineligible_records() {
        let pool = ProxyPool::with_addresses(
            ProxyPoolConfig::builder()
                .min_sample_size(3)
                .cooldown(Duration::ZERO)
                .build(),
            ["http://bad:1"],
        );
        for _ in 0..3 {
            pool.release("http://bad:1", Duration::from_millis(10), false);
        }
        assert!(pool.acquire().is_none());
        assert!(pool.good_addresses().is_empty());
    }

    #[test]
    fn concurrent_releases_are_not_lost() {
        let pool = Arc::new(ProxyPool::with_addresses(config(), ["http://a:1"]));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        pool.release("http://a:1", Duration::from_millis(1), (t + i) % 2 == 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let record = pool.get("http://a:1").unwrap();
        assert_eq!(record.attempts, 800);
        assert_eq!(record.successes, 400);
        assert!(record.successes <= record.attempts);
    }

    #[test]
    fn seeding_dedups_and_caps_at_max_size() {
        let pool = ProxyPool::with_addresses(
            config(),
            ["http://a:1", "http://a:1", "http://b:1", "http://c:1", "http://d:1", "http://e:1"],
        );
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn restock_compacts_and_fills_to_max_size() {
        let pool = ProxyPool::with_addresses(config(), ["http://bad:1", "http://good:1"]);
        for _ in 0..3 {
            pool.release("http://bad:1", Duration::from_millis(10), false);
        }
        let source = CountingSource::new("fresh");

        let report = tokio_test::block_on(pool.restock(&source));

        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 3);
        assert!(report.error.is_none());
        assert_eq!(pool.len(), 4);
        assert!(pool.get("http://bad:1").is_none());
        assert!(pool.get("http://good:1").is_some());

        let addresses = pool.good_addresses();
        let unique: HashSet<_> = addresses.iter().collect();
        assert_eq!(unique.len(), addresses.len());
    }

    #[tokio::test]
    async fn restock_skips_fetch_when_full() {
        let pool = ProxyPool::with_addresses(
            config(),
            ["http://a:1", "http://b:1", "http://c:1", "http://d:1"],
        );
        let source = CountingSource::new("fresh");

        let report = pool.restock(&source).await;

        assert_eq!(report.added, 0);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(pool.len(), 4);
    }

    #[tokio::test]
    async fn restock_failure_leaves_pool_untouched() {
        let pool = ProxyPool::with_addresses(config(), ["http://a:1"]);

        let report = pool.restock(&FailingSource).await;

        assert!(matches!(report.error, Some(SourceError::Status(503))));
        assert_eq!(pool.len(), 1);
        assert!(pool.needs_restock());
    }

    #[tokio::test]
    async fn concurrent_restocks_fetch_once() {
        let pool = Arc::new(ProxyPool::new(config()));
        let source = Arc::new(CountingSource {
            delay: Duration::from_millis(50),
            ..CountingSource::new("fresh")
        });

        let calls = (0..8).map(|_| {
            let pool = Arc::clone(&pool);
            let source = Arc::clone(&source);
            async move { pool.restock(source.as_ref()).await }
        });
        let reports = futures::future::join_all(calls).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(reports.iter().filter(|r| !r.coalesced).count(), 1);
        assert_eq!(pool.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_restock_is_throttled() {
        let pool = ProxyPool::new(config());
        assert!(pool.claim_restock());
        assert!(!pool.claim_restock());

        tokio::time::advance(pool.config.restock_interval).await;
        pool.restock(&FailingSource).await;
        assert!(pool.needs_restock());
        assert!(!pool.claim_restock());

        tokio::time::advance(pool.config.restock_interval).await;
        assert!(pool.claim_restock());
    }

    #[test]
    fn leaderboard_ranks_by_successes_then_latency() {
        let pool = ProxyPool::with_addresses(config(), ["http://a:1", "http://b:1", "http://c:1"]);
        pool.release("http://a:1", Duration::from_millis(500), true);
        pool.release("http://b:1", Duration::from_millis(100), true);
        pool.release("http://c:1", Duration::from_millis(100), true);
        pool.release("http://c:1", Duration::from_millis(100), true);

        let top: Vec<String> = pool.leaderboard(2).into_iter().map(|r| r.address).collect();
        assert_eq!(top, vec!["http://c:1", "http://b:1"]);
    }
}
