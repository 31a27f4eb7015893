//! Bounded concurrent probe engine.

use crate::candidates::{CandidateSource, NextCandidate};
use crate::config::ProbeEngineConfig;
use crate::pool::ProxyPool;
use crate::prober::{ProbeOutcome, ProbeSignal, Prober};
use crate::proxy::ProxyRecord;
use crate::sink::{ProbeReport, ResultSink};
use crate::source::ProxySource;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

/// Run state shared between an engine and its handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Admitting candidates and attempts.
    Running,
    /// Holding new candidates and attempts until resumed.
    Paused,
    /// Winding down; in-flight probes finish, nothing new starts.
    Stopped,
}

/// Counters of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Candidates that reached a final outcome (hit, taken or exhausted).
    /// A requeued candidate is counted once, when it finally finishes.
    pub checked: u64,
    /// Candidates found free.
    pub hits: u64,
    /// Candidates found in use.
    pub taken: u64,
    /// Candidates that ran out of attempts.
    pub exhausted: u64,
    /// Candidates handed back to the candidate source.
    pub requeued: u64,
}

#[derive(Debug, Default)]
struct Counters {
    checked: AtomicU64,
    hits: AtomicU64,
    taken: AtomicU64,
    exhausted: AtomicU64,
    requeued: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RunSummary {
        RunSummary {
            checked: self.checked.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            taken: self.taken.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Remote control for a [`ProbeEngine`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    control: Arc<watch::Sender<EngineState>>,
    counters: Arc<Counters>,
}

impl EngineHandle {
    /// Hold new candidates and attempts. In-flight probes complete.
    pub fn pause(&self) {
        self.control.send_if_modified(|state| {
            if *state == EngineState::Running {
                *state = EngineState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Continue after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.control.send_if_modified(|state| {
            if *state == EngineState::Paused {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Stop the engine between candidates and between attempts.
    pub fn stop(&self) {
        self.control.send_replace(EngineState::Stopped);
    }

    /// Current run state.
    pub fn state(&self) -> EngineState {
        *self.control.borrow()
    }

    /// Live counters of the run.
    pub fn stats(&self) -> RunSummary {
        self.counters.snapshot()
    }
}

/// Drives probing of candidates through the proxy pool.
///
/// At most `concurrency` candidates are attempted at once. Each candidate
/// is attempted sequentially until it is a hit, taken, or out of attempts;
/// inconclusive attempts are retried after a jittered exponential delay.
#[derive(Clone)]
pub struct ProbeEngine {
    pool: Arc<ProxyPool>,
    source: Arc<dyn ProxySource>,
    prober: Arc<dyn Prober>,
    config: ProbeEngineConfig,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    control: Arc<watch::Sender<EngineState>>,
    counters: Arc<Counters>,
}

impl ProbeEngine {
    /// Create an engine over a shared pool.
    pub fn new(
        config: ProbeEngineConfig,
        pool: Arc<ProxyPool>,
        source: Arc<dyn ProxySource>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let limiter = config.max_probes_per_second.map(|rps| {
            let per_second = NonZeroU32::new(rps.ceil() as u32).unwrap_or(NonZeroU32::MIN);
            Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
        });
        let (control, _) = watch::channel(EngineState::Running);

        Self {
            pool,
            source,
            prober,
            config,
            limiter,
            control: Arc::new(control),
            counters: Arc::new(Counters::default()),
        }
    }

    /// A handle to pause, resume or stop the engine and read its counters.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            control: Arc::clone(&self.control),
            counters: Arc::clone(&self.counters),
        }
    }

    /// The pool the engine draws proxies from.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Probe candidates until the source is exhausted or the engine is stopped.
    ///
    /// Returns once every admitted candidate is finished or requeued.
    pub async fn run(
        &self,
        candidates: Arc<dyn CandidateSource>,
        sink: Arc<dyn ResultSink>,
    ) -> RunSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut control = self.control.subscribe();

        info!(
            "Probe engine starting with concurrency {} and {} attempts per candidate",
            self.config.concurrency, self.config.max_attempts
        );

        if self.pool.needs_restock() {
            self.pool.restock(self.source.as_ref()).await;
        }

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!("Probe task failed: {}", e);
                }
            }

            if wait_while_paused(&mut control).await == EngineState::Stopped {
                break;
            }

            if self.pool.claim_restock() {
                let pool = Arc::clone(&self.pool);
                let source = Arc::clone(&self.source);
                tasks.spawn(async move {
                    pool.restock(source.as_ref()).await;
                });
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // A pause may have arrived while every slot was busy.
            if wait_while_paused(&mut control).await == EngineState::Stopped {
                break;
            }

            match candidates.next().await {
                NextCandidate::Ready(candidate) => {
                    let engine = self.clone();
                    let candidates = Arc::clone(&candidates);
                    let sink = Arc::clone(&sink);
                    tasks.spawn(async move {
                        let _permit = permit;
                        engine.process(candidate, candidates.as_ref(), sink.as_ref()).await;
                    });
                }
                NextCandidate::Pending => {
                    drop(permit);
                    if !sleep_unless_stopped(&mut control, self.config.idle_delay).await {
                        break;
                    }
                }
                NextCandidate::Exhausted => {
                    info!("Candidate source exhausted");
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Probe task failed: {}", e);
            }
        }

        let summary = self.counters.snapshot();
        let pool = self.pool.stats();
        info!(
            "Probe engine finished: {} checked, {} hits, {} taken, {} exhausted, {} requeued; {}/{} eligible proxies",
            summary.checked,
            summary.hits,
            summary.taken,
            summary.exhausted,
            summary.requeued,
            pool.eligible,
            pool.total
        );
        summary
    }

    /// Take one candidate through its attempts.
    async fn process(
        &self,
        candidate: String,
        candidates: &dyn CandidateSource,
        sink: &dyn ResultSink,
    ) {
        let mut control = self.control.subscribe();
        let mut total_latency = Duration::ZERO;
        let mut attempt = 0;

        loop {
            if wait_while_paused(&mut control).await == EngineState::Stopped {
                self.requeue(candidates, candidate, "engine stopped").await;
                return;
            }
            attempt += 1;

            let waited = Instant::now();
            let proxy = match self.acquire_proxy(&mut control).await {
                Acquired::Proxy(proxy) => proxy,
                Acquired::Stopped => {
                    self.requeue(candidates, candidate, "engine stopped").await;
                    return;
                }
                Acquired::Exhausted => {
                    let outcome =
                        ProbeOutcome::classify(&candidate, waited.elapsed(), ProbeSignal::NoProxy);
                    self.emit(sink, &candidate, outcome, attempt - 1, total_latency)
                        .await;
                    self.requeue(candidates, candidate, "no healthy proxies").await;
                    return;
                }
            };

            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }

            let outcome = self
                .prober
                .probe(&candidate, &proxy.address, self.config.probe_timeout)
                .await;
            self.pool
                .release(&proxy.address, outcome.latency(), outcome.is_proxy_success());
            total_latency += outcome.latency();

            debug!(
                "Attempt {}/{} for {} via {}: {}",
                attempt,
                self.config.max_attempts,
                candidate,
                proxy.display_address(),
                outcome.signal()
            );

            match &outcome {
                ProbeOutcome::Hit(_) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    info!("Available: {}", candidate);
                }
                ProbeOutcome::Taken(_) => {
                    self.counters.taken.fetch_add(1, Ordering::Relaxed);
                }
                _ if attempt >= self.config.max_attempts => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        candidate,
                        attempt,
                        outcome.signal()
                    );
                }
                _ => {
                    let delay = retry_delay(
                        attempt,
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                    );
                    if !sleep_unless_stopped(&mut control, delay).await {
                        self.requeue(candidates, candidate, "engine stopped").await;
                        return;
                    }
                    continue;
                }
            }

            self.counters.checked.fetch_add(1, Ordering::Relaxed);
            self.emit(sink, &candidate, outcome, attempt, total_latency)
                .await;
            return;
        }
    }

    /// Acquire a proxy, restocking and backing off while the pool is empty.
    ///
    /// Healthy proxies that are only resting are waited for; the bounded
    /// restock rounds apply when no eligible proxy is left.
    async fn acquire_proxy(&self, control: &mut watch::Receiver<EngineState>) -> Acquired {
        let mut round = 0;
        loop {
            if *control.borrow() == EngineState::Stopped {
                return Acquired::Stopped;
            }
            if let Some(proxy) = self.pool.acquire() {
                return Acquired::Proxy(proxy);
            }

            if let Some(rest) = self.pool.next_rested_in() {
                debug!("All eligible proxies cooling, next one free in {:?}", rest);
                if !sleep_unless_stopped(control, rest.max(MIN_COOLING_WAIT)).await {
                    return Acquired::Stopped;
                }
                continue;
            }

            let stats = self.pool.stats();
            debug!(
                "No proxy available (round {}): {} total, {} eligible, {} cooling",
                round + 1,
                stats.total,
                stats.eligible,
                stats.cooling
            );
            if round == self.config.pool_empty_retries {
                break;
            }

            let report = self.pool.restock(self.source.as_ref()).await;
            if let Some(e) = &report.error {
                warn!("Restock failed while pool empty: {}", e);
            }
            if !sleep_unless_stopped(control, self.config.pool_empty_delay).await {
                return Acquired::Stopped;
            }
            round += 1;
        }

        warn!("No healthy proxies available, candidate goes back to the queue");
        Acquired::Exhausted
    }

    async fn emit(
        &self,
        sink: &dyn ResultSink,
        candidate: &str,
        outcome: ProbeOutcome,
        attempts: u32,
        latency: Duration,
    ) {
        let report = ProbeReport {
            candidate: candidate.to_string(),
            outcome,
            attempts,
            latency,
        };
        match time::timeout(self.config.sink_timeout, sink.emit(report)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Result sink rejected report for {}: {}", candidate, e),
            Err(_) => warn!(
                "Result sink did not accept report for {} within {:?}",
                candidate, self.config.sink_timeout
            ),
        }
    }

    async fn requeue(&self, candidates: &dyn CandidateSource, candidate: String, reason: &str) {
        debug!("Requeueing {}: {}", candidate, reason);
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        candidates.requeue(candidate).await;
    }
}

/// Floor on the wait for a cooling proxy, so racing tasks do not spin.
const MIN_COOLING_WAIT: Duration = Duration::from_millis(10);

enum Acquired {
    Proxy(ProxyRecord),
    Exhausted,
    Stopped,
}

/// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)` capped at `max`,
/// drawn uniformly from its upper half.
pub(crate) fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let ceiling = base.saturating_mul(factor).min(max);
    let floor = ceiling / 2;
    if ceiling <= floor {
        return ceiling;
    }
    rand::rng().random_range(floor..=ceiling)
}

/// Block while paused; returns the state that ended the wait.
async fn wait_while_paused(control: &mut watch::Receiver<EngineState>) -> EngineState {
    loop {
        let state = *control.borrow_and_update();
        if state != EngineState::Paused {
            return state;
        }
        if control.changed().await.is_err() {
            return EngineState::Stopped;
        }
    }
}

/// Sleep for `delay`; returns `false` if the engine was stopped meanwhile.
async fn sleep_unless_stopped(control: &mut watch::Receiver<EngineState>, delay: Duration) -> bool {
    let sleep = time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        if *control.borrow_and_update() == EngineState::Stopped {
            return false;
        }
        tokio::select! {
            _ = &mut sleep => return *control.borrow() != EngineState::Stopped,
            changed = control.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);

        for _ in 0..50 {
            let first = retry_delay(1, base, max);
            assert!(first >= Duration::from_millis(50) && first <= base);

            let third = retry_delay(3, base, max);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

            let late = retry_delay(30, base, max);
            assert!(late >= Duration::from_millis(500) && late <= max);
        }
    }

    #[test]
    fn retry_delay_zero_base_is_zero() {
        assert_eq!(retry_delay(4, Duration::ZERO, Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test]
    async fn handle_moves_between_states() {
        let (tx, _rx) = watch::channel(EngineState::Running);
        let handle = EngineHandle {
            control: Arc::new(tx),
            counters: Arc::new(Counters::default()),
        };

        handle.pause();
        assert_eq!(handle.state(), EngineState::Paused);
        handle.resume();
        assert_eq!(handle.state(), EngineState::Running);
        handle.stop();
        handle.resume();
        assert_eq!(handle.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_wait_ends_on_stop() {
        let (tx, mut rx) = watch::channel(EngineState::Paused);
        let waiter = tokio::spawn(async move { wait_while_paused(&mut rx).await });

        time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        tx.send_replace(EngineState::Stopped);
        assert_eq!(waiter.await.unwrap(), EngineState::Stopped);
    }
}
