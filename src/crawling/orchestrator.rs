//! # Stage Scheduler
//!
//! Drives a site's traversal: pops targets off the frontier, resolves them
//! through the transport with bounded concurrency, expands each response via
//! the [`TraversalBuilder`], merges fragments into the [`PendingLedger`] and
//! releases items through the reconciler and emitter once complete.
//!
//! Identical fetches (same method, target and payload) are coalesced while
//! one is in flight; every waiting target is expanded from the single
//! resolution with its own stage and context. Once a fetch has been issued,
//! later first-attempt submissions of it are skipped for the rest of the run.
//! Retries wait out the transport's retry delay in their own task, outside
//! the fetch deadline and without a concurrency permit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::emitter::{EmitError, Emitter, RecordSink};
use super::ledger::{CompletedItem, EvictedItem, LedgerError, MergeOutcome, PendingLedger};
use super::reconciler::VariantReconciler;
use super::stages::{ExtractOutcome, KeyedFragment, SiteProfile, TraversalBuilder};
use super::state::{RunReport, RunStats};
use super::tasks::{FetchKey, FetchResponse, FetchTarget, Payload, StageTag};
use super::transport::{FetchError, Transport};
use crate::domain::{CanonicalRecord, ItemKey, StockFacts};
use crate::infrastructure::config::{CrawlerConfig, defaults};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently resolving fetches
    pub max_in_flight: usize,
    /// Per-fetch deadline; expiry counts as a retryable failure
    pub fetch_timeout: Duration,
    /// Incomplete items older than this are evicted
    pub completion_timeout: Duration,
    /// Failed fetches an item may accumulate before eviction
    pub max_item_attempts: u32,
    pub sweep_interval: Duration,
    pub stats_interval: Duration,
    /// Grace period for in-flight fetches after cancellation
    pub shutdown_timeout: Duration,
    /// Emit evicted items with an incomplete marker instead of dropping them
    pub emit_incomplete: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: defaults::MAX_IN_FLIGHT,
            fetch_timeout: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
            completion_timeout: Duration::from_secs(defaults::COMPLETION_TIMEOUT_SECS),
            max_item_attempts: defaults::MAX_ITEM_ATTEMPTS,
            sweep_interval: Duration::from_millis(defaults::SWEEP_INTERVAL_MS),
            stats_interval: Duration::from_secs(defaults::STATS_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(defaults::SHUTDOWN_TIMEOUT_SECS),
            emit_incomplete: defaults::EMIT_INCOMPLETE,
        }
    }
}

impl From<&CrawlerConfig> for SchedulerConfig {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            fetch_timeout: Duration::from_secs(config.http.timeout_secs),
            completion_timeout: Duration::from_secs(config.completion_timeout_secs),
            max_item_attempts: config.max_item_attempts,
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            stats_interval: Duration::from_secs(config.stats_interval_secs),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            emit_incomplete: config.emit_incomplete,
        }
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler was already started; build a new one per run")]
    AlreadyStarted,

    #[error("Failed to flush emitted records: {0}")]
    Sink(#[from] EmitError),
}

/// State shared by the run loop and every fetch task
struct SchedulerCore {
    profile: Arc<SiteProfile>,
    transport: Arc<dyn Transport>,
    builder: TraversalBuilder,
    ledger: PendingLedger,
    reconciler: VariantReconciler,
    emitter: Emitter,
    stats: Arc<RunStats>,
    waiters: DashMap<FetchKey, Vec<FetchTarget>>,
    issued: DashSet<FetchKey>,
    config: SchedulerConfig,
}

pub struct StageScheduler {
    core: Arc<SchedulerCore>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
}

impl StageScheduler {
    pub fn new(
        profile: Arc<SiteProfile>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn RecordSink>,
        config: SchedulerConfig,
    ) -> Self {
        let core = SchedulerCore {
            builder: TraversalBuilder::new(Arc::clone(&profile)),
            ledger: PendingLedger::new(profile.required_stages()),
            reconciler: VariantReconciler::new(profile.size_rule().clone()),
            emitter: Emitter::new(sink),
            stats: Arc::new(RunStats::new()),
            waiters: DashMap::new(),
            issued: DashSet::new(),
            profile,
            transport,
            config,
        };
        Self {
            core: Arc::new(core),
            cancellation_token: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Cancelling stops issuing new fetches; in-flight ones get the
    /// shutdown grace period and pending items are flushed
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<RunStats> {
        Arc::clone(&self.core.stats)
    }

    /// Items currently waiting in the ledger
    #[must_use]
    pub fn pending_items(&self) -> usize {
        self.core.ledger.len()
    }

    /// Runs the crawl until the frontier drains or the token is cancelled
    ///
    /// # Errors
    /// [`SchedulerError::AlreadyStarted`] on a second call; sink flush errors.
    pub async fn run(&self) -> Result<RunReport, SchedulerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let core = &self.core;
        let config = &core.config;
        info!(
            "🚀 Starting crawl of '{}' with {} seed(s), max_in_flight={}",
            core.profile.id(),
            core.profile.seeds().len(),
            config.max_in_flight
        );

        let mut frontier: VecDeque<FetchTarget> = core.profile.seeds().iter().cloned().collect();
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        let mut in_flight: JoinSet<Vec<FetchTarget>> = JoinSet::new();

        let mut sweep = interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut progress = interval(config.stats_interval);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            self.dispatch(&mut frontier, &semaphore, &mut in_flight);

            if self.cancellation_token.is_cancelled() {
                break;
            }
            if in_flight.is_empty() && frontier.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next(), if !in_flight.is_empty() => match joined {
                    Some(Ok(successors)) => self.enqueue(successors, &mut frontier, &mut in_flight),
                    Some(Err(e)) => error!("Fetch task aborted: {e}"),
                    None => {}
                },
                _ = sweep.tick() => core.sweep(),
                _ = progress.tick() => {
                    core.stats.log_progress(frontier.len(), in_flight.len(), core.ledger.len());
                }
                () = self.cancellation_token.cancelled() => {}
            }
        }

        if self.cancellation_token.is_cancelled() {
            core.stats.mark_cancelled();
            warn!(
                "🛑 Crawl cancelled: {} queued target(s) discarded, waiting on {} in-flight fetch(es)",
                frontier.len(),
                in_flight.len()
            );
            let drained = timeout(config.shutdown_timeout, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("⏰ Shutdown grace period exceeded; aborting remaining fetches");
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
            }
        }

        core.flush_pending();
        core.emitter.finish()?;

        let report = core.stats.report(core.profile.id());
        report.log_summary();
        Ok(report)
    }

    /// Queues successors; resubmissions with a retry delay sleep in their own
    /// task and rejoin the frontier when it elapses
    fn enqueue(
        &self,
        successors: Vec<FetchTarget>,
        frontier: &mut VecDeque<FetchTarget>,
        in_flight: &mut JoinSet<Vec<FetchTarget>>,
    ) {
        for target in successors {
            let delay = if target.attempt > 0 {
                self.core.transport.retry_delay(target.attempt)
            } else {
                Duration::ZERO
            };
            if delay.is_zero() {
                frontier.push_back(target);
                continue;
            }
            debug!("⏳ Backing off {delay:?} before retrying {}", target.uri);
            let token = self.cancellation_token.clone();
            in_flight.spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(delay) => vec![target],
                    () = token.cancelled() => Vec::new(),
                }
            });
        }
    }

    fn dispatch(
        &self,
        frontier: &mut VecDeque<FetchTarget>,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut JoinSet<Vec<FetchTarget>>,
    ) {
        while !self.cancellation_token.is_cancelled() {
            let Some(target) = frontier.pop_front() else {
                break;
            };
            let fetch_key = target.fetch_key();

            if let Some(mut waiting) = self.core.waiters.get_mut(&fetch_key) {
                debug!("Coalescing {} {} into in-flight fetch {fetch_key}", target.stage, target.uri);
                waiting.push(target);
                RunStats::bump(&self.core.stats.fetches_coalesced);
                continue;
            }
            if target.attempt == 0 && self.core.issued.contains(&fetch_key) {
                debug!("Skipping {} {}; already fetched in this run", target.stage, target.uri);
                RunStats::bump(&self.core.stats.repeat_fetches_skipped);
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                frontier.push_front(target);
                break;
            };

            self.core.issued.insert(fetch_key);
            self.core.waiters.insert(fetch_key, Vec::new());
            in_flight.spawn(self.clone_for_task().execute(target, fetch_key, permit));
        }
    }

    fn clone_for_task(&self) -> Arc<SchedulerCore> {
        Arc::clone(&self.core)
    }
}

impl std::fmt::Debug for StageScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageScheduler")
            .field("site", &self.core.profile.id())
            .field("config", &self.core.config)
            .finish_non_exhaustive()
    }
}

impl SchedulerCore {
    /// Resolves one target and expands it plus every coalesced duplicate
    async fn execute(
        self: Arc<Self>,
        target: FetchTarget,
        fetch_key: FetchKey,
        permit: OwnedSemaphorePermit,
    ) -> Vec<FetchTarget> {
        self.stats.record_fetch(target.stage);
        debug!("➡️ {} {} ({})", target.method.as_str(), target.uri, target.stage);

        let fetch_timeout = self.config.fetch_timeout;
        let result = match timeout(fetch_timeout, self.transport.resolve(&target)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(fetch_timeout)),
        };
        drop(permit);

        let dependents = self
            .waiters
            .remove(&fetch_key)
            .map(|(_, waiting)| waiting)
            .unwrap_or_default();

        let mut successors = Vec::new();
        for waiting in std::iter::once(target).chain(dependents) {
            match &result {
                Ok(payload) => successors.extend(self.on_resolved(&waiting, payload.clone())),
                Err(e) => successors.extend(self.on_failed(waiting, e)),
            }
        }
        successors
    }

    fn on_resolved(&self, target: &FetchTarget, payload: Payload) -> Vec<FetchTarget> {
        let response = FetchResponse::new(target, payload);
        let expansion = self.builder.expand(&response);

        if expansion.dropped_targets > 0 {
            self.stats
                .dropped_targets
                .fetch_add(expansion.dropped_targets as u64, Ordering::Relaxed);
        }
        if let Some(pages) = expansion.planned_pages {
            debug!("📄 {} reports {pages} page(s)", target.uri);
        }

        match expansion.outcome {
            ExtractOutcome::NotFound => {
                RunStats::bump(&self.stats.not_found);
                return Vec::new();
            }
            ExtractOutcome::Malformed(reason) => {
                RunStats::bump(&self.stats.extraction_failures);
                warn!("⚠️ Could not extract {} ({}): {reason}", target.uri, target.stage);
                if let Some(key) = target.context.item_key() {
                    self.abandon(&key, &format!("{} payload malformed: {reason}", target.stage));
                }
                return Vec::new();
            }
            ExtractOutcome::Empty => {
                debug!("Empty {} result for {}", target.stage, target.uri);
                if target.stage == StageTag::FetchStock {
                    if let Some(key) = target.context.item_key() {
                        self.settle(&key, target.stage);
                    }
                }
                return Vec::new();
            }
            ExtractOutcome::Extracted => {}
        }

        match expansion.fragment {
            Some(fragment) => self.apply_fragment(fragment, expansion.targets),
            None => expansion.targets,
        }
    }

    fn apply_fragment(&self, keyed: KeyedFragment, successors: Vec<FetchTarget>) -> Vec<FetchTarget> {
        let KeyedFragment { key, fragment } = keyed;
        let stage = fragment.stage;

        let handle = match self.ledger.open(&key) {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Ignoring {stage} fragment: {e}");
                RunStats::bump(&self.stats.duplicate_fragments);
                return Vec::new();
            }
        };

        match self.ledger.merge(&key, fragment) {
            Ok(MergeOutcome::Applied { .. }) => {}
            Ok(MergeOutcome::Deferred) => {
                RunStats::bump(&self.stats.deferred_fragments);
                return successors;
            }
            Ok(MergeOutcome::Duplicate | MergeOutcome::Ignored) => {
                debug!("Redelivered {stage} fragment for {key} (heard from {:?})", handle.satisfied());
                RunStats::bump(&self.stats.duplicate_fragments);
                return Vec::new();
            }
            Err(e) => {
                debug!("Ignoring {stage} fragment: {e}");
                RunStats::bump(&self.stats.duplicate_fragments);
                return Vec::new();
            }
        }

        if stage == StageTag::FetchDetail && self.profile.requires_stock() {
            let has_stock_target = successors.iter().any(|t| t.stage == StageTag::FetchStock);
            if has_stock_target {
                if let Err(e) = self.ledger.register_expected(&key, StageTag::FetchStock) {
                    debug!("Could not register stock stage for {key}: {e}");
                }
            } else {
                self.abandon(&key, "detail payload produced no stock request");
                return successors;
            }
        }

        self.try_complete(&key);
        successors
    }

    /// A stage that answered with nothing to merge still counts as heard from
    fn settle(&self, key: &ItemKey, stage: StageTag) {
        match self.ledger.mark_satisfied(key, stage) {
            Ok(()) => self.try_complete(key),
            Err(e) => debug!("Ignoring empty {stage} result: {e}"),
        }
    }

    fn on_failed(&self, target: FetchTarget, error: &FetchError) -> Vec<FetchTarget> {
        let owner = target.context.item_key();

        if error.is_retryable() && target.attempt < self.transport.retry_budget() {
            if let Some(key) = &owner {
                match self.ledger.record_failure(key) {
                    Ok(failures) if failures >= self.config.max_item_attempts => {
                        self.abandon(key, &format!("{failures} failed fetches: {error}"));
                        return Vec::new();
                    }
                    Ok(_) => {}
                    Err(LedgerError::Retired(_)) => return Vec::new(),
                    Err(_) => {}
                }
            }
            RunStats::bump(&self.stats.retries);
            debug!("🔁 Retrying {} (attempt {}): {error}", target.uri, target.attempt + 1);
            return vec![target.retried()];
        }

        RunStats::bump(&self.stats.terminal_failures);
        warn!("❌ {} fetch failed for {}: {error}", target.stage, target.uri);
        if let Some(key) = owner {
            if self.ledger.contains(&key) {
                self.abandon(&key, &format!("{} fetch failed: {error}", target.stage));
            }
        }
        Vec::new()
    }

    fn try_complete(&self, key: &ItemKey) {
        if !self.ledger.is_complete(key) {
            return;
        }
        match self.ledger.take(key) {
            Ok(item) => self.release(item),
            Err(e) => debug!("Completed item already released: {e}"),
        }
    }

    fn release(&self, item: CompletedItem) {
        let CompletedItem { key, record, stock } = item;
        let record = self.finalize(record, stock.as_ref());
        self.emit(&key, record);
    }

    fn finalize(&self, record: CanonicalRecord, stock: Option<&StockFacts>) -> CanonicalRecord {
        let mut record = match stock {
            Some(facts) => {
                let (record, summary) = self.reconciler.reconcile(record, facts);
                self.stats
                    .unmatched_skus
                    .fetch_add(summary.unmatched as u64, Ordering::Relaxed);
                record
            }
            None => record,
        };
        if record.gender.is_none() {
            record.gender = self.profile.default_gender().map(str::to_string);
        }
        record
    }

    fn emit(&self, key: &ItemKey, record: CanonicalRecord) {
        let incomplete = record.is_incomplete();
        match self.emitter.emit(key, record) {
            Ok(()) => {
                RunStats::bump(&self.stats.emitted);
                if incomplete {
                    RunStats::bump(&self.stats.emitted_incomplete);
                }
            }
            Err(EmitError::AlreadyEmitted(_)) => RunStats::bump(&self.stats.duplicate_fragments),
            Err(e) => {
                RunStats::bump(&self.stats.sink_failures);
                error!("Failed to emit {key}: {e}");
            }
        }
    }

    /// Evicts an item whose branch cannot finish
    fn abandon(&self, key: &ItemKey, reason: &str) {
        match self.ledger.evict(key, reason) {
            Ok(evicted) => self.release_incomplete(evicted),
            Err(e) => debug!("Nothing to evict: {e}"),
        }
    }

    fn release_incomplete(&self, evicted: EvictedItem) {
        RunStats::bump(&self.stats.dropped_incomplete);
        let EvictedItem {
            key,
            record,
            stock,
            missing,
        } = evicted;

        let Some(record) = record.filter(|_| self.config.emit_incomplete) else {
            warn!("🗑️ Dropping {key}; never heard from {missing:?}");
            return;
        };
        warn!("Emitting {key} as incomplete; missing {missing:?}");
        let record = self.finalize(record, stock.as_ref());
        self.emit(&key, record);
    }

    fn sweep(&self) {
        let expired = self
            .ledger
            .expired(self.config.completion_timeout, self.config.max_item_attempts);
        for key in expired {
            self.abandon(&key, "timed out waiting for outstanding stages");
        }
    }

    /// Evicts whatever is still pending at the end of a run
    fn flush_pending(&self) {
        let keys = self.ledger.keys();
        if !keys.is_empty() {
            info!("Flushing {} pending item(s)", keys.len());
        }
        for key in keys {
            self.abandon(&key, "run ended before the item completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::emitter::MemorySink;
    use crate::crawling::stages::{Extraction, StageRule};
    use crate::crawling::transport::ScriptedTransport;
    use crate::domain::{RecordFields, Variant};

    fn detail_profile(uris: &[&str]) -> Arc<SiteProfile> {
        let seeds: Vec<FetchTarget> = uris
            .iter()
            .map(|u| FetchTarget::get(StageTag::FetchDetail, *u))
            .collect();
        let builder = seeds.into_iter().fold(SiteProfile::builder("shop"), |b, seed| b.seed(seed));
        Arc::new(
            builder
                .stage(
                    StageTag::FetchDetail,
                    StageRule::new(|r: &FetchResponse| {
                        let key = ItemKey::from_uri("shop", &r.uri);
                        Extraction::fields(
                            key,
                            RecordFields::new()
                                .with_retailer_sku(r.text().to_string())
                                .with_variant(Variant::new("M", "USD")),
                        )
                    }),
                )
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let transport = Arc::new(ScriptedTransport::new().with_get("https://shop.test/p/1", "A1"));
        let scheduler = StageScheduler::new(
            detail_profile(&["https://shop.test/p/1"]),
            transport,
            Arc::new(MemorySink::new()),
            SchedulerConfig::default(),
        );

        scheduler.run().await.unwrap();
        assert!(matches!(scheduler.run().await, Err(SchedulerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn in_flight_bound_is_respected() {
        let uris: Vec<String> = (0..8).map(|i| format!("https://shop.test/p/{i}")).collect();
        let transport = uris
            .iter()
            .fold(ScriptedTransport::new(), |t, u| t.with_get(u, "SKU"))
            .with_delay(Duration::from_millis(20));
        let transport = Arc::new(transport);
        let sink = Arc::new(MemorySink::new());
        let config = SchedulerConfig {
            max_in_flight: 2,
            ..SchedulerConfig::default()
        };
        let refs: Vec<&str> = uris.iter().map(String::as_str).collect();

        let scheduler = StageScheduler::new(detail_profile(&refs), transport.clone(), sink.clone(), config);
        let report = scheduler.run().await.unwrap();

        assert_eq!(report.emitted, 8);
        assert!(transport.peak_concurrency() <= 2);
        assert_eq!(sink.len(), 8);
    }

    #[test]
    fn config_maps_from_crawler_config() {
        let crawler = CrawlerConfig {
            max_in_flight: 3,
            emit_incomplete: false,
            ..CrawlerConfig::default()
        };
        let config = SchedulerConfig::from(&crawler);
        assert_eq!(config.max_in_flight, 3);
        assert!(!config.emit_incomplete);
    }
}
