//! # Run Statistics
//!
//! Lock-free counters shared by every in-flight fetch task, plus the
//! serializable report produced at the end of a run.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::tasks::StageTag;

/// Real-time crawl counters
#[derive(Debug)]
pub struct RunStats {
    run_id: Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    fetches_by_stage: [AtomicU64; 5],
    pub fetches_coalesced: AtomicU64,
    pub repeat_fetches_skipped: AtomicU64,
    pub retries: AtomicU64,
    pub terminal_failures: AtomicU64,
    pub not_found: AtomicU64,
    pub extraction_failures: AtomicU64,
    pub dropped_targets: AtomicU64,
    pub duplicate_fragments: AtomicU64,
    pub deferred_fragments: AtomicU64,
    pub unmatched_skus: AtomicU64,
    pub emitted: AtomicU64,
    pub emitted_incomplete: AtomicU64,
    pub dropped_incomplete: AtomicU64,
    pub sink_failures: AtomicU64,
    cancelled: AtomicBool,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_index(stage: StageTag) -> usize {
    StageTag::ALL
        .iter()
        .position(|s| *s == stage)
        .unwrap_or_default()
}

impl RunStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: chrono::Utc::now(),
            started: Instant::now(),
            fetches_by_stage: Default::default(),
            fetches_coalesced: AtomicU64::new(0),
            repeat_fetches_skipped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            extraction_failures: AtomicU64::new(0),
            dropped_targets: AtomicU64::new(0),
            duplicate_fragments: AtomicU64::new(0),
            deferred_fragments: AtomicU64::new(0),
            unmatched_skus: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            emitted_incomplete: AtomicU64::new(0),
            dropped_incomplete: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Bumps a counter by one
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, stage: StageTag) {
        Self::bump(&self.fetches_by_stage[stage_index(stage)]);
    }

    #[must_use]
    pub fn fetches(&self, stage: StageTag) -> u64 {
        self.fetches_by_stage[stage_index(stage)].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_fetches(&self) -> u64 {
        StageTag::ALL.iter().map(|s| self.fetches(*s)).sum()
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fetches per second since the run started
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fetch_rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.total_fetches() as f64 / secs
        } else {
            0.0
        }
    }

    pub fn log_progress(&self, frontier: usize, in_flight: usize, pending_items: usize) {
        info!(
            "📊 Progress: fetches={} ({:.1}/s), in_flight={}, frontier={}, pending_items={}, emitted={}",
            self.total_fetches(),
            self.fetch_rate(),
            in_flight,
            frontier,
            pending_items,
            self.emitted.load(Ordering::Relaxed),
        );
    }

    /// Snapshot for reporting
    #[must_use]
    pub fn report(&self, site: &str) -> RunReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RunReport {
            run_id: self.run_id,
            site: site.to_string(),
            started_at: self.started_at,
            finished_at: chrono::Utc::now(),
            duration_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            fetches_by_stage: StageTag::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), self.fetches(*s)))
                .filter(|(_, n)| *n > 0)
                .collect(),
            total_fetches: self.total_fetches(),
            fetches_coalesced: load(&self.fetches_coalesced),
            repeat_fetches_skipped: load(&self.repeat_fetches_skipped),
            retries: load(&self.retries),
            terminal_failures: load(&self.terminal_failures),
            not_found: load(&self.not_found),
            extraction_failures: load(&self.extraction_failures),
            dropped_targets: load(&self.dropped_targets),
            duplicate_fragments: load(&self.duplicate_fragments),
            deferred_fragments: load(&self.deferred_fragments),
            unmatched_skus: load(&self.unmatched_skus),
            emitted: load(&self.emitted),
            emitted_incomplete: load(&self.emitted_incomplete),
            dropped_incomplete: load(&self.dropped_incomplete),
            sink_failures: load(&self.sink_failures),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// End-of-run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub site: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub fetches_by_stage: BTreeMap<String, u64>,
    pub total_fetches: u64,
    pub fetches_coalesced: u64,
    /// First-attempt submissions of a fetch already issued this run
    pub repeat_fetches_skipped: u64,
    pub retries: u64,
    pub terminal_failures: u64,
    pub not_found: u64,
    pub extraction_failures: u64,
    pub dropped_targets: u64,
    pub duplicate_fragments: u64,
    pub deferred_fragments: u64,
    pub unmatched_skus: u64,
    /// Records released to the sink, incomplete ones included
    pub emitted: u64,
    pub emitted_incomplete: u64,
    /// Items that left the ledger without completing
    pub dropped_incomplete: u64,
    /// Records the sink refused; they are not counted as emitted
    pub sink_failures: u64,
    pub cancelled: bool,
}

impl RunReport {
    /// Fetches issued for one stage
    #[must_use]
    pub fn fetches(&self, stage: StageTag) -> u64 {
        self.fetches_by_stage.get(stage.as_str()).copied().unwrap_or(0)
    }

    pub fn log_summary(&self) {
        info!(
            "✅ Crawl of '{}' finished in {}ms (run {})",
            self.site, self.duration_ms, self.run_id
        );
        info!(
            "   fetches={} (coalesced={}, skipped_repeats={}, retries={}, terminal_failures={})",
            self.total_fetches,
            self.fetches_coalesced,
            self.repeat_fetches_skipped,
            self.retries,
            self.terminal_failures
        );
        info!(
            "   emitted={} (incomplete={}), dropped_incomplete={}, not_found={}",
            self.emitted, self.emitted_incomplete, self.dropped_incomplete, self.not_found
        );
        if self.sink_failures > 0 {
            warn!("   {} record(s) were refused by the sink", self.sink_failures);
        }
        if self.cancelled {
            info!("   run was cancelled before the frontier drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_stage_fetch_counts() {
        let stats = RunStats::new();
        stats.record_fetch(StageTag::ListPage);
        stats.record_fetch(StageTag::Paginate);
        stats.record_fetch(StageTag::Paginate);
        RunStats::bump(&stats.emitted);

        let report = stats.report("shop");
        assert_eq!(report.fetches(StageTag::Paginate), 2);
        assert_eq!(report.fetches(StageTag::FetchStock), 0);
        assert_eq!(report.total_fetches, 3);
        assert_eq!(report.emitted, 1);
        assert!(!report.fetches_by_stage.contains_key("fetch_stock"));
    }

    #[test]
    fn report_serializes_to_json() {
        let stats = RunStats::new();
        stats.mark_cancelled();
        let json = serde_json::to_value(stats.report("shop")).unwrap();
        assert_eq!(json["site"], "shop");
        assert_eq!(json["cancelled"], true);
        assert_eq!(json["run_id"], stats.run_id().to_string());
    }
}
