//! # Crawling Pipeline
//!
//! Multi-stage crawl-and-assemble core
//! - 명시적 모듈 구조 (mod.rs 비사용)
//! - 사이트별 추출 로직은 `sites`에, 전송은 `Transport` 구현체에 위임
//! - 스케줄러만 I/O를 구동하고 나머지는 순수 로직

use std::sync::Arc;

pub mod emitter;
pub mod ledger;
pub mod orchestrator;
pub mod pagination;
pub mod reconciler;
pub mod stages;
pub mod state;
pub mod tasks;
pub mod transport;

pub use emitter::{EmitError, Emitter, JsonLinesSink, MemorySink, RecordSink};
pub use ledger::{
    CompletedItem, EvictedItem, LedgerError, MergeOutcome, PendingHandle, PendingLedger,
};
pub use orchestrator::{SchedulerConfig, SchedulerError, StageScheduler};
pub use pagination::{PageOrigin, PagePlan, PageSignal, Pager};
pub use reconciler::{ReconcileSummary, SizeRule, VariantReconciler};
pub use stages::{
    Expansion, ExtractOutcome, Extraction, Extractor, FragmentBody, KeyedFragment, RecordFragment,
    SiteProfile, SiteProfileBuilder, StageRule, StageTableError, TraversalBuilder,
};
pub use state::{RunReport, RunStats};
pub use tasks::{FetchContext, FetchKey, FetchMethod, FetchResponse, FetchTarget, Payload, StageTag};
pub use transport::{FetchError, ScriptedTransport, Transport};

/// Runs one crawl of `profile` to completion
///
/// # Errors
/// Propagates [`SchedulerError`] from the run.
pub async fn crawl(
    profile: Arc<SiteProfile>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn RecordSink>,
    config: SchedulerConfig,
) -> Result<RunReport, SchedulerError> {
    StageScheduler::new(profile, transport, sink, config).run().await
}
