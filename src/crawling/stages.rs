//! # Stage Table & Traversal Graph Builder
//!
//! A site is described declaratively: a table from [`StageTag`] to a
//! [`StageRule`] (pluggable extractor + allowed successor stages + optional
//! pager). [`TraversalBuilder::expand`] turns one resolved fetch into the
//! successor targets and record fragment it implies. Rules are pure: no I/O
//! happens here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::pagination::{PageOrigin, PagePlan, PageSignal, Pager};
use super::reconciler::SizeRule;
use super::tasks::{FetchResponse, FetchTarget, StageTag};
use crate::domain::{ItemKey, RecordFields, StockFacts};

/// Stage table validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageTableError {
    #[error("Site '{0}' declares no seed targets")]
    NoSeeds(String),

    #[error("Seed target uses undeclared stage {0}")]
    UndeclaredSeedStage(StageTag),

    #[error("Stage {stage} lists undeclared successor {successor}")]
    MissingSuccessor { stage: StageTag, successor: StageTag },

    #[error("Every site must declare a fetch_detail stage")]
    MissingDetailStage,

    #[error("Stage {0} fans out to paginate but has no pager")]
    MissingPager(StageTag),

    #[error("Stage {0} has a pager but paginate is not a successor")]
    UnusedPager(StageTag),

    #[error("fetch_stock must be a successor of fetch_detail")]
    OrphanStockStage,
}

/// Payload of a record fragment
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum FragmentBody {
    /// Named record fields (detail stage)
    Fields(RecordFields),
    /// Availability facts keyed by size label (reconciliation stage)
    Stock(StockFacts),
}

/// Fragment contributed by one stage towards one item
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecordFragment {
    pub stage: StageTag,
    pub body: FragmentBody,
}

impl RecordFragment {
    /// Content hash used to recognise a re-delivered fragment
    #[must_use]
    pub fn fingerprint(&self) -> blake3::Hash {
        // serde_json 직렬화는 BTreeMap 기반이라 결정적이다
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes)
    }
}

/// A fragment addressed to a ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedFragment {
    pub key: ItemKey,
    pub fragment: RecordFragment,
}

/// Classification of an extractor's verdict on a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    /// Targets and/or a fragment were produced
    Extracted,
    /// Normal empty result (empty category, last page)
    Empty,
    /// Payload carries the site's "not found" marker; the branch is dropped
    NotFound,
    /// Payload could not be interpreted
    Malformed(String),
}

/// Raw extractor output, before the stage table is applied
#[derive(Debug, Clone)]
pub struct Extraction {
    pub outcome: ExtractOutcome,
    pub targets: Vec<FetchTarget>,
    pub fragment: Option<(ItemKey, FragmentBody)>,
    /// Total-size signal; honoured on the first listing page only
    pub page_signal: Option<PageSignal>,
}

impl Extraction {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            outcome: ExtractOutcome::Empty,
            targets: Vec::new(),
            fragment: None,
            page_signal: None,
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self {
            outcome: ExtractOutcome::NotFound,
            ..Self::empty()
        }
    }

    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            outcome: ExtractOutcome::Malformed(reason.into()),
            ..Self::empty()
        }
    }

    #[must_use]
    pub fn targets(targets: Vec<FetchTarget>) -> Self {
        Self::empty().with_targets(targets)
    }

    #[must_use]
    pub fn fields(key: ItemKey, fields: RecordFields) -> Self {
        Self::empty().with_fragment(key, FragmentBody::Fields(fields))
    }

    #[must_use]
    pub fn stock(key: ItemKey, facts: StockFacts) -> Self {
        Self::empty().with_fragment(key, FragmentBody::Stock(facts))
    }

    #[must_use]
    pub fn with_targets(mut self, targets: Vec<FetchTarget>) -> Self {
        if !targets.is_empty() {
            self.outcome = ExtractOutcome::Extracted;
        }
        self.targets.extend(targets);
        self
    }

    #[must_use]
    pub fn with_fragment(mut self, key: ItemKey, body: FragmentBody) -> Self {
        self.outcome = ExtractOutcome::Extracted;
        self.fragment = Some((key, body));
        self
    }

    #[must_use]
    pub fn with_page_signal(mut self, signal: PageSignal) -> Self {
        self.page_signal = Some(signal);
        self
    }
}

/// Pluggable per-site leaf extraction: response in, extraction out
pub trait Extractor: Send + Sync {
    fn extract(&self, response: &FetchResponse) -> Extraction;
}

impl<F> Extractor for F
where
    F: Fn(&FetchResponse) -> Extraction + Send + Sync,
{
    fn extract(&self, response: &FetchResponse) -> Extraction {
        self(response)
    }
}

/// Transition rule for one stage
#[derive(Clone)]
pub struct StageRule {
    extractor: Arc<dyn Extractor>,
    successors: BTreeSet<StageTag>,
    pager: Option<Arc<dyn Pager>>,
}

impl StageRule {
    pub fn new(extractor: impl Extractor + 'static) -> Self {
        Self {
            extractor: Arc::new(extractor),
            successors: BTreeSet::new(),
            pager: None,
        }
    }

    #[must_use]
    pub fn with_successors(mut self, successors: &[StageTag]) -> Self {
        self.successors.extend(successors.iter().copied());
        self
    }

    #[must_use]
    pub fn with_pager(mut self, pager: impl Pager + 'static) -> Self {
        self.pager = Some(Arc::new(pager));
        self
    }

    #[must_use]
    pub fn successors(&self) -> &BTreeSet<StageTag> {
        &self.successors
    }
}

impl std::fmt::Debug for StageRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRule")
            .field("successors", &self.successors)
            .field("pager", &self.pager.is_some())
            .finish_non_exhaustive()
    }
}

/// Validated site description
#[derive(Debug, Clone)]
pub struct SiteProfile {
    id: String,
    seeds: Vec<FetchTarget>,
    rules: BTreeMap<StageTag, StageRule>,
    page_origin: PageOrigin,
    size_rule: SizeRule,
    default_gender: Option<String>,
}

impl SiteProfile {
    #[must_use]
    pub fn builder(id: impl Into<String>) -> SiteProfileBuilder {
        SiteProfileBuilder {
            id: id.into(),
            seeds: Vec::new(),
            rules: BTreeMap::new(),
            page_origin: PageOrigin::default(),
            size_rule: SizeRule::default(),
            default_gender: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn seeds(&self) -> &[FetchTarget] {
        &self.seeds
    }

    #[must_use]
    pub fn rule(&self, stage: StageTag) -> Option<&StageRule> {
        self.rules.get(&stage)
    }

    #[must_use]
    pub fn declares(&self, stage: StageTag) -> bool {
        self.rules.contains_key(&stage)
    }

    /// Whether items need a reconciliation fetch before completing
    #[must_use]
    pub fn requires_stock(&self) -> bool {
        self.declares(StageTag::FetchStock)
    }

    /// Stages every item must hear from before it is complete
    #[must_use]
    pub fn required_stages(&self) -> BTreeSet<StageTag> {
        let mut required = BTreeSet::from([StageTag::FetchDetail]);
        if self.requires_stock() {
            required.insert(StageTag::FetchStock);
        }
        required
    }

    #[must_use]
    pub const fn page_origin(&self) -> PageOrigin {
        self.page_origin
    }

    #[must_use]
    pub fn size_rule(&self) -> &SizeRule {
        &self.size_rule
    }

    /// Gender applied when the detail payload does not provide one
    #[must_use]
    pub fn default_gender(&self) -> Option<&str> {
        self.default_gender.as_deref()
    }
}

pub struct SiteProfileBuilder {
    id: String,
    seeds: Vec<FetchTarget>,
    rules: BTreeMap<StageTag, StageRule>,
    page_origin: PageOrigin,
    size_rule: SizeRule,
    default_gender: Option<String>,
}

impl SiteProfileBuilder {
    #[must_use]
    pub fn seed(mut self, target: FetchTarget) -> Self {
        self.seeds.push(target);
        self
    }

    #[must_use]
    pub fn stage(mut self, tag: StageTag, rule: StageRule) -> Self {
        self.rules.insert(tag, rule);
        self
    }

    #[must_use]
    pub fn page_origin(mut self, origin: PageOrigin) -> Self {
        self.page_origin = origin;
        self
    }

    #[must_use]
    pub fn size_rule(mut self, rule: SizeRule) -> Self {
        self.size_rule = rule;
        self
    }

    #[must_use]
    pub fn default_gender(mut self, gender: impl Into<String>) -> Self {
        self.default_gender = Some(gender.into());
        self
    }

    /// Validates the stage graph
    ///
    /// # Errors
    /// Returns [`StageTableError`] when the table is not a well-formed graph.
    pub fn build(self) -> Result<SiteProfile, StageTableError> {
        if self.seeds.is_empty() {
            return Err(StageTableError::NoSeeds(self.id));
        }
        if let Some(seed) = self.seeds.iter().find(|s| !self.rules.contains_key(&s.stage)) {
            return Err(StageTableError::UndeclaredSeedStage(seed.stage));
        }
        if !self.rules.contains_key(&StageTag::FetchDetail) {
            return Err(StageTableError::MissingDetailStage);
        }
        for (stage, rule) in &self.rules {
            if let Some(successor) = rule.successors.iter().find(|s| !self.rules.contains_key(s)) {
                return Err(StageTableError::MissingSuccessor {
                    stage: *stage,
                    successor: *successor,
                });
            }
            let fans_out = *stage != StageTag::Paginate
                && rule.successors.contains(&StageTag::Paginate);
            match (fans_out, rule.pager.is_some()) {
                (true, false) => return Err(StageTableError::MissingPager(*stage)),
                (false, true) => return Err(StageTableError::UnusedPager(*stage)),
                _ => {}
            }
        }
        let stock_reachable = self
            .rules
            .get(&StageTag::FetchDetail)
            .is_some_and(|detail| detail.successors.contains(&StageTag::FetchStock));
        if self.rules.contains_key(&StageTag::FetchStock) && !stock_reachable {
            return Err(StageTableError::OrphanStockStage);
        }

        Ok(SiteProfile {
            id: self.id,
            seeds: self.seeds,
            rules: self.rules,
            page_origin: self.page_origin,
            size_rule: self.size_rule,
            default_gender: self.default_gender,
        })
    }
}

/// Result of expanding one resolved fetch
#[derive(Debug, Clone)]
pub struct Expansion {
    pub outcome: ExtractOutcome,
    pub targets: Vec<FetchTarget>,
    pub fragment: Option<KeyedFragment>,
    /// Targets an extractor produced for stages this stage may not reach
    pub dropped_targets: usize,
    /// Total pages derived from the first listing page, if any
    pub planned_pages: Option<u32>,
}

impl Expansion {
    fn terminal(outcome: ExtractOutcome) -> Self {
        Self {
            outcome,
            targets: Vec::new(),
            fragment: None,
            dropped_targets: 0,
            planned_pages: None,
        }
    }
}

/// Applies a site's stage table to resolved fetches
#[derive(Debug, Clone)]
pub struct TraversalBuilder {
    profile: Arc<SiteProfile>,
}

impl TraversalBuilder {
    #[must_use]
    pub fn new(profile: Arc<SiteProfile>) -> Self {
        Self { profile }
    }

    #[must_use]
    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    /// Expands one resolved fetch into successor targets and an optional fragment
    #[must_use]
    pub fn expand(&self, response: &FetchResponse) -> Expansion {
        let stage = response.stage;
        let Some(rule) = self.profile.rule(stage) else {
            return Expansion::terminal(ExtractOutcome::Malformed(format!(
                "stage {stage} is not declared for site {}",
                self.profile.id()
            )));
        };

        let extraction = rule.extractor.extract(response);
        match extraction.outcome {
            ExtractOutcome::NotFound => {
                debug!("Not-found marker at {} ({stage}); branch dropped", response.uri);
                return Expansion::terminal(ExtractOutcome::NotFound);
            }
            ExtractOutcome::Malformed(reason) => {
                return Expansion::terminal(ExtractOutcome::Malformed(reason));
            }
            ExtractOutcome::Extracted | ExtractOutcome::Empty => {}
        }

        let fragment = match extraction.fragment {
            Some((key, body)) => match Self::check_fragment(stage, &body) {
                Ok(()) => Some(KeyedFragment {
                    key,
                    fragment: RecordFragment { stage, body },
                }),
                Err(reason) => return Expansion::terminal(ExtractOutcome::Malformed(reason)),
            },
            None => None,
        };

        let produced = extraction.targets.len();
        let mut targets: Vec<FetchTarget> = extraction
            .targets
            .into_iter()
            .filter(|target| rule.successors.contains(&target.stage))
            .map(|target| match (&fragment, target.stage) {
                // 재고 조회는 항상 소유 아이템 키를 들고 간다
                (Some(owner), StageTag::FetchStock) if target.context.item_key().is_none() => {
                    let context = target.context.with_item_key(&owner.key);
                    target.with_context(context)
                }
                _ => target,
            })
            .collect();
        let dropped_targets = produced - targets.len();
        if dropped_targets > 0 {
            warn!(
                "⚠️ {dropped_targets} target(s) from {stage} point at undeclared successors; dropped"
            );
        }

        let mut planned_pages = None;
        if stage == StageTag::ListPage {
            if let (Some(signal), Some(pager)) = (extraction.page_signal, &rule.pager) {
                let plan = PagePlan::new(self.profile.page_origin(), signal);
                planned_pages = Some(plan.total_pages());
                targets.extend(plan.follow_up_pages().map(|page| {
                    let target = pager.page_target(response, page).as_stage(StageTag::Paginate);
                    let context = target.context.with_page(page);
                    target.with_context(context)
                }));
            }
        }

        let outcome = if targets.is_empty() && fragment.is_none() {
            ExtractOutcome::Empty
        } else {
            ExtractOutcome::Extracted
        };

        Expansion {
            outcome,
            targets,
            fragment,
            dropped_targets,
            planned_pages,
        }
    }

    fn check_fragment(stage: StageTag, body: &FragmentBody) -> Result<(), String> {
        match (stage, body) {
            (StageTag::FetchDetail, FragmentBody::Fields(fields)) if fields.sku_count() == 0 => {
                Err("detail fragment carries no SKUs".to_string())
            }
            (StageTag::FetchDetail, FragmentBody::Fields(_))
            | (StageTag::FetchStock, FragmentBody::Stock(_)) => Ok(()),
            (stage, FragmentBody::Stock(_)) => {
                Err(format!("stock facts are only accepted from fetch_stock, got {stage}"))
            }
            (stage, FragmentBody::Fields(_)) => {
                Err(format!("record fields are not accepted from {stage}"))
            }
        }
    }
}
