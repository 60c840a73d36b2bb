//! Variant reconciliation.
//!
//! Folds separately fetched stock facts into the SKU table fixed by the
//! detail stage. Only `out_of_stock` is ever written; keys are never added
//! or removed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{CanonicalRecord, StockFacts};

/// How size labels from a stock endpoint are matched against variant sizes
#[derive(Clone, Default)]
pub enum SizeRule {
    /// Labels must be byte-equal
    #[default]
    Exact,
    /// Both sides pass through the normalizer before comparison
    Normalized(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl SizeRule {
    /// Trimmed, case-insensitive comparison
    #[must_use]
    pub fn case_insensitive() -> Self {
        Self::Normalized(Arc::new(|label: &str| label.trim().to_lowercase()))
    }

    #[must_use]
    pub fn normalize(&self, label: &str) -> String {
        match self {
            Self::Exact => label.to_string(),
            Self::Normalized(normalizer) => normalizer(label),
        }
    }
}

impl fmt::Debug for SizeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => f.write_str("Exact"),
            Self::Normalized(_) => f.write_str("Normalized(..)"),
        }
    }
}

/// What a reconciliation pass touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub matched: usize,
    /// SKUs with no stock fact; their `out_of_stock` is left unchanged
    pub unmatched: usize,
    /// Stock labels that matched no SKU
    pub unused_labels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VariantReconciler {
    size_rule: SizeRule,
}

impl VariantReconciler {
    #[must_use]
    pub fn new(size_rule: SizeRule) -> Self {
        Self { size_rule }
    }

    /// Sets `out_of_stock = !available` on every SKU whose size has a fact
    pub fn reconcile(
        &self,
        mut record: CanonicalRecord,
        facts: &StockFacts,
    ) -> (CanonicalRecord, ReconcileSummary) {
        let by_label: BTreeMap<String, (&str, bool)> = facts
            .iter()
            .map(|(label, available)| (self.size_rule.normalize(label), (label, available)))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut used = BTreeSet::new();

        for variant in record.skus.values_mut() {
            let label = self.size_rule.normalize(&variant.size);
            match by_label.get(&label) {
                Some((raw, available)) => {
                    variant.out_of_stock = Some(!available);
                    used.insert(*raw);
                    summary.matched += 1;
                }
                None => summary.unmatched += 1,
            }
        }

        summary.unused_labels = facts
            .iter()
            .map(|(label, _)| label)
            .filter(|label| !used.contains(label))
            .map(str::to_string)
            .collect();

        if summary.unmatched > 0 || !summary.unused_labels.is_empty() {
            debug!(
                "Partial reconciliation for {}: matched={}, unmatched={}, unused={:?}",
                record.retailer_sku, summary.matched, summary.unmatched, summary.unused_labels
            );
        }

        (record, summary)
    }
}
