//! Separately fetched stock facts
//!
//! Some sites publish availability on an inventory endpoint that is unrelated
//! to the product detail payload. Those facts are collected per item as a map
//! from the site's size label to "available" and later folded into the SKU
//! table by the variant reconciler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Availability facts keyed by size label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockFacts(BTreeMap<String, bool>);

impl StockFacts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records availability for a size label; a later fact for the same label wins
    pub fn insert(&mut self, size_label: impl Into<String>, available: bool) {
        self.0.insert(size_label.into(), available);
    }

    #[must_use]
    pub fn with(mut self, size_label: impl Into<String>, available: bool) -> Self {
        self.insert(size_label, available);
        self
    }

    #[must_use]
    pub fn available(&self, size_label: &str) -> Option<bool> {
        self.0.get(size_label).copied()
    }

    /// Folds another batch of facts into this one
    pub fn absorb(&mut self, other: &StockFacts) {
        for (label, available) in &other.0 {
            self.0.insert(label.clone(), *available);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(label, available)| (label.as_str(), *available))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for StockFacts {
    fn from_iter<T: IntoIterator<Item = (S, bool)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(label, available)| (label.into(), available)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_fact_wins() {
        let mut facts = StockFacts::new().with("M", true);
        facts.absorb(&StockFacts::new().with("M", false).with("L", true));

        assert_eq!(facts.available("M"), Some(false));
        assert_eq!(facts.available("L"), Some(true));
        assert_eq!(facts.available("XL"), None);
        assert_eq!(facts.len(), 2);
    }
}
