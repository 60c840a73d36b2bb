//! # Pending-Item Ledger
//!
//! Partially assembled records keyed by [`ItemKey`]. Each entry tracks which
//! stages are expected and which have contributed; an entry is complete once
//! every expected stage is satisfied, and completion never reverts.
//!
//! Entries live in a `DashMap` so concurrent fetch completions for different
//! items never contend; one item's entry is guarded by its own mutex.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tracing::{debug, trace};

use super::stages::{FragmentBody, RecordFragment};
use super::tasks::StageTag;
use crate::domain::{CanonicalRecord, IncompleteMarker, ItemKey, PartialRecord, StockFacts};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Item {0} was already emitted or evicted")]
    Retired(ItemKey),

    #[error("Item {0} is not open")]
    UnknownKey(ItemKey),

    #[error("Item {key} is incomplete; waiting on {missing:?}")]
    Incomplete { key: ItemKey, missing: Vec<StageTag> },
}

/// How a merge was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Fragment applied; `replayed` deferred fragments were applied after it
    Applied { fields_filled: usize, replayed: usize },
    /// Same fragment already applied or deferred
    Duplicate,
    /// Stock fragment arrived before the detail fragment; held back
    Deferred,
    /// Entry already complete; fragment discarded
    Ignored,
}

#[derive(Debug)]
struct PendingEntry {
    record: PartialRecord,
    expected: BTreeSet<StageTag>,
    satisfied: BTreeSet<StageTag>,
    stock: Option<StockFacts>,
    deferred: Vec<(blake3::Hash, RecordFragment)>,
    applied: HashSet<blake3::Hash>,
    opened_at: Instant,
    failures: u32,
    complete: bool,
}

impl PendingEntry {
    fn new(required: &BTreeSet<StageTag>) -> Self {
        Self {
            record: PartialRecord::new(),
            expected: required.clone(),
            satisfied: BTreeSet::new(),
            stock: None,
            deferred: Vec::new(),
            applied: HashSet::new(),
            opened_at: Instant::now(),
            failures: 0,
            complete: false,
        }
    }

    fn missing(&self) -> Vec<StageTag> {
        self.expected.difference(&self.satisfied).copied().collect()
    }

    /// Latches completion; once set it stays set
    fn check_complete(&mut self) -> bool {
        if !self.complete && self.expected.is_subset(&self.satisfied) {
            self.complete = true;
        }
        self.complete
    }

    fn apply(&mut self, fingerprint: blake3::Hash, fragment: RecordFragment) -> usize {
        self.applied.insert(fingerprint);
        self.satisfied.insert(fragment.stage);
        match fragment.body {
            FragmentBody::Fields(fields) => self.record.absorb(fields),
            FragmentBody::Stock(facts) => {
                let count = facts.len();
                self.stock.get_or_insert_with(StockFacts::new).absorb(&facts);
                count
            }
        }
    }
}

fn lock(entry: &Mutex<PendingEntry>) -> MutexGuard<'_, PendingEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read access to an open entry
#[derive(Debug, Clone)]
pub struct PendingHandle {
    key: ItemKey,
    fresh: bool,
    entry: Arc<Mutex<PendingEntry>>,
}

impl PendingHandle {
    #[must_use]
    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    /// `true` when this call created the entry
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Copy of the record accumulated so far
    #[must_use]
    pub fn snapshot(&self) -> PartialRecord {
        lock(&self.entry).record.clone()
    }

    #[must_use]
    pub fn satisfied(&self) -> BTreeSet<StageTag> {
        lock(&self.entry).satisfied.clone()
    }
}

/// A complete item removed from the ledger
#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub key: ItemKey,
    pub record: CanonicalRecord,
    pub stock: Option<StockFacts>,
}

/// An incomplete item forced out of the ledger
#[derive(Debug, Clone)]
pub struct EvictedItem {
    pub key: ItemKey,
    /// Present once the detail stage contributed; carries an incomplete marker
    pub record: Option<CanonicalRecord>,
    pub stock: Option<StockFacts>,
    pub missing: Vec<StageTag>,
}

#[derive(Debug)]
pub struct PendingLedger {
    entries: DashMap<ItemKey, Arc<Mutex<PendingEntry>>>,
    retired: DashSet<ItemKey>,
    required: BTreeSet<StageTag>,
}

impl PendingLedger {
    /// `required` is the stage set every entry starts out expecting
    #[must_use]
    pub fn new(required: BTreeSet<StageTag>) -> Self {
        Self {
            entries: DashMap::new(),
            retired: DashSet::new(),
            required,
        }
    }

    /// Opens an entry, or returns the existing one
    ///
    /// # Errors
    /// [`LedgerError::Retired`] when the key was already taken or evicted.
    pub fn open(&self, key: &ItemKey) -> Result<PendingHandle, LedgerError> {
        // retired 검사는 샤드 락을 잡은 상태에서 해야 take()와 경합하지 않는다
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Ok(PendingHandle {
                key: key.clone(),
                fresh: false,
                entry: Arc::clone(occupied.get()),
            }),
            Entry::Vacant(vacant) => {
                if self.retired.contains(key) {
                    return Err(LedgerError::Retired(key.clone()));
                }
                let entry = Arc::new(Mutex::new(PendingEntry::new(&self.required)));
                vacant.insert(Arc::clone(&entry));
                trace!("Opened ledger entry {key}");
                Ok(PendingHandle {
                    key: key.clone(),
                    fresh: true,
                    entry,
                })
            }
        }
    }

    fn entry(&self, key: &ItemKey) -> Result<Arc<Mutex<PendingEntry>>, LedgerError> {
        match self.entries.get(key) {
            Some(entry) => Ok(Arc::clone(entry.value())),
            None if self.retired.contains(key) => Err(LedgerError::Retired(key.clone())),
            None => Err(LedgerError::UnknownKey(key.clone())),
        }
    }

    /// Applies a fragment under the first-writer-wins field policy
    ///
    /// Stock fragments arriving before the detail fragment are deferred and
    /// replayed as soon as the detail fragment lands.
    ///
    /// # Errors
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`] when the key is not open.
    pub fn merge(&self, key: &ItemKey, fragment: RecordFragment) -> Result<MergeOutcome, LedgerError> {
        let entry = self.entry(key)?;
        let mut entry = lock(&entry);

        if entry.complete {
            return Ok(MergeOutcome::Ignored);
        }

        let fingerprint = fragment.fingerprint();
        if entry.applied.contains(&fingerprint)
            || entry.deferred.iter().any(|(fp, _)| *fp == fingerprint)
        {
            return Ok(MergeOutcome::Duplicate);
        }

        let is_stock = matches!(fragment.body, FragmentBody::Stock(_));
        if is_stock && !entry.satisfied.contains(&StageTag::FetchDetail) {
            debug!("Deferring {} fragment for {key} until detail arrives", fragment.stage);
            entry.deferred.push((fingerprint, fragment));
            return Ok(MergeOutcome::Deferred);
        }

        let fields_filled = entry.apply(fingerprint, fragment);

        let mut replayed = 0;
        if entry.satisfied.contains(&StageTag::FetchDetail) && !entry.deferred.is_empty() {
            for (fp, deferred) in std::mem::take(&mut entry.deferred) {
                entry.apply(fp, deferred);
                replayed += 1;
            }
        }

        Ok(MergeOutcome::Applied {
            fields_filled,
            replayed,
        })
    }

    /// Declares one more stage the item must hear from. No effect once complete.
    ///
    /// # Errors
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`] when the key is not open.
    pub fn register_expected(&self, key: &ItemKey, stage: StageTag) -> Result<(), LedgerError> {
        let entry = self.entry(key)?;
        let mut entry = lock(&entry);
        if !entry.complete {
            entry.expected.insert(stage);
        }
        Ok(())
    }

    /// # Errors
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`] when the key is not open.
    pub fn mark_satisfied(&self, key: &ItemKey, stage: StageTag) -> Result<(), LedgerError> {
        let entry = self.entry(key)?;
        lock(&entry).satisfied.insert(stage);
        Ok(())
    }

    /// `true` once every expected stage has contributed
    #[must_use]
    pub fn is_complete(&self, key: &ItemKey) -> bool {
        self.entry(key).is_ok_and(|entry| lock(&entry).check_complete())
    }

    /// Expected stages that have not contributed yet
    #[must_use]
    pub fn missing(&self, key: &ItemKey) -> Vec<StageTag> {
        self.entry(key).map(|entry| lock(&entry).missing()).unwrap_or_default()
    }

    /// Removes and returns a complete item; the key is retired
    ///
    /// # Errors
    /// [`LedgerError::Incomplete`] when stages are outstanding, otherwise
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`].
    pub fn take(&self, key: &ItemKey) -> Result<CompletedItem, LedgerError> {
        let removed = self.entries.remove_if(key, |k, entry| {
            let done = lock(entry).check_complete();
            if done {
                self.retired.insert(k.clone());
            }
            done
        });

        match removed {
            Some((key, entry)) => {
                let entry = lock(&entry);
                Ok(CompletedItem {
                    key,
                    record: entry.record.clone().into_canonical(),
                    stock: entry.stock.clone(),
                })
            }
            None => {
                let entry = self.entry(key)?;
                let missing = lock(&entry).missing();
                Err(LedgerError::Incomplete {
                    key: key.clone(),
                    missing,
                })
            }
        }
    }

    /// Counts a failed fetch against the item; returns the new total
    ///
    /// # Errors
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`] when the key is not open.
    pub fn record_failure(&self, key: &ItemKey) -> Result<u32, LedgerError> {
        let entry = self.entry(key)?;
        let mut entry = lock(&entry);
        entry.failures += 1;
        Ok(entry.failures)
    }

    /// Forces an entry out regardless of completeness; the key is retired
    ///
    /// The record is returned only when the detail stage contributed, marked
    /// incomplete with the stages that never arrived.
    ///
    /// # Errors
    /// [`LedgerError::UnknownKey`] / [`LedgerError::Retired`] when the key is not open.
    pub fn evict(&self, key: &ItemKey, reason: &str) -> Result<EvictedItem, LedgerError> {
        let removed = self.entries.remove_if(key, |k, _| {
            self.retired.insert(k.clone());
            true
        });
        let Some((key, entry)) = removed else {
            return Err(self.entry(key).err().unwrap_or_else(|| LedgerError::UnknownKey(key.clone())));
        };

        let entry = lock(&entry);
        let missing = entry.missing();
        let record = entry
            .satisfied
            .contains(&StageTag::FetchDetail)
            .then(|| {
                let mut record = entry.record.clone().into_canonical();
                record.incomplete = Some(IncompleteMarker {
                    missing_stages: missing.iter().map(|s| s.as_str().to_string()).collect(),
                    reason: reason.to_string(),
                });
                record
            });

        debug!("Evicted {key} (missing {missing:?}): {reason}");
        Ok(EvictedItem {
            key,
            record,
            stock: entry.stock.clone(),
            missing,
        })
    }

    /// Incomplete entries older than `timeout` or with at least
    /// `max_failures` recorded failures
    #[must_use]
    pub fn expired(&self, timeout: Duration, max_failures: u32) -> Vec<ItemKey> {
        self.entries
            .iter()
            .filter(|item| {
                let entry = lock(item.value());
                !entry.complete
                    && (entry.opened_at.elapsed() >= timeout || entry.failures >= max_failures)
            })
            .map(|item| item.key().clone())
            .collect()
    }

    /// Keys of every open entry
    #[must_use]
    pub fn keys(&self) -> Vec<ItemKey> {
        self.entries.iter().map(|item| item.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &ItemKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn is_retired(&self, key: &ItemKey) -> bool {
        self.retired.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordFields, SkuKey, Variant};

    fn key() -> ItemKey {
        ItemKey::from_sku("shop", "A1")
    }

    fn detail() -> RecordFragment {
        RecordFragment {
            stage: StageTag::FetchDetail,
            body: FragmentBody::Fields(
                RecordFields::new()
                    .with_retailer_sku("A1")
                    .with_name(Some("Tee".into()))
                    .with_variant(Variant::new("M", "USD").with_colour(Some("Red".into()))),
            ),
        }
    }

    fn stock() -> RecordFragment {
        RecordFragment {
            stage: StageTag::FetchStock,
            body: FragmentBody::Stock(StockFacts::new().with("M", false)),
        }
    }

    fn detail_only() -> PendingLedger {
        PendingLedger::new(BTreeSet::from([StageTag::FetchDetail]))
    }

    fn detail_and_stock() -> PendingLedger {
        PendingLedger::new(BTreeSet::from([StageTag::FetchDetail, StageTag::FetchStock]))
    }

    #[test]
    fn open_is_idempotent() {
        let ledger = detail_only();
        assert!(ledger.open(&key()).unwrap().is_fresh());
        ledger.merge(&key(), detail()).unwrap();

        let again = ledger.open(&key()).unwrap();
        assert!(!again.is_fresh());
        assert_eq!(again.snapshot().fields().name.as_deref(), Some("Tee"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn duplicate_fragment_is_not_applied_twice() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();

        assert!(matches!(ledger.merge(&key(), detail()).unwrap(), MergeOutcome::Applied { .. }));
        assert_eq!(ledger.merge(&key(), detail()).unwrap(), MergeOutcome::Duplicate);
    }

    #[test]
    fn stock_before_detail_is_deferred_then_replayed() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();

        assert_eq!(ledger.merge(&key(), stock()).unwrap(), MergeOutcome::Deferred);
        assert!(!ledger.is_complete(&key()));

        let outcome = ledger.merge(&key(), detail()).unwrap();
        assert!(matches!(outcome, MergeOutcome::Applied { replayed: 1, .. }));
        assert!(ledger.is_complete(&key()));

        let item = ledger.take(&key()).unwrap();
        assert_eq!(item.stock.unwrap().available("M"), Some(false));
        // stock 반영은 Reconciler 몫이라 take 시점에는 미확정
        assert_eq!(item.record.skus[&SkuKey::from("Red_M")].out_of_stock, None);
    }

    #[test]
    fn take_fails_while_incomplete() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail()).unwrap();

        let err = ledger.take(&key()).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Incomplete {
                key: key(),
                missing: vec![StageTag::FetchStock]
            }
        );
        assert!(ledger.contains(&key()));
    }

    #[test]
    fn completion_is_monotonic() {
        let ledger = detail_only();
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail()).unwrap();
        assert!(ledger.is_complete(&key()));

        ledger.register_expected(&key(), StageTag::FetchStock).unwrap();
        assert!(ledger.is_complete(&key()));
        assert_eq!(ledger.merge(&key(), stock()).unwrap(), MergeOutcome::Ignored);
    }

    #[test]
    fn mark_satisfied_completes_without_a_fragment() {
        let ledger = detail_and_stock();
        let handle = ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail()).unwrap();
        assert_eq!(ledger.missing(&key()), vec![StageTag::FetchStock]);

        ledger.mark_satisfied(&key(), StageTag::FetchStock).unwrap();
        assert!(ledger.is_complete(&key()));
        assert_eq!(
            handle.satisfied(),
            BTreeSet::from([StageTag::FetchDetail, StageTag::FetchStock])
        );

        // 완료 이후 새 스테이지가 기대되어도 되돌아가지 않는다
        ledger.register_expected(&key(), StageTag::Paginate).unwrap();
        assert!(ledger.is_complete(&key()));
        assert!(ledger.take(&key()).unwrap().stock.is_none());
    }

    #[test]
    fn mark_satisfied_on_retired_key_fails() {
        let ledger = detail_only();
        ledger.open(&key()).unwrap();
        ledger.evict(&key(), "timeout").unwrap();
        assert_eq!(
            ledger.mark_satisfied(&key(), StageTag::FetchStock).unwrap_err(),
            LedgerError::Retired(key())
        );
    }

    #[test]
    fn taken_keys_are_retired() {
        let ledger = detail_only();
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail()).unwrap();
        ledger.take(&key()).unwrap();

        assert!(ledger.is_retired(&key()));
        assert_eq!(ledger.open(&key()).unwrap_err(), LedgerError::Retired(key()));
        assert_eq!(ledger.take(&key()).unwrap_err(), LedgerError::Retired(key()));
        assert!(ledger.is_empty());
    }

    #[test]
    fn evicting_after_detail_keeps_partial_record() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail()).unwrap();

        let evicted = ledger.evict(&key(), "stock fetch failed").unwrap();
        let record = evicted.record.unwrap();
        let marker = record.incomplete.unwrap();
        assert_eq!(marker.missing_stages, vec!["fetch_stock".to_string()]);
        assert_eq!(record.retailer_sku, "A1");
        assert!(ledger.is_retired(&key()));
    }

    #[test]
    fn evicting_before_detail_has_no_record() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), stock()).unwrap();

        let evicted = ledger.evict(&key(), "timeout").unwrap();
        assert!(evicted.record.is_none());
        assert_eq!(evicted.missing, vec![StageTag::FetchDetail, StageTag::FetchStock]);
    }

    #[test]
    fn expired_honours_failure_budget_and_timeout() {
        let ledger = detail_and_stock();
        ledger.open(&key()).unwrap();
        assert!(ledger.expired(Duration::from_secs(60), 3).is_empty());

        for _ in 0..3 {
            ledger.record_failure(&key()).unwrap();
        }
        assert_eq!(ledger.expired(Duration::from_secs(60), 3), vec![key()]);
        assert_eq!(ledger.expired(Duration::ZERO, 10), vec![key()]);
    }

    #[test]
    fn merge_into_unopened_key_fails() {
        let ledger = detail_only();
        assert_eq!(
            ledger.merge(&key(), detail()).unwrap_err(),
            LedgerError::UnknownKey(key())
        );
    }
}
