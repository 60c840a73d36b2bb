//! Property tests for ledger merging, reconciliation and single emission
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;

use catalog_crawler_lib::crawling::{
    Extraction, FetchResponse, FetchTarget, FragmentBody, LedgerError, MemorySink, PendingLedger,
    RecordFragment, SchedulerConfig, ScriptedTransport, SiteProfile, StageRule, StageTag,
    VariantReconciler, crawl,
};
use catalog_crawler_lib::domain::{
    CanonicalRecord, ItemKey, RecordFields, StockFacts, Variant,
};

const SIZES: [&str; 5] = ["XS", "S", "M", "L", "XL"];

fn size_subset() -> impl Strategy<Value = Vec<&'static str>> {
    prop::sample::subsequence(SIZES.to_vec(), 1..=SIZES.len())
}

fn stock_facts() -> impl Strategy<Value = BTreeMap<&'static str, bool>> {
    prop::collection::btree_map(prop::sample::select(SIZES.to_vec()), any::<bool>(), 0..=SIZES.len())
}

fn detail_fragment(name: &str, colour: &str, sizes: &[&str]) -> RecordFragment {
    let fields = sizes.iter().fold(
        RecordFields::new()
            .with_retailer_sku("P1")
            .with_name(Some(name.to_string())),
        |fields, size| fields.with_variant(Variant::new(*size, "USD").with_colour(Some(colour.to_string()))),
    );
    RecordFragment {
        stage: StageTag::FetchDetail,
        body: FragmentBody::Fields(fields),
    }
}

fn stock_fragment(facts: &BTreeMap<&str, bool>) -> RecordFragment {
    RecordFragment {
        stage: StageTag::FetchStock,
        body: FragmentBody::Stock(facts.iter().map(|(size, available)| (*size, *available)).collect()),
    }
}

#[derive(Debug, Clone)]
enum Delivery {
    Detail { name: String, sizes: Vec<&'static str> },
    Stock(BTreeMap<&'static str, bool>),
}

fn delivery() -> impl Strategy<Value = Delivery> {
    prop_oneof![
        ("[a-z]{1,6}", size_subset()).prop_map(|(name, sizes)| Delivery::Detail { name, sizes }),
        stock_facts().prop_map(Delivery::Stock),
    ]
}

fn fragment(delivery: &Delivery) -> RecordFragment {
    match delivery {
        Delivery::Detail { name, sizes } => detail_fragment(name, "Red", sizes),
        Delivery::Stock(facts) => stock_fragment(facts),
    }
}

fn ledger() -> PendingLedger {
    PendingLedger::new(BTreeSet::from([StageTag::FetchDetail, StageTag::FetchStock]))
}

fn key() -> ItemKey {
    ItemKey::from_sku("shop", "P1")
}

proptest! {
    #[test]
    fn redelivered_fragments_change_nothing(deliveries in prop::collection::vec(delivery(), 1..8)) {
        let once = ledger();
        let twice = ledger();
        once.open(&key()).unwrap();
        twice.open(&key()).unwrap();

        for d in &deliveries {
            once.merge(&key(), fragment(d)).unwrap();
            twice.merge(&key(), fragment(d)).unwrap();
            twice.merge(&key(), fragment(d)).unwrap();
        }

        prop_assert_eq!(once.open(&key()).unwrap().snapshot(), twice.open(&key()).unwrap().snapshot());
        prop_assert_eq!(once.missing(&key()), twice.missing(&key()));
        prop_assert_eq!(once.is_complete(&key()), twice.is_complete(&key()));
    }

    #[test]
    fn completion_never_regresses(deliveries in prop::collection::vec(delivery(), 1..8)) {
        let ledger = ledger();
        ledger.open(&key()).unwrap();

        let mut seen_complete = false;
        for d in &deliveries {
            ledger.merge(&key(), fragment(d)).unwrap();
            let complete = ledger.is_complete(&key());
            prop_assert!(complete || !seen_complete);
            seen_complete |= complete;
        }

        if seen_complete {
            ledger.take(&key()).unwrap();
            prop_assert!(matches!(ledger.open(&key()), Err(LedgerError::Retired(_))));
        }
    }

    #[test]
    fn reconciliation_keeps_the_sku_key_set(sizes in size_subset(), facts in stock_facts()) {
        let ledger = PendingLedger::new(BTreeSet::from([StageTag::FetchDetail]));
        ledger.open(&key()).unwrap();
        ledger.merge(&key(), detail_fragment("Tee", "Red", &sizes)).unwrap();
        let record: CanonicalRecord = ledger.take(&key()).unwrap().record;
        let before: Vec<_> = record.skus.keys().cloned().collect();

        let stock: StockFacts = facts.iter().map(|(s, a)| (*s, *a)).collect();
        let (after, summary) = VariantReconciler::default().reconcile(record, &stock);

        prop_assert_eq!(after.skus.keys().cloned().collect::<Vec<_>>(), before);
        prop_assert_eq!(summary.matched + summary.unmatched, sizes.len());
        for variant in after.skus.values() {
            match stock.available(&variant.size) {
                Some(available) => prop_assert_eq!(variant.out_of_stock, Some(!available)),
                None => prop_assert_eq!(variant.out_of_stock, None),
            }
        }
    }
}

fn listing_profile() -> Arc<SiteProfile> {
    let listing = |r: &FetchResponse| {
        let targets = r
            .text()
            .split(',')
            .filter(|id| !id.is_empty())
            .map(|id| FetchTarget::get(StageTag::FetchDetail, format!("https://shop.test/p/{id}")))
            .collect();
        Extraction::targets(targets)
    };
    let detail = |r: &FetchResponse| {
        let sku = r.text().to_string();
        Extraction::fields(
            ItemKey::from_sku("shop", &sku),
            RecordFields::new()
                .with_retailer_sku(sku)
                .with_variant(Variant::new("M", "USD")),
        )
    };
    Arc::new(
        SiteProfile::builder("shop")
            .seed(FetchTarget::get(StageTag::ListPage, "https://shop.test/list"))
            .stage(StageTag::ListPage, StageRule::new(listing).with_successors(&[StageTag::FetchDetail]))
            .stage(StageTag::FetchDetail, StageRule::new(detail))
            .build()
            .unwrap(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn each_item_is_emitted_exactly_once(ids in prop::collection::vec(0u8..6, 1..20)) {
        let listed: Vec<String> = ids.iter().map(|id| format!("p{id}")).collect();
        let distinct: BTreeSet<&String> = listed.iter().collect();

        let transport = distinct.iter().fold(
            ScriptedTransport::new().with_get("https://shop.test/list", &listed.join(",")),
            |t, id| t.with_get(&format!("https://shop.test/p/{id}"), id),
        );
        let sink = Arc::new(MemorySink::new());

        let report = tokio_test::block_on(crawl(
            listing_profile(),
            Arc::new(transport),
            sink.clone(),
            SchedulerConfig::default(),
        ))
        .unwrap();

        let emitted: Vec<String> = sink.records().into_iter().map(|r| r.retailer_sku).collect();
        let unique: BTreeSet<&String> = emitted.iter().collect();
        prop_assert_eq!(emitted.len(), distinct.len());
        prop_assert_eq!(unique.len(), distinct.len());
        prop_assert_eq!(report.emitted as usize, distinct.len());
    }
}
