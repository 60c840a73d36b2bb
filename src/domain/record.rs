//! # Product Record Model
//!
//! - `CanonicalRecord`: the finished, normalized product entity handed to sinks
//! - `RecordFields`: a fragment of named fields produced by one extraction
//! - `PartialRecord`: the in-progress accumulation of fragments owned by the ledger
//! - `SkuKey` / `Variant`: the per-variant table (`{colour}_{size}` keyed)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::constants::sku::{KEY_SEPARATOR, ONE_SIZE};

/// SKU table of one product, keyed by `SkuKey`
pub type SkuTable = BTreeMap<SkuKey, Variant>;

/// Key of one variant within a product
///
/// `{colour}_{size}`; a missing size becomes `One Size`. Products without a
/// colour are keyed `{size}_{currency}` instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkuKey(String);

impl SkuKey {
    #[must_use]
    pub fn new(colour: Option<&str>, size: Option<&str>, currency: &str) -> Self {
        let size = size.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(ONE_SIZE);
        match colour.map(str::trim).filter(|c| !c.is_empty()) {
            Some(colour) => Self(format!("{colour}{KEY_SEPARATOR}{size}")),
            None => Self(format!("{size}{KEY_SEPARATOR}{}", currency.trim())),
        }
    }

    /// Key for a variant, following the same colour/size rule
    #[must_use]
    pub fn for_variant(variant: &Variant) -> Self {
        Self::new(variant.colour.as_deref(), Some(&variant.size), &variant.currency)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SkuKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SkuKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// One purchasable variant (size × colour)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colour: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    pub currency: String,
    /// `None` until the detail payload or a stock reconciliation says otherwise
    #[serde(default)]
    pub out_of_stock: Option<bool>,
}

impl Variant {
    #[must_use]
    pub fn new(size: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            size: size.into(),
            colour: None,
            price: None,
            currency: currency.into(),
            out_of_stock: None,
        }
    }

    #[must_use]
    pub fn with_colour(mut self, colour: Option<String>) -> Self {
        self.colour = colour.filter(|c| !c.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_price(mut self, price: Option<String>) -> Self {
        self.price = price;
        self
    }

    #[must_use]
    pub fn with_out_of_stock(mut self, out_of_stock: Option<bool>) -> Self {
        self.out_of_stock = out_of_stock;
        self
    }
}

/// Image URLs, either grouped per colour or as a flat list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageUrls {
    ByColour(BTreeMap<String, Vec<String>>),
    Flat(Vec<String>),
}

impl Default for ImageUrls {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

/// Marker attached to records that left the ledger before completing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteMarker {
    /// Stage names that never contributed
    pub missing_stages: Vec<String>,
    pub reason: String,
}

/// Normalized product record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub retailer_sku: String,
    pub name: String,
    pub brand: String,
    pub category: Vec<String>,
    pub gender: Option<String>,
    pub url: String,
    pub description: Vec<String>,
    pub care: Vec<String>,
    pub image_url: ImageUrls,
    pub skus: SkuTable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<IncompleteMarker>,
}

impl CanonicalRecord {
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.incomplete.is_some()
    }
}

/// Named fields contributed by one extraction.
///
/// Every field is optional; absent fields leave the accumulated record as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub retailer_sku: Option<String>,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub category: Option<Vec<String>>,
    pub gender: Option<String>,
    pub url: Option<String>,
    pub description: Option<Vec<String>>,
    pub care: Option<Vec<String>>,
    pub image_url: Option<ImageUrls>,
    pub skus: Option<SkuTable>,
}

impl RecordFields {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retailer_sku(mut self, sku: impl Into<String>) -> Self {
        self.retailer_sku = Some(sku.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn with_brand(mut self, brand: Option<String>) -> Self {
        self.brand = brand;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: Vec<String>) -> Self {
        self.category = Some(category);
        self
    }

    #[must_use]
    pub fn with_gender(mut self, gender: Option<String>) -> Self {
        self.gender = gender;
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Vec<String>) -> Self {
        self.description = Some(description);
        self
    }

    #[must_use]
    pub fn with_care(mut self, care: Vec<String>) -> Self {
        self.care = Some(care);
        self
    }

    #[must_use]
    pub fn with_image_url(mut self, image_url: ImageUrls) -> Self {
        self.image_url = Some(image_url);
        self
    }

    /// Adds a variant under its derived key; a duplicate key keeps the first variant
    #[must_use]
    pub fn with_variant(mut self, variant: Variant) -> Self {
        let key = SkuKey::for_variant(&variant);
        self.skus.get_or_insert_with(SkuTable::new).entry(key).or_insert(variant);
        self
    }

    /// Number of SKUs carried by this fragment
    #[must_use]
    pub fn sku_count(&self) -> usize {
        self.skus.as_ref().map_or(0, BTreeMap::len)
    }
}

/// Accumulated record under construction.
///
/// Merging is first-writer-wins per field: a field already set is never
/// overwritten by a later fragment. The SKU key set is fixed by the first
/// fragment that supplies SKUs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialRecord {
    fields: RecordFields,
}

impl PartialRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a fragment into the record; returns how many fields were filled
    pub fn absorb(&mut self, incoming: RecordFields) -> usize {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) -> usize {
            match (slot.is_none(), value) {
                (true, Some(value)) => {
                    *slot = Some(value);
                    1
                }
                _ => 0,
            }
        }

        let RecordFields {
            retailer_sku,
            name,
            brand,
            category,
            gender,
            url,
            description,
            care,
            image_url,
            skus,
        } = incoming;

        let f = &mut self.fields;
        fill(&mut f.retailer_sku, retailer_sku)
            + fill(&mut f.name, name)
            + fill(&mut f.brand, brand)
            + fill(&mut f.category, category)
            + fill(&mut f.gender, gender)
            + fill(&mut f.url, url)
            + fill(&mut f.description, description)
            + fill(&mut f.care, care)
            + fill(&mut f.image_url, image_url)
            + fill(&mut f.skus, skus.filter(|table| !table.is_empty()))
    }

    #[must_use]
    pub fn fields(&self) -> &RecordFields {
        &self.fields
    }

    /// Finalizes into a canonical record, filling absent fields with empty values
    #[must_use]
    pub fn into_canonical(self) -> CanonicalRecord {
        let f = self.fields;
        CanonicalRecord {
            retailer_sku: f.retailer_sku.unwrap_or_default(),
            name: f.name.unwrap_or_default(),
            brand: f.brand.unwrap_or_default(),
            category: f.category.unwrap_or_default(),
            gender: f.gender,
            url: f.url.unwrap_or_default(),
            description: f.description.unwrap_or_default(),
            care: f.care.unwrap_or_default(),
            image_url: f.image_url.unwrap_or_default(),
            skus: f.skus.unwrap_or_default(),
            incomplete: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red(size: &str) -> Variant {
        Variant::new(size, "EUR")
            .with_colour(Some("Red".to_string()))
            .with_price(Some("49.90".to_string()))
    }

    #[test]
    fn sku_key_follows_colour_size_rule() {
        assert_eq!(SkuKey::new(Some("Red"), Some("M"), "EUR").as_str(), "Red_M");
        assert_eq!(SkuKey::new(Some("Red"), None, "EUR").as_str(), "Red_One Size");
        assert_eq!(SkuKey::new(None, Some("M"), "EUR").as_str(), "M_EUR");
        assert_eq!(SkuKey::new(Some("  "), Some(""), "KRW").as_str(), "One Size_KRW");
    }

    #[test]
    fn duplicate_variant_keys_keep_first() {
        let fields = RecordFields::new()
            .with_variant(red("M"))
            .with_variant(red("M").with_out_of_stock(Some(true)));

        assert_eq!(fields.sku_count(), 1);
        let skus = fields.skus.unwrap();
        assert_eq!(skus[&SkuKey::from("Red_M")].out_of_stock, None);
    }

    #[test]
    fn absorb_is_first_writer_wins() {
        let mut record = PartialRecord::new();
        let filled = record.absorb(
            RecordFields::new()
                .with_retailer_sku("A1")
                .with_name(Some("Jacket".to_string()))
                .with_variant(red("M")),
        );
        assert_eq!(filled, 3);

        let refilled = record.absorb(
            RecordFields::new()
                .with_name(Some("Other".to_string()))
                .with_brand(Some("Brand".to_string()))
                .with_variant(red("XL")),
        );
        assert_eq!(refilled, 1);

        let canonical = record.into_canonical();
        assert_eq!(canonical.name, "Jacket");
        assert_eq!(canonical.brand, "Brand");
        assert_eq!(canonical.skus.len(), 1);
        assert!(canonical.skus.contains_key(&SkuKey::from("Red_M")));
    }

    #[test]
    fn absorbing_same_fragment_twice_is_idempotent() {
        let fragment = RecordFields::new()
            .with_retailer_sku("A1")
            .with_category(vec!["Shoes".to_string()])
            .with_variant(red("M"));

        let mut once = PartialRecord::new();
        once.absorb(fragment.clone());

        let mut twice = PartialRecord::new();
        twice.absorb(fragment.clone());
        twice.absorb(fragment);

        assert_eq!(once, twice);
    }

    #[test]
    fn image_urls_serialize_untagged() {
        let flat = serde_json::to_value(ImageUrls::Flat(vec!["a.jpg".to_string()])).unwrap();
        assert_eq!(flat, serde_json::json!(["a.jpg"]));

        let mut by_colour = BTreeMap::new();
        by_colour.insert("Red".to_string(), vec!["r.jpg".to_string()]);
        let grouped = serde_json::to_value(ImageUrls::ByColour(by_colour)).unwrap();
        assert_eq!(grouped, serde_json::json!({"Red": ["r.jpg"]}));
    }
}
