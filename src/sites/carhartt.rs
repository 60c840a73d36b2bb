//! carhartt-wip.co.kr (JSON API)

use std::collections::BTreeMap;

use serde_json::Value;
use url::Url;

use super::{items_at, text_at, texts_at};
use crate::crawling::{
    Extraction, FetchResponse, FetchTarget, PageOrigin, PageSignal, SiteProfile, StageRule,
    StageTableError, StageTag,
};
use crate::domain::{ImageUrls, ItemKey, RecordFields, Variant};

pub const SITE_ID: &str = "carhartt";
const API_BASE: &str = "https://api.carhartt-wip.co.kr/v1";
pub const CATEGORIES_URI: &str = "https://api.carhartt-wip.co.kr/v1/categories?sourceSite=CARHARTT";
const PRODUCTS_URI: &str = "https://api.carhartt-wip.co.kr/v1/products?sort=&size=12&brandIds=15";
const PRODUCT_PAGE: &str = "https://www.carhartt-wip.co.kr/product";
const CURRENCY: &str = "KRW";
const DEFAULT_GENDER: &str = "unisex-adults";
const CATEGORY_ID: &str = "category_id";

/// # Errors
/// Fails only if the stage table below is inconsistent.
pub fn profile() -> Result<SiteProfile, StageTableError> {
    SiteProfile::builder(SITE_ID)
        .seed(FetchTarget::get(StageTag::DiscoverCategories, CATEGORIES_URI))
        .stage(
            StageTag::DiscoverCategories,
            StageRule::new(categories).with_successors(&[StageTag::ListPage]),
        )
        .stage(
            StageTag::ListPage,
            StageRule::new(listing)
                .with_successors(&[StageTag::FetchDetail, StageTag::Paginate])
                .with_pager(listing_page),
        )
        .stage(
            StageTag::Paginate,
            StageRule::new(listing).with_successors(&[StageTag::FetchDetail]),
        )
        .stage(StageTag::FetchDetail, StageRule::new(detail))
        .page_origin(PageOrigin::Zero)
        .default_gender(DEFAULT_GENDER)
        .build()
}

#[must_use]
pub fn listing_uri(category_id: &str, page: u32) -> String {
    let page = page.to_string();
    match Url::parse_with_params(PRODUCTS_URI, [("mainCategoryId", category_id), ("page", page.as_str())]) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{PRODUCTS_URI}&mainCategoryId={category_id}&page={page}"),
    }
}

#[must_use]
pub fn detail_uri(product_id: &str) -> String {
    format!("{API_BASE}/products/{product_id}/detail")
}

fn listing_target(stage: StageTag, category_id: &str, page: u32) -> FetchTarget {
    let target = FetchTarget::get(stage, listing_uri(category_id, page));
    let context = target.context.with(CATEGORY_ID, category_id);
    target.with_context(context)
}

fn categories(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("category payload is not JSON");
    };
    let targets = items_at(&json, "/payload")
        .iter()
        .filter_map(|category| text_at(category, "/categoryId"))
        .map(|id| listing_target(StageTag::ListPage, &id, PageOrigin::Zero.first()))
        .collect();
    Extraction::targets(targets)
}

fn listing(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("product listing is not JSON");
    };
    let targets = items_at(&json, "/payload/content")
        .iter()
        .filter_map(|product| text_at(product, "/productId"))
        .map(|id| FetchTarget::get(StageTag::FetchDetail, detail_uri(&id)))
        .collect();
    let extraction = Extraction::targets(targets);
    match json.pointer("/payload/totalPages").and_then(Value::as_u64) {
        Some(total) => extraction.with_page_signal(PageSignal::TotalPages(
            u32::try_from(total).unwrap_or(u32::MAX),
        )),
        None => extraction,
    }
}

fn listing_page(first: &FetchResponse, page: u32) -> FetchTarget {
    let category_id = first.context.get_str(CATEGORY_ID).unwrap_or_default();
    listing_target(StageTag::Paginate, category_id, page)
}

/// `genderCode` → gender label; unknown codes fall back to the profile default
fn gender(code: Option<String>) -> Option<String> {
    let label = match code.as_deref()? {
        "M" => "men",
        "W" => "women",
        "U" => "unisex-adults",
        "C" => "C",
        _ => return None,
    };
    Some(label.to_string())
}

fn detail(response: &FetchResponse) -> Extraction {
    let Some(raw) = response.json() else {
        return Extraction::malformed("product detail is not JSON");
    };
    let Some(product) = raw.get("payload").filter(|p| !p.is_null()) else {
        return Extraction::not_found();
    };
    let Some(product_id) = text_at(product, "/productId") else {
        return Extraction::malformed("product detail has no productId");
    };

    let colour = text_at(product, "/productInfo/color");
    let price = text_at(product, "/currentPrice");
    let images = texts_at(product, "/productImageUrls");
    let image_url = match &colour {
        Some(colour) => ImageUrls::ByColour(BTreeMap::from([(colour.clone(), images)])),
        None => ImageUrls::Flat(images),
    };

    let mut fields = RecordFields::new()
        .with_retailer_sku(&product_id)
        .with_name(text_at(product, "/productName"))
        .with_brand(text_at(product, "/brandName"))
        .with_category(texts_at(product, "/categoryName"))
        .with_gender(gender(text_at(product, "/genderCode")))
        .with_url(format!("{PRODUCT_PAGE}/{product_id}"))
        .with_description(texts_at(product, "/info"))
        .with_care(texts_at(product, "/productInfo/material"))
        .with_image_url(image_url);
    for size in items_at(product, "/productSizes") {
        let Some(code) = text_at(size, "/sizeCode") else {
            continue;
        };
        let sold_out = size.get("currentStock").and_then(Value::as_i64) == Some(0);
        fields = fields.with_variant(
            Variant::new(code, CURRENCY)
                .with_colour(colour.clone())
                .with_price(price.clone())
                .with_out_of_stock(Some(sold_out)),
        );
    }

    Extraction::fields(ItemKey::from_sku(SITE_ID, &product_id), fields)
}
