//! adidas.com.cn (JSON API)
//!
//! navigation → category search (0-based pages, `totalPages`) → article detail → stock
//! Sizes are reconciled against the stock endpoint, so every item needs the stock stage.

use serde_json::Value;

use super::{items_at, text_at, texts_at};
use crate::crawling::{
    Extraction, FetchResponse, FetchTarget, PageOrigin, PageSignal, SiteProfile, StageRule,
    StageTableError, StageTag,
};
use crate::domain::{ImageUrls, ItemKey, RecordFields, StockFacts, Variant};

pub const SITE_ID: &str = "adidas";
pub const SITE_URL: &str = "https://www.adidas.com.cn";
pub const NAVIGATION_API: &str = "https://ecp-public.api.adidas.com.cn/o2cms/v2/pub/navigation?";
const LISTING_API: &str = "https://ecp-public.api.adidas.com.cn/o2srh/v1/pub/platform-products/search";
const DETAIL_API: &str = "https://ecp-public.api.adidas.com.cn/o2pcm/v1/pub/platform-products/detail";
const STOCK_API: &str = "https://ecp-public.api.adidas.com.cn/o2inv/v1/pub/inv-query/batch/article-shop-inv";
const HEADERS: [(&str, &str); 2] = [("x-source", "COM"), ("origin", SITE_URL)];
const PAGE_SIZE: u32 = 6;
const CURRENCY: &str = "YEN";
/// Detail body marker returned for withdrawn articles
pub const NOT_FOUND_MARKER: &str = "<PlatformProductDetailExpandVO>";
const CONTENT_ID: &str = "content_id";

/// # Errors
/// Fails only if the stage table below is inconsistent.
pub fn profile() -> Result<SiteProfile, StageTableError> {
    SiteProfile::builder(SITE_ID)
        .seed(FetchTarget::get(StageTag::DiscoverCategories, NAVIGATION_API).with_headers(&HEADERS))
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
        .stage(
            StageTag::FetchDetail,
            StageRule::new(detail).with_successors(&[StageTag::FetchStock]),
        )
        .stage(StageTag::FetchStock, StageRule::new(stock))
        .page_origin(PageOrigin::Zero)
        .build()
}

pub fn listing_uri(content_id: &str, page: u32) -> String {
    format!("{LISTING_API}?page={page}&pageSize={PAGE_SIZE}&abTest=A&contentId={content_id}")
}

pub fn detail_uri(article_id: &str) -> String {
    format!("{DETAIL_API}?articleId={article_id}")
}

pub fn stock_uri(article_id: &str) -> String {
    format!("{STOCK_API}?articleIdList={article_id}")
}

fn listing_target(stage: StageTag, content_id: &str, page: u32) -> FetchTarget {
    let target = FetchTarget::get(stage, listing_uri(content_id, page)).with_headers(&HEADERS);
    let context = target.context.with(CONTENT_ID, content_id);
    target.with_context(context)
}

fn categories(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("navigation payload is not JSON");
    };
    let targets = items_at(&json, "/content")
        .iter()
        .filter_map(|node| text_at(node, "/contentId"))
        .map(|id| listing_target(StageTag::ListPage, &id, PageOrigin::Zero.first()))
        .collect();
    Extraction::targets(targets)
}

fn listing(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("listing payload is not JSON");
    };
    let targets = items_at(&json, "/content")
        .iter()
        .filter_map(|product| text_at(product, "/articleId"))
        .map(|id| FetchTarget::get(StageTag::FetchDetail, detail_uri(&id)).with_headers(&HEADERS))
        .collect();

    let extraction = Extraction::targets(targets);
    match json.get("totalPages").and_then(Value::as_u64) {
        Some(total) => extraction.with_page_signal(PageSignal::TotalPages(
            u32::try_from(total).unwrap_or(u32::MAX),
        )),
        None => extraction,
    }
}

fn listing_page(first: &FetchResponse, page: u32) -> FetchTarget {
    let content_id = first.context.get_str(CONTENT_ID).unwrap_or_default();
    listing_target(StageTag::Paginate, content_id, page)
}

fn detail(response: &FetchResponse) -> Extraction {
    if response.text().contains(NOT_FOUND_MARKER) {
        return Extraction::not_found();
    }
    let Some(raw) = response.json() else {
        return Extraction::malformed("detail payload is not JSON");
    };
    let Some(article_id) = text_at(&raw, "/articleId") else {
        return Extraction::malformed("detail payload has no articleId");
    };

    let colour = text_at(&raw, "/colorDisplay");
    let price = text_at(&raw, "/salePrice");
    let mut fields = RecordFields::new()
        .with_retailer_sku(&article_id)
        .with_name(text_at(&raw, "/enArticleName"))
        .with_brand(text_at(&raw, "/brandName"))
        .with_category(texts_at(&raw, "/category"))
        .with_gender(text_at(&raw, "/gender"))
        .with_url(format!("{SITE_URL}/pdp?articleId={article_id}"))
        .with_description(Vec::new())
        .with_care(Vec::new())
        .with_image_url(ImageUrls::Flat(texts_at(&raw, "/imageUrlList")));
    for size in items_at(&raw, "/skuList").iter().filter_map(|sku| text_at(sku, "/sizeName")) {
        fields = fields.with_variant(
            Variant::new(size, CURRENCY)
                .with_colour(colour.clone())
                .with_price(price.clone()),
        );
    }

    let key = ItemKey::from_sku(SITE_ID, &article_id);
    let stock = FetchTarget::get(StageTag::FetchStock, stock_uri(&article_id)).with_headers(&HEADERS);
    let context = stock.context.with_item_key(&key);
    Extraction::fields(key, fields).with_targets(vec![stock.with_context(context)])
}

fn stock(response: &FetchResponse) -> Extraction {
    let Some(key) = response.context.item_key() else {
        return Extraction::malformed("stock response is not tied to an item");
    };
    let Some(json) = response.json() else {
        return Extraction::malformed("stock payload is not JSON");
    };
    let facts: StockFacts = items_at(&json, "/0/articleStockSkuVOList")
        .iter()
        .filter_map(|sku| Some((text_at(sku, "/sizeName")?, is_available(sku.get("available")?))))
        .collect();
    if facts.is_empty() {
        // 재고 행이 없으면 가용성은 알 수 없음; 상세 값 그대로 내보낸다
        return Extraction::empty();
    }
    Extraction::stock(key, facts)
}

fn is_available(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n > 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "y"),
        _ => false,
    }
}
