//! lacoste.co.th (Magento GraphQL)
//!
//! All stages are POSTs to one GraphQL endpoint; the request body tells them apart,
//! so coalescing keys include the body. Availability comes with the detail payload.

use serde_json::{Value, json};

use super::{items_at, text_at};
use crate::crawling::{
    Extraction, FetchResponse, FetchTarget, PageOrigin, PageSignal, SiteProfile, StageRule,
    StageTableError, StageTag,
};
use crate::domain::{ImageUrls, ItemKey, RecordFields, Variant};

pub const SITE_ID: &str = "lacoste";
pub const BASE_URL: &str = "https://www.lacoste.co.th";
pub const GRAPHQL_URI: &str = "https://www.lacoste.co.th/graphql";
const HEADERS: [(&str, &str); 1] = [("Content-Type", "application/json")];
const IMAGE_PREFIX: &str = "https://www.lacoste.co.th/pub/media/catalog/product/";
const ROOT_CATEGORY: u64 = 2;
const PAGE_SIZE: u32 = 32;
const BRAND: &str = "Lacoste";
const GENDERS: [&str; 4] = ["Women", "Men", "Girl", "Boy"];
const UNISEX: &str = "Unisex";
const CATEGORY_ID: &str = "category_id";
const URL_PATH: &str = "url_path";

const NAVIGATION_QUERY: &str = "query navigationMenu($id: Int!) { category(id: $id) { id name \
    children { id url_path children { id url_path children { id url_path children { id url_path } } } } } }";
const CATEGORY_QUERY: &str = "query category($id: Int!, $pageSize: Int!, $currentPage: Int!, \
    $filter: ProductAttributeFilterInput, $sort: ProductAttributeSortInput) { \
    products(pageSize: $pageSize, currentPage: $currentPage, filter: $filter, sort: $sort) { \
    items { id name url_key } page_info { total_pages } total_count } }";
const PRODUCT_QUERY: &str = "query productDetail($urlKey: String) { \
    productDetail: products(filter: {url_key: {eq: $urlKey}}) { items { __typename meta_description \
    name item_category item_category3 price { regularPrice { amount { currency value } } } sku \
    care_instructions url_key ... on ConfigurableProduct { configurable_options { attribute_code \
    label values { label value_index } } variants { attributes { code value_index } \
    product { media_gallery_entries { file } } } } } } }";

/// # Errors
/// Fails only if the stage table below is inconsistent.
pub fn profile() -> Result<SiteProfile, StageTableError> {
    SiteProfile::builder(SITE_ID)
        .seed(graphql(StageTag::DiscoverCategories, &navigation_payload()))
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
        .page_origin(PageOrigin::One)
        .default_gender(UNISEX)
        .build()
}

fn graphql(stage: StageTag, payload: &Value) -> FetchTarget {
    FetchTarget::post(stage, GRAPHQL_URI, payload.to_string()).with_headers(&HEADERS)
}

#[must_use]
pub fn navigation_payload() -> Value {
    json!({
        "operationName": "navigationMenu",
        "query": NAVIGATION_QUERY,
        "variables": {"id": ROOT_CATEGORY}
    })
}

#[must_use]
pub fn listing_payload(category_id: u64, page: u32) -> Value {
    json!({
        "operationName": "category",
        "query": CATEGORY_QUERY,
        "variables": {
            "currentPage": page,
            "id": category_id,
            "idString": category_id.to_string(),
            "onServer": true,
            "pageSize": PAGE_SIZE,
            "filter": {"category_id": {"eq": category_id.to_string()}},
            "sort": {"position": "DESC"}
        }
    })
}

#[must_use]
pub fn product_payload(url_key: &str) -> Value {
    json!({
        "operationName": "productDetail",
        "query": PRODUCT_QUERY,
        "variables": {"onServer": true, "urlKey": url_key}
    })
}

/// Listing url keys carry a colour segment before the last part; the detail query wants it gone
#[must_use]
pub fn detail_url_key(listing_key: &str) -> String {
    let mut parts: Vec<&str> = listing_key.split('-').collect();
    if parts.len() > 2 {
        parts.remove(parts.len() - 2);
    }
    parts.join("-")
}

/// Leaf categories of the navigation tree as `(id, url_path)`
fn leaf_categories(nodes: &[Value], out: &mut Vec<(u64, String)>) {
    for node in nodes {
        match node.get("children").and_then(Value::as_array) {
            Some(children) if !children.is_empty() => leaf_categories(children, out),
            _ => {
                if let Some(id) = node.get("id").and_then(Value::as_u64) {
                    out.push((id, text_at(node, "/url_path").unwrap_or_default()));
                }
            }
        }
    }
}

fn listing_target(stage: StageTag, category_id: u64, url_path: &str, page: u32) -> FetchTarget {
    let target = graphql(stage, &listing_payload(category_id, page));
    let context = target.context.with(CATEGORY_ID, category_id).with(URL_PATH, url_path);
    target.with_context(context)
}

fn categories(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("navigation payload is not JSON");
    };
    let mut leaves = Vec::new();
    leaf_categories(items_at(&json, "/data/category/children/0/children"), &mut leaves);
    let targets = leaves
        .iter()
        .map(|(id, path)| listing_target(StageTag::ListPage, *id, path, PageOrigin::One.first()))
        .collect();
    Extraction::targets(targets)
}

fn listing(response: &FetchResponse) -> Extraction {
    let Some(json) = response.json() else {
        return Extraction::malformed("category payload is not JSON");
    };
    let url_path = response.context.get_str(URL_PATH).unwrap_or_default();
    let targets = items_at(&json, "/data/products/items")
        .iter()
        .filter_map(|item| text_at(item, "/url_key"))
        .map(|listing_key| {
            let url_key = detail_url_key(&listing_key);
            let target = graphql(StageTag::FetchDetail, &product_payload(&url_key));
            let context = target.context.with(URL_PATH, url_path);
            target.with_context(context)
        })
        .collect();

    let extraction = Extraction::targets(targets);
    match json.pointer("/data/products/page_info/total_pages").and_then(Value::as_u64) {
        Some(total) => extraction.with_page_signal(PageSignal::TotalPages(
            u32::try_from(total).unwrap_or(u32::MAX),
        )),
        None => extraction,
    }
}

fn listing_page(first: &FetchResponse, page: u32) -> FetchTarget {
    let category_id = first.context.get_u64(CATEGORY_ID).unwrap_or_default();
    let url_path = first.context.get_str(URL_PATH).unwrap_or_default();
    listing_target(StageTag::Paginate, category_id, url_path, page)
}

/// Detail responses sometimes arrive behind an HTML preamble
fn detail_json(body: &str) -> Option<Value> {
    let json = body.split_once("</html>").map_or(body, |(_, rest)| rest);
    serde_json::from_str(json.trim()).ok()
}

fn detail(response: &FetchResponse) -> Extraction {
    let Some(raw) = detail_json(response.text()) else {
        return Extraction::malformed("product payload is not JSON");
    };
    let Some(product) = items_at(&raw, "/data/productDetail/items").first() else {
        return Extraction::not_found();
    };
    let Some(sku) = text_at(product, "/sku") else {
        return Extraction::malformed("product has no sku");
    };

    let url_path = response.context.get_str(URL_PATH).unwrap_or_default();
    let url_key = text_at(product, "/url_key").unwrap_or_default();
    let gender = text_at(product, "/item_category3")
        .filter(|g| GENDERS.contains(&g.as_str()))
        .unwrap_or_else(|| UNISEX.to_string());
    let images = items_at(product, "/variants/0/product/media_gallery_entries")
        .iter()
        .filter_map(|entry| text_at(entry, "/file"))
        .map(|file| format!("{IMAGE_PREFIX}{}", file.trim_start_matches('/')))
        .collect();

    let mut fields = RecordFields::new()
        .with_retailer_sku(&sku)
        .with_name(text_at(product, "/name"))
        .with_brand(Some(BRAND.to_string()))
        .with_category(text_at(product, "/item_category").into_iter().collect())
        .with_gender(Some(gender))
        .with_url(format!("{BASE_URL}/en/{url_path}/{url_key}.html"))
        .with_description(description(product))
        .with_care(care(product))
        .with_image_url(ImageUrls::Flat(images));

    let price = text_at(product, "/price/regularPrice/amount/value");
    let currency = text_at(product, "/price/regularPrice/amount/currency").unwrap_or_default();
    let colour = text_at(product, "/configurable_options/1/values/0/label");
    let available: Vec<u64> = items_at(product, "/variants")
        .iter()
        .filter_map(|variant| variant.pointer("/attributes/0/value_index").and_then(Value::as_u64))
        .collect();
    for option in items_at(product, "/configurable_options/0/values") {
        let Some(size) = text_at(option, "/label") else {
            continue;
        };
        let in_stock = option
            .get("value_index")
            .and_then(Value::as_u64)
            .is_some_and(|index| available.contains(&index));
        fields = fields.with_variant(
            Variant::new(size, currency.clone())
                .with_colour(colour.clone())
                .with_price(price.clone())
                .with_out_of_stock(Some(!in_stock)),
        );
    }

    Extraction::fields(ItemKey::from_sku(SITE_ID, &sku), fields)
}

fn description(product: &Value) -> Vec<String> {
    text_at(product, "/meta_description")
        .map(|text| {
            text.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `"Wash: 30°, Iron: low"` → `["30°", "low"]`
fn care(product: &Value) -> Vec<String> {
    text_at(product, "/care_instructions")
        .map(|text| {
            text.split(',')
                .filter_map(|item| item.split_once(':').map(|(_, value)| value.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::{FetchMethod, FragmentBody, Payload};
    use crate::domain::SkuKey;

    fn respond(target: &FetchTarget, body: impl Into<String>) -> FetchResponse {
        let body: String = body.into();
        FetchResponse::new(target, Payload::new(body, target.uri.clone()))
    }

    #[test]
    fn url_key_drops_colour_segment() {
        assert_eq!(detail_url_key("polo-shirt-001-l1212"), "polo-shirt-l1212");
        assert_eq!(detail_url_key("polo-l1212"), "polo-l1212");
    }

    #[test]
    fn navigation_yields_leaf_categories_only() {
        let seed = profile().unwrap().seeds()[0].clone();
        assert_eq!(seed.method, FetchMethod::Post);
        let body = json!({"data": {"category": {"children": [{"id": 3, "children": [
            {"id": 10, "url_path": "men", "children": [
                {"id": 11, "url_path": "men/polos", "children": []},
                {"id": 12, "url_path": "men/shoes"}
            ]},
            {"id": 20, "url_path": "women/bags"}
        ]}]}}});

        let extraction = categories(&respond(&seed, body.to_string()));

        let paths: Vec<_> = extraction
            .targets
            .iter()
            .map(|t| t.context.get_str(URL_PATH).unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["men/polos", "men/shoes", "women/bags"]);
        assert_eq!(extraction.targets[0].body, Some(listing_payload(11, 1).to_string()));
    }

    #[test]
    fn pages_share_one_uri_but_not_one_key() {
        let first = listing_target(StageTag::ListPage, 11, "men/polos", 1);
        let page = listing_page(&respond(&first, "{}"), 2);
        assert_eq!(first.uri, page.uri);
        assert_ne!(first.fetch_key(), page.fetch_key());
        assert_eq!(page.context.get_str(URL_PATH), Some("men/polos"));
    }

    #[test]
    fn detail_marks_missing_sizes_out_of_stock() {
        let target = graphql(StageTag::FetchDetail, &product_payload("polo-l1212"));
        let context = target.context.with(URL_PATH, "men/polos");
        let target = target.with_context(context);
        let body = json!({"data": {"productDetail": {"items": [{
            "sku": "L1212",
            "name": "Polo",
            "url_key": "polo-l1212",
            "item_category": "Polos",
            "item_category3": "Kids",
            "meta_description": "Classic fit. Cotton pique.",
            "care_instructions": "Wash: 30 degrees, Dry: flat",
            "price": {"regularPrice": {"amount": {"value": 3900, "currency": "THB"}}},
            "configurable_options": [
                {"attribute_code": "size", "values": [{"label": "S", "value_index": 1}, {"label": "M", "value_index": 2}]},
                {"attribute_code": "color", "values": [{"label": "White", "value_index": 9}]}
            ],
            "variants": [
                {"attributes": [{"value_index": 2}], "product": {"media_gallery_entries": [{"file": "/a/b.jpg"}]}}
            ]
        }]}}});

        let extraction = detail(&respond(&target, format!("<html></html>{body}")));

        let (key, FragmentBody::Fields(fields)) = extraction.fragment.unwrap() else {
            panic!("expected fields");
        };
        assert_eq!(key, ItemKey::from_sku(SITE_ID, "L1212"));
        assert_eq!(fields.gender.as_deref(), Some("Unisex"));
        assert_eq!(fields.url.as_deref(), Some("https://www.lacoste.co.th/en/men/polos/polo-l1212.html"));
        assert_eq!(fields.description, Some(vec!["Classic fit".to_string(), "Cotton pique".to_string()]));
        assert_eq!(fields.care, Some(vec!["30 degrees".to_string(), "flat".to_string()]));
        assert_eq!(
            fields.image_url,
            Some(ImageUrls::Flat(vec![format!("{IMAGE_PREFIX}a/b.jpg")]))
        );
        let skus = fields.skus.unwrap();
        assert_eq!(skus[&SkuKey::from("White_S")].out_of_stock, Some(true));
        assert_eq!(skus[&SkuKey::from("White_M")].out_of_stock, Some(false));
        assert_eq!(skus[&SkuKey::from("White_M")].price.as_deref(), Some("3900"));
    }

    #[test]
    fn empty_detail_result_is_not_found() {
        let target = graphql(StageTag::FetchDetail, &product_payload("gone"));
        let body = json!({"data": {"productDetail": {"items": []}}});
        assert!(matches!(
            detail(&respond(&target, body.to_string())).outcome,
            crate::crawling::ExtractOutcome::NotFound
        ));
    }
}
