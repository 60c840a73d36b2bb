//! www.6pm.com (HTML)
//!
//! 홈의 "View all" 링크 → 목록(`rel="next"` 로 다음 페이지) → 상품 상세.
//! 성별은 처음 만난 링크 URI 에서 정해지고 이후 컨텍스트로 전파된다.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html};

use super::{absolute, all_attrs, element_text, first_text, selector};
use crate::crawling::{Extraction, FetchResponse, FetchTarget, SiteProfile, StageRule, StageTableError, StageTag};
use crate::domain::constants::sku::ONE_SIZE;
use crate::domain::{ImageUrls, ItemKey, RecordFields, Variant};

pub const SITE_ID: &str = "6pm";
pub const HOME_URI: &str = "https://www.6pm.com/";
const DEFAULT_GENDER: &str = "unisex-adults";
const DEFAULT_CURRENCY: &str = "USD";
/// URI 에서 찾는 순서대로
const GENDERS: [&str; 4] = ["women", "men", "boys", "girls"];
const VIEW_ALL: &str = "View all";
const COLOUR_LABEL: &str = "Color:";
const OUT_OF_STOCK: &str = "Out of Stock";
const CONTEXT_GENDER: &str = "gender";

/// # Errors
/// Fails only if the stage table below is inconsistent.
pub fn profile() -> Result<SiteProfile, StageTableError> {
    SiteProfile::builder(SITE_ID)
        .seed(FetchTarget::get(StageTag::DiscoverCategories, HOME_URI))
        .stage(
            StageTag::DiscoverCategories,
            StageRule::new(categories).with_successors(&[StageTag::ListPage]),
        )
        .stage(
            StageTag::ListPage,
            StageRule::new(listing).with_successors(&[StageTag::FetchDetail, StageTag::ListPage]),
        )
        .stage(StageTag::FetchDetail, StageRule::new(detail))
        .default_gender(DEFAULT_GENDER)
        .build()
}

/// Gender carried by the response, else guessed from the next URI
fn gender_for(response: &FetchResponse, uri: &str) -> String {
    if let Some(gender) = response.context.get_str(CONTEXT_GENDER) {
        return gender.to_string();
    }
    GENDERS
        .iter()
        .find(|gender| uri.contains(*gender))
        .copied()
        .unwrap_or(DEFAULT_GENDER)
        .to_string()
}

fn follow(response: &FetchResponse, stage: StageTag, uri: String) -> FetchTarget {
    let context = response.context.with(CONTEXT_GENDER, gender_for(response, &uri));
    FetchTarget::get(stage, uri).with_context(context)
}

fn categories(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let Some(anchors) = selector("a") else {
        return Extraction::empty();
    };
    let targets = document
        .select(&anchors)
        .filter(|anchor| element_text(*anchor).contains(VIEW_ALL))
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| absolute(response, href))
        .map(|uri| follow(response, StageTag::ListPage, uri))
        .collect();
    Extraction::targets(targets)
}

fn listing(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let mut seen = Vec::new();
    for uri in all_attrs(&document, "article a", "href")
        .iter()
        .filter_map(|href| absolute(response, href))
    {
        if !seen.contains(&uri) {
            seen.push(uri);
        }
    }
    let mut targets: Vec<FetchTarget> = seen
        .into_iter()
        .map(|uri| follow(response, StageTag::FetchDetail, uri))
        .collect();
    if let Some(next) = all_attrs(&document, r#"#searchPagination a[rel="next"]"#, "href")
        .first()
        .and_then(|href| absolute(response, href))
    {
        targets.push(follow(response, StageTag::ListPage, next));
    }
    Extraction::targets(targets)
}

/// 첫 번째 텍스트 노드만 (하위 요소의 텍스트는 제외)
fn own_text(element: ElementRef<'_>) -> Option<String> {
    element.text().next().map(|text| text.trim().replace('\n', ""))
}

/// `span` right after the one labelled `Color:`
fn colour(document: &Html) -> Option<String> {
    let spans = selector("span")?;
    document
        .select(&spans)
        .find(|span| element_text(*span).contains(COLOUR_LABEL))?
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "span")
        .map(element_text)
        .filter(|text| !text.is_empty())
}

fn description(document: &Html) -> Vec<String> {
    let Some(items) = selector(r#"div[role="presentation"] li"#) else {
        return Vec::new();
    };
    let features: Vec<ElementRef<'_>> = document.select(&items).collect();
    let Some(first) = features.first() else {
        return Vec::new();
    };
    // 두 번째 항목은 건너뛴다
    std::iter::once(own_text(*first).unwrap_or_default())
        .chain(features.iter().skip(2).map(|li| own_text(*li).unwrap_or_default()))
        .collect()
}

fn detail(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let root = document.root_element();
    let sku = first_text(root, r#"span[itemprop="sku"]"#);
    let name = first_text(root, r#"span[itemprop="name"]"#);
    if sku.is_none() && name.is_none() {
        return Extraction::not_found();
    }

    let colour = colour(&document);
    let price = all_attrs(&document, r#"span[itemprop="price"]"#, "content").into_iter().next();
    let currency = all_attrs(&document, r#"span[itemprop="priceCurrency"]"#, "content")
        .into_iter()
        .next()
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let crumbs: Vec<String> = selector("#breadcrumbs a")
        .map(|s| document.select(&s).map(element_text).collect())
        .unwrap_or_default();
    let category = crumbs.get(1..crumbs.len().saturating_sub(1)).unwrap_or_default().to_vec();

    let images: Vec<String> = all_attrs(&document, "#productThumbnails source", "srcset")
        .iter()
        .filter_map(|srcset| srcset.split_whitespace().next())
        .map(str::to_string)
        .collect();
    let image_url = match &colour {
        Some(colour) => ImageUrls::ByColour(BTreeMap::from([(colour.clone(), images)])),
        None => ImageUrls::Flat(images),
    };

    let gender = gender_for(response, &response.uri);
    let mut fields = RecordFields::new()
        .with_name(name)
        .with_brand(first_text(root, r#"span[itemprop="brand"] + span"#))
        .with_category(category)
        .with_gender(Some(gender))
        .with_url(response.payload.final_uri.clone())
        .with_description(description(&document))
        .with_image_url(image_url);
    if let Some(sku) = &sku {
        fields = fields.with_retailer_sku(sku);
    }

    let sizes: Vec<(String, bool)> = selector("input[data-label]")
        .map(|s| {
            document
                .select(&s)
                .filter_map(|input| {
                    let size = input.value().attr("data-label")?.trim();
                    let stock = input.value().attr("aria-label").unwrap_or_default();
                    Some((size.to_string(), stock.contains(OUT_OF_STOCK)))
                })
                .filter(|(size, _)| !size.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if sizes.is_empty() {
        fields = fields.with_variant(
            Variant::new(ONE_SIZE, &currency)
                .with_colour(colour.clone())
                .with_price(price.clone()),
        );
    }
    for (size, out_of_stock) in sizes {
        fields = fields.with_variant(
            Variant::new(size, &currency)
                .with_colour(colour.clone())
                .with_price(price.clone())
                .with_out_of_stock(Some(out_of_stock)),
        );
    }

    let key = match &sku {
        Some(sku) => ItemKey::from_sku(SITE_ID, sku),
        None => ItemKey::from_uri(SITE_ID, &response.payload.final_uri),
    };
    Extraction::fields(key, fields)
}
