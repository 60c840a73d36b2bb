//! onlinestore.barneys.co.jp (HTML)
//!
//! 카테고리 → 목록(다음 페이지는 `data-grid-url` 로 연결) → 상품 상세.
//! 색상마다 별도 상세 페이지가 있으므로 아이템 키는 `{품번}_{색상}` 이다.
//! 상세 페이지는 다른 색상 페이지를 다시 상세 스테이지로 보낸다.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html};

use super::{absolute, all_attrs, element_text, first_text, selector};
use crate::crawling::{Extraction, FetchResponse, FetchTarget, SiteProfile, StageRule, StageTableError, StageTag};
use crate::domain::constants::sku::ONE_SIZE;
use crate::domain::{ImageUrls, ItemKey, RecordFields, Variant};

pub const SITE_ID: &str = "barneys";
pub const HOME_URI: &str = "https://onlinestore.barneys.co.jp/";
const CURRENCY: &str = "YEN";
const DEFAULT_GENDER: &str = "unisex-adults";
const IN_STOCK_MESSAGES: [&str; 2] = ["在庫あり", "残り1 点"];
const NO_SIZE: &str = "NONE";

mod label {
    pub const SKU: &str = "・品番";
    pub const CATEGORY: &str = "・カテゴリー";
    pub const TYPE: &str = "・タイプ";
    pub const MATERIAL: &str = "・素材";
}

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
        .stage(
            StageTag::FetchDetail,
            StageRule::new(detail).with_successors(&[StageTag::FetchDetail]),
        )
        .default_gender(DEFAULT_GENDER)
        .build()
}

/// `dd` that follows the `dt` whose text contains `label`
fn definition<'a>(document: &'a Html, label: &str) -> Option<ElementRef<'a>> {
    let dt = selector("dt")?;
    document
        .select(&dt)
        .find(|term| element_text(*term).contains(label))?
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .filter(|el| el.value().name() == "dd")
}

fn categories(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let Some(marker) = selector("div.level-2-cc") else {
        return Extraction::empty();
    };
    let targets = document
        .select(&marker)
        .filter_map(|block| {
            block
                .prev_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "a")
        })
        .filter_map(|anchor| anchor.value().attr("href"))
        .filter_map(|href| absolute(response, href))
        .map(|uri| FetchTarget::get(StageTag::ListPage, uri))
        .collect();
    Extraction::targets(targets)
}

fn listing(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let mut targets: Vec<FetchTarget> = all_attrs(&document, ".name-link", "href")
        .iter()
        .filter_map(|href| absolute(response, href))
        .map(|uri| FetchTarget::get(StageTag::FetchDetail, uri))
        .collect();
    if let Some(next) = all_attrs(&document, ".infinite-scroll-placeholder", "data-grid-url")
        .first()
        .and_then(|href| absolute(response, href))
    {
        targets.push(FetchTarget::get(StageTag::ListPage, next));
    }
    Extraction::targets(targets)
}

fn gender(response: &FetchResponse, document: &Html) -> String {
    if response.payload.final_uri.contains("home") {
        return String::new();
    }
    let label = definition(document, label::TYPE).and_then(|dd| first_text(dd, "a"));
    let gender = match label.as_deref() {
        Some("ウィメンズ") => "women",
        Some("メンズ") => "men",
        Some("キッズ＆ベビー") => "kids",
        _ => DEFAULT_GENDER,
    };
    gender.to_string()
}

/// `"¥ 12,100"` → `"12,100"`
fn parse_price(raw: &str) -> Option<String> {
    if let Ok(re) = regex::Regex::new(r"\d[\d,.]*") {
        return re.find(raw).map(|m| m.as_str().to_string());
    }
    raw.split_whitespace().nth(1).map(str::to_string)
}

fn detail(response: &FetchResponse) -> Extraction {
    let document = Html::parse_document(response.text());
    let Some(sku) = definition(&document, label::SKU).map(element_text).filter(|s| !s.is_empty()) else {
        return Extraction::not_found();
    };
    let root = document.root_element();
    let colour = all_attrs(&document, ".selectable.selected .color img", "alt").into_iter().next();
    let images = all_attrs(&document, ".gallery-thumbs img", "src");
    let out_of_stock = first_text(root, ".in-stock-msg")
        .is_none_or(|message| !IN_STOCK_MESSAGES.contains(&message.as_str()));
    let price = first_text(root, ".product-sales-price").and_then(|raw| parse_price(&raw));

    let mut sizes: Vec<String> = selector("div#size_select span")
        .map(|s| document.select(&s).map(element_text).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    if sizes.first().is_none_or(|size| size == NO_SIZE) {
        sizes = vec![ONE_SIZE.to_string()];
    }

    let description = selector(".data_text")
        .map(|s| document.select(&s).map(element_text).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default();
    let image_url = match &colour {
        Some(colour) => ImageUrls::ByColour(BTreeMap::from([(colour.clone(), images)])),
        None => ImageUrls::Flat(images),
    };

    let mut fields = RecordFields::new()
        .with_retailer_sku(&sku)
        .with_name(first_text(root, ".product-name"))
        .with_brand(first_text(root, ".brand-link"))
        .with_category(
            definition(&document, label::CATEGORY)
                .and_then(|dd| first_text(dd, "a"))
                .into_iter()
                .collect(),
        )
        .with_gender(Some(gender(response, &document)))
        .with_url(response.payload.final_uri.clone())
        .with_description(description)
        .with_care(definition(&document, label::MATERIAL).map(element_text).into_iter().collect())
        .with_image_url(image_url);
    for size in sizes {
        fields = fields.with_variant(
            Variant::new(size, CURRENCY)
                .with_colour(colour.clone())
                .with_price(price.clone())
                .with_out_of_stock(Some(out_of_stock)),
        );
    }

    let key_id = match &colour {
        Some(colour) => format!("{sku}_{colour}"),
        None => sku,
    };
    let siblings = all_attrs(&document, "#color_select .selectable .swatchanchor", "href")
        .iter()
        .filter(|href| !href.contains("color=&"))
        .filter_map(|href| absolute(response, href))
        .filter(|uri| *uri != response.payload.final_uri)
        .map(|uri| FetchTarget::get(StageTag::FetchDetail, uri))
        .collect();

    Extraction::fields(ItemKey::from_sku(SITE_ID, &key_id), fields).with_targets(siblings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::{ExtractOutcome, FragmentBody, Payload};
    use crate::domain::SkuKey;

    fn respond(stage: StageTag, uri: &str, html: &str) -> FetchResponse {
        let target = FetchTarget::get(stage, uri);
        FetchResponse::new(&target, Payload::new(html, uri))
    }

    const PRODUCT: &str = r#"
        <html><body>
          <h1 class="product-name">Wool Coat</h1>
          <a class="brand-link"> BARNEYS NEW YORK </a>
          <div class="product-sales-price">¥ 88,000</div>
          <ul id="color_select">
            <li class="selectable selected"><a class="swatchanchor" href="/p/100?color=NAVY"><span class="color"><img alt="NAVY"></span></a></li>
            <li class="selectable"><a class="swatchanchor" href="/p/100?color=GREY"><span class="color"><img alt="GREY"></span></a></li>
          </ul>
          <div class="gallery-thumbs"><img src="https://img/navy1.jpg"><img src="https://img/navy2.jpg"></div>
          <div id="size_select"><span>36</span><span>38</span></div>
          <div class="in-stock-msg">在庫あり</div>
          <p class="data_text"> Double-faced wool. </p><p class="data_text">  </p>
          <dl>
            <dt>・品番</dt><dd> 1234567 </dd>
            <dt>・カテゴリー</dt><dd><a>コート</a></dd>
            <dt>・タイプ</dt><dd><a>ウィメンズ</a></dd>
            <dt>・素材</dt><dd>ウール 100%</dd>
          </dl>
        </body></html>"#;

    #[test]
    fn category_links_precede_level_two_blocks() {
        let html = r#"<ul>
            <li><a href="/women/">Women</a><span>x</span><div class="level-2-cc"></div></li>
            <li><a href="/men/">Men</a><div class="level-2-cc"></div></li>
            <li><a href="/sale/">Sale</a></li>
        </ul>"#;
        let extraction = categories(&respond(StageTag::DiscoverCategories, HOME_URI, html));
        let uris: Vec<_> = extraction.targets.iter().map(|t| t.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["https://onlinestore.barneys.co.jp/women/", "https://onlinestore.barneys.co.jp/men/"]
        );
    }

    #[test]
    fn listing_chains_to_next_grid_page() {
        let html = r#"<div>
            <a class="name-link" href="/p/100">Coat</a>
            <a class="name-link" href="https://onlinestore.barneys.co.jp/p/200">Scarf</a>
            <div class="infinite-scroll-placeholder" data-grid-url="/women/?start=24"></div>
        </div>"#;
        let extraction = listing(&respond(StageTag::ListPage, "https://onlinestore.barneys.co.jp/women/", html));
        let stages: Vec<_> = extraction.targets.iter().map(|t| t.stage).collect();
        assert_eq!(stages, vec![StageTag::FetchDetail, StageTag::FetchDetail, StageTag::ListPage]);
        assert_eq!(extraction.targets[2].uri, "https://onlinestore.barneys.co.jp/women/?start=24");
    }

    #[test]
    fn detail_reads_definition_list_and_colour() {
        let uri = "https://onlinestore.barneys.co.jp/p/100?color=NAVY";
        let extraction = detail(&respond(StageTag::FetchDetail, uri, PRODUCT));

        let (key, FragmentBody::Fields(fields)) = extraction.fragment.clone().unwrap() else {
            panic!("expected fields");
        };
        assert_eq!(key, ItemKey::from_sku(SITE_ID, "1234567_NAVY"));
        assert_eq!(fields.retailer_sku.as_deref(), Some("1234567"));
        assert_eq!(fields.brand.as_deref(), Some("BARNEYS NEW YORK"));
        assert_eq!(fields.category, Some(vec!["コート".to_string()]));
        assert_eq!(fields.gender.as_deref(), Some("women"));
        assert_eq!(fields.care, Some(vec!["ウール 100%".to_string()]));
        assert_eq!(fields.description, Some(vec!["Double-faced wool.".to_string()]));
        let skus = fields.skus.unwrap();
        let navy_36 = &skus[&SkuKey::from("NAVY_36")];
        assert_eq!(navy_36.price.as_deref(), Some("88,000"));
        assert_eq!(navy_36.out_of_stock, Some(false));
        assert_eq!(skus.len(), 2);

        // 현재 페이지는 다시 방문하지 않는다
        let siblings: Vec<_> = extraction.targets.iter().map(|t| t.uri.as_str()).collect();
        assert_eq!(siblings, vec!["https://onlinestore.barneys.co.jp/p/100?color=GREY"]);
    }

    #[test]
    fn sizeless_products_use_one_size() {
        let html = PRODUCT
            .replace("<span>36</span><span>38</span>", "<span>NONE</span>")
            .replace("在庫あり", "在庫なし");
        let extraction = detail(&respond(StageTag::FetchDetail, "https://onlinestore.barneys.co.jp/p/1", &html));
        let (_, FragmentBody::Fields(fields)) = extraction.fragment.unwrap() else {
            panic!("expected fields");
        };
        let skus = fields.skus.unwrap();
        assert_eq!(skus.len(), 1);
        assert_eq!(skus[&SkuKey::from("NAVY_One Size")].out_of_stock, Some(true));
    }

    #[test]
    fn home_goods_have_blank_gender() {
        let extraction = detail(&respond(StageTag::FetchDetail, "https://onlinestore.barneys.co.jp/home/p/9", PRODUCT));
        let (_, FragmentBody::Fields(fields)) = extraction.fragment.unwrap() else {
            panic!("expected fields");
        };
        assert_eq!(fields.gender.as_deref(), Some(""));
    }

    #[test]
    fn page_without_product_code_is_not_found() {
        let extraction = detail(&respond(StageTag::FetchDetail, "https://onlinestore.barneys.co.jp/p/0", "<html></html>"));
        assert!(matches!(extraction.outcome, ExtractOutcome::NotFound));
    }
}
