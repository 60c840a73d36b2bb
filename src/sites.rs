//! Site registry
//!
//! 사이트별 스테이지 테이블(시드, 추출기, 후속 스테이지)을 등록한다.
//! 추출기는 모두 순수 함수이며 네트워크에 접근하지 않는다.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::crawling::{FetchResponse, SiteProfile, StageTableError};

pub mod adidas;
pub mod barneys;
pub mod carhartt;
pub mod lacoste;
pub mod sixpm;

/// Ids accepted by [`profile`]
pub const SITE_IDS: [&str; 5] = [
    adidas::SITE_ID,
    barneys::SITE_ID,
    carhartt::SITE_ID,
    lacoste::SITE_ID,
    sixpm::SITE_ID,
];

#[derive(Error, Debug)]
pub enum SiteError {
    #[error("Unknown site '{0}' (known: adidas, barneys, carhartt, lacoste, 6pm)")]
    Unknown(String),

    #[error("Site table is invalid: {0}")]
    StageTable(#[from] StageTableError),
}

/// Builds the profile registered under `id`
///
/// # Errors
/// Returns [`SiteError::Unknown`] for unregistered ids.
pub fn profile(id: &str) -> Result<SiteProfile, SiteError> {
    let profile = match id.trim().to_ascii_lowercase().as_str() {
        adidas::SITE_ID => adidas::profile()?,
        barneys::SITE_ID => barneys::profile()?,
        carhartt::SITE_ID => carhartt::profile()?,
        lacoste::SITE_ID => lacoste::profile()?,
        sixpm::SITE_ID => sixpm::profile()?,
        other => return Err(SiteError::Unknown(other.to_string())),
    };
    Ok(profile)
}

/// String at a JSON pointer, trimmed; numbers are rendered as text
pub(crate) fn text_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strings (or a single string) at a JSON pointer
pub(crate) fn texts_at(value: &Value, pointer: &str) -> Vec<String> {
    match value.pointer(pointer) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Array elements at a JSON pointer (empty when absent)
pub(crate) fn items_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Parsed CSS selector; `None` when the expression is invalid
pub(crate) fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Concatenated, trimmed text of an element
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// First non-empty text under `scope` matching `css`
pub(crate) fn first_text(scope: ElementRef<'_>, css: &str) -> Option<String> {
    let selector = selector(css)?;
    scope.select(&selector).map(element_text).find(|s| !s.is_empty())
}

/// Non-empty `attr` values of every element matching `css`
pub(crate) fn all_attrs(document: &Html, css: &str, attr: &str) -> Vec<String> {
    let Some(selector) = selector(css) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Resolves `href` against the page's final URI
pub(crate) fn absolute(response: &FetchResponse, href: &str) -> Option<String> {
    let base = Url::parse(&response.payload.final_uri)
        .or_else(|_| Url::parse(&response.uri))
        .ok()?;
    base.join(href).ok().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_registered_site_builds() {
        for id in SITE_IDS {
            let profile = profile(id).unwrap();
            assert_eq!(profile.id(), id);
            assert!(!profile.seeds().is_empty());
        }
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(profile(" Carhartt ").unwrap().id(), "carhartt");
    }

    #[test]
    fn unknown_site_is_rejected() {
        assert!(matches!(profile("zara"), Err(SiteError::Unknown(id)) if id == "zara"));
    }

    #[test]
    fn json_helpers() {
        let doc = json!({"a": {"n": 12, "s": " x ", "list": ["p", "", 3], "one": "solo"}});
        assert_eq!(text_at(&doc, "/a/n").as_deref(), Some("12"));
        assert_eq!(text_at(&doc, "/a/s").as_deref(), Some("x"));
        assert_eq!(text_at(&doc, "/a/missing"), None);
        assert_eq!(texts_at(&doc, "/a/list"), vec!["p", "3"]);
        assert_eq!(texts_at(&doc, "/a/one"), vec!["solo"]);
        assert!(items_at(&doc, "/a/list").len() == 3);
        assert!(items_at(&doc, "/nope").is_empty());
    }
}
