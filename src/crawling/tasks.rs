//! # Fetch Task Definitions
//!
//! Transport-independent request descriptors for the staged crawl pipeline.
//! Following Clean Code principles, each target is self-contained and
//! immutable once issued; the context it carries is shared, never mutated.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ItemKey;
use crate::domain::constants::record::{CONTEXT_ITEM_KEY, CONTEXT_PAGE};

/// One node of a site's traversal graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTag {
    DiscoverCategories,
    ListPage,
    Paginate,
    FetchDetail,
    FetchStock,
}

impl StageTag {
    pub const ALL: [StageTag; 5] = [
        Self::DiscoverCategories,
        Self::ListPage,
        Self::Paginate,
        Self::FetchDetail,
        Self::FetchStock,
    ];

    /// Returns the stage name as a string for telemetry
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DiscoverCategories => "discover_categories",
            Self::ListPage => "list_page",
            Self::Paginate => "paginate",
            Self::FetchDetail => "fetch_detail",
            Self::FetchStock => "fetch_stock",
        }
    }
}

impl fmt::Display for StageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-ish request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchMethod {
    Get,
    Post,
}

impl FetchMethod {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Immutable context threaded from one stage to the next
/// (category id, url path, owning item key, page number, ...)
///
/// Cloning is cheap; `with` produces a new context and leaves every
/// previously issued target's context untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchContext(Arc<BTreeMap<String, Value>>);

impl FetchContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of this context with `key` set to `value`
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = (*self.0).clone();
        values.insert(key.into(), value.into());
        Self(Arc::new(values))
    }

    #[must_use]
    pub fn with_item_key(&self, key: &ItemKey) -> Self {
        self.with(CONTEXT_ITEM_KEY, key.as_str())
    }

    #[must_use]
    pub fn with_page(&self, page: u32) -> Self {
        self.with(CONTEXT_PAGE, page)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer value; string-encoded integers are accepted too
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn item_key(&self) -> Option<ItemKey> {
        self.get_str(CONTEXT_ITEM_KEY).map(ItemKey::from_raw)
    }

    #[must_use]
    pub fn page(&self) -> Option<u32> {
        self.get_u64(CONTEXT_PAGE).and_then(|p| u32::try_from(p).ok())
    }
}

/// Identity of a fetch for in-flight coalescing: (method, target, payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchKey(blake3::Hash);

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 로그 가독성을 위해 앞 12자리만 출력
        f.write_str(&self.0.to_hex()[..12])
    }
}

/// Abstract request descriptor, independent of transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchTarget {
    pub method: FetchMethod,
    pub uri: String,
    /// Query payload (form / JSON / GraphQL body) for POST targets
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub stage: StageTag,
    pub context: FetchContext,
    /// Resubmission count; not part of the fetch identity
    #[serde(default)]
    pub attempt: u32,
}

impl FetchTarget {
    #[must_use]
    pub fn get(stage: StageTag, uri: impl Into<String>) -> Self {
        Self {
            method: FetchMethod::Get,
            uri: uri.into(),
            body: None,
            headers: Vec::new(),
            stage,
            context: FetchContext::new(),
            attempt: 0,
        }
    }

    #[must_use]
    pub fn post(stage: StageTag, uri: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: FetchMethod::Post,
            body: Some(body.into()),
            ..Self::get(stage, uri)
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: &[(&str, &str)]) -> Self {
        self.headers
            .extend(headers.iter().map(|(n, v)| ((*n).to_string(), (*v).to_string())));
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: FetchContext) -> Self {
        self.context = context;
        self
    }

    /// Same request re-targeted at another stage
    #[must_use]
    pub fn as_stage(mut self, stage: StageTag) -> Self {
        self.stage = stage;
        self
    }

    /// Identity used to coalesce duplicate submissions
    #[must_use]
    pub fn fetch_key(&self) -> FetchKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.uri.as_bytes());
        hasher.update(&[0]);
        if let Some(body) = &self.body {
            hasher.update(body.as_bytes());
        }
        FetchKey(hasher.finalize())
    }

    /// Copy of this target for resubmission after a retryable failure
    #[must_use]
    pub fn retried(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Raw payload returned by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: Arc<str>,
    /// URI after redirects
    pub final_uri: String,
}

impl Payload {
    #[must_use]
    pub fn new(body: impl Into<Arc<str>>, final_uri: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            final_uri: final_uri.into(),
        }
    }
}

/// A resolved fetch as seen by extractors: payload plus the stage and
/// context the target was issued with
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub stage: StageTag,
    pub context: FetchContext,
    pub uri: String,
    pub payload: Payload,
}

impl FetchResponse {
    #[must_use]
    pub fn new(target: &FetchTarget, payload: Payload) -> Self {
        Self {
            stage: target.stage,
            context: target.context.clone(),
            uri: target.uri.clone(),
            payload,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.payload.body
    }

    /// Parses the payload as JSON; malformed bodies yield `None`
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(self.text()).ok()
    }
}
