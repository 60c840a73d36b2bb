//! Stable product identity
//!
//! An `ItemKey` correlates every fetch that contributes to one product. It is
//! derived from the retailer SKU (preferred) or from the detail endpoint URI,
//! always prefixed with the site id so keys from different sites never collide.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::constants::record::ITEM_KEY_SEPARATOR;

/// Stable identifier for a product within one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Key derived from a retailer SKU / article id
    #[must_use]
    pub fn from_sku(site: &str, sku: &str) -> Self {
        Self(format!("{site}{ITEM_KEY_SEPARATOR}{}", sku.trim()))
    }

    /// Key derived from a detail endpoint URI.
    ///
    /// The fragment is dropped and the host lower-cased so that two links to
    /// the same product page converge on the same key. Unparseable URIs are
    /// used verbatim (trimmed).
    #[must_use]
    pub fn from_uri(site: &str, uri: &str) -> Self {
        let normalized = match Url::parse(uri.trim()) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => uri.trim().to_string(),
        };
        Self(format!("{site}{ITEM_KEY_SEPARATOR}{normalized}"))
    }

    /// Rebuild a key from its string form (e.g. read back from a context value)
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sku_keys_are_deterministic() {
        assert_eq!(
            ItemKey::from_sku("adidas", " GZ0001 "),
            ItemKey::from_sku("adidas", "GZ0001")
        );
        assert_eq!(ItemKey::from_sku("adidas", "GZ0001").as_str(), "adidas:GZ0001");
    }

    #[test]
    fn uri_keys_ignore_fragment_and_host_case() {
        let a = ItemKey::from_uri("barneys", "https://Shop.Example.com/p/123.html#reviews");
        let b = ItemKey::from_uri("barneys", "https://shop.example.com/p/123.html");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("barneys:"));
    }
}
