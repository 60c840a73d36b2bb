//! Domain module - product record model shared by every site
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod availability;
pub mod constants;
pub mod item_key;
pub mod record;

pub use availability::StockFacts;
pub use item_key::ItemKey;
pub use record::{
    CanonicalRecord, ImageUrls, IncompleteMarker, PartialRecord, RecordFields, SkuKey, SkuTable,
    Variant,
};
