//! Catalog Crawler - multi-site e-commerce catalog crawl-and-assemble pipeline
//!
//! Each site is a table of stages (category discovery, listing, pagination,
//! detail, stock). The scheduler walks that graph concurrently, the ledger
//! assembles fragments into one record per product, and the emitter writes
//! every product exactly once.

// Module declarations
pub mod crawling;
pub mod domain;
pub mod infrastructure;
pub mod sites;

pub use crawling::{RunReport, SchedulerConfig, StageScheduler, crawl};
pub use domain::{CanonicalRecord, ItemKey};
