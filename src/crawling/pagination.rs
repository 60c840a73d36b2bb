//! Pagination planning.
//!
//! 목록 첫 페이지에서 발견한 총 페이지/총 개수 신호로 후속 페이지를 한 번만 계산한다.
//! 후속 페이지 응답에서는 다시 계산하지 않는다.

use serde::{Deserialize, Serialize};

use super::tasks::{FetchResponse, FetchTarget};

/// Number of the first listing page on a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PageOrigin {
    Zero,
    #[default]
    One,
}

impl PageOrigin {
    #[must_use]
    pub const fn first(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
        }
    }
}

/// Total-size signal reported by a category's first listing page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSignal {
    TotalPages(u32),
    TotalCount { count: u64, page_size: u32 },
}

impl PageSignal {
    #[must_use]
    pub fn total_pages(self) -> u32 {
        match self {
            Self::TotalPages(n) => n,
            Self::TotalCount { page_size: 0, .. } => 0,
            Self::TotalCount { count, page_size } => {
                let pages = count.div_ceil(u64::from(page_size));
                u32::try_from(pages).unwrap_or(u32::MAX)
            }
        }
    }
}

/// Follow-up pages for one category, derived once from the first page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    origin: PageOrigin,
    total_pages: u32,
}

impl PagePlan {
    #[must_use]
    pub fn new(origin: PageOrigin, signal: PageSignal) -> Self {
        Self {
            origin,
            total_pages: signal.total_pages(),
        }
    }

    #[must_use]
    pub const fn total_pages(&self) -> u32 {
        self.total_pages
    }

    /// Pages still to fetch after the first one. Empty when the category
    /// has zero or one page.
    pub fn follow_up_pages(&self) -> impl Iterator<Item = u32> {
        let first = self.origin.first();
        let end = first.saturating_add(self.total_pages);
        (first + 1)..end
    }
}

/// Builds the listing request for page `page` of the category whose
/// first page produced `first`
pub trait Pager: Send + Sync {
    fn page_target(&self, first: &FetchResponse, page: u32) -> FetchTarget;
}

impl<F> Pager for F
where
    F: Fn(&FetchResponse, u32) -> FetchTarget + Send + Sync,
{
    fn page_target(&self, first: &FetchResponse, page: u32) -> FetchTarget {
        self(first, page)
    }
}
