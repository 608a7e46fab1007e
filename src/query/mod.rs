pub mod plan;
pub mod selector;

pub use plan::{Condition, MangoQuery, Order, Query, attr};

use serde::{Deserialize, Serialize};

/// One page of a bookmark-paginated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub fetched: usize,
    /// Opaque continuation token; `None` once the result set is exhausted.
    pub bookmark: Option<String>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            fetched: self.fetched,
            bookmark: self.bookmark,
        }
    }
}
