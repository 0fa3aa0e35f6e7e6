use crate::config::ConfigParams;
use crate::driver::Document;
use serde::{Deserialize, Serialize};

/// Field map used for partial updates.
pub type AnyValueMap = Document;

/// String-keyed filter parameters that entity adapters translate into
/// query documents.
pub type FilterParams = ConfigParams;

/// Paging request
///
/// `skip` below zero reads as unset. `take` missing or not positive reads as
/// the engine's maximum page size, and larger values are capped to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagingParams {
    pub skip: Option<i64>,
    pub take: Option<i64>,
    pub total: bool,
}

impl PagingParams {
    pub fn new(skip: Option<i64>, take: Option<i64>, total: bool) -> Self {
        Self { skip, take, total }
    }

    /// Effective skip, never below `min_skip`.
    pub fn get_skip(&self, min_skip: i64) -> i64 {
        match self.skip {
            Some(skip) if skip >= 0 => skip.max(min_skip),
            _ => min_skip,
        }
    }

    pub fn get_take(&self, max_take: i64) -> i64 {
        match self.take {
            Some(take) if take > 0 => take.min(max_take),
            _ => max_take,
        }
    }

    pub fn has_total(&self) -> bool {
        self.total
    }
}

/// One page of query results. `total` is `None` when no count was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPage<T> {
    pub items: Vec<T>,
    pub total: Option<i64>,
}

impl<T> DataPage<T> {
    pub fn new(items: Vec<T>, total: Option<i64>) -> Self {
        Self { items, total }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for DataPage<T> {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}
