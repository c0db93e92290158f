//! Scan metadata.
//!
//! [`ScanInfo`] is the record an external writer or plot client reads to make
//! sense of a scan: identity, timing, chain layout, final state and the
//! category-keyed [`ScanMeta`] that acquisition objects fill in at scan init
//! and scan end.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::chain::ChainDescription;

/// Metadata grouped by category (`"instrument"`, `"positioners"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanMeta {
    categories: Map<String, Value>,
}

impl ScanMeta {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` inside `category`, creating the category when needed.
    pub fn insert(&mut self, category: &str, key: &str, value: Value) {
        let entry = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
    }

    /// Value of `key` inside `category`
    pub fn get(&self, category: &str, key: &str) -> Option<&Value> {
        self.categories.get(category)?.get(key)
    }

    /// Whole category
    pub fn category(&self, category: &str) -> Option<&Map<String, Value>> {
        self.categories.get(category)?.as_object()
    }

    /// Category names
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    /// True when nothing was added
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Identity and bookkeeping record of one scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanInfo {
    /// Unique id
    pub uid: Uuid,
    /// Process-wide increasing scan number
    pub scan_number: u64,
    /// Scan name (for example "ascan")
    pub name: String,
    /// Free-form title
    pub title: String,
    /// Points declared by the root master (`0` means unbounded)
    pub npoints: u64,
    /// Chain layout
    pub chain: ChainDescription,
    /// Set when the run begins
    pub start_time: Option<DateTime<Utc>>,
    /// Set when the run ends
    pub end_time: Option<DateTime<Utc>>,
    /// Final state name
    pub state: String,
    /// Object-provided metadata
    pub meta: ScanMeta,
}

impl ScanInfo {
    /// Serialize to a JSON value
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
