//! Core domain model and category normalization for RBCN.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Class designator stripped from category keys but kept as a report column.
pub const F_CLASS: &str = "F-Class";

static SERIES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Series\s+\d+").expect("series pattern is valid"));

static RATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?% Securities").expect("rate pattern is valid"));

/// Label -> value pairs scraped from a product detail page, in page order.
pub type ReferenceInfo = IndexMap<String, String>;

/// One row of the listing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductListing {
    pub name: String,
    pub detail_url: String,
    pub issue_date: String,
    pub maturity_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_info: Option<ReferenceInfo>,
}

impl ProductListing {
    pub fn new(
        name: impl Into<String>,
        detail_url: impl Into<String>,
        issue_date: impl Into<String>,
        maturity_date: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            detail_url: detail_url.into(),
            issue_date: issue_date.into(),
            maturity_date: maturity_date.into(),
            reference_info: None,
        }
    }

    pub fn is_f_class(&self) -> bool {
        is_f_class(&self.name)
    }

    /// Reference labels in page order; empty until detail info is attached.
    pub fn reference_labels(&self) -> Vec<&str> {
        self.reference_info
            .as_ref()
            .map(|info| info.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn reference_value(&self, label: &str) -> &str {
        self.reference_info
            .as_ref()
            .and_then(|info| info.get(label))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Products keyed by display name, in listing order.
///
/// Re-inserting an existing name replaces the entry in place; it keeps its
/// original position and does not grow the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductDirectory {
    entries: IndexMap<String, ProductListing>,
}

impl ProductDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, listing: ProductListing) -> Option<ProductListing> {
        self.entries.insert(listing.name.clone(), listing)
    }

    pub fn get(&self, name: &str) -> Option<&ProductListing> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProductListing> {
        self.entries.values()
    }

    /// Returns false when `name` is not in the directory.
    pub fn attach_reference_info(&mut self, name: &str, info: ReferenceInfo) -> bool {
        match self.entries.get_mut(name) {
            Some(listing) => {
                listing.reference_info = Some(info);
                true
            }
            None => false,
        }
    }
}

impl FromIterator<ProductListing> for ProductDirectory {
    fn from_iter<I: IntoIterator<Item = ProductListing>>(iter: I) -> Self {
        let mut directory = Self::new();
        for listing in iter {
            directory.insert(listing);
        }
        directory
    }
}

pub fn is_f_class(name: &str) -> bool {
    name.contains(F_CLASS)
}

fn strip_variant_tokens(name: &str) -> String {
    let key = name.replace(F_CLASS, "");
    let key = key.trim();
    let key = SERIES_PATTERN.replace_all(key, "");
    let key = key.trim();
    let key = key.replace(',', "");
    let key = key.trim();
    let key = RATE_PATTERN.replace_all(key, "");
    key.trim().to_string()
}

/// Derives the family name shared by every class/series/rate variant of a product.
///
/// Removal order: `F-Class`, `Series <n>`, commas, `<rate>% Securities`, trimming
/// after each step. A removal can splice a new token together, so the pass is
/// repeated until the key stops changing; each changing pass shortens the key.
pub fn category_key(name: &str) -> String {
    let mut key = strip_variant_tokens(name);
    loop {
        let next = strip_variant_tokens(&key);
        if next == key {
            return key;
        }
        key = next;
    }
}

/// Category key -> member product names, both in first-seen listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryGroups {
    groups: IndexMap<String, Vec<String>>,
}

impl CategoryGroups {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.groups.get(category).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups
            .iter()
            .map(|(category, members)| (category.as_str(), members.as_slice()))
    }

    pub fn member_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

pub fn categorize(directory: &ProductDirectory) -> CategoryGroups {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for name in directory.names() {
        groups
            .entry(category_key(name))
            .or_default()
            .push(name.to_string());
    }
    CategoryGroups { groups }
}
