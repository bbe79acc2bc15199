//! Menu items and category buckets
//!
//! Items are identified by their server id; items that arrive without one get
//! an id derived from their category and name, so repeated deliveries of the
//! same item collapse into one record.

use menusync_common::events::MenuItem;
use serde::{Deserialize, Serialize};

/// Reconciled menu item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    /// Id was derived locally rather than sent by the server
    #[serde(default)]
    pub derived_id: bool,
    pub source_text: String,
    pub translated_text: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub image_url: Option<String>,
}

impl ItemRecord {
    /// Convert a wire item, deriving an id when the server sent none.
    ///
    /// `position` is the item's index within its category (chunks continue
    /// the numbering) and only matters for items that carry neither an id
    /// nor any name.
    pub fn from_wire(category: &str, position: usize, item: MenuItem) -> Self {
        let (id, derived_id) = match item.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => (id.to_string(), false),
            _ => (
                derive_id(
                    category,
                    &item.source_text,
                    item.translated_text.as_deref(),
                    position,
                ),
                true,
            ),
        };
        Self {
            id,
            derived_id,
            source_text: item.source_text,
            translated_text: non_empty(item.translated_text),
            description: non_empty(item.description),
            price: non_empty(item.price),
            image_url: non_empty(item.image_url),
        }
    }

    /// Translated name if present, otherwise the source text
    pub fn display_name(&self) -> &str {
        self.translated_text
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.source_text)
    }

    pub fn is_translated(&self) -> bool {
        self.translated_text.is_some()
    }

    /// True if `other` describes the same dish: same id, or the same
    /// non-empty source text when either side only has a derived id (some
    /// stages omit ids).
    pub fn same_item(&self, other: &ItemRecord) -> bool {
        self.id == other.id
            || ((self.derived_id || other.derived_id)
                && !self.source_text.is_empty()
                && self.source_text == other.source_text)
    }

    /// Merge a later report of the same item. Returns true if anything changed.
    ///
    /// Completeness only increases: a present field is never cleared, and
    /// a description is never replaced by a shorter one.
    pub fn absorb(&mut self, other: &ItemRecord) -> bool {
        let mut changed = false;

        if self.source_text.is_empty() && !other.source_text.is_empty() {
            self.source_text = other.source_text.clone();
            changed = true;
        }
        changed |= take_newer(&mut self.translated_text, &other.translated_text);
        changed |= take_newer(&mut self.price, &other.price);
        changed |= take_newer(&mut self.image_url, &other.image_url);

        if let Some(incoming) = &other.description {
            let longer = match &self.description {
                Some(current) => incoming.chars().count() > current.chars().count(),
                None => true,
            };
            if longer {
                self.description = Some(incoming.clone());
                changed = true;
            }
        }
        changed
    }
}

fn derive_id(category: &str, source: &str, translated: Option<&str>, position: usize) -> String {
    let name = if !source.trim().is_empty() {
        source.trim().to_lowercase()
    } else if let Some(t) = translated.filter(|t| !t.trim().is_empty()) {
        t.trim().to_lowercase()
    } else {
        format!("#{}", position)
    };
    format!("{}::{}", category.trim().to_lowercase(), name)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn take_newer(slot: &mut Option<String>, incoming: &Option<String>) -> bool {
    match incoming {
        Some(v) if slot.as_ref() != Some(v) => {
            *slot = Some(v.clone());
            true
        }
        _ => false,
    }
}

/// Result of inserting one item into a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    Unchanged,
}

/// Items of one category plus its enrichment state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBucket {
    pub name: String,
    pub items: Vec<ItemRecord>,
    /// Authoritative final list received (only meaningful for partial buckets)
    pub completed: bool,
}

impl CategoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            completed: false,
        }
    }

    pub fn find(&self, item: &ItemRecord) -> Option<&ItemRecord> {
        self.items.iter().find(|i| i.same_item(item))
    }

    pub fn find_by_id(&self, id: &str) -> Option<&ItemRecord> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Append `item`, or merge it into the record it duplicates
    pub fn upsert(&mut self, item: ItemRecord) -> Upsert {
        match self.items.iter_mut().find(|i| i.same_item(&item)) {
            Some(existing) => {
                if existing.absorb(&item) {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
            None => {
                self.items.push(item);
                Upsert::Added
            }
        }
    }

    /// Replace the item list with an authoritative one. Incoming order wins;
    /// each incoming item keeps whatever richer data the bucket already had
    /// for it. Returns true if the list changed.
    pub fn replace_items(&mut self, incoming: Vec<ItemRecord>) -> bool {
        let mut merged: Vec<ItemRecord> = Vec::with_capacity(incoming.len());
        for item in incoming {
            if let Some(dup) = merged.iter_mut().find(|m| m.same_item(&item)) {
                dup.absorb(&item);
                continue;
            }
            let record = match self.find(&item) {
                Some(previous) => {
                    let mut base = previous.clone();
                    base.absorb(&item);
                    base
                }
                None => item,
            };
            merged.push(record);
        }

        if merged == self.items {
            false
        } else {
            self.items = merged;
            true
        }
    }
}

/// Category buckets in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryMap {
    buckets: Vec<CategoryBucket>,
}

impl CategoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from wire categories
    pub fn from_wire(categories: Vec<(String, Vec<MenuItem>)>) -> Self {
        let mut map = Self::new();
        for (name, items) in categories {
            let records = items
                .into_iter()
                .enumerate()
                .map(|(i, item)| ItemRecord::from_wire(&name, i, item))
                .collect();
            map.get_or_insert(&name).0.replace_items(records);
        }
        map
    }

    pub fn get(&self, name: &str) -> Option<&CategoryBucket> {
        self.buckets.iter().find(|b| b.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CategoryBucket> {
        self.buckets.iter_mut().find(|b| b.name == name)
    }

    /// Bucket for `name`, created at the end if missing. The flag is true
    /// when the bucket was created.
    pub fn get_or_insert(&mut self, name: &str) -> (&mut CategoryBucket, bool) {
        match self.buckets.iter().position(|b| b.name == name) {
            Some(index) => (&mut self.buckets[index], false),
            None => {
                self.buckets.push(CategoryBucket::new(name));
                let last = self.buckets.len() - 1;
                (&mut self.buckets[last], true)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryBucket> {
        self.buckets.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buckets.iter().map(|b| b.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn total_items(&self) -> usize {
        self.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Merge an authoritative map: categories it names are replaced (see
    /// [`CategoryBucket::replace_items`]), categories it omits are kept.
    /// Returns the number of categories that changed.
    pub fn merge_authoritative(&mut self, other: CategoryMap) -> usize {
        let mut changed = 0;
        for bucket in other.buckets {
            let (target, created) = self.get_or_insert(&bucket.name);
            if target.replace_items(bucket.items) || created {
                changed += 1;
            }
        }
        changed
    }

    /// Mutable access to every bucket
    pub fn buckets_mut(&mut self) -> impl Iterator<Item = &mut CategoryBucket> {
        self.buckets.iter_mut()
    }
}
