//! Snapshot resolution
//!
//! Turns an [`AggregatorState`] into the single menu view a consumer should
//! render. Source priority, highest first:
//! 1. Final menu with images
//! 2. Final menu
//! 3. Realtime partial data merged over the translated list
//! 4. Translated list only
//! 5. Categorized list only
//!
//! Resolution is pure: it reads the state and never changes it.

use crate::aggregator::AggregatorState;
use crate::images::ImageUrlCache;
use crate::models::{CategoryBucket, CategoryMap, ItemRecord, StageRecord, STAGE_COUNT};
use menusync_common::events::StageStatus;
use menusync_common::Backend;
use serde::{Deserialize, Serialize};

/// Where the categories of a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    None,
    CategorizedOnly,
    TranslatedOnly,
    MergedPartial,
    FinalMenu,
    FinalWithImages,
}

/// Reconciled status of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Unknown,
    Categorized,
    Translated,
    Processing,
    PartiallyComplete,
    Complete,
}

/// Per-item display flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFlags {
    pub is_translated: bool,
    pub is_complete: bool,
    pub is_partially_complete: bool,
    pub is_currently_processing: bool,
}

impl ItemFlags {
    pub fn status(&self) -> ItemStatus {
        if self.is_complete {
            ItemStatus::Complete
        } else if self.is_partially_complete {
            ItemStatus::PartiallyComplete
        } else if self.is_currently_processing {
            ItemStatus::Processing
        } else if self.is_translated {
            ItemStatus::Translated
        } else {
            ItemStatus::Categorized
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemView {
    #[serde(flatten)]
    pub item: ItemRecord,
    #[serde(flatten)]
    pub flags: ItemFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryProgress {
    pub expected_items: usize,
    pub enriched_items: usize,
    pub completed: bool,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryView {
    pub name: String,
    pub items: Vec<ItemView>,
    pub processing: bool,
    pub progress: CategoryProgress,
}

/// Everything a consumer needs to render one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MenuSnapshot {
    pub session_id: String,
    pub backend: Backend,
    pub source: SnapshotSource,
    pub current_stage: u8,
    pub terminal: bool,
    pub degraded: bool,
    pub failure: Option<String>,
    pub translation_complete: bool,
    pub processing_category: Option<String>,
    pub categories: Vec<CategoryView>,
    pub stages: Vec<StageRecord>,
    /// 0.0 - 100.0
    pub overall_percent: f64,
}

impl MenuSnapshot {
    pub fn item_count(&self) -> usize {
        self.categories.iter().map(|c| c.items.len()).sum()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryView> {
        self.categories.iter().find(|c| c.name == name)
    }
}

/// Resolve the consumer view of `state`.
///
/// Items without an image url are looked up in `cache` by category and name.
pub fn resolve(state: &AggregatorState, cache: Option<&ImageUrlCache>) -> MenuSnapshot {
    let (source, view) = best_view(state);

    let categories = view
        .iter()
        .map(|bucket| {
            let items: Vec<ItemView> = bucket
                .items
                .iter()
                .map(|item| {
                    let mut item = item.clone();
                    if item.image_url.is_none() {
                        if let Some(cache) = cache {
                            item.image_url = cache.get(&bucket.name, item.display_name());
                        }
                    }
                    let flags = flags_for(state, &bucket.name, &item);
                    ItemView { item, flags }
                })
                .collect();
            CategoryView {
                name: bucket.name.clone(),
                processing: is_processing(state, &bucket.name),
                progress: category_progress(state, bucket),
                items,
            }
        })
        .collect();

    MenuSnapshot {
        session_id: state.session.id.clone(),
        backend: state.session.backend,
        source,
        current_stage: state.session.current_stage,
        terminal: state.session.terminal,
        degraded: state.session.degraded,
        failure: state.session.failure.clone(),
        translation_complete: state.translation_complete,
        processing_category: state.processing_category.clone(),
        categories,
        stages: state.stages.iter().cloned().collect(),
        overall_percent: overall_percent(state),
    }
}

/// Highest-priority category view available, with matched image urls applied
pub fn best_view(state: &AggregatorState) -> (SnapshotSource, CategoryMap) {
    let merged = merged_view(state);

    let (source, mut view) = match &state.final_menu {
        Some(final_menu) => {
            let mut view = final_menu.clone();
            // Categories are never dropped from a snapshot once shown
            for bucket in merged.iter() {
                if view.get(&bucket.name).is_none() {
                    view.get_or_insert(&bucket.name)
                        .0
                        .replace_items(bucket.items.clone());
                }
            }
            let source = if state.images_applied {
                SnapshotSource::FinalWithImages
            } else {
                SnapshotSource::FinalMenu
            };
            (source, view)
        }
        None => {
            let source = if state.partial.total_items() > 0 {
                SnapshotSource::MergedPartial
            } else if state.translated.total_items() > 0 {
                SnapshotSource::TranslatedOnly
            } else if state.categorized.total_items() > 0 {
                SnapshotSource::CategorizedOnly
            } else {
                SnapshotSource::None
            };
            (source, merged)
        }
    };

    for bucket in view.buckets_mut() {
        let Some(urls) = state.image_urls.get(&bucket.name) else {
            continue;
        };
        for item in bucket.items.iter_mut() {
            if item.image_url.is_none() {
                item.image_url = urls.get(&item.id).cloned();
            }
        }
    }

    (source, view)
}

/// Per category: partial items win, translated (or categorized) items fill
/// the gaps. A completed partial bucket is the whole truth for its category.
fn merged_view(state: &AggregatorState) -> CategoryMap {
    let mut view = CategoryMap::new();
    for name in &state.category_order {
        let base = state
            .translated
            .get(name)
            .filter(|b| !b.items.is_empty())
            .or_else(|| state.categorized.get(name));
        let partial = state.partial.get(name);

        if base.is_none() && partial.is_none() {
            continue;
        }

        let mut items: Vec<ItemRecord> = match partial {
            Some(p) if p.completed => p.items.clone(),
            _ => base.map(|b| b.items.clone()).unwrap_or_default(),
        };
        if let Some(p) = partial.filter(|p| !p.completed) {
            for enriched in &p.items {
                match items.iter_mut().find(|i| i.same_item(enriched)) {
                    Some(existing) => {
                        existing.absorb(enriched);
                    }
                    None => items.push(enriched.clone()),
                }
            }
        }

        view.get_or_insert(name).0.items = items;
    }
    view
}

fn is_processing(state: &AggregatorState, category: &str) -> bool {
    !state.session.terminal && state.processing_category.as_deref() == Some(category)
}

fn partial_completed(state: &AggregatorState, category: &str) -> bool {
    state
        .partial
        .get(category)
        .map(|b| b.completed)
        .unwrap_or(false)
}

fn in_authoritative_final<'a>(state: &'a AggregatorState, category: &str) -> Option<&'a CategoryBucket> {
    if !state.final_authoritative {
        return None;
    }
    state.final_menu.as_ref().and_then(|m| m.get(category))
}

fn session_succeeded(state: &AggregatorState) -> bool {
    state.session.terminal && !state.session.degraded && state.session.failure.is_none()
}

fn flags_for(state: &AggregatorState, category: &str, item: &ItemRecord) -> ItemFlags {
    let partial = state.partial.get(category);
    let in_partial = partial.map(|b| b.find(item).is_some()).unwrap_or(false);
    let completed_in_partial = in_partial && partial_completed(state, category);
    let in_final = in_authoritative_final(state, category)
        .map(|b| b.find(item).is_some())
        .unwrap_or(false);

    let is_complete = completed_in_partial || in_final || session_succeeded(state);
    ItemFlags {
        is_translated: item.is_translated(),
        is_complete,
        is_partially_complete: in_partial && !is_complete,
        is_currently_processing: !is_complete && is_processing(state, category),
    }
}

/// Flags of one item in the current best view
pub fn item_flags(state: &AggregatorState, category: &str, item_id: &str) -> Option<ItemFlags> {
    let (_, view) = best_view(state);
    let item = view.get(category)?.find_by_id(item_id)?;
    Some(flags_for(state, category, item))
}

pub fn item_status(state: &AggregatorState, category: &str, item_id: &str) -> ItemStatus {
    item_flags(state, category, item_id)
        .map(|f| f.status())
        .unwrap_or(ItemStatus::Unknown)
}

fn category_progress(state: &AggregatorState, bucket: &CategoryBucket) -> CategoryProgress {
    let name = bucket.name.as_str();
    let expected = [
        state.categorized.get(name).map(|b| b.items.len()),
        state.translated.get(name).map(|b| b.items.len()),
        state.partial.get(name).map(|b| b.items.len()),
        Some(bucket.items.len()),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(0);

    let completed = partial_completed(state, name)
        || in_authoritative_final(state, name).is_some()
        || session_succeeded(state);
    let enriched = if completed {
        expected
    } else {
        state.partial.get(name).map(|b| b.items.len()).unwrap_or(0)
    };
    let percent = if completed {
        100.0
    } else if expected == 0 {
        0.0
    } else {
        (enriched as f64 / expected as f64 * 100.0).min(100.0)
    };

    CategoryProgress {
        expected_items: expected,
        enriched_items: enriched,
        completed,
        percent,
    }
}

/// Completed stages count fully; an active stage 4 counts by the share of
/// categories already completed
fn overall_percent(state: &AggregatorState) -> f64 {
    if session_succeeded(state) || (state.session.terminal && state.session.degraded) {
        return 100.0;
    }
    let completed = state
        .stages
        .iter()
        .filter(|r| r.status == StageStatus::Completed)
        .count() as f64;

    let enrich_share = match state.stages.get(4) {
        Some(r) if r.status == StageStatus::Active && !state.category_order.is_empty() => {
            let done = state
                .category_order
                .iter()
                .filter(|c| partial_completed(state, c))
                .count();
            done as f64 / state.category_order.len() as f64
        }
        _ => 0.0,
    };

    ((completed + enrich_share) / f64::from(STAGE_COUNT) * 100.0).min(100.0)
}
