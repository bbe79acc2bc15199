//! Progress aggregation
//!
//! Folds the ordered stream of stage events for one session into a single
//! [`AggregatorState`]:
//! - stale events (stage below the current one) only touch their stage record
//! - stage 2/3 payloads merge category lists
//! - stage 4 payloads drive the per-category enrichment state machine
//! - stage 5 payloads attach image urls
//! - stage 6 (or a recovered failure) freezes the session
//!
//! Applying the same event twice leaves the state unchanged, and every
//! applied event reports exactly the [`SessionUpdate`]s it caused.

mod enrichment;

use crate::images::{ImageMatcher, ImageUrlCache};
use crate::models::{CategoryMap, ItemRecord, PipelineStage, Session, StageTable, STAGE_COUNT};
use crate::resolver;
use chrono::Utc;
use menusync_common::events::{
    CategoryItems, ImageEntry, SessionUpdate, StageEvent, StagePayload, StageStatus,
};
use menusync_common::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use resolver::ItemStatus;

/// Everything known about one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorState {
    pub session: Session,
    pub stages: StageTable,
    pub ocr_text: Option<String>,
    /// Stage 2 output
    pub categorized: CategoryMap,
    /// Stage 3 output
    pub translated: CategoryMap,
    pub translation_complete: bool,
    /// Stage 4 realtime buckets (chunks appended, then replaced on completion)
    pub partial: CategoryMap,
    /// Category stage 4 is currently enriching
    pub processing_category: Option<String>,
    /// Whole-menu final list (sent by the server, or synthesized on recovery)
    pub final_menu: Option<CategoryMap>,
    /// `final_menu` came from the server rather than a recovery
    pub final_authoritative: bool,
    /// Matched image urls: category → item id → url
    pub image_urls: BTreeMap<String, BTreeMap<String, String>>,
    pub images_applied: bool,
    /// Every category name seen, in first-seen order (append-only)
    pub category_order: Vec<String>,
}

impl AggregatorState {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            stages: StageTable::new(),
            ocr_text: None,
            categorized: CategoryMap::new(),
            translated: CategoryMap::new(),
            translation_complete: false,
            partial: CategoryMap::new(),
            processing_category: None,
            final_menu: None,
            final_authoritative: false,
            image_urls: BTreeMap::new(),
            images_applied: false,
            category_order: Vec::new(),
        }
    }

    /// True if a category-level result exists that the given stage could
    /// fall back to
    pub fn has_partial_for(&self, stage: u8) -> bool {
        match stage {
            2 => self.categorized.total_items() > 0,
            3 => self.translated.total_items() > 0,
            4 => self.partial.total_items() > 0,
            5 | 6 => {
                self.final_menu.is_some()
                    || self.partial.total_items() > 0
                    || self.translated.total_items() > 0
            }
            _ => false,
        }
    }
}

/// Updates produced by one apply call
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub updates: Vec<SessionUpdate>,
    /// Session reached its terminal state during this call
    pub terminal: bool,
    /// Session failed without usable partial data
    pub fatal: Option<Error>,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        !self.updates.is_empty()
    }
}

/// Result of a recovery attempt
#[derive(Debug)]
pub enum Recovery {
    /// Session completed from partial data
    Degraded(ApplyOutcome),
    /// No partial data; session marked failed
    Failed(ApplyOutcome),
    /// Session was already terminal
    AlreadyTerminal,
}

pub struct ProgressAggregator {
    state: AggregatorState,
    matcher: ImageMatcher,
    cache: Option<Arc<ImageUrlCache>>,
}

impl ProgressAggregator {
    pub fn new(session: Session) -> Self {
        Self {
            state: AggregatorState::new(session),
            matcher: ImageMatcher::default(),
            cache: None,
        }
    }

    /// Continue from a previously captured state
    pub fn from_state(state: AggregatorState) -> Self {
        Self {
            state,
            matcher: ImageMatcher::default(),
            cache: None,
        }
    }

    pub fn with_matcher(mut self, matcher: ImageMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ImageUrlCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.state.session
    }

    pub fn cache(&self) -> Option<&ImageUrlCache> {
        self.cache.as_deref()
    }

    pub fn has_partial_for(&self, stage: u8) -> bool {
        self.state.has_partial_for(stage)
    }

    /// Reconciled status of one item
    pub fn stage_of(&self, category: &str, item_id: &str) -> ItemStatus {
        resolver::item_status(&self.state, category, item_id)
    }

    /// Record which backend is serving the session now
    pub fn set_backend(&mut self, backend: menusync_common::Backend) {
        self.state.session.backend = backend;
    }

    /// Fold one stage event into the state
    pub fn apply(&mut self, event: &StageEvent) -> ApplyOutcome {
        let mut out = ApplyOutcome::default();
        let session_id = self.state.session.id.clone();

        if self
            .state
            .stages
            .update(event.stage, event.status, &event.message)
        {
            out.updates.push(self.stage_changed(event.stage));
        }

        if self.state.session.terminal {
            debug!(
                session_id = %session_id,
                stage = event.stage,
                "Event after terminal state, stage record only"
            );
            return out;
        }

        if event.stage < self.state.session.current_stage {
            debug!(
                session_id = %session_id,
                stage = event.stage,
                current_stage = self.state.session.current_stage,
                "Stale event, stage record only"
            );
            return out;
        }

        if self.state.session.advance_stage(event.stage) {
            for stage in self.state.stages.close_before(event.stage) {
                out.updates.push(self.stage_changed(stage));
            }
        }

        match &event.payload {
            StagePayload::Ocr { text } => {
                if let Some(text) = text {
                    if self.state.ocr_text.as_ref() != Some(text) {
                        self.state.ocr_text = Some(text.clone());
                    }
                }
            }
            StagePayload::Categorized { categories } => {
                self.merge_list_stage(ListStage::Categorized, categories, &mut out);
            }
            StagePayload::Translated { categories } => {
                self.merge_list_stage(ListStage::Translated, categories, &mut out);
            }
            StagePayload::Enrichment(payload) => {
                enrichment::apply(self, payload, &mut out);
            }
            StagePayload::Images { images, final_menu } => {
                if let Some(menu) = final_menu {
                    self.apply_final_menu(menu, &mut out);
                }
                self.apply_images(images, &mut out);
            }
            StagePayload::Completed { final_menu } => {
                if let Some(menu) = final_menu {
                    self.apply_final_menu(menu, &mut out);
                }
            }
        }

        if event.stage == 3 && event.status == StageStatus::Completed {
            self.state.translation_complete = true;
        }

        if event.stage == STAGE_COUNT && event.status == StageStatus::Completed {
            self.state.processing_category = None;
            if self.state.session.mark_terminal(false) {
                info!(session_id = %session_id, "Session completed");
                out.terminal = true;
                out.updates.push(SessionUpdate::SessionCompleted {
                    session_id,
                    degraded: false,
                    timestamp: Utc::now(),
                });
            }
        } else if event.status == StageStatus::Error {
            let cause = Error::Pipeline {
                stage: event.stage,
                message: if event.message.is_empty() {
                    "pipeline reported an error".to_string()
                } else {
                    event.message.clone()
                },
            };
            match self.recover(&cause) {
                Recovery::Degraded(rec) => {
                    out.updates.extend(rec.updates);
                    out.terminal = true;
                }
                Recovery::Failed(rec) => {
                    out.updates.extend(rec.updates);
                    out.terminal = true;
                    out.fatal = Some(cause);
                }
                Recovery::AlreadyTerminal => {}
            }
        }

        out
    }

    /// Try to finish the session from partial data after `cause`.
    ///
    /// With partial data for the current stage, the best available view is
    /// frozen as a non-authoritative final menu and the session completes
    /// degraded. Without it, the session is marked failed.
    pub fn recover(&mut self, cause: &Error) -> Recovery {
        if self.state.session.terminal {
            return Recovery::AlreadyTerminal;
        }
        let session_id = self.state.session.id.clone();
        let stage = self.state.session.current_stage;
        let mut out = ApplyOutcome {
            terminal: true,
            ..Default::default()
        };

        if self.state.has_partial_for(stage) {
            let (source, best) = resolver::best_view(&self.state);
            let message = format!("Completed with partial results ({})", cause);
            warn!(
                session_id = %session_id,
                stage = stage,
                source = ?source,
                error = %cause,
                "Recovering session from partial data"
            );

            self.state.final_menu = Some(best);
            self.state.final_authoritative = false;
            self.state.processing_category = None;
            if stage > 0 && self.state.stages.force(stage, StageStatus::Completed, &message) {
                out.updates.push(self.stage_changed(stage));
            }
            if stage != STAGE_COUNT
                && self
                    .state
                    .stages
                    .force(STAGE_COUNT, StageStatus::Completed, &message)
            {
                out.updates.push(self.stage_changed(STAGE_COUNT));
            }
            self.state.session.current_stage = STAGE_COUNT;
            self.state.session.mark_terminal(true);
            out.updates.push(SessionUpdate::SessionCompleted {
                session_id,
                degraded: true,
                timestamp: Utc::now(),
            });
            Recovery::Degraded(out)
        } else {
            warn!(
                session_id = %session_id,
                stage = stage,
                error = %cause,
                "No partial data to recover from, session failed"
            );
            self.fail_into(cause, &mut out);
            Recovery::Failed(out)
        }
    }

    /// Mark the session failed without trying partial data. Returns `None`
    /// if the session was already terminal.
    pub fn fail(&mut self, cause: &Error) -> Option<ApplyOutcome> {
        if self.state.session.terminal {
            return None;
        }
        warn!(
            session_id = %self.state.session.id,
            stage = self.state.session.current_stage,
            error = %cause,
            "Session failed"
        );
        let mut out = ApplyOutcome {
            terminal: true,
            ..Default::default()
        };
        self.fail_into(cause, &mut out);
        Some(out)
    }

    fn fail_into(&mut self, cause: &Error, out: &mut ApplyOutcome) {
        let stage = self.state.session.current_stage;
        if stage > 0
            && self
                .state
                .stages
                .force(stage, StageStatus::Error, &cause.to_string())
        {
            out.updates.push(self.stage_changed(stage));
        }
        self.state.session.mark_failed(cause.to_string());
        out.updates.push(SessionUpdate::SessionFailed {
            session_id: self.state.session.id.clone(),
            stage: cause.stage().or(Some(stage)).filter(|s| *s > 0),
            error: cause.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn stage_changed(&self, stage: u8) -> SessionUpdate {
        let (status, message) = self
            .state
            .stages
            .get(stage)
            .map(|r| (r.status, r.message.clone()))
            .unwrap_or((StageStatus::Pending, String::new()));
        SessionUpdate::StageChanged {
            session_id: self.state.session.id.clone(),
            stage,
            status,
            message,
            timestamp: Utc::now(),
        }
    }

    /// Add `name` to the category registry, reporting first sight
    pub(crate) fn register_category(&mut self, name: &str, out: &mut ApplyOutcome) {
        if self.state.category_order.iter().any(|c| c == name) {
            return;
        }
        self.state.category_order.push(name.to_string());
        out.updates.push(SessionUpdate::CategoryDiscovered {
            session_id: self.state.session.id.clone(),
            category: name.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn merge_list_stage(&mut self, which: ListStage, categories: &CategoryItems, out: &mut ApplyOutcome) {
        if categories.is_empty() {
            return;
        }
        for (name, _) in categories {
            self.register_category(name, out);
        }
        let incoming = CategoryMap::from_wire(categories.clone());
        let target = match which {
            ListStage::Categorized => &mut self.state.categorized,
            ListStage::Translated => &mut self.state.translated,
        };
        let changed = target.merge_authoritative(incoming);
        if changed > 0 {
            debug!(
                session_id = %self.state.session.id,
                stage = ?which,
                categories_changed = changed,
                "Merged category lists"
            );
        }
    }

    pub(crate) fn apply_final_menu(&mut self, menu: &CategoryItems, out: &mut ApplyOutcome) {
        for (name, _) in menu {
            self.register_category(name, out);
        }
        let incoming = CategoryMap::from_wire(menu.clone());
        let was_authoritative = self.state.final_authoritative;
        let target = self.state.final_menu.get_or_insert_with(CategoryMap::new);
        let changed = target.merge_authoritative(incoming);
        self.state.final_authoritative = true;
        self.state.processing_category = None;

        if changed > 0 || !was_authoritative {
            let (categories, items) = (target.len(), target.total_items());
            info!(
                session_id = %self.state.session.id,
                categories = categories,
                items = items,
                "Final menu received"
            );
            out.updates.push(SessionUpdate::FinalMenuReceived {
                session_id: self.state.session.id.clone(),
                categories,
                items,
                timestamp: Utc::now(),
            });
        }
    }

    fn apply_images(&mut self, images: &[(String, Vec<ImageEntry>)], out: &mut ApplyOutcome) {
        if images.is_empty() {
            return;
        }
        let all_entries: Vec<ImageEntry> = images.iter().flat_map(|(_, e)| e.iter().cloned()).collect();
        let (_, view) = resolver::best_view(&self.state);

        let mut matched = 0usize;
        let mut unmatched = 0usize;
        let mut changed = false;

        for bucket in view.iter() {
            let candidates: &[ImageEntry] = images
                .iter()
                .find(|(c, _)| c.eq_ignore_ascii_case(&bucket.name))
                .map(|(_, e)| e.as_slice())
                .unwrap_or(&all_entries);

            for item in &bucket.items {
                let found = self
                    .matcher
                    .best_match(item.display_name(), candidates)
                    .or_else(|| self.matcher.best_match(&item.source_text, candidates));
                let Some(found) = found else {
                    unmatched += 1;
                    continue;
                };
                matched += 1;
                let url = found.entry.image_url.clone();
                if let Some(cache) = &self.cache {
                    cache.insert(&bucket.name, item.display_name(), url.clone());
                }
                let slot = self
                    .state
                    .image_urls
                    .entry(bucket.name.clone())
                    .or_default();
                if slot.get(&item.id) != Some(&url) {
                    slot.insert(item.id.clone(), url);
                    changed = true;
                }
            }
        }

        if changed || !self.state.images_applied {
            self.state.images_applied = true;
            debug!(
                session_id = %self.state.session.id,
                matched = matched,
                unmatched = unmatched,
                "Merged image urls"
            );
            out.updates.push(SessionUpdate::ImagesMerged {
                session_id: self.state.session.id.clone(),
                matched,
                unmatched,
                timestamp: Utc::now(),
            });
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut AggregatorState {
        &mut self.state
    }
}

#[derive(Debug, Clone, Copy)]
enum ListStage {
    Categorized,
    Translated,
}

/// Label of a stage for log lines
pub fn stage_label(stage: u8) -> &'static str {
    PipelineStage::from_number(stage)
        .map(PipelineStage::label)
        .unwrap_or("Unknown")
}

/// Convert wire items for `category`; `first` is the position of the first
/// item within the category
pub(crate) fn records(category: &str, first: usize, items: &[menusync_common::events::MenuItem]) -> Vec<ItemRecord> {
    items
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, item)| ItemRecord::from_wire(category, first + i, item))
        .collect()
}
