//! Stage 4 enrichment state machine
//!
//! Per category: idle → processing (pointer set) → receiving chunks →
//! completed (authoritative list). The processing pointer may only move to
//! a category that has not completed yet, and chunks addressed to a
//! completed category are dropped.

use super::{records, ApplyOutcome, ProgressAggregator};
use crate::models::Upsert;
use chrono::Utc;
use menusync_common::events::{EnrichmentPayload, SessionUpdate};
use tracing::{debug, warn};

pub(super) fn apply(agg: &mut ProgressAggregator, payload: &EnrichmentPayload, out: &mut ApplyOutcome) {
    if let Some(category) = &payload.processing_category {
        set_processing(agg, category, out);
    }
    if let Some(chunk) = &payload.chunk_result {
        let target = payload
            .chunk_category
            .clone()
            .or_else(|| agg.state().processing_category.clone());
        match target {
            Some(category) => append_chunk(agg, &category, chunk, out),
            None => warn!(
                session_id = %agg.session().id,
                items = chunk.len(),
                "Chunk without a processing category, dropped"
            ),
        }
    }
    if let Some(category) = &payload.category_completed {
        complete_category(agg, category, payload.completed_category_items.as_deref(), out);
    }
    if let Some(menu) = &payload.final_menu {
        agg.apply_final_menu(menu, out);
    }
}

fn set_processing(agg: &mut ProgressAggregator, category: &str, out: &mut ApplyOutcome) {
    let already_done = agg
        .state()
        .partial
        .get(category)
        .map(|b| b.completed)
        .unwrap_or(false);
    if already_done {
        debug!(
            session_id = %agg.session().id,
            category = %category,
            "Ignoring processing pointer for completed category"
        );
        return;
    }
    if agg.state().processing_category.as_deref() == Some(category) {
        return;
    }

    agg.register_category(category, out);
    let state = agg.state_mut();
    state.partial.get_or_insert(category);
    state.processing_category = Some(category.to_string());
    out.updates.push(SessionUpdate::CategoryProcessing {
        session_id: state.session.id.clone(),
        category: category.to_string(),
        timestamp: Utc::now(),
    });
}

fn append_chunk(
    agg: &mut ProgressAggregator,
    category: &str,
    chunk: &[menusync_common::events::MenuItem],
    out: &mut ApplyOutcome,
) {
    if agg
        .state()
        .partial
        .get(category)
        .map(|b| b.completed)
        .unwrap_or(false)
    {
        debug!(
            session_id = %agg.session().id,
            category = %category,
            "Chunk for completed category, dropped"
        );
        return;
    }

    agg.register_category(category, out);
    let state = agg.state_mut();
    let (bucket, _) = state.partial.get_or_insert(category);
    let mut added = 0usize;
    let mut touched = false;
    // Chunks continue the category's numbering
    for item in records(category, bucket.items.len(), chunk) {
        match bucket.upsert(item) {
            Upsert::Added => added += 1,
            Upsert::Updated => touched = true,
            Upsert::Unchanged => {}
        }
    }
    let total = bucket.items.len();

    if added > 0 || touched {
        debug!(
            session_id = %state.session.id,
            category = %category,
            added = added,
            total = total,
            "Appended chunk"
        );
        out.updates.push(SessionUpdate::ItemsAppended {
            session_id: state.session.id.clone(),
            category: category.to_string(),
            added,
            total,
            timestamp: Utc::now(),
        });
    }
}

fn complete_category(
    agg: &mut ProgressAggregator,
    category: &str,
    items: Option<&[menusync_common::events::MenuItem]>,
    out: &mut ApplyOutcome,
) {
    agg.register_category(category, out);
    let state = agg.state_mut();
    let (bucket, _) = state.partial.get_or_insert(category);
    let was_completed = bucket.completed;

    // Without an explicit list the chunks received so far are the final list
    let replaced = match items {
        Some(items) => bucket.replace_items(records(category, 0, items)),
        None => false,
    };
    bucket.completed = true;
    let item_count = bucket.items.len();

    if state.processing_category.as_deref() == Some(category) {
        state.processing_category = None;
    }

    if !was_completed || replaced {
        debug!(
            session_id = %state.session.id,
            category = %category,
            items = item_count,
            "Category completed"
        );
        out.updates.push(SessionUpdate::CategoryCompleted {
            session_id: state.session.id.clone(),
            category: category.to_string(),
            item_count,
            timestamp: Utc::now(),
        });
    }
}
