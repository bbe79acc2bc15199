//! Session migration records and copy validation
//!
//! A migration copies a session's state to the target backend, reads it
//! back and compares the two before the session's backend pointer moves.
//! Any mismatch leaves the session where it was.

use crate::aggregator::AggregatorState;
use crate::resolver::{self, ItemStatus};
use chrono::{DateTime, Utc};
use menusync_common::{Backend, Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

/// One migration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migration_id: Uuid,
    pub session_id: String,
    pub from: Backend,
    pub to: Backend,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: MigrationOutcome,
}

impl MigrationRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == MigrationOutcome::Succeeded
    }
}

/// Category name → (item id, status) in view order
type Fingerprint = Vec<(String, Vec<(String, ItemStatus)>)>;

fn fingerprint(state: &AggregatorState) -> Fingerprint {
    resolver::resolve(state, None)
        .categories
        .into_iter()
        .map(|c| {
            let items = c
                .items
                .into_iter()
                .map(|i| {
                    let status = i.flags.status();
                    (i.item.id, status)
                })
                .collect();
            (c.name, items)
        })
        .collect()
}

/// Check that `copy` reads back as the same menu as `source`: same
/// categories, same item counts, same per-item status.
pub fn validate_copy(source: &AggregatorState, copy: &AggregatorState) -> Result<()> {
    if source.session.id != copy.session.id {
        return Err(Error::Consistency(format!(
            "session id mismatch: {} vs {}",
            source.session.id, copy.session.id
        )));
    }
    if source.session.current_stage != copy.session.current_stage {
        return Err(Error::Consistency(format!(
            "stage mismatch: {} vs {}",
            source.session.current_stage, copy.session.current_stage
        )));
    }

    let expected = fingerprint(source);
    let actual = fingerprint(copy);
    if expected.len() != actual.len() {
        return Err(Error::Consistency(format!(
            "category count mismatch: {} vs {}",
            expected.len(),
            actual.len()
        )));
    }
    for ((name, items), (copy_name, copy_items)) in expected.iter().zip(actual.iter()) {
        if name != copy_name {
            return Err(Error::Consistency(format!(
                "category order mismatch: '{}' vs '{}'",
                name, copy_name
            )));
        }
        if items.len() != copy_items.len() {
            return Err(Error::Consistency(format!(
                "item count mismatch in '{}': {} vs {}",
                name,
                items.len(),
                copy_items.len()
            )));
        }
        if let Some(((id, status), (_, copy_status))) = items
            .iter()
            .zip(copy_items.iter())
            .find(|((id, status), (copy_id, copy_status))| id != copy_id || status != copy_status)
        {
            return Err(Error::Consistency(format!(
                "item '{}' in '{}' differs: {:?} vs {:?}",
                id, name, status, copy_status
            )));
        }
    }
    Ok(())
}
