//! Session and stage bookkeeping
//!
//! A session moves through six pipeline stages:
//! OCR → CATEGORIZE → TRANSLATE → ENRICH → IMAGE → COMPLETE
//!
//! `current_stage` only moves forward (0 means "nothing received yet"); the
//! only way back is dropping the session and starting a new one.

use chrono::{DateTime, Utc};
use menusync_common::events::StageStatus;
use menusync_common::Backend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of pipeline stages
pub const STAGE_COUNT: u8 = 6;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineStage {
    /// Text recognition on the uploaded image
    Ocr = 1,
    /// Raw items grouped into categories
    Categorize = 2,
    /// Item names translated
    Translate = 3,
    /// Descriptions generated, one category at a time
    Enrich = 4,
    /// Dish images looked up
    Image = 5,
    /// Pipeline finished
    Complete = 6,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::Ocr,
        PipelineStage::Categorize,
        PipelineStage::Translate,
        PipelineStage::Enrich,
        PipelineStage::Image,
        PipelineStage::Complete,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(stage: u8) -> Option<Self> {
        Self::ALL.get(usize::from(stage).checked_sub(1)?).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineStage::Ocr => "OCR",
            PipelineStage::Categorize => "Categorize",
            PipelineStage::Translate => "Translate",
            PipelineStage::Enrich => "Enrich",
            PipelineStage::Image => "Image",
            PipelineStage::Complete => "Complete",
        }
    }
}

/// Status and last message of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: u8,
    pub status: StageStatus,
    pub message: String,
}

/// One record per stage, keyed by stage number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTable {
    records: BTreeMap<u8, StageRecord>,
}

impl Default for StageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTable {
    /// All six stages, pending
    pub fn new() -> Self {
        let records = PipelineStage::ALL
            .iter()
            .map(|s| {
                let stage = s.number();
                (
                    stage,
                    StageRecord {
                        stage,
                        status: StageStatus::Pending,
                        message: String::new(),
                    },
                )
            })
            .collect();
        Self { records }
    }

    pub fn get(&self, stage: u8) -> Option<&StageRecord> {
        self.records.get(&stage)
    }

    /// Record a status report for `stage`. Returns true if the record changed.
    ///
    /// A stage that already reached a final status (completed or error)
    /// keeps it, and a status never moves back down its rank; only a
    /// report with the same status can refresh the message then.
    pub fn update(&mut self, stage: u8, status: StageStatus, message: &str) -> bool {
        let Some(record) = self.records.get_mut(&stage) else {
            return false;
        };

        let current_rank = record.status.rank();
        let accepted = record.status == status
            || (current_rank < 2 && status.rank() >= current_rank);
        if !accepted {
            return false;
        }

        let mut changed = false;
        if record.status != status {
            record.status = status;
            changed = true;
        }
        if !message.is_empty() && record.message != message {
            record.message = message.to_string();
            changed = true;
        }
        changed
    }

    /// Overwrite a record regardless of its current status (used when the
    /// client itself decides the outcome of a stage)
    pub fn force(&mut self, stage: u8, status: StageStatus, message: &str) -> bool {
        let Some(record) = self.records.get_mut(&stage) else {
            return false;
        };
        if record.status == status && record.message == message {
            return false;
        }
        record.status = status;
        record.message = message.to_string();
        true
    }

    /// Mark every stage below `stage` that has not reached a final status
    /// completed (a later stage running implies the earlier ones finished)
    pub fn close_before(&mut self, stage: u8) -> Vec<u8> {
        let mut closed = Vec::new();
        for (number, record) in self.records.range_mut(..stage) {
            if record.status.rank() < 2 {
                record.status = StageStatus::Completed;
                closed.push(*number);
            }
        }
        closed
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageRecord> {
        self.records.values()
    }
}

/// One client-side pipeline session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Server-assigned session identifier
    pub id: String,

    /// Backend currently serving the session
    pub backend: Backend,

    /// Highest stage seen so far (0 before the first event)
    pub current_stage: u8,

    /// Session start time
    pub created_at: DateTime<Utc>,

    /// Set once, when the session completes or fails
    pub terminal: bool,

    /// Completed from partial data after a recoverable failure
    pub degraded: bool,

    /// Unrecoverable error, if the session failed
    pub failure: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, backend: Backend) -> Self {
        Self {
            id: id.into(),
            backend,
            current_stage: 0,
            created_at: Utc::now(),
            terminal: false,
            degraded: false,
            failure: None,
        }
    }

    /// Move `current_stage` forward to `stage`. Returns true if it moved.
    pub fn advance_stage(&mut self, stage: u8) -> bool {
        if stage > self.current_stage && stage <= STAGE_COUNT {
            self.current_stage = stage;
            true
        } else {
            false
        }
    }

    /// Freeze the session. Returns false if it was already terminal.
    pub fn mark_terminal(&mut self, degraded: bool) -> bool {
        if self.terminal {
            return false;
        }
        self.terminal = true;
        self.degraded = degraded;
        true
    }

    /// Freeze the session with an error. Returns false if already terminal.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> bool {
        if self.terminal {
            return false;
        }
        self.terminal = true;
        self.failure = Some(error.into());
        true
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}
