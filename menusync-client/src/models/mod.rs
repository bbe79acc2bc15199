//! Data models

pub mod menu;
pub mod session;

pub use menu::{CategoryBucket, CategoryMap, ItemRecord, Upsert};
pub use session::{PipelineStage, Session, StageRecord, StageTable, STAGE_COUNT};
