//! Incremental, resumable correction of labels on a remote tracker.

mod checkpoint;
mod engine;
mod labels;

pub use checkpoint::{Checkpoint, CheckpointStore, StoreCheckpoints};
pub use engine::{
  Action, ActionError, ItemOutcome, LabelTarget, Page, PagedSource, SourceItem, SyncEngine,
  SyncReport,
};
pub use labels::{LabelDiff, LabelMapping};
