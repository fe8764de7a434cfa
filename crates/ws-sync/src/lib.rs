//! The sync execution pipeline: the orchestrating engine, the structured
//! execution logger, and conflict detection/resolution.

pub mod conflict;
pub mod engine;
pub mod logger;

pub use engine::{
    CancelFlag, ItemAction, ItemOutcome, PreviewAction, PreviewItem, SyncEngine, SyncPreview,
    SyncReport,
};
pub use logger::ExecutionLog;
