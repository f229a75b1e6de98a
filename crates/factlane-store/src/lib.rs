//! Durable store for the factlane content pipeline.
//!
//! Everything the orchestrator shares between workers, the recovery task and
//! the control API lives here: items, per-stage artifacts, endpoint bindings,
//! queue settings, pause flags and the fallback log. All mutations go through
//! [`SqliteQueueStore`], which serializes writes on a single connection and
//! keeps the artifact-plus-transition write atomic.

pub mod error;
pub mod item;
pub mod store;

pub use error::StoreError;
pub use item::{
    Directive, EndpointBinding, FallbackReason, FallbackRecord, FallbackStatus, Item, ItemStatus,
    NewItem, ProviderKind, Stage, StageArtifact, StageStatusStat, ANALYSIS_STAGES,
    WORKABLE_STAGES,
};
pub use store::{
    is_recognized_setting, SqliteQueueStore, SETTING_MAX_RETRIES, SETTING_POLL_INTERVAL_PREFIX,
    SETTING_RETRY_TIMEOUT, SETTING_STUCK_THRESHOLD,
};
