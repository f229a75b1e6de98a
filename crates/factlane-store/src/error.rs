use thiserror::Error;

use crate::item::Stage;

/// Errors emitted by the queue store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite-level failure, wrapped with the operation that hit it.
    #[error("store driver error: {0}")]
    Driver(String),
    #[error("item not found: {0}")]
    NotFound(i64),
    #[error("item {0} is terminal at stage {1}")]
    Terminal(i64, Stage),
    #[error("invalid directive: {0}")]
    InvalidDirective(String),
    #[error("unknown setting key: {0}")]
    UnknownSetting(String),
    #[error("invalid value for setting `{key}`: {value}")]
    InvalidSettingValue { key: String, value: String },
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("unknown provider kind: {0}")]
    UnknownProvider(String),
}

impl StoreError {
    pub(crate) fn driver(op: &str, err: rusqlite::Error) -> Self {
        Self::Driver(format!("{}: {}", op, err))
    }
}
