use thiserror::Error;

use factlane_store::{FallbackReason, StoreError};

/// Errors surfaced by handlers, the tool surface and the endpoint protocol.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("endpoint returned status {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("model protocol error: {0}")]
    Protocol(String),
    #[error("tool-call cap of {0} exceeded")]
    ToolLoopExceeded(usize),
    #[error("search provider rate limited")]
    RateLimited,
    #[error("result already recorded for this attempt")]
    AlreadyDecided,
    #[error("handler finished without calling write_result")]
    NoDecision,
    #[error("secret env var `{0}` is not set")]
    MissingSecret(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AgentError {
    /// Classify a reqwest failure into the transient-upstream taxonomy.
    pub(crate) fn from_http(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::DeadlineExceeded
        } else if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }

    /// The fallback-log reason this failure maps to when retries exhaust.
    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            Self::Unreachable(_) => FallbackReason::EndpointUnreachable,
            Self::Endpoint { status, .. } if *status >= 500 => FallbackReason::Endpoint5xx,
            Self::Endpoint { .. } => FallbackReason::EndpointUnreachable,
            Self::DeadlineExceeded => FallbackReason::DeadlineExceeded,
            Self::Protocol(_) | Self::ToolLoopExceeded(_) => FallbackReason::ModelProtocolError,
            Self::RateLimited => FallbackReason::ToolRateLimited,
            _ => FallbackReason::HandlerError,
        }
    }

    /// Short machine-readable tag used as the implicit-retry reason.
    pub fn retry_reason(&self) -> String {
        match self {
            Self::Unreachable(_) => "endpoint_unreachable".to_string(),
            Self::Endpoint { status, .. } => format!("endpoint_{}", status),
            Self::DeadlineExceeded => "deadline_exceeded".to_string(),
            Self::Protocol(detail) => format!("model_protocol_error: {}", detail),
            Self::ToolLoopExceeded(cap) => format!("tool_loop_exceeded_{}", cap),
            Self::RateLimited => "tool_rate_limited".to_string(),
            Self::NoDecision => "handler did not produce result".to_string(),
            other => other.to_string(),
        }
    }
}
