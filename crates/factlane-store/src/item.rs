//! Domain models for the pipeline queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Pipeline stage of an item. `PostQueue` is the hand-off point to the
/// outbound posting collaborator; `Completed` and `Rejected` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Triage,
    Research,
    Response,
    Editorial,
    PostQueue,
    Completed,
    Rejected,
}

/// The analysis stages a worker loop can be registered for, in pipeline order.
pub const ANALYSIS_STAGES: [Stage; 4] =
    [Stage::Triage, Stage::Research, Stage::Response, Stage::Editorial];

/// Every stage a worker loop may poll, including the posting hand-off.
pub const WORKABLE_STAGES: [Stage; 5] = [
    Stage::Triage,
    Stage::Research,
    Stage::Response,
    Stage::Editorial,
    Stage::PostQueue,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Research => "research",
            Self::Response => "response",
            Self::Editorial => "editorial",
            Self::PostQueue => "post_queue",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value.trim() {
            "triage" => Ok(Self::Triage),
            "research" => Ok(Self::Research),
            "response" => Ok(Self::Response),
            "editorial" => Ok(Self::Editorial),
            "post_queue" => Ok(Self::PostQueue),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            other => Err(StoreError::UnknownStage(other.to_string())),
        }
    }

    /// Stages whose artifacts feed this stage's handler as prior context.
    pub fn prior_stages(&self) -> &'static [Stage] {
        match self {
            Self::Research => &[Stage::Triage],
            Self::Response => &[Stage::Triage, Stage::Research],
            Self::Editorial => &[Stage::Triage, Stage::Research, Stage::Response],
            Self::PostQueue => &[Stage::Triage, Stage::Research, Stage::Response, Stage::Editorial],
            _ => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue-level status of an item within its current stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value.trim() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(StoreError::UnknownStage(other.to_string())),
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default priority applied when ingestion metadata does not carry one.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Submission handed over by the ingestion collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewItem {
    pub source_id: String,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    pub created_utc: DateTime<Utc>,
    #[serde(default = "default_metadata")]
    pub metadata: Value,
}

fn default_metadata() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A submission flowing through the pipeline, as persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub body: String,
    pub url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub stage: Stage,
    pub status: ItemStatus,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub inserted_at: DateTime<Utc>,
}

impl Item {
    /// Claim-ordering priority from metadata, defaulting to 5.
    pub fn priority(&self) -> i64 {
        self.metadata
            .get("priority")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Handler decision applied atomically with the stage artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    Advance { next: Stage },
    Reject,
    Complete,
    Retry { reason: String },
}

impl Directive {
    /// Parse the `next_stage` field of a `write_to_database` tool call.
    /// `completed` and `rejected` map onto their terminal directives.
    pub fn from_next_stage(next_stage: Option<&str>) -> Result<Self, StoreError> {
        match next_stage {
            None => Ok(Self::Complete),
            Some("completed") => Ok(Self::Complete),
            Some("rejected") => Ok(Self::Reject),
            Some(raw) => {
                let next = Stage::parse(raw)
                    .map_err(|_| StoreError::InvalidDirective(format!("next_stage `{}`", raw)))?;
                if matches!(next, Stage::Triage | Stage::Completed | Stage::Rejected) {
                    return Err(StoreError::InvalidDirective(format!(
                        "cannot advance to `{}`",
                        next
                    )));
                }
                Ok(Self::Advance { next })
            }
        }
    }
}

/// Output of one handler invocation, persisted append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageArtifact {
    pub artifact_id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Kind of remote model endpoint a stage is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Managed API reached with a bearer secret resolved from the environment.
    Hosted,
    /// Self-hosted OpenAI-compatible endpoint, no auth by default.
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value.trim() {
            "hosted" => Ok(Self::Hosted),
            "custom" => Ok(Self::Custom),
            other => Err(StoreError::UnknownProvider(other.to_string())),
        }
    }
}

/// Per-stage endpoint configuration, live-updatable from the control API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointBinding {
    pub stage: Stage,
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub max_concurrent: usize,
    pub timeout_seconds: u64,
    pub auth_env_key: Option<String>,
}

/// Why an item landed in the fallback log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    EndpointUnreachable,
    DeadlineExceeded,
    Endpoint5xx,
    ModelProtocolError,
    ToolRateLimited,
    RetryExhausted,
    HandlerError,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointUnreachable => "endpoint_unreachable",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Endpoint5xx => "endpoint_5xx",
            Self::ModelProtocolError => "model_protocol_error",
            Self::ToolRateLimited => "tool_rate_limited",
            Self::RetryExhausted => "retry_exhausted",
            Self::HandlerError => "handler_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "endpoint_unreachable" => Some(Self::EndpointUnreachable),
            "deadline_exceeded" => Some(Self::DeadlineExceeded),
            "endpoint_5xx" => Some(Self::Endpoint5xx),
            "model_protocol_error" => Some(Self::ModelProtocolError),
            "tool_rate_limited" => Some(Self::ToolRateLimited),
            "retry_exhausted" => Some(Self::RetryExhausted),
            "handler_error" => Some(Self::HandlerError),
            _ => None,
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStatus {
    Active,
    Resolved,
}

impl FallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
        }
    }
}

/// Append-only record of an item that needs operator attention.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub event_id: i64,
    pub item_id: i64,
    pub stage: Stage,
    pub reason: FallbackReason,
    pub detail: Option<String>,
    pub status: FallbackStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Aggregate row of the queue-stats query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageStatusStat {
    pub stage: Stage,
    pub status: ItemStatus,
    pub count: u64,
    pub avg_retry_count: f64,
    pub oldest: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_roundtrip() {
        for stage in [
            Stage::Triage,
            Stage::Research,
            Stage::Response,
            Stage::Editorial,
            Stage::PostQueue,
            Stage::Completed,
            Stage::Rejected,
        ] {
            assert_eq!(Stage::parse(stage.as_str()).expect("parse"), stage);
        }
        assert!(Stage::parse("postqueue").is_err());
    }

    #[test]
    fn prior_stages_accumulate_in_pipeline_order() {
        assert!(Stage::Triage.prior_stages().is_empty());
        assert_eq!(Stage::Research.prior_stages(), &[Stage::Triage]);
        assert_eq!(
            Stage::Editorial.prior_stages(),
            &[Stage::Triage, Stage::Research, Stage::Response]
        );
    }

    #[test]
    fn directive_from_next_stage_maps_terminals() {
        assert_eq!(
            Directive::from_next_stage(Some("research")).expect("advance"),
            Directive::Advance { next: Stage::Research }
        );
        assert_eq!(
            Directive::from_next_stage(Some("completed")).expect("complete"),
            Directive::Complete
        );
        assert_eq!(
            Directive::from_next_stage(Some("rejected")).expect("reject"),
            Directive::Reject
        );
        assert_eq!(Directive::from_next_stage(None).expect("none"), Directive::Complete);
        assert!(Directive::from_next_stage(Some("triage")).is_err());
        assert!(Directive::from_next_stage(Some("nonsense")).is_err());
    }

    #[test]
    fn item_priority_defaults_to_five() {
        let mut item = Item {
            id: 1,
            source_id: "abc".into(),
            title: "t".into(),
            author: "a".into(),
            body: String::new(),
            url: None,
            created_utc: Utc::now(),
            stage: Stage::Triage,
            status: ItemStatus::Pending,
            assigned_to: None,
            assigned_at: None,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            last_retry_at: None,
            metadata: serde_json::json!({}),
            inserted_at: Utc::now(),
        };
        assert_eq!(item.priority(), 5);
        item.metadata = serde_json::json!({"priority": 9});
        assert_eq!(item.priority(), 9);
    }
}
