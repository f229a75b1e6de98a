//! API DTOs for the control and observability surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use factlane_store::{
    EndpointBinding, FallbackRecord, Item, ItemStatus, Stage, StageArtifact, StageStatusStat,
};

#[derive(Clone, Debug, Serialize)]
pub struct ApiEnvelope<T> {
    pub meta: ApiMeta,
    pub request_id: String,
    pub data: T,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApiMeta {
    pub status: &'static str,
    pub api_version: &'static str,
}

impl ApiMeta {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            api_version: "v1",
        }
    }
}

/// Ingestion write contract.
#[derive(Clone, Debug, Deserialize)]
pub struct IngestItemRequest {
    pub source_id: String,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
    pub created_utc: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IngestItemResponse {
    pub item_id: Option<i64>,
    pub duplicate: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatusEntry {
    pub stage: Stage,
    pub available: bool,
    pub current_load: usize,
    pub max_concurrent: usize,
    pub paused: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatusResponse {
    pub stages: Vec<QueueStatusEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatsResponse {
    pub stats: Vec<StageStatusStat>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PauseResponse {
    pub stage: Stage,
    pub paused: bool,
}

/// Compact item listing row.
#[derive(Clone, Debug, Serialize)]
pub struct ItemSummary {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub stage: Stage,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub priority: i64,
    pub last_error: Option<String>,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&Item> for ItemSummary {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            source_id: item.source_id.clone(),
            title: item.title.clone(),
            stage: item.stage,
            status: item.status,
            retry_count: item.retry_count,
            priority: item.priority(),
            last_error: item.last_error.clone(),
            assigned_to: item.assigned_to.clone(),
            assigned_at: item.assigned_at,
            processed_at: item.processed_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ItemListResponse {
    pub items: Vec<ItemSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ArtifactEntry {
    pub stage: Stage,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl From<&StageArtifact> for ArtifactEntry {
    fn from(artifact: &StageArtifact) -> Self {
        Self {
            stage: artifact.stage,
            payload: artifact.payload.clone(),
            created_at: artifact.created_at,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryResponse {
    pub item_id: i64,
    pub artifacts: Vec<ArtifactEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FallbackListResponse {
    pub records: Vec<FallbackRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResubmitResponse {
    pub item_id: i64,
    pub status: &'static str,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpdateSettingRequest {
    pub value: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SettingsResponse {
    pub settings: Vec<SettingEntry>,
}

/// Full binding body for a stage rebind; the stage comes from the path.
#[derive(Clone, Debug, Deserialize)]
pub struct UpdateEndpointRequest {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub max_concurrent: usize,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub auth_env_key: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointListResponse {
    pub endpoints: Vec<EndpointBinding>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProbeResponse {
    pub stage: Stage,
    pub available: bool,
    pub models: Vec<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct StuckResponse {
    pub threshold_minutes: i64,
    pub items: Vec<ItemSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResetStuckResponse {
    pub recovered: usize,
}
