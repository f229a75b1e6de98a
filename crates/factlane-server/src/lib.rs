//! Control and observability HTTP API.
//!
//! Every operation maps to one store transaction (plus an optional
//! outbound probe); queries are point-in-time snapshots. Responses use the
//! versioned envelope with a request id taken from `x-request-id` when the
//! caller provides one.

pub mod api_errors;
pub mod api_models;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use factlane_agents::ChatTransport;
use factlane_queue::{
    probe_binding, recovery, EndpointRegistry, QueueRuntime, QueueSettings, StageGauges,
};
use factlane_store::{
    EndpointBinding, ProviderKind, SqliteQueueStore, Stage, WORKABLE_STAGES,
};

use api_errors::ApiError;
use api_models::{
    ApiEnvelope, ApiMeta, ArtifactEntry, EndpointListResponse, FallbackListResponse,
    HistoryResponse, IngestItemRequest, IngestItemResponse, ItemListResponse, ItemSummary,
    PauseResponse, ProbeResponse, QueueStatsResponse, QueueStatusEntry, QueueStatusResponse,
    ReloadResponse, ResetStuckResponse, ResubmitResponse, SettingEntry, SettingsResponse,
    StuckResponse, UpdateEndpointRequest, UpdateSettingRequest,
};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 200;

#[derive(Clone)]
pub struct ApiState {
    pub store: SqliteQueueStore,
    pub registry: Arc<EndpointRegistry>,
    pub settings: QueueSettings,
    pub gauges: StageGauges,
    pub transport: Arc<dyn ChatTransport>,
    pub worker_stages: Vec<Stage>,
}

impl ApiState {
    pub fn from_runtime(runtime: &QueueRuntime, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            store: runtime.store(),
            registry: runtime.registry(),
            settings: runtime.settings(),
            gauges: runtime.gauges(),
            transport,
            worker_stages: runtime.stages(),
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/items", post(ingest_item))
        .route("/v1/items/rejected", get(list_rejected))
        .route("/v1/items/:id/history", get(item_history))
        .route("/v1/items/:id/resubmit", post(resubmit_item))
        .route("/v1/queue/status", get(queue_status))
        .route("/v1/queue/stats", get(queue_stats))
        .route("/v1/queue/stuck", get(stuck_report))
        .route("/v1/queue/reset-stuck", post(reset_stuck))
        .route("/v1/queue/:stage/pause", post(pause_stage))
        .route("/v1/queue/:stage/resume", post(resume_stage))
        .route("/v1/queue/:stage/pending", get(list_stage_pending))
        .route("/v1/fallback", get(list_fallback))
        .route("/v1/settings", get(list_settings))
        .route("/v1/settings/:key", put(update_setting))
        .route("/v1/endpoints", get(list_endpoints))
        .route("/v1/endpoints/reload", post(reload_endpoints))
        .route("/v1/endpoints/probe", post(probe_candidate))
        .route("/v1/endpoints/:stage", put(update_endpoint))
        .route("/v1/endpoints/:stage/probe", post(probe_stage))
        .route("/v1/post-queue", get(post_queue_view))
        .with_state(state)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn envelope<T>(request_id: String, data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        meta: ApiMeta::ok(),
        request_id,
        data,
    })
}

fn parse_stage(raw: &str, request_id: &str) -> Result<Stage, ApiError> {
    Stage::parse(raw)
        .map_err(|err| ApiError::bad_request(err.to_string()).with_request_id(request_id))
}

fn parse_workable_stage(raw: &str, request_id: &str) -> Result<Stage, ApiError> {
    let stage = parse_stage(raw, request_id)?;
    if !WORKABLE_STAGES.contains(&stage) {
        return Err(
            ApiError::bad_request(format!("stage `{}` has no worker queue", stage))
                .with_request_id(request_id),
        );
    }
    Ok(stage)
}

#[derive(Clone, Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn capped(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }
}

async fn ingest_item(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<IngestItemRequest>,
) -> Result<Json<ApiEnvelope<IngestItemResponse>>, ApiError> {
    let request_id = request_id(&headers);
    if body.source_id.trim().is_empty() {
        return Err(ApiError::bad_request("source_id must not be empty").with_request_id(request_id));
    }
    let new_item = factlane_store::NewItem {
        source_id: body.source_id,
        title: body.title,
        author: body.author,
        body: body.body,
        url: body.url,
        created_utc: body.created_utc,
        metadata: body.metadata.unwrap_or_else(|| serde_json::json!({})),
    };
    let item_id = state
        .store
        .insert_item(&new_item, Utc::now())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    let duplicate = item_id.is_none();
    if duplicate {
        info!(source_id = %new_item.source_id, "duplicate submission ignored");
    }
    Ok(envelope(request_id, IngestItemResponse { item_id, duplicate }))
}

async fn queue_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<QueueStatusResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let mut stages = Vec::with_capacity(state.worker_stages.len());
    for stage in &state.worker_stages {
        let binding = state.registry.binding(*stage).await;
        let paused = state
            .store
            .get_pause(*stage)
            .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
        stages.push(QueueStatusEntry {
            stage: *stage,
            available: state.registry.is_available(*stage).await,
            current_load: state.gauges.current_load(*stage),
            max_concurrent: binding.map(|b| b.max_concurrent).unwrap_or(0),
            paused,
        });
    }
    Ok(envelope(request_id, QueueStatusResponse { stages }))
}

async fn queue_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<QueueStatsResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let stats = state
        .store
        .count_by_stage_and_status()
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(request_id, QueueStatsResponse { stats }))
}

async fn pause_stage(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(stage): Path<String>,
) -> Result<Json<ApiEnvelope<PauseResponse>>, ApiError> {
    set_pause(state, headers, &stage, true).await
}

async fn resume_stage(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(stage): Path<String>,
) -> Result<Json<ApiEnvelope<PauseResponse>>, ApiError> {
    set_pause(state, headers, &stage, false).await
}

async fn set_pause(
    state: ApiState,
    headers: HeaderMap,
    raw_stage: &str,
    paused: bool,
) -> Result<Json<ApiEnvelope<PauseResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let stage = parse_workable_stage(raw_stage, &request_id)?;
    state
        .store
        .set_pause(stage, paused, Utc::now())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    info!(stage = %stage, paused, "pause flag updated");
    Ok(envelope(request_id, PauseResponse { stage, paused }))
}

async fn list_stage_pending(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(stage): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<ItemListResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let stage = parse_workable_stage(&stage, &request_id)?;
    let items = state
        .store
        .list_pending(stage, query.capped())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        ItemListResponse {
            items: items.iter().map(ItemSummary::from).collect(),
        },
    ))
}

async fn list_rejected(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<ItemListResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let items = state
        .store
        .list_rejected(query.capped())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        ItemListResponse {
            items: items.iter().map(ItemSummary::from).collect(),
        },
    ))
}

async fn list_fallback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<FallbackListResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let records = state
        .store
        .list_fallback(query.capped())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(request_id, FallbackListResponse { records }))
}

async fn item_history(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<HistoryResponse>>, ApiError> {
    let request_id = request_id(&headers);
    if state
        .store
        .get_item(id)
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?
        .is_none()
    {
        return Err(ApiError::not_found(format!("item not found: {}", id))
            .with_request_id(request_id));
    }
    let artifacts = state
        .store
        .item_history(id)
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        HistoryResponse {
            item_id: id,
            artifacts: artifacts.iter().map(ArtifactEntry::from).collect(),
        },
    ))
}

async fn resubmit_item(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<ResubmitResponse>>, ApiError> {
    let request_id = request_id(&headers);
    state
        .store
        .resubmit_fallback(id, Utc::now())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    info!(item_id = id, "item resubmitted to pending");
    Ok(envelope(
        request_id,
        ResubmitResponse {
            item_id: id,
            status: "pending",
        },
    ))
}

async fn list_settings(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<SettingsResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let settings = state
        .store
        .list_settings()
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?
        .into_iter()
        .map(|(key, value)| SettingEntry { key, value })
        .collect();
    Ok(envelope(request_id, SettingsResponse { settings }))
}

async fn update_setting(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<UpdateSettingRequest>,
) -> Result<Json<ApiEnvelope<SettingEntry>>, ApiError> {
    let request_id = request_id(&headers);
    state
        .store
        .upsert_setting(&key, &body.value, Utc::now())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    info!(key = %key, value = %body.value, "setting updated");
    Ok(envelope(
        request_id,
        SettingEntry {
            key,
            value: body.value,
        },
    ))
}

async fn list_endpoints(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<EndpointListResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let endpoints = state.registry.list().await;
    Ok(envelope(request_id, EndpointListResponse { endpoints }))
}

async fn update_endpoint(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(stage): Path<String>,
    Json(body): Json<UpdateEndpointRequest>,
) -> Result<Json<ApiEnvelope<EndpointBinding>>, ApiError> {
    let request_id = request_id(&headers);
    let stage = parse_workable_stage(&stage, &request_id)?;
    let binding = binding_from_request(stage, &body, &request_id)?;
    state
        .registry
        .rebind(&binding)
        .await
        .map_err(|e| map_queue_error(e, &request_id))?;
    info!(stage = %stage, model = %binding.model, "endpoint rebound");
    Ok(envelope(request_id, binding))
}

async fn probe_stage(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(stage): Path<String>,
) -> Result<Json<ApiEnvelope<ProbeResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let stage = parse_workable_stage(&stage, &request_id)?;
    let outcome = state
        .registry
        .probe(stage, state.transport.as_ref())
        .await
        .map_err(|e| map_queue_error(e, &request_id))?;
    Ok(envelope(
        request_id,
        ProbeResponse {
            stage: outcome.stage,
            available: outcome.available,
            models: outcome.models,
            error: outcome.error,
        },
    ))
}

/// Candidate probe body: a stage plus the binding to validate before it is
/// saved.
#[derive(Clone, Debug, Deserialize)]
struct ProbeCandidateRequest {
    stage: String,
    #[serde(flatten)]
    binding: UpdateEndpointRequest,
}

async fn probe_candidate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ProbeCandidateRequest>,
) -> Result<Json<ApiEnvelope<ProbeResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let stage = parse_workable_stage(&body.stage, &request_id)?;
    let binding = binding_from_request(stage, &body.binding, &request_id)?;
    let outcome = probe_binding(&binding, state.transport.as_ref()).await;
    Ok(envelope(
        request_id,
        ProbeResponse {
            stage: outcome.stage,
            available: outcome.available,
            models: outcome.models,
            error: outcome.error,
        },
    ))
}

async fn reload_endpoints(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ReloadResponse>>, ApiError> {
    let request_id = request_id(&headers);
    state
        .registry
        .reload()
        .await
        .map_err(|e| map_queue_error(e, &request_id))?;
    Ok(envelope(request_id, ReloadResponse { reloaded: true }))
}

async fn stuck_report(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<StuckResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let threshold = state.settings.stuck_threshold();
    let items = state
        .store
        .list_stuck(Utc::now(), threshold, query.capped())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        StuckResponse {
            threshold_minutes: threshold.num_minutes(),
            items: items.iter().map(ItemSummary::from).collect(),
        },
    ))
}

async fn reset_stuck(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<ApiEnvelope<ResetStuckResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let recovered = recovery::tick(&state.store, &state.settings)
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        ResetStuckResponse {
            recovered: recovered.len(),
        },
    ))
}

/// Ready-for-posting view: items handed off by editorial, waiting for the
/// outbound posting collaborator.
async fn post_queue_view(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ApiEnvelope<ItemListResponse>>, ApiError> {
    let request_id = request_id(&headers);
    let items = state
        .store
        .list_pending(Stage::PostQueue, query.capped())
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    Ok(envelope(
        request_id,
        ItemListResponse {
            items: items.iter().map(ItemSummary::from).collect(),
        },
    ))
}

fn binding_from_request(
    stage: Stage,
    body: &UpdateEndpointRequest,
    request_id: &str,
) -> Result<EndpointBinding, ApiError> {
    let provider = ProviderKind::parse(&body.provider)
        .map_err(|e| ApiError::bad_request(e.to_string()).with_request_id(request_id))?;
    if body.max_concurrent == 0 {
        return Err(ApiError::bad_request("max_concurrent must be at least 1")
            .with_request_id(request_id));
    }
    if body.timeout_seconds == 0 {
        return Err(ApiError::bad_request("timeout_seconds must be at least 1")
            .with_request_id(request_id));
    }
    Ok(EndpointBinding {
        stage,
        provider,
        base_url: body.base_url.trim_end_matches('/').to_string(),
        model: body.model.clone(),
        max_concurrent: body.max_concurrent,
        timeout_seconds: body.timeout_seconds,
        auth_env_key: body.auth_env_key.clone(),
    })
}

fn map_queue_error(err: factlane_queue::QueueError, request_id: &str) -> ApiError {
    match err {
        factlane_queue::QueueError::Store(store_err) => {
            ApiError::from(store_err).with_request_id(request_id)
        }
        factlane_queue::QueueError::Agent(agent_err) => {
            ApiError::internal(agent_err.to_string()).with_request_id(request_id)
        }
    }
}
