//! End-to-end pipeline scenarios driving real stage workers over a
//! temporary store with scripted handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use factlane_agents::{
    AgentError, HandlerRegistry, ItemView, PriorArtifacts, StageHandler, ToolSurface,
};
use factlane_queue::{recovery, EndpointRegistry, QueueRuntime, QueueSettings};
use factlane_store::{
    Directive, EndpointBinding, FallbackReason, ItemStatus, NewItem, ProviderKind,
    SqliteQueueStore, Stage, WORKABLE_STAGES,
};

fn open_store(name: &str) -> SqliteQueueStore {
    let path = std::env::temp_dir().join(format!(
        "factlane-scenario-{}-{}.db",
        name,
        uuid::Uuid::new_v4()
    ));
    SqliteQueueStore::open(path.to_str().expect("utf8 path")).expect("open store")
}

/// Fast loop cadence and no retry backoff, so scenarios converge quickly.
fn tune_for_tests(store: &SqliteQueueStore) {
    let now = Utc::now();
    for stage in WORKABLE_STAGES {
        store
            .upsert_setting(&format!("poll_interval_seconds.{}", stage), "1", now)
            .expect("poll interval setting");
    }
    store
        .upsert_setting("retry_timeout_seconds", "0", now)
        .expect("retry timeout setting");
}

fn insert(store: &SqliteQueueStore, source_id: &str, priority: Option<i64>) -> i64 {
    store
        .insert_item(
            &NewItem {
                source_id: source_id.to_string(),
                title: format!("title {}", source_id),
                author: "u/poster".to_string(),
                body: "body".to_string(),
                url: None,
                created_utc: Utc::now(),
                metadata: match priority {
                    Some(p) => json!({ "priority": p }),
                    None => json!({}),
                },
            },
            Utc::now(),
        )
        .expect("insert item")
        .expect("fresh item id")
}

async fn start_runtime(store: &SqliteQueueStore, handlers: HandlerRegistry) -> QueueRuntime {
    let registry = EndpointRegistry::load(store.clone())
        .await
        .expect("load registry");
    QueueRuntime::start(store.clone(), registry, handlers, None)
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Handler that immediately records a fixed directive.
struct DirectiveHandler {
    directive: Directive,
    result: &'static str,
}

#[async_trait]
impl StageHandler for DirectiveHandler {
    async fn handle(
        &self,
        _item: &ItemView,
        _priors: &PriorArtifacts,
        tools: &ToolSurface,
        _cfg: &EndpointBinding,
    ) -> Result<(), AgentError> {
        tools.write_result(
            json!({ "content": { "result": self.result } }),
            self.directive.clone(),
        )?;
        Ok(())
    }
}

fn advance_to(next: Stage) -> Arc<DirectiveHandler> {
    Arc::new(DirectiveHandler {
        directive: Directive::Advance { next },
        result: "ok",
    })
}

/// Handler that always fails like a 500 from the endpoint.
struct FailingHandler;

#[async_trait]
impl StageHandler for FailingHandler {
    async fn handle(
        &self,
        _item: &ItemView,
        _priors: &PriorArtifacts,
        _tools: &ToolSurface,
        _cfg: &EndpointBinding,
    ) -> Result<(), AgentError> {
        Err(AgentError::Endpoint {
            status: 500,
            body: "upstream exploded".to_string(),
        })
    }
}

/// Handler that records claim order before advancing.
struct RecordingHandler {
    seen: Arc<Mutex<Vec<i64>>>,
    next: Stage,
}

#[async_trait]
impl StageHandler for RecordingHandler {
    async fn handle(
        &self,
        item: &ItemView,
        _priors: &PriorArtifacts,
        tools: &ToolSurface,
        _cfg: &EndpointBinding,
    ) -> Result<(), AgentError> {
        self.seen.lock().expect("seen lock").push(item.id);
        tools.write_result(
            json!({ "content": { "result": "recorded" } }),
            Directive::Advance { next: self.next },
        )?;
        Ok(())
    }
}

/// Handler that tracks its own peak concurrency.
struct ConcurrencyProbeHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl StageHandler for ConcurrencyProbeHandler {
    async fn handle(
        &self,
        _item: &ItemView,
        _priors: &PriorArtifacts,
        tools: &ToolSurface,
        _cfg: &EndpointBinding,
    ) -> Result<(), AgentError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        tools.write_result(
            json!({ "content": { "result": "probed" } }),
            Directive::Advance { next: Stage::Research },
        )?;
        Ok(())
    }
}

#[tokio::test]
async fn s1_happy_path_runs_all_stages_to_completion() {
    let store = open_store("s1");
    tune_for_tests(&store);
    // The post stage needs a binding before its worker can run.
    store
        .upsert_endpoint(
            &EndpointBinding {
                stage: Stage::PostQueue,
                provider: ProviderKind::Custom,
                base_url: "http://localhost:11434".into(),
                model: "poster".into(),
                max_concurrent: 1,
                timeout_seconds: 30,
                auth_env_key: None,
            },
            Utc::now(),
        )
        .expect("post binding");

    let mut handlers = HandlerRegistry::new();
    handlers.register(Stage::Triage, advance_to(Stage::Research));
    handlers.register(Stage::Research, advance_to(Stage::Response));
    handlers.register(Stage::Response, advance_to(Stage::Editorial));
    handlers.register(Stage::Editorial, advance_to(Stage::PostQueue));
    handlers.register(
        Stage::PostQueue,
        Arc::new(DirectiveHandler {
            directive: Directive::Complete,
            result: "posted",
        }),
    );

    let id = insert(&store, "abc", None);
    let runtime = start_runtime(&store, handlers).await;

    let completed = wait_until(Duration::from_secs(30), || {
        store
            .get_item(id)
            .ok()
            .flatten()
            .map(|item| item.stage == Stage::Completed && item.status == ItemStatus::Completed)
            .unwrap_or(false)
    })
    .await;
    assert!(completed, "item never completed");

    let item = store.get_item(id).expect("get").expect("exists");
    assert_eq!(item.retry_count, 0);

    let history = store.item_history(id).expect("history");
    let stages: Vec<Stage> = history.iter().map(|a| a.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Triage,
            Stage::Research,
            Stage::Response,
            Stage::Editorial,
            Stage::PostQueue
        ]
    );

    runtime.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn s2_triage_rejection_is_terminal() {
    let store = open_store("s2");
    tune_for_tests(&store);

    let mut handlers = HandlerRegistry::new();
    handlers.register(
        Stage::Triage,
        Arc::new(DirectiveHandler {
            directive: Directive::Reject,
            result: "no factual claim",
        }),
    );

    let id = insert(&store, "opinion-post", None);
    let runtime = start_runtime(&store, handlers).await;

    let rejected = wait_until(Duration::from_secs(15), || {
        store
            .get_item(id)
            .ok()
            .flatten()
            .map(|item| item.status == ItemStatus::Rejected)
            .unwrap_or(false)
    })
    .await;
    assert!(rejected, "item never rejected");

    let item = store.get_item(id).expect("get").expect("exists");
    assert_eq!(item.stage, Stage::Rejected);
    assert_eq!(store.item_history(id).expect("history").len(), 1);
    assert!(store
        .list_rejected(10)
        .expect("rejected")
        .iter()
        .any(|i| i.id == id));

    // No further artifacts are permitted.
    let err = store
        .write_artifact_and_transition(
            id,
            Stage::Triage,
            &json!({"content": {"result": "late"}}),
            &Directive::Complete,
            Utc::now(),
        )
        .expect_err("terminal item");
    assert!(matches!(err, factlane_store::StoreError::Terminal(_, _)));

    runtime.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn s3_timeout_recovery_requeues_and_reclaims() {
    let store = open_store("s3");
    tune_for_tests(&store);
    let settings = QueueSettings::new(store.clone());
    let id = insert(&store, "abandoned", None);

    // Simulate a worker that claimed the item and crashed 31 minutes ago.
    let now = Utc::now();
    let crash_time = now - chrono::Duration::minutes(31);
    let claimed = store
        .claim_pending(
            Stage::Triage,
            1,
            crash_time,
            crash_time - chrono::Duration::minutes(30),
            crash_time,
            "triage-worker-crashed",
        )
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    let recovered = recovery::tick(&store, &settings).expect("recovery tick");
    assert_eq!(recovered.len(), 1);
    let item = store.get_item(id).expect("get").expect("exists");
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.retry_count, 1);
    assert!(item.assigned_to.is_none());

    // The next claim picks it up again.
    let reclaimed = store
        .claim_pending(
            Stage::Triage,
            1,
            Utc::now(),
            Utc::now() - chrono::Duration::minutes(30),
            Utc::now(),
            "triage-worker-next",
        )
        .expect("claim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, id);
}

#[tokio::test]
async fn s4_retry_exhaustion_fails_item_with_fallback_record() {
    let store = open_store("s4");
    tune_for_tests(&store);

    let mut handlers = HandlerRegistry::new();
    handlers.register(Stage::Triage, Arc::new(FailingHandler));

    let id = insert(&store, "cursed", None);
    let runtime = start_runtime(&store, handlers).await;

    let failed = wait_until(Duration::from_secs(45), || {
        store
            .get_item(id)
            .ok()
            .flatten()
            .map(|item| item.status == ItemStatus::Failed)
            .unwrap_or(false)
    })
    .await;
    assert!(failed, "item never failed");

    let item = store.get_item(id).expect("get").expect("exists");
    assert_eq!(item.stage, Stage::Triage);
    assert!(item.retry_count >= 3);

    let fallback = store.list_fallback(10).expect("fallback");
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].item_id, id);
    assert_eq!(fallback[0].reason, FallbackReason::Endpoint5xx);

    runtime.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn s5_paused_stage_accumulates_pending_until_resume() {
    let store = open_store("s5");
    tune_for_tests(&store);
    store
        .set_pause(Stage::Research, true, Utc::now())
        .expect("pause research");

    let mut handlers = HandlerRegistry::new();
    handlers.register(Stage::Triage, advance_to(Stage::Research));
    handlers.register(Stage::Research, advance_to(Stage::Response));

    let ids: Vec<i64> = (0..5)
        .map(|i| insert(&store, &format!("item-{}", i), None))
        .collect();
    let runtime = start_runtime(&store, handlers).await;

    let all_at_research = wait_until(Duration::from_secs(20), || {
        ids.iter().all(|id| {
            store
                .get_item(*id)
                .ok()
                .flatten()
                .map(|item| item.stage == Stage::Research && item.status == ItemStatus::Pending)
                .unwrap_or(false)
        })
    })
    .await;
    assert!(all_at_research, "triage did not move all items to research");

    // While paused, no research claim happens.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    for id in &ids {
        let item = store.get_item(*id).expect("get").expect("exists");
        assert_eq!(item.stage, Stage::Research);
        assert_eq!(item.status, ItemStatus::Pending);
    }

    store
        .set_pause(Stage::Research, false, Utc::now())
        .expect("resume research");

    let all_advanced = wait_until(Duration::from_secs(20), || {
        ids.iter().all(|id| {
            store
                .get_item(*id)
                .ok()
                .flatten()
                .map(|item| item.stage == Stage::Response)
                .unwrap_or(false)
        })
    })
    .await;
    assert!(all_advanced, "research did not resume");

    runtime.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn s6_higher_priority_items_claim_first() {
    let store = open_store("s6");
    tune_for_tests(&store);
    // Single slot so claim order is observable.
    store
        .upsert_endpoint(
            &EndpointBinding {
                stage: Stage::Triage,
                provider: ProviderKind::Custom,
                base_url: "http://localhost:11434".into(),
                model: "triage".into(),
                max_concurrent: 1,
                timeout_seconds: 30,
                auth_env_key: None,
            },
            Utc::now(),
        )
        .expect("triage binding");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        Stage::Triage,
        Arc::new(RecordingHandler {
            seen: seen.clone(),
            next: Stage::Research,
        }),
    );

    let low = insert(&store, "low", Some(1));
    let high = insert(&store, "high", Some(9));
    let runtime = start_runtime(&store, handlers).await;

    let both_done = wait_until(Duration::from_secs(20), || {
        seen.lock().expect("seen lock").len() == 2
    })
    .await;
    assert!(both_done, "both items should be processed");
    assert_eq!(*seen.lock().expect("seen lock"), vec![high, low]);

    runtime.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn concurrency_cap_bounds_simultaneous_handlers() {
    let store = open_store("cap");
    tune_for_tests(&store);
    store
        .upsert_endpoint(
            &EndpointBinding {
                stage: Stage::Triage,
                provider: ProviderKind::Custom,
                base_url: "http://localhost:11434".into(),
                model: "triage".into(),
                max_concurrent: 2,
                timeout_seconds: 30,
                auth_env_key: None,
            },
            Utc::now(),
        )
        .expect("triage binding");

    let probe = Arc::new(ConcurrencyProbeHandler {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let mut handlers = HandlerRegistry::new();
    handlers.register(Stage::Triage, probe.clone());

    let ids: Vec<i64> = (0..6)
        .map(|i| insert(&store, &format!("cap-{}", i), None))
        .collect();
    let runtime = start_runtime(&store, handlers).await;

    let all_advanced = wait_until(Duration::from_secs(30), || {
        ids.iter().all(|id| {
            store
                .get_item(*id)
                .ok()
                .flatten()
                .map(|item| item.stage == Stage::Research)
                .unwrap_or(false)
        })
    })
    .await;
    assert!(all_advanced, "all items should advance");
    assert!(probe.peak.load(Ordering::SeqCst) <= 2, "cap exceeded");

    runtime.shutdown(Duration::from_secs(5)).await;
}
