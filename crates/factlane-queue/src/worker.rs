//! Per-stage worker loop.
//!
//! Each registered stage gets one long-lived loop that snapshots the pause
//! flag, settings and endpoint binding, claims up to the free semaphore
//! permits and runs one bounded task per claimed item. The semaphore plus
//! the claim `LIMIT` are the whole backpressure story; there is no
//! in-memory queue between the store and the handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use factlane_agents::{
    AgentError, HandlerRegistry, ItemView, StageHandler, ToolSurface, WebSearchClient,
};
use factlane_store::{
    Directive, EndpointBinding, FallbackReason, Item, SqliteQueueStore, Stage,
};

use crate::registry::EndpointRegistry;
use crate::settings::QueueSettings;

/// Extra headroom on top of the binding timeout before a handler is
/// forcibly abandoned.
const HANDLER_GRACE_SECONDS: u64 = 5;

/// Per-stage in-flight counters shared with the control API.
#[derive(Clone, Default)]
pub struct StageGauges {
    loads: HashMap<Stage, Arc<AtomicUsize>>,
}

impl StageGauges {
    pub fn for_stages(stages: &[Stage]) -> Self {
        let mut loads = HashMap::new();
        for stage in stages {
            loads.insert(*stage, Arc::new(AtomicUsize::new(0)));
        }
        Self { loads }
    }

    pub fn current_load(&self, stage: Stage) -> usize {
        self.loads
            .get(&stage)
            .map(|gauge| gauge.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn gauge(&self, stage: Stage) -> Arc<AtomicUsize> {
        self.loads
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)))
    }
}

pub struct StageWorker {
    stage: Stage,
    store: SqliteQueueStore,
    registry: Arc<EndpointRegistry>,
    settings: QueueSettings,
    handler: Arc<dyn StageHandler>,
    search: Option<Arc<WebSearchClient>>,
    load: Arc<AtomicUsize>,
    worker_token: String,
    shutdown: watch::Receiver<bool>,
}

impl StageWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage: Stage,
        store: SqliteQueueStore,
        registry: Arc<EndpointRegistry>,
        settings: QueueSettings,
        handlers: &HandlerRegistry,
        search: Option<Arc<WebSearchClient>>,
        gauges: &StageGauges,
        shutdown: watch::Receiver<bool>,
    ) -> Option<Self> {
        let handler = handlers.get(stage)?;
        Some(Self {
            stage,
            store,
            registry,
            settings,
            handler,
            search,
            load: gauges.gauge(stage),
            worker_token: format!("{}-worker-{}", stage, uuid::Uuid::new_v4()),
            shutdown,
        })
    }

    pub async fn run(mut self) {
        info!(stage = %self.stage, worker = %self.worker_token, "stage worker started");
        let mut cap = 0usize;
        let mut semaphore = Arc::new(Semaphore::new(0));

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let poll_interval = self.settings.poll_interval(self.stage);

            match self.store.get_pause(self.stage) {
                Ok(true) => {
                    debug!(stage = %self.stage, "stage is paused");
                    if self.sleep_or_shutdown(poll_interval).await {
                        break;
                    }
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(stage = %self.stage, error = %err, "pause flag read failed");
                    if self.sleep_or_shutdown(poll_interval).await {
                        break;
                    }
                    continue;
                }
            }

            let Some(binding) = self.registry.binding(self.stage).await else {
                warn!(stage = %self.stage, "no endpoint binding, idling");
                if self.sleep_or_shutdown(poll_interval).await {
                    break;
                }
                continue;
            };

            // A rebound concurrency cap is applied once the stage is idle,
            // so permits held by in-flight handlers stay consistent.
            let bound_cap = binding.max_concurrent.max(1);
            if bound_cap != cap && semaphore.available_permits() == cap {
                cap = bound_cap;
                semaphore = Arc::new(Semaphore::new(cap));
            }

            let slots = semaphore.available_permits();
            if slots == 0 {
                if self.sleep_or_shutdown(poll_interval).await {
                    break;
                }
                continue;
            }

            let now = Utc::now();
            let stale_cutoff = now - self.settings.stuck_threshold();
            let backoff_cutoff = now - self.settings.retry_timeout();
            let claimed = match self.store.claim_pending(
                self.stage,
                slots,
                now,
                stale_cutoff,
                backoff_cutoff,
                &self.worker_token,
            ) {
                Ok(items) => items,
                Err(err) => {
                    // Contention policy: treat a failed claim as an empty
                    // batch and try again next tick.
                    warn!(stage = %self.stage, error = %err, "claim failed");
                    Vec::new()
                }
            };

            if !claimed.is_empty() {
                debug!(stage = %self.stage, count = claimed.len(), "claimed items");
            }

            let max_retries = self.settings.max_retry_attempts();
            for item in claimed {
                if item.retry_count > max_retries {
                    self.exhaust(&item, max_retries);
                    continue;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    // Lost a permit race; the claim stays assigned and the
                    // recovery path returns it to pending.
                    warn!(stage = %self.stage, item_id = item.id, "no permit for claimed item");
                    break;
                };
                let task = ItemTask {
                    stage: self.stage,
                    store: self.store.clone(),
                    handler: self.handler.clone(),
                    search: self.search.clone(),
                    binding: binding.clone(),
                    load: self.load.clone(),
                    max_retries,
                };
                tokio::spawn(async move {
                    task.process(item).await;
                    drop(permit);
                });
            }

            if self.sleep_or_shutdown(poll_interval).await {
                break;
            }
        }
        info!(stage = %self.stage, "stage worker stopped");
    }

    /// Sleep for the poll interval; returns true when shutdown fired.
    async fn sleep_or_shutdown(&mut self, interval: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = self.shutdown.changed() => *self.shutdown.borrow(),
        }
    }

    fn exhaust(&self, item: &Item, max_retries: u32) {
        let reason = classify_exhaustion_reason(item.last_error.as_deref());
        warn!(
            stage = %self.stage,
            item_id = item.id,
            retry_count = item.retry_count,
            max_retries,
            reason = %reason,
            "retry budget exhausted"
        );
        if let Err(err) = self.store.mark_failed(
            item.id,
            &format!("retry budget exhausted after {} attempts", item.retry_count),
            Utc::now(),
        ) {
            error!(item_id = item.id, error = %err, "failed to mark item failed");
            return;
        }
        if let Err(err) = self.store.append_fallback(
            item.id,
            self.stage,
            reason,
            item.last_error.as_deref(),
            Utc::now(),
        ) {
            error!(item_id = item.id, error = %err, "failed to append fallback record");
        }
    }
}

struct ItemTask {
    stage: Stage,
    store: SqliteQueueStore,
    handler: Arc<dyn StageHandler>,
    search: Option<Arc<WebSearchClient>>,
    binding: EndpointBinding,
    load: Arc<AtomicUsize>,
    max_retries: u32,
}

impl ItemTask {
    async fn process(&self, item: Item) {
        self.load.fetch_add(1, Ordering::Relaxed);
        let started = std::time::Instant::now();
        let outcome = self.invoke(&item).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(directive) => {
                info!(
                    stage = %self.stage,
                    item_id = item.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    directive = ?directive,
                    "item processed"
                );
            }
            Err((surface, err)) => {
                warn!(
                    stage = %self.stage,
                    item_id = item.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "handler attempt failed"
                );
                self.settle_failure(&item, surface, &err);
            }
        }
        self.load.fetch_sub(1, Ordering::Relaxed);
    }

    /// Run the handler under the binding deadline. Returns the recorded
    /// directive, or the surface plus the failure for the retry path.
    async fn invoke(&self, item: &Item) -> Result<Directive, (Arc<ToolSurface>, AgentError)> {
        let surface = Arc::new(ToolSurface::new(
            self.store.clone(),
            item.id,
            item.stage,
            self.search.clone(),
        ));

        let priors = match self.store.read_prior_artifacts(item.id, item.stage) {
            Ok(priors) => priors,
            Err(err) => return Err((surface, AgentError::Store(err))),
        };
        let view = ItemView::from(item);
        let deadline =
            std::time::Duration::from_secs(self.binding.timeout_seconds + HANDLER_GRACE_SECONDS);

        let result = tokio::time::timeout(
            deadline,
            self.handler.handle(&view, &priors, &surface, &self.binding),
        )
        .await;

        match result {
            Ok(Ok(())) => match surface.decided() {
                Some(directive) => Ok(directive),
                None => Err((surface, AgentError::NoDecision)),
            },
            Ok(Err(err)) => match surface.decided() {
                // The decision is already durable; a later error in the
                // same attempt changes nothing.
                Some(directive) => {
                    debug!(item_id = item.id, error = %err, "error after recorded decision");
                    Ok(directive)
                }
                None => Err((surface, err)),
            },
            // The handler future was dropped at the deadline; if its
            // decision already committed, the store is authoritative.
            Err(_) => match surface.decided() {
                Some(directive) => Ok(directive),
                None => Err((surface, AgentError::DeadlineExceeded)),
            },
        }
    }

    /// Apply the failure policy: requeue with an implicit retry while the
    /// budget lasts, otherwise fail the item and log a fallback record.
    fn settle_failure(&self, item: &Item, surface: Arc<ToolSurface>, err: &AgentError) {
        if surface.decided().is_some() {
            return;
        }
        let reason = err.retry_reason();
        if item.retry_count + 1 > self.max_retries {
            if let Err(store_err) = self.store.mark_failed(item.id, &reason, Utc::now()) {
                error!(item_id = item.id, error = %store_err, "failed to mark item failed");
                return;
            }
            if let Err(store_err) = self.store.append_fallback(
                item.id,
                self.stage,
                err.fallback_reason(),
                Some(&reason),
                Utc::now(),
            ) {
                error!(item_id = item.id, error = %store_err, "failed to append fallback record");
            }
            return;
        }

        let payload = json!({ "internal": true, "error": reason });
        match surface.write_result(payload, Directive::Retry { reason: reason.clone() }) {
            Ok(()) => {}
            Err(AgentError::AlreadyDecided) => {}
            Err(write_err) => {
                error!(item_id = item.id, error = %write_err, "implicit retry write failed");
            }
        }
    }
}

/// Map the last recorded attempt error onto a fallback reason for the
/// exhaustion record.
fn classify_exhaustion_reason(last_error: Option<&str>) -> FallbackReason {
    let Some(last_error) = last_error else {
        return FallbackReason::RetryExhausted;
    };
    if let Some(reason) = FallbackReason::parse(last_error) {
        return reason;
    }
    if last_error.starts_with("endpoint_5") {
        FallbackReason::Endpoint5xx
    } else if last_error.starts_with("endpoint_") {
        FallbackReason::EndpointUnreachable
    } else if last_error.starts_with("model_protocol_error")
        || last_error.starts_with("tool_loop_exceeded")
    {
        FallbackReason::ModelProtocolError
    } else if last_error.contains("did not produce result") {
        FallbackReason::HandlerError
    } else {
        FallbackReason::RetryExhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_reason_classification() {
        assert_eq!(
            classify_exhaustion_reason(None),
            FallbackReason::RetryExhausted
        );
        assert_eq!(
            classify_exhaustion_reason(Some("endpoint_503")),
            FallbackReason::Endpoint5xx
        );
        assert_eq!(
            classify_exhaustion_reason(Some("endpoint_unreachable")),
            FallbackReason::EndpointUnreachable
        );
        assert_eq!(
            classify_exhaustion_reason(Some("deadline_exceeded")),
            FallbackReason::DeadlineExceeded
        );
        assert_eq!(
            classify_exhaustion_reason(Some("tool_loop_exceeded_8")),
            FallbackReason::ModelProtocolError
        );
        assert_eq!(
            classify_exhaustion_reason(Some("handler did not produce result")),
            FallbackReason::HandlerError
        );
        assert_eq!(
            classify_exhaustion_reason(Some("something odd")),
            FallbackReason::RetryExhausted
        );
    }

    #[test]
    fn gauges_default_to_zero_for_unknown_stage() {
        let gauges = StageGauges::for_stages(&[Stage::Triage]);
        assert_eq!(gauges.current_load(Stage::Triage), 0);
        assert_eq!(gauges.current_load(Stage::Research), 0);
    }
}
