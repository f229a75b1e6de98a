//! Stage-to-endpoint binding registry.
//!
//! Workers read bindings from an in-memory snapshot once per loop
//! iteration, so a rebind never changes configuration mid-handler. The
//! snapshot is refreshed from the store by `reload`, which the control API
//! invokes after binding updates. Probe failures flip the availability
//! flag for operator visibility only; an unavailable stage keeps claiming
//! and fails fast into the retry policy.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use factlane_agents::ChatTransport;
use factlane_store::{EndpointBinding, ProviderKind, SqliteQueueStore, Stage, StoreError};

use crate::error::QueueError;

/// Result of an operator probe, structured rather than thrown.
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    pub stage: Stage,
    pub available: bool,
    pub models: Vec<String>,
    pub error: Option<String>,
}

pub struct EndpointRegistry {
    store: SqliteQueueStore,
    snapshot: RwLock<HashMap<Stage, EndpointBinding>>,
    availability: RwLock<HashMap<Stage, bool>>,
}

impl EndpointRegistry {
    /// Load the registry, seeding default bindings for any analysis stage
    /// that has none yet.
    pub async fn load(store: SqliteQueueStore) -> Result<Arc<Self>, QueueError> {
        seed_default_bindings(&store)?;
        let registry = Arc::new(Self {
            store,
            snapshot: RwLock::new(HashMap::new()),
            availability: RwLock::new(HashMap::new()),
        });
        registry.reload().await?;
        Ok(registry)
    }

    /// Refresh the snapshot from the store. Workers pick the new bindings
    /// up at their next loop iteration.
    pub async fn reload(&self) -> Result<(), QueueError> {
        let bindings = self.store.list_endpoints()?;
        let mut snapshot = self.snapshot.write().await;
        snapshot.clear();
        for binding in bindings {
            snapshot.insert(binding.stage, binding);
        }
        info!(bindings = snapshot.len(), "endpoint snapshot reloaded");
        Ok(())
    }

    pub async fn binding(&self, stage: Stage) -> Option<EndpointBinding> {
        self.snapshot.read().await.get(&stage).cloned()
    }

    pub async fn is_available(&self, stage: Stage) -> bool {
        self.availability
            .read()
            .await
            .get(&stage)
            .copied()
            .unwrap_or(true)
    }

    /// Capability discovery against the live binding. Updates the
    /// availability flag as a side effect.
    pub async fn probe(
        &self,
        stage: Stage,
        transport: &dyn ChatTransport,
    ) -> Result<ProbeOutcome, QueueError> {
        let Some(binding) = self.binding(stage).await else {
            return Ok(ProbeOutcome {
                stage,
                available: false,
                models: Vec::new(),
                error: Some("no endpoint binding for stage".to_string()),
            });
        };
        let outcome = match transport.list_models(&binding).await {
            Ok(models) => ProbeOutcome {
                stage,
                available: true,
                models,
                error: None,
            },
            Err(err) => {
                warn!(stage = %stage, error = %err, "endpoint probe failed");
                ProbeOutcome {
                    stage,
                    available: false,
                    models: Vec::new(),
                    error: Some(err.to_string()),
                }
            }
        };
        self.availability
            .write()
            .await
            .insert(stage, outcome.available);
        Ok(outcome)
    }

    /// Validate a binding before persisting it, then refresh the snapshot.
    pub async fn rebind(&self, binding: &EndpointBinding) -> Result<(), QueueError> {
        if binding.max_concurrent == 0 {
            return Err(QueueError::Store(StoreError::InvalidDirective(
                "max_concurrent must be at least 1".to_string(),
            )));
        }
        self.store.upsert_endpoint(binding, chrono::Utc::now())?;
        self.reload().await
    }

    pub async fn list(&self) -> Vec<EndpointBinding> {
        let snapshot = self.snapshot.read().await;
        let mut bindings: Vec<EndpointBinding> = snapshot.values().cloned().collect();
        bindings.sort_by_key(|b| b.stage);
        bindings
    }
}

/// Probe an arbitrary binding that is not saved yet. Lets operators
/// validate a candidate before rebinding a stage to it.
pub async fn probe_binding(
    binding: &EndpointBinding,
    transport: &dyn ChatTransport,
) -> ProbeOutcome {
    match transport.list_models(binding).await {
        Ok(models) => ProbeOutcome {
            stage: binding.stage,
            available: true,
            models,
            error: None,
        },
        Err(err) => ProbeOutcome {
            stage: binding.stage,
            available: false,
            models: Vec::new(),
            error: Some(err.to_string()),
        },
    }
}

fn seed_default_bindings(store: &SqliteQueueStore) -> Result<(), StoreError> {
    let now = chrono::Utc::now();
    for (stage, env_key, model, max_concurrent, timeout_seconds) in [
        (Stage::Triage, "TRIAGE_ENDPOINT", "deepseek-r1:1.5b", 4, 120),
        (Stage::Research, "RESEARCH_ENDPOINT", "gpt-oss:20b", 2, 600),
        (Stage::Response, "RESPONSE_ENDPOINT", "gpt-oss:20b", 2, 300),
        (Stage::Editorial, "EDITORIAL_ENDPOINT", "gpt-oss:20b", 3, 180),
    ] {
        if store.get_endpoint(stage)?.is_some() {
            continue;
        }
        let base_url =
            std::env::var(env_key).unwrap_or_else(|_| "http://localhost:11434".to_string());
        store.upsert_endpoint(
            &EndpointBinding {
                stage,
                provider: ProviderKind::Custom,
                base_url,
                model: model.to_string(),
                max_concurrent,
                timeout_seconds,
                auth_env_key: None,
            },
            now,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(name: &str) -> SqliteQueueStore {
        let path = std::env::temp_dir().join(format!(
            "factlane-registry-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteQueueStore::open(path.to_str().expect("utf8")).expect("open")
    }

    #[tokio::test]
    async fn load_seeds_bindings_for_all_analysis_stages() {
        let registry = EndpointRegistry::load(open_store("seed")).await.expect("load");
        for stage in [Stage::Triage, Stage::Research, Stage::Response, Stage::Editorial] {
            let binding = registry.binding(stage).await.expect("seeded binding");
            assert!(binding.max_concurrent >= 1);
            assert!(registry.is_available(stage).await);
        }
        assert!(registry.binding(Stage::PostQueue).await.is_none());
    }

    #[tokio::test]
    async fn rebind_is_visible_after_reload() {
        let store = open_store("rebind");
        let registry = EndpointRegistry::load(store.clone()).await.expect("load");

        let mut binding = registry.binding(Stage::Research).await.expect("binding");
        binding.model = "researcher-v2".to_string();
        binding.max_concurrent = 6;
        registry.rebind(&binding).await.expect("rebind");

        let reloaded = registry.binding(Stage::Research).await.expect("binding");
        assert_eq!(reloaded.model, "researcher-v2");
        assert_eq!(reloaded.max_concurrent, 6);

        // The store agrees; a fresh registry sees the same binding.
        let fresh = EndpointRegistry::load(store).await.expect("load");
        assert_eq!(
            fresh.binding(Stage::Research).await.expect("binding").model,
            "researcher-v2"
        );
    }

    #[tokio::test]
    async fn probe_failure_is_structured_and_flips_availability() {
        use async_trait::async_trait;
        use factlane_agents::{AgentError, ChatRequest, ChatResponse};

        struct DeadTransport;

        #[async_trait]
        impl ChatTransport for DeadTransport {
            async fn chat(
                &self,
                _binding: &EndpointBinding,
                _request: &ChatRequest,
            ) -> Result<ChatResponse, AgentError> {
                Err(AgentError::Unreachable("connection refused".into()))
            }

            async fn list_models(
                &self,
                _binding: &EndpointBinding,
            ) -> Result<Vec<String>, AgentError> {
                Err(AgentError::Unreachable("connection refused".into()))
            }
        }

        let registry = EndpointRegistry::load(open_store("probe")).await.expect("load");
        let outcome = registry
            .probe(Stage::Triage, &DeadTransport)
            .await
            .expect("probe returns an outcome, not an error");
        assert!(!outcome.available);
        assert!(outcome.models.is_empty());
        assert!(outcome.error.as_deref().unwrap_or("").contains("unreachable"));
        assert!(!registry.is_available(Stage::Triage).await);
    }

    #[tokio::test]
    async fn zero_concurrency_rebind_is_rejected() {
        let registry = EndpointRegistry::load(open_store("zero")).await.expect("load");
        let mut binding = registry.binding(Stage::Triage).await.expect("binding");
        binding.max_concurrent = 0;
        assert!(registry.rebind(&binding).await.is_err());
    }
}
