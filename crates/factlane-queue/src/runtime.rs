//! Supervisor for the worker pool and recovery task.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use factlane_agents::{HandlerRegistry, WebSearchClient};
use factlane_store::{SqliteQueueStore, Stage};

use crate::recovery::RecoveryManager;
use crate::registry::EndpointRegistry;
use crate::settings::QueueSettings;
use crate::worker::{StageGauges, StageWorker};

pub struct QueueRuntime {
    store: SqliteQueueStore,
    registry: Arc<EndpointRegistry>,
    settings: QueueSettings,
    gauges: StageGauges,
    stages: Vec<Stage>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl QueueRuntime {
    /// Spawn one worker loop per registered stage plus the recovery task.
    pub fn start(
        store: SqliteQueueStore,
        registry: Arc<EndpointRegistry>,
        handlers: HandlerRegistry,
        search: Option<Arc<WebSearchClient>>,
    ) -> Self {
        let settings = QueueSettings::new(store.clone());
        let stages = handlers.stages();
        let gauges = StageGauges::for_stages(&stages);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        for stage in &stages {
            // Only research-capable stages carry the search tool.
            let stage_search = if *stage == Stage::Research {
                search.clone()
            } else {
                None
            };
            let Some(worker) = StageWorker::new(
                *stage,
                store.clone(),
                registry.clone(),
                settings.clone(),
                &handlers,
                stage_search,
                &gauges,
                shutdown_rx.clone(),
            ) else {
                continue;
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        let recovery = RecoveryManager::new(store.clone(), settings.clone(), shutdown_rx);
        tasks.push(tokio::spawn(recovery.run()));

        info!(workers = stages.len(), "queue runtime started");
        Self {
            store,
            registry,
            settings,
            gauges,
            stages,
            shutdown_tx,
            tasks,
        }
    }

    pub fn store(&self) -> SqliteQueueStore {
        self.store.clone()
    }

    pub fn registry(&self) -> Arc<EndpointRegistry> {
        self.registry.clone()
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings.clone()
    }

    pub fn gauges(&self) -> StageGauges {
        self.gauges.clone()
    }

    /// Stages with an active worker loop.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.clone()
    }

    /// Stop claiming, wait up to `drain` for in-flight handlers, then
    /// abort. Anything still `processing` afterwards is reclaimed by the
    /// recovery path on next start.
    pub async fn shutdown(self, drain: std::time::Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + drain;
        for mut task in self.tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!("worker did not drain in time, aborting");
                task.abort();
            }
        }
        info!("queue runtime stopped");
    }
}
