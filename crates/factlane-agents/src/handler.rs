//! The pluggable stage-handler seam.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use factlane_store::{EndpointBinding, Item, Stage};

use crate::error::AgentError;
use crate::tools::ToolSurface;

/// Immutable view of an item as handlers see it.
#[derive(Clone, Debug)]
pub struct ItemView {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub author: String,
    pub body: String,
    pub url: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub stage: Stage,
    pub retry_count: u32,
    pub metadata: Value,
}

impl From<&Item> for ItemView {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            source_id: item.source_id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            body: item.body.clone(),
            url: item.url.clone(),
            created_utc: item.created_utc,
            stage: item.stage,
            retry_count: item.retry_count,
            metadata: item.metadata.clone(),
        }
    }
}

/// Latest artifact payload per prior stage, in pipeline order.
pub type PriorArtifacts = BTreeMap<Stage, Value>;

/// A stage processor. The orchestrator guarantees single-tenant invocation
/// per `(item, attempt)`; the handler must call `tools.write_result` exactly
/// once. Returning without a decision is treated as an implicit retry.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(
        &self,
        item: &ItemView,
        priors: &PriorArtifacts,
        tools: &ToolSurface,
        cfg: &EndpointBinding,
    ) -> Result<(), AgentError>;
}

/// Stage-indexed handler map. Stage flow is data: a worker loop exists for
/// exactly the stages registered here.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    /// Registered stages in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.handlers.keys().copied().collect();
        stages.sort();
        stages
    }
}
