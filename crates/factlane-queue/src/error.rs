use thiserror::Error;

use factlane_agents::AgentError;
use factlane_store::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
}
