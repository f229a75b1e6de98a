//! Stage handlers and the protocol between the orchestrator and remote
//! model endpoints.
//!
//! A handler receives an immutable item view, the latest prior-stage
//! artifacts and a per-attempt [`ToolSurface`], and must report its outcome
//! through `write_result` exactly once. The built-in handlers drive an
//! OpenAI-compatible chat endpoint through [`chat::run_tool_loop`], bridging
//! the model's `write_to_database` and `brave_web_search` tool calls onto
//! the surface.

pub mod chat;
pub mod error;
pub mod handler;
pub mod search;
pub mod stages;
pub mod tools;

pub use chat::{ChatMessage, ChatRequest, ChatResponse, ChatTransport, HttpChatTransport};
pub use error::AgentError;
pub use handler::{HandlerRegistry, ItemView, PriorArtifacts, StageHandler};
pub use search::{SearchConfig, SearchHit, SearchOptions, WebSearchClient};
pub use stages::{default_registry, LlmStageHandler, DEFAULT_TOOL_CALL_CAP};
pub use tools::ToolSurface;
