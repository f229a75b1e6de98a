//! OpenAI-compatible chat wire types and the tool-call bridge loop.
//!
//! Both provider kinds speak `POST {base}/v1/chat/completions` with
//! `{model, messages, tools?}` and a models discovery endpoint at
//! `GET {base}/v1/models`. Hosted providers additionally get an
//! `Authorization: Bearer` header whose secret is read from the process
//! environment at call time, so rotating a credential never needs a
//! restart.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use factlane_store::{EndpointBinding, ProviderKind};

use crate::error::AgentError;
use crate::tools::{dispatch_tool_call, ToolSurface};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool(call_id: Option<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: call_id,
            name: Some(name.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: ToolCallFunction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Some servers send arguments as a JSON object, others as an encoded
    /// string; both shapes are accepted.
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCallFunction {
    pub fn parsed_arguments(&self) -> Result<Value, AgentError> {
        match &self.arguments {
            Value::String(raw) => serde_json::from_str(raw)
                .map_err(|e| AgentError::Protocol(format!("tool arguments: {}", e))),
            other => Ok(other.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    pub stream: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
}

#[derive(Clone, Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Clone, Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Seam between the tool loop and the actual HTTP provider, so the loop is
/// testable against scripted responses.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat(
        &self,
        binding: &EndpointBinding,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AgentError>;

    /// Capability discovery: the model identifiers the endpoint serves.
    async fn list_models(&self, binding: &EndpointBinding) -> Result<Vec<String>, AgentError>;
}

/// Production transport over reqwest.
#[derive(Clone)]
pub struct HttpChatTransport {
    client: reqwest::Client,
}

impl HttpChatTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn authorize(
        &self,
        binding: &EndpointBinding,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, AgentError> {
        if binding.provider == ProviderKind::Hosted {
            let key = binding
                .auth_env_key
                .as_deref()
                .ok_or_else(|| AgentError::MissingSecret("<auth_env_key unset>".into()))?;
            let secret =
                std::env::var(key).map_err(|_| AgentError::MissingSecret(key.to_string()))?;
            Ok(request.bearer_auth(secret))
        } else {
            Ok(request)
        }
    }
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn chat(
        &self,
        binding: &EndpointBinding,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AgentError> {
        let url = format!("{}/v1/chat/completions", binding.base_url.trim_end_matches('/'));
        let builder = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(binding.timeout_seconds))
            .json(request);
        let response = self
            .authorize(binding, builder)?
            .send()
            .await
            .map_err(AgentError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| AgentError::Protocol(format!("chat response: {}", e)))
    }

    async fn list_models(&self, binding: &EndpointBinding) -> Result<Vec<String>, AgentError> {
        let url = format!("{}/v1/models", binding.base_url.trim_end_matches('/'));
        let builder = self.client.get(&url).timeout(Duration::from_secs(10));
        let response = self
            .authorize(binding, builder)?
            .send()
            .await
            .map_err(AgentError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        let models = response
            .json::<ModelList>()
            .await
            .map_err(|e| AgentError::Protocol(format!("models response: {}", e)))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

/// Drive the model until it produces a final assistant message.
///
/// Every tool call the model emits is executed against `surface` and its
/// JSON result appended as a `tool` message before the next round. The loop
/// ends on an assistant message with no tool calls, or fails with
/// [`AgentError::ToolLoopExceeded`] once `max_tool_calls` have run.
pub async fn run_tool_loop(
    transport: &dyn ChatTransport,
    binding: &EndpointBinding,
    mut messages: Vec<ChatMessage>,
    tool_defs: Vec<Value>,
    surface: &ToolSurface,
    max_tool_calls: usize,
) -> Result<ChatMessage, AgentError> {
    let tools = if tool_defs.is_empty() {
        None
    } else {
        Some(tool_defs)
    };
    let mut executed = 0usize;

    loop {
        let request = ChatRequest {
            model: binding.model.clone(),
            messages: messages.clone(),
            tools: tools.clone(),
            stream: false,
        };
        let response = transport.chat(binding, &request).await?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AgentError::Protocol("response carried no choices".into()))?;

        let calls = message.tool_calls.clone().unwrap_or_default();
        if calls.is_empty() {
            return Ok(message);
        }

        messages.push(message);
        for call in calls {
            executed += 1;
            if executed > max_tool_calls {
                return Err(AgentError::ToolLoopExceeded(max_tool_calls));
            }
            debug!(tool = %call.function.name, round = executed, "bridging model tool call");
            let result = dispatch_tool_call(surface, &call).await;
            let encoded = serde_json::to_string(&result)
                .map_err(|e| AgentError::Protocol(format!("encode tool result: {}", e)))?;
            messages.push(ChatMessage::tool(call.id.clone(), call.function.name.clone(), encoded));
        }
    }
}
