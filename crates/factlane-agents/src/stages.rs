//! Built-in model-driven handlers for the four analysis stages.
//!
//! Each handler assembles the stage's message sequence from the item and
//! the prior artifacts, then lets [`run_tool_loop`] drive the endpoint
//! until the model records its decision through `write_to_database`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use factlane_store::{EndpointBinding, Stage};

use crate::chat::{run_tool_loop, ChatMessage, ChatTransport};
use crate::error::AgentError;
use crate::handler::{HandlerRegistry, ItemView, PriorArtifacts, StageHandler};
use crate::tools::ToolSurface;

/// Tool-call budget per handler invocation.
pub const DEFAULT_TOOL_CALL_CAP: usize = 8;

pub struct LlmStageHandler {
    stage: Stage,
    transport: Arc<dyn ChatTransport>,
    tool_call_cap: usize,
}

impl LlmStageHandler {
    pub fn new(stage: Stage, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            stage,
            transport,
            tool_call_cap: DEFAULT_TOOL_CALL_CAP,
        }
    }

    pub fn with_tool_call_cap(mut self, cap: usize) -> Self {
        self.tool_call_cap = cap;
        self
    }

    fn build_messages(&self, item: &ItemView, priors: &PriorArtifacts) -> Vec<ChatMessage> {
        let system = match self.stage {
            Stage::Triage => TRIAGE_PROMPT,
            Stage::Research => RESEARCH_PROMPT,
            Stage::Response => RESPONSE_PROMPT,
            Stage::Editorial => EDITORIAL_PROMPT,
            _ => GENERIC_PROMPT,
        };
        vec![
            ChatMessage::system(system),
            ChatMessage::user(user_message(self.stage, item, priors)),
        ]
    }
}

#[async_trait]
impl StageHandler for LlmStageHandler {
    async fn handle(
        &self,
        item: &ItemView,
        priors: &PriorArtifacts,
        tools: &ToolSurface,
        cfg: &EndpointBinding,
    ) -> Result<(), AgentError> {
        let messages = self.build_messages(item, priors);
        let tool_defs = tools.tool_definitions();
        run_tool_loop(
            self.transport.as_ref(),
            cfg,
            messages,
            tool_defs,
            tools,
            self.tool_call_cap,
        )
        .await?;

        if tools.decided().is_none() {
            return Err(AgentError::NoDecision);
        }
        Ok(())
    }
}

/// Registry wiring every analysis stage to its model-driven handler.
pub fn default_registry(transport: Arc<dyn ChatTransport>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for stage in [Stage::Triage, Stage::Research, Stage::Response, Stage::Editorial] {
        registry.register(stage, Arc::new(LlmStageHandler::new(stage, transport.clone())));
    }
    registry
}

fn user_message(stage: Stage, item: &ItemView, priors: &PriorArtifacts) -> String {
    let mut message = format!(
        "Process this submission.\n\nTitle: {}\nAuthor: {}\nPosted: {}\nURL: {}\n\nBody:\n{}\n",
        item.title,
        item.author,
        item.created_utc.to_rfc3339(),
        item.url.as_deref().unwrap_or("(none)"),
        if item.body.is_empty() { "(empty)" } else { &item.body },
    );
    for (prior_stage, payload) in priors {
        message.push_str(&format!(
            "\n--- {} result ---\n{}\n",
            prior_stage,
            serde_json::to_string_pretty(payload).unwrap_or_else(|_| Value::Null.to_string()),
        ));
    }
    message.push_str(&format!(
        "\nYou are handling the `{}` stage. Record your result with the write_to_database tool.",
        stage
    ));
    message
}

const TRIAGE_PROMPT: &str = "You are a triage analyst. Decide whether the submission makes \
specific, verifiable factual claims worth researching. Extract each claim precisely, assign a \
priority from 1 to 10, and record your analysis with write_to_database: set next_stage to \
\"research\" when the submission qualifies, or \"rejected\" when it is opinion, satire or \
carries no checkable claim.";

const RESEARCH_PROMPT: &str = "You are a research analyst. Investigate each claim from the \
triage result with brave_web_search: look for primary sources, recent data and contradicting \
evidence, and note source credibility. Record your findings with write_to_database: set \
next_stage to \"response\" when research is conclusive enough to answer, or \"rejected\" when \
the claims are unverifiable.";

const RESPONSE_PROMPT: &str = "You are a response writer. Using the triage and research \
results, draft a factual, sourced reply to the submission. Cite the strongest sources and keep \
a neutral tone. Record the draft with write_to_database and set next_stage to \"editorial\".";

const EDITORIAL_PROMPT: &str = "You are an editor. Polish the drafted response for clarity, \
accuracy against the research findings, and tone. Record the final text with write_to_database \
and set next_stage to \"post_queue\".";

const GENERIC_PROMPT: &str = "Process the submission for your stage and record the result with \
write_to_database.";
