//! Per-attempt tool surface handed to stage handlers.
//!
//! The surface is bound to one `(item, attempt)` pair and localizes the
//! at-most-one-decision invariant: the first `write_result` persists the
//! artifact and the transition in a single store transaction, every later
//! call fails with `AlreadyDecided` and mutates nothing.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use factlane_store::{Directive, SqliteQueueStore, Stage};

use crate::chat::ToolCall;
use crate::error::AgentError;
use crate::search::{SearchHit, SearchOptions, WebSearchClient};

/// Wire names of the bridged tools.
pub const TOOL_WRITE_RESULT: &str = "write_to_database";
pub const TOOL_WEB_SEARCH: &str = "brave_web_search";

pub struct ToolSurface {
    store: SqliteQueueStore,
    item_id: i64,
    stage: Stage,
    decided: Mutex<Option<Directive>>,
    search: Option<Arc<WebSearchClient>>,
}

impl ToolSurface {
    pub fn new(
        store: SqliteQueueStore,
        item_id: i64,
        stage: Stage,
        search: Option<Arc<WebSearchClient>>,
    ) -> Self {
        Self {
            store,
            item_id,
            stage,
            decided: Mutex::new(None),
            search,
        }
    }

    pub fn item_id(&self) -> i64 {
        self.item_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Persist the stage artifact and apply the transition directive.
    /// At most one call per attempt takes effect.
    pub fn write_result(&self, payload: Value, directive: Directive) -> Result<(), AgentError> {
        let mut decided = self
            .decided
            .lock()
            .map_err(|_| AgentError::Protocol("tool surface lock poisoned".into()))?;
        if decided.is_some() {
            return Err(AgentError::AlreadyDecided);
        }
        self.store.write_artifact_and_transition(
            self.item_id,
            self.stage,
            &payload,
            &directive,
            Utc::now(),
        )?;
        *decided = Some(directive);
        Ok(())
    }

    /// The directive recorded by this attempt, if any.
    pub fn decided(&self) -> Option<Directive> {
        self.decided.lock().ok().and_then(|guard| guard.clone())
    }

    pub async fn web_search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, AgentError> {
        let Some(client) = self.search.as_ref() else {
            return Err(AgentError::Protocol(
                "web search is not available for this stage".into(),
            ));
        };
        client.search(query, opts).await
    }

    /// Tool definitions advertised to the model for this attempt.
    pub fn tool_definitions(&self) -> Vec<Value> {
        let mut defs = vec![write_result_tool_definition()];
        if self.search.is_some() {
            defs.insert(0, web_search_tool_definition());
        }
        defs
    }
}

/// Execute one model tool call against the surface.
///
/// Tool-level failures are reported back to the model as structured JSON so
/// it can recover within the conversation; only transport and protocol
/// errors abort the loop.
pub async fn dispatch_tool_call(surface: &ToolSurface, call: &ToolCall) -> Value {
    let args = match call.function.parsed_arguments() {
        Ok(args) => args,
        Err(err) => return json!({ "success": false, "error": err.to_string() }),
    };
    match call.function.name.as_str() {
        TOOL_WRITE_RESULT => dispatch_write_result(surface, &args),
        TOOL_WEB_SEARCH => dispatch_web_search(surface, &args).await,
        other => json!({ "success": false, "error": format!("tool `{}` not implemented", other) }),
    }
}

fn dispatch_write_result(surface: &ToolSurface, args: &Value) -> Value {
    let Some(content) = args.get("content").filter(|c| c.is_object()) else {
        return json!({ "success": false, "error": "content object is required" });
    };
    if content.get("result").and_then(Value::as_str).is_none() {
        return json!({ "success": false, "error": "content.result is required" });
    }

    let next_stage = args.get("next_stage").and_then(Value::as_str);
    let directive = match Directive::from_next_stage(next_stage) {
        Ok(directive) => directive,
        Err(err) => return json!({ "success": false, "error": err.to_string() }),
    };

    if let Some(priority) = args.get("priority").and_then(Value::as_i64) {
        if let Err(err) = surface.store.update_priority(surface.item_id, priority.clamp(1, 10)) {
            warn!(item_id = surface.item_id, error = %err, "priority update failed");
        }
    }

    let payload = json!({
        "stage": surface.stage,
        "content": content,
        "priority": args.get("priority").cloned().unwrap_or(Value::Null),
    });
    match surface.write_result(payload, directive) {
        Ok(()) => json!({
            "success": true,
            "message": format!("saved {} result for item {}", surface.stage, surface.item_id),
            "item_id": surface.item_id,
            "stage": surface.stage,
            "next_stage": next_stage,
        }),
        Err(err) => json!({ "success": false, "error": err.to_string() }),
    }
}

async fn dispatch_web_search(surface: &ToolSurface, args: &Value) -> Value {
    let Some(query) = args.get("query").and_then(Value::as_str) else {
        return json!({ "success": false, "error": "query parameter is required" });
    };
    let opts = SearchOptions {
        count: args.get("count").and_then(Value::as_u64).map(|c| c as u32),
        lang: args
            .get("search_lang")
            .and_then(Value::as_str)
            .map(str::to_string),
        country: args
            .get("country")
            .and_then(Value::as_str)
            .map(str::to_string),
        safesearch: args
            .get("safesearch")
            .and_then(Value::as_str)
            .map(str::to_string),
        freshness: args
            .get("freshness")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    match surface.web_search(query, &opts).await {
        Ok(hits) => json!({
            "success": true,
            "query": query,
            "total_results": hits.len(),
            "web_results": hits,
        }),
        Err(err) => json!({ "success": false, "error": err.to_string(), "query": query }),
    }
}

fn write_result_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": TOOL_WRITE_RESULT,
            "description": "Write the stage result to the pipeline database and decide the next stage",
            "parameters": {
                "type": "object",
                "properties": {
                    "content": {
                        "type": "object",
                        "description": "The structured stage result",
                        "properties": {
                            "result": { "type": "string", "description": "Main result content (required)" },
                            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                            "summary": { "type": "string" },
                            "claims_identified": { "type": "array", "items": { "type": "string" } },
                            "sources": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "url": { "type": "string" },
                                        "title": { "type": "string" },
                                        "credibility": { "type": "string" }
                                    }
                                }
                            },
                            "fact_check_status": {
                                "type": "string",
                                "enum": ["true", "false", "mixed", "unverifiable", "pending"]
                            },
                            "reasoning": { "type": "string" },
                            "tags": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["result"]
                    },
                    "next_stage": {
                        "type": "string",
                        "description": "Stage to advance to, or a terminal decision",
                        "enum": ["research", "response", "editorial", "post_queue", "completed", "rejected"]
                    },
                    "priority": {
                        "type": "integer",
                        "description": "Processing priority (1-10, higher is more urgent)",
                        "minimum": 1,
                        "maximum": 10
                    }
                },
                "required": ["content"]
            }
        }
    })
}

fn web_search_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": TOOL_WEB_SEARCH,
            "description": "Search the web to find information about claims and topics",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" },
                    "count": { "type": "integer", "description": "Number of results (1-20)", "default": 10 },
                    "search_lang": { "type": "string", "default": "en" },
                    "country": { "type": "string", "default": "US" },
                    "safesearch": { "type": "string", "enum": ["off", "moderate", "strict"], "default": "moderate" },
                    "freshness": { "type": "string", "description": "pd, pw, pm or py" }
                },
                "required": ["query"]
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use factlane_store::{ItemStatus, NewItem, SqliteQueueStore};
    use serde_json::json;

    fn open_store(name: &str) -> SqliteQueueStore {
        let path = std::env::temp_dir().join(format!(
            "factlane-tools-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteQueueStore::open(path.to_str().expect("utf8 path")).expect("open store")
    }

    fn seeded_item(store: &SqliteQueueStore) -> i64 {
        store
            .insert_item(
                &NewItem {
                    source_id: "abc".into(),
                    title: "T".into(),
                    author: "a".into(),
                    body: "B".into(),
                    url: None,
                    created_utc: Utc::now(),
                    metadata: json!({}),
                },
                Utc::now(),
            )
            .expect("insert")
            .expect("id")
    }

    #[test]
    fn second_write_result_fails_with_already_decided() {
        let store = open_store("at-most-once");
        let id = seeded_item(&store);
        let surface = ToolSurface::new(store.clone(), id, Stage::Triage, None);

        surface
            .write_result(
                json!({"content": {"result": "ok"}}),
                Directive::Advance { next: Stage::Research },
            )
            .expect("first decision");
        let err = surface
            .write_result(json!({"content": {"result": "again"}}), Directive::Reject)
            .expect_err("second decision must fail");
        assert!(matches!(err, AgentError::AlreadyDecided));

        // The second call mutated nothing.
        let item = store.get_item(id).expect("get").expect("exists");
        assert_eq!(item.stage, Stage::Research);
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(store.item_history(id).expect("history").len(), 1);
    }

    #[tokio::test]
    async fn write_tool_call_advances_item_and_reports_success() {
        let store = open_store("dispatch");
        let id = seeded_item(&store);
        let surface = ToolSurface::new(store.clone(), id, Stage::Triage, None);

        let call = ToolCall {
            id: Some("call_0".into()),
            function: crate::chat::ToolCallFunction {
                name: TOOL_WRITE_RESULT.into(),
                arguments: json!({
                    "content": {"result": "claims found", "claims_identified": ["x"]},
                    "next_stage": "research",
                    "priority": 8
                }),
            },
        };
        let result = dispatch_tool_call(&surface, &call).await;
        assert_eq!(result["success"], true);

        let item = store.get_item(id).expect("get").expect("exists");
        assert_eq!(item.stage, Stage::Research);
        assert_eq!(item.priority(), 8);
    }

    #[tokio::test]
    async fn write_tool_call_without_result_is_rejected() {
        let store = open_store("missing-result");
        let id = seeded_item(&store);
        let surface = ToolSurface::new(store.clone(), id, Stage::Triage, None);

        let call = ToolCall {
            id: None,
            function: crate::chat::ToolCallFunction {
                name: TOOL_WRITE_RESULT.into(),
                arguments: json!({ "content": {"confidence": 0.4} }),
            },
        };
        let result = dispatch_tool_call(&surface, &call).await;
        assert_eq!(result["success"], false);
        assert!(surface.decided().is_none());
    }

    #[tokio::test]
    async fn unknown_tool_reports_structured_error() {
        let store = open_store("unknown-tool");
        let id = seeded_item(&store);
        let surface = ToolSurface::new(store, id, Stage::Triage, None);

        let call = ToolCall {
            id: None,
            function: crate::chat::ToolCallFunction {
                name: "launch_rockets".into(),
                arguments: json!({}),
            },
        };
        let result = dispatch_tool_call(&surface, &call).await;
        assert_eq!(result["success"], false);
    }

    #[test]
    fn search_tool_only_advertised_when_available() {
        let store = open_store("tool-defs");
        let id = seeded_item(&store);
        let without = ToolSurface::new(store.clone(), id, Stage::Triage, None);
        assert_eq!(without.tool_definitions().len(), 1);

        let client = Arc::new(WebSearchClient::new(crate::search::SearchConfig::default()));
        let with = ToolSurface::new(store, id, Stage::Research, Some(client));
        let defs = with.tool_definitions();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0]["function"]["name"], TOOL_WEB_SEARCH);
    }
}
