//! Web-search tool client.
//!
//! Speaks the Brave-shaped search API: a single GET with `q`, `count`,
//! `search_lang`, `country`, `safesearch` and an optional `freshness`
//! filter, subscription key in the `X-Subscription-Token` header. A
//! process-local rate limiter bounds the request rate; the external
//! provider's own limiting remains the authority across processes.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

const MAX_RESULT_COUNT: u32 = 20;

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub requests_per_second: u32,
    pub timeout_seconds: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.search.brave.com/res/v1/web/search".to_string(),
            api_key_env: "BRAVE_API_KEY".to_string(),
            requests_per_second: 1,
            timeout_seconds: 30,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub count: Option<u32>,
    pub lang: Option<String>,
    pub country: Option<String>,
    pub safesearch: Option<String>,
    pub freshness: Option<String>,
}

/// One parsed search result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub description: String,
    pub published: Option<String>,
}

pub struct WebSearchClient {
    config: SearchConfig,
    client: reqwest::Client,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl WebSearchClient {
    pub fn new(config: SearchConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second.max(1))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            client: reqwest::Client::new(),
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            config,
        }
    }

    /// Consume one slot of the local request budget.
    pub fn try_acquire(&self) -> Result<(), AgentError> {
        self.limiter.check().map_err(|_| AgentError::RateLimited)
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, AgentError> {
        self.try_acquire()?;
        let key = std::env::var(&self.config.api_key_env)
            .map_err(|_| AgentError::MissingSecret(self.config.api_key_env.clone()))?;

        let count = opts.count.unwrap_or(10).min(MAX_RESULT_COUNT).to_string();
        let mut params = vec![
            ("q", query.to_string()),
            ("count", count),
            ("search_lang", opts.lang.clone().unwrap_or_else(|| "en".into())),
            ("country", opts.country.clone().unwrap_or_else(|| "US".into())),
            (
                "safesearch",
                opts.safesearch.clone().unwrap_or_else(|| "moderate".into()),
            ),
        ];
        if let Some(freshness) = &opts.freshness {
            params.push(("freshness", freshness.clone()));
        }

        let response = self
            .client
            .get(&self.config.base_url)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .header("Accept", "application/json")
            .header("X-Subscription-Token", key)
            .query(&params)
            .send()
            .await
            .map_err(AgentError::from_http)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AgentError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| AgentError::Protocol(format!("search response: {}", e)))?;
        Ok(parse_search_results(&body))
    }
}

/// Pull the web results out of a provider response body.
pub fn parse_search_results(body: &Value) -> Vec<SearchHit> {
    body.get("web")
        .and_then(|web| web.get("results"))
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .map(|result| SearchHit {
                    title: str_field(result, "title"),
                    url: str_field(result, "url"),
                    description: str_field(result, "description"),
                    published: result
                        .get("age")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
