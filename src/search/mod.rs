//! Web search collaborator
//!
//! Pluggable providers behind [`SearchProvider`]. Each returns a short,
//! ordered list of `{title, snippet, url}` hits; provider failures come back
//! as `SearchError`.

use crate::config::{SearchProviderKind, Settings};
use crate::error::OrchestrationError;
use crate::models::SearchHit;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hits requested per query unless a caller asks otherwise
pub const DEFAULT_MAX_RESULTS: usize = 3;

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>>;
}

/// Build the configured provider. A provider without its key degrades to
/// [`DisabledSearch`].
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn SearchProvider>> {
    let provider: Arc<dyn SearchProvider> = match settings.search_provider {
        SearchProviderKind::Serper if !settings.serper_api_key.is_empty() => {
            Arc::new(SerperSearch::new(settings.serper_api_key.clone())?)
        }
        SearchProviderKind::Tavily if !settings.tavily_api_key.is_empty() => {
            Arc::new(TavilySearch::new(settings.tavily_api_key.clone())?)
        }
        SearchProviderKind::Disabled => Arc::new(DisabledSearch),
        kind => {
            warn!(provider = ?kind, "Search provider key missing, web search disabled");
            Arc::new(DisabledSearch)
        }
    };
    Ok(provider)
}

fn http_client() -> Result<Client> {
    Ok(Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(Duration::from_secs(20))
        .build()?)
}

async fn read_json(provider: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OrchestrationError::SearchError(format!(
            "{} returned {}: {}",
            provider, status, body
        )));
    }
    response.json::<Value>().await.map_err(|e| {
        OrchestrationError::SearchError(format!("Failed to parse {} response: {}", provider, e))
    })
}

fn text_field(item: &Value, key: &str) -> String {
    item.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Google results through serper.dev
pub struct SerperSearch {
    client: Client,
    api_key: String,
}

impl SerperSearch {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
        })
    }
}

#[async_trait]
impl SearchProvider for SerperSearch {
    fn name(&self) -> &str {
        "serper"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": query, "num": max_results }))
            .send()
            .await
            .map_err(|e| OrchestrationError::SearchError(format!("Serper request failed: {}", e)))?;

        let data = read_json("Serper", response).await?;
        let hits = data
            .get("organic")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(max_results)
                    .map(|item| SearchHit {
                        title: text_field(item, "title"),
                        snippet: text_field(item, "snippet"),
                        url: text_field(item, "link"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(provider = "serper", query, "Search complete");
        Ok(hits)
    }
}

pub struct TavilySearch {
    client: Client,
    api_key: String,
}

impl TavilySearch {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
        })
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let body = json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": max_results,
            "include_answer": false,
        });

        let response = self
            .client
            .post("https://api.tavily.com/search")
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestrationError::SearchError(format!("Tavily request failed: {}", e)))?;

        let data = read_json("Tavily", response).await?;
        let hits = data
            .get("results")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(max_results)
                    .map(|item| SearchHit {
                        title: text_field(item, "title"),
                        snippet: text_field(item, "content"),
                        url: text_field(item, "url"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(provider = "tavily", query, "Search complete");
        Ok(hits)
    }
}

/// Provider used when search is switched off: every query fails.
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<SearchHit>> {
        Err(OrchestrationError::SearchError("web search is disabled".to_string()))
    }
}

/// Canned hits keyed by a case-insensitive query substring. Records queries.
#[derive(Default)]
pub struct StaticSearch {
    entries: Vec<(String, SearchHit)>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hit(mut self, needle: &str, title: &str, snippet: &str) -> Self {
        self.entries.push((
            needle.to_lowercase(),
            SearchHit {
                title: title.to_string(),
                snippet: snippet.to_string(),
                url: format!("https://example.org/{}", needle.to_lowercase().replace(' ', "-")),
            },
        ));
        self
    }

    /// Make every query fail as a provider outage would.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub async fn queries(&self) -> Vec<String> {
        self.queries.lock().await.clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        self.queries.lock().await.push(query.to_string());
        if self.fail {
            return Err(OrchestrationError::SearchError("search provider unavailable".to_string()));
        }
        let needle = query.to_lowercase();
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| needle.contains(key.as_str()))
            .map(|(_, hit)| hit.clone())
            .take(max_results)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_search_matches_substring() {
        let search = StaticSearch::new()
            .with_hit("tango", "Tango Energy", "Electricity retailer")
            .with_hit("uber eats", "Uber Eats", "Food delivery");

        let hits = search.search("TANGO ENERGY PTY", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Tango Energy");
        assert!(search.search("unrelated", 3).await.unwrap().is_empty());
        assert_eq!(search.queries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_search_fails() {
        assert!(DisabledSearch.search("anything", 3).await.is_err());
        assert!(StaticSearch::failing().search("x", 3).await.is_err());
    }

    #[test]
    fn test_missing_key_degrades_to_disabled() {
        let settings = Settings::from_lookup(|key| match key {
            "SEARCH_PROVIDER" => Some("tavily".to_string()),
            _ => None,
        })
        .unwrap();
        let provider = from_settings(&settings).unwrap();
        assert_eq!(provider.name(), "disabled");
    }
}
