//! Evidence search collaborator.
//!
//! The engine only depends on the `EvidenceSearch` trait; the shipped
//! implementation talks to the Tavily web-search API. A failed or
//! timed-out call surfaces as `EngineError::Upstream` and is never
//! interpreted as a low-confidence answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub answer: Option<String>,
}

#[async_trait]
pub trait EvidenceSearch: Send + Sync {
    async fn search(
        &self,
        queries: &[String],
        max_results: usize,
    ) -> Result<SearchResponse, EngineError>;
}

pub struct TavilyClient {
    http: reqwest::Client,
    api_key: String,
    timeout: Duration,
}

impl TavilyClient {
    pub fn new(http: reqwest::Client, api_key: String, timeout: Duration) -> Self {
        Self {
            http,
            api_key,
            timeout,
        }
    }

    async fn search_one(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<TavilyResponse, EngineError> {
        let req = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results,
            include_answer: true,
        };
        let resp = self
            .http
            .post("https://api.tavily.com/search")
            .timeout(self.timeout)
            .json(&req)
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("tavily request: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(EngineError::upstream(format!(
                "tavily {}: {snippet}",
                status.as_u16()
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| EngineError::upstream(format!("tavily json parse: {e}")))
    }
}

#[async_trait]
impl EvidenceSearch for TavilyClient {
    async fn search(
        &self,
        queries: &[String],
        max_results: usize,
    ) -> Result<SearchResponse, EngineError> {
        let mut merged = SearchResponse::default();
        for query in queries {
            let resp = self.search_one(query, max_results).await?;
            if merged.answer.is_none() {
                merged.answer = resp.answer.filter(|a| !a.trim().is_empty());
            }
            for result in resp.results {
                // Dedupe across queries by URL.
                if !merged.results.iter().any(|r| r.url == result.url) {
                    merged.results.push(result);
                }
            }
        }
        merged
            .results
            .sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.results.truncate(max_results);
        debug!(
            queries = queries.len(),
            results = merged.results.len(),
            "evidence search complete"
        );
        Ok(merged)
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
    #[serde(default)]
    answer: Option<String>,
}
