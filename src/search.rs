//! Vector retrieval against an Azure AI Search index.
//!
//! The index is expected to hold one document per chunk with the fields
//! listed in [`SELECT_FIELDS`] and a vector field (default
//! `content_vector`). Results come back in the index's relevance order and
//! that order is preserved; it determines citation numbering downstream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::SearchConfig;
use crate::error::UpstreamError;
use crate::models::Passage;
use crate::retry::send_with_retry;

/// Fields requested for every hit.
pub const SELECT_FIELDS: &str =
    "id,content,doc_id,course_id,module_id,path,source_type,page_num,chunk_num,content_hash";

/// Returns the passages nearest to a query vector.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// `filter` is an equality expression as built by
    /// [`Filters::to_expression`](crate::filter::Filters::to_expression).
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<Passage>, UpstreamError>;
}

/// Retriever backed by the Azure AI Search REST API.
pub struct AzureSearchRetriever {
    client: reqwest::Client,
    url: String,
    api_key: String,
    vector_field: String,
    max_retries: u32,
}

impl AzureSearchRetriever {
    /// # Errors
    ///
    /// Returns an error if the API key variable is unset or the HTTP client
    /// cannot be built.
    pub fn new(config: &SearchConfig) -> anyhow::Result<Self> {
        let api_key = config.api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: format!(
                "{}/indexes/{}/docs/search?api-version={}",
                config.endpoint.trim_end_matches('/'),
                config.index_name,
                config.api_version
            ),
            api_key,
            vector_field: config.vector_field.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody<'a> {
    search: &'a str,
    top: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
    select: &'a str,
    vector_queries: [VectorQuery<'a>; 1],
}

#[derive(Serialize)]
struct VectorQuery<'a> {
    kind: &'a str,
    vector: &'a [f32],
    k: usize,
    fields: &'a str,
}

#[derive(Deserialize)]
struct SearchResponse {
    value: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "@search.score", default)]
    score: f64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    doc_id: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    page_num: Option<i64>,
    #[serde(default)]
    chunk_num: Option<i64>,
    #[serde(default)]
    course_id: Option<String>,
    #[serde(default)]
    module_id: Option<String>,
    #[serde(default)]
    source_type: Option<String>,
}

impl From<SearchHit> for Passage {
    fn from(hit: SearchHit) -> Self {
        Passage {
            id: hit.id,
            content: hit.content.unwrap_or_default(),
            doc_id: hit.doc_id.unwrap_or_default(),
            path: hit.path,
            page_num: hit.page_num,
            chunk_num: hit.chunk_num,
            course_id: hit.course_id,
            module_id: hit.module_id,
            source_type: hit.source_type,
            score: hit.score,
        }
    }
}

fn search_body<'a>(
    vector: &'a [f32],
    k: usize,
    filter: Option<&'a str>,
    vector_field: &'a str,
) -> SearchBody<'a> {
    SearchBody {
        search: "*",
        top: k,
        filter: filter.filter(|f| !f.is_empty()),
        select: SELECT_FIELDS,
        vector_queries: [VectorQuery {
            kind: "vector",
            vector,
            k,
            fields: vector_field,
        }],
    }
}

fn parse_hits(response: SearchResponse) -> Vec<Passage> {
    response.value.into_iter().map(Passage::from).collect()
}

#[async_trait]
impl Retriever for AzureSearchRetriever {
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<Passage>, UpstreamError> {
        let body = search_body(vector, k, filter, &self.vector_field);
        debug!(k, filter = filter.unwrap_or(""), "vector search");

        let response = send_with_retry("search", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("api-key", &self.api_key)
                .json(&body)
        })
        .await
        .map_err(UpstreamError::Search)?;

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("search response: {}", e)))?;

        Ok(parse_hits(parsed))
    }
}
