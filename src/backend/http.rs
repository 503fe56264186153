//! HTTP adapters: an Ollama embedder and a Cohere/TEI-style reranker.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{QueryEmbedder, RerankPolicy, Reranker};
use crate::error::{FerretError, Result};

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("ferret/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Embeddings from a local Ollama instance (`POST /api/embed`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(FerretError::MissingConfig("backend.embedding_url".to_string()));
        }
        Ok(Self {
            client: build_client(timeout)?,
            url: join_url(base_url, "api/embed"),
            model: model.to_string(),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.url)
            .json(&OllamaEmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FerretError::backend(
                "ollama",
                format!("embed returned {status}: {body}"),
            ));
        }

        let parsed: OllamaEmbedResponse = response.json().await?;
        if parsed.embeddings.len() != texts.len() {
            return Err(FerretError::backend(
                "ollama",
                format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            ));
        }
        if parsed.embeddings.iter().any(Vec::is_empty) {
            return Err(FerretError::backend("ollama", "empty embedding in response"));
        }
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl QueryEmbedder for OllamaEmbedder {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.request(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| FerretError::backend("ollama", "no embedding returned"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

/// Cross-encoder reranker behind a `POST /rerank` endpoint.
///
/// Accepts both the Cohere shape (`{"results": [{"index", "relevance_score"}]}`)
/// and the bare TEI shape (`[{"index", "score"}]`).
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
    policy: RerankPolicy,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    texts: &'a [String],
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RerankResponse {
    Wrapped { results: Vec<RerankHit> },
    Bare(Vec<RerankHit>),
}

#[derive(Deserialize)]
struct RerankHit {
    index: usize,
    #[serde(alias = "score")]
    relevance_score: f32,
}

impl HttpReranker {
    pub fn new(base_url: &str, model: &str, policy: RerankPolicy, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(FerretError::MissingConfig("backend.rerank_url".to_string()));
        }
        Ok(Self {
            client: build_client(timeout)?,
            url: join_url(base_url, "rerank"),
            model: model.to_string(),
            policy,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    fn policy(&self) -> RerankPolicy {
        self.policy
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&RerankRequest {
                model: &self.model,
                query,
                documents: candidates,
                texts: candidates,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FerretError::backend(
                "rerank",
                format!("rerank returned {status}: {body}"),
            ));
        }

        let hits = match response.json::<RerankResponse>().await? {
            RerankResponse::Wrapped { results } => results,
            RerankResponse::Bare(results) => results,
        };

        let mut scores = vec![None; candidates.len()];
        for hit in hits {
            let slot = scores.get_mut(hit.index).ok_or_else(|| {
                FerretError::backend("rerank", format!("result index {} out of range", hit.index))
            })?;
            *slot = Some(hit.relevance_score);
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(idx, score)| {
                score.ok_or_else(|| {
                    FerretError::backend("rerank", format!("no score for candidate {idx}"))
                })
            })
            .collect()
    }
}
