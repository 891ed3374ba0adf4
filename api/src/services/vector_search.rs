use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use retrieval::{Passage, SearchRequest, VectorIndex};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::VectorSearchConfig;

const MAX_NUM_CANDIDATES: usize = 10_000;

/// `$vectorSearch` over an Atlas collection through the Data API.
pub struct AtlasVectorIndex {
    client: Client,
    endpoint: String,
    config: VectorSearchConfig,
}

#[derive(Deserialize)]
struct AggregateResponse {
    documents: Vec<Value>,
}

impl AtlasVectorIndex {
    pub fn new(config: VectorSearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build vector search client")?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/action/aggregate",
                config.data_api_url.trim_end_matches('/')
            ),
            config,
        })
    }

    fn request_body(&self, request: &SearchRequest) -> Value {
        json!({
            "dataSource": self.config.data_source,
            "database": self.config.database,
            "collection": self.config.collection,
            "pipeline": search_pipeline(&self.config, request),
        })
    }
}

/// The ticker goes into the structured `filter`, never into the vector text.
fn search_pipeline(config: &VectorSearchConfig, request: &SearchRequest) -> Value {
    let mut filter = serde_json::Map::new();
    filter.insert(
        config.ticker_field.clone(),
        json!({ "$eq": request.filter.ticker }),
    );

    json!([
        {
            "$vectorSearch": {
                "index": config.index_name,
                "path": config.embedding_field,
                "queryVector": request.vector,
                "numCandidates": request.limit.saturating_mul(10).min(MAX_NUM_CANDIDATES),
                "limit": request.limit,
                "filter": Value::Object(filter),
            }
        },
        {
            "$project": {
                "_id": 0,
                "text": format!("${}", config.text_field),
                "ticker": format!("${}", config.ticker_field),
                "score": { "$meta": "vectorSearchScore" },
            }
        }
    ])
}

fn passage_from_document(doc: &Value) -> Option<Passage> {
    let text = doc.get("text")?.as_str()?.to_string();
    Some(Passage {
        text,
        score: doc.get("score").and_then(Value::as_f64).unwrap_or(0.0),
        ticker: doc
            .get("ticker")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[async_trait]
impl VectorIndex for AtlasVectorIndex {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Passage>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("api-key", &self.config.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .context("vector search request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("vector search returned {status}: {error_text}");
        }
        let body: AggregateResponse = resp
            .json()
            .await
            .context("failed to decode vector search response")?;
        Ok(body
            .documents
            .iter()
            .filter_map(passage_from_document)
            .collect())
    }
}
