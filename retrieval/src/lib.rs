use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const MAX_QUESTION_CHARS: usize = 2000;
const MAX_TICKER_CHARS: usize = 10;

const PROMPT_PREAMBLE: &str = "Use the following pieces of context to answer the question at the end. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("question is longer than {} characters", MAX_QUESTION_CHARS)]
    QuestionTooLong,
    #[error("invalid ticker: {0:?}")]
    InvalidTicker(String),
    #[error("embedding request failed: {0}")]
    Embedding(String),
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("completion request failed: {0}")]
    Completion(String),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::EmptyQuestion | QueryError::QuestionTooLong => "invalid_question",
            QueryError::InvalidTicker(_) => "invalid_ticker",
            QueryError::Embedding(_) => "embedding",
            QueryError::IndexUnavailable(_) => "index_unavailable",
            QueryError::Completion(_) => "completion",
        }
    }
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passage {
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub ticker: Option<String>,
}

/// Metadata filter applied by the vector index, independent of the query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalFilter {
    pub ticker: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub filter: RetrievalFilter,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> anyhow::Result<Vec<Passage>>;
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Found { text: String, passages: usize },
    NotFound { ticker: String },
}

impl Answer {
    pub fn message(&self) -> String {
        match self {
            Answer::Found { text, .. } => text.clone(),
            Answer::NotFound { ticker } => {
                format!("No information found for {ticker} in the indexed documents.")
            }
        }
    }
}

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn answer(&self, ticker: &str, question: &str) -> QueryResult<Answer>;
}

/// Upper-cases and checks a ticker symbol (`BRK.B`, `RDS-A` are fine).
pub fn normalize_ticker(ticker: &str) -> QueryResult<String> {
    let trimmed = ticker.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_TICKER_CHARS
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !valid {
        return Err(QueryError::InvalidTicker(ticker.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

pub fn validate_question(question: &str) -> QueryResult<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(QueryError::EmptyQuestion);
    }
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(QueryError::QuestionTooLong);
    }
    Ok(trimmed)
}

/// Stuffs every passage into a single prompt.
pub fn build_prompt(ticker: &str, question: &str, passages: &[Passage]) -> String {
    let context = passages
        .iter()
        .map(|p| p.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{PROMPT_PREAMBLE}\n\n{context}\n\nQuestion about {ticker}: {question}\nHelpful Answer:")
}

/// Escapes `$` so markdown renderers do not start math mode.
pub fn escape_dollars(text: &str) -> String {
    text.replace('$', "\\$")
}

pub struct RagQueryService {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    model: Arc<dyn CompletionModel>,
    top_k: usize,
}

impl RagQueryService {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        model: Arc<dyn CompletionModel>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            model,
            top_k: top_k.max(1),
        }
    }
}

#[async_trait]
impl QueryService for RagQueryService {
    async fn answer(&self, ticker: &str, question: &str) -> QueryResult<Answer> {
        let ticker = normalize_ticker(ticker)?;
        let question = validate_question(question)?;

        let vector = self
            .embedder
            .embed(question)
            .await
            .map_err(|err| QueryError::Embedding(format!("{err:#}")))?;

        let request = SearchRequest {
            vector,
            filter: RetrievalFilter {
                ticker: ticker.clone(),
            },
            limit: self.top_k,
        };
        let passages: Vec<Passage> = self
            .index
            .search(&request)
            .await
            .map_err(|err| QueryError::IndexUnavailable(format!("{err:#}")))?
            .into_iter()
            .filter(|p| !p.text.trim().is_empty())
            .collect();
        debug!(%ticker, passages = passages.len(), "vector search finished");

        if passages.is_empty() {
            info!(%ticker, "no passages matched");
            return Ok(Answer::NotFound { ticker });
        }

        let completion = self
            .model
            .complete(&CompletionRequest {
                prompt: build_prompt(&ticker, question, &passages),
                temperature: 0.0,
            })
            .await
            .map_err(|err| QueryError::Completion(format!("{err:#}")))?;

        let text = completion.trim();
        if text.is_empty() {
            return Ok(Answer::NotFound { ticker });
        }

        Ok(Answer::Found {
            text: escape_dollars(text),
            passages: passages.len(),
        })
    }
}
