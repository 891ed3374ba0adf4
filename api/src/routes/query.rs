use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use domain::{AnswerStatus, QueryRequest, QueryResponse};
use retrieval::{Answer, QueryError};
use tracing::warn;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/query", post(ask))
}

async fn ask(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, StatusCode> {
    let started = Instant::now();
    let result = state.query.answer(&payload.ticker, &payload.question).await;
    metrics::histogram!("query_latency_seconds").record(started.elapsed().as_secs_f64());

    let answer = result.map_err(|err| {
        metrics::counter!("query_requests_total", "status" => err.kind()).increment(1);
        warn!(error = %err, ticker = %payload.ticker, "query failed");
        map_query_err(&err)
    })?;

    let status = match answer {
        Answer::Found { .. } => AnswerStatus::Found,
        Answer::NotFound { .. } => AnswerStatus::NotFound,
    };
    let passages = match &answer {
        Answer::Found { passages, .. } => *passages,
        Answer::NotFound { .. } => 0,
    };
    metrics::counter!(
        "query_requests_total",
        "status" => match status {
            AnswerStatus::Found => "found",
            AnswerStatus::NotFound => "not_found",
        }
    )
    .increment(1);

    Ok(Json(QueryResponse {
        status,
        answer: answer.message(),
        passages,
    }))
}

fn map_query_err(err: &QueryError) -> StatusCode {
    match err {
        QueryError::EmptyQuestion | QueryError::QuestionTooLong | QueryError::InvalidTicker(_) => {
            StatusCode::BAD_REQUEST
        }
        QueryError::IndexUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::Embedding(_) | QueryError::Completion(_) => StatusCode::BAD_GATEWAY,
    }
}
