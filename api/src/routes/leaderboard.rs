use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use domain::{Leaderboard, UserPortfolioReport};
use tracing::error;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/leaderboard", get(get_leaderboard))
        .route("/users/:email/returns", get(get_user_returns))
}

async fn get_leaderboard(
    State(state): State<AppState>,
) -> Result<Json<Leaderboard>, StatusCode> {
    state.leaderboard.build().await.map(Json).map_err(|err| {
        error!(error = %err, "leaderboard build failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_user_returns(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Json<UserPortfolioReport>, StatusCode> {
    let email = email.trim().to_string();
    if email.is_empty() || !email.contains('@') {
        return Err(StatusCode::BAD_REQUEST);
    }
    state
        .leaderboard
        .user_report(&email)
        .await
        .map(Json)
        .map_err(|err| {
            error!(error = %err, %email, "portfolio valuation failed");
            StatusCode::BAD_GATEWAY
        })
}
