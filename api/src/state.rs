use retrieval::QueryService;
use std::sync::Arc;

use crate::{config::AppConfig, services::LeaderboardService};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub leaderboard: Arc<LeaderboardService>,
    pub query: Arc<dyn QueryService>,
}

// Axum state must be shareable across worker threads.
#[allow(dead_code)]
fn _assert_state_types_are_send_sync()
where
    AppConfig: Send + Sync + 'static,
    LeaderboardService: Send + Sync,
    dyn QueryService: Send + Sync,
{
}

#[allow(dead_code)]
fn _assert_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
