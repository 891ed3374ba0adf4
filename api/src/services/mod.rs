pub mod leaderboard;
pub mod market_data;
pub mod openai;
pub mod valuation;
pub mod vector_search;

pub use leaderboard::LeaderboardService;
pub use market_data::{PriceOracle, RetryPriceOracle, StaticPriceOracle, YahooPriceOracle};
pub use openai::{OpenAiCompletion, OpenAiEmbedder};
pub use valuation::PortfolioValuer;
pub use vector_search::AtlasVectorIndex;
