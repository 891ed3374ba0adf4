pub mod holding_repository;
pub mod user_repository;

pub use holding_repository::{HoldingRepository, PostgresHoldingRepository};
pub use user_repository::{PostgresUserRepository, UserRepository};
