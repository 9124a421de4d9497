pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod store;

#[cfg(test)]
mod test_support;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::{InMemoryStore, RepositoryError};
pub use store::{EngineStore, HydrationSummary};
