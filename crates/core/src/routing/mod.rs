pub mod catalog;
pub mod tiers;

pub use catalog::{CatalogFileError, ConfigurationCatalog, ConfigurationFile, Revision};
pub use tiers::TierResolver;
