use std::path::Path;

use serde::Serialize;
use signoff_core::domain::tier::TierConfiguration;
use signoff_core::routing::{ConfigurationCatalog, ConfigurationFile};

use crate::commands::{exit, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigurationSummary {
    id: String,
    version: u32,
    category: String,
    is_default: bool,
    tier_levels: Vec<u8>,
}

impl From<&TierConfiguration> for ConfigurationSummary {
    fn from(configuration: &TierConfiguration) -> Self {
        Self {
            id: configuration.id.to_string(),
            version: configuration.version,
            category: configuration.category.to_string(),
            is_default: configuration.is_default,
            tier_levels: configuration.tiers.iter().map(|tier| tier.level).collect(),
        }
    }
}

/// Parses and validates tier files the same way the server does at boot, including the
/// one-default-per-category rule across files.
pub fn run(path: &Path) -> CommandResult {
    let loaded = if path.is_dir() {
        ConfigurationFile::load_dir(path)
    } else {
        ConfigurationFile::load(path).map(|file| file.configurations)
    };
    let configurations = match loaded {
        Ok(configurations) => configurations,
        Err(error) => {
            return CommandResult::failure(
                "validate-tiers",
                "tier_validation",
                error.to_string(),
                exit::INVALID_INPUT,
            );
        }
    };

    let mut catalog = ConfigurationCatalog::new();
    for configuration in &configurations {
        if let Err(error) = catalog.register(configuration.clone()) {
            return CommandResult::failure(
                "validate-tiers",
                "tier_validation",
                error.to_string(),
                exit::INVALID_INPUT,
            );
        }
    }

    let summaries: Vec<ConfigurationSummary> =
        configurations.iter().map(ConfigurationSummary::from).collect();
    CommandResult::success_with_details(
        "validate-tiers",
        format!("{} tier configurations valid", summaries.len()),
        serde_json::to_value(&summaries).ok(),
    )
}
