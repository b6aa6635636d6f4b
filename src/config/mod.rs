// Configuration module for stats-recorder
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(connection_string) = std::env::var("STATS_CONNECTION_STRING") {
        if let Some(stream) = config.streams.first_mut() {
            stream.connection_string = connection_string;
        }
    }

    if let Ok(level) = std::env::var("STATS_LOG_LEVEL") {
        config.logging.level = level;
    }

    ConfigLoader::validate(&config)?;
    Ok(config)
}
