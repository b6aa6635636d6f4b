// Configuration loader with environment variable substitution

use super::types::*;
use crate::storage::split_connection_string;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StatsConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::parse(&content)
    }

    /// Parse YAML content (after substitution) and validate it
    pub fn parse(content: &str) -> Result<StatsConfig> {
        let content = Self::substitute_env_vars(content);

        let config: StatsConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${STATS_DB:-csv://stats.csv} -> csv://stats.csv (if STATS_DB not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("valid pattern");

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    if let Some(default) = default_value {
                        default.to_string()
                    } else {
                        // Keep original if no default and var not found
                        format!("${{{}}}", var_name)
                    }
                }
            }
        })
        .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &StatsConfig) -> Result<()> {
        if config.streams.is_empty() {
            bail!("at least one stream must be configured");
        }

        let mut names = HashSet::new();
        for stream in &config.streams {
            if stream.name.is_empty() {
                bail!("streams[].name cannot be empty");
            }
            if !names.insert(stream.name.as_str()) {
                bail!("duplicate stream name '{}'", stream.name);
            }
            if stream.batch_size == 0 {
                bail!("stream '{}': batch_size must be >= 1", stream.name);
            }
            if stream.timeout_seconds == 0 {
                bail!("stream '{}': timeout_seconds must be > 0", stream.name);
            }
            if stream.table_name.is_empty() {
                bail!("stream '{}': table_name cannot be empty", stream.name);
            }
            split_connection_string(&stream.connection_string)
                .with_context(|| format!("stream '{}'", stream.name))?;
        }

        Ok(())
    }
}
