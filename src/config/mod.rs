// Configuration module for the logging SDK
//
// Provides:
// - YAML configuration file loading
// - Environment variable substitution
// - Configuration validation
// - Default values

pub mod types;
mod loader;

pub use loader::ConfigLoader;
pub use types::*;

use std::path::Path;

use crate::errors::RecordError;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<LogConfig, RecordError> {
    ConfigLoader::load(path)
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<LogConfig, RecordError> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(relay_url) = std::env::var("RELAY_URL") {
        if let Some(relay) = &mut config.sinks.relay {
            relay.url = relay_url;
        }
    }

    if let Ok(api_token) = std::env::var("RELAY_API_TOKEN") {
        if let Some(relay) = &mut config.sinks.relay {
            relay.api_token = Some(api_token);
        }
    }

    if let Ok(mcap_path) = std::env::var("MCAP_OUTPUT_PATH") {
        if let Some(mcap) = &mut config.sinks.mcap {
            mcap.path = mcap_path;
        }
    }

    Ok(config)
}
