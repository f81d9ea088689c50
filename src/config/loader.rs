// Configuration loader with environment variable substitution

use regex::Regex;
use std::path::Path;

use super::types::*;
use crate::errors::RecordError;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LogConfig, RecordError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a YAML string
    pub fn parse(content: &str) -> Result<LogConfig, RecordError> {
        let content = Self::substitute_env_vars(content);

        let config: LogConfig = serde_yaml::from_str(&content)
            .map_err(|e| RecordError::ConfigError(e.to_string()))?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${RELAY_URL:-http://localhost:8383} -> http://localhost:8383 (if RELAY_URL not set)
    fn substitute_env_vars(content: &str) -> String {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static pattern");

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
    fn validate(config: &LogConfig) -> Result<(), RecordError> {
        if let Some(mcap) = &config.sinks.mcap {
            if mcap.path.is_empty() {
                return Err(config_error("sinks.mcap.path must not be empty"));
            }
            if mcap.chunk_size == 0 {
                return Err(config_error("sinks.mcap.chunk_size must be > 0"));
            }
        }

        if let Some(live) = &config.sinks.live {
            if live.host.is_empty() {
                return Err(config_error("sinks.live.host must not be empty"));
            }
            if live.message_queue_size == 0 {
                return Err(config_error("sinks.live.message_queue_size must be > 0"));
            }
        }

        if let Some(relay) = &config.sinks.relay {
            if relay.url.is_empty() {
                return Err(config_error("sinks.relay.url must not be empty"));
            }
            if relay.compression.level > 4 {
                return Err(config_error("sinks.relay.compression.level must be 0-4"));
            }
            if relay.queue_capacity == 0 {
                return Err(config_error("sinks.relay.queue_capacity must be > 0"));
            }
            if relay.max_batch_bytes == 0 {
                return Err(config_error("sinks.relay.max_batch_bytes must be > 0"));
            }
            if relay.max_batch_seconds == 0 {
                return Err(config_error("sinks.relay.max_batch_seconds must be > 0"));
            }
        }

        match config.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(config_error(format!(
                    "unknown logging.level '{}'. Supported: trace, debug, info, warn, error",
                    other
                )));
            }
        }

        // Schema declarations must decode.
        for (topic, entry) in &config.schemas.per_topic {
            entry.decode().map_err(|e| {
                config_error(format!("schema for topic '{}' is invalid: {}", topic, e))
            })?;
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> RecordError {
    RecordError::ConfigError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ROBOLOG_TEST_VAR", "test_value");

        let input = "url: ${ROBOLOG_TEST_VAR}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "url: test_value");

        std::env::remove_var("ROBOLOG_TEST_VAR");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("ROBOLOG_TEST_VAR2");

        let input = "stream: ${ROBOLOG_TEST_VAR2:-default-stream}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "stream: default-stream");
    }

    #[test]
    fn test_unset_without_default_is_kept() {
        std::env::remove_var("ROBOLOG_TEST_VAR3");

        let input = "token: ${ROBOLOG_TEST_VAR3}";
        let output = ConfigLoader::substitute_env_vars(input);
        assert_eq!(output, "token: ${ROBOLOG_TEST_VAR3}");
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let config = ConfigLoader::parse(
            r#"
sinks:
  mcap:
    path: /tmp/out.mcap
    chunk_size: 0
"#,
        );
        let err = config.unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_validation_rejects_bad_compression_level() {
        let config = ConfigLoader::parse(
            r#"
sinks:
  relay:
    url: http://localhost:8383
    compression:
      type: zstd
      level: 9
"#,
        );
        let err = config.unwrap_err();
        assert!(err.to_string().contains("compression.level"));
    }

    #[test]
    fn test_validation_rejects_bad_schema_base64() {
        let config = ConfigLoader::parse(
            r#"
schemas:
  per_topic:
    /imu:
      name: Imu
      encoding: jsonschema
      data_base64: "%%%not-base64%%%"
"#,
        );
        let err = config.unwrap_err();
        assert!(err.to_string().contains("/imu"));
    }
}
