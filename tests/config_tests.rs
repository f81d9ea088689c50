// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use robolog::config::{load_config, load_config_with_env, ConfigLoader};
use robolog::live::Capability;
use robolog::CompressionType;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
logging:
  level: debug
  format: text

sinks:
  mcap:
    path: /data/session.mcap
    profile: ros2
    compression: lz4
    truncate: true
    topics: ["/camera/", "/imu"]
  live:
    name: robot-7
    host: 0.0.0.0
    port: 9001
    capabilities: [clientPublish, parameters]
    supported_encodings: ["json"]
  relay:
    url: http://relay.example.com:8383
    stream: field-test
    api_token: secret
    compression:
      type: zstd
      level: 3

schemas:
  per_topic:
    /imu:
      name: sensor_msgs/Imu
      encoding: jsonschema
      data_base64: "eyJ0eXBlIjoib2JqZWN0In0="
"#;

#[test]
fn test_parse_full_config() {
    let config = ConfigLoader::parse(FULL_CONFIG).unwrap();

    assert_eq!(config.logging.level, "debug");

    let mcap = config.sinks.mcap.as_ref().unwrap();
    assert_eq!(mcap.path, "/data/session.mcap");
    assert_eq!(mcap.profile, "ros2");
    assert_eq!(mcap.compression, CompressionType::Lz4);
    assert!(mcap.truncate);
    // Defaults fill what the file omits.
    assert_eq!(mcap.chunk_size, 786432);
    assert!(mcap.use_chunks);

    let live = config.sinks.live.as_ref().unwrap();
    assert_eq!(live.name, "robot-7");
    assert_eq!(live.port, 9001);
    assert_eq!(
        live.capabilities,
        vec![Capability::ClientPublish, Capability::Parameters]
    );

    let relay = config.sinks.relay.as_ref().unwrap();
    assert_eq!(relay.stream, "field-test");
    assert_eq!(relay.compression.r#type, CompressionType::Zstd);
    assert_eq!(relay.compression.level, 3);
    assert_eq!(relay.max_retries, 3);
}

#[test]
fn test_schema_table_decodes_base64() {
    let config = ConfigLoader::parse(FULL_CONFIG).unwrap();

    let schema = config.schemas.schema_for("/imu").unwrap().unwrap();
    assert_eq!(schema.name, "sensor_msgs/Imu");
    assert_eq!(schema.encoding, "jsonschema");
    assert_eq!(schema.data, b"{\"type\":\"object\"}");

    assert!(config.schemas.schema_for("/unknown").unwrap().is_none());
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = ConfigLoader::parse("{}").unwrap();
    assert!(config.sinks.mcap.is_none());
    assert!(config.sinks.live.is_none());
    assert!(config.sinks.relay.is_none());
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_unknown_log_level_is_rejected() {
    let result = ConfigLoader::parse("logging:\n  level: verbose\n");
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("logging.level"));
}

#[test]
fn test_load_config_with_env_overrides() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
sinks:
  relay:
    url: http://default:8383
"#,
    )
    .unwrap();

    let config = load_config(&path).unwrap();
    assert_eq!(config.sinks.relay.as_ref().unwrap().url, "http://default:8383");

    std::env::set_var("RELAY_URL", "http://override:9999");
    std::env::set_var("RELAY_API_TOKEN", "tok");
    let config = load_config_with_env(&path).unwrap();
    std::env::remove_var("RELAY_URL");
    std::env::remove_var("RELAY_API_TOKEN");

    let relay = config.sinks.relay.as_ref().unwrap();
    assert_eq!(relay.url, "http://override:9999");
    assert_eq!(relay.api_token, Some("tok".to_string()));
}

#[test]
fn test_env_substitution_in_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        r#"
sinks:
  relay:
    url: ${ROBOLOG_CFG_URL:-http://fallback:8383}
    stream: ${ROBOLOG_CFG_STREAM:-bench}
"#,
    )
    .unwrap();

    std::env::set_var("ROBOLOG_CFG_URL", "http://from-env:1");
    std::env::remove_var("ROBOLOG_CFG_STREAM");
    let config = load_config(&path).unwrap();
    std::env::remove_var("ROBOLOG_CFG_URL");

    let relay = config.sinks.relay.as_ref().unwrap();
    assert_eq!(relay.url, "http://from-env:1");
    assert_eq!(relay.stream, "bench");
}

#[test]
fn test_mcap_sink_builder_from_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.mcap");

    let yaml = format!(
        r#"
sinks:
  mcap:
    path: {}
    topics: ["/keep"]
"#,
        path.display()
    );
    let config = ConfigLoader::parse(&yaml).unwrap();

    let ctx = robolog::Context::new();
    let writer = config
        .sinks
        .mcap
        .as_ref()
        .unwrap()
        .builder()
        .context(&ctx)
        .create()
        .unwrap();

    let keep = ctx
        .channel_builder("/keep")
        .message_encoding("json")
        .build()
        .unwrap();
    let drop_chan = ctx
        .channel_builder("/drop")
        .message_encoding("json")
        .build()
        .unwrap();

    assert!(keep.has_sinks());
    assert!(!drop_chan.has_sinks());

    keep.log_at(b"{}", 1);
    writer.close().unwrap();

    let contents = std::fs::read(&path).unwrap();
    let count = mcap::MessageStream::new(&contents).unwrap().count();
    assert_eq!(count, 1);
}

#[test]
fn test_schema_entry_base64_helper() {
    // The fixture above decodes to a JSON schema; check the inverse too.
    assert_eq!(
        BASE64.encode(b"{\"type\":\"object\"}"),
        "eyJ0eXBlIjoib2JqZWN0In0="
    );
}
