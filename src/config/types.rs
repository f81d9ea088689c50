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

// Configuration types for the logging SDK

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::compression::{CompressionLevel, CompressionType};
use crate::errors::RecordError;
use crate::filter::{ChannelFilter, ChannelFilterFn};
use crate::live::{Capability, LiveServer};
use crate::mcap_sink::{McapWriter, McapWriterOptions};
use crate::relay::{CloudRelay, RelayOptions};
use crate::schema::Schema;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub sinks: SinksConfig,

    #[serde(default)]
    pub schemas: SchemaTable,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sink selection; each section is optional and independent.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SinksConfig {
    #[serde(default)]
    pub mcap: Option<McapSinkConfig>,

    #[serde(default)]
    pub live: Option<LiveSinkConfig>,

    #[serde(default)]
    pub relay: Option<RelaySinkConfig>,
}

/// MCAP file sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McapSinkConfig {
    pub path: String,

    #[serde(default)]
    pub profile: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default)]
    pub compression: CompressionType,

    #[serde(default = "default_true")]
    pub use_chunks: bool,

    #[serde(default)]
    pub truncate: bool,

    /// Topic prefixes this sink records; empty records everything.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl McapSinkConfig {
    /// Builds a writer for this configuration.
    pub fn builder(&self) -> McapWriter {
        let options = McapWriterOptions {
            path: self.path.clone().into(),
            profile: self.profile.clone(),
            chunk_size: self.chunk_size,
            compression: self.compression,
            use_chunks: self.use_chunks,
            truncate: self.truncate,
            ..McapWriterOptions::default()
        };
        let mut writer = McapWriter::with_options(options);
        if let Some(filter) = topic_prefix_filter(&self.topics) {
            writer = writer.channel_filter(filter);
        }
        writer
    }
}

/// Live server sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveSinkConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(default)]
    pub supported_encodings: Vec<String>,

    #[serde(default = "default_queue_size")]
    pub message_queue_size: usize,

    /// Topic prefixes this sink streams; empty streams everything.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl LiveSinkConfig {
    /// Builds a server for this configuration; attach a listener before
    /// calling `start()`.
    pub fn builder(&self) -> LiveServer {
        let mut server = LiveServer::new()
            .name(self.name.clone())
            .bind(self.host.clone(), self.port)
            .capabilities(self.capabilities.clone())
            .supported_encodings(self.supported_encodings.clone())
            .message_queue_size(self.message_queue_size);
        if let Some(filter) = topic_prefix_filter(&self.topics) {
            server = server.channel_filter(filter);
        }
        server
    }
}

/// Cloud relay sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySinkConfig {
    pub url: String,

    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub compression: CompressionSettings,

    #[serde(default = "default_batch_bytes")]
    pub max_batch_bytes: usize,

    #[serde(default = "default_batch_seconds")]
    pub max_batch_seconds: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Topic prefixes this sink uploads; empty uploads everything.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl RelaySinkConfig {
    /// Builds a relay for this configuration.
    pub fn builder(&self) -> Result<CloudRelay, RecordError> {
        let level = CompressionLevel::from_config_level(self.compression.level).ok_or_else(
            || RecordError::ConfigError("compression.level must be 0-4".to_string()),
        )?;
        let options = RelayOptions {
            url: self.url.clone(),
            stream: self.stream.clone(),
            api_token: self.api_token.clone(),
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            compression_type: self.compression.r#type,
            compression_level: level,
            max_batch_bytes: self.max_batch_bytes,
            max_batch_seconds: self.max_batch_seconds,
            queue_capacity: self.queue_capacity,
        };
        let mut relay = CloudRelay::new(options);
        if let Some(filter) = topic_prefix_filter(&self.topics) {
            relay = relay.channel_filter(filter);
        }
        Ok(relay)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompressionSettings {
    #[serde(default)]
    pub r#type: CompressionType,

    /// Compression level, 0-4.
    #[serde(default = "default_compression_level")]
    pub level: u8,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            r#type: CompressionType::default(),
            level: default_compression_level(),
        }
    }
}

/// Per-topic schema declarations.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SchemaTable {
    #[serde(default)]
    pub per_topic: HashMap<String, SchemaEntry>,
}

impl SchemaTable {
    /// Decodes the schema declared for a topic, if any.
    pub fn schema_for(&self, topic: &str) -> Result<Option<Schema>, RecordError> {
        match self.per_topic.get(topic) {
            Some(entry) => entry.decode().map(Some),
            None => Ok(None),
        }
    }
}

/// One declared schema; the definition travels base64-encoded in YAML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaEntry {
    pub name: String,
    pub encoding: String,

    #[serde(default)]
    pub data_base64: Option<String>,
}

impl SchemaEntry {
    pub fn decode(&self) -> Result<Schema, RecordError> {
        let data = match &self.data_base64 {
            Some(encoded) => BASE64.decode(encoded)?,
            None => Vec::new(),
        };
        let schema = Schema::new(self.name.clone(), self.encoding.clone(), data);
        schema.validate()?;
        Ok(schema)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"

    #[serde(default = "default_log_format")]
    pub format: String, // "text", "json"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Accept-if-any-prefix-matches filter used by the `topics` lists.
pub fn topic_prefix_filter(prefixes: &[String]) -> Option<Arc<dyn ChannelFilter>> {
    if prefixes.is_empty() {
        return None;
    }
    let prefixes = prefixes.to_vec();
    Some(Arc::new(ChannelFilterFn(move |channel: &crate::channel::Channel| {
        prefixes
            .iter()
            .any(|prefix| channel.topic().starts_with(prefix.as_str()))
    })))
}

// Default value functions
fn default_chunk_size() -> u64 { 786432 }
fn default_true() -> bool { true }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8765 }
fn default_queue_size() -> usize { 1024 }
fn default_stream() -> String { "recordings".to_string() }
fn default_timeout() -> u64 { 300 }
fn default_retries() -> u32 { 3 }
fn default_compression_level() -> u8 { 2 }
fn default_batch_bytes() -> usize { 4194304 }
fn default_batch_seconds() -> u64 { 10 }
fn default_queue_capacity() -> usize { 4096 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
