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

// Structured data logging SDK
//
// This crate provides:
// - Channels: named, schema-tagged logging endpoints, deduplicated per
//   (topic, encoding) within a context
// - Sinks: concurrently attached consumers with per-sink channel filters
//   (MCAP file writer, live TCP visualization server, cloud relay)
// - Contexts: isolation namespaces binding channels and sinks
// - A data-loader contract for the read side: indexing input files into
//   channels/schemas and iterating messages in log-time order, with backfill

pub mod channel;
pub mod compression;
pub mod config;
pub mod context;
pub mod errors;
pub mod filter;
pub mod live;
pub mod loader;
pub mod mcap_sink;
pub mod relay;
pub mod schema;
pub mod sink;

mod clock;
mod runtime;

// Re-export main types
pub use channel::{Channel, ChannelBuilder, ChannelId};
pub use clock::nanoseconds_since_epoch;
pub use compression::{CompressionLevel, CompressionType};
pub use config::{load_config, load_config_with_env, LogConfig};
pub use context::Context;
pub use errors::RecordError;
pub use filter::ChannelFilter;
pub use live::{Capability, LiveServer, LiveServerHandle, ServerListener};
pub use mcap_sink::{McapWriter, McapWriterHandle, McapWriterOptions};
pub use relay::{CloudRelay, CloudRelayHandle, RelayOptions, RelayTransport};
pub use runtime::ShutdownHandle;
pub use schema::Schema;
pub use sink::{Sink, SinkId};
