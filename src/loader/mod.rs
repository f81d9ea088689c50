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

// Data loader contract: the read-side mirror of the channel/sink model
//
// A loader indexes one or more input files into channels and schemas, then
// serves time-ordered, channel-filtered iterators and optional backfill
// queries. The contract is defined purely in terms of value types: every
// buffer handed across it is owned by the receiver, so hosts and loaders
// never share pointers. Loaders read input bytes exclusively through the
// host-provided reader interface and report diagnostics through the host
// console hooks; there is no other I/O surface.

mod mcap;

pub use mcap::McapLoader;

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use crate::errors::RecordError;
use crate::schema::Schema;

/// Channel id on the loader side. Distinct from the write side's
/// process-unique ids; scoped to one loaded data set.
pub type LoaderChannelId = u16;

/// Schema id on the loader side. Nonzero; zero is reserved for "no schema".
pub type LoaderSchemaId = u16;

/// Severity of a non-fatal data-quality problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// A non-fatal diagnostic produced while indexing input files.
#[derive(Debug, Clone)]
pub struct Problem {
    pub severity: Severity,
    pub message: String,
    pub tip: Option<String>,
}

impl Problem {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            tip: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Severity::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    /// Adds a remediation tip.
    pub fn tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// Inclusive log-time range covered by all loaded messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start_time: u64,
    pub end_time: u64,
}

/// One channel discovered in the input files.
#[derive(Debug, Clone)]
pub struct ChannelSummary {
    pub id: LoaderChannelId,
    /// Referenced schema, if the encoding needs one.
    pub schema_id: Option<LoaderSchemaId>,
    pub topic: String,
    pub message_encoding: String,
    /// Total message count, when cheaply known.
    pub message_count: Option<u64>,
}

/// One schema discovered in the input files.
#[derive(Debug, Clone)]
pub struct SchemaSummary {
    pub id: LoaderSchemaId,
    pub name: String,
    pub encoding: String,
    pub data: Vec<u8>,
}

/// Everything a host needs to know about a loaded data set.
#[derive(Debug, Clone, Default)]
pub struct Initialization {
    pub channels: Vec<ChannelSummary>,
    pub schemas: Vec<SchemaSummary>,
    pub time_range: TimeRange,
    pub problems: Vec<Problem>,
}

impl Initialization {
    /// Builder that assigns unique channel ids and nonzero schema ids.
    pub fn builder() -> InitializationBuilder {
        InitializationBuilder::default()
    }
}

/// Builder for [`Initialization`].
#[derive(Debug, Default)]
pub struct InitializationBuilder {
    channels: BTreeMap<LoaderChannelId, ChannelSummary>,
    schemas: BTreeMap<LoaderSchemaId, SchemaSummary>,
    next_channel_id: LoaderChannelId,
    next_schema_id: LoaderSchemaId,
    time_range: TimeRange,
    problems: Vec<Problem>,
}

impl InitializationBuilder {
    /// Sets the inclusive time range.
    pub fn time_range(&mut self, start_time: u64, end_time: u64) -> &mut Self {
        self.time_range = TimeRange {
            start_time,
            end_time,
        };
        self
    }

    /// Adds a schema under the next free nonzero id.
    pub fn add_schema(&mut self, schema: Schema) -> LoaderSchemaId {
        let id = self.next_free_schema_id();
        self.insert_schema(id, schema);
        id
    }

    /// Adds a schema under an explicit id.
    ///
    /// Fails with `ValueError` for id zero and `DuplicateChannel` if the id
    /// is taken.
    pub fn add_schema_with_id(
        &mut self,
        id: LoaderSchemaId,
        schema: Schema,
    ) -> Result<LoaderSchemaId, RecordError> {
        if id == 0 {
            return Err(RecordError::ValueError(
                "schema id zero is reserved".to_string(),
            ));
        }
        if self.schemas.contains_key(&id) {
            return Err(RecordError::DuplicateChannel(format!("schema {}", id)));
        }
        self.insert_schema(id, schema);
        Ok(id)
    }

    /// Adds a channel under the next free id.
    pub fn add_channel(
        &mut self,
        topic: impl Into<String>,
        message_encoding: impl Into<String>,
        schema_id: Option<LoaderSchemaId>,
    ) -> LoaderChannelId {
        let id = self.next_free_channel_id();
        self.channels.insert(
            id,
            ChannelSummary {
                id,
                schema_id,
                topic: topic.into(),
                message_encoding: message_encoding.into(),
                message_count: None,
            },
        );
        id
    }

    /// Adds a channel under an explicit id; fails with `DuplicateChannel` if
    /// the id is taken.
    pub fn add_channel_with_id(
        &mut self,
        id: LoaderChannelId,
        topic: impl Into<String>,
        message_encoding: impl Into<String>,
        schema_id: Option<LoaderSchemaId>,
    ) -> Result<LoaderChannelId, RecordError> {
        let topic = topic.into();
        if self.channels.contains_key(&id) {
            return Err(RecordError::DuplicateChannel(topic));
        }
        self.channels.insert(
            id,
            ChannelSummary {
                id,
                schema_id,
                topic,
                message_encoding: message_encoding.into(),
                message_count: None,
            },
        );
        Ok(id)
    }

    /// Records a message count for a channel.
    pub fn set_message_count(&mut self, channel_id: LoaderChannelId, count: u64) -> &mut Self {
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.message_count = Some(count);
        }
        self
    }

    /// Adds a diagnostic.
    pub fn add_problem(&mut self, problem: Problem) -> &mut Self {
        self.problems.push(problem);
        self
    }

    /// Finalizes the initialization. Channels referencing a schema id that
    /// was never added are downgraded to schemaless with a warning problem.
    pub fn build(mut self) -> Initialization {
        let mut dangling = Vec::new();
        for channel in self.channels.values_mut() {
            if let Some(schema_id) = channel.schema_id {
                if !self.schemas.contains_key(&schema_id) {
                    dangling.push((channel.topic.clone(), schema_id));
                    channel.schema_id = None;
                }
            }
        }
        for (topic, schema_id) in dangling {
            self.problems.push(
                Problem::warn(format!(
                    "channel '{}' references unknown schema {}",
                    topic, schema_id
                ))
                .tip("the channel is treated as schemaless"),
            );
        }

        Initialization {
            channels: self.channels.into_values().collect(),
            schemas: self.schemas.into_values().collect(),
            time_range: self.time_range,
            problems: self.problems,
        }
    }

    fn insert_schema(&mut self, id: LoaderSchemaId, schema: Schema) {
        self.schemas.insert(
            id,
            SchemaSummary {
                id,
                name: schema.name,
                encoding: schema.encoding,
                data: schema.data,
            },
        );
    }

    fn next_free_channel_id(&mut self) -> LoaderChannelId {
        loop {
            self.next_channel_id = self.next_channel_id.wrapping_add(1).max(1);
            if !self.channels.contains_key(&self.next_channel_id) {
                return self.next_channel_id;
            }
        }
    }

    fn next_free_schema_id(&mut self) -> LoaderSchemaId {
        loop {
            self.next_schema_id = self.next_schema_id.wrapping_add(1).max(1);
            if !self.schemas.contains_key(&self.next_schema_id) {
                return self.next_schema_id;
            }
        }
    }
}

/// A decoded message crossing the loader boundary.
///
/// The bytes are owned by the value; hosts may retain them freely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedMessage {
    pub channel_id: LoaderChannelId,
    /// When the message was logged to the file.
    pub log_time: u64,
    /// When the message was published by its source; equals `log_time` when
    /// unknown.
    pub publish_time: u64,
    pub data: Vec<u8>,
}

/// Construction arguments for a loader.
#[derive(Debug, Clone, Default)]
pub struct DataLoaderArgs {
    /// The input files the loader should serve messages from.
    pub paths: Vec<String>,
}

/// Arguments for [`DataLoader::create_iter`].
#[derive(Debug, Clone, Default)]
pub struct MessageIteratorArgs {
    /// Yield only these channels; empty yields all.
    pub channel_ids: Vec<LoaderChannelId>,
    /// Inclusive lower bound on log time.
    pub start_time: Option<u64>,
    /// Inclusive upper bound on log time.
    pub end_time: Option<u64>,
}

/// Arguments for [`DataLoader::get_backfill`].
#[derive(Debug, Clone, Default)]
pub struct BackfillArgs {
    /// Retrieve, per channel, the latest message with log_time at or before
    /// this timestamp.
    pub time: u64,
    pub channel_ids: Vec<LoaderChannelId>,
}

/// A pluggable input indexer and message source.
pub trait DataLoader: Send {
    type MessageIterator: MessageIterator;

    /// Performs all indexing work up front and describes the data set.
    fn initialize(&mut self) -> Result<Initialization, RecordError>;

    /// Creates an iterator over a time/channel-filtered subset. Multiple
    /// iterators may coexist; each keeps independent cursor state.
    fn create_iter(
        &mut self,
        args: MessageIteratorArgs,
    ) -> Result<Self::MessageIterator, RecordError>;

    /// Returns, for each requested channel, the single latest message at or
    /// before the given time. Optional; the default returns nothing.
    fn get_backfill(&mut self, _args: BackfillArgs) -> Result<Vec<LoadedMessage>, RecordError> {
        Ok(Vec::new())
    }
}

/// Pull-based message cursor.
pub trait MessageIterator {
    /// Yields messages in non-decreasing log-time order; `None` signals
    /// end-of-stream (not an error).
    fn next(&mut self) -> Option<Result<LoadedMessage, RecordError>>;
}

/// Byte-oriented random access to one input file.
///
/// This is the only way a loader reads input data, which keeps loaders
/// portable across hosts (local files, remote blobs, in-memory fixtures).
pub trait BlobReader: Send {
    /// Total size in bytes.
    fn size(&mut self) -> Result<u64, RecordError>;

    /// Current read position.
    fn position(&self) -> u64;

    /// Seeks to an absolute position, returning the new position.
    fn seek(&mut self, pos: u64) -> Result<u64, RecordError>;

    /// Reads into `buf`, returning the number of bytes read; zero at EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RecordError>;
}

/// Host services available to a loader: opening inputs and a console for
/// diagnostics.
pub trait LoaderHost: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn BlobReader>, RecordError>;

    fn console_log(&self, message: &str) {
        info!(target: "robolog::loader", "{}", message);
    }

    fn console_warn(&self, message: &str) {
        warn!(target: "robolog::loader", "{}", message);
    }

    fn console_error(&self, message: &str) {
        error!(target: "robolog::loader", "{}", message);
    }
}

/// Filesystem-backed host, the default for local use and tests.
pub struct FsLoaderHost;

impl LoaderHost for FsLoaderHost {
    fn open(&self, path: &str) -> Result<Box<dyn BlobReader>, RecordError> {
        let file = std::fs::File::open(path)?;
        Ok(Box::new(FileBlobReader { file, position: 0 }))
    }
}

struct FileBlobReader {
    file: std::fs::File,
    position: u64,
}

impl BlobReader for FileBlobReader {
    fn size(&mut self) -> Result<u64, RecordError> {
        Ok(self.file.metadata()?.len())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> Result<u64, RecordError> {
        use std::io::Seek;
        self.position = self.file.seek(std::io::SeekFrom::Start(pos))?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, RecordError> {
        use std::io::Read;
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Reads a whole blob through the reader interface.
pub(crate) fn read_all(reader: &mut dyn BlobReader) -> Result<Vec<u8>, RecordError> {
    let size = reader.size()? as usize;
    reader.seek(0)?;
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(RecordError::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "input truncated while reading",
            )));
        }
        filled += n;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_assigns_unique_nonzero_ids() {
        let mut builder = Initialization::builder();
        let s1 = builder.add_schema(Schema::new("A", "jsonschema", b"{}".to_vec()));
        let s2 = builder.add_schema(Schema::new("B", "jsonschema", b"{}".to_vec()));
        assert_ne!(s1, 0);
        assert_ne!(s2, 0);
        assert_ne!(s1, s2);

        let c1 = builder.add_channel("/a", "json", Some(s1));
        let c2 = builder.add_channel("/b", "json", Some(s2));
        assert_ne!(c1, c2);

        let init = builder.build();
        assert_eq!(init.channels.len(), 2);
        assert_eq!(init.schemas.len(), 2);
        assert!(init.problems.is_empty());
    }

    #[test]
    fn test_builder_rejects_duplicate_ids() {
        let mut builder = Initialization::builder();
        builder
            .add_channel_with_id(7, "/a", "json", None)
            .unwrap();
        let err = builder
            .add_channel_with_id(7, "/b", "json", None)
            .unwrap_err();
        assert!(matches!(err, RecordError::DuplicateChannel(_)));

        let err = builder
            .add_schema_with_id(0, Schema::new("S", "jsonschema", b"{}".to_vec()))
            .unwrap_err();
        assert!(matches!(err, RecordError::ValueError(_)));
    }

    #[test]
    fn test_builder_downgrades_dangling_schema_reference() {
        let mut builder = Initialization::builder();
        builder.add_channel("/a", "json", Some(42));
        let init = builder.build();
        assert_eq!(init.channels[0].schema_id, None);
        assert_eq!(init.problems.len(), 1);
        assert_eq!(init.problems[0].severity, Severity::Warn);
    }
}
