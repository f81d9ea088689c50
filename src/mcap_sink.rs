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

// MCAP file sink
//
// Serializes accepted messages into a seekable, chunked, optionally
// compressed MCAP container with summary indexes. Channel and schema records
// are registered lazily, on the first message seen per channel.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId};
use crate::compression::CompressionType;
use crate::context::Context;
use crate::errors::RecordError;
use crate::filter::{ChannelFilter, ChannelFilterFn};
use crate::sink::{Sink, SinkId};

/// Options for the MCAP file sink.
#[derive(Debug, Clone)]
pub struct McapWriterOptions {
    /// Output file path.
    pub path: PathBuf,
    /// MCAP profile string recorded in the file header.
    pub profile: String,
    /// Target uncompressed chunk size in bytes.
    pub chunk_size: u64,
    /// Chunk compression algorithm.
    pub compression: CompressionType,
    /// Whether messages are grouped into chunks at all.
    pub use_chunks: bool,
    /// Truncate an existing file instead of failing with `AlreadyExists`.
    pub truncate: bool,
    /// Write a statistics record in the summary section.
    pub emit_statistics: bool,
    /// Write summary offset records.
    pub emit_summary_offsets: bool,
    /// Write message index records after each chunk.
    pub emit_message_indexes: bool,
    /// Write chunk index records in the summary section.
    pub emit_chunk_indexes: bool,
}

impl Default for McapWriterOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            profile: String::new(),
            chunk_size: 786432,
            compression: CompressionType::Zstd,
            use_chunks: true,
            truncate: false,
            emit_statistics: true,
            emit_summary_offsets: true,
            emit_message_indexes: true,
            emit_chunk_indexes: true,
        }
    }
}

/// Builder for an MCAP file sink.
///
/// # Examples
///
/// ```ignore
/// let ctx = Context::new();
/// let writer = McapWriter::new("/data/session.mcap")
///     .context(&ctx)
///     .create()?;
/// // ... log on channels in ctx ...
/// writer.close()?;
/// ```
#[must_use]
pub struct McapWriter {
    options: McapWriterOptions,
    context: Arc<Context>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
}

impl McapWriter {
    /// Starts a builder writing to `path` with default options.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut options = McapWriterOptions::default();
        options.path = path.into();
        Self::with_options(options)
    }

    /// Starts a builder with explicit options.
    pub fn with_options(options: McapWriterOptions) -> Self {
        Self {
            options,
            context: Context::get_default(),
            channel_filter: None,
        }
    }

    /// Binds the sink to a context. Defaults to the process default context.
    pub fn context(mut self, ctx: &Arc<Context>) -> Self {
        self.context = ctx.clone();
        self
    }

    /// Restricts the sink to channels accepted by `filter`.
    pub fn channel_filter(mut self, filter: Arc<dyn ChannelFilter>) -> Self {
        self.channel_filter = Some(filter);
        self
    }

    /// Restricts the sink to channels accepted by a closure.
    pub fn channel_filter_fn(
        mut self,
        filter: impl Fn(&Channel) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.channel_filter = Some(Arc::new(ChannelFilterFn(filter)));
        self
    }

    /// Opens the file and attaches the sink to the context.
    ///
    /// Open-time failures (the file exists and `truncate` is false, the
    /// directory is missing, permissions) are returned synchronously.
    pub fn create(self) -> Result<McapWriterHandle, RecordError> {
        let file = if self.options.truncate {
            File::create(&self.options.path)?
        } else {
            File::create_new(&self.options.path)?
        };
        debug!("recording MCAP file at {}", self.options.path.display());

        let sink = McapSink::new(BufWriter::new(file), &self.options, self.channel_filter)?;
        self.context.add_sink(sink.clone());
        Ok(McapWriterHandle {
            sink,
            context: Arc::downgrade(&self.context),
        })
    }
}

/// Handle to a running MCAP file sink.
///
/// Dropping the handle detaches the sink and finalizes the file; errors
/// during an implicit drop-close are logged. Call [`McapWriterHandle::close`]
/// to observe them instead.
#[must_use]
pub struct McapWriterHandle {
    sink: Arc<McapSink<BufWriter<File>>>,
    context: Weak<Context>,
}

impl std::fmt::Debug for McapWriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McapWriterHandle")
            .field("sink_id", &self.sink.id())
            .finish()
    }
}

impl McapWriterHandle {
    /// The id of the underlying sink, usable with `Channel::log_to_sink`.
    pub fn sink_id(&self) -> SinkId {
        self.sink.id()
    }

    /// Stops logging, flushes all buffered chunks and finalizes the summary
    /// section. Safe to call after an implicit close; a second close is a
    /// no-op.
    pub fn close(self) -> Result<(), RecordError> {
        self.finish()
    }

    /// Writes a standalone named metadata record.
    ///
    /// Does nothing if `pairs` is empty. Returns [`RecordError::SinkClosed`]
    /// after the writer has been closed.
    pub fn write_metadata(
        &self,
        name: &str,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), RecordError> {
        self.sink.write_metadata(name, pairs.into_iter().collect())
    }

    fn finish(&self) -> Result<(), RecordError> {
        if let Some(context) = self.context.upgrade() {
            context.remove_sink(self.sink.id());
        }
        self.sink.finish()
    }
}

impl Drop for McapWriterHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!("error closing MCAP file: {}", err);
        }
    }
}

struct WriterState<W: Write + Seek> {
    writer: mcap::Writer<W>,
    /// SDK channel id -> MCAP channel record id.
    channel_map: HashMap<ChannelId, u16>,
    /// Message sequence counter per MCAP channel record.
    channel_sequence: HashMap<u16, u32>,
}

impl<W: Write + Seek> WriterState<W> {
    fn next_sequence(&mut self, mcap_channel_id: u16) -> u32 {
        *self
            .channel_sequence
            .entry(mcap_channel_id)
            .and_modify(|seq| *seq += 1)
            .or_insert(1)
    }

    fn write(
        &mut self,
        channel: &Channel,
        payload: &[u8],
        log_time: u64,
    ) -> Result<(), RecordError> {
        let mcap_channel_id = match self.channel_map.entry(channel.id()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let schema_id = match channel.schema() {
                    Some(schema) => {
                        self.writer
                            .add_schema(&schema.name, &schema.encoding, &schema.data)?
                    }
                    // 0 marks a schemaless channel in the container.
                    None => 0,
                };
                let mcap_channel_id = self.writer.add_channel(
                    schema_id,
                    channel.topic(),
                    channel.message_encoding(),
                    channel.metadata(),
                )?;
                *entry.insert(mcap_channel_id)
            }
        };

        let sequence = self.next_sequence(mcap_channel_id);
        self.writer.write_to_known_channel(
            &mcap::records::MessageHeader {
                channel_id: mcap_channel_id,
                sequence,
                log_time,
                // publish_time is not tracked separately by the SDK.
                publish_time: log_time,
            },
            payload,
        )?;
        Ok(())
    }
}

pub(crate) struct McapSink<W: Write + Seek> {
    sink_id: SinkId,
    supported_encodings: Option<Vec<String>>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
    inner: Mutex<Option<WriterState<W>>>,
}

impl<W: Write + Seek + Send + 'static> McapSink<W> {
    fn new(
        writer: W,
        options: &McapWriterOptions,
        channel_filter: Option<Arc<dyn ChannelFilter>>,
    ) -> Result<Arc<Self>, RecordError> {
        let write_options = mcap::WriteOptions::default()
            .profile(options.profile.as_str())
            .library(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")))
            .compression(options.compression.to_mcap())
            .chunk_size(Some(options.chunk_size))
            .use_chunks(options.use_chunks)
            .emit_statistics(options.emit_statistics)
            .emit_summary_offsets(options.emit_summary_offsets)
            .emit_message_indexes(options.emit_message_indexes)
            .emit_chunk_indexes(options.emit_chunk_indexes);

        let writer = write_options.create(writer)?;
        Ok(Arc::new(Self {
            sink_id: SinkId::next(),
            supported_encodings: None,
            channel_filter,
            inner: Mutex::new(Some(WriterState {
                writer,
                channel_map: HashMap::new(),
                channel_sequence: HashMap::new(),
            })),
        }))
    }

    fn write_metadata(
        &self,
        name: &str,
        pairs: BTreeMap<String, String>,
    ) -> Result<(), RecordError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock_state();
        let state = guard.as_mut().ok_or(RecordError::SinkClosed)?;
        state.writer.write_metadata(&mcap::records::Metadata {
            name: name.to_string(),
            metadata: pairs,
        })?;
        Ok(())
    }

    fn finish(&self) -> Result<(), RecordError> {
        let Some(mut state) = self.lock_state().take() else {
            return Ok(());
        };
        state.writer.finish()?;
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<WriterState<W>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Seek + Send + 'static> Sink for McapSink<W> {
    fn id(&self) -> SinkId {
        self.sink_id
    }

    fn write(
        &self,
        channel: &Channel,
        payload: &[u8],
        log_time: u64,
    ) -> Result<(), RecordError> {
        let mut guard = self.lock_state();
        let state = guard.as_mut().ok_or(RecordError::SinkClosed)?;
        state.write(channel, payload, log_time)
    }

    fn supported_encodings(&self) -> Option<&[String]> {
        self.supported_encodings.as_deref()
    }

    fn channel_filter(&self) -> Option<&dyn ChannelFilter> {
        self.channel_filter.as_deref()
    }
}
