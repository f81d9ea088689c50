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

// Channels: named, schema-tagged logging endpoints
//
// A channel dispatches logged payloads to the sinks currently subscribed to
// it. Channels are created through a ChannelBuilder bound to a Context and
// are deduplicated per (topic, message_encoding) within that context.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::warn;

use crate::clock::{nanoseconds_since_epoch, Throttler};
use crate::context::Context;
use crate::errors::RecordError;
use crate::schema::Schema;
use crate::sink::{SinkId, SinkSet};

/// Interval for throttled closed-channel warnings.
const WARN_THROTTLE_INTERVAL: Duration = Duration::from_secs(10);

/// Uniquely identifies a channel within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocates the next channel id. Ids start at 1, increase monotonically
    /// and are assigned exactly once, at first successful registration.
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ChannelId> for u64 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

/// A named logging endpoint.
///
/// Channels are immutable once created, returned as `Arc<Channel>` and safe
/// to log on from arbitrarily many threads. A channel owns no sinks; the
/// context wires subscribed sinks into the channel's snapshot set, and a
/// sink may outlive or be outlived by the channel without either holding the
/// other alive.
pub struct Channel {
    id: ChannelId,
    context: Weak<Context>,
    topic: String,
    message_encoding: String,
    schema: Option<Schema>,
    metadata: BTreeMap<String, String>,
    sinks: SinkSet,
    closed: AtomicBool,
    warn_throttler: Throttler,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        context: &Arc<Context>,
        topic: String,
        message_encoding: String,
        schema: Option<Schema>,
        metadata: BTreeMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            context: Arc::downgrade(context),
            topic,
            message_encoding,
            schema,
            metadata,
            sinks: SinkSet::default(),
            closed: AtomicBool::new(false),
            warn_throttler: Throttler::new(WARN_THROTTLE_INTERVAL),
        })
    }

    /// The process-unique channel id.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The message encoding, e.g. `json`, `protobuf` or `cdr`.
    pub fn message_encoding(&self) -> &str {
        &self.message_encoding
    }

    /// The schema, if one was attached.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Channel metadata.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// True if at least one sink is currently subscribed.
    ///
    /// Reflects live attach/detach: a sink added after this channel was
    /// created flips this to true if its filter accepts the channel.
    pub fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Closes the channel, detaching it from every sink.
    ///
    /// Idempotent. Subsequent `log` calls are no-ops that produce a
    /// throttled warning.
    pub fn close(&self) {
        if !self.is_closed() {
            if let Some(ctx) = self.context.upgrade() {
                ctx.remove_channel(self.id);
            } else {
                self.mark_detached();
            }
        }
    }

    /// Logs a message with the current wall-clock time.
    pub fn log(&self, payload: &[u8]) {
        self.log_to_sink(payload, None, None);
    }

    /// Logs a message with an explicit log time in nanoseconds since epoch.
    pub fn log_at(&self, payload: &[u8], log_time: u64) {
        self.log_to_sink(payload, Some(log_time), None);
    }

    /// Logs a message, optionally with an explicit time and/or targeting a
    /// single sink among those subscribed.
    ///
    /// Errors from individual sinks are reported via `tracing::warn!` and do
    /// not prevent delivery to the remaining sinks. Per-caller ordering to
    /// any given sink matches call order; no cross-thread order is implied.
    pub fn log_to_sink(&self, payload: &[u8], log_time: Option<u64>, sink_id: Option<SinkId>) {
        let sinks = self.sinks.load();
        if sinks.is_empty() {
            self.warn_if_closed();
            return;
        }

        let log_time = log_time.unwrap_or_else(nanoseconds_since_epoch);
        for sink in sinks.iter() {
            if let Some(target) = sink_id {
                if sink.id() != target {
                    continue;
                }
            }
            if let Err(err) = sink.write(self, payload, log_time) {
                warn!(
                    "error logging message on '{}' to sink {}: {}",
                    self.topic,
                    sink.id(),
                    err
                );
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the channel detached from its context and drops its sink set.
    pub(crate) fn mark_detached(&self) {
        self.closed.store(true, Ordering::Release);
        self.sinks.clear();
    }

    /// Replaces the set of sinks subscribed to this channel.
    pub(crate) fn update_sinks(&self, sinks: Vec<Arc<dyn crate::sink::Sink>>) {
        self.sinks.store(sinks);
    }

    fn warn_if_closed(&self) {
        if self.is_closed() && self.warn_throttler.try_acquire() {
            warn!("cannot log on closed channel for '{}'", self.topic);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("message_encoding", &self.message_encoding)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Channel`].
///
/// Creating a channel with the same (topic, message_encoding) as an existing
/// channel in the same context returns the existing channel instead of
/// allocating a new id.
#[must_use]
pub struct ChannelBuilder {
    topic: Vec<u8>,
    message_encoding: String,
    schema: Option<Schema>,
    metadata: BTreeMap<String, String>,
    context: Option<Arc<Context>>,
}

impl ChannelBuilder {
    /// Starts a builder for the given topic.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into().into_bytes(),
            message_encoding: String::new(),
            schema: None,
            metadata: BTreeMap::new(),
            context: None,
        }
    }

    /// Starts a builder from raw topic bytes.
    ///
    /// For callers bridging byte-oriented transports; the bytes are
    /// validated as UTF-8 when the channel is built.
    pub fn new_raw(topic: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            message_encoding: String::new(),
            schema: None,
            metadata: BTreeMap::new(),
            context: None,
        }
    }

    /// Sets the message encoding.
    pub fn message_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.message_encoding = encoding.into();
        self
    }

    /// Attaches a schema. The schema bytes are copied.
    pub fn schema(mut self, schema: impl Into<Option<Schema>>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Replaces the metadata map.
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds a single metadata entry.
    pub fn add_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Binds the channel to a context. Defaults to the process-wide default
    /// context.
    pub fn context(mut self, ctx: &Arc<Context>) -> Self {
        self.context = Some(ctx.clone());
        self
    }

    /// Validates inputs and registers the channel with its context.
    ///
    /// Returns the existing channel if an identical (topic, encoding) pair
    /// is already registered in the context.
    pub fn build(self) -> Result<Arc<Channel>, RecordError> {
        let topic =
            String::from_utf8(self.topic).map_err(|e| RecordError::Utf8Error(e.to_string()))?;
        if topic.is_empty() {
            return Err(RecordError::ValueError(
                "channel topic must not be empty".to_string(),
            ));
        }
        if let Some(schema) = &self.schema {
            schema.validate()?;
        }

        let ctx = self.context.unwrap_or_else(Context::get_default);
        Ok(ctx.register_channel(topic, self.message_encoding, self.schema, self.metadata))
    }
}
