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

// Sink abstraction: a write-only consumer of logged messages
//
// Sinks subscribe to a filtered subset of a context's channels. The channel
// keeps a copy-on-write snapshot of its subscribed sinks so that `log` never
// touches the registry lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::channel::Channel;
use crate::errors::RecordError;
use crate::filter::{self, ChannelFilter};

/// Uniquely identifies a sink within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    /// Allocates the next sink id. Ids start at 1 and only increase.
    ///
    /// Custom [`Sink`] implementations allocate their id here once, at
    /// construction, and return it from [`Sink::id`].
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SinkId> for u64 {
    fn from(id: SinkId) -> Self {
        id.0
    }
}

/// A consumer of logged messages (MCAP file, live server, cloud relay).
///
/// `write` is invoked on the logging thread and must not block on I/O; sinks
/// with slow consumption are expected to copy the payload into an internal
/// queue and apply their own backpressure policy.
pub trait Sink: Send + Sync {
    /// The sink's unique id.
    fn id(&self) -> SinkId;

    /// Deliver one message. Delivery is atomic per message: the registry
    /// guarantees no interleaved partial writes from concurrent callers, but
    /// sinks must serialize their own internal state.
    fn write(&self, channel: &Channel, payload: &[u8], log_time: u64)
        -> Result<(), RecordError>;

    /// Message encodings this sink accepts. `None` accepts everything.
    fn supported_encodings(&self) -> Option<&[String]> {
        None
    }

    /// Optional channel filter, combined with the encoding test at
    /// subscription time.
    fn channel_filter(&self) -> Option<&dyn ChannelFilter> {
        None
    }

    /// Invoked after this sink has been subscribed to a channel. Called
    /// outside all registry locks; may be slow but should not deadlock on
    /// registry operations for the same context.
    fn on_subscribe(&self, _channel: &Arc<Channel>) {}

    /// Invoked after this sink has been unsubscribed from a channel, either
    /// because the channel closed or the sink was removed.
    fn on_unsubscribe(&self, _channel: &Channel) {}

    /// Flush buffered data, where the sink buffers at all.
    fn flush(&self) -> Result<(), RecordError> {
        Ok(())
    }
}

/// Subscription test applied once per (sink, channel) pair: the channel's
/// encoding must be supported and the filter (if any) must accept.
pub(crate) fn sink_accepts(sink: &dyn Sink, channel: &Channel) -> bool {
    if let Some(encodings) = sink.supported_encodings() {
        if !encodings
            .iter()
            .any(|e| e == channel.message_encoding())
        {
            return false;
        }
    }
    match sink.channel_filter() {
        Some(f) => filter::evaluate(f, channel),
        None => true,
    }
}

/// Copy-on-write snapshot of the sinks subscribed to one channel.
///
/// Readers (the `log` hot path) clone the inner `Arc` under a read lock and
/// iterate without holding anything; writers swap in a rebuilt vector. This
/// keeps fan-out wait-free with respect to registry mutation.
#[derive(Default)]
pub(crate) struct SinkSet(RwLock<Arc<Vec<Arc<dyn Sink>>>>);

impl SinkSet {
    pub fn load(&self) -> Arc<Vec<Arc<dyn Sink>>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, sinks: Vec<Arc<dyn Sink>>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(sinks);
    }

    pub fn clear(&self) {
        self.store(Vec::new());
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }
}
