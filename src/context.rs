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

// Context: the binding between channels and sinks
//
// The context owns the one piece of truly shared mutable state in the SDK:
// the channel/sink subscription tables. Table mutation happens under a
// single exclusive lock; filter evaluation and sink callbacks always run
// after the lock is released, on a locally captured snapshot. Channel
// lookups by id go through a lock-free shadow index.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelBuilder, ChannelId};
use crate::schema::Schema;
use crate::sink::{sink_accepts, Sink, SinkId};

#[derive(Default)]
struct ContextInner {
    /// All registered channels.
    channels: HashMap<ChannelId, Arc<Channel>>,
    /// Dedup index: (topic, message_encoding) -> channel id.
    channels_by_key: HashMap<(String, String), ChannelId>,
    /// All attached sinks.
    sinks: HashMap<SinkId, Arc<dyn Sink>>,
    /// Memoized subscription decisions: only accepted pairs are recorded.
    subscriptions: HashMap<ChannelId, Vec<SinkId>>,
}

impl ContextInner {
    /// Rebuilds a channel's fan-out snapshot from the subscription table.
    fn refresh_channel_sinks(&self, channel: &Channel) {
        let sinks = self
            .subscriptions
            .get(&channel.id())
            .map(|sink_ids| {
                sink_ids
                    .iter()
                    .filter_map(|id| self.sinks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        channel.update_sinks(sinks);
    }
}

/// An isolation namespace grouping channels and sinks.
///
/// Channels and sinks created under different contexts never interact: a
/// message logged on a channel of context A is never observed by a sink of
/// context B, even with identical topics and encodings.
///
/// Most applications only need one context; [`Context::get_default`] returns
/// a process-wide instance. Dropping an explicit context detaches all of its
/// channels and sinks; channels keep working as no-ops (with a throttled
/// warning) and sinks retain whatever they already buffered.
pub struct Context {
    inner: Mutex<ContextInner>,
    /// Shadow index for lock-free reads on the hot path.
    channels_by_id: DashMap<ChannelId, Arc<Channel>>,
}

impl Context {
    /// Creates a new, empty context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ContextInner::default()),
            channels_by_id: DashMap::new(),
        })
    }

    /// Returns the process-wide default context, creating it on first use.
    pub fn get_default() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<Context>> = OnceLock::new();
        DEFAULT.get_or_init(Context::new).clone()
    }

    /// Returns a channel builder bound to this context.
    pub fn channel_builder(self: &Arc<Self>, topic: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(topic).context(self)
    }

    /// Looks up a channel by id without taking the registry lock.
    pub fn channel_by_id(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels_by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns the channel registered for (topic, encoding), if any.
    pub fn channel_for_topic(&self, topic: &str, encoding: &str) -> Option<Arc<Channel>> {
        let inner = self.lock_inner();
        let id = inner
            .channels_by_key
            .get(&(topic.to_string(), encoding.to_string()))?;
        inner.channels.get(id).cloned()
    }

    /// Registers a channel, deduplicating on (topic, message_encoding).
    ///
    /// The winning create allocates the id; concurrent creates for the same
    /// key converge on the same channel. Attached sinks are re-evaluated
    /// against the new channel outside the registry lock.
    pub(crate) fn register_channel(
        self: &Arc<Self>,
        topic: String,
        message_encoding: String,
        schema: Option<Schema>,
        metadata: BTreeMap<String, String>,
    ) -> Arc<Channel> {
        let (channel, sinks) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let key = (topic.clone(), message_encoding.clone());
            if let Some(id) = inner.channels_by_key.get(&key) {
                let existing = inner.channels[id].clone();
                debug!(
                    "returning existing channel {} for topic '{}' ({})",
                    existing.id(),
                    topic,
                    message_encoding
                );
                return existing;
            }

            // Same topic under a different encoding is allowed but usually a
            // mistake for downstream consumers.
            if inner
                .channels_by_key
                .keys()
                .any(|(t, _)| t == &topic)
            {
                warn!(
                    "channel with topic '{}' already exists in this context; \
                     use a unique topic for each channel",
                    topic
                );
            }

            let channel = Channel::new(
                ChannelId::next(),
                self,
                topic,
                message_encoding,
                schema,
                metadata,
            );
            inner.channels.insert(channel.id(), channel.clone());
            inner.channels_by_key.insert(key, channel.id());
            self.channels_by_id.insert(channel.id(), channel.clone());

            let sinks: Vec<Arc<dyn Sink>> = inner.sinks.values().cloned().collect();
            (channel, sinks)
        };

        // Evaluate each attached sink's filter against the new channel with
        // the lock released, then record the accepted subscriptions.
        let accepted: Vec<Arc<dyn Sink>> = sinks
            .into_iter()
            .filter(|sink| sink_accepts(sink.as_ref(), &channel))
            .collect();

        if !accepted.is_empty() {
            {
                let mut guard = self.lock_inner();
                let inner = &mut *guard;
                if inner.channels.contains_key(&channel.id()) {
                    let subs = inner.subscriptions.entry(channel.id()).or_default();
                    for sink in &accepted {
                        if inner.sinks.contains_key(&sink.id()) && !subs.contains(&sink.id()) {
                            subs.push(sink.id());
                        }
                    }
                    inner.refresh_channel_sinks(&channel);
                }
            }
            for sink in &accepted {
                dispatch_callback("on_subscribe", || sink.on_subscribe(&channel));
            }
        }

        channel
    }

    /// Removes a channel from the context, detaching it from all sinks.
    pub(crate) fn remove_channel(&self, channel_id: ChannelId) -> bool {
        let (channel, subscribed) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let Some(channel) = inner.channels.remove(&channel_id) else {
                return false;
            };
            inner
                .channels_by_key
                .remove(&(channel.topic().to_string(), channel.message_encoding().to_string()));
            self.channels_by_id.remove(&channel_id);

            let sink_ids = inner.subscriptions.remove(&channel_id).unwrap_or_default();
            let subscribed: Vec<Arc<dyn Sink>> = sink_ids
                .iter()
                .filter_map(|id| inner.sinks.get(id).cloned())
                .collect();

            channel.mark_detached();
            (channel, subscribed)
        };

        for sink in subscribed {
            dispatch_callback("on_unsubscribe", || sink.on_unsubscribe(&channel));
        }
        true
    }

    /// Attaches a sink, evaluating its filter against every registered
    /// channel. Returns false if the sink was already attached.
    pub fn add_sink(&self, sink: Arc<dyn Sink>) -> bool {
        let channels = {
            let mut guard = self.lock_inner();
            if guard.sinks.contains_key(&sink.id()) {
                return false;
            }
            guard.sinks.insert(sink.id(), sink.clone());
            guard.channels.values().cloned().collect::<Vec<_>>()
        };

        let accepted: Vec<Arc<Channel>> = channels
            .into_iter()
            .filter(|channel| sink_accepts(sink.as_ref(), channel))
            .collect();

        {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            // The sink may have been removed while filters ran.
            if inner.sinks.contains_key(&sink.id()) {
                for channel in &accepted {
                    if inner.channels.contains_key(&channel.id()) {
                        let subs = inner.subscriptions.entry(channel.id()).or_default();
                        if !subs.contains(&sink.id()) {
                            subs.push(sink.id());
                        }
                    }
                }
                for channel in &accepted {
                    inner.refresh_channel_sinks(channel);
                }
            }
        }

        for channel in &accepted {
            dispatch_callback("on_subscribe", || sink.on_subscribe(channel));
        }
        true
    }

    /// Detaches a sink from every channel it was subscribed to. Returns
    /// false if the sink was not attached.
    pub fn remove_sink(&self, sink_id: SinkId) -> bool {
        let (sink, unsubscribed) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let Some(sink) = inner.sinks.remove(&sink_id) else {
                return false;
            };

            let mut unsubscribed = Vec::new();
            let mut affected = Vec::new();
            for (channel_id, subs) in inner.subscriptions.iter_mut() {
                if let Some(pos) = subs.iter().position(|id| *id == sink_id) {
                    subs.swap_remove(pos);
                    affected.push(*channel_id);
                }
            }
            for channel_id in affected {
                if let Some(channel) = inner.channels.get(&channel_id).cloned() {
                    inner.refresh_channel_sinks(&channel);
                    unsubscribed.push(channel);
                }
            }
            (sink, unsubscribed)
        };

        for channel in &unsubscribed {
            dispatch_callback("on_unsubscribe", || sink.on_unsubscribe(channel));
        }
        true
    }

    /// Detaches everything. Channels become closed no-ops; sinks keep their
    /// already-buffered state.
    pub(crate) fn clear(&self) {
        let detached = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let subscriptions = std::mem::take(&mut inner.subscriptions);
            let sinks = std::mem::take(&mut inner.sinks);
            let channels = std::mem::take(&mut inner.channels);
            inner.channels_by_key.clear();
            self.channels_by_id.clear();

            let mut detached = Vec::new();
            for (channel_id, channel) in channels {
                channel.mark_detached();
                let subscribed: Vec<Arc<dyn Sink>> = subscriptions
                    .get(&channel_id)
                    .map(|ids| ids.iter().filter_map(|id| sinks.get(id).cloned()).collect())
                    .unwrap_or_default();
                detached.push((channel, subscribed));
            }
            detached
        };

        for (channel, subscribed) in &detached {
            for sink in subscribed {
                dispatch_callback("on_unsubscribe", || sink.on_unsubscribe(channel));
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Runs a sink callback, isolating panics from the registry.
fn dispatch_callback<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("sink callback '{}' panicked", what);
    }
}
