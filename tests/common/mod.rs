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

// Shared test sinks and filters

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use robolog::channel::Channel;
use robolog::errors::RecordError;
use robolog::filter::ChannelFilter;
use robolog::sink::{Sink, SinkId};

/// Installs a fmt subscriber once so RUST_LOG works in tests.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One message observed by a [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub channel_id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub log_time: u64,
}

/// A sink that records everything it receives, for assertions.
pub struct RecordingSink {
    id: SinkId,
    messages: Mutex<Vec<RecordedMessage>>,
    subscribed: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
    supported_encodings: Option<Vec<String>>,
    filter: Option<Arc<dyn ChannelFilter>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SinkId::next(),
            messages: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            supported_encodings: None,
            filter: None,
        })
    }

    pub fn with_filter(filter: Arc<dyn ChannelFilter>) -> Arc<Self> {
        Arc::new(Self {
            id: SinkId::next(),
            messages: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            supported_encodings: None,
            filter: Some(filter),
        })
    }

    pub fn with_encodings(encodings: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id: SinkId::next(),
            messages: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            supported_encodings: Some(encodings.iter().map(|s| s.to_string()).collect()),
            filter: None,
        })
    }

    pub fn take_messages(&self) -> Vec<RecordedMessage> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.unsubscribed.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn write(
        &self,
        channel: &Channel,
        payload: &[u8],
        log_time: u64,
    ) -> Result<(), RecordError> {
        self.messages.lock().unwrap().push(RecordedMessage {
            channel_id: channel.id().into(),
            topic: channel.topic().to_string(),
            payload: payload.to_vec(),
            log_time,
        });
        Ok(())
    }

    fn supported_encodings(&self) -> Option<&[String]> {
        self.supported_encodings.as_deref()
    }

    fn channel_filter(&self) -> Option<&dyn ChannelFilter> {
        self.filter.as_deref()
    }

    fn on_subscribe(&self, channel: &Arc<Channel>) {
        self.subscribed.lock().unwrap().push(channel.topic().to_string());
    }

    fn on_unsubscribe(&self, channel: &Channel) {
        self.unsubscribed
            .lock()
            .unwrap()
            .push(channel.topic().to_string());
    }
}

/// A sink whose writes always fail, to exercise the warn-and-continue path.
pub struct FailingSink {
    id: SinkId,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { id: SinkId::next() })
    }
}

impl Sink for FailingSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn write(&self, _: &Channel, _: &[u8], _: u64) -> Result<(), RecordError> {
        Err(RecordError::SinkClosed)
    }
}

/// Accepts exactly one topic.
pub struct TopicFilter(pub String);

impl ChannelFilter for TopicFilter {
    fn should_subscribe(&self, channel: &Channel) -> bool {
        channel.topic() == self.0
    }
}

/// Panics on every evaluation.
pub struct PanickingFilter;

impl ChannelFilter for PanickingFilter {
    fn should_subscribe(&self, _channel: &Channel) -> bool {
        panic!("filter failure")
    }
}
