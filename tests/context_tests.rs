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

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::RecordingSink;
use robolog::channel::ChannelBuilder;
use robolog::context::Context;
use robolog::errors::RecordError;
use robolog::schema::Schema;
use robolog::sink::Sink;

#[test]
fn test_create_channel_with_dedup() {
    common::init_tracing();
    let ctx = Context::new();
    let c1 = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();
    let c2 = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();

    // Identical (topic, encoding) converges on the same channel.
    assert_eq!(c1.id(), c2.id());
    assert_eq!(Arc::as_ptr(&c1), Arc::as_ptr(&c2));

    // A different encoding on the same topic is a distinct channel.
    let c3 = ctx
        .channel_builder("/imu")
        .message_encoding("protobuf")
        .build()
        .unwrap();
    assert_ne!(c1.id(), c3.id());

    // A different topic is a distinct channel.
    let c4 = ctx
        .channel_builder("/gps")
        .message_encoding("json")
        .build()
        .unwrap();
    assert_ne!(c1.id(), c4.id());

    // Lookups resolve both by id and by key.
    let by_id = ctx.channel_by_id(c3.id()).unwrap();
    assert_eq!(by_id.message_encoding(), "protobuf");
    let by_key = ctx.channel_for_topic("/imu", "json").unwrap();
    assert_eq!(by_key.id(), c1.id());
}

#[test]
fn test_concurrent_create_yields_one_id() {
    let ctx = Context::new();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let ctx = ctx.clone();
        handles.push(std::thread::spawn(move || {
            ctx.channel_builder("/concurrent")
                .message_encoding("json")
                .build()
                .unwrap()
                .id()
        }));
    }

    let ids: HashSet<u64> = handles
        .into_iter()
        .map(|h| h.join().unwrap().into())
        .collect();
    assert_eq!(ids.len(), 1, "all threads must converge on one channel id");
}

#[test]
fn test_invalid_utf8_topic_is_rejected() {
    let ctx = Context::new();
    let result = ChannelBuilder::new_raw(vec![0x80, 0x80, 0x80, 0x80])
        .message_encoding("json")
        .context(&ctx)
        .build();
    assert!(matches!(result, Err(RecordError::Utf8Error(_))));

    // No channel was registered.
    assert!(ctx.channel_for_topic("\u{FFFD}", "json").is_none());
}

#[test]
fn test_empty_topic_is_rejected() {
    let ctx = Context::new();
    let result = ctx.channel_builder("").message_encoding("json").build();
    assert!(matches!(result, Err(RecordError::ValueError(_))));
}

#[test]
fn test_cross_context_isolation() {
    let ctx_a = Context::new();
    let ctx_b = Context::new();

    let sink_a = RecordingSink::new();
    let sink_b = RecordingSink::new();
    ctx_a.add_sink(sink_a.clone());
    ctx_b.add_sink(sink_b.clone());

    let chan_a = ctx_a
        .channel_builder("/shared")
        .message_encoding("json")
        .build()
        .unwrap();
    let chan_b = ctx_b
        .channel_builder("/shared")
        .message_encoding("json")
        .build()
        .unwrap();

    chan_a.log(b"from-a");

    assert_eq!(sink_a.message_count(), 1);
    assert_eq!(sink_b.message_count(), 0);

    chan_b.log(b"from-b");
    assert_eq!(sink_a.message_count(), 1);
    assert_eq!(sink_b.message_count(), 1);
}

#[test]
fn test_close_detaches_channel() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());

    let c1 = ctx
        .channel_builder("/one")
        .message_encoding("json")
        .build()
        .unwrap();
    let c2 = ctx
        .channel_builder("/two")
        .message_encoding("json")
        .build()
        .unwrap();

    assert!(c1.has_sinks());
    c1.log(b"before close");
    assert_eq!(sink.message_count(), 1);

    c1.close();
    assert!(!c1.has_sinks());
    assert_eq!(sink.unsubscribed_topics(), vec!["/one".to_string()]);

    // Logging after close is a silent no-op.
    c1.log(b"after close");
    assert_eq!(sink.message_count(), 1);

    // Close is idempotent.
    c1.close();

    // Other channels on the same sink remain live.
    c2.log(b"still flowing");
    assert_eq!(sink.message_count(), 2);
}

#[test]
fn test_has_sinks_reflects_live_attach_detach() {
    let ctx = Context::new();
    let channel = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();
    assert!(!channel.has_sinks());

    // A sink added after the channel was created flips has_sinks.
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());
    assert!(channel.has_sinks());
    assert_eq!(sink.subscribed_topics(), vec!["/imu".to_string()]);

    ctx.remove_sink(sink.id());
    assert!(!channel.has_sinks());
}

#[test]
fn test_add_sink_twice_is_rejected() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    assert!(ctx.add_sink(sink.clone()));
    assert!(!ctx.add_sink(sink.clone()));
    assert!(ctx.remove_sink(sink.id()));
    assert!(!ctx.remove_sink(sink.id()));
}

#[test]
fn test_targeted_log_reaches_one_sink() {
    let ctx = Context::new();
    let sink1 = RecordingSink::new();
    let sink2 = RecordingSink::new();
    ctx.add_sink(sink1.clone());
    ctx.add_sink(sink2.clone());

    let channel = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();

    channel.log_to_sink(b"only for sink2", None, Some(sink2.id()));
    assert_eq!(sink1.message_count(), 0);
    assert_eq!(sink2.message_count(), 1);

    channel.log(b"for everyone");
    assert_eq!(sink1.message_count(), 1);
    assert_eq!(sink2.message_count(), 2);
}

#[test]
fn test_dropping_context_detaches_channels() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());
    let channel = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();

    channel.log(b"one");
    assert_eq!(sink.message_count(), 1);

    drop(ctx);

    assert!(!channel.has_sinks());
    channel.log(b"two");
    assert_eq!(sink.message_count(), 1);
}

#[test]
fn test_schema_bytes_are_copied_at_creation() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());

    let mut schema_bytes = b"{\"type\":\"object\"}".to_vec();
    let channel = ctx
        .channel_builder("/typed")
        .message_encoding("json")
        .schema(Schema::new("Typed", "jsonschema", schema_bytes.as_slice()))
        .build()
        .unwrap();

    // Mutating the caller's buffer afterwards has no effect.
    schema_bytes.fill(b'!');
    assert_eq!(channel.schema().unwrap().data, b"{\"type\":\"object\"}");
}

#[test]
fn test_explicit_log_time_is_forwarded() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());
    let channel = ctx
        .channel_builder("/stamped")
        .message_encoding("json")
        .build()
        .unwrap();

    channel.log_at(b"stamped", 12345);
    let messages = sink.take_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].log_time, 12345);

    let before = robolog::nanoseconds_since_epoch();
    channel.log(b"now");
    let messages = sink.take_messages();
    assert!(messages[0].log_time >= before);
}
