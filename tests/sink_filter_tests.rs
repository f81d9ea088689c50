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

use std::sync::Arc;

use common::{FailingSink, PanickingFilter, RecordingSink, TopicFilter};
use robolog::context::Context;
use robolog::sink::Sink;

#[test]
fn test_complementary_filters_isolate_sinks() {
    common::init_tracing();
    let ctx = Context::new();
    let sink1 = RecordingSink::with_filter(Arc::new(TopicFilter("/1".to_string())));
    let sink2 = RecordingSink::with_filter(Arc::new(TopicFilter("/2".to_string())));
    ctx.add_sink(sink1.clone());
    ctx.add_sink(sink2.clone());

    let c1 = ctx
        .channel_builder("/1")
        .message_encoding("json")
        .build()
        .unwrap();
    let c2 = ctx
        .channel_builder("/2")
        .message_encoding("json")
        .build()
        .unwrap();

    c1.log(b"one");
    c2.log(b"two");
    c1.log(b"three");

    let messages1 = sink1.take_messages();
    let messages2 = sink2.take_messages();

    assert_eq!(messages1.len(), 2);
    assert!(messages1.iter().all(|m| m.topic == "/1"));

    assert_eq!(messages2.len(), 1);
    assert!(messages2.iter().all(|m| m.topic == "/2"));
}

#[test]
fn test_filter_applies_to_existing_channels_on_attach() {
    let ctx = Context::new();
    let c1 = ctx
        .channel_builder("/keep")
        .message_encoding("json")
        .build()
        .unwrap();
    let c2 = ctx
        .channel_builder("/drop")
        .message_encoding("json")
        .build()
        .unwrap();

    let sink = RecordingSink::with_filter(Arc::new(TopicFilter("/keep".to_string())));
    ctx.add_sink(sink.clone());

    assert!(c1.has_sinks());
    assert!(!c2.has_sinks());
    assert_eq!(sink.subscribed_topics(), vec!["/keep".to_string()]);
}

#[test]
fn test_encoding_gate_combines_with_filter() {
    let ctx = Context::new();
    let sink = RecordingSink::with_encodings(&["json"]);
    ctx.add_sink(sink.clone());

    let json = ctx
        .channel_builder("/a")
        .message_encoding("json")
        .build()
        .unwrap();
    let proto = ctx
        .channel_builder("/b")
        .message_encoding("protobuf")
        .build()
        .unwrap();

    assert!(json.has_sinks());
    assert!(!proto.has_sinks());

    json.log(b"{}");
    proto.log(b"\x08\x01");
    assert_eq!(sink.message_count(), 1);
}

#[test]
fn test_panicking_filter_rejects_channel_without_fallout() {
    let ctx = Context::new();
    let broken = RecordingSink::with_filter(Arc::new(PanickingFilter));
    let healthy = RecordingSink::new();
    ctx.add_sink(broken.clone());
    ctx.add_sink(healthy.clone());

    let channel = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();

    // The panicking filter rejects; the healthy sink still subscribes.
    channel.log(b"payload");
    assert_eq!(broken.message_count(), 0);
    assert_eq!(healthy.message_count(), 1);
}

#[test]
fn test_failing_sink_does_not_stop_fanout() {
    let ctx = Context::new();
    let failing = FailingSink::new();
    let recording = RecordingSink::new();
    ctx.add_sink(failing);
    ctx.add_sink(recording.clone());

    let channel = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();

    channel.log(b"payload");
    assert_eq!(recording.message_count(), 1);
}

#[test]
fn test_subscribe_callbacks_fire_per_transition() {
    let ctx = Context::new();
    let sink = RecordingSink::new();

    let c1 = ctx
        .channel_builder("/a")
        .message_encoding("json")
        .build()
        .unwrap();
    ctx.add_sink(sink.clone());
    let _c2 = ctx
        .channel_builder("/b")
        .message_encoding("json")
        .build()
        .unwrap();

    let mut subscribed = sink.subscribed_topics();
    subscribed.sort();
    assert_eq!(subscribed, vec!["/a".to_string(), "/b".to_string()]);

    c1.close();
    assert_eq!(sink.unsubscribed_topics(), vec!["/a".to_string()]);

    ctx.remove_sink(sink.id());
    let unsubscribed = sink.unsubscribed_topics();
    assert!(unsubscribed.contains(&"/b".to_string()));
}

#[test]
fn test_per_caller_ordering_is_preserved() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());
    let channel = ctx
        .channel_builder("/seq")
        .message_encoding("json")
        .build()
        .unwrap();

    for i in 0u32..100 {
        channel.log_at(&i.to_le_bytes(), u64::from(i));
    }

    let messages = sink.take_messages();
    assert_eq!(messages.len(), 100);
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.log_time, i as u64);
    }
}

#[test]
fn test_concurrent_logging_delivers_everything() {
    let ctx = Context::new();
    let sink = RecordingSink::new();
    ctx.add_sink(sink.clone());
    let channel = ctx
        .channel_builder("/stress")
        .message_encoding("json")
        .build()
        .unwrap();

    let mut handles = Vec::new();
    for t in 0..8u8 {
        let channel = channel.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..50u8 {
                channel.log(&[t, i]);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let messages = sink.take_messages();
    assert_eq!(messages.len(), 8 * 50);

    // Per-caller order is preserved at the sink.
    for t in 0..8u8 {
        let seq: Vec<u8> = messages
            .iter()
            .filter(|m| m.payload[0] == t)
            .map(|m| m.payload[1])
            .collect();
        let expected: Vec<u8> = (0..50u8).collect();
        assert_eq!(seq, expected);
    }
}
