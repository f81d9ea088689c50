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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use robolog::context::Context;
use robolog::relay::{CloudRelay, RelayOptions, RelaySessionMetadata, RelayTransport};
use robolog::CompressionType;

#[derive(Debug, Clone)]
struct Upload {
    entry_name: String,
    data: Vec<u8>,
    labels: HashMap<String, String>,
}

#[derive(Default)]
struct MemoryTransport {
    uploads: Mutex<Vec<Upload>>,
}

impl MemoryTransport {
    fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upload(
        &self,
        entry_name: &str,
        _timestamp_us: u64,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.uploads.lock().unwrap().push(Upload {
            entry_name: entry_name.to_string(),
            data,
            labels,
        });
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn test_options() -> RelayOptions {
    RelayOptions {
        compression_type: CompressionType::None,
        max_batch_seconds: 1,
        ..RelayOptions::default()
    }
}

#[test]
fn test_relay_uploads_batches_and_session_metadata() {
    let ctx = Context::new();
    let transport = Arc::new(MemoryTransport::default());

    let handle = CloudRelay::new(test_options())
        .context(&ctx)
        .transport(transport.clone())
        .start()
        .unwrap();
    let recording_id = handle.recording_id().to_string();

    let imu = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();
    let gps = ctx
        .channel_builder("/gps")
        .message_encoding("json")
        .build()
        .unwrap();

    imu.log_at(b"a", 1_000_000);
    imu.log_at(b"bb", 2_000_000);
    // Targeting the relay sink explicitly also lands in its queue.
    gps.log_to_sink(b"ccc", Some(3_000_000), Some(handle.sink_id()));

    let (messages, bytes) = handle.stats();
    assert_eq!(messages, 3);
    assert_eq!(bytes, 6);

    handle.stop().wait_blocking();

    let uploads = transport.uploads();
    let batches: Vec<&Upload> = uploads
        .iter()
        .filter(|u| u.entry_name.starts_with("recordings/"))
        .collect();
    assert_eq!(batches.len(), 2);

    let imu_batch = batches
        .iter()
        .find(|u| u.entry_name == "recordings/imu")
        .expect("imu batch");
    assert_eq!(imu_batch.labels.get("topic"), Some(&"/imu".to_string()));
    assert_eq!(imu_batch.labels.get("count"), Some(&"2".to_string()));
    assert_eq!(
        imu_batch.labels.get("recording_id"),
        Some(&recording_id)
    );

    // Uncompressed batches start with the ASCII header line.
    let header_end = imu_batch.data.iter().position(|&b| b == b'\n').unwrap();
    let header = std::str::from_utf8(&imu_batch.data[..header_end]).unwrap();
    assert!(header.contains("topic=/imu"));
    assert!(header.contains("count=2"));

    // The session metadata record is uploaded last.
    let metadata_upload = uploads
        .iter()
        .find(|u| u.entry_name == "recordings_metadata")
        .expect("metadata upload");
    let metadata: RelaySessionMetadata =
        serde_json::from_slice(&metadata_upload.data).unwrap();
    assert_eq!(metadata.recording_id, recording_id);
    assert_eq!(metadata.total_messages, 3);
    assert_eq!(metadata.total_bytes, 6);
    assert_eq!(metadata.per_topic_counts.get("/imu"), Some(&2));
    assert_eq!(metadata.per_topic_counts.get("/gps"), Some(&1));
}

#[test]
fn test_relay_honors_channel_filter() {
    let ctx = Context::new();
    let transport = Arc::new(MemoryTransport::default());

    let handle = CloudRelay::new(test_options())
        .context(&ctx)
        .transport(transport.clone())
        .channel_filter_fn(|channel| channel.topic().starts_with("/imu"))
        .start()
        .unwrap();

    let imu = ctx
        .channel_builder("/imu")
        .message_encoding("json")
        .build()
        .unwrap();
    let gps = ctx
        .channel_builder("/gps")
        .message_encoding("json")
        .build()
        .unwrap();

    assert!(imu.has_sinks());
    assert!(!gps.has_sinks());

    imu.log_at(b"keep", 1);
    gps.log_at(b"drop", 2);

    handle.stop().wait_blocking();

    let uploads = transport.uploads();
    assert!(uploads.iter().any(|u| u.entry_name == "recordings/imu"));
    assert!(!uploads.iter().any(|u| u.entry_name == "recordings/gps"));
}

#[test]
fn test_relay_zstd_batches_decompress() {
    let ctx = Context::new();
    let transport = Arc::new(MemoryTransport::default());

    let options = RelayOptions {
        compression_type: CompressionType::Zstd,
        max_batch_seconds: 1,
        ..RelayOptions::default()
    };
    let handle = CloudRelay::new(options)
        .context(&ctx)
        .transport(transport.clone())
        .start()
        .unwrap();

    let channel = ctx
        .channel_builder("/bulk")
        .message_encoding("json")
        .build()
        .unwrap();
    channel.log_at(&[7u8; 2048], 1);

    handle.stop().wait_blocking();

    let uploads = transport.uploads();
    let batch = uploads
        .iter()
        .find(|u| u.entry_name == "recordings/bulk")
        .expect("bulk batch");
    let restored = zstd::decode_all(&batch.data[..]).unwrap();
    assert!(restored.starts_with(b"ROBOLOG_BATCH|topic=/bulk"));
    assert!(batch.data.len() < restored.len());
}
