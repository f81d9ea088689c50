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

// Cloud relay sink
//
// Queues accepted messages into a bounded lock-free queue and uploads them
// from a background worker: batched per topic, length-prefixed, optionally
// compressed, POSTed over HTTP with retry and exponential backoff. The
// logging threads never wait on the network; when the queue is full the
// message is dropped with a throttled warning.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::clock::Throttler;
use crate::compression::{CompressionLevel, CompressionType};
use crate::context::Context;
use crate::errors::RecordError;
use crate::filter::{ChannelFilter, ChannelFilterFn};
use crate::runtime::{get_runtime_handle, ShutdownHandle};
use crate::sink::{Sink, SinkId};

/// Interval for throttled queue-overflow warnings.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Worker wakes up at least this often to check the time-based flush policy.
const WORKER_TICK: Duration = Duration::from_millis(500);

/// Options for the cloud relay sink.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Base URL of the relay endpoint.
    pub url: String,
    /// Stream (entry) name that batches are uploaded under.
    pub stream: String,
    /// Optional bearer token.
    pub api_token: Option<String>,
    /// HTTP request timeout.
    pub timeout_seconds: u64,
    /// Upload retry attempts before a batch is dropped.
    pub max_retries: u32,
    /// Batch compression algorithm.
    pub compression_type: CompressionType,
    /// Batch compression level.
    pub compression_level: CompressionLevel,
    /// Flush once this many bytes of payload are pending.
    pub max_batch_bytes: usize,
    /// Flush at least this often while messages are pending.
    pub max_batch_seconds: u64,
    /// Capacity of the bounded message queue.
    pub queue_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            url: "http://localhost:8383".to_string(),
            stream: "recordings".to_string(),
            api_token: None,
            timeout_seconds: 300,
            max_retries: 3,
            compression_type: CompressionType::Zstd,
            compression_level: CompressionLevel::Default,
            max_batch_bytes: 4 * 1024 * 1024,
            max_batch_seconds: 10,
            queue_capacity: 4096,
        }
    }
}

/// Transport used by the relay worker to move batches upstream.
///
/// The HTTP implementation is the production path; tests substitute an
/// in-memory transport. Errors here never reach the logging caller; failed
/// batches are logged and dropped after `max_retries`.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Prepare the upstream (create the bucket/stream if needed).
    async fn initialize(&self) -> Result<()>;

    /// Upload one batch with metadata labels.
    async fn upload(
        &self,
        entry_name: &str,
        timestamp_us: u64,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<()>;

    /// Upload with retry and exponential backoff.
    async fn upload_with_retry(
        &self,
        entry_name: &str,
        timestamp_us: u64,
        data: Vec<u8>,
        labels: HashMap<String, String>,
        max_retries: u32,
    ) -> Result<()> {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(100);

        loop {
            match self
                .upload(entry_name, timestamp_us, data.clone(), labels.clone())
                .await
            {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            "uploaded batch to entry '{}' after {} retries",
                            entry_name, attempt
                        );
                    }
                    return Ok(());
                }
                Err(e) if attempt < max_retries => {
                    warn!(
                        "upload to entry '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        entry_name,
                        attempt + 1,
                        max_retries,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    delay = delay.min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "upload to entry '{}' failed after {} attempts: {}",
                        entry_name, max_retries, e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Health check against the upstream.
    async fn health_check(&self) -> Result<bool>;
}

/// HTTP transport speaking the relay's REST interface.
pub struct HttpRelayTransport {
    client: Client,
    base_url: String,
}

impl HttpRelayTransport {
    pub fn new(options: &RelayOptions) -> Result<Self> {
        let mut builder = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(options.timeout_seconds));

        if let Some(token) = &options.api_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&auth_value)
                    .context("Invalid API token")?,
            );
            builder = builder.default_headers(headers);
        }

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            base_url: options.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/api/v1/info", self.base_url);
        match self.client.head(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => bail!("relay endpoint not ready: {}", response.status()),
            Err(e) => bail!("relay endpoint unreachable: {}", e),
        }
    }

    async fn upload(
        &self,
        entry_name: &str,
        timestamp_us: u64,
        data: Vec<u8>,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let url = format!(
            "{}/api/v1/e/{}?ts={}",
            self.base_url, entry_name, timestamp_us
        );

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/octet-stream");
        for (key, value) in labels {
            request = request.header(format!("x-relay-label-{}", key), value);
        }

        let response = request
            .body(data)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!("relay upload failed with status {}: {}", status, error_text);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/v1/info", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!("relay health check failed with status: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("relay health check error: {}", e);
                Ok(false)
            }
        }
    }
}

/// One queued message awaiting upload.
struct QueuedMessage {
    topic: Arc<str>,
    payload: Bytes,
    log_time: u64,
}

/// Serializes per-topic batches with an ASCII header and length-prefixed
/// records, then compresses the result.
///
/// Record layout after the header line: `u32` payload length (LE), `u64`
/// log time (LE), payload bytes.
pub(crate) struct BatchEncoder {
    compression_type: CompressionType,
    compression_level: CompressionLevel,
}

impl BatchEncoder {
    pub fn new(compression_type: CompressionType, compression_level: CompressionLevel) -> Self {
        Self {
            compression_type,
            compression_level,
        }
    }

    pub fn encode(
        &self,
        topic: &str,
        recording_id: &str,
        messages: &[(u64, Bytes)],
    ) -> Result<Vec<u8>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let payload_size: usize = messages.iter().map(|(_, p)| p.len()).sum();
        let mut buffer = Vec::with_capacity(payload_size + messages.len() * 12 + 128);

        writeln!(
            buffer,
            "ROBOLOG_BATCH|topic={}|recording_id={}|count={}",
            topic,
            recording_id,
            messages.len()
        )
        .context("Failed to write batch header")?;

        for (log_time, payload) in messages {
            buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&log_time.to_le_bytes());
            buffer.extend_from_slice(payload);
        }

        let uncompressed = buffer.len();
        let compressed = self.compress(buffer)?;
        debug!(
            "encoded {} messages for '{}' ({} -> {} bytes, {:?})",
            messages.len(),
            topic,
            uncompressed,
            compressed.len(),
            self.compression_type
        );
        Ok(compressed)
    }

    fn compress(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data),
            CompressionType::Lz4 => {
                let mut encoder = lz4::EncoderBuilder::new()
                    .level(self.compression_level.to_lz4_level())
                    .build(Vec::new())
                    .context("Failed to create LZ4 encoder")?;
                encoder
                    .write_all(&data)
                    .context("Failed to write data to LZ4 encoder")?;
                let (compressed, result) = encoder.finish();
                result.context("LZ4 compression failed")?;
                Ok(compressed)
            }
            CompressionType::Zstd => {
                zstd::encode_all(&data[..], self.compression_level.to_zstd_level())
                    .context("Zstd compression failed")
            }
        }
    }
}

/// Session metadata uploaded when the relay closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySessionMetadata {
    pub recording_id: String,
    pub stream: String,
    pub start_time: String,
    pub end_time: String,
    pub compression_type: String,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub per_topic_counts: HashMap<String, u64>,
}

struct RelayShared {
    queue: ArrayQueue<QueuedMessage>,
    notify: Notify,
    total_messages: AtomicUsize,
    total_bytes: AtomicUsize,
    dropped: AtomicUsize,
}

/// The context-facing sink for a running relay.
struct RelaySink {
    sink_id: SinkId,
    supported_encodings: Option<Vec<String>>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
    shared: Arc<RelayShared>,
    drop_throttler: Throttler,
}

impl Sink for RelaySink {
    fn id(&self) -> SinkId {
        self.sink_id
    }

    fn write(
        &self,
        channel: &Channel,
        payload: &[u8],
        log_time: u64,
    ) -> Result<(), RecordError> {
        let msg = QueuedMessage {
            topic: Arc::from(channel.topic()),
            payload: Bytes::copy_from_slice(payload),
            log_time,
        };
        let len = msg.payload.len();
        if self.shared.queue.push(msg).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            if self.drop_throttler.try_acquire() {
                warn!(
                    "relay queue full; dropping messages on '{}'",
                    channel.topic()
                );
            }
            return Ok(());
        }
        self.shared.total_messages.fetch_add(1, Ordering::Relaxed);
        self.shared.total_bytes.fetch_add(len, Ordering::Relaxed);
        self.shared.notify.notify_one();
        Ok(())
    }

    fn supported_encodings(&self) -> Option<&[String]> {
        self.supported_encodings.as_deref()
    }

    fn channel_filter(&self) -> Option<&dyn ChannelFilter> {
        self.channel_filter.as_deref()
    }
}

/// Builder for the cloud relay sink.
#[must_use]
pub struct CloudRelay {
    options: RelayOptions,
    context: Arc<Context>,
    supported_encodings: Vec<String>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
    transport: Option<Arc<dyn RelayTransport>>,
}

impl CloudRelay {
    pub fn new(options: RelayOptions) -> Self {
        Self {
            options,
            context: Context::get_default(),
            supported_encodings: Vec::new(),
            channel_filter: None,
            transport: None,
        }
    }

    /// Binds the sink to a context. Defaults to the process default context.
    pub fn context(mut self, ctx: &Arc<Context>) -> Self {
        self.context = ctx.clone();
        self
    }

    /// Encodings this relay accepts; empty accepts everything.
    pub fn supported_encodings(
        mut self,
        encodings: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.supported_encodings = encodings.into_iter().map(Into::into).collect();
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

    /// Replaces the HTTP transport, e.g. with an in-memory one for tests.
    pub fn transport(mut self, transport: Arc<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Starts the upload worker and attaches the sink to the context.
    pub fn start(self) -> Result<CloudRelayHandle, RecordError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpRelayTransport::new(&self.options)
                    .map_err(|e| RecordError::ConfigError(e.to_string()))?,
            ),
        };

        let shared = Arc::new(RelayShared {
            queue: ArrayQueue::new(self.options.queue_capacity.max(1)),
            notify: Notify::new(),
            total_messages: AtomicUsize::new(0),
            total_bytes: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        });

        let sink = Arc::new(RelaySink {
            sink_id: SinkId::next(),
            supported_encodings: if self.supported_encodings.is_empty() {
                None
            } else {
                Some(self.supported_encodings)
            },
            channel_filter: self.channel_filter,
            shared: shared.clone(),
            drop_throttler: Throttler::new(DROP_WARN_INTERVAL),
        });

        let recording_id = Uuid::new_v4().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = RelayWorker {
            shared: shared.clone(),
            transport,
            options: self.options,
            recording_id: recording_id.clone(),
            start_time: chrono::Utc::now().to_rfc3339(),
        };

        let handle = get_runtime_handle();
        let join = handle.spawn(worker.run(shutdown_rx));

        self.context.add_sink(sink.clone());
        info!("cloud relay started, recording id {}", recording_id);

        Ok(CloudRelayHandle {
            sink,
            context: Arc::downgrade(&self.context),
            recording_id,
            shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to a running relay sink.
#[must_use]
pub struct CloudRelayHandle {
    sink: Arc<RelaySink>,
    context: Weak<Context>,
    recording_id: String,
    shutdown_tx: watch::Sender<bool>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl CloudRelayHandle {
    /// The relay's recording identifier, attached to every uploaded batch.
    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    /// The id of the underlying sink, usable with `Channel::log_to_sink`.
    pub fn sink_id(&self) -> SinkId {
        self.sink.id()
    }

    /// Accepted message and byte counters since start.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.sink.shared.total_messages.load(Ordering::Relaxed),
            self.sink.shared.total_bytes.load(Ordering::Relaxed),
        )
    }

    /// Detaches the sink and signals the worker to drain and upload the
    /// session metadata. Non-blocking; wait on the returned handle for the
    /// drain to complete.
    pub fn stop(mut self) -> ShutdownHandle {
        self.shutdown();
        ShutdownHandle::new(self.join.take())
    }

    /// Stops the relay and blocks until the worker has drained.
    ///
    /// Must not be called from a runtime thread; use
    /// `stop().wait().await` there instead.
    pub fn close(self) {
        self.stop().wait_blocking();
    }

    fn shutdown(&mut self) {
        if let Some(ctx) = self.context.upgrade() {
            ctx.remove_sink(self.sink.id());
        }
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for CloudRelayHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RelayWorker {
    shared: Arc<RelayShared>,
    transport: Arc<dyn RelayTransport>,
    options: RelayOptions,
    recording_id: String,
    start_time: String,
}

impl RelayWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.transport.initialize().await {
            warn!("relay initialization failed: {}; uploads will be retried", e);
        }

        let encoder = BatchEncoder::new(
            self.options.compression_type,
            self.options.compression_level,
        );
        let max_batch_duration = Duration::from_secs(self.options.max_batch_seconds.max(1));

        let mut pending: HashMap<Arc<str>, Vec<(u64, Bytes)>> = HashMap::new();
        let mut pending_bytes = 0usize;
        let mut per_topic_counts: HashMap<String, u64> = HashMap::new();
        let mut last_flush = tokio::time::Instant::now();

        loop {
            let stopping = tokio::select! {
                _ = self.shared.notify.notified() => false,
                _ = tokio::time::sleep(WORKER_TICK) => false,
                _ = shutdown.changed() => true,
            };

            while let Some(msg) = self.shared.queue.pop() {
                pending_bytes += msg.payload.len();
                *per_topic_counts.entry(msg.topic.to_string()).or_default() += 1;
                pending
                    .entry(msg.topic)
                    .or_default()
                    .push((msg.log_time, msg.payload));
            }

            let time_due = last_flush.elapsed() >= max_batch_duration && !pending.is_empty();
            if pending_bytes >= self.options.max_batch_bytes || time_due || stopping {
                self.flush(&encoder, &mut pending).await;
                pending_bytes = 0;
                last_flush = tokio::time::Instant::now();
            }

            if stopping {
                break;
            }
        }

        self.upload_session_metadata(per_topic_counts).await;
        debug!("relay worker drained");
    }

    async fn flush(&self, encoder: &BatchEncoder, pending: &mut HashMap<Arc<str>, Vec<(u64, Bytes)>>) {
        for (topic, messages) in pending.drain() {
            if messages.is_empty() {
                continue;
            }
            let batch = match encoder.encode(&topic, &self.recording_id, &messages) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("failed to encode batch for '{}': {}", topic, e);
                    continue;
                }
            };

            let timestamp_us = messages.first().map(|(t, _)| t / 1000).unwrap_or(0);
            let labels = HashMap::from([
                ("topic".to_string(), topic.to_string()),
                ("recording_id".to_string(), self.recording_id.clone()),
                ("count".to_string(), messages.len().to_string()),
                (
                    "compression".to_string(),
                    format!("{:?}", self.options.compression_type).to_lowercase(),
                ),
            ]);

            let entry = format!(
                "{}/{}",
                self.options.stream,
                topic_to_entry_name(&topic)
            );
            if let Err(e) = self
                .transport
                .upload_with_retry(
                    &entry,
                    timestamp_us,
                    batch,
                    labels,
                    self.options.max_retries,
                )
                .await
            {
                error!("dropping batch for '{}' after retries: {}", topic, e);
            }
        }
    }

    async fn upload_session_metadata(&self, per_topic_counts: HashMap<String, u64>) {
        let metadata = RelaySessionMetadata {
            recording_id: self.recording_id.clone(),
            stream: self.options.stream.clone(),
            start_time: self.start_time.clone(),
            end_time: chrono::Utc::now().to_rfc3339(),
            compression_type: format!("{:?}", self.options.compression_type).to_lowercase(),
            total_messages: self.shared.total_messages.load(Ordering::Relaxed) as u64,
            total_bytes: self.shared.total_bytes.load(Ordering::Relaxed) as u64,
            per_topic_counts,
        };

        let body = match serde_json::to_vec(&metadata) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode session metadata: {}", e);
                return;
            }
        };

        let entry = format!("{}_metadata", self.options.stream);
        let labels = HashMap::from([(
            "recording_id".to_string(),
            self.recording_id.clone(),
        )]);
        let timestamp_us = crate::clock::nanoseconds_since_epoch() / 1000;
        if let Err(e) = self
            .transport
            .upload_with_retry(&entry, timestamp_us, body, labels, self.options.max_retries)
            .await
        {
            error!("failed to upload session metadata: {}", e);
        }
    }
}

/// Converts a topic into an upload entry name.
pub fn topic_to_entry_name(topic: &str) -> String {
    topic
        .trim_start_matches('/')
        .replace('/', "_")
        .replace("**", "all")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_to_entry_name() {
        assert_eq!(topic_to_entry_name("/camera/front"), "camera_front");
        assert_eq!(topic_to_entry_name("imu"), "imu");
        assert_eq!(topic_to_entry_name("/scan/**"), "scan_all");
    }

    #[test]
    fn test_batch_encoder_empty() {
        let encoder = BatchEncoder::new(CompressionType::None, CompressionLevel::Default);
        let batch = encoder.encode("/imu", "rec-1", &[]).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batch_encoder_header_and_records() {
        let encoder = BatchEncoder::new(CompressionType::None, CompressionLevel::Default);
        let messages = vec![
            (100u64, Bytes::from_static(b"alpha")),
            (200u64, Bytes::from_static(b"beta")),
        ];
        let batch = encoder.encode("/imu", "rec-1", &messages).unwrap();

        let header_end = batch.iter().position(|&b| b == b'\n').unwrap();
        let header = std::str::from_utf8(&batch[..header_end]).unwrap();
        assert!(header.contains("ROBOLOG_BATCH"));
        assert!(header.contains("topic=/imu"));
        assert!(header.contains("recording_id=rec-1"));
        assert!(header.contains("count=2"));

        // First record: length, log time, payload.
        let record = &batch[header_end + 1..];
        let len = u32::from_le_bytes(record[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, 5);
        let log_time = u64::from_le_bytes(record[4..12].try_into().unwrap());
        assert_eq!(log_time, 100);
        assert_eq!(&record[12..12 + len], b"alpha");
    }

    #[test]
    fn test_batch_encoder_zstd_round_trip() {
        let encoder = BatchEncoder::new(CompressionType::Zstd, CompressionLevel::Fast);
        let messages = vec![(1u64, Bytes::from(vec![7u8; 4096]))];
        let batch = encoder.encode("/x", "rec", &messages).unwrap();
        assert!(batch.len() < 4096);

        let restored = zstd::decode_all(&batch[..]).unwrap();
        assert!(restored.starts_with(b"ROBOLOG_BATCH|topic=/x"));
    }
}
