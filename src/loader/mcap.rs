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

// Bundled data loader for MCAP files
//
// Indexes every message up front into a time-sorted table plus per-channel
// index vectors, which makes windowed iteration and backfill queries binary
// searches instead of scans.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::errors::RecordError;
use crate::loader::{
    read_all, BackfillArgs, DataLoader, DataLoaderArgs, FsLoaderHost, Initialization,
    LoadedMessage, LoaderChannelId, LoaderHost, MessageIterator, MessageIteratorArgs, Problem,
};
use crate::schema::Schema;

#[derive(Debug)]
struct LoadedData {
    /// All messages, stably sorted by log time.
    messages: Vec<LoadedMessage>,
    /// Indices into `messages` per channel, ascending by log time.
    by_channel: HashMap<LoaderChannelId, Vec<usize>>,
}

/// Data loader for one or more MCAP files.
///
/// Channels from different files that agree on (topic, encoding, schema) are
/// merged under one loader channel id; everything else stays distinct.
pub struct McapLoader {
    paths: Vec<String>,
    host: Arc<dyn LoaderHost>,
    data: Option<Arc<LoadedData>>,
}

impl McapLoader {
    /// Creates a loader reading through the local filesystem.
    pub fn new(args: DataLoaderArgs) -> Self {
        Self::with_host(args, Arc::new(FsLoaderHost))
    }

    /// Creates a loader reading through a custom host.
    pub fn with_host(args: DataLoaderArgs, host: Arc<dyn LoaderHost>) -> Self {
        Self {
            paths: args.paths,
            host,
            data: None,
        }
    }
}

impl DataLoader for McapLoader {
    type MessageIterator = McapMessageIterator;

    fn initialize(&mut self) -> Result<Initialization, RecordError> {
        let mut builder = Initialization::builder();
        let mut messages: Vec<LoadedMessage> = Vec::new();

        // Dedup tables across files.
        let mut schema_ids: HashMap<(String, String, Vec<u8>), u16> = HashMap::new();
        let mut channel_ids: HashMap<(String, String, Option<u16>), LoaderChannelId> =
            HashMap::new();
        let mut counted_messages = 0u64;

        for path in &self.paths {
            let mut reader = self.host.open(path)?;
            let contents = read_all(reader.as_mut())?;
            self.host
                .console_log(&format!("indexing '{}' ({} bytes)", path, contents.len()));

            let stream = mcap::MessageStream::new(&contents)?;
            let mut file_messages = 0u64;
            for message in stream {
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        // Keep what was readable and report the rest.
                        self.host
                            .console_warn(&format!("stopping early in '{}': {}", path, err));
                        builder.add_problem(
                            Problem::warn(format!("'{}' is partially readable: {}", path, err))
                                .tip("the file may be truncated; messages before the damage were loaded"),
                        );
                        break;
                    }
                };

                let schema_id = match message.channel.schema.as_ref() {
                    Some(schema) => {
                        let key = (
                            schema.name.clone(),
                            schema.encoding.clone(),
                            schema.data.to_vec(),
                        );
                        let id = match schema_ids.get(&key) {
                            Some(id) => *id,
                            None => {
                                let id = builder.add_schema(Schema::new(
                                    schema.name.clone(),
                                    schema.encoding.clone(),
                                    schema.data.to_vec(),
                                ));
                                schema_ids.insert(key, id);
                                id
                            }
                        };
                        Some(id)
                    }
                    None => None,
                };

                let channel_key = (
                    message.channel.topic.clone(),
                    message.channel.message_encoding.clone(),
                    schema_id,
                );
                let channel_id = match channel_ids.get(&channel_key) {
                    Some(id) => *id,
                    None => {
                        let id = builder.add_channel(
                            message.channel.topic.clone(),
                            message.channel.message_encoding.clone(),
                            schema_id,
                        );
                        channel_ids.insert(channel_key, id);
                        id
                    }
                };

                messages.push(LoadedMessage {
                    channel_id,
                    log_time: message.log_time,
                    publish_time: message.publish_time,
                    data: message.data.into_owned(),
                });
                file_messages += 1;
            }
            counted_messages += file_messages;

            // Cross-check against the summary statistics when present.
            match mcap::Summary::read(&contents) {
                Ok(Some(summary)) => {
                    if let Some(stats) = summary.stats {
                        if stats.message_count != file_messages {
                            builder.add_problem(Problem::warn(format!(
                                "'{}' statistics claim {} messages but {} were read",
                                path, stats.message_count, file_messages
                            )));
                        }
                    } else {
                        builder.add_problem(Problem::info(format!(
                            "'{}' has no statistics record",
                            path
                        )));
                    }
                }
                Ok(None) => {
                    builder.add_problem(
                        Problem::info(format!("'{}' has no summary section", path))
                            .tip("re-record with indexes enabled for faster seeking"),
                    );
                }
                Err(err) => {
                    builder.add_problem(Problem::warn(format!(
                        "'{}' summary is unreadable: {}",
                        path, err
                    )));
                }
            }
        }

        messages.sort_by_key(|m| m.log_time);

        let mut by_channel: HashMap<LoaderChannelId, Vec<usize>> = HashMap::new();
        for (index, message) in messages.iter().enumerate() {
            by_channel.entry(message.channel_id).or_default().push(index);
        }
        for (channel_id, indices) in &by_channel {
            builder.set_message_count(*channel_id, indices.len() as u64);
        }

        if let (Some(first), Some(last)) = (messages.first(), messages.last()) {
            builder.time_range(first.log_time, last.log_time);
        }

        debug!(
            "indexed {} messages across {} files",
            counted_messages,
            self.paths.len()
        );

        self.data = Some(Arc::new(LoadedData {
            messages,
            by_channel,
        }));
        Ok(builder.build())
    }

    fn create_iter(
        &mut self,
        args: MessageIteratorArgs,
    ) -> Result<Self::MessageIterator, RecordError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| RecordError::ValueError("loader is not initialized".to_string()))?;

        // First index at or after the window start; messages are sorted.
        let position = match args.start_time {
            Some(start) => data.messages.partition_point(|m| m.log_time < start),
            None => 0,
        };

        Ok(McapMessageIterator {
            data,
            position,
            end_time: args.end_time,
            channel_ids: if args.channel_ids.is_empty() {
                None
            } else {
                Some(args.channel_ids.into_iter().collect())
            },
        })
    }

    fn get_backfill(&mut self, args: BackfillArgs) -> Result<Vec<LoadedMessage>, RecordError> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| RecordError::ValueError("loader is not initialized".to_string()))?;

        let channel_ids: Vec<LoaderChannelId> = if args.channel_ids.is_empty() {
            let mut all: Vec<_> = data.by_channel.keys().copied().collect();
            all.sort_unstable();
            all
        } else {
            args.channel_ids
        };

        let mut result = Vec::new();
        for channel_id in channel_ids {
            let Some(indices) = data.by_channel.get(&channel_id) else {
                continue;
            };
            // Latest message with log_time <= args.time, if any.
            let upper =
                indices.partition_point(|&index| data.messages[index].log_time <= args.time);
            if upper > 0 {
                result.push(data.messages[indices[upper - 1]].clone());
            }
        }
        Ok(result)
    }
}

/// Iterator over a loaded, filtered message window.
#[derive(Debug)]
pub struct McapMessageIterator {
    data: Arc<LoadedData>,
    position: usize,
    end_time: Option<u64>,
    channel_ids: Option<HashSet<LoaderChannelId>>,
}

impl MessageIterator for McapMessageIterator {
    fn next(&mut self) -> Option<Result<LoadedMessage, RecordError>> {
        while self.position < self.data.messages.len() {
            let message = &self.data.messages[self.position];
            if let Some(end) = self.end_time {
                if message.log_time > end {
                    return None;
                }
            }
            self.position += 1;
            if let Some(wanted) = &self.channel_ids {
                if !wanted.contains(&message.channel_id) {
                    continue;
                }
            }
            return Some(Ok(message.clone()));
        }
        None
    }
}
