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

// Live protocol frames
//
// Each frame on the wire is a u32 little-endian length prefix followed by a
// one-byte kind tag: 0x00 for a JSON control frame, 0x01 for a binary data
// frame. Schema bytes travel base64-encoded inside advertisements.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::channel::Channel;
use crate::errors::RecordError;

/// Frame kind tag for JSON control frames.
pub(crate) const FRAME_CONTROL: u8 = 0x00;
/// Frame kind tag for binary message-data frames.
pub(crate) const FRAME_DATA: u8 = 0x01;

/// Size of the binary data frame header: kind + channel id + log time.
pub(crate) const DATA_HEADER_LEN: usize = 1 + 8 + 8;

/// Optional features a server advertises to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Clients may advertise channels and publish messages to the server.
    ClientPublish,
    /// Clients may get and set parameters and subscribe to updates.
    Parameters,
    /// Clients may call services.
    Services,
    /// Clients may subscribe to connection graph updates.
    ConnectionGraph,
}

/// A named parameter value exchanged with clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A channel advertised by a client for publishing to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientChannel {
    pub id: u64,
    pub topic: String,
    pub encoding: String,
    #[serde(default)]
    pub schema_name: String,
}

/// A server-side channel advertisement sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAdvertisement {
    pub id: u64,
    pub topic: String,
    pub encoding: String,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default)]
    pub schema_encoding: String,
    /// Base64-encoded schema definition, empty for schemaless channels.
    #[serde(default)]
    pub schema_data: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl From<&Channel> for ChannelAdvertisement {
    fn from(channel: &Channel) -> Self {
        let (schema_name, schema_encoding, schema_data) = match channel.schema() {
            Some(schema) => (
                schema.name.clone(),
                schema.encoding.clone(),
                BASE64.encode(&schema.data),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        Self {
            id: channel.id().into(),
            topic: channel.topic().to_string(),
            encoding: channel.message_encoding().to_string(),
            schema_name,
            schema_encoding,
            schema_data,
            metadata: channel.metadata().clone(),
        }
    }
}

impl ChannelAdvertisement {
    /// Decodes the base64 schema payload.
    pub fn decode_schema_data(&self) -> Result<Vec<u8>, RecordError> {
        Ok(BASE64.decode(&self.schema_data)?)
    }
}

/// Control frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        channel_ids: Vec<u64>,
    },
    Unsubscribe {
        channel_ids: Vec<u64>,
    },
    Advertise {
        channels: Vec<ClientChannel>,
    },
    Unadvertise {
        channel_ids: Vec<u64>,
    },
    GetParameters {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        names: Vec<String>,
    },
    SetParameters {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        parameters: Vec<Parameter>,
    },
    SubscribeParameterUpdates {
        names: Vec<String>,
    },
    UnsubscribeParameterUpdates {
        names: Vec<String>,
    },
    SubscribeConnectionGraph,
    UnsubscribeConnectionGraph,
}

/// Control frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    ServerInfo {
        name: String,
        session_id: String,
        capabilities: Vec<Capability>,
        supported_encodings: Vec<String>,
    },
    Advertise {
        channels: Vec<ChannelAdvertisement>,
    },
    Unadvertise {
        channel_ids: Vec<u64>,
    },
    ParameterValues {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        parameters: Vec<Parameter>,
    },
}

/// Encodes a binary data frame: kind tag, channel id, log time, payload.
pub(crate) fn encode_data_frame(channel_id: u64, log_time: u64, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
    frame.push(FRAME_DATA);
    frame.extend_from_slice(&channel_id.to_le_bytes());
    frame.extend_from_slice(&log_time.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decodes a binary data frame body (without the length prefix).
///
/// Returns [`RecordError::BufferTooShort`] if the frame is smaller than its
/// fixed header; retrying with the full frame succeeds.
pub(crate) fn decode_data_frame(frame: &[u8]) -> Result<(u64, u64, &[u8]), RecordError> {
    if frame.len() < DATA_HEADER_LEN {
        return Err(RecordError::BufferTooShort {
            needed: DATA_HEADER_LEN,
            available: frame.len(),
        });
    }
    let channel_id = u64::from_le_bytes(frame[1..9].try_into().expect("sliced to 8 bytes"));
    let log_time = u64::from_le_bytes(frame[9..17].try_into().expect("sliced to 8 bytes"));
    Ok((channel_id, log_time, &frame[DATA_HEADER_LEN..]))
}
