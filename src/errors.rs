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

// Error types for the logging SDK

use thiserror::Error;

/// Errors surfaced by the SDK.
///
/// This is a closed enumeration: callers are expected to branch on the
/// variant rather than downcast. Validation and I/O failures are returned
/// from the operation that introduced them; logging itself never returns
/// errors to the caller (sink failures are reported through `tracing`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// A string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    Utf8Error(String),

    /// An I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// A base64-encoded payload could not be decoded.
    #[error("base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// A caller-supplied buffer was too small. Retrying with a buffer of at
    /// least `needed` bytes and otherwise identical inputs will succeed.
    #[error("buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// A channel or loader-channel id was already registered.
    #[error("channel '{0}' is already registered")]
    DuplicateChannel(String),

    /// A value or argument is invalid.
    #[error("value or argument is invalid: {0}")]
    ValueError(String),

    /// The sink has been closed and can no longer accept writes.
    #[error("sink closed")]
    SinkClosed,

    /// Failed to bind the live server's listen address.
    #[error("failed to bind address: {0}")]
    Bind(#[source] std::io::Error),

    /// An error from the MCAP container layer.
    #[error("MCAP error: {0}")]
    McapError(#[from] mcap::McapError),

    /// An error in a configuration file.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<std::str::Utf8Error> for RecordError {
    fn from(err: std::str::Utf8Error) -> Self {
        RecordError::Utf8Error(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for RecordError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        RecordError::Utf8Error(err.to_string())
    }
}
