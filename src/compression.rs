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

use serde::{Deserialize, Serialize};

/// Compression algorithm, shared by the MCAP file sink and the cloud relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Lz4,
    #[default]
    Zstd,
}

impl CompressionType {
    pub(crate) fn to_mcap(self) -> Option<mcap::Compression> {
        match self {
            CompressionType::None => None,
            CompressionType::Lz4 => Some(mcap::Compression::Lz4),
            CompressionType::Zstd => Some(mcap::Compression::Zstd),
        }
    }
}

/// Compression level (0-4)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    Fastest = 0,
    Fast = 1,
    #[default]
    Default = 2,
    Slow = 3,
    Slowest = 4,
}

impl CompressionLevel {
    pub fn to_zstd_level(self) -> i32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 10,
            CompressionLevel::Slowest => 19,
        }
    }

    pub fn to_lz4_level(self) -> u32 {
        match self {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Fast => 3,
            CompressionLevel::Default => 5,
            CompressionLevel::Slow => 9,
            CompressionLevel::Slowest => 12,
        }
    }

    /// Parse a numeric level from configuration (0-4).
    pub fn from_config_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(CompressionLevel::Fastest),
            1 => Some(CompressionLevel::Fast),
            2 => Some(CompressionLevel::Default),
            3 => Some(CompressionLevel::Slow),
            4 => Some(CompressionLevel::Slowest),
            _ => None,
        }
    }
}
