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

use crate::errors::RecordError;

/// An immutable description of a message type.
///
/// The schema is attached to a channel at creation time and never changes
/// afterwards. `data` is copied on construction, so callers may reuse or
/// mutate their source buffer immediately after creating a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Identifies the type that this schema describes, e.g. `sensor_msgs/Image`.
    pub name: String,
    /// The encoding of `data`, e.g. `jsonschema` or `protobuf`.
    pub encoding: String,
    /// The serialized schema definition.
    pub data: Vec<u8>,
}

impl Schema {
    /// Create a schema, copying the definition bytes.
    pub fn new(
        name: impl Into<String>,
        encoding: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            encoding: encoding.into(),
            data: data.into(),
        }
    }

    /// A schemaless marker: empty name, encoding and data.
    pub fn schemaless() -> Self {
        Self::new("", "", Vec::new())
    }

    /// The encoding may be empty only for a schemaless (empty-data) schema.
    pub(crate) fn validate(&self) -> Result<(), RecordError> {
        if self.encoding.is_empty() && !self.data.is_empty() {
            return Err(RecordError::ValueError(
                "schema encoding must not be empty when schema data is present".to_string(),
            ));
        }
        Ok(())
    }
}
