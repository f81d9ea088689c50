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

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::error;

use crate::channel::Channel;

/// Per-sink predicate deciding whether a channel is delivered to that sink.
///
/// The predicate is evaluated once per (sink, channel) pair when the pair is
/// first seen, and the decision is memoized in the subscription table. The
/// channel's topic, encoding, schema and metadata are immutable, so the
/// decision never goes stale.
pub trait ChannelFilter: Send + Sync {
    /// Returns true if the sink should receive messages from this channel.
    fn should_subscribe(&self, channel: &Channel) -> bool;
}

/// Adapter so plain closures can be used as filters.
pub(crate) struct ChannelFilterFn<F>(pub F)
where
    F: Fn(&Channel) -> bool + Send + Sync;

impl<F> ChannelFilter for ChannelFilterFn<F>
where
    F: Fn(&Channel) -> bool + Send + Sync,
{
    fn should_subscribe(&self, channel: &Channel) -> bool {
        self.0(channel)
    }
}

/// Evaluate a filter, treating a panic in user code as "reject".
///
/// A failing predicate must never take down the registry or the sink, so the
/// channel is simply not subscribed and a diagnostic is emitted.
pub(crate) fn evaluate(filter: &dyn ChannelFilter, channel: &Channel) -> bool {
    match catch_unwind(AssertUnwindSafe(|| filter.should_subscribe(channel))) {
        Ok(accept) => accept,
        Err(_) => {
            error!(
                "channel filter panicked evaluating topic '{}'; channel rejected",
                channel.topic()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelBuilder;
    use crate::context::Context;

    #[test]
    fn test_filter_fn_adapter() {
        let ctx = Context::new();
        let channel = ChannelBuilder::new("/imu")
            .message_encoding("cdr")
            .context(&ctx)
            .build()
            .unwrap();

        let filter = ChannelFilterFn(|c: &Channel| c.topic().starts_with("/imu"));
        assert!(evaluate(&filter, &channel));

        let filter = ChannelFilterFn(|c: &Channel| c.topic().starts_with("/camera"));
        assert!(!evaluate(&filter, &channel));
    }

    #[test]
    fn test_panicking_filter_rejects() {
        let ctx = Context::new();
        let channel = ChannelBuilder::new("/imu")
            .message_encoding("cdr")
            .context(&ctx)
            .build()
            .unwrap();

        let filter = ChannelFilterFn(|_: &Channel| panic!("bad predicate"));
        assert!(!evaluate(&filter, &channel));
    }
}
