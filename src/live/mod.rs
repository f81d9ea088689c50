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

// Live visualization server sink
//
// Streams subscribed channels to connected TCP clients over a framed
// protocol. Clients subscribe per channel; the sink keeps a bounded outbound
// queue per client and drops frames (with a throttled warning) when a client
// cannot keep up. The logging threads never block on the network.

mod protocol;
mod server;

pub use protocol::{
    Capability, ChannelAdvertisement, ClientChannel, ClientMessage, Parameter, ServerMessage,
};
pub use server::{ClientId, LiveServer, LiveServerHandle};

pub use crate::runtime::ShutdownHandle;

use std::sync::Arc;

use crate::channel::Channel;

/// Hook points for live server events.
///
/// One method per event, all defaulting to no-ops. Methods are invoked from
/// client poll tasks after the registry's internal locks have been released;
/// handlers that need to block or run long (parameter reads, writes) are
/// invoked on a dedicated blocking task and answered asynchronously, so they
/// can be slow without stalling other clients.
pub trait ServerListener: Send + Sync {
    /// A client subscribed to a channel it was not subscribed to before.
    fn on_subscribe(&self, _client: ClientId, _channel: &Arc<Channel>) {}

    /// A client unsubscribed from a channel or disconnected while subscribed.
    fn on_unsubscribe(&self, _client: ClientId, _channel: &Arc<Channel>) {}

    /// A client advertised a channel for publishing to the server.
    fn on_client_advertise(&self, _client: ClientId, _channel: &ClientChannel) {}

    /// A client withdrew a previously advertised channel.
    fn on_client_unadvertise(&self, _client: ClientId, _channel: &ClientChannel) {}

    /// A client published a message on one of its advertised channels.
    fn on_message_data(&self, _client: ClientId, _channel: &ClientChannel, _payload: &[u8]) {}

    /// A client requested parameter values. Returns the current values for
    /// the requested names (unknown names may be omitted).
    fn on_get_parameters(&self, _client: ClientId, _names: &[String]) -> Vec<Parameter> {
        Vec::new()
    }

    /// A client set parameter values. Returns the values as applied, which
    /// are echoed back to the requesting client.
    fn on_set_parameters(&self, _client: ClientId, parameters: Vec<Parameter>) -> Vec<Parameter> {
        parameters
    }

    /// A client subscribed to updates for the named parameters.
    fn on_parameters_subscribe(&self, _names: &[String]) {}

    /// A client unsubscribed from updates for the named parameters.
    fn on_parameters_unsubscribe(&self, _names: &[String]) {}

    /// The first client subscribed to connection graph updates.
    fn on_connection_graph_subscribe(&self) {}

    /// The last client unsubscribed from connection graph updates.
    fn on_connection_graph_unsubscribe(&self) {}
}
