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

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::clock::Throttler;
use crate::context::Context;
use crate::errors::RecordError;
use crate::filter::{ChannelFilter, ChannelFilterFn};
use crate::live::protocol::{
    self, Capability, ChannelAdvertisement, ClientChannel, ClientMessage, ServerMessage,
    FRAME_CONTROL, FRAME_DATA,
};
use crate::live::ServerListener;
use crate::runtime::{get_runtime_handle, ShutdownHandle};
use crate::sink::{Sink, SinkId};

/// Upper bound on a single inbound frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Interval for throttled queue-overflow warnings, per client.
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Identifies one connected live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued outbound frame.
#[derive(Clone)]
enum Frame {
    Control(Arc<String>),
    Data(Bytes),
}

struct ClientHandle {
    id: ClientId,
    sender: mpsc::Sender<Frame>,
    /// Channel ids (as advertised) this client subscribed to.
    subscriptions: Mutex<HashSet<u64>>,
    /// Channels this client advertised for publishing.
    client_channels: Mutex<HashMap<u64, ClientChannel>>,
    graph_subscribed: AtomicBool,
    drop_throttler: Throttler,
}

impl ClientHandle {
    fn is_subscribed(&self, channel_id: u64) -> bool {
        self.lock_subscriptions().contains(&channel_id)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_client_channels(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ClientChannel>> {
        self.client_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a frame, dropping it if this client is falling behind.
    fn push(&self, frame: Frame, what: &str) {
        match self.sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.drop_throttler.try_acquire() {
                    warn!(
                        "live client {} is falling behind; dropping {} frames",
                        self.id, what
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct ServerState {
    name: String,
    session_id: String,
    capabilities: Vec<Capability>,
    supported_encodings: Vec<String>,
    listener: Option<Arc<dyn ServerListener>>,
    clients: DashMap<u64, Arc<ClientHandle>>,
    /// Channels the sink is subscribed to, advertised to every client.
    advertised: DashMap<u64, Arc<Channel>>,
    next_client_id: AtomicU64,
    queue_size: usize,
    graph_subscribers: AtomicUsize,
}

impl ServerState {
    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn broadcast(&self, msg: &ServerMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => Arc::new(json),
            Err(err) => {
                warn!("failed to encode control frame: {}", err);
                return;
            }
        };
        for client in self.clients.iter() {
            client.push(Frame::Control(json.clone()), "control");
        }
    }
}

/// The context-facing sink for a running live server.
pub(crate) struct LiveSink {
    sink_id: SinkId,
    supported_encodings: Option<Vec<String>>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
    state: Arc<ServerState>,
}

impl Sink for LiveSink {
    fn id(&self) -> SinkId {
        self.sink_id
    }

    fn write(
        &self,
        channel: &Channel,
        payload: &[u8],
        log_time: u64,
    ) -> Result<(), RecordError> {
        let channel_id: u64 = channel.id().into();
        let mut frame: Option<Bytes> = None;
        for client in self.state.clients.iter() {
            if !client.is_subscribed(channel_id) {
                continue;
            }
            let bytes = frame
                .get_or_insert_with(|| {
                    Bytes::from(protocol::encode_data_frame(channel_id, log_time, payload))
                })
                .clone();
            client.push(Frame::Data(bytes), "data");
        }
        Ok(())
    }

    fn supported_encodings(&self) -> Option<&[String]> {
        self.supported_encodings.as_deref()
    }

    fn channel_filter(&self) -> Option<&dyn ChannelFilter> {
        self.channel_filter.as_deref()
    }

    fn on_subscribe(&self, channel: &Arc<Channel>) {
        self.state
            .advertised
            .insert(channel.id().into(), channel.clone());
        self.state.broadcast(&ServerMessage::Advertise {
            channels: vec![ChannelAdvertisement::from(channel.as_ref())],
        });
    }

    fn on_unsubscribe(&self, channel: &Channel) {
        let channel_id: u64 = channel.id().into();
        self.state.advertised.remove(&channel_id);
        for client in self.state.clients.iter() {
            client.lock_subscriptions().remove(&channel_id);
        }
        self.state.broadcast(&ServerMessage::Unadvertise {
            channel_ids: vec![channel_id],
        });
    }
}

/// Builder for a live visualization server.
///
/// # Examples
///
/// ```ignore
/// let server = LiveServer::new()
///     .name("robot-7")
///     .bind("0.0.0.0", 8765)
///     .capabilities([Capability::ClientPublish, Capability::Parameters])
///     .start()?;
/// ```
#[must_use]
pub struct LiveServer {
    name: String,
    host: String,
    port: u16,
    capabilities: Vec<Capability>,
    supported_encodings: Vec<String>,
    listener: Option<Arc<dyn ServerListener>>,
    channel_filter: Option<Arc<dyn ChannelFilter>>,
    context: Arc<Context>,
    message_queue_size: usize,
}

impl Default for LiveServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveServer {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8765,
            capabilities: Vec::new(),
            supported_encodings: Vec::new(),
            listener: None,
            channel_filter: None,
            context: Context::get_default(),
            message_queue_size: 1024,
        }
    }

    /// Human-readable server name advertised to clients.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Listen address. Port 0 picks an ephemeral port; see
    /// [`LiveServerHandle::local_addr`].
    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Optional features to advertise.
    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Encodings this server accepts; empty accepts everything.
    pub fn supported_encodings(
        mut self,
        encodings: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.supported_encodings = encodings.into_iter().map(Into::into).collect();
        self
    }

    /// Event listener for client activity.
    pub fn listener(mut self, listener: Arc<dyn ServerListener>) -> Self {
        self.listener = Some(listener);
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

    /// Binds the sink to a context. Defaults to the process default context.
    pub fn context(mut self, ctx: &Arc<Context>) -> Self {
        self.context = ctx.clone();
        self
    }

    /// Bounded per-client outbound queue length.
    pub fn message_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size.max(1);
        self
    }

    /// Binds the listen socket, spawns the accept loop and attaches the sink
    /// to the context. Bind failures are returned synchronously.
    pub fn start(self) -> Result<LiveServerHandle, RecordError> {
        let std_listener = std::net::TcpListener::bind((self.host.as_str(), self.port))
            .map_err(RecordError::Bind)?;
        std_listener.set_nonblocking(true).map_err(RecordError::Bind)?;
        let local_addr = std_listener.local_addr()?;

        let state = Arc::new(ServerState {
            name: self.name,
            session_id: Uuid::new_v4().to_string(),
            capabilities: self.capabilities,
            supported_encodings: self.supported_encodings,
            listener: self.listener,
            clients: DashMap::new(),
            advertised: DashMap::new(),
            next_client_id: AtomicU64::new(1),
            queue_size: self.message_queue_size,
            graph_subscribers: AtomicUsize::new(0),
        });

        let encodings = if state.supported_encodings.is_empty() {
            None
        } else {
            Some(state.supported_encodings.clone())
        };
        let sink = Arc::new(LiveSink {
            sink_id: SinkId::next(),
            supported_encodings: encodings,
            channel_filter: self.channel_filter,
            state: state.clone(),
        });

        let handle = get_runtime_handle();
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = handle.spawn(run_server(state.clone(), listener, shutdown_rx));

        self.context.add_sink(sink.clone());
        info!("live server listening on {}", local_addr);

        Ok(LiveServerHandle {
            sink,
            context: Arc::downgrade(&self.context),
            local_addr,
            shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to a running live server.
#[must_use]
pub struct LiveServerHandle {
    sink: Arc<LiveSink>,
    context: Weak<Context>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl LiveServerHandle {
    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The id of the underlying sink, usable with `Channel::log_to_sink`.
    pub fn sink_id(&self) -> SinkId {
        self.sink.id()
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.sink.state.clients.len()
    }

    /// Detaches the sink and signals shutdown.
    ///
    /// Non-blocking, so it is safe to call from a [`ServerListener`]
    /// callback; the returned handle can be awaited for the drain.
    pub fn stop(mut self) -> ShutdownHandle {
        self.shutdown();
        ShutdownHandle::new(self.join.take())
    }

    fn shutdown(&mut self) {
        if let Some(ctx) = self.context.upgrade() {
            ctx.remove_sink(self.sink.id());
        }
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for LiveServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_server(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(handle_client(state, stream, addr, shutdown));
                }
                Err(err) => {
                    warn!("live server accept error: {}", err);
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    while tasks.join_next().await.is_some() {}
    state.clients.clear();
    debug!("live server drained");
}

async fn handle_client(
    state: Arc<ServerState>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = ClientId(state.next_client_id.fetch_add(1, Ordering::Relaxed));
    let (sender, mut receiver) = mpsc::channel::<Frame>(state.queue_size);
    let client = Arc::new(ClientHandle {
        id,
        sender,
        subscriptions: Mutex::new(HashSet::new()),
        client_channels: Mutex::new(HashMap::new()),
        graph_subscribed: AtomicBool::new(false),
        drop_throttler: Throttler::new(DROP_WARN_INTERVAL),
    });
    state.clients.insert(id.0, client.clone());
    info!("live client {} connected from {}", id, addr);

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = receiver.recv().await {
            if write_frame(&mut write_half, frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    greet_client(&state, &client).await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut read_half) => match frame {
                Ok(Some(body)) => handle_frame(&state, &client, &body),
                Ok(None) => break,
                Err(err) => {
                    debug!("live client {} read error: {}", id, err);
                    break;
                }
            },
        }
    }

    disconnect_client(&state, &client);
    drop(client);
    let _ = writer.await;
    info!("live client {} disconnected", id);
}

/// Sends the server-info frame and the current channel advertisements.
async fn greet_client(state: &Arc<ServerState>, client: &Arc<ClientHandle>) {
    let info = ServerMessage::ServerInfo {
        name: state.name.clone(),
        session_id: state.session_id.clone(),
        capabilities: state.capabilities.clone(),
        supported_encodings: state.supported_encodings.clone(),
    };
    let channels: Vec<ChannelAdvertisement> = state
        .advertised
        .iter()
        .map(|entry| ChannelAdvertisement::from(entry.value().as_ref()))
        .collect();

    for msg in [info, ServerMessage::Advertise { channels }] {
        match serde_json::to_string(&msg) {
            Ok(json) => {
                if client.sender.send(Frame::Control(Arc::new(json))).await.is_err() {
                    return;
                }
            }
            Err(err) => warn!("failed to encode greeting frame: {}", err),
        }
    }
}

fn disconnect_client(state: &Arc<ServerState>, client: &Arc<ClientHandle>) {
    state.clients.remove(&client.id.0);

    // Fire unsubscribe callbacks for whatever was still subscribed.
    let subscriptions: Vec<u64> = client.lock_subscriptions().drain().collect();
    if let Some(listener) = &state.listener {
        for channel_id in subscriptions {
            if let Some(channel) = state.advertised.get(&channel_id) {
                listener.on_unsubscribe(client.id, channel.value());
            }
        }
        if client.graph_subscribed.swap(false, Ordering::Relaxed)
            && state.graph_subscribers.fetch_sub(1, Ordering::Relaxed) == 1
        {
            listener.on_connection_graph_unsubscribe();
        }
    }
}

fn handle_frame(state: &Arc<ServerState>, client: &Arc<ClientHandle>, body: &[u8]) {
    match body.first().copied() {
        Some(FRAME_CONTROL) => match serde_json::from_slice::<ClientMessage>(&body[1..]) {
            Ok(msg) => handle_control(state, client, msg),
            Err(err) => {
                warn!("live client {} sent malformed control frame: {}", client.id, err);
            }
        },
        Some(FRAME_DATA) => handle_client_data(state, client, body),
        _ => warn!("live client {} sent unknown frame kind", client.id),
    }
}

fn handle_control(state: &Arc<ServerState>, client: &Arc<ClientHandle>, msg: ClientMessage) {
    match msg {
        ClientMessage::Subscribe { channel_ids } => {
            for channel_id in channel_ids {
                let Some(channel) = state.advertised.get(&channel_id).map(|e| e.value().clone())
                else {
                    debug!(
                        "live client {} subscribed to unknown channel {}",
                        client.id, channel_id
                    );
                    continue;
                };
                if client.lock_subscriptions().insert(channel_id) {
                    if let Some(listener) = &state.listener {
                        listener.on_subscribe(client.id, &channel);
                    }
                }
            }
        }
        ClientMessage::Unsubscribe { channel_ids } => {
            for channel_id in channel_ids {
                if client.lock_subscriptions().remove(&channel_id) {
                    if let Some(listener) = &state.listener {
                        if let Some(channel) = state.advertised.get(&channel_id) {
                            listener.on_unsubscribe(client.id, channel.value());
                        }
                    }
                }
            }
        }
        ClientMessage::Advertise { channels } => {
            if !state.has_capability(Capability::ClientPublish) {
                warn!(
                    "live client {} advertised channels without ClientPublish capability",
                    client.id
                );
                return;
            }
            for channel in channels {
                client
                    .lock_client_channels()
                    .insert(channel.id, channel.clone());
                if let Some(listener) = &state.listener {
                    listener.on_client_advertise(client.id, &channel);
                }
            }
        }
        ClientMessage::Unadvertise { channel_ids } => {
            for channel_id in channel_ids {
                let removed = client.lock_client_channels().remove(&channel_id);
                if let (Some(channel), Some(listener)) = (removed, &state.listener) {
                    listener.on_client_unadvertise(client.id, &channel);
                }
            }
        }
        ClientMessage::GetParameters { request_id, names } => {
            if !state.has_capability(Capability::Parameters) {
                warn!(
                    "live client {} requested parameters without Parameters capability",
                    client.id
                );
                return;
            }
            let Some(listener) = state.listener.clone() else {
                return;
            };
            // Parameter handlers may be slow; answer from a blocking task so
            // the poll loop keeps serving other frames.
            let sender = client.sender.clone();
            let client_id = client.id;
            tokio::task::spawn_blocking(move || {
                let parameters = listener.on_get_parameters(client_id, &names);
                respond(&sender, ServerMessage::ParameterValues { request_id, parameters });
            });
        }
        ClientMessage::SetParameters {
            request_id,
            parameters,
        } => {
            if !state.has_capability(Capability::Parameters) {
                warn!(
                    "live client {} set parameters without Parameters capability",
                    client.id
                );
                return;
            }
            let Some(listener) = state.listener.clone() else {
                return;
            };
            let sender = client.sender.clone();
            let client_id = client.id;
            tokio::task::spawn_blocking(move || {
                let parameters = listener.on_set_parameters(client_id, parameters);
                respond(&sender, ServerMessage::ParameterValues { request_id, parameters });
            });
        }
        ClientMessage::SubscribeParameterUpdates { names } => {
            if let Some(listener) = &state.listener {
                listener.on_parameters_subscribe(&names);
            }
        }
        ClientMessage::UnsubscribeParameterUpdates { names } => {
            if let Some(listener) = &state.listener {
                listener.on_parameters_unsubscribe(&names);
            }
        }
        ClientMessage::SubscribeConnectionGraph => {
            if !state.has_capability(Capability::ConnectionGraph) {
                return;
            }
            if !client.graph_subscribed.swap(true, Ordering::Relaxed)
                && state.graph_subscribers.fetch_add(1, Ordering::Relaxed) == 0
            {
                if let Some(listener) = &state.listener {
                    listener.on_connection_graph_subscribe();
                }
            }
        }
        ClientMessage::UnsubscribeConnectionGraph => {
            if client.graph_subscribed.swap(false, Ordering::Relaxed)
                && state.graph_subscribers.fetch_sub(1, Ordering::Relaxed) == 1
            {
                if let Some(listener) = &state.listener {
                    listener.on_connection_graph_unsubscribe();
                }
            }
        }
    }
}

/// Client publish: a binary frame on one of the client's advertised channels.
fn handle_client_data(state: &Arc<ServerState>, client: &Arc<ClientHandle>, body: &[u8]) {
    if !state.has_capability(Capability::ClientPublish) {
        warn!(
            "live client {} published data without ClientPublish capability",
            client.id
        );
        return;
    }
    let (channel_id, _log_time, payload) = match protocol::decode_data_frame(body) {
        Ok(parts) => parts,
        Err(err) => {
            warn!("live client {} sent malformed data frame: {}", client.id, err);
            return;
        }
    };
    let channel = client.lock_client_channels().get(&channel_id).cloned();
    match channel {
        Some(channel) => {
            if let Some(listener) = &state.listener {
                listener.on_message_data(client.id, &channel, payload);
            }
        }
        None => debug!(
            "live client {} published on unadvertised channel {}",
            client.id, channel_id
        ),
    }
}

fn respond(sender: &mpsc::Sender<Frame>, msg: ServerMessage) {
    match serde_json::to_string(&msg) {
        Ok(json) => {
            let _ = sender.blocking_send(Frame::Control(Arc::new(json)));
        }
        Err(err) => warn!("failed to encode response frame: {}", err),
    }
}

async fn write_frame(stream: &mut OwnedWriteHalf, frame: Frame) -> std::io::Result<()> {
    match frame {
        Frame::Control(json) => {
            let len = 1 + json.len();
            stream.write_u32_le(len as u32).await?;
            stream.write_u8(FRAME_CONTROL).await?;
            stream.write_all(json.as_bytes()).await?;
        }
        Frame::Data(bytes) => {
            stream.write_u32_le(bytes.len() as u32).await?;
            stream.write_all(&bytes).await?;
        }
    }
    stream.flush().await
}

/// Reads one length-prefixed frame; `None` on clean EOF.
async fn read_frame(stream: &mut OwnedReadHalf) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}
