//! The connection to a node.
//!
//! A [`Connection`] keeps a single WebSocket to a node open for as long as
//! it runs. One supervisor task per connection cycles through:
//!
//! 1. **Connect**: locate the node, ask for its API version and open the
//!    socket, retrying with exponential backoff until the attempts run out.
//! 2. **Listen**: flush queued messages, then read frames and hand them to
//!    the [`Dispatcher`] until the socket closes or fails.
//! 3. **Disconnect**: forget the session, tell the [`NodeManager`], and
//!    either connect again or, after [`Connection::shutdown`], close the
//!    socket for good.
//!
//! Because the cycle runs in one task, there is never more than one connect
//! attempt in flight for a node.
//!
//! # States
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!                     ^  ^            |             |
//!                     |  +- backoff --+             v
//!                     +------------------- Reconnecting
//! ```
//!
//! Rejected credentials end in [`State::Failed`]. Shutdown passes through
//! [`State::ClosingManual`] and ends in [`State::Disconnected`].

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex as SyncMutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::ReconnectPolicy,
    config::ClientConfig,
    dispatch::{DispatchConfig, Dispatcher},
    error::Result,
    events::EventSink,
    http::NodeApi,
    manager::{NodeManager, PlayerManager},
    node::{self, Node},
    query::Classifier,
    region::{Region, RegionLocator},
    transport::{Frame, HandshakeError, HandshakeRequest, SocketReader, SocketWriter, Transport},
};

/// Where a connection is in its lifecycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reconnecting,
    ClosingManual,

    /// The node rejected the credentials. Nothing more is attempted.
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::ClosingManual => "closing",
            Self::Failed => "failed",
        };
        f.write_str(state)
    }
}

/// What a connection needs from the outside.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub api: Arc<dyn NodeApi>,
    pub manager: Arc<dyn NodeManager>,
    pub players: Arc<dyn PlayerManager>,
    pub sink: Arc<dyn EventSink>,
    pub locator: Arc<dyn RegionLocator>,
    pub classifier: Arc<Classifier>,
}

/// Why a connect attempt did not produce a socket.
enum Failure {
    Retry,
    Fatal,
    Cancelled,
}

/// Why the read loop ended.
struct Disconnect {
    code: u16,
    reason: String,
}

#[derive(Default)]
struct Outbound {
    writer: Option<Box<dyn SocketWriter>>,
    pending: VecDeque<String>,
}

pub struct Connection {
    node: Arc<Node>,
    user_id: u64,
    client_name: String,

    transport: Arc<dyn Transport>,
    api: Arc<dyn NodeApi>,
    manager: Arc<dyn NodeManager>,
    locator: Arc<dyn RegionLocator>,
    dispatcher: Dispatcher,

    state: watch::Sender<State>,
    policy: SyncMutex<ReconnectPolicy>,

    /// Holds the writer and the queue together, so that a flush completes
    /// before any other message is sent.
    outbound: Mutex<Outbound>,

    shutdown: CancellationToken,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Close code sent to the node on shutdown.
    pub const CLOSE_SHUTDOWN: u16 = 4014;
    const CLOSE_SHUTDOWN_REASON: &'static str = "Shutting down";

    /// Close code reported to the node manager on shutdown.
    pub const CLOSE_MANUAL: u16 = 202;
    const CLOSE_MANUAL_REASON: &'static str = "Manual websocket shutdown requested";

    /// Close code reported when the socket ended without a close frame.
    pub const CLOSE_ABNORMAL: u16 = 1006;

    /// Shortest interval between heartbeats.
    pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(node: Arc<Node>, client: &ClientConfig, services: Services) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&node),
            Arc::clone(&services.api),
            services.players,
            services.sink,
            services.classifier,
        );

        Self {
            node,
            user_id: client.user_id,
            client_name: client.client_name.clone(),
            transport: services.transport,
            api: services.api,
            manager: services.manager,
            locator: services.locator,
            dispatcher,
            state: watch::Sender::new(State::Disconnected),
            policy: SyncMutex::new(ReconnectPolicy::default()),
            outbound: Mutex::new(Outbound::default()),
            shutdown: CancellationToken::new(),
            supervisor: SyncMutex::new(None),
        }
    }

    #[must_use]
    pub fn with_policy(self, policy: ReconnectPolicy) -> Self {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        self
    }

    #[must_use]
    pub fn with_dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatcher = self.dispatcher.with_config(config);
        self
    }

    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Returns a receiver that sees every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.node.is_ready()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.node.session_id()
    }

    /// Waits until the node has sent `ready`.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` when the node is not ready within
    /// `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        self.node.wait_until_ready(timeout).await
    }

    /// Number of messages waiting for a socket.
    pub async fn pending(&self) -> usize {
        self.outbound.lock().await.pending.len()
    }

    fn set_state(&self, state: State) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {previous} -> {state}", self.node.identifier());
        }
    }

    /// Starts the supervisor task, unless it is running already.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("{}: already running", self.node.identifier());
            return;
        }

        if self.shutdown.is_cancelled() {
            debug!("{}: not starting after shutdown", self.node.identifier());
            return;
        }

        let this = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { this.run().await }));
    }

    /// Closes the connection and stops reconnecting.
    ///
    /// Waits for the supervisor task to close the socket.
    pub async fn shutdown(&self) {
        info!("{}: shutting down", self.node.identifier());
        self.shutdown.cancel();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match supervisor {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("{}: supervisor failed: {e}", self.node.identifier());
                }
            }
            None => self.dispatcher.cancel_probes(),
        }
    }

    /// Sends a message to the node.
    ///
    /// Messages are queued while there is no socket, or older messages are
    /// still queued, and sent in order once connected.
    ///
    /// # Errors
    ///
    /// Returns an error when `message` cannot be serialized.
    pub async fn send<T>(&self, message: &T) -> Result<()>
    where
        T: Serialize,
    {
        let text = serde_json::to_string(message)?;
        if self.shutdown.is_cancelled() {
            debug!(
                "{}: dropping message after shutdown: {text}",
                self.node.identifier()
            );
            return Ok(());
        }

        let mut outbound = self.outbound.lock().await;
        let outbound = &mut *outbound;

        if outbound.pending.is_empty() {
            if let Some(writer) = outbound.writer.as_mut() {
                trace!("{}: <- {text}", self.node.identifier());
                match writer.send_text(text.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(
                        "{}: queueing message after send failed: {e}",
                        self.node.identifier()
                    ),
                }
            }
        }

        outbound.pending.push_back(text);
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        while let Some(reader) = self.connect().await {
            let disconnect = self.listen(reader).await;
            if !self.disconnect(disconnect).await {
                break;
            }
        }
    }

    /// Connects with backoff. Returns `None` when no more attempts are made,
    /// with the final state set.
    async fn connect(&self) -> Option<Box<dyn SocketReader>> {
        self.node.set_ready(false);
        self.set_state(State::Connecting);
        self.resolve_region().await;

        let limit = self.node.config().reconnect_attempts;
        let mut attempt = 0;
        while limit.allows(attempt) {
            if self.shutdown.is_cancelled() {
                self.set_state(State::Disconnected);
                return None;
            }

            attempt += 1;
            info!(
                "{}: connecting ({attempt}/{limit})",
                self.node.identifier()
            );

            match self.attempt().await {
                Ok(reader) => return Some(reader),
                Err(Failure::Fatal) => {
                    self.set_state(State::Failed);
                    return None;
                }
                Err(Failure::Cancelled) => {
                    self.set_state(State::Disconnected);
                    return None;
                }
                Err(Failure::Retry) => {}
            }

            self.set_state(State::Connecting);
            let delay = self
                .policy
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .delay();
            debug!(
                "{}: retrying in {:.1}s",
                self.node.identifier(),
                delay.as_secs_f32()
            );

            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    self.set_state(State::Disconnected);
                    return None;
                }

                () = tokio::time::sleep(delay) => {}
            }
        }

        warn!(
            "{}: could not connect within {attempt} attempts",
            self.node.identifier()
        );
        self.set_state(State::Disconnected);
        None
    }

    async fn resolve_region(&self) {
        let region = if let Some(known) = self.node.known_region() {
            known.clone()
        } else {
            match self.locator.locate(&self.node.config().host).await {
                Ok(region) => region,
                Err(e) => {
                    warn!("{}: could not locate node: {e}", self.node.identifier());
                    Region::unknown()
                }
            }
        };

        debug!("{}: region {}", self.node.identifier(), region.name);
        self.node.set_region(region);
    }

    async fn attempt(&self) -> std::result::Result<Box<dyn SocketReader>, Failure> {
        let version = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Failure::Cancelled),
            version = self.api.version() => version,
        };

        let api = match version.and_then(|version| node::api_version(&version)) {
            Ok(api) => api,
            Err(e) => {
                error!(
                    "{}: node is not running a supported version: {e}",
                    self.node.identifier()
                );
                return Err(Failure::Retry);
            }
        };
        self.node.set_api_version(api);

        self.set_state(State::Authenticating);
        let config = self.node.config();
        let request = HandshakeRequest {
            url: self.node.websocket_url(api),
            password: config.password.clone(),
            user_id: self.user_id,
            client_name: self.client_name.clone(),
            timeout: config.timeout,
        };

        let connected = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Failure::Cancelled),
            connected = self.transport.connect(&request) => connected,
        };

        let (writer, reader) = match connected {
            Ok(socket) => socket,
            Err(e) if e.is_unauthorized() => {
                error!(
                    "{}: authentication failed, not reconnecting: {e}",
                    self.node.identifier()
                );
                return Err(Failure::Fatal);
            }
            Err(HandshakeError::Status(status)) => {
                warn!(
                    "{}: {} answered with status {status} instead of 101, check host and port",
                    self.node.identifier(),
                    request.url
                );
                return Err(Failure::Retry);
            }
            Err(HandshakeError::Connector(e)) => {
                warn!(
                    "{}: could not reach {}: {e}",
                    self.node.identifier(),
                    request.url
                );
                return Err(Failure::Retry);
            }
        };

        match self.api.info(api).await {
            Ok(info) => self.node.set_features(info),
            Err(e) => warn!("{}: could not fetch node info: {e}", self.node.identifier()),
        }

        self.policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.manager.node_connected(&self.node).await;

        self.flush(writer).await;
        self.set_state(State::Ready);
        Ok(reader)
    }

    /// Installs the writer and sends the queued messages in order.
    async fn flush(&self, writer: Box<dyn SocketWriter>) {
        let mut outbound = self.outbound.lock().await;
        let outbound = &mut *outbound;
        let writer = outbound.writer.insert(writer);

        if !outbound.pending.is_empty() {
            debug!(
                "{}: sending {} queued messages",
                self.node.identifier(),
                outbound.pending.len()
            );
        }

        while let Some(text) = outbound.pending.front() {
            trace!("{}: <- {text}", self.node.identifier());
            if let Err(e) = writer.send_text(text.clone()).await {
                warn!("{}: flushing queue failed: {e}", self.node.identifier());
                break;
            }
            outbound.pending.pop_front();
        }
    }

    async fn listen(&self, mut reader: Box<dyn SocketReader>) -> Disconnect {
        let period = self.node.config().heartbeat.max(Self::MIN_HEARTBEAT);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    return Disconnect {
                        code: Self::CLOSE_MANUAL,
                        reason: Self::CLOSE_MANUAL_REASON.to_owned(),
                    };
                }

                frame = reader.next_frame() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!("{}: socket failed: {e}", self.node.identifier());
                            return Disconnect {
                                code: Self::CLOSE_ABNORMAL,
                                reason: e.to_string(),
                            };
                        }
                        None => {
                            return Disconnect {
                                code: Self::CLOSE_ABNORMAL,
                                reason: "connection closed".to_owned(),
                            };
                        }
                    };

                    match frame {
                        Frame::Text(text) => {
                            trace!("{}: -> {text}", self.node.identifier());
                            if let Err(e) = self.dispatcher.handle(&text).await {
                                error!("{}: failed to handle frame: {e}", self.node.identifier());
                                return Disconnect {
                                    code: Self::CLOSE_ABNORMAL,
                                    reason: e.to_string(),
                                };
                            }
                        }
                        Frame::Close { code, reason } => return Disconnect { code, reason },
                        Frame::Binary(data) => {
                            debug!("{}: ignoring {} bytes of binary data", self.node.identifier(), data.len());
                        }
                        Frame::Ping(_) | Frame::Pong => {}
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(writer) = self.outbound.lock().await.writer.as_mut() {
                        if let Err(e) = writer.ping().await {
                            warn!("{}: heartbeat failed: {e}", self.node.identifier());
                        }
                    }
                }
            }
        }
    }

    /// Handles the end of the read loop. Returns whether to connect again.
    async fn disconnect(&self, disconnect: Disconnect) -> bool {
        let Disconnect { code, reason } = disconnect;
        self.node.clear_session();
        let writer = self.outbound.lock().await.writer.take();

        self.manager
            .node_disconnected(&self.node, code, &reason)
            .await;

        if !self.shutdown.is_cancelled() {
            warn!(
                "{}: disconnected with code {code}: {reason}",
                self.node.identifier()
            );
            self.set_state(State::Reconnecting);
            return true;
        }

        self.set_state(State::ClosingManual);
        if let Some(mut writer) = writer {
            if let Err(e) = writer
                .close(Self::CLOSE_SHUTDOWN, Self::CLOSE_SHUTDOWN_REASON)
                .await
            {
                debug!("{}: closing socket failed: {e}", self.node.identifier());
            }
        }

        self.dispatcher.cancel_probes();
        info!("{}: disconnected", self.node.identifier());
        self.set_state(State::Disconnected);
        false
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.node.identifier())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_display() {
        assert_eq!(State::default(), State::Disconnected);
        assert_eq!(State::ClosingManual.to_string(), "closing");
        assert_eq!(State::Failed.to_string(), "failed");
    }
}
