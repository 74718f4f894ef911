//! Phoenix channel socket over a single WebSocket.
//!
//! # Architecture
//!
//! ```text
//!   PhoenixSocket                       background socket task
//!         │                                     │
//!         │  join(topic) ──Command::Send──────► │ ──phx_join──► server
//!         │  ◄──────────── oneshot reply ────── │ ◄─phx_reply──
//!         │                                     │
//!         │  push(topic, event) ─Command::Send► │ ──push──────►
//!         │                                     │
//!   Subscription ◄───── registry.dispatch ───── │ ◄─broadcast──
//!                                               │
//!                                      heartbeat tick (topic "phoenix")
//! ```
//!
//! # Protocol
//!
//! - Serializer `vsn=2.0.0`: JSON array text frames, binary frames for bytes
//! - Joins are acknowledged by `phx_reply` matched on topic and ref
//! - A heartbeat still unanswered when the next one is due fails the socket
//! - `phx_error` / `phx_close` drop the topic's joined state
//!
//! The socket never reconnects on its own. When the connection drops, pending
//! joins fail with [`ChannelError::Closed`] and the status moves to
//! [`ConnectionStatus::Error`].

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::frame::{self, Envelope, Frame, WireFrame};
use super::{
    ChannelError, ConnectionStatus, InboundMessage, Payload, Subscription, SubscriptionRegistry,
    Transport,
};
use crate::constants::{HEARTBEAT_INTERVAL, HEARTBEAT_TOPIC, JOIN_TIMEOUT, SOCKET_PATH};
use crate::ws::{self, WsMessage};

/// How long `disconnect` waits for the socket task to wind down.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection parameters for a [`PhoenixSocket`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// HTTP(S) base URL of the server.
    pub server_url: String,
    /// Extra headers for the upgrade request.
    pub headers: Vec<(String, String)>,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a join may wait for its reply.
    pub join_timeout: Duration,
}

impl SocketConfig {
    /// Config with default timings for `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            headers: Vec::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            join_timeout: JOIN_TIMEOUT,
        }
    }
}

type JoinReply = oneshot::Sender<Result<Value, ChannelError>>;

#[derive(Debug)]
enum JoinState {
    Pending { join_ref: String, reply: JoinReply },
    Joined { join_ref: String },
}

impl JoinState {
    fn join_ref(&self) -> &str {
        match self {
            Self::Pending { join_ref, .. } | Self::Joined { join_ref } => join_ref,
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(Envelope),
    Close,
}

/// State shared between the socket handle and its background task.
#[derive(Debug)]
struct Shared {
    registry: Arc<SubscriptionRegistry>,
    joins: Mutex<HashMap<String, JoinState>>,
    status: watch::Sender<ConnectionStatus>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    refs: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Closed);
        Self {
            registry: SubscriptionRegistry::new(),
            joins: Mutex::new(HashMap::new()),
            status,
            commands: Mutex::new(None),
            refs: AtomicU64::new(0),
        }
    }

    fn joins(&self) -> MutexGuard<'_, HashMap<String, JoinState>> {
        self.joins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commands(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_ref(&self) -> String {
        (self.refs.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn send(&self, envelope: Envelope) -> bool {
        self.commands()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Send(envelope)).is_ok())
    }

    /// Route one decoded frame. Returns `true` when the frame answered the
    /// outstanding heartbeat.
    fn handle_frame(&self, frame: Frame, pending_heartbeat: Option<&str>) -> bool {
        match frame {
            Frame::Reply {
                msg_ref,
                topic,
                status,
                response,
                ..
            } => {
                if topic == HEARTBEAT_TOPIC {
                    return msg_ref.is_some() && msg_ref.as_deref() == pending_heartbeat;
                }
                self.handle_reply(&topic, msg_ref.as_deref(), &status, response);
                false
            }
            Frame::Message(envelope) => {
                if envelope.event == frame::PHX_ERROR || envelope.event == frame::PHX_CLOSE {
                    self.drop_topic(&envelope.topic, envelope.join_ref.as_deref());
                }
                self.registry.dispatch(&InboundMessage {
                    topic: envelope.topic,
                    event: envelope.event,
                    payload: envelope.payload,
                });
                false
            }
        }
    }

    fn handle_reply(&self, topic: &str, msg_ref: Option<&str>, status: &str, response: Payload) {
        let mut joins = self.joins();
        let is_join_reply = matches!(
            joins.get(topic),
            Some(JoinState::Pending { join_ref, .. }) if Some(join_ref.as_str()) == msg_ref
        );
        if !is_join_reply {
            if status != "ok" {
                log::debug!(
                    "[Phoenix] Push on {} answered with status {}: {:?}",
                    topic,
                    status,
                    response
                );
            }
            return;
        }

        let Some(JoinState::Pending { join_ref, reply }) = joins.remove(topic) else {
            return;
        };
        let response = match response {
            Payload::Json(value) => value,
            Payload::Binary(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        };

        if status == "ok" {
            log::info!("[Phoenix] Joined {}", topic);
            joins.insert(topic.to_string(), JoinState::Joined { join_ref });
            let _ = reply.send(Ok(response));
        } else {
            let reason = response
                .get("reason")
                .and_then(Value::as_str)
                .map_or_else(|| response.to_string(), str::to_string);
            log::warn!("[Phoenix] Join of {} rejected: {}", topic, reason);
            let _ = reply.send(Err(ChannelError::JoinRejected(reason)));
        }
    }

    fn drop_topic(&self, topic: &str, join_ref: Option<&str>) {
        let mut joins = self.joins();
        let current = joins.get(topic).map(|state| state.join_ref().to_string());
        if current.is_some() && (join_ref.is_none() || current.as_deref() == join_ref) {
            log::warn!("[Phoenix] Channel {} closed by server", topic);
            if let Some(JoinState::Pending { reply, .. }) = joins.remove(topic) {
                let _ = reply.send(Err(ChannelError::Closed));
            }
        }
    }

    /// Fail every pending join, forget all channels, publish `status`.
    fn shut_down(&self, status: ConnectionStatus) {
        self.commands().take();
        for (_, state) in self.joins().drain() {
            if let JoinState::Pending { reply, .. } = state {
                let _ = reply.send(Err(ChannelError::Closed));
            }
        }
        self.status.send_replace(status);
    }
}

/// Phoenix socket transport.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct PhoenixSocket {
    config: SocketConfig,
    socket_id: String,
    shared: Arc<Shared>,
}

impl PhoenixSocket {
    /// Create a disconnected socket with a fresh socket id.
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            socket_id: uuid::Uuid::new_v4().to_string(),
            shared: Arc::new(Shared::new()),
        }
    }

    /// Full websocket URL including `vsn` and socket id.
    pub fn url(&self) -> anyhow::Result<String> {
        ws::socket_url(
            &self.config.server_url,
            SOCKET_PATH,
            &[("id", self.socket_id.as_str())],
        )
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.registry.subscriber_count(topic)
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        if let Some(tx) = self.shared.commands().as_ref() {
            let _ = tx.send(Command::Close);
        }
    }
}

#[async_trait]
impl Transport for PhoenixSocket {
    fn socket_id(&self) -> &str {
        &self.socket_id
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let mut claimed = false;
        self.shared.status.send_if_modified(|status| {
            if matches!(status, ConnectionStatus::Open | ConnectionStatus::Connecting) {
                return false;
            }
            *status = ConnectionStatus::Connecting;
            claimed = true;
            true
        });

        if !claimed {
            let mut rx = self.shared.status.subscribe();
            let settled = rx
                .wait_for(|s| !matches!(s, ConnectionStatus::Connecting))
                .await
                .map_or(ConnectionStatus::Closed, |s| s.clone());
            return match settled {
                ConnectionStatus::Open => Ok(()),
                ConnectionStatus::Error(reason) => Err(ChannelError::ConnectionFailed(reason)),
                _ => Err(ChannelError::Closed),
            };
        }

        let url = match self.url() {
            Ok(url) => url,
            Err(e) => {
                let reason = format!("{e:#}");
                self.shared.status.send_replace(ConnectionStatus::Error(reason.clone()));
                return Err(ChannelError::ConnectionFailed(reason));
            }
        };
        log::info!("[Phoenix] Connecting to {}", url);

        let headers: Vec<(&str, &str)> = self
            .config
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (writer, reader) = match ws::connect(&url, &headers).await {
            Ok(pair) => pair,
            Err(e) => {
                let reason = format!("{e:#}");
                log::warn!("[Phoenix] Connection failed: {}", reason);
                self.shared.status.send_replace(ConnectionStatus::Error(reason.clone()));
                return Err(ChannelError::ConnectionFailed(reason));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.commands() = Some(tx);
        self.shared.status.send_replace(ConnectionStatus::Open);
        log::info!("[Phoenix] Socket open (id={})", self.socket_id);

        tokio::spawn(run_socket_loop(
            Arc::clone(&self.shared),
            writer,
            reader,
            rx,
            self.config.heartbeat_interval,
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        let sent = self
            .shared
            .commands()
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Close).is_ok());
        if !sent {
            return;
        }
        let mut rx = self.shared.status.subscribe();
        if tokio::time::timeout(DISCONNECT_GRACE, rx.wait_for(ConnectionStatus::is_down))
            .await
            .is_err()
        {
            log::warn!("[Phoenix] Socket task did not stop within {:?}", DISCONNECT_GRACE);
        }
    }

    async fn join(&self, topic: &str, params: Value) -> Result<Value, ChannelError> {
        if !self.shared.status.borrow().is_open() {
            return Err(ChannelError::Closed);
        }

        let join_ref = self.shared.next_ref();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut joins = self.shared.joins();
            if matches!(joins.get(topic), Some(JoinState::Pending { .. })) {
                return Err(ChannelError::JoinPending(topic.to_string()));
            }
            joins.insert(
                topic.to_string(),
                JoinState::Pending {
                    join_ref: join_ref.clone(),
                    reply: reply_tx,
                },
            );
        }

        log::debug!("[Phoenix] Joining {} (ref={})", topic, join_ref);
        let sent = self.shared.send(Envelope {
            join_ref: Some(join_ref.clone()),
            msg_ref: Some(join_ref.clone()),
            topic: topic.to_string(),
            event: frame::PHX_JOIN.to_string(),
            payload: Payload::Json(params),
        });
        if !sent {
            self.shared.joins().remove(topic);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(self.config.join_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                let mut joins = self.shared.joins();
                if joins.get(topic).is_some_and(|s| s.join_ref() == join_ref) {
                    joins.remove(topic);
                }
                log::warn!("[Phoenix] Join of {} timed out", topic);
                Err(ChannelError::Timeout)
            }
        }
    }

    async fn leave(&self, topic: &str) {
        let Some(state) = self.shared.joins().remove(topic) else {
            return;
        };
        let join_ref = state.join_ref().to_string();
        if let JoinState::Pending { reply, .. } = state {
            let _ = reply.send(Err(ChannelError::Closed));
        }

        log::info!("[Phoenix] Leaving {}", topic);
        self.shared.send(Envelope {
            join_ref: Some(join_ref),
            msg_ref: Some(self.shared.next_ref()),
            topic: topic.to_string(),
            event: frame::PHX_LEAVE.to_string(),
            payload: Payload::Json(Value::Object(serde_json::Map::new())),
        });
    }

    fn push(&self, topic: &str, event: &str, payload: Payload) {
        let join_ref = match self.shared.joins().get(topic) {
            Some(JoinState::Joined { join_ref }) => join_ref.clone(),
            _ => {
                log::debug!("[Phoenix] Dropping push '{}' -- {} not joined", event, topic);
                return;
            }
        };
        let sent = self.shared.send(Envelope {
            join_ref: Some(join_ref),
            msg_ref: Some(self.shared.next_ref()),
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        });
        if !sent {
            log::debug!("[Phoenix] Dropping push '{}' -- socket closed", event);
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.shared.registry.register(topic)
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }
}

/// Background task owning the websocket.
///
/// Exits on close request, socket error, server close or missed heartbeat,
/// then publishes the final status.
async fn run_socket_loop(
    shared: Arc<Shared>,
    mut writer: ws::WsWriter,
    mut reader: ws::WsReader,
    mut commands: mpsc::UnboundedReceiver<Command>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending_heartbeat: Option<String> = None;

    let exit = loop {
        tokio::select! {
            msg = reader.recv() => {
                let decoded = match msg {
                    Some(Ok(WsMessage::Text(text))) => frame::decode_text(&text),
                    Some(Ok(WsMessage::Binary(data))) => frame::decode_binary(&data),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = writer.send_pong(data).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Pong(_))) => continue,
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        log::info!("[Phoenix] Connection closed by server ({} {})", code, reason);
                        let status = if code == 1000 {
                            ConnectionStatus::Closed
                        } else {
                            ConnectionStatus::Error(format!("closed by server: {code} {reason}"))
                        };
                        break status;
                    }
                    Some(Err(e)) => {
                        log::warn!("[Phoenix] WebSocket error: {}", e);
                        break ConnectionStatus::Error(e.to_string());
                    }
                    None => {
                        log::warn!("[Phoenix] WebSocket stream ended");
                        break ConnectionStatus::Error("connection lost".to_string());
                    }
                };
                match decoded {
                    Ok(frame) => {
                        if shared.handle_frame(frame, pending_heartbeat.as_deref()) {
                            pending_heartbeat = None;
                        }
                    }
                    Err(e) => log::warn!("[Phoenix] Dropping malformed frame: {}", e),
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Send(envelope)) => {
                        if let Err(e) = send_envelope(&mut writer, &envelope).await {
                            log::warn!("[Phoenix] Failed to send '{}': {:#}", envelope.event, e);
                            break ConnectionStatus::Error(e.to_string());
                        }
                    }
                    Some(Command::Close) | None => {
                        log::info!("[Phoenix] Closing socket");
                        let _ = writer.close().await;
                        break ConnectionStatus::Closed;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if pending_heartbeat.is_some() {
                    log::warn!("[Phoenix] Heartbeat timeout, closing connection");
                    let _ = writer.close().await;
                    break ConnectionStatus::Error("heartbeat timeout".to_string());
                }
                let msg_ref = shared.next_ref();
                let envelope = Envelope {
                    join_ref: None,
                    msg_ref: Some(msg_ref.clone()),
                    topic: HEARTBEAT_TOPIC.to_string(),
                    event: frame::HEARTBEAT.to_string(),
                    payload: Payload::Json(Value::Object(serde_json::Map::new())),
                };
                if let Err(e) = send_envelope(&mut writer, &envelope).await {
                    break ConnectionStatus::Error(e.to_string());
                }
                log::trace!("[Phoenix] Heartbeat sent (ref={})", msg_ref);
                pending_heartbeat = Some(msg_ref);
            }
        }
    };

    shared.shut_down(exit);
}

async fn send_envelope(writer: &mut ws::WsWriter, envelope: &Envelope) -> anyhow::Result<()> {
    match envelope.encode()? {
        WireFrame::Text(text) => writer.send_text(text).await,
        WireFrame::Binary(data) => writer.send_binary(data).await,
    }
}
