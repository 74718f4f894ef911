//! Channel abstraction for multiplexed run communication.
//!
//! One socket connection carries many topics. A [`Transport`] joins a topic,
//! pushes events into it, and fans inbound messages out to every
//! [`Subscription`] registered for that topic.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── PhoenixSocket      websocket + Phoenix v2 frames, background task
//!     │
//!     └── LoopbackTransport  in-process, scripted joins, records pushes
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let socket = PhoenixSocket::new(config.socket_config()?);
//! socket.connect().await?;
//!
//! let mut sub = socket.subscribe("pipelines:1:2");
//! let ack = socket.join("pipelines:1:2", json!({"initial_inputs": []})).await?;
//!
//! socket.push("pipelines:1:2", "input:chat:input", Payload::from(json!("hi")));
//! while let Some(msg) = sub.recv().await { /* ... */ }
//! ```
//!
//! Failure semantics: socket errors move the status to
//! [`ConnectionStatus::Error`]. Nothing reconnects automatically.

pub mod frame;
pub mod loopback;
pub mod phoenix;
pub mod subscription;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

pub use loopback::{LoopbackTransport, OutboundPush};
pub use phoenix::{PhoenixSocket, SocketConfig};
pub use subscription::{Subscription, SubscriptionId, SubscriptionRegistry};

/// Connection status of the underlying socket.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Handshake in progress.
    Connecting,
    /// Connected and ready.
    Open,
    /// Not connected (never connected, or closed cleanly).
    #[default]
    Closed,
    /// The connection failed or dropped.
    Error(String),
}

impl ConnectionStatus {
    /// Returns `true` for `Open`.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` for `Closed` and `Error`.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Payload of a channel event.
///
/// Text events carry JSON; audio travels as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// JSON payload (text frame).
    Json(serde_json::Value),
    /// Raw bytes (binary frame).
    Binary(Bytes),
}

impl Payload {
    /// Returns the JSON value, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

/// A message received on a joined topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Event name (e.g. `output:chat:output`, `phx_error`).
    pub event: String,
    /// Event payload.
    pub payload: Payload,
}

/// Errors that can occur during channel operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Failed to establish the socket connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The server declined the join.
    #[error("join rejected: {0}")]
    JoinRejected(String),
    /// A join for this topic is already waiting for its reply.
    #[error("join already pending for topic {0}")]
    JoinPending(String),
    /// The join was not acknowledged in time.
    #[error("operation timed out")]
    Timeout,
    /// The socket or channel closed before the operation completed.
    #[error("channel closed")]
    Closed,
}

/// A multiplexed channel transport scoped to pipeline runs.
///
/// Implementors own one socket connection and route inbound messages to
/// subscriptions by topic.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Identifier of this socket, used for channel authentication.
    fn socket_id(&self) -> &str;

    /// Open the socket.
    ///
    /// Idempotent: calling while connected or connecting returns `Ok(())`.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Close the socket.
    async fn disconnect(&self);

    /// Join `topic`, resolving with the server's ack payload.
    ///
    /// Fails with [`ChannelError::JoinPending`] if a join for the same topic
    /// is still waiting for its reply.
    async fn join(&self, topic: &str, params: serde_json::Value)
        -> Result<serde_json::Value, ChannelError>;

    /// Leave `topic`. Always succeeds locally.
    async fn leave(&self, topic: &str);

    /// Send an event on a joined topic. Fire-and-forget.
    fn push(&self, topic: &str, event: &str, payload: Payload);

    /// Register a receiver for every message on `topic`.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Observe connection status transitions.
    fn status_watch(&self) -> watch::Receiver<ConnectionStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_default_is_closed() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Closed);
        assert!(ConnectionStatus::default().is_down());
    }

    #[test]
    fn test_connection_status_display() {
        assert_eq!(ConnectionStatus::Open.to_string(), "open");
        assert_eq!(
            ConnectionStatus::Error("reset".into()).to_string(),
            "error: reset"
        );
    }

    #[test]
    fn test_payload_conversions() {
        let json = Payload::from(serde_json::json!({"message": "hi"}));
        assert_eq!(json.as_json().unwrap()["message"], "hi");

        let binary = Payload::from(vec![1u8, 2, 3]);
        assert!(binary.as_json().is_none());
        assert_eq!(binary, Payload::Binary(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn test_channel_error_messages() {
        assert_eq!(
            ChannelError::JoinRejected("unauthorized".into()).to_string(),
            "join rejected: unauthorized"
        );
        assert_eq!(
            ChannelError::JoinPending("pipelines:1:2".into()).to_string(),
            "join already pending for topic pipelines:1:2"
        );
    }
}
