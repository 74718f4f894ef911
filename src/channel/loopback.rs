//! In-process transport for tests and offline runs.
//!
//! Joins are answered from a script (default: `ok` with an empty ack),
//! pushes are recorded, and [`LoopbackTransport::emit`] injects inbound
//! messages as if the server had sent them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

use super::{
    ChannelError, ConnectionStatus, InboundMessage, Payload, Subscription, SubscriptionRegistry,
    Transport,
};

/// A push recorded by the loopback transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPush {
    /// Topic pushed to.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Payload sent.
    pub payload: Payload,
}

#[derive(Debug, Default)]
struct LoopbackState {
    joined: HashSet<String>,
    pending: HashSet<String>,
    scripted: HashMap<String, VecDeque<Result<Value, String>>>,
    join_params: Vec<(String, Value)>,
    left: Vec<String>,
    outbox: Vec<OutboundPush>,
    fail_connect: Option<String>,
}

/// Scriptable [`Transport`] that never touches the network.
#[derive(Debug)]
pub struct LoopbackTransport {
    socket_id: String,
    registry: Arc<SubscriptionRegistry>,
    status: watch::Sender<ConnectionStatus>,
    hold_joins: watch::Sender<bool>,
    state: Mutex<LoopbackState>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create a closed loopback transport.
    pub fn new() -> Self {
        Self {
            socket_id: uuid::Uuid::new_v4().to_string(),
            registry: SubscriptionRegistry::new(),
            status: watch::channel(ConnectionStatus::Closed).0,
            hold_joins: watch::channel(false).0,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the reply for the next join of `topic`. `Err` rejects with the
    /// given reason.
    pub fn reply_to_join(&self, topic: &str, reply: Result<Value, String>) {
        self.state()
            .scripted
            .entry(topic.to_string())
            .or_default()
            .push_back(reply);
    }

    /// While held, joins wait without replying.
    pub fn set_hold_joins(&self, hold: bool) {
        self.hold_joins.send_replace(hold);
    }

    /// Make the next `connect` fail with `reason`.
    pub fn fail_connect(&self, reason: &str) {
        self.state().fail_connect = Some(reason.to_string());
    }

    /// Drop the connection as if the network failed.
    pub fn fail_connection(&self, reason: &str) {
        self.state().joined.clear();
        self.status
            .send_replace(ConnectionStatus::Error(reason.to_string()));
    }

    /// Deliver an inbound message to subscribers of `topic`.
    pub fn emit(&self, topic: &str, event: &str, payload: impl Into<Payload>) -> usize {
        self.registry.dispatch(&InboundMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.into(),
        })
    }

    /// Every push sent so far.
    pub fn pushes(&self) -> Vec<OutboundPush> {
        self.state().outbox.clone()
    }

    /// Params of every join attempt, in order.
    pub fn join_params(&self) -> Vec<(String, Value)> {
        self.state().join_params.clone()
    }

    /// Topics left so far.
    pub fn left(&self) -> Vec<String> {
        self.state().left.clone()
    }

    /// Whether `topic` is currently joined.
    pub fn is_joined(&self, topic: &str) -> bool {
        self.state().joined.contains(topic)
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.subscriber_count(topic)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn socket_id(&self) -> &str {
        &self.socket_id
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        if self.status.borrow().is_open() {
            return Ok(());
        }
        if let Some(reason) = self.state().fail_connect.take() {
            self.status.send_replace(ConnectionStatus::Error(reason.clone()));
            return Err(ChannelError::ConnectionFailed(reason));
        }
        self.status.send_replace(ConnectionStatus::Open);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state().joined.clear();
        self.status.send_replace(ConnectionStatus::Closed);
    }

    async fn join(&self, topic: &str, params: Value) -> Result<Value, ChannelError> {
        if !self.status.borrow().is_open() {
            return Err(ChannelError::Closed);
        }
        {
            let mut state = self.state();
            if !state.pending.insert(topic.to_string()) {
                return Err(ChannelError::JoinPending(topic.to_string()));
            }
            state.join_params.push((topic.to_string(), params));
        }

        let mut hold = self.hold_joins.subscribe();
        let mut status = self.status.subscribe();
        tokio::select! {
            _ = hold.wait_for(|held| !*held) => {}
            _ = status.wait_for(ConnectionStatus::is_down) => {
                self.state().pending.remove(topic);
                return Err(ChannelError::Closed);
            }
        }

        let mut state = self.state();
        if !state.pending.remove(topic) {
            // Left while waiting.
            return Err(ChannelError::Closed);
        }
        let reply = state
            .scripted
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Value::Object(serde_json::Map::new())));
        match reply {
            Ok(ack) => {
                state.joined.insert(topic.to_string());
                Ok(ack)
            }
            Err(reason) => Err(ChannelError::JoinRejected(reason)),
        }
    }

    async fn leave(&self, topic: &str) {
        let mut state = self.state();
        let was_joined = state.joined.remove(topic);
        let was_pending = state.pending.remove(topic);
        if was_joined || was_pending {
            state.left.push(topic.to_string());
        }
    }

    fn push(&self, topic: &str, event: &str, payload: Payload) {
        let mut state = self.state();
        if !state.joined.contains(topic) {
            log::debug!("[Loopback] Dropping push '{}' -- {} not joined", event, topic);
            return;
        }
        state.outbox.push(OutboundPush {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        });
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.registry.register(topic)
    }

    fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_join_uses_scripted_reply() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();
        transport.reply_to_join("t", Ok(json!({"run": {"id": "r1"}})));

        let ack = transport.join("t", json!({"a": 1})).await.unwrap();
        assert_eq!(ack["run"]["id"], "r1");
        assert!(transport.is_joined("t"));
        assert_eq!(transport.join_params(), vec![("t".to_string(), json!({"a": 1}))]);
    }

    #[tokio::test]
    async fn test_join_rejection() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();
        transport.reply_to_join("t", Err("unauthorized".into()));

        assert_eq!(
            transport.join("t", json!({})).await,
            Err(ChannelError::JoinRejected("unauthorized".into()))
        );
        assert!(!transport.is_joined("t"));
    }

    #[tokio::test]
    async fn test_second_join_while_pending_fails() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect().await.unwrap();
        transport.set_hold_joins(true);

        let first = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.join("t", json!({})).await }
        });
        tokio::task::yield_now().await;
        while transport.join_params().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            transport.join("t", json!({})).await,
            Err(ChannelError::JoinPending("t".into()))
        );

        transport.set_hold_joins(false);
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_push_requires_join() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();

        transport.push("t", "input:a:input", Payload::Json(json!("early")));
        transport.join("t", json!({})).await.unwrap();
        transport.push("t", "input:a:input", Payload::Json(json!("late")));

        let pushes = transport.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].payload, Payload::Json(json!("late")));
    }

    #[tokio::test]
    async fn test_connection_failure_closes_held_join() {
        let transport = Arc::new(LoopbackTransport::new());
        transport.connect().await.unwrap();
        transport.set_hold_joins(true);

        let join = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.join("t", json!({})).await }
        });
        while transport.join_params().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.fail_connection("reset");

        assert_eq!(join.await.unwrap(), Err(ChannelError::Closed));
        assert!(matches!(transport.status(), ConnectionStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_connect_can_be_scripted_to_fail() {
        let transport = LoopbackTransport::new();
        transport.fail_connect("refused");
        assert_eq!(
            transport.connect().await,
            Err(ChannelError::ConnectionFailed("refused".into()))
        );
        assert!(transport.connect().await.is_ok());
    }
}
