//! Live log subscription.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{LogAction, LogEntry};
use crate::channel::frame::{PHX_CLOSE, PHX_ERROR};
use crate::channel::{ChannelError, Subscription, Transport};

/// Topic streaming the logs of one run.
pub fn logs_topic(organization_id: u64, pipeline_id: u64, run_id: &str) -> String {
    format!("logs:{organization_id}:{pipeline_id}:{run_id}")
}

#[derive(Deserialize)]
struct LiveLog {
    data: LogEntry,
}

/// Joined log channel of a run, yielding [`LogAction::Log`] for each line.
#[derive(Debug)]
pub struct LogFeed {
    transport: Arc<dyn Transport>,
    topic: String,
    subscription: Option<Subscription>,
}

impl LogFeed {
    /// Connect (if needed) and join the run's log topic, optionally filtered
    /// to one block.
    pub async fn open(
        transport: Arc<dyn Transport>,
        organization_id: u64,
        pipeline_id: u64,
        run_id: &str,
        block_name: Option<&str>,
    ) -> Result<Self, ChannelError> {
        let topic = logs_topic(organization_id, pipeline_id, run_id);
        transport.connect().await?;

        let subscription = transport.subscribe(&topic);
        let params = match block_name {
            Some(block) => json!({ "block_name": block }),
            None => json!({}),
        };
        transport.join(&topic, params).await?;
        log::info!("[Logs] Following {}", topic);

        Ok(Self {
            transport,
            topic,
            subscription: Some(subscription),
        })
    }

    /// Topic this feed is joined to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next live log line. `None` once the feed is closed or the server
    /// closed the channel.
    pub async fn next_action(&mut self) -> Option<LogAction> {
        loop {
            let message = self.subscription.as_mut()?.recv().await?;
            if message.event == PHX_ERROR || message.event == PHX_CLOSE {
                log::warn!("[Logs] Channel {} closed ({})", self.topic, message.event);
                self.subscription = None;
                return None;
            }
            let Some(payload) = message.payload.as_json() else {
                log::debug!("[Logs] Ignoring binary frame on {}", self.topic);
                continue;
            };
            match LiveLog::deserialize(payload) {
                Ok(live) => return Some(LogAction::Log(live.data)),
                Err(e) => {
                    if payload.get("data").is_some() {
                        log::warn!("[Logs] Dropping malformed log event '{}': {}", message.event, e);
                    } else {
                        log::trace!("[Logs] Ignoring event '{}'", message.event);
                    }
                }
            }
        }
    }

    /// Leave the topic. No further actions are produced.
    pub async fn close(mut self) {
        self.subscription = None;
        self.transport.leave(&self.topic).await;
    }
}

impl Drop for LogFeed {
    fn drop(&mut self) {
        if self.subscription.is_some() {
            log::debug!("[Logs] Feed for {} dropped without close", self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackTransport;

    #[tokio::test]
    async fn test_feed_yields_live_entries() {
        let transport = Arc::new(LoopbackTransport::new());
        let mut feed = LogFeed::open(Arc::clone(&transport) as Arc<dyn Transport>, 1, 2, "3", Some("chat"))
            .await
            .unwrap();

        assert_eq!(feed.topic(), "logs:1:2:3");
        assert_eq!(
            transport.join_params(),
            vec![("logs:1:2:3".to_string(), json!({"block_name": "chat"}))]
        );

        transport.emit("logs:1:2:3", "presence_state", json!({}));
        transport.emit("logs:1:2:3", "logs", json!({"data": "oops"}));
        transport.emit(
            "logs:1:2:3",
            "logs",
            json!({"data": {"id": 9, "message": "started", "block_name": "chat"}}),
        );

        let Some(LogAction::Log(entry)) = feed.next_action().await else {
            panic!("expected a log entry");
        };
        assert_eq!(entry.id, 9);
        assert_eq!(entry.message, "started");
    }

    #[tokio::test]
    async fn test_close_leaves_topic() {
        let transport = Arc::new(LoopbackTransport::new());
        let feed = LogFeed::open(Arc::clone(&transport) as Arc<dyn Transport>, 1, 2, "3", None)
            .await
            .unwrap();
        feed.close().await;

        assert_eq!(transport.left(), vec!["logs:1:2:3".to_string()]);
        assert_eq!(transport.subscriber_count("logs:1:2:3"), 0);
    }

    #[tokio::test]
    async fn test_server_close_ends_feed() {
        let transport = Arc::new(LoopbackTransport::new());
        let mut feed = LogFeed::open(Arc::clone(&transport) as Arc<dyn Transport>, 1, 2, "3", None)
            .await
            .unwrap();
        transport.emit("logs:1:2:3", "phx_close", json!({}));
        assert!(feed.next_action().await.is_none());
        assert!(feed.next_action().await.is_none());
    }
}
