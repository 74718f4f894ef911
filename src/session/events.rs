//! Decoding of inbound run-channel events.
//!
//! Event names carry the routing: `output:<block>:<output>`,
//! `start:<block>`, `stop:<block>`, `error:<block>`, plus the bare `status`
//! and `history` events. Anything that fails to decode is a [`EventError`];
//! callers log and drop it.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::channel::frame::{PHX_CLOSE, PHX_ERROR, PHX_REPLY};
use crate::channel::{InboundMessage, Payload};

/// Payload of an `output:` event.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPayload {
    /// `{message: "...", metadata: {created_at}}`.
    Text {
        /// Text chunk.
        message: String,
        /// Server timestamp, if supplied.
        created_at: Option<String>,
    },
    /// Raw bytes (audio).
    Binary(Bytes),
    /// Any other JSON payload.
    Json(Value),
}

/// Kind of a replayed history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Block started working.
    StartStream,
    /// Block stopped working.
    StopStream,
    /// Text output.
    Text,
    /// Binary output.
    Binary,
}

/// One entry of the `history` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryEvent {
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    /// Block name.
    pub block: String,
    /// Input/output name.
    #[serde(default)]
    pub io: String,
    /// Server timestamp.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Content for `text` and `binary` entries.
    #[serde(default)]
    pub message: Option<Value>,
}

/// A decoded run event.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// Content from a block output.
    Output {
        /// Block name.
        block: String,
        /// Output name.
        output: String,
        /// Content.
        payload: OutputPayload,
    },
    /// A block started or stopped working.
    Status {
        /// Block name.
        block: String,
        /// Working state.
        is_working: bool,
    },
    /// A block reported errors.
    BlockError {
        /// Block name.
        block: String,
        /// Error messages.
        errors: Vec<String>,
    },
    /// Past events of a joined run.
    History(Vec<HistoryEvent>),
    /// The server closed or crashed the channel.
    ChannelClosed {
        /// Event that closed it.
        reason: String,
    },
    /// Not relevant to the session.
    Ignored,
}

/// A run event that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// The event name is missing a segment.
    #[error("malformed event name: {0}")]
    EventName(String),
    /// The payload has the wrong shape.
    #[error("malformed payload for {event}: {reason}")]
    Payload {
        /// Event name.
        event: String,
        /// Decoder message.
        reason: String,
    },
}

#[derive(Deserialize)]
struct StatusPayload {
    block: String,
    #[serde(rename = "isWorking")]
    is_working: bool,
}

#[derive(Deserialize, Default)]
struct ErrorPayload {
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    List(Vec<HistoryEvent>),
    Wrapped { events: Vec<HistoryEvent> },
}

fn block_segment<'a>(event: &'a str, rest: &'a str) -> Result<&'a str, EventError> {
    if rest.is_empty() {
        Err(EventError::EventName(event.to_string()))
    } else {
        Ok(rest)
    }
}

fn json_payload<'a>(message: &'a InboundMessage) -> Result<&'a Value, EventError> {
    message.payload.as_json().ok_or_else(|| EventError::Payload {
        event: message.event.clone(),
        reason: "expected JSON, got binary".to_string(),
    })
}

fn parse<T: serde::de::DeserializeOwned>(message: &InboundMessage) -> Result<T, EventError> {
    T::deserialize(json_payload(message)?).map_err(|e| EventError::Payload {
        event: message.event.clone(),
        reason: e.to_string(),
    })
}

/// Decode one inbound message.
pub fn decode(message: &InboundMessage) -> Result<RunEvent, EventError> {
    let event = message.event.as_str();

    if event == PHX_ERROR || event == PHX_CLOSE {
        return Ok(RunEvent::ChannelClosed {
            reason: event.to_string(),
        });
    }
    if event == PHX_REPLY {
        return Ok(RunEvent::Ignored);
    }

    if let Some(rest) = event.strip_prefix("output:") {
        let (block, output) = rest
            .split_once(':')
            .filter(|(b, o)| !b.is_empty() && !o.is_empty())
            .ok_or_else(|| EventError::EventName(event.to_string()))?;
        return Ok(RunEvent::Output {
            block: block.to_string(),
            output: output.to_string(),
            payload: output_payload(&message.payload),
        });
    }
    if let Some(rest) = event.strip_prefix("start:") {
        return Ok(RunEvent::Status {
            block: block_segment(event, rest)?.to_string(),
            is_working: true,
        });
    }
    if let Some(rest) = event.strip_prefix("stop:") {
        return Ok(RunEvent::Status {
            block: block_segment(event, rest)?.to_string(),
            is_working: false,
        });
    }
    if let Some(rest) = event.strip_prefix("error:") {
        let block = block_segment(event, rest)?.to_string();
        let payload: ErrorPayload = parse(message)?;
        let errors = payload
            .errors
            .into_iter()
            .map(|e| match e {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        return Ok(RunEvent::BlockError { block, errors });
    }

    match event {
        "status" => {
            let status: StatusPayload = parse(message)?;
            Ok(RunEvent::Status {
                block: status.block,
                is_working: status.is_working,
            })
        }
        "history" => {
            let events = match parse::<HistoryPayload>(message)? {
                HistoryPayload::List(events) | HistoryPayload::Wrapped { events } => events,
            };
            Ok(RunEvent::History(events))
        }
        _ => Ok(RunEvent::Ignored),
    }
}

fn output_payload(payload: &Payload) -> OutputPayload {
    match payload {
        Payload::Binary(bytes) => OutputPayload::Binary(bytes.clone()),
        Payload::Json(Value::String(message)) => OutputPayload::Text {
            message: message.clone(),
            created_at: None,
        },
        Payload::Json(value) => match value.get("message").and_then(Value::as_str) {
            Some(message) => OutputPayload::Text {
                message: message.to_string(),
                created_at: value
                    .pointer("/metadata/created_at")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            None => OutputPayload::Json(value.clone()),
        },
    }
}
