//! Phoenix v2 wire frames.
//!
//! Text frames are JSON arrays `[join_ref, ref, topic, event, payload]`.
//! Binary frames start with a kind byte followed by one length byte per
//! string field:
//!
//! ```text
//! push       [0][join_ref_len][ref_len][topic_len][event_len] strings.. payload
//! reply      [1][join_ref_len][ref_len][topic_len][status_len] strings.. payload
//! broadcast  [2][topic_len][event_len] topic event payload
//! ```
//!
//! Replies (`phx_reply`) are decoded into [`Frame::Reply`] regardless of
//! which encoding carried them.

use bytes::Bytes;
use serde_json::Value;

use super::Payload;

const KIND_PUSH: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST: u8 = 2;

/// Event name of server replies.
pub const PHX_REPLY: &str = "phx_reply";
/// Event name of channel joins.
pub const PHX_JOIN: &str = "phx_join";
/// Event name of channel leaves.
pub const PHX_LEAVE: &str = "phx_leave";
/// Event name the server sends when a channel crashes.
pub const PHX_ERROR: &str = "phx_error";
/// Event name the server sends when a channel closes.
pub const PHX_CLOSE: &str = "phx_close";
/// Event name of socket heartbeats.
pub const HEARTBEAT: &str = "heartbeat";

/// Errors from decoding or encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The text frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The JSON is not a `[join_ref, ref, topic, event, payload]` array.
    #[error("frame is not a 5-element array")]
    NotAnArray,
    /// A field has the wrong type or encoding.
    #[error("invalid field {0}")]
    InvalidField(&'static str),
    /// A binary frame ends before its header says it should.
    #[error("binary frame truncated")]
    Truncated,
    /// Leading kind byte is not push, reply or broadcast.
    #[error("unknown binary frame kind {0}")]
    UnknownKind(u8),
    /// A string field does not fit in a one-byte length.
    #[error("field {0} exceeds 255 bytes")]
    FieldTooLong(&'static str),
}

/// An outgoing (or inbound non-reply) channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Ref of the join this message belongs to.
    pub join_ref: Option<String>,
    /// Message ref, echoed back in the reply.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Payload,
}

/// Encoded frame ready for the websocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// JSON array text frame.
    Text(String),
    /// Binary push frame.
    Binary(Vec<u8>),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Push or broadcast.
    Message(Envelope),
    /// Reply to a message we sent.
    #[allow(missing_docs, reason = "fields mirror Envelope")]
    Reply {
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: String,
        status: String,
        response: Payload,
    },
}

impl Envelope {
    /// Encode for the wire. JSON payloads become text frames, bytes become
    /// binary push frames.
    pub fn encode(&self) -> Result<WireFrame, FrameError> {
        match &self.payload {
            Payload::Json(value) => {
                let array = Value::Array(vec![
                    opt_string(&self.join_ref),
                    opt_string(&self.msg_ref),
                    Value::String(self.topic.clone()),
                    Value::String(self.event.clone()),
                    value.clone(),
                ]);
                serde_json::to_string(&array)
                    .map(WireFrame::Text)
                    .map_err(|e| FrameError::InvalidJson(e.to_string()))
            }
            Payload::Binary(data) => {
                let join_ref = self.join_ref.as_deref().unwrap_or("");
                let msg_ref = self.msg_ref.as_deref().unwrap_or("");
                let mut out = Vec::with_capacity(
                    5 + join_ref.len() + msg_ref.len() + self.topic.len() + self.event.len() + data.len(),
                );
                out.push(KIND_PUSH);
                out.push(field_len(join_ref, "join_ref")?);
                out.push(field_len(msg_ref, "ref")?);
                out.push(field_len(&self.topic, "topic")?);
                out.push(field_len(&self.event, "event")?);
                out.extend_from_slice(join_ref.as_bytes());
                out.extend_from_slice(msg_ref.as_bytes());
                out.extend_from_slice(self.topic.as_bytes());
                out.extend_from_slice(self.event.as_bytes());
                out.extend_from_slice(data);
                Ok(WireFrame::Binary(out))
            }
        }
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

fn field_len(value: &str, name: &'static str) -> Result<u8, FrameError> {
    u8::try_from(value.len()).ok().ok_or(FrameError::FieldTooLong(name))
}

/// Decode a text frame.
pub fn decode_text(text: &str) -> Result<Frame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let Value::Array(mut fields) = value else {
        return Err(FrameError::NotAnArray);
    };
    if fields.len() != 5 {
        return Err(FrameError::NotAnArray);
    }

    let payload = fields.pop().unwrap_or(Value::Null);
    let event = take_string(fields.pop(), "event")?;
    let topic = take_string(fields.pop(), "topic")?;
    let msg_ref = take_ref(fields.pop(), "ref")?;
    let join_ref = take_ref(fields.pop(), "join_ref")?;

    if event == PHX_REPLY {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or(FrameError::InvalidField("status"))?
            .to_string();
        let response = payload.get("response").cloned().unwrap_or(Value::Null);
        return Ok(Frame::Reply {
            join_ref,
            msg_ref,
            topic,
            status,
            response: Payload::Json(response),
        });
    }

    Ok(Frame::Message(Envelope {
        join_ref,
        msg_ref,
        topic,
        event,
        payload: Payload::Json(payload),
    }))
}

fn take_string(value: Option<Value>, name: &'static str) -> Result<String, FrameError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(FrameError::InvalidField(name)),
    }
}

fn take_ref(value: Option<Value>, name: &'static str) -> Result<Option<String>, FrameError> {
    match value {
        Some(Value::Null) | None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(FrameError::InvalidField(name)),
    }
}

/// Decode a binary frame.
pub fn decode_binary(data: &[u8]) -> Result<Frame, FrameError> {
    let (&kind, rest) = data.split_first().ok_or(FrameError::Truncated)?;
    match kind {
        KIND_PUSH => {
            let mut cursor = Cursor::new(rest, 4)?;
            let join_ref = cursor.string("join_ref")?;
            let msg_ref = cursor.string("ref")?;
            let topic = cursor.string("topic")?;
            let event = cursor.string("event")?;
            Ok(Frame::Message(Envelope {
                join_ref: non_empty(join_ref),
                msg_ref: non_empty(msg_ref),
                topic,
                event,
                payload: Payload::Binary(cursor.remainder()),
            }))
        }
        KIND_REPLY => {
            let mut cursor = Cursor::new(rest, 4)?;
            let join_ref = cursor.string("join_ref")?;
            let msg_ref = cursor.string("ref")?;
            let topic = cursor.string("topic")?;
            let status = cursor.string("status")?;
            Ok(Frame::Reply {
                join_ref: non_empty(join_ref),
                msg_ref: non_empty(msg_ref),
                topic,
                status,
                response: Payload::Binary(cursor.remainder()),
            })
        }
        KIND_BROADCAST => {
            let mut cursor = Cursor::new(rest, 2)?;
            let topic = cursor.string("topic")?;
            let event = cursor.string("event")?;
            Ok(Frame::Message(Envelope {
                join_ref: None,
                msg_ref: None,
                topic,
                event,
                payload: Payload::Binary(cursor.remainder()),
            }))
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Walks the length header and string section of a binary frame.
struct Cursor<'a> {
    lengths: std::vec::IntoIter<usize>,
    body: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], fields: usize) -> Result<Self, FrameError> {
        if data.len() < fields {
            return Err(FrameError::Truncated);
        }
        let (header, body) = data.split_at(fields);
        Ok(Self {
            lengths: header.iter().map(|&b| usize::from(b)).collect::<Vec<_>>().into_iter(),
            body,
        })
    }

    fn string(&mut self, name: &'static str) -> Result<String, FrameError> {
        let len = self.lengths.next().ok_or(FrameError::Truncated)?;
        if self.body.len() < len {
            return Err(FrameError::Truncated);
        }
        let (field, rest) = self.body.split_at(len);
        self.body = rest;
        String::from_utf8(field.to_vec()).ok().ok_or(FrameError::InvalidField(name))
    }

    fn remainder(self) -> Bytes {
        Bytes::copy_from_slice(self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            join_ref: Some("1".into()),
            msg_ref: Some("2".into()),
            topic: "pipelines:1:2".into(),
            event: "input:chat:input".into(),
            payload,
        }
    }

    #[test]
    fn test_encode_json_push_as_text_array() {
        let frame = envelope(Payload::Json(json!("hello"))).encode().unwrap();
        assert_eq!(
            frame,
            WireFrame::Text(r#"["1","2","pipelines:1:2","input:chat:input","hello"]"#.into())
        );
    }

    #[test]
    fn test_encode_heartbeat_has_null_join_ref() {
        let frame = Envelope {
            join_ref: None,
            msg_ref: Some("7".into()),
            topic: "phoenix".into(),
            event: HEARTBEAT.into(),
            payload: Payload::Json(json!({})),
        }
        .encode()
        .unwrap();
        assert_eq!(frame, WireFrame::Text(r#"[null,"7","phoenix","heartbeat",{}]"#.into()));
    }

    #[test]
    fn test_encode_binary_push_layout() {
        let frame = envelope(Payload::Binary(Bytes::from_static(&[9, 9])))
            .encode()
            .unwrap();
        let WireFrame::Binary(bytes) = frame else {
            panic!("expected binary frame");
        };
        assert_eq!(&bytes[..5], &[0, 1, 1, 13, 16]);
        assert_eq!(&bytes[5..7], b"12");
        assert_eq!(&bytes[bytes.len() - 2..], &[9, 9]);

        let Frame::Message(decoded) = decode_binary(&bytes).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(decoded.topic, "pipelines:1:2");
        assert_eq!(decoded.event, "input:chat:input");
    }

    #[test]
    fn test_encode_rejects_long_fields() {
        let mut env = envelope(Payload::Binary(Bytes::new()));
        env.topic = "x".repeat(300);
        assert_eq!(env.encode(), Err(FrameError::FieldTooLong("topic")));
    }

    #[test]
    fn test_decode_text_reply() {
        let frame = decode_text(
            r#"["1","1","pipelines:1:2","phx_reply",{"status":"ok","response":{"run":{"id":"r1"}}}]"#,
        )
        .unwrap();
        match frame {
            Frame::Reply { msg_ref, status, response, .. } => {
                assert_eq!(msg_ref.as_deref(), Some("1"));
                assert_eq!(status, "ok");
                assert_eq!(response.as_json().unwrap()["run"]["id"], "r1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_text_broadcast_with_null_refs() {
        let frame = decode_text(
            r#"[null,null,"pipelines:1:2","output:chat:output",{"message":"Hel"}]"#,
        )
        .unwrap();
        let Frame::Message(env) = frame else {
            panic!("expected message");
        };
        assert!(env.join_ref.is_none());
        assert_eq!(env.event, "output:chat:output");
        assert_eq!(env.payload.as_json().unwrap()["message"], "Hel");
    }

    #[test]
    fn test_decode_text_rejects_bad_shapes() {
        assert!(matches!(decode_text("nope"), Err(FrameError::InvalidJson(_))));
        assert_eq!(decode_text(r#"{"a":1}"#), Err(FrameError::NotAnArray));
        assert_eq!(decode_text(r#"[1,2,3]"#), Err(FrameError::NotAnArray));
        assert_eq!(
            decode_text(r#"[null,null,5,"e",{}]"#),
            Err(FrameError::InvalidField("topic"))
        );
        assert_eq!(
            decode_text(r#"[null,"1","t","phx_reply",{}]"#),
            Err(FrameError::InvalidField("status"))
        );
    }

    #[test]
    fn test_decode_binary_broadcast() {
        let mut data = vec![2, 5, 13];
        data.extend_from_slice(b"t:1:2");
        data.extend_from_slice(b"output:tts:au");
        data.extend_from_slice(&[1, 2, 3, 4]);

        let Frame::Message(env) = decode_binary(&data).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(env.topic, "t:1:2");
        assert_eq!(env.event, "output:tts:au");
        assert_eq!(env.payload, Payload::Binary(Bytes::from_static(&[1, 2, 3, 4])));
    }

    #[test]
    fn test_decode_binary_reply() {
        let mut data = vec![1, 1, 1, 1, 2];
        data.extend_from_slice(b"34tok");
        data.extend_from_slice(b"xyz");

        match decode_binary(&data).unwrap() {
            Frame::Reply { join_ref, msg_ref, topic, status, response } => {
                assert_eq!(join_ref.as_deref(), Some("3"));
                assert_eq!(msg_ref.as_deref(), Some("4"));
                assert_eq!(topic, "t");
                assert_eq!(status, "ok");
                assert_eq!(response, Payload::Binary(Bytes::from_static(b"xyz")));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_binary_errors() {
        assert_eq!(decode_binary(&[]), Err(FrameError::Truncated));
        assert_eq!(decode_binary(&[9, 0, 0]), Err(FrameError::UnknownKind(9)));
        assert_eq!(decode_binary(&[2, 10, 1, b'a']), Err(FrameError::Truncated));
        assert_eq!(decode_binary(&[0, 1]), Err(FrameError::Truncated));
    }
}
