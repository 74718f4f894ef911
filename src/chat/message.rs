//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable client-generated message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(uuid::Uuid);

impl MessageId {
    /// Generate a fresh id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Text pushed into an input block.
    User,
    /// Output streamed by an output block.
    Ai,
}

/// Lifecycle of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Still receiving chunks.
    Generating,
    /// Sealed; never changes again.
    Done,
}

/// One discrete conversational message.
#[allow(missing_docs, reason = "self-describing fields")]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    /// Block that produced (or received) the text.
    pub block_name: String,
    pub output_name: String,
    /// `<block_name>:<output_name>`.
    pub block_id: String,
    /// Content; grows while the message is open.
    pub text: String,
    /// Server timestamp when supplied, else receipt time.
    pub created_at: DateTime<Utc>,
    pub state: MessageState,
}

impl Message {
    /// A complete user message.
    pub fn user(block_name: &str, output_name: &str, text: &str, created_at: DateTime<Utc>) -> Self {
        Self::build(Role::User, MessageState::Done, block_name, output_name, text, created_at)
    }

    /// An open AI message seeded with its first chunk.
    pub fn ai(block_name: &str, output_name: &str, chunk: &str, created_at: DateTime<Utc>) -> Self {
        Self::build(Role::Ai, MessageState::Generating, block_name, output_name, chunk, created_at)
    }

    fn build(
        role: Role,
        state: MessageState,
        block_name: &str,
        output_name: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role,
            block_name: block_name.to_string(),
            output_name: output_name.to_string(),
            block_id: block_id(block_name, output_name),
            text: text.to_string(),
            created_at,
            state,
        }
    }

    /// Whether the message still accepts chunks.
    pub fn is_open(&self) -> bool {
        self.state == MessageState::Generating
    }
}

/// Identifier of a block's named input or output.
pub fn block_id(block_name: &str, io_name: &str) -> String {
    format!("{block_name}:{io_name}")
}
