//! Message aggregation engine.
//!
//! Messages live in an arena keyed by id with a separate insertion-order list.
//! `open_by_block` points at the single `generating` message of each block,
//! so appending a chunk never scans or clones the conversation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::message::{Message, MessageId, MessageState, Role};

/// Result of applying one output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// No open message for the block; a new one was created.
    Created(MessageId),
    /// The chunk was appended to the block's open message.
    Appended(MessageId),
}

impl AppendOutcome {
    /// Id of the message that received the chunk.
    pub fn id(self) -> MessageId {
        match self {
            Self::Created(id) | Self::Appended(id) => id,
        }
    }
}

/// Ordered conversation arena.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    by_id: HashMap<MessageId, Message>,
    order: Vec<MessageId>,
    open_by_block: HashMap<String, MessageId>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.order.push(id);
        self.by_id.insert(id, message);
        id
    }

    /// Record a user message. User messages are never merged.
    pub fn push_user(
        &mut self,
        block_name: &str,
        output_name: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> MessageId {
        self.insert(Message::user(block_name, output_name, text, created_at))
    }

    /// Append an output chunk to the block's open message, opening one if
    /// there is none.
    pub fn append_ai(
        &mut self,
        block_name: &str,
        output_name: &str,
        chunk: &str,
        created_at: DateTime<Utc>,
    ) -> AppendOutcome {
        if let Some(id) = self.open_by_block.get(block_name).copied() {
            if let Some(message) = self.by_id.get_mut(&id) {
                message.text.push_str(chunk);
                return AppendOutcome::Appended(id);
            }
        }

        let id = self.insert(Message::ai(block_name, output_name, chunk, created_at));
        self.open_by_block.insert(block_name.to_string(), id);
        AppendOutcome::Created(id)
    }

    /// Seal the block's open message. No-op when none is open.
    pub fn seal(&mut self, block_name: &str) -> Option<MessageId> {
        let id = self.open_by_block.remove(block_name)?;
        let message = self.by_id.get_mut(&id)?;
        message.state = MessageState::Done;
        Some(id)
    }

    /// Look up a message.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.by_id.get(&id)
    }

    /// Messages in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    /// Owned snapshot in arrival order.
    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Most recent AI message.
    pub fn latest_ai(&self) -> Option<&Message> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.by_id.get(id))
            .find(|m| m.role == Role::Ai)
    }

    /// Open message of a block, if any.
    pub fn open_for(&self, block_name: &str) -> Option<&Message> {
        self.open_by_block
            .get(block_name)
            .and_then(|id| self.by_id.get(id))
    }

    /// Number of `generating` messages.
    pub fn open_count(&self) -> usize {
        self.by_id.values().filter(|m| m.is_open()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_chunks_merge_into_one_message() {
        let mut log = MessageLog::new();
        let first = log.append_ai("assistant", "output", "Hel", now());
        let second = log.append_ai("assistant", "output", "lo", now());

        assert!(matches!(first, AppendOutcome::Created(_)));
        assert_eq!(second, AppendOutcome::Appended(first.id()));
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(first.id()).unwrap().text, "Hello");
    }

    #[test]
    fn test_seal_then_new_chunk_opens_new_message() {
        let mut log = MessageLog::new();
        let first = log.append_ai("assistant", "output", "one", now()).id();
        assert_eq!(log.seal("assistant"), Some(first));
        let second = log.append_ai("assistant", "output", "two", now()).id();

        assert_ne!(first, second);
        assert_eq!(log.get(first).unwrap().state, MessageState::Done);
        assert_eq!(log.get(second).unwrap().state, MessageState::Generating);
    }

    #[test]
    fn test_seal_without_open_message_is_noop() {
        let mut log = MessageLog::new();
        log.push_user("chat", "input", "hi", now());
        let before = log.to_vec();

        assert_eq!(log.seal("assistant"), None);
        assert_eq!(log.to_vec(), before);
    }

    #[test]
    fn test_user_messages_never_merge() {
        let mut log = MessageLog::new();
        for text in ["a", "b", "c"] {
            log.push_user("chat", "input", text, now());
        }
        let texts: Vec<_> = log.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert!(log.iter().all(|m| m.state == MessageState::Done && m.role == Role::User));
    }

    #[test]
    fn test_interleaved_blocks_keep_separate_open_messages() {
        let mut log = MessageLog::new();
        log.append_ai("a", "output", "1", now());
        log.append_ai("b", "output", "x", now());
        log.append_ai("a", "output", "2", now());
        log.append_ai("b", "output", "y", now());

        assert_eq!(log.open_count(), 2);
        assert_eq!(log.open_for("a").unwrap().text, "12");
        assert_eq!(log.open_for("b").unwrap().text, "xy");
        let order: Vec<_> = log.iter().map(|m| m.block_name.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
    }

    #[test]
    fn test_latest_ai_skips_user_messages() {
        let mut log = MessageLog::new();
        log.append_ai("assistant", "output", "answer", now());
        log.push_user("chat", "input", "question", now());

        assert_eq!(log.latest_ai().unwrap().text, "answer");
    }

    #[test]
    fn test_block_id_combines_names() {
        let mut log = MessageLog::new();
        let id = log.append_ai("assistant", "output", "x", now()).id();
        assert_eq!(log.get(id).unwrap().block_id, "assistant:output");
    }
}
