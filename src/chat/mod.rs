//! Conversation state for a pipeline run.
//!
//! [`ChatState`] folds content and status events into ordered messages and
//! per-output statuses. Every transition goes through [`ChatState::apply`]
//! with a [`ChatAction`]; the returned [`ChatChange`] tells renderers what
//! moved.
//!
//! Classification is by block name: blocks declared as inputs produce user
//! messages, blocks declared as outputs produce AI messages, anything else is
//! dropped.

pub mod aggregator;
pub mod mention;
pub mod message;
pub mod status;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub use aggregator::{AppendOutcome, MessageLog};
pub use mention::{route_message, RoutedInput};
pub use message::{block_id, Message, MessageId, MessageState, Role};
pub use status::{ChatStatus, OutputStatus, OutputStatusTracker};

/// Declared input or output of a pipeline interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoType {
    /// Block name.
    pub name: String,
    /// Block type, e.g. `text_input` or `audio_output`.
    #[serde(rename = "type", default)]
    pub io_type: String,
}

/// Interface configuration of a pipeline, as delivered in the join ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Blocks whose content is shown as user messages.
    pub inputs: Vec<IoType>,
    /// Blocks whose content is shown as AI messages.
    pub outputs: Vec<IoType>,
    /// Voice inputs, when configured separately.
    pub audio_inputs: Vec<IoType>,
    /// Voice outputs, when configured separately.
    pub audio_outputs: Vec<IoType>,
    /// Free-form description shown above the chat.
    pub description: Option<String>,
    /// Canned prompts.
    pub suggested_messages: Vec<String>,
}

impl InterfaceConfig {
    /// Whether `block` is a declared input.
    pub fn is_input(&self, block: &str) -> bool {
        self.inputs.iter().any(|io| io.name == block)
    }

    /// Whether `block` is a declared output.
    pub fn is_output(&self, block: &str) -> bool {
        self.outputs.iter().any(|io| io.name == block)
    }

    /// The audio input block: first of `audio_inputs`, else the first input
    /// typed `audio_input`.
    pub fn audio_input(&self) -> Option<&IoType> {
        self.audio_inputs
            .first()
            .or_else(|| self.inputs.iter().find(|io| io.io_type == "audio_input"))
    }

    /// The audio output block: first of `audio_outputs`, else the first
    /// output typed `audio_output`.
    pub fn audio_output(&self) -> Option<&IoType> {
        self.audio_outputs
            .first()
            .or_else(|| self.outputs.iter().find(|io| io.io_type == "audio_output"))
    }
}

/// A transition of the chat state.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    /// Run joined; output statuses reset from the interface config.
    Connect(InterfaceConfig),
    /// Session failed.
    Error(String),
    /// User submitted a message.
    SendMessage,
    /// A block started or stopped working.
    StatusChange {
        /// Block name.
        block: String,
        /// New working state.
        is_working: bool,
    },
    /// A content chunk arrived.
    MessageReceive {
        /// Block name.
        block: String,
        /// Output name.
        output: String,
        /// Text chunk.
        chunk: String,
        /// Server `metadata.created_at`, if any.
        created_at: Option<String>,
        /// Local receipt time.
        received_at: DateTime<Utc>,
    },
    /// A block reported errors.
    BlockError {
        /// Block name.
        block: String,
    },
}

/// What an applied action changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatChange {
    /// Nothing.
    Unchanged,
    /// Connected to the run.
    Connected,
    /// Moved to errored.
    Errored,
    /// Status moved to generating after a submission.
    Sent,
    /// A message was created.
    MessageCreated(MessageId),
    /// A chunk was appended to an open message.
    MessageAppended(MessageId),
    /// A declared output changed status, possibly sealing its message.
    Status {
        /// Block name.
        block: String,
        /// The message sealed by this change.
        sealed: Option<MessageId>,
    },
}

/// Messages, output statuses and aggregate status of one chat.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    config: Option<InterfaceConfig>,
    messages: MessageLog,
    outputs: OutputStatusTracker,
    status: ChatStatus,
    error: Option<String>,
}

impl ChatState {
    /// Fresh idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one action.
    pub fn apply(&mut self, action: ChatAction) -> ChatChange {
        match action {
            ChatAction::Connect(config) => {
                self.outputs = OutputStatusTracker::new(config.outputs.iter().map(|io| io.name.clone()));
                self.config = Some(config);
                self.status = ChatStatus::Connected;
                self.error = None;
                ChatChange::Connected
            }
            ChatAction::Error(reason) => {
                self.outputs.force_idle();
                self.status = ChatStatus::Errored;
                self.error = Some(reason);
                ChatChange::Errored
            }
            ChatAction::SendMessage => {
                self.status = ChatStatus::Generating;
                ChatChange::Sent
            }
            ChatAction::StatusChange { block, is_working } => {
                if !self.outputs.set(&block, is_working) {
                    return ChatChange::Unchanged;
                }
                let sealed = if is_working {
                    None
                } else {
                    self.messages.seal(&block)
                };
                if self.status != ChatStatus::Errored {
                    self.status = self.outputs.aggregate();
                }
                ChatChange::Status { block, sealed }
            }
            ChatAction::BlockError { block } => {
                if !self.outputs.set(&block, false) {
                    return ChatChange::Unchanged;
                }
                if self.status != ChatStatus::Errored {
                    self.status = self.outputs.aggregate();
                }
                ChatChange::Status { block, sealed: None }
            }
            ChatAction::MessageReceive {
                block,
                output,
                chunk,
                created_at,
                received_at,
            } => {
                let Some(config) = &self.config else {
                    return ChatChange::Unchanged;
                };
                let at = parse_timestamp(created_at.as_deref(), received_at);
                if config.is_input(&block) {
                    ChatChange::MessageCreated(self.messages.push_user(&block, &output, &chunk, at))
                } else if config.is_output(&block) {
                    match self.messages.append_ai(&block, &output, &chunk, at) {
                        AppendOutcome::Created(id) => ChatChange::MessageCreated(id),
                        AppendOutcome::Appended(id) => ChatChange::MessageAppended(id),
                    }
                } else {
                    log::trace!("[Chat] Dropping content from undeclared block {}", block);
                    ChatChange::Unchanged
                }
            }
        }
    }

    /// Aggregate status.
    pub fn status(&self) -> ChatStatus {
        self.status
    }

    /// Last session error, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Interface config received on connect.
    pub fn config(&self) -> Option<&InterfaceConfig> {
        self.config.as_ref()
    }

    /// The message arena.
    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Per-output statuses.
    pub fn outputs(&self) -> &OutputStatusTracker {
        &self.outputs
    }

    /// Most recent AI message.
    pub fn latest_ai_message(&self) -> Option<&Message> {
        self.messages.latest_ai()
    }

    /// Whether a response is in progress.
    pub fn is_generating(&self) -> bool {
        self.status == ChatStatus::Generating || self.outputs.any_generating()
    }
}

/// Parse a server timestamp as UTC. Accepts RFC 3339 and naive ISO-8601
/// (assumed UTC); anything else yields `fallback`.
pub fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return fallback;
    };
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map_or(fallback, |naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> InterfaceConfig {
        InterfaceConfig {
            inputs: vec![IoType {
                name: "chat".into(),
                io_type: "text_input".into(),
            }],
            outputs: vec![IoType {
                name: "assistant".into(),
                io_type: "text_output".into(),
            }],
            ..InterfaceConfig::default()
        }
    }

    fn content(block: &str, chunk: &str) -> ChatAction {
        ChatAction::MessageReceive {
            block: block.into(),
            output: "output".into(),
            chunk: chunk.into(),
            created_at: None,
            received_at: Utc::now(),
        }
    }

    fn status(block: &str, is_working: bool) -> ChatAction {
        ChatAction::StatusChange {
            block: block.into(),
            is_working,
        }
    }

    #[test]
    fn test_hello_scenario() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(content("assistant", "Hel"));
        chat.apply(content("assistant", "lo"));
        chat.apply(status("assistant", false));

        let messages = chat.messages().to_vec();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Ai);
        assert_eq!(messages[0].text, "Hello");
        assert_eq!(messages[0].state, MessageState::Done);
    }

    #[test]
    fn test_concatenation_for_any_chunking() {
        let text = "The quick brown fox";
        for split in 1..text.len() {
            let mut chat = ChatState::new();
            chat.apply(ChatAction::Connect(config()));
            chat.apply(content("assistant", &text[..split]));
            chat.apply(content("chat", "interleaved user"));
            chat.apply(content("assistant", &text[split..]));
            chat.apply(status("assistant", false));

            let ai: Vec<_> = chat.messages().iter().filter(|m| m.role == Role::Ai).collect();
            assert_eq!(ai.len(), 1);
            assert_eq!(ai[0].text, text);
            assert_eq!(ai[0].state, MessageState::Done);
        }
    }

    #[test]
    fn test_status_without_content_is_noop_on_messages() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        let change = chat.apply(status("assistant", false));

        assert_eq!(
            change,
            ChatChange::Status {
                block: "assistant".into(),
                sealed: None
            }
        );
        assert!(chat.messages().is_empty());
    }

    #[test]
    fn test_working_status_creates_no_message() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(status("assistant", true));

        assert!(chat.messages().is_empty());
        assert_eq!(chat.status(), ChatStatus::Generating);
        assert_eq!(chat.outputs().get("assistant"), Some(OutputStatus::Generating));
        assert!(chat.is_generating());
    }

    #[test]
    fn test_user_inputs_never_merge() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        for _ in 0..3 {
            chat.apply(content("chat", "hi"));
        }
        assert_eq!(chat.messages().len(), 3);
        assert!(chat
            .messages()
            .iter()
            .all(|m| m.role == Role::User && m.state == MessageState::Done));
    }

    #[test]
    fn test_unknown_block_dropped() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        assert_eq!(chat.apply(content("ghost", "boo")), ChatChange::Unchanged);
        assert_eq!(chat.apply(status("ghost", true)), ChatChange::Unchanged);
        assert!(chat.messages().is_empty());
        assert_eq!(chat.status(), ChatStatus::Connected);
    }

    #[test]
    fn test_content_before_connect_is_ignored() {
        let mut chat = ChatState::new();
        assert_eq!(chat.apply(content("assistant", "x")), ChatChange::Unchanged);
    }

    #[test]
    fn test_error_forces_outputs_idle() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(status("assistant", true));
        chat.apply(ChatAction::Error("connection lost".into()));

        assert_eq!(chat.status(), ChatStatus::Errored);
        assert_eq!(chat.error(), Some("connection lost"));
        assert_eq!(chat.outputs().get("assistant"), Some(OutputStatus::Idle));
        assert!(!chat.is_generating());
    }

    #[test]
    fn test_send_then_idle_status_returns_to_connected() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(ChatAction::SendMessage);
        assert!(chat.is_generating());

        chat.apply(status("assistant", true));
        chat.apply(status("assistant", false));
        assert_eq!(chat.status(), ChatStatus::Connected);
    }

    #[test]
    fn test_block_error_returns_output_to_idle() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(status("assistant", true));
        chat.apply(ChatAction::BlockError {
            block: "assistant".into(),
        });
        assert_eq!(chat.outputs().get("assistant"), Some(OutputStatus::Idle));
        assert_eq!(chat.status(), ChatStatus::Connected);
    }

    #[test]
    fn test_server_timestamp_used_when_present() {
        let mut chat = ChatState::new();
        chat.apply(ChatAction::Connect(config()));
        chat.apply(ChatAction::MessageReceive {
            block: "chat".into(),
            output: "input".into(),
            chunk: "hi".into(),
            created_at: Some("2024-05-01T10:00:00".into()),
            received_at: Utc::now(),
        });
        let message = chat.messages().iter().next().unwrap();
        assert_eq!(
            message.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let fallback = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            parse_timestamp(Some("2024-05-01T12:00:00+02:00"), fallback),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            parse_timestamp(Some("2024-05-01 10:00:00.250"), fallback).timestamp_subsec_millis(),
            250
        );
        assert_eq!(parse_timestamp(Some("yesterday"), fallback), fallback);
        assert_eq!(parse_timestamp(None, fallback), fallback);
    }

    #[test]
    fn test_audio_block_lookup() {
        let config: InterfaceConfig = serde_json::from_value(serde_json::json!({
            "inputs": [{"name": "mic", "type": "audio_input"}],
            "outputs": [{"name": "speaker", "type": "audio_output"}]
        }))
        .unwrap();
        assert_eq!(config.audio_input().unwrap().name, "mic");
        assert_eq!(config.audio_output().unwrap().name, "speaker");
        assert!(config.suggested_messages.is_empty());
    }
}
