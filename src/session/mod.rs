//! Run session controller.
//!
//! A [`RunSession`] drives one pipeline run over a shared [`Transport`]:
//!
//! ```text
//!   idle ──start_run/join_run──► starting ──ack──► running ──stop_run──► stopped
//!                                   │                 │
//!                                   └──── error ──────┴──► errored
//! ```
//!
//! The session owns all derived state ([`ChatState`], mute flag). Inbound
//! messages are applied synchronously inside [`RunSession::next_update`] or
//! [`RunSession::drain`]; nothing mutates the session behind the caller's
//! back. Stopping drops the topic subscription before `stop_run` returns, so
//! late events never reach a stopped session.

pub mod events;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelError, ConnectionStatus, InboundMessage, Payload, Subscription, Transport};
use crate::chat::{route_message, ChatAction, ChatChange, ChatState, InterfaceConfig, Message};
use crate::constants::START_DELAY;

pub use events::{HistoryEvent, HistoryKind, OutputPayload, RunEvent};

/// Lifecycle of a run session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Nothing started yet.
    #[default]
    Idle,
    /// Connecting and waiting for the join ack.
    Starting,
    /// Joined; pushes are delivered.
    Running,
    /// Stopped by the caller.
    Stopped,
    /// Connection or join failed.
    Errored,
}

/// Front-end the run is started for. Sent as `metadata.interface`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Text chat.
    #[default]
    Webchat,
    /// Voice chat.
    Voice,
}

/// Errors from starting a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// The socket could not be opened or dropped during the join.
    #[error("connection error: {0}")]
    Connection(ChannelError),
    /// The server declined the join; the reason is passed through verbatim.
    #[error("join rejected: {0}")]
    JoinRejected(String),
    /// `start_run` or `join_run` was already called on this session.
    #[error("run already started for this session")]
    AlreadyStarted,
    /// Channel authentication failed.
    #[error("channel authentication failed: {0}")]
    Auth(String),
    /// The session was stopped before the run started.
    #[error("session stopped")]
    Stopped,
}

impl From<ChannelError> for RunError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::JoinRejected(reason) => Self::JoinRejected(reason),
            other => Self::Connection(other),
        }
    }
}

/// Obtains channel join tokens.
#[async_trait]
pub trait ChannelAuthenticator: Send + Sync + std::fmt::Debug {
    /// Authenticate `socket_id` for `channel_name`; the returned object is
    /// merged into the join params.
    async fn authenticate(&self, socket_id: &str, channel_name: &str) -> anyhow::Result<Map<String, Value>>;
}

/// Static settings of a session.
#[derive(Debug, Clone)]
pub struct RunSessionConfig {
    /// Organization owning the pipeline.
    pub organization_id: u64,
    /// Pipeline to run.
    pub pipeline_id: u64,
    /// Front-end kind announced in the join metadata.
    pub interface: InterfaceKind,
    /// Pause between connecting and joining.
    pub start_delay: Duration,
    /// Whether to request a channel token before joining.
    pub use_auth: bool,
    /// Interface used when the join ack carries none.
    pub interface_config: Option<InterfaceConfig>,
}

impl RunSessionConfig {
    /// Defaults for a webchat run of `pipeline_id`.
    pub fn new(organization_id: u64, pipeline_id: u64) -> Self {
        Self {
            organization_id,
            pipeline_id,
            interface: InterfaceKind::Webchat,
            start_delay: START_DELAY,
            use_auth: false,
            interface_config: None,
        }
    }
}

/// One initial input value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialInput {
    /// Input block name.
    pub name: String,
    /// Value.
    pub value: String,
}

/// Arguments of [`RunSession::start_run`].
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    /// Human-readable run alias.
    pub alias: Option<String>,
    /// Values pushed into inputs when the run starts.
    pub initial_inputs: Vec<InitialInput>,
    /// Extra join metadata; `interface` is filled in by the session.
    pub metadata: Map<String, Value>,
}

/// Arguments of [`RunSession::join_run`].
#[derive(Debug, Clone, Default)]
pub struct JoinArgs {
    /// Existing run to join.
    pub run_id: String,
    /// Same fields as a fresh start.
    pub start: StartArgs,
}

/// Pipeline summary from the join ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineInfo {
    /// Pipeline id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Owning organization.
    pub organization_id: u64,
}

/// Something the caller may want to render.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// The chat state changed.
    Chat(ChatChange),
    /// A block started or stopped working.
    Status {
        /// Block name.
        block: String,
        /// New working state.
        is_working: bool,
        /// Effect on the chat.
        change: ChatChange,
    },
    /// A block reported errors.
    BlockError {
        /// Block name.
        block: String,
        /// Error messages.
        errors: Vec<String>,
    },
    /// History of a joined run was replayed into the chat.
    History {
        /// Number of entries applied.
        replayed: usize,
    },
    /// Audio output bytes for playback.
    AudioChunk {
        /// Audio output block.
        block: String,
        /// Encoded audio.
        chunk: Bytes,
    },
    /// The audio input block reported its mute state.
    InputMuted(bool),
    /// The session status changed.
    Run(RunStatus),
}

/// Cancels a session from outside, including while `start_run` is pending.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    /// Request the stop. The session finishes it on its next step: a pending
    /// `start_run`, `next_update` or `drain`.
    pub fn stop(&self) {
        self.0.cancel();
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        self.0.cancelled().await;
    }
}

/// Join topic of a pipeline, or of one run when `run_id` is given.
pub fn run_topic(organization_id: u64, pipeline_id: u64, run_id: Option<&str>) -> String {
    match run_id {
        Some(run) => format!("pipelines:{organization_id}:{pipeline_id}:{run}"),
        None => format!("pipelines:{organization_id}:{pipeline_id}"),
    }
}

/// Controller of one pipeline run.
#[derive(Debug)]
pub struct RunSession {
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn ChannelAuthenticator>>,
    config: RunSessionConfig,
    status: RunStatus,
    started: bool,
    run_id: Option<String>,
    alias: Option<String>,
    topic: Option<String>,
    pipeline: Option<PipelineInfo>,
    subscription: Option<Subscription>,
    connection: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    chat: ChatState,
    input_muted: bool,
}

enum Wake {
    Stopped,
    Connection(bool),
    Message(Option<InboundMessage>),
}

impl RunSession {
    /// Create an idle session on `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: RunSessionConfig) -> Self {
        let connection = transport.status_watch();
        Self {
            transport,
            authenticator: None,
            config,
            status: RunStatus::Idle,
            started: false,
            run_id: None,
            alias: None,
            topic: None,
            pipeline: None,
            subscription: None,
            connection,
            cancel: CancellationToken::new(),
            chat: ChatState::new(),
            input_muted: false,
        }
    }

    /// Use `authenticator` for channel tokens when `use_auth` is set.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn ChannelAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Handle that stops this session from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.cancel.clone())
    }

    /// Start a fresh run.
    pub async fn start_run(&mut self, args: StartArgs) -> Result<(), RunError> {
        let topic = run_topic(self.config.organization_id, self.config.pipeline_id, None);
        self.begin(topic, args).await
    }

    /// Join an existing run.
    pub async fn join_run(&mut self, args: JoinArgs) -> Result<(), RunError> {
        let topic = run_topic(
            self.config.organization_id,
            self.config.pipeline_id,
            Some(&args.run_id),
        );
        self.run_id = Some(args.run_id);
        self.begin(topic, args.start).await
    }

    async fn begin(&mut self, topic: String, args: StartArgs) -> Result<(), RunError> {
        if self.started {
            return Err(RunError::AlreadyStarted);
        }
        self.started = true;
        if self.cancel.is_cancelled() {
            self.status = RunStatus::Stopped;
            return Err(RunError::Stopped);
        }

        log::info!("[Session] Starting run on {}", topic);
        self.status = RunStatus::Starting;
        self.alias.clone_from(&args.alias);

        let authenticator = match (self.config.use_auth, &self.authenticator) {
            (false, _) => None,
            (true, Some(authenticator)) => Some(Arc::clone(authenticator)),
            (true, None) => {
                let err = RunError::Auth("no channel authenticator configured".to_string());
                log::warn!("[Session] Run failed to start: {}", err);
                self.fail(&err.to_string());
                return Err(err);
            }
        };

        self.subscription = Some(self.transport.subscribe(&topic));
        self.topic = Some(topic.clone());
        let params = self.join_params(&args);
        let cancel = self.cancel.clone();
        let establish = establish(
            Arc::clone(&self.transport),
            authenticator,
            topic,
            params,
            self.config.start_delay,
        );

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RunError::Stopped),
            result = establish => result,
        };

        match result {
            Ok(ack) => {
                self.on_joined(&ack);
                Ok(())
            }
            Err(RunError::Stopped) => {
                log::info!("[Session] Stopped while starting");
                self.stop_run().await;
                Err(RunError::Stopped)
            }
            Err(err) => {
                log::warn!("[Session] Run failed to start: {}", err);
                let reason = match &err {
                    RunError::JoinRejected(reason) => reason.clone(),
                    other => other.to_string(),
                };
                self.fail(&reason);
                if let Some(topic) = &self.topic {
                    self.transport.leave(topic).await;
                }
                Err(err)
            }
        }
    }

    fn join_params(&self, args: &StartArgs) -> Value {
        let mut metadata = args.metadata.clone();
        metadata.insert("interface".to_string(), json!(self.config.interface));
        let mut params = Map::new();
        if let Some(alias) = &args.alias {
            params.insert("alias".to_string(), json!(alias));
        }
        params.insert("initial_inputs".to_string(), json!(args.initial_inputs));
        params.insert("metadata".to_string(), Value::Object(metadata));
        Value::Object(params)
    }

    fn on_joined(&mut self, ack: &Value) {
        let run = ack.get("run");
        if let Some(id) = run.and_then(|r| r.get("id")) {
            self.run_id = Some(match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }
        self.pipeline = ack
            .get("pipeline")
            .and_then(|p| PipelineInfo::deserialize(p).ok());

        let interface = run
            .and_then(|r| r.get("interface_config"))
            .and_then(|c| match InterfaceConfig::deserialize(c) {
                Ok(config) => Some(config),
                Err(e) => {
                    log::warn!("[Session] Ignoring malformed interface config: {}", e);
                    None
                }
            })
            .or_else(|| self.config.interface_config.clone())
            .unwrap_or_default();

        self.chat.apply(ChatAction::Connect(interface));
        self.status = RunStatus::Running;
        log::info!(
            "[Session] Run {} running",
            self.run_id.as_deref().unwrap_or("(unassigned)")
        );
    }

    fn fail(&mut self, reason: &str) {
        self.subscription = None;
        self.status = RunStatus::Errored;
        self.chat.apply(ChatAction::Error(reason.to_string()));
    }

    /// Stop the run. Always ends in [`RunStatus::Stopped`].
    pub async fn stop_run(&mut self) {
        self.cancel.cancel();
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(topic) = &self.topic {
            self.transport.leave(topic).await;
        }
        if self.status != RunStatus::Stopped {
            log::info!("[Session] Run stopped");
        }
        self.status = RunStatus::Stopped;
    }

    /// Push `payload` to `input:<topic>`. A no-op unless running.
    pub fn push(&self, topic: &str, payload: Payload) -> bool {
        let Some(run_topic) = self.topic.as_deref().filter(|_| self.status == RunStatus::Running) else {
            log::debug!("[Session] Ignoring push to {} while {:?}", topic, self.status);
            return false;
        };
        self.transport.push(run_topic, &format!("input:{topic}"), payload);
        true
    }

    /// Submit a chat message, routing `@mentions` to input blocks.
    ///
    /// Returns the number of pushes sent.
    pub fn push_message(&mut self, text: &str) -> usize {
        if self.status != RunStatus::Running {
            log::debug!("[Session] Ignoring message while {:?}", self.status);
            return 0;
        }
        let inputs = self.chat.config().map(|c| c.inputs.clone()).unwrap_or_default();
        let routed = route_message(text, &inputs);
        for input in &routed {
            self.push(&format!("{}:input", input.block), Payload::Json(Value::String(input.text.clone())));
        }
        if !routed.is_empty() {
            self.chat.apply(ChatAction::SendMessage);
        }
        routed.len()
    }

    /// Push recorded audio to the audio input block.
    pub fn push_audio(&self, chunk: Bytes) -> bool {
        let Some(input) = self.chat.config().and_then(InterfaceConfig::audio_input) else {
            log::debug!("[Session] No audio input declared, dropping {} bytes", chunk.len());
            return false;
        };
        self.push(&format!("{}:input", input.name), Payload::Binary(chunk))
    }

    /// Wait for the next update. Returns `None` once the session has no live
    /// subscription (never started, stopped or errored).
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        loop {
            if self.cancel.is_cancelled() {
                self.stop_run().await;
                return None;
            }
            let wake = {
                let subscription = self.subscription.as_mut()?;
                let connection = &mut self.connection;
                let cancel = &self.cancel;
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Wake::Stopped,
                    changed = connection.changed() => Wake::Connection(changed.is_ok()),
                    message = subscription.recv() => Wake::Message(message),
                }
            };

            match wake {
                Wake::Stopped => {
                    self.stop_run().await;
                    return None;
                }
                Wake::Connection(alive) => {
                    if let Some(update) = self.check_connection(alive) {
                        return Some(update);
                    }
                    if !alive {
                        return None;
                    }
                }
                Wake::Message(Some(message)) => {
                    if let Some(update) = self.apply_message(&message) {
                        return Some(update);
                    }
                }
                Wake::Message(None) => return None,
            }
        }
    }

    /// Apply everything already queued without waiting.
    pub fn drain(&mut self) -> Vec<SessionUpdate> {
        if self.cancel.is_cancelled() {
            self.finish_stop();
            return Vec::new();
        }
        let mut updates = Vec::new();
        match self.connection.has_changed() {
            Ok(true) => updates.extend(self.check_connection(true)),
            Ok(false) => {}
            Err(_) => updates.extend(self.check_connection(false)),
        }
        while let Some(message) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            updates.extend(self.apply_message(&message));
        }
        updates
    }

    /// Complete a stop requested through a [`StopHandle`] without awaiting.
    /// The leave is sent from a spawned task when a runtime is available.
    fn finish_stop(&mut self) {
        self.subscription = None;
        if self.status == RunStatus::Stopped {
            return;
        }
        self.status = RunStatus::Stopped;
        log::info!("[Session] Run stopped");
        match (self.topic.clone(), tokio::runtime::Handle::try_current()) {
            (Some(topic), Ok(runtime)) => {
                let transport = Arc::clone(&self.transport);
                runtime.spawn(async move { transport.leave(&topic).await });
            }
            (Some(topic), Err(_)) => log::debug!("[Session] No runtime, not leaving {}", topic),
            (None, _) => {}
        }
    }

    fn check_connection(&mut self, alive: bool) -> Option<SessionUpdate> {
        let status = if alive {
            self.connection.borrow_and_update().clone()
        } else {
            ConnectionStatus::Closed
        };
        if self.status != RunStatus::Running || !status.is_down() {
            return None;
        }
        let reason = match status {
            ConnectionStatus::Error(reason) => reason,
            _ => "connection closed".to_string(),
        };
        log::warn!("[Session] Connection lost: {}", reason);
        self.fail(&reason);
        Some(SessionUpdate::Run(RunStatus::Errored))
    }

    fn apply_message(&mut self, message: &InboundMessage) -> Option<SessionUpdate> {
        let event = match events::decode(message) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("[Session] Dropping event: {}", e);
                return None;
            }
        };

        match event {
            RunEvent::Output { block, output, payload } => self.apply_output(block, output, payload),
            RunEvent::Status { block, is_working } => {
                let change = self.chat.apply(ChatAction::StatusChange {
                    block: block.clone(),
                    is_working,
                });
                Some(SessionUpdate::Status {
                    block,
                    is_working,
                    change,
                })
            }
            RunEvent::BlockError { block, errors } => {
                log::warn!("[Session] Block {} reported errors: {:?}", block, errors);
                self.chat.apply(ChatAction::BlockError { block: block.clone() });
                Some(SessionUpdate::BlockError { block, errors })
            }
            RunEvent::History(entries) => {
                let replayed = self.replay_history(entries);
                Some(SessionUpdate::History { replayed })
            }
            RunEvent::ChannelClosed { reason } => {
                if self.status != RunStatus::Running {
                    return None;
                }
                log::warn!("[Session] Channel closed by server ({})", reason);
                self.fail(&reason);
                Some(SessionUpdate::Run(RunStatus::Errored))
            }
            RunEvent::Ignored => None,
        }
    }

    fn apply_output(&mut self, block: String, output: String, payload: OutputPayload) -> Option<SessionUpdate> {
        let config = self.chat.config();
        let audio_in = config.and_then(InterfaceConfig::audio_input).map(|io| io.name.as_str());
        let audio_out = config.and_then(InterfaceConfig::audio_output).map(|io| io.name.as_str());

        match payload {
            OutputPayload::Binary(chunk) => {
                if audio_out == Some(block.as_str()) {
                    Some(SessionUpdate::AudioChunk { block, chunk })
                } else {
                    log::trace!("[Session] Ignoring binary output of {}", block);
                    None
                }
            }
            OutputPayload::Text { message, created_at } => {
                if audio_in == Some(block.as_str()) && matches!(message.as_str(), "muted" | "unmuted") {
                    self.input_muted = message == "muted";
                    return Some(SessionUpdate::InputMuted(self.input_muted));
                }
                let change = self.chat.apply(ChatAction::MessageReceive {
                    block,
                    output,
                    chunk: message,
                    created_at,
                    received_at: Utc::now(),
                });
                (change != ChatChange::Unchanged).then_some(SessionUpdate::Chat(change))
            }
            OutputPayload::Json(value) => {
                log::trace!("[Session] Ignoring structured output of {}: {}", block, value);
                None
            }
        }
    }

    fn replay_history(&mut self, entries: Vec<HistoryEvent>) -> usize {
        let mut replayed = 0;
        for entry in entries {
            let action = match entry.kind {
                HistoryKind::StartStream | HistoryKind::StopStream => ChatAction::StatusChange {
                    block: entry.block,
                    is_working: entry.kind == HistoryKind::StartStream,
                },
                HistoryKind::Text => {
                    let Some(chunk) = entry.message.as_ref().and_then(Value::as_str) else {
                        log::warn!("[Session] History text entry for {} has no message", entry.block);
                        continue;
                    };
                    ChatAction::MessageReceive {
                        chunk: chunk.to_string(),
                        block: entry.block,
                        output: entry.io,
                        created_at: entry.created_at,
                        received_at: Utc::now(),
                    }
                }
                HistoryKind::Binary => continue,
            };
            if self.chat.apply(action) != ChatChange::Unchanged {
                replayed += 1;
            }
        }
        log::debug!("[Session] Replayed {} history entries", replayed);
        replayed
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Server-assigned run id.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Alias given at start.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Joined topic.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Pipeline summary from the join ack.
    pub fn pipeline(&self) -> Option<&PipelineInfo> {
        self.pipeline.as_ref()
    }

    /// Chat state.
    pub fn chat(&self) -> &ChatState {
        &self.chat
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> Vec<Message> {
        self.chat.messages().to_vec()
    }

    /// Most recent AI message.
    pub fn latest_ai_message(&self) -> Option<&Message> {
        self.chat.latest_ai_message()
    }

    /// Whether a response is in progress.
    pub fn is_generating(&self) -> bool {
        self.chat.is_generating()
    }

    /// Last mute state reported by the audio input.
    pub fn input_muted(&self) -> bool {
        self.input_muted
    }

    /// Settings of this session.
    pub fn config(&self) -> &RunSessionConfig {
        &self.config
    }
}

/// Connect, wait the start delay, authenticate and join.
async fn establish(
    transport: Arc<dyn Transport>,
    authenticator: Option<Arc<dyn ChannelAuthenticator>>,
    topic: String,
    mut params: Value,
    start_delay: Duration,
) -> Result<Value, RunError> {
    transport.connect().await.map_err(RunError::Connection)?;

    if !start_delay.is_zero() {
        tokio::time::sleep(start_delay).await;
    }

    if let Some(authenticator) = authenticator {
        let token = authenticator
            .authenticate(transport.socket_id(), &topic)
            .await
            .map_err(|e| RunError::Auth(format!("{e:#}")))?;
        if let Value::Object(map) = &mut params {
            map.extend(token);
        }
    }

    Ok(transport.join(&topic, params).await?)
}
