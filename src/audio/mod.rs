//! Progressive audio playback under backpressure.
//!
//! [`AudioBuffer`] is a pure state machine: feed it [`AudioEvent`]s, execute
//! the [`AudioCommand`]s it returns. It never issues a second append before
//! the previous one completed or failed, and chunks leave in arrival order.
//! [`AudioPump`] runs it against a [`SourceBuffer`] in a tokio task.
//!
//! Voice state:
//!
//! ```text
//!   inactive ──activate──► recording ⇄ listening ──deactivate──► inactive
//! ```
//!
//! `listening` while output is still playing or the input is muted,
//! `recording` once playback reached the buffered end.

pub mod file;
pub mod pump;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::constants::PLAYBACK_END_THRESHOLD;

pub use file::FileSourceBuffer;
pub use pump::AudioPump;

/// Sink that accepts encoded audio one chunk at a time.
#[async_trait]
pub trait SourceBuffer: Send {
    /// Append `chunk`. Resolves once the sink is ready for the next one.
    async fn append(&mut self, chunk: Bytes) -> anyhow::Result<()>;

    /// Playback position and buffered end, for sinks with a playback clock.
    fn progress(&self) -> Option<(Duration, Duration)> {
        None
    }
}

/// Microphone/speaker state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    /// Voice mode off.
    #[default]
    Inactive,
    /// Waiting for the user to speak.
    Recording,
    /// Playing a response, or the input is muted.
    Listening,
}

/// Input to the audio state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// An audio output chunk arrived.
    ChunkArrived(Bytes),
    /// The in-flight append finished.
    AppendComplete,
    /// The in-flight append failed; the chunk is lost.
    AppendFailed(String),
    /// Playback progress report.
    Progress {
        /// Current playback position.
        position: Duration,
        /// End of the buffered range.
        buffered_end: Duration,
    },
    /// Mute state reported by the audio input block.
    Muted(bool),
    /// Voice mode turned on.
    Activate,
    /// Voice mode turned off. Queued chunks are still appended.
    Deactivate,
}

/// Work requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioCommand {
    /// Append this chunk to the source buffer.
    Append(Bytes),
    /// The voice state changed.
    VoiceStateChanged(VoiceState),
}

/// Queue of pending chunks plus the single-append-in-flight flag.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    queue: VecDeque<Bytes>,
    busy: bool,
    active: bool,
    muted: bool,
    playback_ended: bool,
    end_threshold: Duration,
    voice: VoiceState,
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new(PLAYBACK_END_THRESHOLD)
    }
}

impl AudioBuffer {
    /// Create an inactive buffer. Playback counts as ended within
    /// `end_threshold` of the buffered end.
    pub fn new(end_threshold: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            busy: false,
            active: false,
            muted: false,
            playback_ended: true,
            end_threshold,
            voice: VoiceState::Inactive,
        }
    }

    /// Apply one event.
    pub fn handle(&mut self, event: AudioEvent) -> Vec<AudioCommand> {
        let mut commands = Vec::new();
        match event {
            AudioEvent::ChunkArrived(chunk) => {
                log::trace!("[Audio] Queued {} bytes", chunk.len());
                self.queue.push_back(chunk);
                self.playback_ended = false;
            }
            AudioEvent::AppendComplete => {
                if !self.busy {
                    log::debug!("[Audio] Append completion with nothing in flight");
                    return commands;
                }
                self.busy = false;
            }
            AudioEvent::AppendFailed(reason) => {
                if !self.busy {
                    log::debug!("[Audio] Append failure with nothing in flight");
                    return commands;
                }
                log::warn!("[Audio] Append failed, dropping chunk: {}", reason);
                self.busy = false;
            }
            AudioEvent::Progress { position, buffered_end } => {
                self.playback_ended =
                    self.queue.is_empty() && buffered_end.saturating_sub(position) <= self.end_threshold;
            }
            AudioEvent::Muted(muted) => self.muted = muted,
            AudioEvent::Activate => {
                self.active = true;
            }
            AudioEvent::Deactivate => self.active = false,
        }

        if let Some(chunk) = self.next_append() {
            commands.push(AudioCommand::Append(chunk));
        }
        let voice = self.compute_voice_state();
        if voice != self.voice {
            log::debug!("[Audio] Voice state {:?} -> {:?}", self.voice, voice);
            self.voice = voice;
            commands.push(AudioCommand::VoiceStateChanged(voice));
        }
        commands
    }

    fn next_append(&mut self) -> Option<Bytes> {
        if self.busy {
            return None;
        }
        let chunk = self.queue.pop_front()?;
        self.busy = true;
        Some(chunk)
    }

    fn compute_voice_state(&self) -> VoiceState {
        if !self.active {
            VoiceState::Inactive
        } else if !self.playback_ended || self.muted {
            VoiceState::Listening
        } else {
            VoiceState::Recording
        }
    }

    /// Current voice state.
    pub fn voice_state(&self) -> VoiceState {
        self.voice
    }

    /// Whether an append is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Chunks waiting for an append.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether the input is muted.
    pub fn is_muted(&self) -> bool {
        self.muted
    }
}
