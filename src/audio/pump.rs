//! Async driver for [`AudioBuffer`].

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{AudioBuffer, AudioCommand, AudioEvent, SourceBuffer, VoiceState};

type InFlight<S> = BoxFuture<'static, (S, anyhow::Result<()>)>;

/// Runs an [`AudioBuffer`] against a [`SourceBuffer`] in a background task.
///
/// Appends complete inside the task and are fed back to the buffer. Dropping
/// every event sender (see [`AudioPump::finish`]) lets the task flush the
/// queue and hand the sink back.
#[derive(Debug)]
pub struct AudioPump<S> {
    events: mpsc::UnboundedSender<AudioEvent>,
    voice: watch::Receiver<VoiceState>,
    task: JoinHandle<S>,
}

impl<S: SourceBuffer + 'static> AudioPump<S> {
    /// Spawn the pump task. Must be called from a tokio runtime.
    pub fn spawn(buffer: AudioBuffer, sink: S) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (voice_tx, voice) = watch::channel(buffer.voice_state());
        let task = tokio::spawn(run_pump(buffer, sink, rx, voice_tx));
        Self { events, voice, task }
    }

    /// Feed an event. Returns `false` if the task is gone.
    pub fn send(&self, event: AudioEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Queue an audio chunk for playback.
    pub fn push_chunk(&self, chunk: Bytes) -> bool {
        self.send(AudioEvent::ChunkArrived(chunk))
    }

    /// Current voice state.
    pub fn voice_state(&self) -> VoiceState {
        *self.voice.borrow()
    }

    /// Receiver notified on voice state changes.
    pub fn voice_watch(&self) -> watch::Receiver<VoiceState> {
        self.voice.clone()
    }

    /// Flush queued chunks and return the sink.
    pub async fn finish(self) -> anyhow::Result<S> {
        drop(self.events);
        Ok(self.task.await?)
    }
}

enum Sink<S> {
    Idle(S),
    Appending(InFlight<S>),
}

async fn run_pump<S: SourceBuffer + 'static>(
    mut buffer: AudioBuffer,
    sink: S,
    mut events: mpsc::UnboundedReceiver<AudioEvent>,
    voice: watch::Sender<VoiceState>,
) -> S {
    let mut sink = Sink::Idle(sink);
    let mut events_open = true;

    loop {
        if !events_open {
            sink = match sink {
                Sink::Idle(idle) => return idle,
                appending @ Sink::Appending(_) => appending,
            };
        }

        let commands = tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => buffer.handle(event),
                None => {
                    log::debug!("[Audio] Event channel closed, flushing {} chunks", buffer.queued());
                    events_open = false;
                    continue;
                }
            },
            (idle, result) = async {
                match &mut sink {
                    Sink::Appending(append) => append.await,
                    Sink::Idle(_) => std::future::pending().await,
                }
            }, if matches!(sink, Sink::Appending(_)) => {
                let progress = idle.progress();
                sink = Sink::Idle(idle);
                let mut commands = match result {
                    Ok(()) => buffer.handle(AudioEvent::AppendComplete),
                    Err(e) => buffer.handle(AudioEvent::AppendFailed(format!("{e:#}"))),
                };
                // Only meaningful once nothing else is in flight.
                if let Some((position, buffered_end)) = progress.filter(|_| !buffer.is_busy()) {
                    commands.extend(buffer.handle(AudioEvent::Progress { position, buffered_end }));
                }
                commands
            }
        };

        for command in commands {
            match command {
                AudioCommand::Append(chunk) => {
                    sink = match sink {
                        Sink::Idle(mut idle) => Sink::Appending(Box::pin(async move {
                            let result = idle.append(chunk).await;
                            (idle, result)
                        })),
                        appending @ Sink::Appending(_) => {
                            log::error!("[Audio] Append requested while another is in flight");
                            appending
                        }
                    };
                }
                AudioCommand::VoiceStateChanged(state) => {
                    voice.send_replace(state);
                }
            }
        }
    }
}
