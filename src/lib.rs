//! Pipeline Run - realtime client for pipeline runs.
//!
//! This crate opens a persistent channel to a running pipeline, pushes user
//! input into it, and turns the multiplexed stream of block events that comes
//! back into conversation state, audio playback and run logs.
//!
//! # Architecture
//!
//! ```text
//!   RunSession ──push──► Transport (PhoenixSocket | LoopbackTransport) ──► server
//!       ▲                      │
//!       │   Subscription       │ output:<block>:<output>, start:/stop:<block>, ...
//!       └──────────────────────┘
//!       │
//!       ├── ChatState        (message aggregation + output status)
//!       ├── SessionUpdate::AudioChunk ──► AudioPump ──► SourceBuffer
//!       └── LogFeed / LogWindow (live + paginated run logs)
//! ```
//!
//! # Modules
//!
//! - [`channel`] - transport trait, Phoenix websocket socket, wire frames
//! - [`session`] - run lifecycle and inbound event dispatch
//! - [`chat`] - message aggregation engine and output status tracker
//! - [`audio`] - audio streaming buffer and voice state machine
//! - [`logs`] - run log reducer and live log feed
//! - [`api`] - REST client for channel auth and log pagination
//! - [`config`] - configuration loading/saving

pub mod api;
pub mod audio;
pub mod channel;
pub mod chat;
pub mod config;
pub mod constants;
pub mod logs;
pub mod session;
pub mod ws;

// Re-export commonly used types
pub use channel::{ConnectionStatus, Payload, PhoenixSocket, Transport};
pub use chat::{ChatState, ChatStatus, InterfaceConfig, Message};
pub use config::Config;
pub use session::{RunSession, RunStatus, SessionUpdate};
