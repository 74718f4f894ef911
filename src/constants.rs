//! Application-wide constants for pipeline-run.
//!
//! Wire paths, protocol versions and timing defaults live here so the config
//! layer, the socket and the tests agree on the same values.
//!
//! # Categories
//!
//! - **Server**: REST and socket paths
//! - **Timeouts**: join, heartbeat and HTTP timeouts
//! - **Session**: run start and audio playback thresholds

use std::time::Duration;

// ============================================================================
// Server
// ============================================================================

/// Default server URL when neither config file nor env var sets one.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// Path of the Phoenix socket endpoint, relative to the server URL.
pub const SOCKET_PATH: &str = "/super-api/socket/websocket";

/// Path of the channel authentication endpoint.
pub const CHANNEL_AUTH_PATH: &str = "/super-api/channel_auth";

/// Phoenix serializer version announced in the socket URL.
pub const PROTOCOL_VSN: &str = "2.0.0";

/// Topic used for socket-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for API calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a `phx_join` may stay unacknowledged before the join fails.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between socket heartbeats.
///
/// A heartbeat that is still unanswered when the next one is due marks the
/// connection as failed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Session
// ============================================================================

/// Delay between opening the socket and sending the run join.
pub const START_DELAY: Duration = Duration::from_millis(500);

/// Playback within this distance of the buffered end counts as finished.
pub const PLAYBACK_END_THRESHOLD: Duration = Duration::from_millis(150);

/// Default page size for run log pagination.
pub const LOGS_PER_PAGE: u32 = 20;

/// Nominal bitrate of audio output (128 kbit/s), for sinks without a
/// playback clock.
pub const AUDIO_OUTPUT_BYTES_PER_SEC: u64 = 16_000;

/// Size of the chunks an audio input file is split into before pushing.
pub const AUDIO_INPUT_CHUNK_BYTES: usize = 16 * 1024;
