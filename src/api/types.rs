//! REST request/response types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logs::LogEntry;

/// Body of `POST /super-api/channel_auth`.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelAuthRequest<'a> {
    /// Socket the token is bound to.
    pub socket_id: &'a str,
    /// Topic being joined.
    pub channel_name: &'a str,
}

/// Token object merged into join params.
pub type ChannelAuthToken = Map<String, Value>;

/// Query of a run log page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogQuery {
    /// Cursor from the previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Restrict to one block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_name: Option<String>,
    /// Page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_page: Option<u32>,
}

/// Pagination metadata of a log page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageMeta {
    /// Cursor for the next older page; `None` once exhausted.
    #[serde(default)]
    pub after: Option<String>,
}

/// One page of run logs, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LogPage {
    /// Entries.
    #[serde(default)]
    pub data: Vec<LogEntry>,
    /// Pagination.
    #[serde(default)]
    pub meta: PageMeta,
}
