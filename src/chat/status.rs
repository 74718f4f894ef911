//! Output status tracker.

use std::collections::BTreeMap;

use serde::Serialize;

/// Status of one declared output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    /// Not producing output.
    Idle,
    /// Producing output.
    Generating,
}

/// Aggregate status of the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    /// Not connected to a run yet.
    #[default]
    Idle,
    /// Connected, nothing generating.
    Connected,
    /// At least one output is generating, or a message was just sent.
    Generating,
    /// The session failed.
    Errored,
}

/// Declared output name → status. Keys are fixed at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStatusTracker {
    statuses: BTreeMap<String, OutputStatus>,
}

impl OutputStatusTracker {
    /// Track `names`, all idle.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statuses: names
                .into_iter()
                .map(|name| (name.into(), OutputStatus::Idle))
                .collect(),
        }
    }

    /// Set the status of exactly `block`. Returns `false` for undeclared
    /// blocks, which are left untouched.
    pub fn set(&mut self, block: &str, is_working: bool) -> bool {
        let Some(status) = self.statuses.get_mut(block) else {
            return false;
        };
        *status = if is_working {
            OutputStatus::Generating
        } else {
            OutputStatus::Idle
        };
        true
    }

    /// Force every output idle.
    pub fn force_idle(&mut self) {
        for status in self.statuses.values_mut() {
            *status = OutputStatus::Idle;
        }
    }

    /// Status of one block.
    pub fn get(&self, block: &str) -> Option<OutputStatus> {
        self.statuses.get(block).copied()
    }

    /// Whether `block` is declared.
    pub fn contains(&self, block: &str) -> bool {
        self.statuses.contains_key(block)
    }

    /// Whether any output is generating.
    pub fn any_generating(&self) -> bool {
        self.statuses.values().any(|s| *s == OutputStatus::Generating)
    }

    /// Aggregate of the tracked outputs.
    pub fn aggregate(&self) -> ChatStatus {
        if self.any_generating() {
            ChatStatus::Generating
        } else {
            ChatStatus::Connected
        }
    }

    /// All entries, sorted by block name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, OutputStatus)> + '_ {
        self.statuses.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
