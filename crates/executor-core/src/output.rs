use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Debug,
    Stdout,
    Stderr,
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputChannel::Debug => write!(f, "debug"),
            OutputChannel::Stdout => write!(f, "stdout"),
            OutputChannel::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputLine {
    pub channel: OutputChannel,
    pub text: String,
    pub occurred_at: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(channel: OutputChannel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn debug(text: impl Into<String>) -> Self {
        Self::new(OutputChannel::Debug, text)
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(OutputChannel::Stdout, text)
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(OutputChannel::Stderr, text)
    }
}

/// Producer side of a backend's output queue. Unbounded so readers never
/// stall the execution unit's own writes.
pub type OutputSender = mpsc::UnboundedSender<OutputLine>;
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputLine>;

pub fn output_channel() -> (OutputSender, OutputReceiver) {
    mpsc::unbounded_channel()
}
