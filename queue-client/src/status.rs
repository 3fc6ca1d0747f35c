//! Job status model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::endpoint::Output;
use crate::protocol::{MessageKind, ServerMessage};

/// Status codes, ordered from least to most advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Starting,
    JoiningQueue,
    QueueFull,
    JoinedQueue,
    SendingData,
    Processing,
    Iterating,
    Progress,
    Finished,
    Cancelled,
    Log,
}

impl Status {
    /// Map a message kind to the status it announces.
    pub fn from_kind(kind: MessageKind) -> Option<Status> {
        match kind {
            MessageKind::SendHash => Some(Status::JoiningQueue),
            MessageKind::QueueFull => Some(Status::QueueFull),
            MessageKind::Estimation => Some(Status::JoinedQueue),
            MessageKind::SendData => Some(Status::SendingData),
            MessageKind::ProcessStarts => Some(Status::Processing),
            MessageKind::ProcessGenerating | MessageKind::ProcessStreaming => {
                Some(Status::Iterating)
            }
            MessageKind::Progress => Some(Status::Progress),
            MessageKind::Log => Some(Status::Log),
            MessageKind::ProcessCompleted | MessageKind::ServerStopped => Some(Status::Finished),
            MessageKind::Heartbeat | MessageKind::UnexpectedError | MessageKind::CloseStream => {
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUnit {
    pub index: Option<u64>,
    pub length: Option<u64>,
    pub unit: Option<String>,
    pub progress: Option<f64>,
    pub desc: Option<String>,
}

/// Snapshot of a job's status.
///
/// `rank`, `queue_size` and `eta` are advisory: the server may move a job up
/// and down the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub code: Status,
    pub rank: Option<i64>,
    pub queue_size: Option<i64>,
    pub eta: Option<f64>,
    pub success: Option<bool>,
    pub time: DateTime<Utc>,
    pub progress_data: Option<Vec<ProgressUnit>>,
    /// `(log, level)` of a log message.
    pub log: Option<(String, String)>,
}

impl StatusUpdate {
    pub fn new(code: Status) -> Self {
        Self {
            code,
            rank: None,
            queue_size: None,
            eta: None,
            success: None,
            time: Utc::now(),
            progress_data: None,
            log: None,
        }
    }

    pub fn finished(success: bool) -> Self {
        Self {
            success: Some(success),
            ..Self::new(Status::Finished)
        }
    }

    /// Build the update announced by a server message, if any.
    pub fn from_message(message: &ServerMessage) -> Option<Self> {
        let code = if message.is_server_stopped() {
            Status::Finished
        } else {
            Status::from_kind(message.kind)?
        };
        let raw = &message.raw;
        let progress_data = raw
            .get("progress_data")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value::<Vec<ProgressUnit>>(v.clone()).ok());
        let log = match message.kind {
            MessageKind::Log => Some((
                str_field(raw, "log").unwrap_or_default(),
                str_field(raw, "level").unwrap_or_else(|| "info".to_string()),
            )),
            _ => None,
        };
        let success = match code {
            Status::Finished if message.is_server_stopped() => Some(false),
            _ => raw.get("success").and_then(JsonValue::as_bool),
        };
        Some(Self {
            code,
            rank: raw.get("rank").and_then(JsonValue::as_i64),
            queue_size: raw.get("queue_size").and_then(JsonValue::as_i64),
            eta: raw.get("rank_eta").and_then(JsonValue::as_f64),
            success,
            time: Utc::now(),
            progress_data,
            log,
        })
    }
}

fn str_field(raw: &JsonValue, key: &str) -> Option<String> {
    raw.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// An output observed while the job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputUpdate {
    pub output: Output,
    pub is_final: bool,
}

/// Item of [`crate::Job::updates`].
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Status(StatusUpdate),
    Output(OutputUpdate),
}
