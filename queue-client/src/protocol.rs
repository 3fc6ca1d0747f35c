//! Protocol variants and server message classification.
//!
//! The remote side has gone through several queue protocols. They are modelled
//! as one closed enum so every stage (submit, classify, cancel) dispatches with
//! a single `match`.

use std::fmt;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::error::{ClientError, ClientResult};

/// Text the server puts in `message` when it shuts down under running jobs.
pub const SERVER_STOPPED_MESSAGE: &str = "Server stopped unexpectedly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Queue disabled: one blocking request/response per call.
    Legacy,
    /// One stream per job, opened before the payload is sent.
    SseV0,
    SseV1,
    /// Generator outputs after the first are sent as diffs.
    SseV2,
    /// As v2, output files are tagged with `meta._type`.
    SseV2_1,
    /// Long-lived stream shared by every job of the session.
    SseV3,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Legacy => "ws",
            Protocol::SseV0 => "sse",
            Protocol::SseV1 => "sse_v1",
            Protocol::SseV2 => "sse_v2",
            Protocol::SseV2_1 => "sse_v2.1",
            Protocol::SseV3 => "sse_v3",
        }
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self, Protocol::Legacy)
    }

    /// Jobs share the client's demultiplexed stream.
    pub fn uses_shared_stream(&self) -> bool {
        matches!(
            self,
            Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3
        )
    }

    /// The shared stream is closed as soon as no job awaits a terminal message.
    pub fn closes_when_drained(&self) -> bool {
        matches!(self, Protocol::SseV1 | Protocol::SseV2 | Protocol::SseV2_1)
    }

    pub fn applies_diffs(&self) -> bool {
        matches!(self, Protocol::SseV2 | Protocol::SseV2_1 | Protocol::SseV3)
    }

    /// Output file objects must carry `meta._type` to be downloaded.
    pub fn requires_file_meta(&self) -> bool {
        matches!(self, Protocol::SseV2_1)
    }

    /// Relative route of the event stream.
    pub fn stream_route(&self) -> &'static str {
        match self {
            Protocol::SseV0 => "queue/join",
            _ => "queue/data",
        }
    }

    /// Relative route the payload is posted to.
    pub fn data_route(&self) -> &'static str {
        match self {
            Protocol::SseV0 => "queue/data",
            _ => "queue/join",
        }
    }
}

impl FromStr for Protocol {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ws" => Ok(Protocol::Legacy),
            "sse" => Ok(Protocol::SseV0),
            "sse_v1" => Ok(Protocol::SseV1),
            "sse_v2" => Ok(Protocol::SseV2),
            "sse_v2.1" => Ok(Protocol::SseV2_1),
            "sse_v3" => Ok(Protocol::SseV3),
            other => Err(ClientError::Config(format!("Unsupported protocol: {}", other))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `msg` discriminator of a server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SendHash,
    QueueFull,
    Estimation,
    SendData,
    ProcessStarts,
    ProcessGenerating,
    ProcessStreaming,
    ProcessCompleted,
    Log,
    Progress,
    Heartbeat,
    ServerStopped,
    UnexpectedError,
    CloseStream,
}

impl MessageKind {
    pub fn parse(msg: &str) -> Option<Self> {
        let kind = match msg {
            "send_hash" => MessageKind::SendHash,
            "queue_full" => MessageKind::QueueFull,
            "estimation" => MessageKind::Estimation,
            "send_data" => MessageKind::SendData,
            "process_starts" => MessageKind::ProcessStarts,
            "process_generating" => MessageKind::ProcessGenerating,
            "process_streaming" => MessageKind::ProcessStreaming,
            "process_completed" => MessageKind::ProcessCompleted,
            "log" => MessageKind::Log,
            "progress" => MessageKind::Progress,
            "heartbeat" => MessageKind::Heartbeat,
            "server_stopped" => MessageKind::ServerStopped,
            "unexpected_error" => MessageKind::UnexpectedError,
            "close_stream" => MessageKind::CloseStream,
            _ => return None,
        };
        Some(kind)
    }
}

/// One decoded `data:` record from an event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    pub kind: MessageKind,
    pub event_id: Option<String>,
    pub raw: JsonValue,
}

impl ServerMessage {
    /// Decode the JSON body of a `data:` record.
    pub fn parse(data: &str) -> ClientResult<Self> {
        let raw: JsonValue = serde_json::from_str(data).map_err(|e| {
            ClientError::Protocol(format!("Malformed event payload: {} ({})", e, truncate(data)))
        })?;
        let msg = raw
            .get("msg")
            .and_then(|m| m.as_str())
            .ok_or_else(|| ClientError::Protocol(format!("Event without `msg`: {}", truncate(data))))?;
        let kind = MessageKind::parse(msg)
            .ok_or_else(|| ClientError::Protocol(format!("Unrecognized message kind: {}", msg)))?;
        let event_id = raw
            .get("event_id")
            .and_then(|id| id.as_str())
            .map(str::to_string);
        Ok(Self { kind, event_id, raw })
    }

    pub fn is_server_stopped(&self) -> bool {
        self.kind == MessageKind::ServerStopped
            || self.raw.get("message").and_then(|m| m.as_str()) == Some(SERVER_STOPPED_MESSAGE)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == MessageKind::ProcessCompleted
    }

    /// The `output` object of the message, or `{}`.
    pub fn output(&self) -> JsonValue {
        self.raw
            .get("output")
            .cloned()
            .unwrap_or_else(|| JsonValue::Object(Default::default()))
    }

    /// `output.data` when it is a non-empty array.
    pub fn output_data(&self) -> Option<Vec<JsonValue>> {
        match self.raw.get("output").and_then(|o| o.get("data")) {
            Some(JsonValue::Array(items)) if !items.is_empty() => Some(items.clone()),
            _ => None,
        }
    }

    pub fn message_text(&self) -> Option<&str> {
        self.raw.get("message").and_then(|m| m.as_str())
    }
}

/// Where the demultiplexer sends a decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Ignore,
    ServerStopped,
    CloseStream,
    Job { event_id: String, terminal: bool },
}

/// Classify a message read from the shared stream.
pub fn route(message: &ServerMessage) -> ClientResult<Route> {
    if message.kind == MessageKind::Heartbeat {
        return Ok(Route::Ignore);
    }
    if message.is_server_stopped() {
        return Ok(Route::ServerStopped);
    }
    if message.kind == MessageKind::CloseStream {
        return Ok(Route::CloseStream);
    }
    let event_id = message.event_id.clone().ok_or_else(|| {
        ClientError::Protocol(format!("Job message without event_id: {}", message.raw))
    })?;
    Ok(Route::Job {
        event_id,
        terminal: message.is_terminal(),
    })
}

fn truncate(data: &str) -> &str {
    let end = data
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(data.len());
    &data[..end]
}
