//! Invocation drivers.
//!
//! One [`Invocation`] runs per submitted job: it prepares the payload, drives
//! the protocol-specific exchange, and post-processes the outputs. The
//! [`Canceller`] issues the best-effort remote cancellation for a job.

use std::sync::Arc;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::client::ClientInner;
use crate::communicator::Communicator;
use crate::diff::DiffState;
use crate::endpoint::{CancelPlan, EndpointDescriptor, Output};
use crate::error::{ClientError, ClientResult, HIDDEN_APP_ERROR};
use crate::protocol::{MessageKind, Protocol, ServerMessage};
use crate::registry::{InboxItem, InboxReceiver, PendingEvents};
use crate::status::StatusUpdate;
use crate::stream::{spawn_stream, StreamContext};

pub(crate) struct Invocation {
    pub client: Arc<ClientInner>,
    pub endpoint: Arc<EndpointDescriptor>,
    pub communicator: Option<Arc<Communicator>>,
    pub headers: HeaderMap,
    pub args: Vec<JsonValue>,
}

impl Invocation {
    pub async fn run(mut self) -> ClientResult<Output> {
        if !self.endpoint.is_valid {
            return Err(ClientError::InvalidEndpoint);
        }
        let args = std::mem::take(&mut self.args);
        let data = if self.client.options.skip_components {
            self.endpoint.insert_empty_state(args)
        } else {
            args
        };
        let mut uploaded = Vec::with_capacity(data.len());
        for value in data {
            uploaded.push(self.client.files.upload_files(value).await?);
        }

        let predictions = match (self.endpoint.protocol, &self.communicator) {
            (Protocol::Legacy, _) => self.predict_legacy(uploaded).await?,
            (Protocol::SseV0, Some(comm)) => self.predict_sse_v0(comm, uploaded).await?,
            (protocol, Some(comm)) if protocol.uses_shared_stream() => {
                self.predict_sse_v1plus(comm, uploaded).await?
            }
            (protocol, _) => {
                return Err(ClientError::Config(format!(
                    "Protocol {} needs a communicator",
                    protocol
                )))
            }
        };

        let output = self.process_predictions(predictions).await?;
        if let Some(comm) = &self.communicator {
            comm.append_final_if_empty(&output);
        }
        Ok(output)
    }

    fn payload(&self, data: &[JsonValue]) -> JsonValue {
        json!({
            "data": data,
            "fn_index": self.endpoint.fn_index,
            "session_hash": self.client.session.hash(),
        })
    }

    /// Download files, drop hidden slots, and reduce.
    async fn process_predictions(&self, data: Vec<JsonValue>) -> ClientResult<Output> {
        let data = if self.client.options.download_files {
            let require_meta = self.endpoint.protocol.requires_file_meta();
            let mut downloaded = Vec::with_capacity(data.len());
            for value in data {
                downloaded.push(self.client.files.download_files(value, require_meta).await?);
            }
            downloaded
        } else {
            data
        };
        Ok(self
            .endpoint
            .finalize_outputs(data, self.client.options.skip_components))
    }

    /// Single request/response against `api/predict/`.
    async fn predict_legacy(&self, data: Vec<JsonValue>) -> ClientResult<Vec<JsonValue>> {
        let request = self
            .client
            .http
            .post(self.client.urls.route("api/predict/")?)
            .headers(self.headers.clone())
            .json(&self.payload(&data));
        let response = self.client.with_timeout(request).send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::TooManyRequests);
        }
        let body = response.text().await?;
        match serde_json::from_str::<JsonValue>(&body) {
            Ok(result) => classify_result(result),
            Err(_) if !status.is_success() => Err(ClientError::Http {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(ClientError::Protocol(format!("Malformed predict response: {}", e))),
        }
    }

    /// Oldest streaming protocol: this job owns its stream.
    async fn predict_sse_v0(
        &self,
        comm: &Communicator,
        data: Vec<JsonValue>,
    ) -> ClientResult<Vec<JsonValue>> {
        let session_hash = self.client.session.hash();
        let fn_index = self.endpoint.fn_index.to_string();
        let response = self
            .client
            .http
            .get(self.client.urls.route(Protocol::SseV0.stream_route())?)
            .query(&[
                ("fn_index", fn_index.as_str()),
                ("session_hash", session_hash.as_str()),
            ])
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(submit_error(status, body));
        }

        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| ClientError::Transport(e.to_string()))?;
            if event.data.trim().is_empty() {
                continue;
            }
            let message = ServerMessage::parse(&event.data)?;
            if message.kind == MessageKind::Heartbeat {
                continue;
            }
            check_fatal(comm, &message)?;

            match message.kind {
                MessageKind::QueueFull => {
                    record(comm, &message);
                    return Err(ClientError::QueueFull);
                }
                MessageKind::SendData => {
                    record(comm, &message);
                    let event_id = message.event_id.clone().ok_or_else(|| {
                        ClientError::Protocol("send_data without event_id".to_string())
                    })?;
                    comm.set_event_id(&event_id);
                    let mut payload = self.payload(&data);
                    payload["event_id"] = JsonValue::String(event_id);
                    let request = self
                        .client
                        .http
                        .post(self.client.urls.route(Protocol::SseV0.data_route())?)
                        .headers(self.headers.clone())
                        .json(&payload);
                    self.client
                        .with_timeout(request)
                        .send()
                        .await?
                        .error_for_status()?;
                }
                MessageKind::ProcessGenerating | MessageKind::ProcessStreaming => {
                    if let Some(output) = message.output_data() {
                        let output = self.process_predictions(output).await?;
                        comm.append_output(output, false);
                    }
                    record(comm, &message);
                }
                MessageKind::ProcessCompleted => {
                    record(comm, &message);
                    return classify_result(message.output());
                }
                _ => record(comm, &message),
            }
        }
        Err(ClientError::Protocol(
            "Stream ended before process_completed".to_string(),
        ))
    }

    /// Shared-stream protocols: post the payload, then read this job's inbox.
    async fn predict_sse_v1plus(
        &self,
        comm: &Communicator,
        data: Vec<JsonValue>,
    ) -> ClientResult<Vec<JsonValue>> {
        let client = &self.client;
        let reservation = client.registry.reserve();
        let event_id = self.send_data(&data).await?;
        comm.set_event_id(&event_id);

        let ctx = StreamContext {
            http: client.http.clone(),
            url: client.urls.route(self.endpoint.protocol.stream_route())?,
            session_hash: client.session.hash(),
            headers: client.headers.clone(),
            registry: client.registry.clone(),
            protocol: self.endpoint.protocol,
        };
        let runtime = client.runtime.clone();
        let mut inbox = client.registry.register(reservation, &event_id, move |generation| {
            spawn_stream(&runtime, ctx, generation)
        });
        let _registered = Registered {
            registry: &client.registry,
            event_id: &event_id,
        };

        self.read_inbox(comm, &mut inbox).await
    }

    async fn send_data(&self, data: &[JsonValue]) -> ClientResult<String> {
        let request = self
            .client
            .http
            .post(self.client.urls.route(self.endpoint.protocol.data_route())?)
            .headers(self.headers.clone())
            .json(&self.payload(data));
        let response = self.client.with_timeout(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(submit_error(status, body));
        }
        let body: JsonValue = response.json().await?;
        body.get("event_id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol(format!("Join response without event_id: {}", body)))
    }

    async fn read_inbox(
        &self,
        comm: &Communicator,
        inbox: &mut InboxReceiver,
    ) -> ClientResult<Vec<JsonValue>> {
        let mut diffs = DiffState::default();
        while let Some(item) = inbox.recv().await {
            let message = match item {
                InboxItem::Message(message) => message,
                InboxItem::Closed(err) => {
                    comm.record(StatusUpdate::finished(false));
                    return Err(err);
                }
            };
            check_fatal(comm, &message)?;

            match message.kind {
                MessageKind::ProcessGenerating | MessageKind::ProcessStreaming => {
                    if let Some(mut output) = message.output_data() {
                        if self.endpoint.protocol.applies_diffs() {
                            output = diffs.apply(output)?;
                        }
                        let output = self.process_predictions(output).await?;
                        comm.append_output(output, false);
                    }
                    record(comm, &message);
                }
                MessageKind::ProcessCompleted => {
                    record(comm, &message);
                    return classify_result(message.output());
                }
                _ => record(comm, &message),
            }
        }
        Err(ClientError::StreamClosed("inbox closed".to_string()))
    }
}

/// Takes the job out of the registry however reading ends: after the
/// terminal message, on an error, or when the invocation is dropped on
/// cancel.
struct Registered<'a> {
    registry: &'a PendingEvents,
    event_id: &'a str,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.registry.abandon(self.event_id);
    }
}

fn record(comm: &Communicator, message: &ServerMessage) {
    if let Some(update) = StatusUpdate::from_message(message) {
        comm.record(update);
    }
}

/// Server-stopped and unexpected-error messages end the job.
fn check_fatal(comm: &Communicator, message: &ServerMessage) -> ClientResult<()> {
    if message.is_server_stopped() {
        comm.record(StatusUpdate::finished(false));
        return Err(ClientError::ServerStopped);
    }
    if message.kind == MessageKind::UnexpectedError {
        comm.record(StatusUpdate::finished(false));
        return Err(ClientError::App {
            message: message
                .message_text()
                .unwrap_or(HIDDEN_APP_ERROR)
                .to_string(),
            data: None,
        });
    }
    Ok(())
}

/// Error for a rejected submission. A 503 means the queue is full.
fn submit_error(status: StatusCode, body: String) -> ClientError {
    if status == StatusCode::SERVICE_UNAVAILABLE {
        ClientError::QueueFull
    } else {
        ClientError::Http {
            status: status.as_u16(),
            body,
        }
    }
}

/// Split a terminal payload into output data or an error.
pub(crate) fn classify_result(result: JsonValue) -> ClientResult<Vec<JsonValue>> {
    let JsonValue::Object(mut map) = result else {
        return Err(ClientError::Protocol(format!(
            "Result is not an object: {}",
            result
        )));
    };
    if let Some(error) = map.remove("error") {
        return Err(ClientError::from_app_payload(&error, JsonValue::Object(map)));
    }
    match map.remove("data") {
        Some(JsonValue::Array(items)) => Ok(items),
        Some(other) => Err(ClientError::Protocol(format!(
            "Result `data` is not a list: {}",
            other
        ))),
        None => Err(ClientError::Protocol(format!(
            "Could not find 'data' key in response. Response received: {}",
            JsonValue::Object(map)
        ))),
    }
}

/// Best-effort remote cancellation of one job.
pub(crate) struct Canceller {
    client: Arc<ClientInner>,
    endpoint: Arc<EndpointDescriptor>,
    communicator: Arc<Communicator>,
}

impl Canceller {
    pub fn new(
        client: Arc<ClientInner>,
        endpoint: Arc<EndpointDescriptor>,
        communicator: Arc<Communicator>,
    ) -> Self {
        Self {
            client,
            endpoint,
            communicator,
        }
    }

    /// Send the cancel requests in the background. Never waits for the
    /// server and never assumes the remote work stops.
    pub fn fire(&self) {
        let plan = &self.endpoint.cancel_plan;
        if let Some(warning) = plan.warning() {
            warn!("{}", warning);
        }
        let session_hash = self.client.session.hash();
        let event_id = self.communicator.event_id();

        let mut requests = Vec::new();
        match plan {
            CancelPlan::Direct => requests.push((
                "cancel",
                json!({
                    "fn_index": self.endpoint.fn_index,
                    "session_hash": session_hash,
                    "event_id": event_id,
                }),
            )),
            CancelPlan::ViaDependency { fn_index, .. } => requests.push((
                "api/predict/",
                json!({
                    "data": [],
                    "fn_index": fn_index,
                    "session_hash": session_hash,
                }),
            )),
            CancelPlan::Unsupported => {}
        }
        if let Some(event_id) = &event_id {
            requests.push(("reset", json!({ "event_id": event_id })));
        }

        for (route, body) in requests {
            let url = match self.client.urls.route(route) {
                Ok(url) => url,
                Err(err) => {
                    debug!(route, error = %err, "skipping cancel request");
                    continue;
                }
            };
            let request = self
                .client
                .http
                .post(url)
                .headers(self.client.headers.clone())
                .json(&body);
            self.client.runtime.spawn(async move {
                match request.send().await {
                    Ok(response) => debug!(route, status = %response.status(), "cancel request sent"),
                    Err(err) => debug!(route, error = %err, "cancel request failed"),
                }
            });
        }
    }
}
