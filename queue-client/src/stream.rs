//! The shared event stream of a session.
//!
//! One task reads `queue/data?session_hash=...` and routes every decoded
//! message through the [`PendingEvents`] registry. The task exits when the
//! registry says nothing is pending (older protocols), on `close_stream`, on
//! `server_stopped`, or on failure. The task never reconnects: jobs still
//! awaiting are unblocked and the next submission opens a new stream.

use std::sync::Arc;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{self, Protocol, Route, ServerMessage};
use crate::registry::{Delivery, PendingEvents};

/// Everything the stream task needs, detached from the client.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub http: reqwest::Client,
    pub url: Url,
    pub session_hash: String,
    pub headers: HeaderMap,
    pub registry: Arc<PendingEvents>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Drained,
    Closed,
    Stopped,
}

pub fn spawn_stream(runtime: &Handle, ctx: StreamContext, generation: u64) -> JoinHandle<()> {
    runtime.spawn(async move { run(ctx, generation).await })
}

async fn run(ctx: StreamContext, generation: u64) {
    match read_stream(&ctx, generation).await {
        Ok(end) => debug!(generation, ?end, "event stream finished"),
        Err(err) => {
            warn!(generation, error = %err, "event stream failed");
            ctx.registry.fail_stream(generation, err);
        }
    }
}

async fn read_stream(ctx: &StreamContext, generation: u64) -> ClientResult<StreamEnd> {
    let response = ctx
        .http
        .get(ctx.url.clone())
        .query(&[("session_hash", ctx.session_hash.as_str())])
        .headers(ctx.headers.clone())
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Http {
            status: status.as_u16(),
            body,
        });
    }
    info!(generation, url = %ctx.url, "event stream connected");

    let mut events = response.bytes_stream().eventsource();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| ClientError::Transport(e.to_string()))?;
        if event.data.trim().is_empty() {
            continue;
        }
        let message = ServerMessage::parse(&event.data)?;
        match protocol::route(&message)? {
            Route::Ignore => {}
            Route::ServerStopped => {
                info!(generation, "server stopped, failing pending jobs");
                ctx.registry.fan_out(generation, &message);
                return Ok(StreamEnd::Stopped);
            }
            Route::CloseStream => {
                ctx.registry.close_requested(generation);
                return Ok(StreamEnd::Closed);
            }
            Route::Job { event_id, terminal } => {
                let delivery = ctx.registry.deliver(
                    generation,
                    &event_id,
                    message,
                    terminal,
                    ctx.protocol.closes_when_drained(),
                );
                if delivery == Delivery::Drained {
                    return Ok(StreamEnd::Drained);
                }
            }
        }
    }
    Err(ClientError::StreamClosed(
        "connection ended without close_stream".to_string(),
    ))
}
