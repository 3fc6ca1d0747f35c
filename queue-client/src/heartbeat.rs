//! Keep-alive connection scoped by session hash.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::Urls;

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct HeartbeatContext {
    pub http: reqwest::Client,
    pub urls: Arc<Urls>,
    pub headers: HeaderMap,
    pub session: watch::Receiver<String>,
    pub read_timeout: Duration,
}

/// Running monitor. Dropping the handle stops it.
#[derive(Debug)]
pub struct HeartbeatHandle {
    kill: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        let _ = self.kill.send(true);
        self.task.abort();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_heartbeat(runtime: &Handle, ctx: HeartbeatContext) -> HeartbeatHandle {
    let (kill, kill_rx) = watch::channel(false);
    let task = runtime.spawn(run(ctx, kill_rx));
    HeartbeatHandle { kill, task }
}

/// Hold the heartbeat connection open. A session change reconnects under the
/// new hash; a kill request or any transport error ends the monitor.
async fn run(mut ctx: HeartbeatContext, mut kill: watch::Receiver<bool>) {
    loop {
        if *kill.borrow() {
            return;
        }
        let session_hash = ctx.session.borrow_and_update().clone();
        let url = match ctx.urls.heartbeat(&session_hash) {
            Ok(url) => url,
            Err(err) => {
                debug!(error = %err, "heartbeat url invalid, stopping");
                return;
            }
        };
        let request = ctx.http.get(url).headers(ctx.headers.clone()).send();
        let mut response = tokio::select! {
            _ = kill.changed() => return,
            sent = tokio::time::timeout(ctx.read_timeout, request) => match sent {
                Ok(Ok(response)) if response.status().is_success() => response,
                Ok(Ok(response)) => {
                    debug!(status = %response.status(), "heartbeat rejected, stopping");
                    return;
                }
                Ok(Err(err)) => {
                    debug!(error = %err, "heartbeat connection failed, stopping");
                    return;
                }
                Err(_) => {
                    debug!("heartbeat connect timed out, stopping");
                    return;
                }
            },
        };
        debug!(session_hash, "heartbeat connected");

        loop {
            tokio::select! {
                changed = ctx.session.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    debug!("session changed, refreshing heartbeat");
                    break;
                }
                _ = kill.changed() => return,
                chunk = tokio::time::timeout(ctx.read_timeout, response.chunk()) => match chunk {
                    Ok(Ok(Some(_))) => {}
                    Ok(Ok(None)) => {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        break;
                    }
                    Ok(Err(err)) => {
                        debug!(error = %err, "heartbeat read failed, stopping");
                        return;
                    }
                    Err(_) => {
                        debug!("heartbeat read timed out, stopping");
                        return;
                    }
                },
            }
        }
    }
}
