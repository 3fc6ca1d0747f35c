//! In-process mock of a queue-managed app, served by axum on 127.0.0.1:0.
//!
//! Each endpoint (by fn_index) has a script: a function from the submitted
//! data to the steps the server plays back on the event stream.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use queue_client::{ApiInfo, AppConfig, Client, ClientOptions};

/// One step of a scripted job.
#[derive(Debug, Clone)]
pub enum Step {
    /// Job message; the server adds the event id.
    Msg(Value),
    /// Message sent verbatim on the session stream.
    Raw(Value),
    Sleep(u64),
    /// Drop the current stream connection.
    Eof,
    /// Send `close_stream`, then end the connection.
    CloseStream,
    /// Stop here without completing.
    Hold,
}

pub type Script = Arc<dyn Fn(&[Value]) -> Vec<Step> + Send + Sync>;

#[derive(Debug)]
enum Frame {
    Data(Value),
    Eof,
}

struct SessionChannel {
    tx: mpsc::UnboundedSender<Frame>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
}

impl SessionChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
pub struct Recorded {
    pub joins: Vec<Value>,
    /// `x-trace` header of each join, if sent.
    pub traces: Vec<Option<String>>,
    pub predicts: Vec<Value>,
    pub cancels: Vec<Value>,
    pub resets: Vec<Value>,
    pub stream_connections: usize,
    pub uploads: usize,
    pub downloads: usize,
    pub heartbeat_sessions: Vec<String>,
}

struct Inner {
    config: Value,
    api_info: Value,
    scripts: HashMap<usize, Script>,
    sessions: HashMap<String, SessionChannel>,
    v0_waiting: HashMap<String, (usize, mpsc::UnboundedSender<Frame>)>,
    files: HashMap<String, Vec<u8>>,
    queue_full: bool,
    counter: u64,
    credentials: Option<(String, String)>,
    recorded: Recorded,
}

#[derive(Clone)]
pub struct MockApp {
    inner: Arc<Mutex<Inner>>,
}

pub struct MockServer {
    pub url: String,
    pub app: MockApp,
}

// ---------------------------------------------------------------------------
// Message helpers
// ---------------------------------------------------------------------------

pub fn estimation(rank: i64) -> Step {
    Step::Msg(json!({"msg": "estimation", "rank": rank, "queue_size": rank + 1, "rank_eta": 1.5}))
}

pub fn starts() -> Step {
    Step::Msg(json!({"msg": "process_starts"}))
}

pub fn generating(data: Value) -> Step {
    Step::Msg(json!({"msg": "process_generating", "output": {"data": data}, "success": true}))
}

pub fn completed(data: Value) -> Step {
    Step::Msg(json!({"msg": "process_completed", "output": {"data": data}, "success": true}))
}

pub fn failed(error: Value) -> Step {
    Step::Msg(json!({"msg": "process_completed", "output": {"error": error}, "success": false}))
}

// ---------------------------------------------------------------------------
// Calculator app
// ---------------------------------------------------------------------------

pub const FN_ADD: usize = 0;
pub const FN_COUNT: usize = 1;
pub const FN_PAIR: usize = 2;
pub const FN_CHAT: usize = 3;
pub const FN_SLOW: usize = 4;
pub const FN_FILE: usize = 5;
pub const FN_TYPE: usize = 6;
pub const FN_BOOM: usize = 7;
pub const FN_STOP: usize = 8;
pub const FN_DISABLED: usize = 9;
pub const FN_CRASH: usize = 10;
pub const FN_DROP: usize = 11;

pub fn calculator_config(protocol: &str, version: &str) -> Value {
    json!({
        "version": version,
        "protocol": protocol,
        "max_file_size": 1024,
        "components": [
            {"id": 1, "type": "number"},
            {"id": 2, "type": "textbox"},
            {"id": 3, "type": "number"},
            {"id": 4, "type": "number"},
            {"id": 5, "type": "state"},
            {"id": 6, "type": "textbox"},
            {"id": 7, "type": "file", "api_info": {"$ref": "#/defs/FileData"}},
            {"id": 8, "type": "row"}
        ],
        "dependencies": [
            {"id": 0, "api_name": "predict", "inputs": [1, 2, 3], "outputs": [4]},
            {"id": 1, "api_name": "count", "inputs": [1], "outputs": [4]},
            {"id": 2, "api_name": "pair", "inputs": [2], "outputs": [6, 4, 8]},
            {"id": 3, "api_name": "chat", "inputs": [2, 5], "outputs": [6, 5]},
            {"id": 4, "api_name": "slow", "inputs": [], "outputs": [4]},
            {"id": 5, "api_name": "file", "inputs": [7], "outputs": [7]},
            {"id": 6, "api_name": "type", "inputs": [2], "outputs": [6]},
            {"id": 7, "api_name": "boom", "inputs": [], "outputs": [4]},
            {"id": 8, "api_name": "stop", "inputs": [], "outputs": [], "cancels": [4]},
            {"id": 9, "api_name": false, "inputs": [], "outputs": []},
            {"id": 10, "api_name": "crash", "inputs": [], "outputs": [4]},
            {"id": 11, "api_name": "drop", "inputs": [], "outputs": [4]}
        ]
    })
}

pub fn calculator_info() -> Value {
    json!({
        "named_endpoints": {
            "/predict": {"parameters": [
                {"label": "a", "parameter_name": "a", "parameter_has_default": false},
                {"label": "op", "parameter_name": "op", "parameter_has_default": true, "parameter_default": "add"},
                {"label": "b", "parameter_name": "b", "parameter_has_default": false}
            ]},
            "/count": {"parameters": [
                {"label": "n", "parameter_name": "n", "parameter_has_default": false}
            ]}
        },
        "unnamed_endpoints": {}
    })
}

fn calculate(data: &[Value]) -> Value {
    let a = data.first().and_then(Value::as_f64).unwrap_or(0.0);
    let op = data.get(1).and_then(Value::as_str).unwrap_or("add");
    let b = data.get(2).and_then(Value::as_f64).unwrap_or(0.0);
    let result = match op {
        "subtract" => a - b,
        "multiply" => a * b,
        _ => a + b,
    };
    json!(result as i64)
}

impl MockApp {
    pub fn new(config: Value, api_info: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                api_info,
                scripts: HashMap::new(),
                sessions: HashMap::new(),
                v0_waiting: HashMap::new(),
                files: HashMap::new(),
                queue_full: false,
                counter: 0,
                credentials: None,
                recorded: Recorded::default(),
            })),
        }
    }

    /// The calculator app with a script for every endpoint.
    pub fn calculator(protocol: &str, version: &str) -> Self {
        let app = Self::new(calculator_config(protocol, version), calculator_info());
        app.script(FN_ADD, |data| vec![estimation(0), starts(), completed(json!([calculate(data)]))]);
        app.script(FN_COUNT, |data| {
            let n = data.first().and_then(Value::as_i64).unwrap_or(3);
            let mut steps = vec![starts()];
            for i in 0..n {
                steps.push(generating(json!([i])));
                steps.push(Step::Sleep(5));
            }
            steps.push(completed(json!([n - 1])));
            steps
        });
        app.script(FN_PAIR, |_| vec![completed(json!(["ok", 9, null]))]);
        app.script(FN_CHAT, |data| {
            let text = data.first().and_then(Value::as_str).unwrap_or_default();
            vec![completed(json!([format!("echo: {}", text), {"turns": 1}]))]
        });
        app.script(FN_SLOW, |_| vec![estimation(2), Step::Hold]);
        app.script(FN_FILE, |data| vec![completed(json!([data.first().cloned().unwrap_or(Value::Null)]))]);
        app.script(FN_TYPE, |_| {
            vec![
                starts(),
                generating(json!(["Hel"])),
                generating(json!([[["append", [], "lo"]]])),
                generating(json!([[["append", [], " world"]]])),
                completed(json!(["Hello world"])),
            ]
        });
        app.script(FN_BOOM, |_| vec![starts(), failed(json!("Division by zero"))]);
        app.script(FN_STOP, |_| vec![completed(json!([]))]);
        app.script(FN_CRASH, |_| {
            vec![
                Step::Sleep(50),
                Step::Raw(json!({"msg": "unexpected_error", "message": "Server stopped unexpectedly."})),
            ]
        });
        app.script(FN_DROP, |_| vec![starts(), Step::Sleep(20), Step::Eof]);
        app
    }

    pub fn script<F>(&self, fn_index: usize, script: F)
    where
        F: Fn(&[Value]) -> Vec<Step> + Send + Sync + 'static,
    {
        self.lock().scripts.insert(fn_index, Arc::new(script));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn set_queue_full(&self, full: bool) {
        self.lock().queue_full = full;
    }

    pub fn require_login(&self, username: &str, password: &str) {
        self.lock().credentials = Some((username.to_string(), password.to_string()));
    }

    pub fn add_file(&self, path: &str, bytes: &[u8]) {
        self.lock().files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn recorded<T>(&self, read: impl FnOnce(&Recorded) -> T) -> T {
        read(&self.lock().recorded)
    }

    pub fn config(&self) -> AppConfig {
        serde_json::from_value(self.lock().config.clone()).unwrap()
    }

    pub fn api_info(&self) -> ApiInfo {
        serde_json::from_value(self.lock().api_info.clone()).unwrap()
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut inner = self.lock();
        inner.counter += 1;
        format!("{}-{}", prefix, inner.counter)
    }

    fn session_tx(&self, session_hash: &str) -> mpsc::UnboundedSender<Frame> {
        self.lock()
            .sessions
            .entry(session_hash.to_string())
            .or_insert_with(SessionChannel::new)
            .tx
            .clone()
    }

    fn session_rx(&self, session_hash: &str) -> Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>> {
        self.lock()
            .sessions
            .entry(session_hash.to_string())
            .or_insert_with(SessionChannel::new)
            .rx
            .clone()
    }

    fn steps_for(&self, fn_index: usize, data: &[Value]) -> Vec<Step> {
        let script = self.lock().scripts.get(&fn_index).cloned();
        match script {
            Some(script) => script(data),
            None => vec![failed(json!(format!("no script for fn_index {}", fn_index)))],
        }
    }
}

async fn play(steps: Vec<Step>, event_id: String, tx: mpsc::UnboundedSender<Frame>) {
    for step in steps {
        match step {
            Step::Msg(mut message) => {
                message["event_id"] = json!(event_id);
                let _ = tx.send(Frame::Data(message));
            }
            Step::Raw(message) => {
                let _ = tx.send(Frame::Data(message));
            }
            Step::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::Eof => {
                let _ = tx.send(Frame::Eof);
            }
            Step::CloseStream => {
                let _ = tx.send(Frame::Data(json!({"msg": "close_stream"})));
                let _ = tx.send(Frame::Eof);
            }
            Step::Hold => return,
        }
    }
}

fn sse_from_frames<S>(frames: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Frame> + Send + 'static,
{
    let events = frames
        .take_while(|frame| futures::future::ready(matches!(frame, Frame::Data(_))))
        .filter_map(|frame| {
            futures::future::ready(match frame {
                Frame::Data(value) => Some(Ok(Event::default().data(value.to_string()))),
                Frame::Eof => None,
            })
        });
    Sse::new(events)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn config(State(app): State<MockApp>) -> Json<Value> {
    Json(app.lock().config.clone())
}

async fn info(State(app): State<MockApp>) -> Json<Value> {
    Json(app.lock().api_info.clone())
}

async fn login(State(app): State<MockApp>, Form(form): Form<HashMap<String, String>>) -> Response {
    let expected = app.lock().credentials.clone();
    let given = (
        form.get("username").cloned().unwrap_or_default(),
        form.get("password").cloned().unwrap_or_default(),
    );
    match expected {
        Some(expected) if expected == given => {
            ([("set-cookie", "access-token=ok; Path=/")], "ok").into_response()
        }
        _ => (StatusCode::UNAUTHORIZED, "bad credentials").into_response(),
    }
}

/// v1+: accept a job and play its script on the session stream.
async fn join(State(app): State<MockApp>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if app.lock().queue_full {
        return (StatusCode::SERVICE_UNAVAILABLE, "Queue is full").into_response();
    }
    {
        let trace = headers
            .get("x-trace")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut inner = app.lock();
        inner.recorded.joins.push(body.clone());
        inner.recorded.traces.push(trace);
    }
    let fn_index = body["fn_index"].as_u64().unwrap_or(0) as usize;
    let session_hash = body["session_hash"].as_str().unwrap_or_default().to_string();
    let data = body["data"].as_array().cloned().unwrap_or_default();

    let event_id = app.next_id("evt");
    let steps = app.steps_for(fn_index, &data);
    let tx = app.session_tx(&session_hash);
    tokio::spawn(play(steps, event_id.clone(), tx));
    Json(json!({"event_id": event_id})).into_response()
}

/// v1+: the session's shared event stream.
async fn data_stream(
    State(app): State<MockApp>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let session_hash = query.get("session_hash").cloned().unwrap_or_default();
    app.lock().recorded.stream_connections += 1;
    let guard = app.session_rx(&session_hash).lock_owned().await;
    let frames = futures::stream::unfold(guard, |mut guard| async move {
        guard.recv().await.map(|frame| (frame, guard))
    });
    sse_from_frames(frames).into_response()
}

/// v0: open a per-job stream and ask for the payload.
async fn v0_join(
    State(app): State<MockApp>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if app.lock().queue_full {
        return (StatusCode::SERVICE_UNAVAILABLE, "Queue is full").into_response();
    }
    let fn_index = query
        .get("fn_index")
        .and_then(|f| f.parse().ok())
        .unwrap_or(0usize);
    let event_id = app.next_id("v0");
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(Frame::Data(json!({"msg": "estimation", "event_id": event_id, "rank": 0, "queue_size": 1})));
    let _ = tx.send(Frame::Data(json!({"msg": "send_data", "event_id": event_id})));
    {
        let mut inner = app.lock();
        inner.recorded.stream_connections += 1;
        inner.v0_waiting.insert(event_id, (fn_index, tx));
    }
    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    sse_from_frames(frames).into_response()
}

/// v0: receive the payload and play the script on the job's own stream.
async fn v0_data(State(app): State<MockApp>, Json(body): Json<Value>) -> Response {
    let event_id = body["event_id"].as_str().unwrap_or_default().to_string();
    let waiting = app.lock().v0_waiting.remove(&event_id);
    let Some((fn_index, tx)) = waiting else {
        return (StatusCode::NOT_FOUND, "unknown event").into_response();
    };
    app.lock().recorded.joins.push(body.clone());
    let data = body["data"].as_array().cloned().unwrap_or_default();
    let steps = app.steps_for(fn_index, &data);
    tokio::spawn(async move {
        play(steps, event_id.clone(), tx.clone()).await;
        let _ = tx.send(Frame::Eof);
    });
    Json(json!({})).into_response()
}

/// Legacy request/response, also used for dependency-based cancellation.
async fn predict(State(app): State<MockApp>, Json(body): Json<Value>) -> Response {
    app.lock().recorded.predicts.push(body.clone());
    let fn_index = body["fn_index"].as_u64().unwrap_or(0) as usize;
    let data = body["data"].as_array().cloned().unwrap_or_default();
    let steps = app.steps_for(fn_index, &data);
    let output = steps.into_iter().rev().find_map(|step| match step {
        Step::Msg(message) if message["msg"] == "process_completed" => Some(message["output"].clone()),
        _ => None,
    });
    match output {
        Some(output) => Json(output).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no result").into_response(),
    }
}

async fn cancel(State(app): State<MockApp>, Json(body): Json<Value>) -> Json<Value> {
    app.lock().recorded.cancels.push(body);
    Json(json!({"success": true}))
}

async fn reset(State(app): State<MockApp>, Json(body): Json<Value>) -> Json<Value> {
    app.lock().recorded.resets.push(body);
    Json(json!({"success": true}))
}

async fn upload(State(app): State<MockApp>, mut multipart: Multipart) -> Response {
    let mut paths = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.file_name().unwrap_or("blob").to_string();
        let Ok(bytes) = field.bytes().await else {
            return (StatusCode::BAD_REQUEST, "bad upload").into_response();
        };
        let path = format!("/tmp/mock/{}/{}", app.next_id("up"), name);
        let mut inner = app.lock();
        inner.recorded.uploads += 1;
        inner.files.insert(path.clone(), bytes.to_vec());
        paths.push(path);
    }
    Json(json!(paths)).into_response()
}

async fn heartbeat(State(app): State<MockApp>, Path(session_hash): Path<String>) -> Response {
    app.lock().recorded.heartbeat_sessions.push(session_hash);
    let stream = futures::stream::unfold((), |_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Some((Ok::<_, Infallible>(Event::default().data(r#"{"msg":"heartbeat"}"#)), ()))
    });
    Sse::new(stream).into_response()
}

/// `GET /file=<path>`.
async fn files(State(app): State<MockApp>, uri: Uri) -> Response {
    let Some(path) = uri.path().strip_prefix("/file=") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut inner = app.lock();
    match inner.files.get(path).cloned() {
        Some(bytes) => {
            inner.recorded.downloads += 1;
            bytes.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(app: MockApp) -> Router {
    Router::new()
        .route("/config", get(config))
        .route("/info", get(info))
        .route("/login", post(login))
        .route("/queue/join", post(join).get(v0_join))
        .route("/queue/data", get(data_stream).post(v0_data))
        .route("/api/predict/", post(predict))
        .route("/cancel", post(cancel))
        .route("/reset", post(reset))
        .route("/upload", post(upload))
        .route("/heartbeat/:session_hash", get(heartbeat))
        .fallback(files)
        .with_state(app)
}

pub async fn serve(app: MockApp) -> MockServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = router(app.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    MockServer {
        url: format!("http://{}", addr),
        app,
    }
}

pub fn test_options(download_dir: &std::path::Path) -> ClientOptions {
    ClientOptions {
        download_dir: download_dir.to_path_buf(),
        update_poll_ms: 20,
        ..ClientOptions::default()
    }
}

/// Start the calculator app and connect a client to it.
pub async fn calculator_client(
    protocol: &str,
    version: &str,
) -> (Client, MockServer, tempfile::TempDir) {
    let server = serve(MockApp::calculator(protocol, version)).await;
    let dir = tempfile::tempdir().unwrap();
    let client = Client::connect(&server.url, test_options(dir.path()))
        .await
        .unwrap();
    (client, server, dir)
}

/// Poll `check` every 5ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
