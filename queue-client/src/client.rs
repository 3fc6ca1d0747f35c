//! Client entry point: connects to an app, selects endpoints, and submits
//! jobs onto a bounded worker pool.

use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::communicator::Communicator;
use crate::config::{ClientOptions, Credentials};
use crate::endpoint::{EndpointDescriptor, Output};
use crate::error::{ClientError, ClientResult};
use crate::files::{check_file_sizes, FileTransfer};
use crate::heartbeat::{spawn_heartbeat, HeartbeatContext, HeartbeatHandle};
use crate::invoke::{Canceller, Invocation};
use crate::job::{self, Job};
use crate::protocol::Protocol;
use crate::registry::PendingEvents;
use crate::schema::{ApiInfo, AppConfig, AppVersion};
use crate::session::{Session, Urls};

/// A single remote call: endpoint selector, arguments and extra headers.
#[derive(Debug, Clone, Default)]
pub struct Call {
    api_name: Option<String>,
    fn_index: Option<usize>,
    args: Vec<JsonValue>,
    kwargs: IndexMap<String, JsonValue>,
    headers: IndexMap<String, String>,
}

impl Call {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the endpoint by name, e.g. `"/predict"`. Takes precedence over
    /// [`Call::fn_index`].
    pub fn api(mut self, api_name: impl Into<String>) -> Self {
        self.api_name = Some(api_name.into());
        self
    }

    pub fn fn_index(mut self, fn_index: usize) -> Self {
        self.fn_index = Some(fn_index);
        self
    }

    pub fn arg(mut self, value: impl Into<JsonValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Header for this call only; overrides a client header of the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// State shared by the client handle, its jobs and its background tasks.
pub(crate) struct ClientInner {
    pub http: reqwest::Client,
    pub urls: Arc<Urls>,
    pub headers: HeaderMap,
    pub session: Session,
    pub registry: Arc<PendingEvents>,
    pub protocol: Protocol,
    pub options: ClientOptions,
    pub files: FileTransfer,
    pub config: AppConfig,
    pub endpoints: IndexMap<usize, Arc<EndpointDescriptor>>,
    pub workers: Arc<Semaphore>,
    pub runtime: Handle,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl ClientInner {
    pub fn with_timeout(&self, request: RequestBuilder) -> RequestBuilder {
        match self.options.request_timeout_secs {
            Some(secs) => request.timeout(Duration::from_secs(secs)),
            None => request,
        }
    }

    fn start_heartbeat(&self) {
        let handle = spawn_heartbeat(
            &self.runtime,
            HeartbeatContext {
                http: self.http.clone(),
                urls: self.urls.clone(),
                headers: self.headers.clone(),
                session: self.session.subscribe(),
                read_timeout: self.options.heartbeat_read_timeout(),
            },
        );
        *self.heartbeat_slot() = Some(handle);
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_slot().take() {
            handle.stop();
        }
    }

    fn heartbeat_slot(&self) -> std::sync::MutexGuard<'_, Option<HeartbeatHandle>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn select_endpoint(
        &self,
        api_name: Option<&str>,
        fn_index: Option<usize>,
    ) -> ClientResult<Arc<EndpointDescriptor>> {
        if let Some(api_name) = api_name {
            return self
                .endpoints
                .values()
                .find(|e| e.api_name.as_deref() == Some(api_name))
                .cloned()
                .ok_or_else(|| {
                    let mut message =
                        format!("Cannot find a function with `api_name`: {}.", api_name);
                    if !api_name.starts_with('/') {
                        message.push_str(" Did you mean to use a leading slash?");
                    }
                    ClientError::Config(message)
                });
        }
        if let Some(fn_index) = fn_index {
            return self
                .endpoints
                .get(&fn_index)
                .filter(|e| e.is_valid)
                .cloned()
                .ok_or_else(|| ClientError::Config(format!("Invalid function index: {}.", fn_index)));
        }
        let mut candidates = self.endpoints.values().filter(|e| e.is_default_candidate());
        match (candidates.next(), candidates.next()) {
            (Some(endpoint), None) => Ok(endpoint.clone()),
            _ => Err(ClientError::Config(
                "This app might have multiple endpoints. Please specify an `api_name` or `fn_index`"
                    .to_string(),
            )),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop_heartbeat();
        self.registry.shutdown();
    }
}

/// Handle to a remote app. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("src", &self.inner.urls.src.as_str())
            .field("protocol", &self.inner.protocol)
            .field("session_hash", &self.inner.session.hash())
            .finish()
    }
}

impl Client {
    /// Log in if credentials are configured, fetch the app config and API
    /// info, and start the session heartbeat.
    pub async fn connect(src: &str, options: ClientOptions) -> ClientResult<Self> {
        options.validate()?;
        let http = build_http(&options)?;
        let headers = build_headers(&options.headers)?;
        let root = Urls::new(src, None)?;

        if let Some(credentials) = &options.auth {
            login(&http, &root, credentials).await?;
        }
        let config = fetch_config(&http, &root, &headers, &options).await?;
        let urls = Urls::new(src, config.api_prefix.as_deref())?;
        let api_info = if config.app_version().serves_api_info() {
            fetch_api_info(&http, &urls, &headers, &options).await?
        } else {
            None
        };
        info!(src, version = %config.app_version(), "connected");
        Self::assemble(http, headers, urls, config, api_info, options)
    }

    /// Build a client from an already fetched config. Must be called within
    /// a Tokio runtime.
    pub fn from_config(
        src: &str,
        config: AppConfig,
        api_info: Option<ApiInfo>,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        options.validate()?;
        let http = build_http(&options)?;
        let headers = build_headers(&options.headers)?;
        let urls = Urls::new(src, config.api_prefix.as_deref())?;
        Self::assemble(http, headers, urls, config, api_info, options)
    }

    fn assemble(
        http: reqwest::Client,
        headers: HeaderMap,
        urls: Urls,
        config: AppConfig,
        api_info: Option<ApiInfo>,
        options: ClientOptions,
    ) -> ClientResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| ClientError::Config("Client must be created within a Tokio runtime".into()))?;
        options.prepare_download_dir()?;
        let protocol: Protocol = config.protocol_name().parse()?;
        let api_info = api_info.map(|mut info| {
            info.retain_shown();
            info
        });

        let mut endpoints = IndexMap::new();
        for position in 0..config.dependencies.len() {
            let endpoint =
                EndpointDescriptor::from_config(&config, api_info.as_ref(), position, protocol)?;
            endpoints.insert(endpoint.fn_index, Arc::new(endpoint));
        }

        let urls = Arc::new(urls);
        let files = FileTransfer::new(
            http.clone(),
            urls.clone(),
            headers.clone(),
            options.download_dir.clone(),
            config.max_file_size,
        );
        let inner = Arc::new(ClientInner {
            http,
            urls,
            headers,
            session: Session::new(),
            registry: PendingEvents::new(),
            protocol,
            workers: Arc::new(Semaphore::new(options.max_workers)),
            options,
            files,
            config,
            endpoints,
            runtime,
            heartbeat: Mutex::new(None),
        });
        inner.start_heartbeat();
        debug!(protocol = %inner.protocol, endpoints = inner.endpoints.len(), "client ready");
        Ok(Self { inner })
    }

    /// Validate the call and start it in the background.
    ///
    /// Argument, endpoint and file-size errors are returned here, before any
    /// request is sent. Everything else surfaces through the returned job.
    pub fn submit(&self, call: Call) -> ClientResult<Job> {
        let inner = &self.inner;
        let endpoint = inner.select_endpoint(call.api_name.as_deref(), call.fn_index)?;
        let args = endpoint.construct_args(call.args, &call.kwargs)?;
        check_file_sizes(&args, inner.config.max_file_size)?;

        let mut headers = inner.headers.clone();
        headers.extend(build_headers(&call.headers)?);

        let communicator = endpoint
            .protocol
            .is_streaming()
            .then(|| Arc::new(Communicator::new()));
        let invocation = Invocation {
            client: inner.clone(),
            endpoint: endpoint.clone(),
            communicator: communicator.clone(),
            headers,
            args,
        };

        let (result_tx, result_rx) = watch::channel(None);
        let state = Arc::new(AtomicU8::new(job::PENDING));
        let workers = inner.workers.clone();
        let task_state = state.clone();
        let task_comm = communicator.clone();
        let fn_index = endpoint.fn_index;

        inner.runtime.spawn(async move {
            let work = async {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::Cancelled)?;
                if !job::try_start(&task_state) {
                    return Err(ClientError::Cancelled);
                }
                invocation.run().await
            };
            let result = match task_comm {
                Some(comm) => tokio::select! {
                    biased;
                    _ = comm.cancelled() => Err(ClientError::Cancelled),
                    result = work => result,
                },
                None => work.await,
            };
            match &result {
                Ok(_) => debug!(fn_index, "job finished"),
                Err(err) => debug!(fn_index, error = %err, "job failed"),
            }
            let _ = result_tx.send(Some(result));
        });

        let canceller = communicator
            .as_ref()
            .map(|comm| Canceller::new(inner.clone(), endpoint.clone(), comm.clone()));
        Ok(Job::new(
            communicator,
            result_rx,
            state,
            canceller,
            inner.runtime.clone(),
            &inner.options,
        ))
    }

    /// Submit and wait for the result.
    pub async fn predict(&self, call: Call) -> ClientResult<Output> {
        self.submit(call)?.result(None).await
    }

    /// Start a new session. Jobs still waiting on the old session fail with
    /// [`ClientError::SessionReset`]; the server may keep running them.
    pub fn reset_session(&self) -> String {
        self.inner.registry.reset();
        let hash = self.inner.session.renew();
        info!(session_hash = %hash, "session reset");
        hash
    }

    /// Stop the heartbeat and the event stream.
    pub fn close(&self) {
        self.inner.stop_heartbeat();
        self.inner.registry.shutdown();
    }

    pub fn session_hash(&self) -> String {
        self.inner.session.hash()
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn app_version(&self) -> AppVersion {
        self.inner.config.app_version()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.inner.endpoints.values().map(|e| e.as_ref())
    }

    /// Look up the endpoint a call would use without submitting it.
    pub fn endpoint(&self, call: &Call) -> ClientResult<Arc<EndpointDescriptor>> {
        self.inner
            .select_endpoint(call.api_name.as_deref(), call.fn_index)
    }
}

fn build_http(options: &ClientOptions) -> ClientResult<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .danger_accept_invalid_certs(!options.ssl_verify)
        .build()
        .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {}", e)))
}

fn build_headers(headers: &IndexMap<String, String>) -> ClientResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ClientError::Config(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::Config(format!("Invalid header value for {}: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn login(http: &reqwest::Client, urls: &Urls, credentials: &Credentials) -> ClientResult<()> {
    let response = http
        .post(urls.login()?)
        .form(&[
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
        ])
        .send()
        .await?;
    match response.status() {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(ClientError::Authentication(format!(
            "Could not login to {}. Invalid credentials.",
            urls.src
        ))),
        status => Err(ClientError::Http {
            status: status.as_u16(),
            body: format!("Could not login to {}", urls.src),
        }),
    }
}

async fn fetch_config(
    http: &reqwest::Client,
    urls: &Urls,
    headers: &HeaderMap,
    options: &ClientOptions,
) -> ClientResult<AppConfig> {
    let mut request = http.get(urls.config()?).headers(headers.clone());
    if let Some(secs) = options.request_timeout_secs {
        request = request.timeout(Duration::from_secs(secs));
    }
    let response = request.send().await?;
    match response.status() {
        status if status.is_success() => Ok(response.json().await?),
        StatusCode::UNAUTHORIZED => Err(ClientError::Authentication(format!(
            "Could not load {} as credentials were not provided. Please login.",
            urls.src
        ))),
        StatusCode::TOO_MANY_REQUESTS => Err(ClientError::TooManyRequests),
        status => Err(ClientError::Http {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

async fn fetch_api_info(
    http: &reqwest::Client,
    urls: &Urls,
    headers: &HeaderMap,
    options: &ClientOptions,
) -> ClientResult<Option<ApiInfo>> {
    let mut url = urls.route("info")?;
    url.set_query(Some("serialize=False"));
    let mut request = http.get(url).headers(headers.clone());
    if let Some(secs) = options.request_timeout_secs {
        request = request.timeout(Duration::from_secs(secs));
    }
    let response = request.send().await?;
    if !response.status().is_success() {
        warn!(status = %response.status(), "could not fetch API info, keyword arguments disabled");
        return Ok(None);
    }
    Ok(Some(response.json().await?))
}
