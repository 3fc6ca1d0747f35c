//! Client options.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

pub const ENV_TEMP_DIR: &str = "QUEUE_CLIENT_TEMP_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Concurrent jobs. The event stream and the heartbeat run outside this
    /// limit.
    pub max_workers: usize,
    /// Extra headers sent with every request.
    pub headers: IndexMap<String, String>,
    pub download_dir: PathBuf,
    /// Download file outputs into `download_dir`; when false file objects are
    /// returned untouched.
    pub download_files: bool,
    /// Hide state and layout components from inputs and outputs.
    pub skip_components: bool,
    pub ssl_verify: bool,
    pub auth: Option<Credentials>,
    pub heartbeat_read_timeout_secs: u64,
    pub request_timeout_secs: Option<u64>,
    pub iteration_backoff_min_ms: u64,
    pub iteration_backoff_max_ms: u64,
    pub update_poll_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_workers: 40,
            headers: IndexMap::new(),
            download_dir: default_download_dir(),
            download_files: true,
            skip_components: true,
            ssl_verify: true,
            auth: None,
            heartbeat_read_timeout_secs: 20,
            request_timeout_secs: None,
            iteration_backoff_min_ms: 1,
            iteration_backoff_max_ms: 50,
            update_poll_ms: 500,
        }
    }
}

fn default_download_dir() -> PathBuf {
    std::env::var(ENV_TEMP_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("queue-client"))
}

impl ClientOptions {
    /// Load options from a TOML file; missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let options: ClientOptions = toml::from_str(&content).map_err(|e| {
            ClientError::Config(format!("Invalid options file {}: {}", path.display(), e))
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Defaults overlaid with `QUEUE_CLIENT_*` environment variables.
    pub fn from_env() -> ClientResult<Self> {
        let mut options = ClientOptions::default();

        if let Ok(workers) = std::env::var("QUEUE_CLIENT_MAX_WORKERS") {
            options.max_workers = parse_env("QUEUE_CLIENT_MAX_WORKERS", &workers)?;
        }
        if let Ok(flag) = std::env::var("QUEUE_CLIENT_DOWNLOAD_FILES") {
            options.download_files = parse_env("QUEUE_CLIENT_DOWNLOAD_FILES", &flag)?;
        }
        if let Ok(flag) = std::env::var("QUEUE_CLIENT_SKIP_COMPONENTS") {
            options.skip_components = parse_env("QUEUE_CLIENT_SKIP_COMPONENTS", &flag)?;
        }
        if let Ok(flag) = std::env::var("QUEUE_CLIENT_SSL_VERIFY") {
            options.ssl_verify = parse_env("QUEUE_CLIENT_SSL_VERIFY", &flag)?;
        }
        if let Ok(secs) = std::env::var("QUEUE_CLIENT_HEARTBEAT_TIMEOUT_SECS") {
            options.heartbeat_read_timeout_secs =
                parse_env("QUEUE_CLIENT_HEARTBEAT_TIMEOUT_SECS", &secs)?;
        }
        if let Ok(secs) = std::env::var("QUEUE_CLIENT_REQUEST_TIMEOUT_SECS") {
            options.request_timeout_secs =
                Some(parse_env("QUEUE_CLIENT_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        if let (Ok(username), Ok(password)) = (
            std::env::var("QUEUE_CLIENT_USERNAME"),
            std::env::var("QUEUE_CLIENT_PASSWORD"),
        ) {
            options.auth = Some(Credentials { username, password });
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.max_workers == 0 {
            return Err(ClientError::Config("max_workers must be at least 1".into()));
        }
        if self.iteration_backoff_min_ms == 0
            || self.iteration_backoff_min_ms > self.iteration_backoff_max_ms
        {
            return Err(ClientError::Config(
                "iteration backoff must satisfy 0 < min <= max".into(),
            ));
        }
        Ok(())
    }

    /// Create the download directory if needed.
    pub fn prepare_download_dir(&self) -> ClientResult<()> {
        if self.download_dir.exists() && !self.download_dir.is_dir() {
            return Err(ClientError::Config(format!(
                "Download directory {} is not a directory",
                self.download_dir.display()
            )));
        }
        std::fs::create_dir_all(&self.download_dir)?;
        Ok(())
    }

    pub fn heartbeat_read_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_read_timeout_secs)
    }

    pub fn update_poll(&self) -> Duration {
        Duration::from_millis(self.update_poll_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> ClientResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ClientError::Config(format!("Invalid value for {}: {}", name, value)))
}
