//! Session identity and URL layout of one remote app.

use tokio::sync::watch;
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Routes of a remote app. `src` is the app root; `prefixed` is the root of
/// its API routes (the same URL unless the app advertises an `api_prefix`).
#[derive(Debug, Clone, PartialEq)]
pub struct Urls {
    pub src: Url,
    pub prefixed: Url,
}

impl Urls {
    pub fn new(src: &str, api_prefix: Option<&str>) -> ClientResult<Self> {
        let src = parse_root(src)?;
        let prefixed = match api_prefix.map(|p| p.trim_matches('/')) {
            None | Some("") => src.clone(),
            Some(prefix) => src
                .join(&format!("{}/", prefix))
                .map_err(|e| ClientError::Config(format!("Invalid api_prefix {}: {}", prefix, e)))?,
        };
        Ok(Self { src, prefixed })
    }

    /// Resolve an API route relative to the prefixed root.
    pub fn route(&self, route: &str) -> ClientResult<Url> {
        self.prefixed
            .join(route)
            .map_err(|e| ClientError::Config(format!("Invalid route {}: {}", route, e)))
    }

    pub fn config(&self) -> ClientResult<Url> {
        join(&self.src, "config")
    }

    pub fn login(&self) -> ClientResult<Url> {
        join(&self.src, "login")
    }

    pub fn heartbeat(&self, session_hash: &str) -> ClientResult<Url> {
        self.route(&format!("heartbeat/{}", session_hash))
    }

    /// Download URL of a server-side file.
    pub fn file(&self, path: &str) -> ClientResult<Url> {
        let raw = format!("{}file={}", self.prefixed, path);
        Url::parse(&raw).map_err(|e| ClientError::Config(format!("Invalid file URL {}: {}", raw, e)))
    }
}

fn parse_root(src: &str) -> ClientResult<Url> {
    let mut url =
        Url::parse(src).map_err(|e| ClientError::Config(format!("Invalid src URL {}: {}", src, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, route: &str) -> ClientResult<Url> {
    base.join(route)
        .map_err(|e| ClientError::Config(format!("Invalid route {}: {}", route, e)))
}

/// Current session hash. Observers are notified when it changes.
#[derive(Debug)]
pub struct Session {
    tx: watch::Sender<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(new_hash());
        Self { tx }
    }

    pub fn hash(&self) -> String {
        self.tx.borrow().clone()
    }

    /// Issue a new session hash and return it.
    pub fn renew(&self) -> String {
        let hash = new_hash();
        self.tx.send_replace(hash.clone());
        hash
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}

fn new_hash() -> String {
    uuid::Uuid::new_v4().to_string()
}
