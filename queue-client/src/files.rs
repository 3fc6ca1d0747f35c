//! File references in call arguments and outputs.
//!
//! Inputs: local files tagged with [`handle_file`] are uploaded and replaced
//! by the server path. Outputs: server file objects are downloaded into a
//! content-addressed directory (`<dir>/<sha256>/<name>`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};
use crate::session::Urls;

pub const FILE_DATA_TYPE: &str = "gradio.FileData";

const MAX_FILENAME_BYTES: usize = 200;

/// Tag a local path or URL as a file argument.
pub fn handle_file(path: impl AsRef<Path>) -> JsonValue {
    json!({
        "path": path.as_ref().to_string_lossy(),
        "meta": {"_type": FILE_DATA_TYPE},
    })
}

/// Any object with a string `path`.
pub fn is_file_obj(value: &JsonValue) -> bool {
    value
        .as_object()
        .map(|map| map.get("path").map(JsonValue::is_string).unwrap_or(false))
        .unwrap_or(false)
}

/// A file object explicitly tagged as file data.
pub fn is_file_obj_with_meta(value: &JsonValue) -> bool {
    is_file_obj(value)
        && value
            .get("meta")
            .and_then(|meta| meta.get("_type"))
            .and_then(JsonValue::as_str)
            == Some(FILE_DATA_TYPE)
}

pub fn is_http_url_like(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Keep alphanumerics and `._- `, truncated to 200 bytes on a char boundary.
pub fn strip_invalid_filename_characters(name: &str) -> String {
    let mut out = String::new();
    for c in name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
    {
        if out.len() + c.len_utf8() > MAX_FILENAME_BYTES {
            break;
        }
        out.push(c);
    }
    out
}

/// Check every local file argument against the server's size limit.
pub fn check_file_sizes(data: &[JsonValue], max_file_size: Option<u64>) -> ClientResult<()> {
    let Some(max) = max_file_size else {
        return Ok(());
    };
    let mut paths = Vec::new();
    for value in data {
        collect_local_files(value, &mut paths);
    }
    for path in paths {
        let size = std::fs::metadata(&path)
            .map_err(|e| ClientError::Config(format!("Cannot read file {}: {}", path, e)))?
            .len();
        if size > max {
            return Err(ClientError::FileTooLarge { path, size, max });
        }
    }
    Ok(())
}

fn collect_local_files(value: &JsonValue, out: &mut Vec<String>) {
    if is_file_obj_with_meta(value) {
        if let Some(path) = value.get("path").and_then(JsonValue::as_str) {
            if !is_http_url_like(path) {
                out.push(path.to_string());
            }
        }
        return;
    }
    match value {
        JsonValue::Array(items) => items.iter().for_each(|v| collect_local_files(v, out)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_local_files(v, out)),
        _ => {}
    }
}

/// Uploads and downloads against one app.
#[derive(Debug)]
pub struct FileTransfer {
    http: reqwest::Client,
    urls: Arc<Urls>,
    headers: HeaderMap,
    download_dir: PathBuf,
    max_file_size: Option<u64>,
    /// Remote path to its download. Concurrent callers share one transfer.
    downloads: DashMap<String, Arc<OnceCell<PathBuf>>>,
}

impl FileTransfer {
    pub fn new(
        http: reqwest::Client,
        urls: Arc<Urls>,
        headers: HeaderMap,
        download_dir: PathBuf,
        max_file_size: Option<u64>,
    ) -> Self {
        Self {
            http,
            urls,
            headers,
            download_dir,
            max_file_size,
            downloads: DashMap::new(),
        }
    }

    /// Upload every tagged local file in `value`, replacing it with the
    /// server's file object.
    #[async_recursion]
    pub async fn upload_files(&self, value: JsonValue) -> ClientResult<JsonValue> {
        if is_file_obj_with_meta(&value) {
            return self.upload_one(&value).await;
        }
        match value {
            JsonValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.upload_files(item).await?);
                }
                Ok(JsonValue::Array(out))
            }
            JsonValue::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key, self.upload_files(item).await?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other),
        }
    }

    async fn upload_one(&self, file: &JsonValue) -> ClientResult<JsonValue> {
        let local = file
            .get("path")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let name = Path::new(&local)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let remote = if is_http_url_like(&local) {
            local.clone()
        } else {
            let bytes = tokio::fs::read(&local).await?;
            let size = bytes.len() as u64;
            if let Some(max) = self.max_file_size {
                if size > max {
                    return Err(ClientError::FileTooLarge {
                        path: local,
                        size,
                        max,
                    });
                }
            }
            let part = reqwest::multipart::Part::bytes(bytes).file_name(name.clone());
            let form = reqwest::multipart::Form::new().part("files", part);
            let response = self
                .http
                .post(self.urls.route("upload")?)
                .headers(self.headers.clone())
                .multipart(form)
                .send()
                .await?
                .error_for_status()?;
            let paths: Vec<String> = response.json().await?;
            let remote = paths.into_iter().next().ok_or_else(|| {
                ClientError::Protocol("Upload response contained no file path".to_string())
            })?;
            info!(local = %local, remote = %remote, size, "uploaded file");
            remote
        };

        Ok(json!({
            "path": remote,
            "orig_name": strip_invalid_filename_characters(&name),
            "meta": {"_type": FILE_DATA_TYPE},
        }))
    }

    /// Download every server file object in `value`, replacing it with the
    /// local path. With `require_meta`, only tagged file objects count.
    #[async_recursion]
    pub async fn download_files(&self, value: JsonValue, require_meta: bool) -> ClientResult<JsonValue> {
        let is_file = if require_meta {
            is_file_obj_with_meta(&value)
        } else {
            is_file_obj(&value)
        };
        if is_file {
            let remote = value
                .get("path")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let local = self.download(remote).await?;
            return Ok(JsonValue::String(local.to_string_lossy().to_string()));
        }
        match value {
            JsonValue::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.download_files(item, require_meta).await?);
                }
                Ok(JsonValue::Array(out))
            }
            JsonValue::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key, self.download_files(item, require_meta).await?);
                }
                Ok(JsonValue::Object(out))
            }
            other => Ok(other),
        }
    }

    /// Download one remote file into the content-addressed cache. A remote
    /// path is transferred once; callers arriving while the transfer runs
    /// wait for it. A failed transfer is retried by the next caller.
    pub async fn download(&self, remote: &str) -> ClientResult<PathBuf> {
        let cell = self
            .downloads
            .entry(remote.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        if let Some(local) = cell.get() {
            debug!(remote, "file already downloaded");
            return Ok(local.clone());
        }
        cell.get_or_try_init(|| self.transfer(remote))
            .await
            .map(PathBuf::clone)
    }

    async fn transfer(&self, remote: &str) -> ClientResult<PathBuf> {
        let url = self.urls.file(remote)?;
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "file".to_string());
        let name = strip_invalid_filename_characters(&name);

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let partial = self
            .download_dir
            .join(format!(".partial-{}", uuid::Uuid::new_v4()));

        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?
            .error_for_status()?;
        let mut hasher = Sha256::new();
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let digest = format!("{:x}", hasher.finalize());
        let directory = self.download_dir.join(&digest);
        tokio::fs::create_dir_all(&directory).await?;
        let dest = directory.join(&name);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            tokio::fs::remove_file(&partial).await?;
        } else {
            tokio::fs::rename(&partial, &dest).await?;
        }
        info!(remote, local = %dest.display(), "downloaded file");
        Ok(dest)
    }
}
