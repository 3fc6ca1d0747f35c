//! Remote app schema: the `/config` document, the `/info` document and the
//! app version.
//!
//! Only the fields the engine reads are modelled; everything else in the
//! documents is ignored by serde.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub api_prefix: Option<String>,
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub enable_queue: Option<bool>,
}

impl AppConfig {
    pub fn component(&self, id: i64) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn app_version(&self) -> AppVersion {
        self.version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Protocol string advertised by the app. Apps that predate the field
    /// use `sse` when queueing is enabled and the legacy request otherwise.
    pub fn protocol_name(&self) -> &str {
        match (&self.protocol, self.enable_queue) {
            (Some(p), _) => p.as_str(),
            (None, Some(false)) => "ws",
            (None, _) => "sse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub id: i64,
    #[serde(rename = "type", default)]
    pub component_type: String,
    #[serde(default)]
    pub skip_api: bool,
    #[serde(default)]
    pub api_info: Option<JsonValue>,
    #[serde(default)]
    pub props: JsonValue,
}

/// `api_name` is a string, `false` (endpoint hidden), or absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiName {
    Name(String),
    Flag(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub api_name: Option<ApiName>,
    #[serde(default)]
    pub inputs: Vec<i64>,
    #[serde(default)]
    pub outputs: Vec<i64>,
    #[serde(default)]
    pub cancels: Vec<i64>,
    #[serde(default = "default_true")]
    pub backend_fn: bool,
    #[serde(default = "default_true")]
    pub show_api: bool,
}

fn default_true() -> bool {
    true
}

impl DependencyConfig {
    pub fn name(&self) -> Option<&str> {
        match &self.api_name {
            Some(ApiName::Name(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// `false` marks an endpoint the app has disabled.
    pub fn is_valid(&self) -> bool {
        !matches!(self.api_name, Some(ApiName::Flag(false)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiInfo {
    #[serde(default)]
    pub named_endpoints: HashMap<String, EndpointInfo>,
    #[serde(default)]
    pub unnamed_endpoints: HashMap<String, EndpointInfo>,
}

impl ApiInfo {
    /// Drop endpoints the app hides from its API page.
    pub fn retain_shown(&mut self) {
        self.named_endpoints.retain(|_, info| info.show_api);
        self.unnamed_endpoints.retain(|_, info| info.show_api);
    }

    /// Named endpoints are keyed `/<name>`, unnamed ones by function index.
    pub fn endpoint(&self, api_name: Option<&str>, fn_index: usize) -> Option<&EndpointInfo> {
        match api_name {
            Some(name) => self.named_endpoints.get(&format!("/{}", name)),
            None => self.unnamed_endpoints.get(&fn_index.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointInfo {
    #[serde(default)]
    pub parameters: Vec<ParameterInfo>,
    #[serde(default)]
    pub returns: Vec<JsonValue>,
    #[serde(default = "default_true")]
    pub show_api: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterInfo {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub parameter_name: Option<String>,
    #[serde(default)]
    pub parameter_has_default: bool,
    #[serde(default)]
    pub parameter_default: Option<JsonValue>,
    #[serde(default)]
    pub component: Option<String>,
}

/// Dotted `major.minor.patch` version. Pre-release suffixes ("4.36.1b2") are
/// ignored for ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl AppVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Newer apps accept `POST cancel` keyed by event id.
    pub fn supports_direct_cancel(&self) -> bool {
        *self > AppVersion::new(4, 29, 0)
    }

    pub fn serves_api_info(&self) -> bool {
        *self > AppVersion::new(3, 36, 1)
    }
}

impl std::str::FromStr for AppVersion {
    type Err = ClientError;

    fn from_str(s: &str) -> ClientResult<Self> {
        let mut parts = s.trim().split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>()
        });
        let mut next = || -> ClientResult<u32> {
            match parts.next() {
                Some(Ok(n)) => Ok(n),
                None => Ok(0),
                Some(Err(_)) => Err(ClientError::Config(format!("Invalid app version: {}", s))),
            }
        };
        Ok(AppVersion::new(next()?, next()?, next()?))
    }
}

impl PartialOrd for AppVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AppVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
